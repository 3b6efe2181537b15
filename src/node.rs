//! # Node — Worker Client State Machine
//!
//! Drives a worker process through its lifetime against the coordinator:
//!
//! | State | Action | Next on success | Next on failure |
//! |---|---|---|---|
//! | INIT | no-op | PARSE_ARGS | — |
//! | PARSE_ARGS | validate host/port/threads | START_CALLBACK | ERROR |
//! | START_CALLBACK | bind callback listener, start pool | REGISTER_WITH_SERVER | ERROR |
//! | REGISTER_WITH_SERVER | dial coordinator, send CLIENT_REGISTER, close | POLL | ERROR |
//! | POLL | wait ≤100 ms for the reverse connection | ACCEPT_BACK / POLL | ERROR |
//! | ACCEPT_BACK | read SERVER_HELLO (5 s), reply CLIENT_HELLO_ACK | READ_READY | ERROR |
//! | READ_READY | non-blocking read of one frame | dispatch by kind | END on peer close |
//! | RUN_ASSIGN | run the slice, stream checkpoints, send WORK_RESULT | READ_READY / END | ERROR |
//! | END | close sockets, stop listener | exit | — |
//! | ERROR | log, set non-zero exit code | END | — |
//!
//! ## Out-of-Band Stop
//!
//! While workers are busy a control listener thread watches the session for
//! a STOP broadcast, sharing the receive buffer with the main reader through
//! [`Connection`]'s mutex. On STOP it raises both the external stop flag and
//! the job's stop flag. After the slice drains, one final non-blocking drain
//! catches a STOP that landed between the last iteration and the result
//! send; if one did, no WORK_RESULT is emitted and the session ends with
//! exit code 0.
//!
//! A transport failure mid-assignment (peer close, socket error) also
//! unblocks the workers, but through a separate flag: it routes the FSM to
//! ERROR and a non-zero exit, never the clean STOP path.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{debug, error, info, warn};

use crate::pool::{SliceObserver, WorkerPool};
use crate::protocol::{
    Checkpoint, ClientHelloAck, ClientRegister, FrameBuffer, Message, WorkResult,
};

/// Deadline for the coordinator's SERVER_HELLO on the reverse connection.
pub const HELLO_TIMEOUT: Duration = Duration::from_millis(5000);

/// One iteration of waiting for the reverse connection.
pub const CALLBACK_POLL: Duration = Duration::from_millis(100);

/// Idle sleep between non-blocking session reads.
const READ_IDLE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub server_host: String,
    pub server_port: u16,
    pub threads: usize,
    pub node_id: String,
}

impl NodeConfig {
    /// Node identity is `c-<machine-name>`, falling back to `c-worker` when
    /// the machine name cannot be determined.
    pub fn new(server_host: String, server_port: u16, threads: usize) -> NodeConfig {
        let name = crate::hostname().unwrap_or_else(|| "worker".to_string());
        NodeConfig {
            server_host,
            server_port,
            threads,
            node_id: format!("c-{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Init,
    ParseArgs,
    StartCallback,
    RegisterWithServer,
    Poll,
    AcceptBack,
    ReadReady,
    RunAssign,
    End,
    Error,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::Init => "INIT",
            NodeState::ParseArgs => "PARSE_ARGS",
            NodeState::StartCallback => "START_CALLBACK",
            NodeState::RegisterWithServer => "REGISTER_WITH_SERVER",
            NodeState::Poll => "POLL",
            NodeState::AcceptBack => "ACCEPT_BACK",
            NodeState::ReadReady => "READ_READY",
            NodeState::RunAssign => "RUN_ASSIGN",
            NodeState::End => "END",
            NodeState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Run the worker node to completion. Returns the process exit code:
/// 0 for normal termination (including STOP), 1 for usage, handshake, or
/// session errors.
pub fn run(config: &NodeConfig) -> i32 {
    let mut session = Session::new(config.clone());
    let mut state = NodeState::Init;
    let mut last_logged = None;
    loop {
        if last_logged != Some(state) {
            debug!(state = %state, "fsm transition");
            last_logged = Some(state);
        }
        state = match state {
            NodeState::Init => NodeState::ParseArgs,
            NodeState::ParseArgs => match session.validate() {
                Ok(()) => NodeState::StartCallback,
                Err(e) => session.fail("argument validation", e),
            },
            NodeState::StartCallback => match session.start_callback() {
                Ok(()) => NodeState::RegisterWithServer,
                Err(e) => session.fail("callback listener", e),
            },
            NodeState::RegisterWithServer => match session.register() {
                Ok(()) => NodeState::Poll,
                Err(e) => session.fail("registration", e),
            },
            NodeState::Poll => match session.poll_callback() {
                Ok(true) => NodeState::AcceptBack,
                Ok(false) => NodeState::Poll,
                Err(e) => session.fail("callback poll", e),
            },
            NodeState::AcceptBack => match session.accept_back() {
                Ok(()) => NodeState::ReadReady,
                Err(e) => session.fail("reverse handshake", e),
            },
            NodeState::ReadReady => match session.read_ready() {
                Ok(ReadOutcome::Assign(assign)) => {
                    session.pending_assign = Some(assign);
                    NodeState::RunAssign
                }
                Ok(ReadOutcome::Stop(reason)) => {
                    info!(reason = %reason, "stop broadcast received");
                    NodeState::End
                }
                Ok(ReadOutcome::PeerClosed) => {
                    info!("coordinator closed the session");
                    NodeState::End
                }
                Ok(ReadOutcome::Idle) => NodeState::ReadReady,
                Err(e) => session.fail("session read", e),
            },
            NodeState::RunAssign => match session.pending_assign.take() {
                Some(assign) => match session.run_assignment(assign) {
                    Ok(AssignOutcome::Completed) => NodeState::ReadReady,
                    Ok(AssignOutcome::Stopped) => NodeState::End,
                    Err(e) => session.fail("assignment", e),
                },
                None => NodeState::ReadReady,
            },
            NodeState::Error => {
                if session.exit_code == 0 {
                    session.exit_code = 1;
                }
                NodeState::End
            }
            NodeState::End => {
                session.close();
                return session.exit_code;
            }
        };
    }
}

enum ReadOutcome {
    Assign(crate::protocol::AssignWork),
    Stop(String),
    PeerClosed,
    Idle,
}

enum AssignOutcome {
    Completed,
    Stopped,
}

struct Session {
    config: NodeConfig,
    listener: Option<TcpListener>,
    accepted: Option<TcpStream>,
    conn: Option<Arc<Connection>>,
    pool: Option<Arc<WorkerPool>>,
    pending_assign: Option<crate::protocol::AssignWork>,
    stop_requested: Arc<AtomicBool>,
    /// Raised by the control listener on peer close or socket error while
    /// workers are busy. Distinct from `stop_requested`: a STOP ends the
    /// session cleanly, a broken transport is an error.
    transport_failed: Arc<AtomicBool>,
    exit_code: i32,
}

impl Session {
    fn new(config: NodeConfig) -> Session {
        Session {
            config,
            listener: None,
            accepted: None,
            conn: None,
            pool: None,
            pending_assign: None,
            stop_requested: Arc::new(AtomicBool::new(false)),
            transport_failed: Arc::new(AtomicBool::new(false)),
            exit_code: 0,
        }
    }

    fn fail(&mut self, phase: &str, err: anyhow::Error) -> NodeState {
        error!(phase, error = %format!("{err:#}"), "node error");
        self.exit_code = 1;
        NodeState::Error
    }

    fn validate(&mut self) -> Result<()> {
        anyhow::ensure!(
            !self.config.server_host.is_empty(),
            "server_host must not be empty"
        );
        anyhow::ensure!(
            self.config.server_port >= 1,
            "server_port must be in 1..=65535"
        );
        anyhow::ensure!(
            self.config.threads >= 1,
            "threads must be a positive integer"
        );
        Ok(())
    }

    fn start_callback(&mut self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", 0)).context("binding callback listener")?;
        listener.set_nonblocking(true)?;
        info!(addr = %listener.local_addr()?, "callback listener started");
        self.listener = Some(listener);
        self.pool = Some(Arc::new(WorkerPool::new(self.config.threads)));
        Ok(())
    }

    fn register(&mut self) -> Result<()> {
        let listener = self.listener.as_ref().context("callback listener not started")?;
        let listen_port = listener.local_addr()?.port();
        let listen_host =
            discover_listen_host(&self.config.server_host, self.config.server_port);

        let mut stream =
            TcpStream::connect((self.config.server_host.as_str(), self.config.server_port))
                .context("dialing coordinator")?;
        let message = Message::ClientRegister(ClientRegister {
            node_id: self.config.node_id.clone(),
            listen_host: listen_host.clone(),
            listen_port,
            threads: self.config.threads,
        });
        stream.write_all(message.to_line()?.as_bytes())?;
        stream.flush()?;
        // The forward connection is one-shot: register, then close.
        drop(stream);
        info!(node_id = %self.config.node_id, listen_host = %listen_host, listen_port, "registered with coordinator");
        Ok(())
    }

    fn poll_callback(&mut self) -> Result<bool> {
        let listener = self.listener.as_ref().context("callback listener not started")?;
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "reverse connection accepted");
                self.accepted = Some(stream);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(CALLBACK_POLL);
                Ok(false)
            }
            Err(e) => Err(e).context("accepting reverse connection"),
        }
    }

    fn accept_back(&mut self) -> Result<()> {
        let stream = self.accepted.take().context("no pending reverse connection")?;
        let conn = Arc::new(Connection::new(stream)?);

        let line = conn
            .read_line_deadline(HELLO_TIMEOUT)?
            .context("no SERVER_HELLO within the handshake deadline")?;
        match Message::decode(&line) {
            Ok(Message::ServerHello(hello)) => {
                info!(server_time = %hello.server_time, node_id = %hello.node_id, "server hello");
            }
            Ok(other) => anyhow::bail!("expected SERVER_HELLO, got {}", other.kind()),
            Err(e) => return Err(e).context("decoding SERVER_HELLO"),
        }

        conn.send(&Message::ClientHelloAck(ClientHelloAck {
            node_id: self.config.node_id.clone(),
            ok: true,
        }))?;
        self.conn = Some(conn);
        Ok(())
    }

    fn read_ready(&mut self) -> Result<ReadOutcome> {
        let conn = Arc::clone(self.conn.as_ref().context("no session connection")?);
        loop {
            match conn.poll()? {
                Incoming::Closed => return Ok(ReadOutcome::PeerClosed),
                Incoming::Idle => {
                    thread::sleep(READ_IDLE);
                    return Ok(ReadOutcome::Idle);
                }
                Incoming::Frame(line) => match Message::decode(&line) {
                    Ok(Message::AssignWork(assign)) => return Ok(ReadOutcome::Assign(assign)),
                    Ok(Message::Stop(stop)) => {
                        self.stop_requested.store(true, Ordering::Release);
                        return Ok(ReadOutcome::Stop(stop.reason));
                    }
                    Ok(other) => info!(kind = other.kind(), "ignoring unexpected message"),
                    Err(e) => info!(error = %e, "ignoring malformed frame"),
                },
            }
        }
    }

    fn run_assignment(&mut self, assign: crate::protocol::AssignWork) -> Result<AssignOutcome> {
        let conn = Arc::clone(self.conn.as_ref().context("no session connection")?);
        let pool = Arc::clone(self.pool.as_ref().context("worker pool not started")?);
        info!(
            job_id = %assign.job_id,
            start_index = assign.start_index,
            count = assign.count,
            checkpoint_every = assign.checkpoint_every,
            "assignment received"
        );

        // Watch for an out-of-band STOP while workers are busy.
        let finished = Arc::new(AtomicBool::new(false));
        let control = {
            let conn = Arc::clone(&conn);
            let pool = Arc::clone(&pool);
            let stop_requested = Arc::clone(&self.stop_requested);
            let transport_failed = Arc::clone(&self.transport_failed);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                control_listener(conn, pool, stop_requested, transport_failed, finished)
            })
        };

        let observer = Arc::new(CheckpointSender {
            conn: Arc::clone(&conn),
            job_id: assign.job_id.clone(),
            start_index: assign.start_index,
            stop_requested: Arc::clone(&self.stop_requested),
        });
        let outcome = pool.run_slice(
            &assign.stored_hash,
            assign.start_index,
            assign.count,
            assign.checkpoint_every,
            observer,
        );

        finished.store(true, Ordering::Release);
        let _ = control.join();
        let result = outcome.context("running slice")?;

        // A broken session is an error, not a clean stop: the supervisor
        // must see a non-zero exit, unlike a deliberate STOP broadcast.
        if self.transport_failed.load(Ordering::Acquire) {
            anyhow::bail!("session transport failed during assignment");
        }

        // A STOP may have landed between the last iteration and now.
        self.drain_for_stop(&conn);

        if self.stop_requested.load(Ordering::Acquire) {
            info!(job_id = %assign.job_id, "stop observed; suppressing WORK_RESULT");
            return Ok(AssignOutcome::Stopped);
        }

        conn.send(&Message::WorkResult(WorkResult {
            job_id: assign.job_id.clone(),
            found: result.found,
            password: result.password.clone(),
            tried: result.tried,
            duration_ms: result.duration_ms,
        }))?;
        info!(
            job_id = %assign.job_id,
            found = result.found,
            password = result.password.as_deref().unwrap_or("-"),
            tried = result.tried,
            duration_ms = result.duration_ms,
            "work result sent"
        );
        Ok(AssignOutcome::Completed)
    }

    /// One final non-blocking drain of buffered frames, looking for a STOP.
    fn drain_for_stop(&self, conn: &Connection) {
        loop {
            match conn.poll() {
                Ok(Incoming::Frame(line)) => match Message::decode(&line) {
                    Ok(Message::Stop(stop)) => {
                        info!(reason = %stop.reason, "late stop broadcast");
                        self.stop_requested.store(true, Ordering::Release);
                    }
                    Ok(other) => info!(kind = other.kind(), "ignoring unexpected message"),
                    Err(e) => info!(error = %e, "ignoring malformed frame"),
                },
                Ok(Incoming::Idle) | Ok(Incoming::Closed) | Err(_) => return,
            }
        }
    }

    fn close(&mut self) {
        // Dropping the handles closes the sockets and stops the listener.
        self.conn = None;
        self.accepted = None;
        self.listener = None;
        debug!("sockets closed");
    }
}

/// Streams pool progress to the coordinator as CHECKPOINT frames and
/// reflects the session-level stop flag into the pool.
struct CheckpointSender {
    conn: Arc<Connection>,
    job_id: String,
    start_index: i64,
    stop_requested: Arc<AtomicBool>,
}

impl SliceObserver for CheckpointSender {
    fn on_worker_start(&self, slot: usize, thread: thread::ThreadId) {
        debug!(slot, ?thread, "worker active");
    }

    fn on_checkpoint(&self, tried: u64, per_worker: &[u64]) {
        debug!(tried, ?per_worker, "checkpoint");
        let message = Message::Checkpoint(Checkpoint {
            job_id: self.job_id.clone(),
            tried,
            last_index: self.start_index + tried as i64 - 1,
            ts: Local::now().fixed_offset(),
        });
        if let Err(e) = self.conn.send(&message) {
            warn!(error = %e, "checkpoint send failed");
        }
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }
}

/// Control listener body for RUN_ASSIGN: shares the session's receive
/// buffer with the main reader (via the [`Connection`] mutex) and raises
/// both stop flags on a STOP broadcast. A transport failure instead raises
/// `transport_failed` (and still stops the pool so workers unblock
/// gracefully); the assignment then finishes as an error, not a clean stop.
fn control_listener(
    conn: Arc<Connection>,
    pool: Arc<WorkerPool>,
    stop_requested: Arc<AtomicBool>,
    transport_failed: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
) {
    while !finished.load(Ordering::Acquire) {
        match conn.poll() {
            Ok(Incoming::Frame(line)) => match Message::decode(&line) {
                Ok(Message::Stop(stop)) => {
                    info!(reason = %stop.reason, "stop broadcast received mid-assignment");
                    stop_requested.store(true, Ordering::Release);
                    pool.request_stop();
                    return;
                }
                Ok(other) => info!(kind = other.kind(), "ignoring message during assignment"),
                Err(e) => info!(error = %e, "ignoring malformed frame"),
            },
            Ok(Incoming::Idle) => thread::sleep(READ_IDLE),
            Ok(Incoming::Closed) => {
                warn!("coordinator closed the session mid-assignment");
                transport_failed.store(true, Ordering::Release);
                pool.request_stop();
                return;
            }
            Err(e) => {
                warn!(error = %e, "control listener transport error");
                transport_failed.store(true, Ordering::Release);
                pool.request_stop();
                return;
            }
        }
    }
}

/// The listen address advertised to the coordinator: open a UDP socket
/// toward it and read the local endpoint, falling back to loopback.
fn discover_listen_host(server_host: &str, server_port: u16) -> String {
    let probe = || -> io::Result<String> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect((server_host, server_port))?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    probe().unwrap_or_else(|_| "127.0.0.1".to_string())
}

// ── Connection ──────────────────────────────────────────────────────

enum Incoming {
    Frame(String),
    Idle,
    Closed,
}

/// One session socket, shared by the main reader, the control listener,
/// and the checkpoint sender. Reads funnel through a mutex-guarded
/// [`FrameBuffer`]; writes are serialized for the duration of a line.
struct Connection {
    stream: TcpStream,
    rx: Mutex<FrameBuffer>,
    tx: Mutex<()>,
}

impl Connection {
    fn new(stream: TcpStream) -> io::Result<Connection> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        Ok(Connection {
            stream,
            rx: Mutex::new(FrameBuffer::new()),
            tx: Mutex::new(()),
        })
    }

    /// Non-blocking: yield one buffered frame, or read what the socket has
    /// and try again. Buffered frames always drain before the next read.
    fn poll(&self) -> io::Result<Incoming> {
        let mut rx = self.rx.lock().unwrap();
        if let Some(line) = rx.next_line() {
            debug!(len = line.len(), "frame received");
            return Ok(Incoming::Frame(line));
        }
        let mut chunk = [0u8; 4096];
        match (&self.stream).read(&mut chunk) {
            Ok(0) => Ok(Incoming::Closed),
            Ok(n) => {
                rx.push(&chunk[..n]);
                match rx.next_line() {
                    Some(line) => {
                        debug!(len = line.len(), "frame received");
                        Ok(Incoming::Frame(line))
                    }
                    None => Ok(Incoming::Idle),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Incoming::Idle),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(Incoming::Idle),
            Err(e) => Err(e),
        }
    }

    /// Block (with small sleeps) until a frame arrives or the deadline
    /// passes. `Ok(None)` means the deadline expired.
    fn read_line_deadline(&self, deadline: Duration) -> io::Result<Option<String>> {
        let start = Instant::now();
        loop {
            match self.poll()? {
                Incoming::Frame(line) => return Ok(Some(line)),
                Incoming::Closed => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed during handshake",
                    ))
                }
                Incoming::Idle => {
                    if start.elapsed() >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(READ_IDLE);
                }
            }
        }
    }

    fn send(&self, message: &Message) -> Result<()> {
        let line = message.to_line()?;
        let _guard = self.tx.lock().unwrap();
        let mut remaining = line.as_bytes();
        while !remaining.is_empty() {
            match (&self.stream).write(remaining) {
                Ok(0) => anyhow::bail!("connection closed while sending {}", message.kind()),
                Ok(n) => remaining = &remaining[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("sending {}", message.kind()));
                }
            }
        }
        debug!(kind = message.kind(), "sent");
        Ok(())
    }
}
