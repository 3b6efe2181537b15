//! # Pool — Persistent Parallel Search Workers
//!
//! A fixed set of background threads that jointly process one assignment (a
//! contiguous candidate-index range) at a time. The pool outlives
//! assignments: workers park on a condvar between jobs and wake when a new
//! slice is published under a bumped job version.
//!
//! ## Work Distribution
//!
//! Workers share a single fetch-add cursor over relative indices
//! `[0, count)`, so every index is handed out exactly once regardless of how
//! thread speeds interleave. Worker slot identity is fixed for the life of
//! the pool and used only for per-slot counters.
//!
//! ## Ordered-Commit Progress
//!
//! Completions arrive out of order, but checkpoints must not: a checkpoint
//! at `n` promises that the *first* `n` indices of the slice have all been
//! verified, which is what lets the coordinator subdivide or reassign a
//! range at any reported boundary. Each worker release-stores a per-index
//! done flag; a single progress mutex advances the contiguous done-prefix
//! with acquire loads and emits every crossed `checkpoint_every` milestone
//! in order, plus the terminal `count` exactly once.
//!
//! ## Cancellation
//!
//! Cooperative only. The job stop flag (set on match, external stop, or a
//! fatal verify error) and the observer's `is_stop_requested` are polled at
//! the top of every iteration; an in-flight verification always completes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

use crate::candidates::{index_to_candidate, ALPHABET};
use crate::crypt::CryptError;
use crate::verifier::{Verifier, Verify};

/// Largest admissible `count`: the per-index done map must stay addressable.
pub const MAX_SLICE: i64 = i32::MAX as i64;

#[derive(Debug, Error)]
pub enum SliceError {
    /// Precondition failure; the slice never starts.
    #[error("invalid slice: {0}")]
    InvalidSlice(String),
    /// No crypt entry point on this system; surfaced by the first verify.
    #[error("crypt binding unavailable: {0}")]
    CryptUnavailable(#[from] CryptError),
}

/// Outcome of one fully drained slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceResult {
    pub found: bool,
    pub password: Option<String>,
    pub tried: u64,
    pub duration_ms: u64,
}

/// Caller-side hooks for a running slice.
///
/// `on_checkpoint` fires under the progress mutex, so invocations are
/// totally ordered and `tried` values strictly increase within one job.
pub trait SliceObserver: Send + Sync {
    /// Each worker announces itself once per job, before its first fetch.
    fn on_worker_start(&self, _slot: usize, _thread: thread::ThreadId) {}
    /// The first `tried` indices of the slice have all been verified.
    fn on_checkpoint(&self, _tried: u64, _per_worker: &[u64]) {}
    /// External cancellation, polled every iteration.
    fn is_stop_requested(&self) -> bool {
        false
    }
}

/// Observer for callers that only want the final [`SliceResult`].
impl SliceObserver for () {}

struct Cursor {
    done_prefix: u64,
    last_emitted: u64,
}

/// All state for one published assignment. Created on publication,
/// dropped once the final result is reported.
struct Job {
    verifier: Arc<dyn Verify>,
    observer: Arc<dyn SliceObserver>,
    start_index: u64,
    count: u64,
    checkpoint_every: u64,
    next_rel: AtomicU64,
    done_map: Vec<AtomicBool>,
    per_worker_tried: Vec<AtomicU64>,
    total_tried: AtomicU64,
    stop: AtomicBool,
    password: OnceLock<String>,
    fatal: Mutex<Option<CryptError>>,
    cursor: Mutex<Cursor>,
    latch: Latch,
}

impl Job {
    /// Advance the contiguous done-prefix and emit every milestone it
    /// crossed. Serialized by the cursor mutex; `done_map` entries are
    /// acquire-loaded against the workers' release stores.
    fn update_progress(&self) {
        let mut cursor = self.cursor.lock().unwrap();
        let mut prefix = cursor.done_prefix;
        while prefix < self.count && self.done_map[prefix as usize].load(Ordering::Acquire) {
            prefix += 1;
        }
        if prefix == cursor.done_prefix {
            return;
        }
        cursor.done_prefix = prefix;

        let every = self.checkpoint_every;
        let mut milestone = (cursor.last_emitted / every + 1) * every;
        while milestone <= prefix {
            self.emit(milestone, &mut cursor);
            milestone += every;
        }
        // Terminal checkpoint: the whole slice is done, even when `count`
        // is not a multiple of the period.
        if prefix == self.count && cursor.last_emitted < self.count {
            self.emit(self.count, &mut cursor);
        }
    }

    fn emit(&self, milestone: u64, cursor: &mut Cursor) {
        let snapshot: Vec<u64> = self
            .per_worker_tried
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .collect();
        self.observer.on_checkpoint(milestone, &snapshot);
        cursor.last_emitted = milestone;
    }

    fn record_fatal(&self, err: CryptError) {
        let mut fatal = self.fatal.lock().unwrap();
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }
}

/// Countdown latch: every worker arrives exactly once per job (a drop guard
/// covers panicking verify calls), and the publisher waits for all of them.
struct Latch {
    remaining: Mutex<usize>,
    all_done: Condvar,
}

impl Latch {
    fn new(n: usize) -> Latch {
        Latch {
            remaining: Mutex::new(n),
            all_done: Condvar::new(),
        }
    }

    fn arrive(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.all_done.notify_all();
        }
    }

    fn wait(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining > 0 {
            remaining = self.all_done.wait(remaining).unwrap();
        }
    }
}

struct ArrivalGuard<'a>(&'a Latch);

impl Drop for ArrivalGuard<'_> {
    fn drop(&mut self) {
        self.0.arrive();
    }
}

struct PoolState {
    job: Option<Arc<Job>>,
    version: u64,
    shutdown: bool,
}

struct Shared {
    state: Mutex<PoolState>,
    wake: Condvar,
}

/// Persistent pool of verification threads.
pub struct WorkerPool {
    shared: Arc<Shared>,
    threads: usize,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `threads.max(1)` workers. They park immediately and survive
    /// across assignments until the pool is dropped.
    pub fn new(threads: usize) -> WorkerPool {
        let threads = threads.max(1);
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState {
                job: None,
                version: 0,
                shutdown: false,
            }),
            wake: Condvar::new(),
        });
        let handles = (0..threads)
            .map(|slot| {
                let shared = Arc::clone(&shared);
                thread::spawn(move || worker_loop(shared, slot))
            })
            .collect();
        WorkerPool {
            shared,
            threads,
            handles,
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Run one slice to completion (or stop) and block until every worker
    /// has drained. The verifier is chosen from the stored hash prefix.
    pub fn run_slice(
        &self,
        stored_hash: &str,
        start_index: i64,
        count: i64,
        checkpoint_every: i32,
        observer: Arc<dyn SliceObserver>,
    ) -> Result<SliceResult, SliceError> {
        self.run_slice_with(
            Arc::new(Verifier::for_hash(stored_hash)),
            start_index,
            count,
            checkpoint_every,
            observer,
        )
    }

    /// Same as [`run_slice`](WorkerPool::run_slice) with an explicit
    /// verification strategy — the seam tests drive synthetic verifiers
    /// through.
    pub fn run_slice_with(
        &self,
        verifier: Arc<dyn Verify>,
        start_index: i64,
        count: i64,
        checkpoint_every: i32,
        observer: Arc<dyn SliceObserver>,
    ) -> Result<SliceResult, SliceError> {
        if start_index < 0 {
            return Err(SliceError::InvalidSlice(format!(
                "start_index {start_index} is negative"
            )));
        }
        if count < 1 || count > MAX_SLICE {
            return Err(SliceError::InvalidSlice(format!(
                "count {count} outside 1..={MAX_SLICE}"
            )));
        }
        if checkpoint_every < 1 {
            return Err(SliceError::InvalidSlice(format!(
                "checkpoint_every {checkpoint_every} must be >= 1"
            )));
        }
        let start = start_index as u64;
        let count = count as u64;
        let last = start.checked_add(count - 1).ok_or_else(|| {
            SliceError::InvalidSlice(format!("slice [{start}, +{count}) overflows"))
        })?;
        index_to_candidate(last, ALPHABET.as_bytes())
            .map_err(|e| SliceError::InvalidSlice(format!("slice end {last}: {e}")))?;

        let job = Arc::new(Job {
            verifier,
            observer,
            start_index: start,
            count,
            checkpoint_every: checkpoint_every as u64,
            next_rel: AtomicU64::new(0),
            done_map: (0..count).map(|_| AtomicBool::new(false)).collect(),
            per_worker_tried: (0..self.threads).map(|_| AtomicU64::new(0)).collect(),
            total_tried: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            password: OnceLock::new(),
            fatal: Mutex::new(None),
            cursor: Mutex::new(Cursor {
                done_prefix: 0,
                last_emitted: 0,
            }),
            latch: Latch::new(self.threads),
        });

        let started = Instant::now();
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.job.is_some() {
                return Err(SliceError::InvalidSlice(
                    "an assignment is already active".to_string(),
                ));
            }
            state.job = Some(Arc::clone(&job));
            state.version = state.version.wrapping_add(1);
            self.shared.wake.notify_all();
        }

        job.latch.wait();
        let duration_ms = started.elapsed().as_millis() as u64;
        self.shared.state.lock().unwrap().job = None;

        if let Some(err) = job.fatal.lock().unwrap().take() {
            return Err(SliceError::CryptUnavailable(err));
        }
        let password = job.password.get().cloned();
        Ok(SliceResult {
            found: password.is_some(),
            password,
            tried: job.total_tried.load(Ordering::Relaxed),
            duration_ms,
        })
    }

    /// Set the active job's stop flag, if one is running. Used by the node's
    /// control listener alongside the external stop flag when a STOP
    /// broadcast lands mid-assignment.
    pub fn request_stop(&self) {
        if let Some(job) = self.shared.state.lock().unwrap().job.as_ref() {
            job.stop.store(true, Ordering::Release);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.wake.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, slot: usize) {
    let mut seen_version = 0u64;
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown {
                    return;
                }
                if state.version != seen_version {
                    if let Some(job) = state.job.clone() {
                        seen_version = state.version;
                        break job;
                    }
                }
                state = shared.wake.wait(state).unwrap();
            }
        };
        let _arrival = ArrivalGuard(&job.latch);
        job.observer.on_worker_start(slot, thread::current().id());
        run_job(&job, slot);
    }
}

fn run_job(job: &Job, slot: usize) {
    let alphabet = ALPHABET.as_bytes();
    loop {
        if job.stop.load(Ordering::Acquire) || job.observer.is_stop_requested() {
            break;
        }
        let rel = job.next_rel.fetch_add(1, Ordering::Relaxed);
        if rel >= job.count {
            break;
        }

        let mut matched: Option<String> = None;
        match index_to_candidate(job.start_index + rel, alphabet) {
            Ok(candidate) => match job.verifier.verify(&candidate) {
                Ok(true) => matched = Some(candidate),
                Ok(false) => {}
                Err(err) => {
                    // No crypt binding: the whole slice fails, but the pool
                    // itself stays usable for later assignments.
                    job.record_fatal(err);
                    job.stop.store(true, Ordering::Release);
                    break;
                }
            },
            Err(err) => {
                // Tried, not a match — the index still commits so the done
                // prefix keeps advancing.
                warn!(slot, index = job.start_index + rel, error = %err,
                      "candidate decode failed");
            }
        }

        job.per_worker_tried[slot].fetch_add(1, Ordering::Relaxed);
        job.total_tried.fetch_add(1, Ordering::Relaxed);
        job.done_map[rel as usize].store(true, Ordering::Release);
        job.update_progress();

        if let Some(candidate) = matched {
            // First writer wins; later matches in the same slice lose the
            // race and simply observe the stop flag.
            let _ = job.password.set(candidate);
            job.stop.store(true, Ordering::Release);
            break;
        }
    }
    debug!(
        slot,
        tried = job.per_worker_tried[slot].load(Ordering::Relaxed),
        "worker drained"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    use crate::candidates::candidate_to_index;

    /// Matches exactly one candidate string, recording every candidate it
    /// was asked about. Stands in for the crypt-backed verifier.
    struct TargetVerifier {
        target: Option<String>,
        calls: AtomicU64,
    }

    impl TargetVerifier {
        fn hit(target: &str) -> Arc<TargetVerifier> {
            Arc::new(TargetVerifier {
                target: Some(target.to_string()),
                calls: AtomicU64::new(0),
            })
        }

        fn miss() -> Arc<TargetVerifier> {
            Arc::new(TargetVerifier {
                target: None,
                calls: AtomicU64::new(0),
            })
        }
    }

    impl Verify for TargetVerifier {
        fn verify(&self, candidate: &str) -> Result<bool, CryptError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(self.target.as_deref() == Some(candidate))
        }
    }

    /// Always reports the fatal missing-binding error.
    struct BrokenVerifier;

    impl Verify for BrokenVerifier {
        fn verify(&self, _candidate: &str) -> Result<bool, CryptError> {
            Err(CryptError::NoCryptFunction)
        }
    }

    /// Records every checkpoint (tried value + per-worker snapshot) and
    /// every worker-start announcement.
    #[derive(Default)]
    struct Recorder {
        checkpoints: Mutex<Vec<(u64, Vec<u64>)>>,
        starts: Mutex<Vec<usize>>,
        stop_after: Option<u64>,
        stopped: AtomicBool,
    }

    impl Recorder {
        fn new() -> Arc<Recorder> {
            Arc::new(Recorder::default())
        }

        /// Request an external stop once `tried` reaches the given milestone.
        fn stopping_after(tried: u64) -> Arc<Recorder> {
            Arc::new(Recorder {
                stop_after: Some(tried),
                ..Recorder::default()
            })
        }

        fn tried_values(&self) -> Vec<u64> {
            self.checkpoints.lock().unwrap().iter().map(|(t, _)| *t).collect()
        }
    }

    impl SliceObserver for Recorder {
        fn on_worker_start(&self, slot: usize, _thread: thread::ThreadId) {
            self.starts.lock().unwrap().push(slot);
        }

        fn on_checkpoint(&self, tried: u64, per_worker: &[u64]) {
            if let Some(limit) = self.stop_after {
                if tried >= limit {
                    self.stopped.store(true, Ordering::Release);
                }
            }
            self.checkpoints.lock().unwrap().push((tried, per_worker.to_vec()));
        }

        fn is_stop_requested(&self) -> bool {
            self.stopped.load(Ordering::Acquire)
        }
    }

    // ── Full-Completion Invariants ─────────────────────────────────

    /// A miss over the whole slice tries every index exactly once and emits
    /// the exact milestone sequence {k, 2k, ..., count} with the terminal
    /// count present even though it is not a multiple of k.
    #[test]
    fn miss_tries_whole_slice_with_exact_checkpoints() {
        let pool = WorkerPool::new(4);
        let recorder = Recorder::new();
        let verifier = TargetVerifier::miss();
        let result = pool
            .run_slice_with(verifier.clone(), 79, 1003, 100, recorder.clone())
            .unwrap();

        assert!(!result.found);
        assert_eq!(result.password, None);
        assert_eq!(result.tried, 1003);
        assert_eq!(verifier.calls.load(Ordering::Relaxed), 1003);

        let mut expected: Vec<u64> = (1..=10).map(|i| i * 100).collect();
        expected.push(1003);
        assert_eq!(recorder.tried_values(), expected);
    }

    /// Worker-start announcements fire once per worker per job.
    #[test]
    fn worker_start_once_per_slot() {
        let pool = WorkerPool::new(3);
        let recorder = Recorder::new();
        pool.run_slice_with(TargetVerifier::miss(), 0, 10, 5, recorder.clone())
            .unwrap();
        let mut starts = recorder.starts.lock().unwrap().clone();
        starts.sort_unstable();
        assert_eq!(starts, vec![0, 1, 2]);
    }

    /// Per-worker snapshots must sum to the checkpoint's tried value at the
    /// terminal milestone, and never decrease per slot across the sequence.
    #[test]
    fn snapshots_are_monotone_and_consistent() {
        let pool = WorkerPool::new(4);
        let recorder = Recorder::new();
        pool.run_slice_with(TargetVerifier::miss(), 0, 2000, 250, recorder.clone())
            .unwrap();

        let checkpoints = recorder.checkpoints.lock().unwrap();
        let (terminal_tried, terminal_snapshot) = checkpoints.last().unwrap();
        assert_eq!(*terminal_tried, 2000);
        assert_eq!(terminal_snapshot.iter().sum::<u64>(), 2000);

        for pair in checkpoints.windows(2) {
            assert!(pair[1].0 > pair[0].0, "tried values must strictly increase");
            for slot in 0..4 {
                assert!(
                    pair[1].1[slot] >= pair[0].1[slot],
                    "per-worker counter regressed at slot {slot}"
                );
            }
        }
    }

    // ── Match Handling ─────────────────────────────────────────────

    /// A hit stops the slice early, reports the matching password, and the
    /// reported password re-verifies against the same verifier.
    #[test]
    fn hit_stops_early_and_reports_password() {
        let pool = WorkerPool::new(4);
        let target = "Cc";
        let target_index = candidate_to_index(target, ALPHABET.as_bytes()).unwrap();
        assert!((79..79 + 6241).contains(&target_index));

        let verifier = TargetVerifier::hit(target);
        let result = pool
            .run_slice_with(verifier.clone(), 79, 6241, 100, Recorder::new())
            .unwrap();

        assert!(result.found);
        assert_eq!(result.password.as_deref(), Some(target));
        assert!(result.tried >= 1 && result.tried <= 6241);
        assert!(verifier.verify(target).unwrap());
    }

    /// Re-running the same slice at a different thread count reproduces the
    /// same found/password outcome.
    #[test]
    fn outcome_is_thread_count_independent() {
        for threads in [1, 2, 8] {
            let pool = WorkerPool::new(threads);
            let result = pool
                .run_slice_with(TargetVerifier::hit("AB"), 0, 200, 50, Recorder::new())
                .unwrap();
            assert!(result.found, "threads={threads}");
            assert_eq!(result.password.as_deref(), Some("AB"), "threads={threads}");
        }
    }

    // ── Boundary Behaviors ─────────────────────────────────────────

    /// count=1, checkpoint_every=1: exactly one checkpoint {tried: 1}.
    #[test]
    fn single_index_slice() {
        let pool = WorkerPool::new(2);
        let recorder = Recorder::new();
        let result = pool
            .run_slice_with(TargetVerifier::miss(), 0, 1, 1, recorder.clone())
            .unwrap();
        assert_eq!(result.tried, 1);
        assert_eq!(recorder.tried_values(), vec![1]);
    }

    /// More workers than indices: the excess workers drain without a single
    /// verify, and the slice still completes normally.
    #[test]
    fn more_threads_than_work() {
        let pool = WorkerPool::new(8);
        let verifier = TargetVerifier::miss();
        let recorder = Recorder::new();
        let result = pool
            .run_slice_with(verifier.clone(), 0, 3, 1, recorder.clone())
            .unwrap();
        assert_eq!(result.tried, 3);
        assert_eq!(verifier.calls.load(Ordering::Relaxed), 3);
        assert_eq!(recorder.tried_values(), vec![1, 2, 3]);
        // All 8 workers announced themselves even though only 3 indices exist.
        assert_eq!(recorder.starts.lock().unwrap().len(), 8);
    }

    /// Ordered commits under contention: 16 workers, checkpoint period 1.
    /// Every index from 1..=count appears exactly once, in order, no matter
    /// how completions interleave.
    #[test]
    fn ordered_commits_under_contention() {
        let pool = WorkerPool::new(16);
        let recorder = Recorder::new();
        let count = 10_000;
        pool.run_slice_with(TargetVerifier::miss(), 0, count, 1, recorder.clone())
            .unwrap();
        let tried = recorder.tried_values();
        assert_eq!(tried.len(), count as usize);
        assert_eq!(tried.first(), Some(&1));
        assert_eq!(tried.last(), Some(&(count as u64)));
        for pair in tried.windows(2) {
            assert!(pair[1] > pair[0]);
        }
    }

    // ── Stop & Failure Semantics ───────────────────────────────────

    /// An external stop lands between iterations: the slice returns with
    /// tried <= count and no result, and the pool accepts the next job.
    #[test]
    fn external_stop_cuts_slice_short() {
        let pool = WorkerPool::new(4);
        let recorder = Recorder::stopping_after(1_000);
        let result = pool
            .run_slice_with(TargetVerifier::miss(), 0, 1_000_000, 1_000, recorder.clone())
            .unwrap();
        assert!(!result.found);
        assert!(result.tried <= 1_000_000);
        assert!(result.tried >= 1_000, "stop can only land after the trigger");

        // Pool remains usable for a follow-up assignment.
        let again = pool
            .run_slice_with(TargetVerifier::miss(), 0, 10, 5, Recorder::new())
            .unwrap();
        assert_eq!(again.tried, 10);
    }

    /// A fatal binding error on the first verify fails the whole slice with
    /// the distinguished error; a later slice on the same pool still runs.
    #[test]
    fn fatal_binding_error_fails_slice_not_pool() {
        let pool = WorkerPool::new(4);
        let err = pool
            .run_slice_with(Arc::new(BrokenVerifier), 0, 100, 10, Arc::new(()))
            .unwrap_err();
        assert!(matches!(err, SliceError::CryptUnavailable(_)));

        let ok = pool
            .run_slice_with(TargetVerifier::miss(), 0, 100, 10, Recorder::new())
            .unwrap();
        assert_eq!(ok.tried, 100);
    }

    /// An APR1 hash with no openssl on the system: every spawn fails, every
    /// candidate counts as a non-match, and the slice still drains fully
    /// with a normal (found=false) result.
    #[test]
    fn apr1_without_openssl_drains_slice() {
        let pool = WorkerPool::new(2);
        let verifier = Arc::new(Verifier::Apr1 {
            stored: "$apr1$salty$AbCdEf".to_string(),
            salt: "salty".to_string(),
            openssl: "openssl-definitely-not-installed".to_string(),
            timeout: std::time::Duration::from_secs(5),
        });
        let recorder = Recorder::new();
        let result = pool
            .run_slice_with(verifier, 0, 40, 10, recorder.clone())
            .unwrap();
        assert!(!result.found);
        assert_eq!(result.tried, 40);
        assert_eq!(recorder.tried_values(), vec![10, 20, 30, 40]);
    }

    /// The pool survives many sequential assignments (it is created once per
    /// worker process and reused for every ASSIGN_WORK).
    #[test]
    fn pool_survives_many_jobs() {
        let pool = WorkerPool::new(3);
        for round in 0..10 {
            let result = pool
                .run_slice_with(TargetVerifier::miss(), round * 100, 100, 37, Recorder::new())
                .unwrap();
            assert_eq!(result.tried, 100, "round {round}");
        }
    }

    // ── Preconditions ──────────────────────────────────────────────

    #[test]
    fn invalid_slices_are_refused() {
        let pool = WorkerPool::new(2);
        let cases: [(i64, i64, i32); 4] = [
            (-1, 10, 1),
            (0, 0, 1),
            (0, MAX_SLICE + 1, 1),
            (0, 10, 0),
        ];
        for (start, count, every) in cases {
            let err = pool
                .run_slice_with(TargetVerifier::miss(), start, count, every, Arc::new(()))
                .unwrap_err();
            assert!(
                matches!(err, SliceError::InvalidSlice(_)),
                "({start}, {count}, {every}) should be refused"
            );
        }
    }

    /// The far end of the admissible input range stays addressable: base-79
    /// length blocks cover every i64 start index, so a slice near i64::MAX
    /// decodes (to length-10 candidates) and runs normally.
    #[test]
    fn slice_near_i64_max_is_addressable() {
        let pool = WorkerPool::new(2);
        let verifier = TargetVerifier::miss();
        let result = pool
            .run_slice_with(verifier.clone(), i64::MAX - 99, 100, 50, Arc::new(()))
            .unwrap();
        assert_eq!(result.tried, 100);
        assert_eq!(verifier.calls.load(Ordering::Relaxed), 100);
    }

    // ── Distribution ───────────────────────────────────────────────

    /// Every candidate in the slice is verified exactly once: the fetch-add
    /// cursor hands out each relative index to exactly one worker.
    #[test]
    fn each_candidate_verified_exactly_once() {
        struct SetVerifier {
            seen: Mutex<Vec<String>>,
        }
        impl Verify for SetVerifier {
            fn verify(&self, candidate: &str) -> Result<bool, CryptError> {
                self.seen.lock().unwrap().push(candidate.to_string());
                Ok(false)
            }
        }

        let verifier = Arc::new(SetVerifier {
            seen: Mutex::new(Vec::new()),
        });
        let pool = WorkerPool::new(6);
        pool.run_slice_with(verifier.clone(), 50, 500, 100, Arc::new(()))
            .unwrap();

        let seen = verifier.seen.lock().unwrap();
        assert_eq!(seen.len(), 500);
        let distinct: HashSet<&String> = seen.iter().collect();
        assert_eq!(distinct.len(), 500, "duplicate verification detected");
        let alphabet = ALPHABET.as_bytes();
        for candidate in distinct {
            let idx = candidate_to_index(candidate, alphabet).unwrap();
            assert!((50..550).contains(&idx));
        }
    }

    /// request_stop with no active job is a no-op; with an active job it
    /// halts the slice.
    #[test]
    fn request_stop_halts_active_job() {
        let pool = Arc::new(WorkerPool::new(2));
        pool.request_stop(); // no job yet; must not panic or wedge anything

        struct SlowVerifier {
            calls: AtomicUsize,
        }
        impl Verify for SlowVerifier {
            fn verify(&self, _candidate: &str) -> Result<bool, CryptError> {
                self.calls.fetch_add(1, Ordering::Relaxed);
                thread::sleep(std::time::Duration::from_millis(1));
                Ok(false)
            }
        }

        let stopper = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(50));
                pool.request_stop();
            })
        };
        let result = pool
            .run_slice_with(
                Arc::new(SlowVerifier {
                    calls: AtomicUsize::new(0),
                }),
                0,
                1_000_000,
                10_000,
                Arc::new(()),
            )
            .unwrap();
        stopper.join().unwrap();
        assert!(!result.found);
        assert!(
            result.tried < 1_000_000,
            "stop should land long before the slice drains"
        );
    }
}
