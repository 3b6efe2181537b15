//! # Verifier — Stored-Hash Verification Strategies
//!
//! A stored hash is verified by re-hashing the candidate under it and
//! comparing bytes. Two strategies share the [`Verify`] capability:
//!
//! - **Native**: the platform crypt library handles the setting directly
//!   (sha512-crypt, bcrypt, yescrypt, ...).
//! - **APR1**: system crypt usually lacks Apache's `$apr1$` scheme, so each
//!   verification shells out to `openssl passwd -apr1`. Slow, but campaigns
//!   stop on first match, and APR1 hashes are rare.
//!
//! The strategy is picked once from the stored hash prefix; the pool only
//! sees the trait.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::crypt::{self, CryptError};

/// Stored-hash prefix that selects APR1 mode.
pub const APR1_PREFIX: &str = "$apr1$";

/// Wall-clock cap on one `openssl passwd` invocation.
pub const APR1_TIMEOUT: Duration = Duration::from_secs(5);

const CHILD_POLL: Duration = Duration::from_millis(10);

/// Capability the worker pool verifies candidates through.
///
/// `Err` is reserved for the fatal missing-crypt-binding case; every
/// per-candidate failure mode (timeout, bad exit, null hash) is an
/// ordinary `Ok(false)`.
pub trait Verify: Send + Sync {
    fn verify(&self, candidate: &str) -> Result<bool, CryptError>;
}

/// Verification strategy for one stored hash.
#[derive(Debug, Clone)]
pub enum Verifier {
    /// Exact-match against the stored hash via the platform crypt library.
    Native { stored: String },
    /// `$apr1$` hashes: one `openssl passwd -apr1` child per candidate.
    Apr1 {
        stored: String,
        salt: String,
        openssl: String,
        timeout: Duration,
    },
}

impl Verifier {
    /// Select the strategy from the stored hash prefix.
    pub fn for_hash(stored: &str) -> Verifier {
        match apr1_salt(stored) {
            Some(salt) => Verifier::Apr1 {
                stored: stored.to_string(),
                salt: salt.to_string(),
                openssl: "openssl".to_string(),
                timeout: APR1_TIMEOUT,
            },
            None => Verifier::Native {
                stored: stored.to_string(),
            },
        }
    }

    pub fn stored(&self) -> &str {
        match self {
            Verifier::Native { stored } => stored,
            Verifier::Apr1 { stored, .. } => stored,
        }
    }

    fn verify_apr1(
        stored: &str,
        salt: &str,
        openssl: &str,
        timeout: Duration,
        candidate: &str,
    ) -> bool {
        // Own process group so a hung child can be torn down with its
        // descendants in one SIGKILL.
        let spawned = {
            use std::os::unix::process::CommandExt;
            Command::new(openssl)
                .args(["passwd", "-apr1", "-salt", salt, candidate])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .process_group(0)
                .spawn()
        };
        let mut child = match spawned {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "openssl spawn failed; counting as non-match");
                return false;
            }
        };

        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    if !status.success() {
                        return false;
                    }
                    let mut stdout = String::new();
                    if let Some(mut out) = child.stdout.take() {
                        if out.read_to_string(&mut stdout).is_err() {
                            return false;
                        }
                    }
                    let produced = stdout.trim();
                    return !produced.is_empty() && produced == stored;
                }
                Ok(None) => {
                    if start.elapsed() > timeout {
                        debug!(
                            timeout_secs = timeout.as_secs(),
                            "openssl timed out; killing process group"
                        );
                        kill_tree(&mut child);
                        return false;
                    }
                    std::thread::sleep(CHILD_POLL);
                }
                Err(_) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return false;
                }
            }
        }
    }
}

impl Verify for Verifier {
    fn verify(&self, candidate: &str) -> Result<bool, CryptError> {
        match self {
            Verifier::Native { stored } => {
                Ok(crypt::crypt_wrap(candidate, stored)?.as_deref() == Some(stored.as_str()))
            }
            Verifier::Apr1 {
                stored,
                salt,
                openssl,
                timeout,
            } => Ok(Verifier::verify_apr1(stored, salt, openssl, *timeout, candidate)),
        }
    }
}

/// Extract the salt (second `$`-delimited token) from an `$apr1$salt$hash`
/// string. `None` when the prefix does not match.
fn apr1_salt(stored: &str) -> Option<&str> {
    let rest = stored.strip_prefix(APR1_PREFIX)?;
    Some(rest.split('$').next().unwrap_or(rest))
}

/// SIGKILL the child's whole process group, then reap it.
fn kill_tree(child: &mut Child) {
    let pgid = child.id() as i32;
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
    let _ = child.wait();
}
