//! # Crypt — Dynamic Binding to the Platform crypt(3) Library
//!
//! Lazily resolves the system crypt implementation once per process and
//! exposes a single verification primitive, [`crypt_wrap`]. The stored hash
//! doubles as the crypt "setting" (algorithm + salt), so hashing a candidate
//! under it and comparing the result is a full verification.
//!
//! ## Library Probe Order
//!
//! `libxcrypt.so.2` → `libxcrypt.so.1` → `libxcrypt.so.0` → `libcrypt.so.2`
//! → `libcrypt.so.1` → `libcrypt.so` → `libc.so.6`. The first library that
//! yields a usable symbol is retained for the process lifetime (never
//! `dlclose`d); the rest are released.
//!
//! ## Reentrancy
//!
//! Prefers `crypt_ra`, which hashes into a caller-owned scratch buffer that
//! the library allocates and resizes through a `(void**, int*)` pair. Each
//! thread keeps its own scratch in a `thread_local!`, freed when the thread
//! exits. When only the classic `crypt` symbol exists, every call is
//! serialized through a process-wide mutex instead — slower, but
//! [`crypt_wrap`] stays safe to call from any thread either way.

use std::cell::RefCell;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::ptr;
use std::sync::{Mutex, OnceLock};

use thiserror::Error;
use tracing::debug;

/// Shared-library names probed in order for a crypt implementation.
pub const CRYPT_LIBRARIES: [&str; 7] = [
    "libxcrypt.so.2",
    "libxcrypt.so.1",
    "libxcrypt.so.0",
    "libcrypt.so.2",
    "libcrypt.so.1",
    "libcrypt.so",
    "libc.so.6",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptError {
    /// Neither `crypt_ra` nor `crypt` resolved in any probed library.
    #[error("no crypt function found in any of {CRYPT_LIBRARIES:?}")]
    NoCryptFunction,
}

/// `char *crypt_ra(const char *phrase, const char *setting, void **data, int *size)`
type CryptRaFn =
    unsafe extern "C" fn(*const c_char, *const c_char, *mut *mut c_void, *mut c_int) -> *mut c_char;

/// `char *crypt(const char *phrase, const char *setting)`
type CryptFn = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut c_char;

enum Entry {
    /// Thread-safe entry point with per-thread scratch.
    Reentrant(CryptRaFn),
    /// Classic entry point returning static storage; calls are serialized.
    Serialized(CryptFn),
}

struct Binding {
    library: &'static str,
    entry: Entry,
}

static BINDING: OnceLock<Result<Binding, CryptError>> = OnceLock::new();

/// Guards every call through the non-reentrant `crypt` fallback.
static CRYPT_LOCK: Mutex<()> = Mutex::new(());

/// Library-managed scratch for `crypt_ra`: an opaque allocation the library
/// grows as needed. Owned exclusively by the thread that allocated it.
struct Scratch {
    data: *mut c_void,
    size: c_int,
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if !self.data.is_null() {
            unsafe { libc::free(self.data) };
        }
    }
}

thread_local! {
    static SCRATCH: RefCell<Scratch> = const {
        RefCell::new(Scratch { data: ptr::null_mut(), size: 0 })
    };
}

fn load_binding() -> Result<Binding, CryptError> {
    for name in CRYPT_LIBRARIES {
        let cname = match CString::new(name) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let handle = unsafe { libc::dlopen(cname.as_ptr(), libc::RTLD_NOW) };
        if handle.is_null() {
            continue;
        }
        unsafe {
            let sym = libc::dlsym(handle, c"crypt_ra".as_ptr());
            if !sym.is_null() {
                debug!(library = name, symbol = "crypt_ra", "crypt binding resolved");
                return Ok(Binding {
                    library: name,
                    entry: Entry::Reentrant(std::mem::transmute::<*mut c_void, CryptRaFn>(sym)),
                });
            }
            let sym = libc::dlsym(handle, c"crypt".as_ptr());
            if !sym.is_null() {
                debug!(library = name, symbol = "crypt", "crypt binding resolved");
                return Ok(Binding {
                    library: name,
                    entry: Entry::Serialized(std::mem::transmute::<*mut c_void, CryptFn>(sym)),
                });
            }
            // No usable symbol here; release and keep probing.
            libc::dlclose(handle);
        }
    }
    Err(CryptError::NoCryptFunction)
}

fn binding() -> Result<&'static Binding, CryptError> {
    match BINDING.get_or_init(load_binding) {
        Ok(b) => Ok(b),
        Err(e) => Err(e.clone()),
    }
}

/// Whether a crypt entry point resolved on this system.
pub fn available() -> bool {
    binding().is_ok()
}

/// Name of the library the binding resolved from, for startup logs.
pub fn library_name() -> Option<&'static str> {
    binding().ok().map(|b| b.library)
}

/// Hash `candidate` under `setting` (a full stored hash or salt string).
///
/// Returns `Ok(None)` when the library rejects the setting (null result),
/// when `setting` is empty, or when either input contains an interior NUL —
/// all of which read as "not a match" to callers. `Err` is reserved for the
/// fatal case where no crypt entry point exists at all.
pub fn crypt_wrap(candidate: &str, setting: &str) -> Result<Option<String>, CryptError> {
    if setting.is_empty() {
        return Ok(None);
    }
    let bound = binding()?;
    let key = match CString::new(candidate) {
        Ok(k) => k,
        Err(_) => return Ok(None),
    };
    let set = match CString::new(setting) {
        Ok(s) => s,
        Err(_) => return Ok(None),
    };

    let raw = match bound.entry {
        Entry::Reentrant(f) => SCRATCH.with(|scratch| {
            let mut scratch = scratch.borrow_mut();
            unsafe { f(key.as_ptr(), set.as_ptr(), &mut scratch.data, &mut scratch.size) }
        }),
        Entry::Serialized(f) => {
            let _guard = CRYPT_LOCK.lock().unwrap();
            unsafe { f(key.as_ptr(), set.as_ptr()) }
        }
    };

    if raw.is_null() {
        return Ok(None);
    }
    // Copy out immediately: the pointer targets library-owned storage
    // (per-thread scratch or static memory).
    let owned = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
    Ok(Some(owned))
}
