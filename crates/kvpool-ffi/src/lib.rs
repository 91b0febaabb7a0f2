//! C ABI for kvpool.
//!
//! Handles are opaque and owned by the caller: `kvpool_config_new` /
//! `kvpool_config_delete` and `kvpool_open` / `kvpool_close`. Every call
//! returns a `KVPOOL_STATUS_*` code; on failure the diagnostic for the
//! calling thread is available from `kvpool_errormsg()` until the next
//! failure on that thread.
//!
//! Keys and values cross as (pointer, length) pairs and may contain any
//! bytes. A zero length accepts a null pointer.
#![allow(non_camel_case_types)]
#![allow(clippy::missing_safety_doc)]

use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::ops::ControlFlow;
use std::os::raw::{c_char, c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::slice;

use kvpool_core::{Config, Database, KeyRange, KvError, KvResult, Status};
use tracing_subscriber::EnvFilter;

pub const KVPOOL_STATUS_OK: c_int = Status::Ok as c_int;
pub const KVPOOL_STATUS_UNKNOWN_ERROR: c_int = Status::UnknownError as c_int;
pub const KVPOOL_STATUS_NOT_FOUND: c_int = Status::NotFound as c_int;
pub const KVPOOL_STATUS_NOT_SUPPORTED: c_int = Status::NotSupported as c_int;
pub const KVPOOL_STATUS_INVALID_ARGUMENT: c_int = Status::InvalidArgument as c_int;
pub const KVPOOL_STATUS_CONFIG_PARSING_ERROR: c_int = Status::ConfigParsingError as c_int;
pub const KVPOOL_STATUS_CONFIG_TYPE_ERROR: c_int = Status::ConfigTypeError as c_int;
pub const KVPOOL_STATUS_STOPPED_BY_CB: c_int = Status::StoppedByCb as c_int;
pub const KVPOOL_STATUS_OUT_OF_MEMORY: c_int = Status::OutOfMemory as c_int;
pub const KVPOOL_STATUS_WRONG_ENGINE_NAME: c_int = Status::WrongEngineName as c_int;

/// Receives a value. The pointer is only valid during the call.
pub type kvpool_get_v_cb = extern "C" fn(value: *const c_char, value_len: usize, arg: *mut c_void);

/// Receives a record. Return non-zero to stop the traversal.
pub type kvpool_get_kv_cb = extern "C" fn(
    key: *const c_char,
    key_len: usize,
    value: *const c_char,
    value_len: usize,
    arg: *mut c_void,
) -> c_int;

pub struct kvpool_config {
    config: Config,
}

pub struct kvpool {
    db: Database,
}

thread_local! {
    static LAST_ERROR: RefCell<CString> = RefCell::new(CString::default());
}

fn set_error(message: &str) {
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = message);
}

/// Run `f`, translating its result into a status code. Panics are caught
/// and reported as UNKNOWN_ERROR.
fn ffi_call<F>(f: F) -> c_int
where
    F: FnOnce() -> KvResult<Status>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(status)) => status.code(),
        Ok(Err(err)) => {
            set_error(&err.to_string());
            err.status().code()
        }
        Err(_) => {
            set_error("internal error: panic in kvpool");
            Status::UnknownError.code()
        }
    }
}

fn null_arg(what: &str) -> KvError {
    KvError::InvalidArgument(format!("{} is null", what))
}

unsafe fn db_ref<'a>(db: *mut kvpool) -> KvResult<&'a Database> {
    db.as_ref().map(|handle| &handle.db).ok_or_else(|| null_arg("db"))
}

unsafe fn config_mut<'a>(config: *mut kvpool_config) -> KvResult<&'a mut Config> {
    config
        .as_mut()
        .map(|handle| &mut handle.config)
        .ok_or_else(|| null_arg("config"))
}

unsafe fn c_str<'a>(ptr: *const c_char, what: &str) -> KvResult<&'a str> {
    if ptr.is_null() {
        return Err(null_arg(what));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| KvError::InvalidArgument(format!("{} is not valid UTF-8", what)))
}

unsafe fn bytes<'a>(ptr: *const c_char, len: usize, what: &str) -> KvResult<&'a [u8]> {
    if len == 0 {
        return Ok(&[]);
    }
    if ptr.is_null() {
        return Err(null_arg(what));
    }
    // SAFETY: the caller guarantees `ptr` is valid for `len` bytes.
    Ok(slice::from_raw_parts(ptr.cast::<u8>(), len))
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[no_mangle]
pub extern "C" fn kvpool_config_new() -> *mut kvpool_config {
    Box::into_raw(Box::new(kvpool_config { config: Config::new() }))
}

#[no_mangle]
pub unsafe extern "C" fn kvpool_config_delete(config: *mut kvpool_config) {
    if config.is_null() {
        return;
    }
    drop(Box::from_raw(config));
}

#[no_mangle]
pub unsafe extern "C" fn kvpool_config_put_string(
    config: *mut kvpool_config,
    key: *const c_char,
    value: *const c_char,
) -> c_int {
    ffi_call(|| {
        let config = config_mut(config)?;
        let key = c_str(key, "key")?;
        let value = c_str(value, "value")?;
        config.put_string(key, value);
        Ok(Status::Ok)
    })
}

#[no_mangle]
pub unsafe extern "C" fn kvpool_config_put_uint64(
    config: *mut kvpool_config,
    key: *const c_char,
    value: u64,
) -> c_int {
    ffi_call(|| {
        let config = config_mut(config)?;
        let key = c_str(key, "key")?;
        config.put_uint64(key, value);
        Ok(Status::Ok)
    })
}

/// Merge the members of a JSON object into `config`.
#[no_mangle]
pub unsafe extern "C" fn kvpool_config_from_json(config: *mut kvpool_config, json: *const c_char) -> c_int {
    ffi_call(|| {
        let config = config_mut(config)?;
        let parsed = Config::from_json(c_str(json, "json")?)?;
        for (key, value) in parsed.iter() {
            match value {
                kvpool_core::ConfigValue::String(s) => config.put_string(key, s.as_str()),
                kvpool_core::ConfigValue::UInt64(n) => config.put_uint64(key, *n),
            };
        }
        Ok(Status::Ok)
    })
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

/// Open `engine` with `config`. The config is consumed whether or not the
/// open succeeds.
#[no_mangle]
pub unsafe extern "C" fn kvpool_open(
    engine: *const c_char,
    config: *mut kvpool_config,
    db: *mut *mut kvpool,
) -> c_int {
    ffi_call(|| {
        if config.is_null() {
            return Err(null_arg("config"));
        }
        let config = Box::from_raw(config).config;
        if db.is_null() {
            return Err(null_arg("db"));
        }
        let engine = c_str(engine, "engine")?;
        let handle = Box::new(kvpool {
            db: Database::open(engine, config)?,
        });
        *db = Box::into_raw(handle);
        Ok(Status::Ok)
    })
}

/// Stop the database and free the handle.
#[no_mangle]
pub unsafe extern "C" fn kvpool_close(db: *mut kvpool) {
    if db.is_null() {
        return;
    }
    let handle = Box::from_raw(db);
    let _ = ffi_call(|| handle.db.stop().map(|_| Status::Ok));
}

// ---------------------------------------------------------------------------
// Point operations
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn kvpool_put(
    db: *mut kvpool,
    k: *const c_char,
    kb: usize,
    v: *const c_char,
    vb: usize,
) -> c_int {
    ffi_call(|| {
        let db = db_ref(db)?;
        db.put(bytes(k, kb, "key")?, bytes(v, vb, "value")?)?;
        Ok(Status::Ok)
    })
}

/// Deliver the value of `k` to `cb`. NOT_FOUND if absent.
#[no_mangle]
pub unsafe extern "C" fn kvpool_get(
    db: *mut kvpool,
    k: *const c_char,
    kb: usize,
    cb: Option<kvpool_get_v_cb>,
    arg: *mut c_void,
) -> c_int {
    ffi_call(|| {
        let db = db_ref(db)?;
        let cb = cb.ok_or_else(|| null_arg("callback"))?;
        let key = bytes(k, kb, "key")?;
        let found = db.get_with(key, |value| cb(value.as_ptr().cast(), value.len(), arg))?;
        Ok(if found { Status::Ok } else { Status::NotFound })
    })
}

/// Copy the value of `k` into `buffer`. `value_size` always receives the
/// stored length; a buffer that is too small yields OUT_OF_MEMORY.
#[no_mangle]
pub unsafe extern "C" fn kvpool_get_copy(
    db: *mut kvpool,
    k: *const c_char,
    kb: usize,
    buffer: *mut c_char,
    buffer_size: usize,
    value_size: *mut usize,
) -> c_int {
    ffi_call(|| {
        let db = db_ref(db)?;
        let key = bytes(k, kb, "key")?;
        if buffer.is_null() && buffer_size > 0 {
            return Err(null_arg("buffer"));
        }
        let mut stored = 0usize;
        let found = db.get_with(key, |value| {
            stored = value.len();
            if value.len() <= buffer_size && !value.is_empty() {
                // SAFETY: the caller guarantees `buffer` holds `buffer_size` bytes.
                ptr::copy_nonoverlapping(value.as_ptr(), buffer.cast::<u8>(), value.len());
            }
        })?;
        if !found {
            return Ok(Status::NotFound);
        }
        if !value_size.is_null() {
            *value_size = stored;
        }
        if stored > buffer_size {
            return Err(KvError::BufferTooSmall {
                needed: stored as u64,
                available: buffer_size as u64,
            });
        }
        Ok(Status::Ok)
    })
}

/// OK if the key is present, NOT_FOUND otherwise.
#[no_mangle]
pub unsafe extern "C" fn kvpool_exists(db: *mut kvpool, k: *const c_char, kb: usize) -> c_int {
    ffi_call(|| {
        let db = db_ref(db)?;
        Ok(if db.exists(bytes(k, kb, "key")?)? {
            Status::Ok
        } else {
            Status::NotFound
        })
    })
}

/// OK if a record was removed, NOT_FOUND if the key was absent.
#[no_mangle]
pub unsafe extern "C" fn kvpool_remove(db: *mut kvpool, k: *const c_char, kb: usize) -> c_int {
    ffi_call(|| {
        let db = db_ref(db)?;
        Ok(if db.remove(bytes(k, kb, "key")?)? {
            Status::Ok
        } else {
            Status::NotFound
        })
    })
}

// ---------------------------------------------------------------------------
// Counts
// ---------------------------------------------------------------------------

unsafe fn count_range(db: *mut kvpool, range: KeyRange, cnt: *mut usize) -> KvResult<Status> {
    let db = db_ref(db)?;
    if cnt.is_null() {
        return Err(null_arg("cnt"));
    }
    *cnt = db.count(&range)?;
    Ok(Status::Ok)
}

#[no_mangle]
pub unsafe extern "C" fn kvpool_count_all(db: *mut kvpool, cnt: *mut usize) -> c_int {
    ffi_call(|| count_range(db, KeyRange::All, cnt))
}

#[no_mangle]
pub unsafe extern "C" fn kvpool_count_above(db: *mut kvpool, k: *const c_char, kb: usize, cnt: *mut usize) -> c_int {
    ffi_call(|| count_range(db, KeyRange::above(bytes(k, kb, "key")?), cnt))
}

#[no_mangle]
pub unsafe extern "C" fn kvpool_count_below(db: *mut kvpool, k: *const c_char, kb: usize, cnt: *mut usize) -> c_int {
    ffi_call(|| count_range(db, KeyRange::below(bytes(k, kb, "key")?), cnt))
}

#[no_mangle]
pub unsafe extern "C" fn kvpool_count_between(
    db: *mut kvpool,
    k1: *const c_char,
    kb1: usize,
    k2: *const c_char,
    kb2: usize,
    cnt: *mut usize,
) -> c_int {
    ffi_call(|| {
        let range = KeyRange::between(bytes(k1, kb1, "key1")?, bytes(k2, kb2, "key2")?);
        count_range(db, range, cnt)
    })
}

// ---------------------------------------------------------------------------
// Traversals
// ---------------------------------------------------------------------------

unsafe fn visit_range(
    db: *mut kvpool,
    range: KeyRange,
    cb: Option<kvpool_get_kv_cb>,
    arg: *mut c_void,
) -> KvResult<Status> {
    let db = db_ref(db)?;
    let cb = cb.ok_or_else(|| null_arg("callback"))?;
    db.visit(range, |key, value| {
        let stop = cb(key.as_ptr().cast(), key.len(), value.as_ptr().cast(), value.len(), arg);
        if stop != 0 {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;
    Ok(Status::Ok)
}

#[no_mangle]
pub unsafe extern "C" fn kvpool_get_all(db: *mut kvpool, cb: Option<kvpool_get_kv_cb>, arg: *mut c_void) -> c_int {
    ffi_call(|| visit_range(db, KeyRange::All, cb, arg))
}

#[no_mangle]
pub unsafe extern "C" fn kvpool_get_above(
    db: *mut kvpool,
    k: *const c_char,
    kb: usize,
    cb: Option<kvpool_get_kv_cb>,
    arg: *mut c_void,
) -> c_int {
    ffi_call(|| visit_range(db, KeyRange::above(bytes(k, kb, "key")?), cb, arg))
}

#[no_mangle]
pub unsafe extern "C" fn kvpool_get_below(
    db: *mut kvpool,
    k: *const c_char,
    kb: usize,
    cb: Option<kvpool_get_kv_cb>,
    arg: *mut c_void,
) -> c_int {
    ffi_call(|| visit_range(db, KeyRange::below(bytes(k, kb, "key")?), cb, arg))
}

#[no_mangle]
pub unsafe extern "C" fn kvpool_get_between(
    db: *mut kvpool,
    k1: *const c_char,
    kb1: usize,
    k2: *const c_char,
    kb2: usize,
    cb: Option<kvpool_get_kv_cb>,
    arg: *mut c_void,
) -> c_int {
    ffi_call(|| {
        let range = KeyRange::between(bytes(k1, kb1, "key1")?, bytes(k2, kb2, "key2")?);
        visit_range(db, range, cb, arg)
    })
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Message of the last failure on this thread. Valid until the next
/// failing call on the same thread.
#[no_mangle]
pub extern "C" fn kvpool_errormsg() -> *const c_char {
    LAST_ERROR.with(|slot| slot.borrow().as_ptr())
}

/// Constant-table name of a status code, e.g. "NOT_FOUND".
#[no_mangle]
pub extern "C" fn kvpool_status_name(status: c_int) -> *const c_char {
    let name: &'static [u8] = match Status::from_code(status) {
        Some(Status::Ok) => b"OK\0",
        Some(Status::UnknownError) => b"UNKNOWN_ERROR\0",
        Some(Status::NotFound) => b"NOT_FOUND\0",
        Some(Status::NotSupported) => b"NOT_SUPPORTED\0",
        Some(Status::InvalidArgument) => b"INVALID_ARGUMENT\0",
        Some(Status::ConfigParsingError) => b"CONFIG_PARSING_ERROR\0",
        Some(Status::ConfigTypeError) => b"CONFIG_TYPE_ERROR\0",
        Some(Status::StoppedByCb) => b"STOPPED_BY_CB\0",
        Some(Status::OutOfMemory) => b"OUT_OF_MEMORY\0",
        Some(Status::WrongEngineName) => b"WRONG_ENGINE_NAME\0",
        None => b"INVALID_STATUS\0",
    };
    name.as_ptr().cast()
}

/// Install a stderr log subscriber filtered by `KVPOOL_LOG` (default
/// `warn`). Later calls are no-ops.
#[no_mangle]
pub extern "C" fn kvpool_log_init() -> c_int {
    ffi_call(|| {
        let filter = EnvFilter::try_from_env("KVPOOL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .is_err()
        {
            tracing::debug!("log subscriber already installed");
        }
        Ok(Status::Ok)
    })
}
