use std::{io, os::raw::c_int};

use tracing::error;

/// Get the last os error, log with note and return the error
pub(crate) fn log_ret_last_os_err_with_note(note: &str) -> io::Error {
    let err = io::Error::last_os_error();
    if note.is_empty() {
        error!("OS error {:?}", err);
    } else {
        error!("OS error {:?}. Note: {}", err, note);
    }
    err
}

/// Get the last os error, log and return the error
pub(crate) fn log_ret_last_os_err() -> io::Error {
    log_ret_last_os_err_with_note("")
}

/// Turn an errno returned directly by a verbs call into an error and log it.
///
/// Calls like `ibv_modify_qp` and `ibv_post_send` report the failure through
/// their return value rather than `errno`.
pub(crate) fn log_ret_errno(errno: c_int, note: &str) -> io::Error {
    let err = io::Error::from_raw_os_error(errno);
    error!("verbs call failed {:?}. Note: {}", err, note);
    err
}

/// Logs a result and return it back
pub(crate) fn log_ret<T>(ret: io::Result<T>, note: &str) -> io::Result<T> {
    if let Err(ref err) = ret {
        if note.is_empty() {
            error!("OS error {:?}", err);
        } else {
            error!("OS error {:?}. Note: {}", err, note);
        }
    }
    ret
}
