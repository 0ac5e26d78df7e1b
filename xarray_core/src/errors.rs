//! Error handling and C-ABI error codes for the XArray

use std::cell::RefCell;
use std::fmt;
use std::os::raw::c_char;

/// Failures surfaced by container operations.
///
/// Internal conditions (retry sentinels, stale nodes) never show up here;
/// they are absorbed by the walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A node allocation failed during a walk. Nothing was modified; drop
    /// the lock, call `XaState::nomem` and retry.
    OutOfMemory,
    /// `insert` found an entry in the target range.
    AlreadyOccupied,
    /// The order does not fit the index space.
    IndexOutOfRange,
    /// A `Value` payload wider than `MAX_VALUE`.
    ValueOutOfRange,
    InvalidConfig(String),
    InvalidHandle,
    NotFound,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::OutOfMemory => f.write_str("out of memory while allocating a node"),
            Error::AlreadyOccupied => f.write_str("an entry already occupies the range"),
            Error::IndexOutOfRange => f.write_str("index range exceeds the index space"),
            Error::ValueOutOfRange => f.write_str("value does not fit in a value entry"),
            Error::InvalidConfig(why) => write!(f, "invalid configuration: {why}"),
            Error::InvalidHandle => f.write_str("invalid handle"),
            Error::NotFound => f.write_str("not found"),
        }
    }
}

impl std::error::Error for Error {}

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    Success = 0,
    OutOfMemory = 1,
    AlreadyOccupied = 2,
    IndexOutOfRange = 3,
    ValueOutOfRange = 4,
    InvalidConfig = 5,
    InvalidHandle = 6,
    NotFound = 7,
    Unknown = 255,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::OutOfMemory => "Out of memory",
            ErrorCode::AlreadyOccupied => "Already occupied",
            ErrorCode::IndexOutOfRange => "Index out of range",
            ErrorCode::ValueOutOfRange => "Value out of range",
            ErrorCode::InvalidConfig => "Invalid configuration",
            ErrorCode::InvalidHandle => "Invalid handle",
            ErrorCode::NotFound => "Not found",
            ErrorCode::Unknown => "Unknown error",
        }
    }

    fn as_cstr(self) -> &'static [u8] {
        match self {
            ErrorCode::Success => b"Success\0",
            ErrorCode::OutOfMemory => b"Out of memory\0",
            ErrorCode::AlreadyOccupied => b"Already occupied\0",
            ErrorCode::IndexOutOfRange => b"Index out of range\0",
            ErrorCode::ValueOutOfRange => b"Value out of range\0",
            ErrorCode::InvalidConfig => b"Invalid configuration\0",
            ErrorCode::InvalidHandle => b"Invalid handle\0",
            ErrorCode::NotFound => b"Not found\0",
            ErrorCode::Unknown => b"Unknown error\0",
        }
    }
}

// Thread-local last error for C-ABI
thread_local! {
    static LAST_ERROR: RefCell<ErrorCode> = const { RefCell::new(ErrorCode::Success) };
}

pub fn set_last_error(code: ErrorCode) {
    LAST_ERROR.with(|cell| *cell.borrow_mut() = code);
}

pub fn get_last_error() -> ErrorCode {
    LAST_ERROR.with(|cell| *cell.borrow())
}

#[no_mangle]
pub extern "C" fn xarray_last_error() -> ErrorCode {
    get_last_error()
}

#[no_mangle]
pub extern "C" fn xarray_strerror(code: ErrorCode) -> *const c_char {
    code.as_cstr().as_ptr() as *const c_char
}

// Map internal Error to ErrorCode
pub fn map_error(e: &Error) -> ErrorCode {
    match e {
        Error::OutOfMemory => ErrorCode::OutOfMemory,
        Error::AlreadyOccupied => ErrorCode::AlreadyOccupied,
        Error::IndexOutOfRange => ErrorCode::IndexOutOfRange,
        Error::ValueOutOfRange => ErrorCode::ValueOutOfRange,
        Error::InvalidConfig(_) => ErrorCode::InvalidConfig,
        Error::InvalidHandle => ErrorCode::InvalidHandle,
        Error::NotFound => ErrorCode::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn strerror_matches_as_str() {
        for code in [
            ErrorCode::Success,
            ErrorCode::OutOfMemory,
            ErrorCode::AlreadyOccupied,
            ErrorCode::NotFound,
            ErrorCode::Unknown,
        ] {
            let c = unsafe { CStr::from_ptr(xarray_strerror(code)) };
            assert_eq!(c.to_str().unwrap(), code.as_str());
        }
    }

    #[test]
    fn last_error_is_per_thread() {
        set_last_error(ErrorCode::NotFound);
        let other = std::thread::spawn(get_last_error).join().unwrap();
        assert_eq!(other, ErrorCode::Success);
        assert_eq!(get_last_error(), ErrorCode::NotFound);
        set_last_error(ErrorCode::Success);
    }
}
