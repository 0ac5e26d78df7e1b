//! C ABI over value-only arrays.
//!
//! Arrays are addressed by integer handles from [`crate::handle_registry`];
//! every call returns an [`ErrorCode`] and mirrors it into the thread-local
//! last-error slot.

use crate::{
    config::XArrayConfig,
    entry::Entry,
    errors::{map_error, set_last_error, Error, ErrorCode},
    handle_registry::{register_handle, unregister_handle, with_handle, HandleId, ValueArray},
    walk::Filter,
    XArray,
};

// ─── small helper to turn Result<T,ErrorCode> into early-return ──────────
macro_rules! try_c { ($expr:expr) => { match $expr {
    Ok(v)  => v,
    Err(e) => return finish(e),
}}}

#[inline]
fn finish(code: ErrorCode) -> ErrorCode {
    set_last_error(code);
    code
}

#[inline]
fn from_result(res: Result<(), Error>) -> ErrorCode {
    finish(match res {
        Ok(()) => ErrorCode::Success,
        Err(e) => map_error(&e),
    })
}

#[inline]
fn value_of(entry: Entry<()>) -> usize {
    match entry {
        Entry::Value(v) => v,
        // Only values are ever stored through this interface.
        Entry::Pointer(_) => 0,
    }
}

// ───────────────────────── lifetime ──────────────────────────────────── //

/// Create an array and store its handle in `*out`. A zero `chunk_shift`
/// and `tag_count` pick the configuration from the environment.
#[no_mangle]
pub extern "C" fn xarray_open(chunk_shift: u8, tag_count: u8, out: *mut HandleId) -> ErrorCode {
    if out.is_null() {
        return finish(ErrorCode::InvalidHandle);
    }
    let config = if chunk_shift == 0 && tag_count == 0 {
        try_c!(XArrayConfig::from_env().map_err(|e| map_error(&e)))
    } else {
        XArrayConfig::new().chunk_shift(chunk_shift).tag_count(tag_count)
    };
    let xa: ValueArray = try_c!(XArray::with_config(config).map_err(|e| map_error(&e)));
    let id = try_c!(register_handle(xa));
    unsafe { *out = id };
    finish(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn xarray_close(h: HandleId) -> ErrorCode {
    try_c!(unregister_handle(h));
    finish(ErrorCode::Success)
}

// ───────────────────────── CRUD ──────────────────────────────────────── //

/// Store `value` over `[index, index + 2^order)`.
#[no_mangle]
pub extern "C" fn xarray_store_value(h: HandleId, index: usize, order: u32, value: usize) -> ErrorCode {
    let res = try_c!(with_handle(h, |xa| xa.store_range(index, order, Some(Entry::Value(value)))));
    from_result(res.map(|_| ()))
}

/// `*out_found` tells whether `index` holds a value; `*out_value` gets it.
#[no_mangle]
pub extern "C" fn xarray_load_value(
    h: HandleId,
    index: usize,
    out_value: *mut usize,
    out_found: *mut bool,
) -> ErrorCode {
    if out_value.is_null() || out_found.is_null() {
        return finish(ErrorCode::InvalidHandle);
    }
    let entry = try_c!(with_handle(h, |xa| xa.load(index)));
    unsafe {
        *out_found = entry.is_some();
        *out_value = entry.map_or(0, value_of);
    }
    finish(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn xarray_erase(h: HandleId, index: usize) -> ErrorCode {
    let res = try_c!(with_handle(h, |xa| xa.erase(index)));
    from_result(res.map(|_| ()))
}

/// Like `xarray_store_value`, failing with `AlreadyOccupied` if any index
/// in the range holds a value.
#[no_mangle]
pub extern "C" fn xarray_insert_value(h: HandleId, index: usize, order: u32, value: usize) -> ErrorCode {
    let res = try_c!(with_handle(h, |xa| xa.insert_range(index, order, Entry::Value(value))));
    from_result(res)
}

// ───────────────────────── tags ──────────────────────────────────────── //

#[no_mangle]
pub extern "C" fn xarray_set_tag(h: HandleId, index: usize, tag: u32) -> ErrorCode {
    try_c!(with_handle(h, |xa| xa.set_tag(index, tag as usize)));
    finish(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn xarray_clear_tag(h: HandleId, index: usize, tag: u32) -> ErrorCode {
    try_c!(with_handle(h, |xa| xa.clear_tag(index, tag as usize)));
    finish(ErrorCode::Success)
}

#[no_mangle]
pub extern "C" fn xarray_get_tag(h: HandleId, index: usize, tag: u32, out: *mut bool) -> ErrorCode {
    if out.is_null() {
        return finish(ErrorCode::InvalidHandle);
    }
    let set = try_c!(with_handle(h, |xa| xa.get_tag(index, tag as usize)));
    unsafe { *out = set };
    finish(ErrorCode::Success)
}

// ───────────────────────── search ────────────────────────────────────── //

/// Find the first value at or after `*index` and at most `max`. A negative
/// `tag` matches any value; otherwise only values carrying that tag.
/// On success `*index` and `*out_value` are updated; `NotFound` otherwise.
#[no_mangle]
pub extern "C" fn xarray_find_value(
    h: HandleId,
    index: *mut usize,
    max: usize,
    tag: i32,
    out_value: *mut usize,
) -> ErrorCode {
    if index.is_null() || out_value.is_null() {
        return finish(ErrorCode::InvalidHandle);
    }
    let filter = if tag < 0 { Filter::Present } else { Filter::Tagged(tag as usize) };
    let mut at = unsafe { *index };
    let found = try_c!(with_handle(h, |xa| xa.find(&mut at, max, filter)));
    match found {
        Some(entry) => {
            unsafe {
                *index = at;
                *out_value = value_of(entry);
            }
            finish(ErrorCode::Success)
        }
        None => finish(ErrorCode::NotFound),
    }
}
