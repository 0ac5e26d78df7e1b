use std::ffi::CStr;

use xarray_core::errors::{xarray_last_error, xarray_strerror};
use xarray_core::public_api::*;
use xarray_core::ErrorCode;

fn open() -> u64 {
    let mut h = 0u64;
    assert_eq!(xarray_open(6, 3, &mut h), ErrorCode::Success);
    assert_ne!(h, 0);
    h
}

fn load(h: u64, index: usize) -> Option<usize> {
    let mut value = 0usize;
    let mut found = false;
    assert_eq!(xarray_load_value(h, index, &mut value, &mut found), ErrorCode::Success);
    found.then_some(value)
}

#[test]
fn store_load_erase() {
    let h = open();
    assert_eq!(load(h, 10), None);
    assert_eq!(xarray_store_value(h, 10, 0, 77), ErrorCode::Success);
    assert_eq!(load(h, 10), Some(77));

    assert_eq!(xarray_store_value(h, 64, 3, 5), ErrorCode::Success);
    assert_eq!(load(h, 71), Some(5));
    assert_eq!(load(h, 72), None);

    assert_eq!(xarray_erase(h, 10), ErrorCode::Success);
    assert_eq!(load(h, 10), None);

    assert_eq!(xarray_store_value(h, 0, 64, 1), ErrorCode::IndexOutOfRange);
    assert_eq!(xarray_last_error(), ErrorCode::IndexOutOfRange);
    assert_eq!(xarray_store_value(h, 0, 0, usize::MAX), ErrorCode::ValueOutOfRange);

    assert_eq!(xarray_close(h), ErrorCode::Success);
}

#[test]
fn insert_reports_occupied() {
    let h = open();
    assert_eq!(xarray_insert_value(h, 8, 2, 3), ErrorCode::Success);
    assert_eq!(xarray_insert_value(h, 10, 0, 4), ErrorCode::AlreadyOccupied);
    assert_eq!(xarray_last_error(), ErrorCode::AlreadyOccupied);
    assert_eq!(xarray_insert_value(h, 12, 2, 4), ErrorCode::Success);
    assert_eq!(load(h, 13), Some(4));
    assert_eq!(xarray_close(h), ErrorCode::Success);
}

#[test]
fn tags_and_search() {
    let h = open();
    for i in [3usize, 40, 900] {
        assert_eq!(xarray_store_value(h, i, 0, i * 2), ErrorCode::Success);
    }
    assert_eq!(xarray_set_tag(h, 900, 1), ErrorCode::Success);

    let mut tagged = false;
    assert_eq!(xarray_get_tag(h, 900, 1, &mut tagged), ErrorCode::Success);
    assert!(tagged);
    assert_eq!(xarray_get_tag(h, 40, 1, &mut tagged), ErrorCode::Success);
    assert!(!tagged);

    let mut index = 4usize;
    let mut value = 0usize;
    assert_eq!(xarray_find_value(h, &mut index, usize::MAX, -1, &mut value), ErrorCode::Success);
    assert_eq!((index, value), (40, 80));

    index = 0;
    assert_eq!(xarray_find_value(h, &mut index, usize::MAX, 1, &mut value), ErrorCode::Success);
    assert_eq!((index, value), (900, 1800));

    assert_eq!(xarray_clear_tag(h, 900, 1), ErrorCode::Success);
    index = 0;
    assert_eq!(xarray_find_value(h, &mut index, usize::MAX, 1, &mut value), ErrorCode::NotFound);
    assert_eq!(index, 0);

    index = 901;
    assert_eq!(xarray_find_value(h, &mut index, usize::MAX, -1, &mut value), ErrorCode::NotFound);
    assert_eq!(xarray_close(h), ErrorCode::Success);
}

#[test]
fn closed_handles_are_rejected() {
    let h = open();
    assert_eq!(xarray_close(h), ErrorCode::Success);
    assert_eq!(xarray_close(h), ErrorCode::InvalidHandle);
    assert_eq!(xarray_store_value(h, 1, 0, 1), ErrorCode::InvalidHandle);
    assert_eq!(xarray_last_error(), ErrorCode::InvalidHandle);
    assert_eq!(xarray_erase(0, 1), ErrorCode::InvalidHandle);

    let mut out = 0u64;
    assert_eq!(xarray_open(9, 3, &mut out), ErrorCode::InvalidConfig);
    assert_eq!(xarray_open(6, 3, std::ptr::null_mut()), ErrorCode::InvalidHandle);
}

#[test]
fn strerror_is_nul_terminated() {
    let msg = unsafe { CStr::from_ptr(xarray_strerror(ErrorCode::AlreadyOccupied)) };
    assert_eq!(msg.to_str().unwrap(), "Already occupied");
    let msg = unsafe { CStr::from_ptr(xarray_strerror(ErrorCode::Success)) };
    assert_eq!(msg.to_str().unwrap(), ErrorCode::Success.as_str());
}
