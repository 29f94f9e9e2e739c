//! Integration test crate for the WatchDog hub. All content lives in
//! `tests/`.
