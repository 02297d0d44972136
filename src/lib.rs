#![cfg_attr(
    feature = "nightly",
    feature(core_intrinsics, ptr_offset_from, dropck_eyepatch)
)]

/// Crate Errors
pub mod error;
/// The Table Engine
pub mod map;

/// Set of compiler hints
mod hint;

pub use crate::error::{MapError, Result};
pub use crate::map::{DefaultHashBuilder, Iter, Scan, TagMap};
