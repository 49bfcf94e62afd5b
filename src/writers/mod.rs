//! Persistence of named float and bool arrays, such as computed features,
//! targets and masks.
//!
//! # Format
//!
//! ```text
//! [8 bytes] header length (little-endian u64)
//! [header length bytes] JSON header { "name", "dtype", "shape" }
//! [payload] float32 little-endian values, or one byte per bool
//! ```
//!
//! Records are written back to back; a stream ends at a record boundary.

mod array_record;

pub use array_record::{ArrayData, ArrayRecord, ArrayRecordReader, ArrayRecordWriter, DType};
