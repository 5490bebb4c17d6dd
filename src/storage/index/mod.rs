#![forbid(unsafe_code)]

//! Forward and reverse attribute indexes.

mod attr;
mod manager;
mod scan;
mod types;

pub use attr::{AttributeEntries, Posting};
pub use manager::{
    validate_attribute_name, AttributeGuard, AttributeLadder, IndexManager,
};
pub use scan::OrderedScan;
pub use types::{difference_sorted, intersect_sorted, union_sorted, PostingStream, ScanDirection};
