//! Snapshot parsing: post containers to records, and time text to
//! normalized timestamps.

pub mod extract;
pub mod time;
