//! Framing and byte-level encodings for host links and log files.

pub mod cobs;
pub mod frame;
