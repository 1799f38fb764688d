//! Shared setup for the relgraph benchmarks.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod utils;
