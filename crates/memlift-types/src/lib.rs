//! Core types for the memlift agent memory migration engine.
//!
//! This crate defines the data model shared by the client, migration and CLI
//! crates: memory records, the snapshot aggregate, section checksums, the
//! error taxonomy and the run configuration. It contains no I/O.

pub mod checksum;
pub mod config;
pub mod error;
pub mod memory;
pub mod snapshot;
