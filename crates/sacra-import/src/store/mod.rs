//! Record and job store implementations
//!
//! [`postgres`] is the production backend. [`memory`] keeps everything in
//! process and backs the test suite.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryJobStore, MemoryRecordStore, StoredRecord};
pub use postgres::{PgJobStore, PgRecordStore};
