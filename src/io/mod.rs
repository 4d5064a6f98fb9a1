//! I/O module
//!
//! Handles CSV output for account reports.
//!
//! # Components
//!
//! - `csv_format` - Account snapshot serialization

pub mod csv_format;

pub use csv_format::write_accounts_csv;
