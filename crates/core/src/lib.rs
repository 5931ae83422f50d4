//! `statsboard-core`: domain building blocks shared by the backfill crates.
//!
//! Pure types only (identifiers, errors, calendar ranges); no I/O.

pub mod date_range;
pub mod error;
pub mod id;

pub use date_range::{DateRange, ISO_DATE_FORMAT, format_iso_date, parse_iso_date};
pub use error::{DomainError, DomainResult};
pub use id::JobId;
