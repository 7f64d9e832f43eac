//! Warden Threat Scanner
//!
//! Stateless indicator-of-compromise lookups against a local indexed
//! threat database.
//!
//! Architecture:
//! 1. Feed sync (external) delivers raw indicator records out-of-band
//! 2. `ThreatScanner::replace`/`merge` build an immutable `ThreatDb` and
//!    swap it in; in-flight lookups keep the old snapshot
//! 3. `lookup()` is on the inline decision path: bloom-filter negative
//!    cache first, then hash/prefix indexes - never network I/O

mod indicator;
mod feed;
mod db;
mod scanner;

pub use indicator::{IndicatorType, Severity, ThreatMatch};
pub use feed::{FeedError, FeedRecord, load_feed};
pub use db::ThreatDb;
pub use scanner::{ScanError, ThreatScanner};
