//! Report layer: event ledger, destinations, summary rendering and mail.

pub mod aggregator;
pub mod destinations;
pub mod generator;
pub mod ledger;
pub mod mail;

pub use aggregator::{CycleReport, ReportSettings, Reporter};
pub use destinations::Destinations;
pub use mail::{Mailer, SendmailMailer};

/// Timestamp format used in report file names and banners.
pub const TIMESTAMP_FORMAT: &str = "%Y_%m_%d_%H:%M:%S";
