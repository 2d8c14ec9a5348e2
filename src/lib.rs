//! Blood stock ledger and request fulfillment bookkeeping.
//!
//! One [`stock::StockLedger`] per blood type tracks available, total, used and
//! expired units with an append-only movement history and threshold alerts.
//! Requests accumulate fulfillment against their requested quantity, and the
//! [`service::BloodBankService`] ties donations, requests and ledgers together
//! over a sled database.

pub mod config;
pub mod donation;
pub mod error;
pub mod request;
pub mod service;
pub mod stock;
pub mod store;
pub mod telemetry;
pub mod types;
pub mod utils;

pub use error::{ConfigError, LedgerError};
pub use service::BloodBankService;
pub use types::{BloodType, Reference, ReferenceKind, TimeStamp};
