use super::types::BloodType;
use sled::transaction::TransactionError;

#[derive(thiserror::Error, Debug)]
pub enum LedgerError {
    #[error("Insufficient {blood_type} stock: requested {requested}, available {available}")]
    InsufficientStock {
        blood_type: BloodType,
        requested: u32,
        available: u32,
    },
    #[error(
        "Fulfillment would exceed requested quantity: requested {requested}, provided {provided}, adding {additional}"
    )]
    OverAllocation {
        requested: u32,
        provided: u32,
        additional: u32,
    },
    #[error("Invalid reference: {0}")]
    InvalidReference(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),
    #[error("Invalid blood type: {0}")]
    InvalidBloodType(String),
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("Failed to encode record: {0}")]
    Encode(String),
    #[error("Failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
}

impl From<TransactionError<LedgerError>> for LedgerError {
    fn from(value: TransactionError<LedgerError>) -> Self {
        match value {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => LedgerError::Storage(e),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}
