//! sled persistence for ledgers, requests and donations.
//!
//! Each record type lives in its own tree and is stored as CBOR. Mutations go
//! through [`Store::transaction`], which runs the closure inside a sled
//! transaction spanning all three trees: a read-modify-write of a ledger is
//! retried on conflict instead of silently overwriting a concurrent update.
use super::donation::Donation;
use super::error::LedgerError;
use super::request::BloodRequest;
use super::stock::StockLedger;
use super::types::{BloodType, TimeStamp};
use chrono::Utc;
use sled::Transactional;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionalTree,
};
use std::sync::Arc;

const STOCK_TREE: &str = "stock";
const REQUESTS_TREE: &str = "requests";
const DONATIONS_TREE: &str = "donations";

pub type TxResult<T> = ConflictableTransactionResult<T, LedgerError>;

/// Lifts a domain result into a transaction result, aborting on error.
pub trait OrAbort<T> {
    fn or_abort(self) -> TxResult<T>;
}

impl<T> OrAbort<T> for Result<T, LedgerError> {
    fn or_abort(self) -> TxResult<T> {
        self.map_err(ConflictableTransactionError::Abort)
    }
}

pub struct Store {
    instance: Arc<sled::Db>,
    stock: sled::Tree,
    requests: sled::Tree,
    donations: sled::Tree,
}

impl Store {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, LedgerError> {
        let stock = instance.open_tree(STOCK_TREE)?;
        let requests = instance.open_tree(REQUESTS_TREE)?;
        let donations = instance.open_tree(DONATIONS_TREE)?;
        Ok(Self {
            instance,
            stock,
            requests,
            donations,
        })
    }

    pub fn db(&self) -> &Arc<sled::Db> {
        &self.instance
    }

    pub fn stock(&self, blood_type: BloodType) -> Result<Option<StockLedger>, LedgerError> {
        self.stock
            .get(blood_type.code().as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// All ledgers in blood type order.
    pub fn all_stock(&self) -> Result<Vec<StockLedger>, LedgerError> {
        let mut ledgers = self
            .stock
            .iter()
            .values()
            .map(|bytes| decode::<StockLedger>(&bytes?))
            .collect::<Result<Vec<_>, _>>()?;
        ledgers.sort_by_key(|l| l.blood_type());
        Ok(ledgers)
    }

    pub fn request(&self, id: &str) -> Result<Option<BloodRequest>, LedgerError> {
        self.requests
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    pub fn all_requests(&self) -> Result<Vec<BloodRequest>, LedgerError> {
        self.requests
            .iter()
            .values()
            .map(|bytes| decode::<BloodRequest>(&bytes?))
            .collect()
    }

    pub fn donation(&self, id: &str) -> Result<Option<Donation>, LedgerError> {
        self.donations
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Runs `f` atomically over all record trees. `f` may run more than once.
    pub fn transaction<A>(&self, f: impl Fn(&Tx<'_>) -> TxResult<A>) -> Result<A, LedgerError> {
        let res = (&self.stock, &self.requests, &self.donations).transaction(
            |(stock, requests, donations)| {
                let tx = Tx {
                    stock,
                    requests,
                    donations,
                };
                f(&tx)
            },
        );
        Ok(res?)
    }
}

/// Typed view over the trees inside a running transaction.
pub struct Tx<'a> {
    stock: &'a TransactionalTree,
    requests: &'a TransactionalTree,
    donations: &'a TransactionalTree,
}

impl Tx<'_> {
    pub fn stock(&self, blood_type: BloodType) -> TxResult<Option<StockLedger>> {
        match self.stock.get(blood_type.code().as_bytes())? {
            Some(bytes) => decode(&bytes).or_abort().map(Some),
            None => Ok(None),
        }
    }

    /// Loads the ledger, creating it with the given thresholds on first access.
    pub fn stock_or_init(
        &self,
        blood_type: BloodType,
        minimum_threshold: u32,
        critical_threshold: u32,
    ) -> TxResult<StockLedger> {
        Ok(self.stock(blood_type)?.unwrap_or_else(|| {
            StockLedger::new(blood_type, minimum_threshold, critical_threshold)
        }))
    }

    pub fn put_stock(&self, ledger: &StockLedger) -> TxResult<()> {
        let bytes = encode(ledger).or_abort()?;
        self.stock
            .insert(ledger.blood_type().code().as_bytes(), bytes)?;
        Ok(())
    }

    pub fn request(&self, id: &str) -> TxResult<BloodRequest> {
        match self.requests.get(id.as_bytes())? {
            Some(bytes) => decode(&bytes).or_abort(),
            None => Err(ConflictableTransactionError::Abort(LedgerError::NotFound(
                format!("blood request {id}"),
            ))),
        }
    }

    /// Refreshes derived status and priority, then writes the request.
    pub fn put_request(&self, request: &mut BloodRequest, now: &TimeStamp<Utc>) -> TxResult<()> {
        request.refresh(now);
        let bytes = encode(&*request).or_abort()?;
        self.requests.insert(request.id.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn donation(&self, id: &str) -> TxResult<Option<Donation>> {
        match self.donations.get(id.as_bytes())? {
            Some(bytes) => decode(&bytes).or_abort().map(Some),
            None => Ok(None),
        }
    }

    pub fn put_donation(&self, donation: &Donation) -> TxResult<()> {
        let bytes = encode(donation).or_abort()?;
        self.donations.insert(donation.id.as_bytes(), bytes)?;
        Ok(())
    }
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>, LedgerError> {
    minicbor::to_vec(value).map_err(|e| LedgerError::Encode(e.to_string()))
}

fn decode<T>(bytes: &[u8]) -> Result<T, LedgerError>
where
    T: for<'b> minicbor::Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}
