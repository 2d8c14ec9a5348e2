//! Service layer API for stock, donation and request workflows
use super::config::LedgerConfig;
use super::donation::{Donation, DonationStatus, NewDonation, Screening, TestResults};
use super::error::LedgerError;
use super::request::{Allocation, BloodRequest, NewRequest, RequestUpdate, derive_status};
use super::stock::{AlertKind, Movement, StockLedger, StockStatus};
use super::store::{OrAbort, Store, Tx, TxResult};
use super::types::{BloodType, Reference, TimeStamp};
use chrono::Utc;
use sled::transaction::ConflictableTransactionError;
use std::sync::Arc;
use tracing::{info, warn};

/// Units credited to the ledger per approved donation, whatever its volume.
pub const UNITS_PER_DONATION: u32 = 1;

/// An active alert with the ledger it was raised on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveAlert {
    pub blood_type: BloodType,
    pub alert_id: String,
    pub kind: AlertKind,
    pub message: String,
    pub created_at: TimeStamp<Utc>,
    pub current_stock: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StockSummary {
    pub blood_types: usize,
    pub available_units: u64,
    pub low_count: usize,
    pub critical_count: usize,
}

/// Result of a fulfillment: the updated request and the units issued by this call.
#[derive(Debug, Clone)]
pub struct FulfillmentOutcome {
    pub request: BloodRequest,
    pub units_issued: u32,
    pub percentage: u32,
}

pub struct BloodBankService {
    store: Store,
    config: LedgerConfig,
}

impl BloodBankService {
    pub fn new(instance: Arc<sled::Db>, config: LedgerConfig) -> Result<Self, LedgerError> {
        Ok(Self {
            store: Store::new(instance)?,
            config,
        })
    }

    /// Opens the database at `config.db_path`.
    pub fn open(config: LedgerConfig) -> Result<Self, LedgerError> {
        let db = sled::open(&config.db_path)?;
        Self::new(Arc::new(db), config)
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn flush(&self) -> Result<(), LedgerError> {
        self.store.db().flush()?;
        Ok(())
    }

    fn load_or_init(&self, tx: &Tx<'_>, blood_type: BloodType) -> TxResult<StockLedger> {
        tx.stock_or_init(
            blood_type,
            self.config.minimum_threshold,
            self.config.critical_threshold,
        )
    }

    /// Runs `op` on the ledger for `blood_type` and persists it atomically.
    fn mutate_stock(
        &self,
        blood_type: BloodType,
        op: impl Fn(&mut StockLedger) -> Result<(), LedgerError>,
    ) -> Result<StockLedger, LedgerError> {
        self.store.transaction(|tx| {
            let mut ledger = self.load_or_init(tx, blood_type)?;
            op(&mut ledger).or_abort()?;
            tx.put_stock(&ledger)?;
            Ok(ledger)
        })
    }

    // STOCK

    /// Creates every missing ledger with the configured thresholds.
    pub fn initialize_all(&self) -> Result<Vec<StockLedger>, LedgerError> {
        self.store.transaction(|tx| {
            let mut ledgers = Vec::with_capacity(BloodType::ALL.len());
            for blood_type in BloodType::ALL {
                let ledger = match tx.stock(blood_type)? {
                    Some(existing) => existing,
                    None => {
                        let ledger = self.load_or_init(tx, blood_type)?;
                        tx.put_stock(&ledger)?;
                        ledger
                    }
                };
                ledgers.push(ledger);
            }
            Ok(ledgers)
        })
    }

    /// Ledger for `blood_type`, created on first access.
    pub fn stock(&self, blood_type: BloodType) -> Result<StockLedger, LedgerError> {
        if let Some(ledger) = self.store.stock(blood_type)? {
            return Ok(ledger);
        }
        self.store.transaction(|tx| {
            let ledger = self.load_or_init(tx, blood_type)?;
            tx.put_stock(&ledger)?;
            Ok(ledger)
        })
    }

    /// All ledgers, initializing the full set when none exist yet.
    pub fn all_stock(&self) -> Result<Vec<StockLedger>, LedgerError> {
        let ledgers = self.store.all_stock()?;
        if ledgers.is_empty() {
            return self.initialize_all();
        }
        Ok(ledgers)
    }

    pub fn stock_by_status(&self, status: StockStatus) -> Result<Vec<StockLedger>, LedgerError> {
        Ok(self
            .all_stock()?
            .into_iter()
            .filter(|l| l.status() == status)
            .collect())
    }

    pub fn credit(
        &self,
        blood_type: BloodType,
        quantity: u32,
        reference: Reference,
        actor: &str,
    ) -> Result<StockLedger, LedgerError> {
        self.mutate_stock(blood_type, |ledger| {
            ledger.credit(quantity, reference.clone(), actor)
        })
    }

    pub fn debit(
        &self,
        blood_type: BloodType,
        quantity: u32,
        reference: Reference,
        actor: &str,
    ) -> Result<StockLedger, LedgerError> {
        self.mutate_stock(blood_type, |ledger| {
            ledger.debit(quantity, reference.clone(), actor)
        })
    }

    pub fn expire(
        &self,
        blood_type: BloodType,
        quantity: u32,
        actor: &str,
        note: Option<&str>,
    ) -> Result<StockLedger, LedgerError> {
        self.mutate_stock(blood_type, |ledger| ledger.expire(quantity, actor, note))
    }

    pub fn adjust(
        &self,
        blood_type: BloodType,
        new_available_units: u32,
        actor: &str,
        note: Option<&str>,
    ) -> Result<StockLedger, LedgerError> {
        self.mutate_stock(blood_type, |ledger| {
            ledger.adjust(new_available_units, actor, note);
            Ok(())
        })
    }

    pub fn set_thresholds(
        &self,
        blood_type: BloodType,
        minimum_threshold: u32,
        critical_threshold: u32,
    ) -> Result<StockLedger, LedgerError> {
        self.mutate_stock(blood_type, |ledger| {
            ledger.set_thresholds(minimum_threshold, critical_threshold);
            Ok(())
        })
    }

    /// Acknowledges an alert by id, whichever ledger raised it.
    pub fn acknowledge_alert(&self, alert_id: &str, actor: &str) -> Result<StockLedger, LedgerError> {
        let blood_type = self
            .store
            .all_stock()?
            .iter()
            .find(|ledger| ledger.alerts().iter().any(|a| a.id == alert_id))
            .map(|ledger| ledger.blood_type())
            .ok_or_else(|| LedgerError::NotFound(format!("alert {alert_id}")))?;
        let ledger = self.mutate_stock(blood_type, |ledger| ledger.acknowledge_alert(alert_id, actor))?;
        info!(alert_id, blood_type = %blood_type, actor, "Stock alert acknowledged");
        Ok(ledger)
    }

    /// Active alerts across all ledgers, newest first.
    pub fn active_alerts(&self) -> Result<Vec<ActiveAlert>, LedgerError> {
        let mut alerts: Vec<ActiveAlert> = self
            .store
            .all_stock()?
            .iter()
            .flat_map(|ledger| {
                ledger.active_alerts().map(|alert| ActiveAlert {
                    blood_type: ledger.blood_type(),
                    alert_id: alert.id.clone(),
                    kind: alert.kind,
                    message: alert.message.clone(),
                    created_at: alert.created_at.clone(),
                    current_stock: ledger.available_units(),
                })
            })
            .collect();
        alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(alerts)
    }

    pub fn summary(&self) -> Result<StockSummary, LedgerError> {
        let ledgers = self.all_stock()?;
        Ok(ledgers
            .iter()
            .fold(StockSummary::default(), |mut summary, ledger| {
                summary.blood_types += 1;
                summary.available_units += u64::from(ledger.available_units());
                match ledger.status() {
                    StockStatus::Low => summary.low_count += 1,
                    StockStatus::Critical => summary.critical_count += 1,
                    StockStatus::Adequate | StockStatus::Good => {}
                }
                summary
            }))
    }

    /// Newest-first page of a ledger's movements, sized by the config.
    pub fn history(&self, blood_type: BloodType, page: usize) -> Result<Vec<Movement>, LedgerError> {
        let ledger = self.stock(blood_type)?;
        Ok(ledger
            .history_page(page, self.config.history_page_size)
            .into_iter()
            .cloned()
            .collect())
    }

    // DONATIONS

    pub fn register_donation(&self, new: NewDonation) -> Result<Donation, LedgerError> {
        let donation = Donation::register(new, self.config.donation_shelf_life_days)?;
        self.store.transaction(|tx| tx.put_donation(&donation))?;
        info!(donation_id = %donation.id, blood_type = %donation.blood_type, "Donation registered");
        Ok(donation)
    }

    pub fn donation(&self, donation_id: &str) -> Result<Donation, LedgerError> {
        self.store
            .donation(donation_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("donation {donation_id}")))
    }

    /// Records screening data. A pending donation whose tests all come back
    /// negative with hemoglobin recorded is approved and credited.
    pub fn record_screening(
        &self,
        donation_id: &str,
        screening: Screening,
        test_results: TestResults,
        actor: &str,
    ) -> Result<Donation, LedgerError> {
        screening.validate()?;
        let now = TimeStamp::new();
        let donation = self.store.transaction(|tx| {
            let mut donation = load_donation(tx, donation_id)?;
            donation.screening = screening;
            donation.test_results = test_results;
            let approved = donation.refresh(&now, actor);
            tx.put_donation(&donation)?;
            Ok((donation, approved))
        })?;

        match donation {
            (donation, true) => {
                info!(donation_id, "Donation approved by screening");
                self.credit_for_donation(&donation, actor);
                Ok(donation)
            }
            (donation, false) => Ok(donation),
        }
    }

    /// Approves a pending donation and credits one unit to its ledger.
    pub fn approve_donation(
        &self,
        donation_id: &str,
        approver: &str,
    ) -> Result<Donation, LedgerError> {
        let now = TimeStamp::new();
        let donation = self.store.transaction(|tx| {
            let mut donation = load_donation(tx, donation_id)?;
            donation.approve(approver, &now).or_abort()?;
            tx.put_donation(&donation)?;
            Ok(donation)
        })?;

        info!(donation_id, approver, "Donation approved");
        self.credit_for_donation(&donation, approver);
        Ok(donation)
    }

    pub fn reject_donation(
        &self,
        donation_id: &str,
        reason: &str,
    ) -> Result<Donation, LedgerError> {
        self.store.transaction(|tx| {
            let mut donation = load_donation(tx, donation_id)?;
            donation.reject(reason).or_abort()?;
            tx.put_donation(&donation)?;
            Ok(donation)
        })
    }

    // The donation record is the source of truth; a failed credit is logged, not raised.
    fn credit_for_donation(&self, donation: &Donation, actor: &str) {
        let res = self.credit(
            donation.blood_type,
            UNITS_PER_DONATION,
            Reference::donation(donation.id.clone()),
            actor,
        );
        if let Err(e) = res {
            warn!(
                donation_id = %donation.id,
                blood_type = %donation.blood_type,
                error = %e,
                "Failed to credit stock for approved donation"
            );
        }
    }

    // REQUESTS

    /// Files a request. A requester may hold only one open request per blood type.
    pub fn submit_request(&self, new: NewRequest) -> Result<BloodRequest, LedgerError> {
        let now = TimeStamp::new();
        let request = BloodRequest::submit(new, &now)?;
        let duplicate = self.store.all_requests()?.into_iter().find(|r| {
            r.requester == request.requester
                && r.blood_type == request.blood_type
                && derive_status(r, &now).is_open()
        });
        if let Some(existing) = duplicate {
            return Err(LedgerError::InvalidState(format!(
                "{} already has open request {} for {}",
                request.requester, existing.id, request.blood_type
            )));
        }
        let request = self.store.transaction(|tx| {
            let mut request = request.clone();
            tx.put_request(&mut request, &now)?;
            Ok(request)
        })?;
        info!(
            request_id = %request.id,
            blood_type = %request.blood_type,
            quantity = request.requested_quantity(),
            priority = request.priority(),
            "Blood request submitted"
        );
        Ok(request)
    }

    /// Request with status and priority evaluated at the current time.
    pub fn request(&self, request_id: &str) -> Result<BloodRequest, LedgerError> {
        let mut request = self
            .store
            .request(request_id)?
            .ok_or_else(|| LedgerError::NotFound(format!("blood request {request_id}")))?;
        request.refresh(&TimeStamp::new());
        Ok(request)
    }

    /// Persists time-based expiry and the current priority.
    pub fn refresh_request(&self, request_id: &str) -> Result<BloodRequest, LedgerError> {
        let now = TimeStamp::new();
        self.store.transaction(|tx| {
            let mut request = tx.request(request_id)?;
            tx.put_request(&mut request, &now)?;
            Ok(request)
        })
    }

    pub fn approve_request(
        &self,
        request_id: &str,
        approver: &str,
    ) -> Result<BloodRequest, LedgerError> {
        let now = TimeStamp::new();
        self.store.transaction(|tx| {
            let mut request = tx.request(request_id)?;
            request.approve(approver, &now).or_abort()?;
            tx.put_request(&mut request, &now)?;
            Ok(request)
        })
    }

    /// Changes urgency or deadline of a pending request.
    pub fn update_request(
        &self,
        request_id: &str,
        update: RequestUpdate,
    ) -> Result<BloodRequest, LedgerError> {
        let now = TimeStamp::new();
        let request = self.store.transaction(|tx| {
            let mut request = tx.request(request_id)?;
            request.update(update.clone(), &now).or_abort()?;
            tx.put_request(&mut request, &now)?;
            Ok(request)
        })?;
        info!(request_id, priority = request.priority(), "Blood request updated");
        Ok(request)
    }

    pub fn reject_request(
        &self,
        request_id: &str,
        reason: &str,
    ) -> Result<BloodRequest, LedgerError> {
        let now = TimeStamp::new();
        self.store.transaction(|tx| {
            let mut request = tx.request(request_id)?;
            request.reject(reason, &now).or_abort()?;
            tx.put_request(&mut request, &now)?;
            Ok(request)
        })
    }

    /// Allocates approved donations to a request and issues the units from stock.
    ///
    /// The request update, the ledger debit and the history entry commit
    /// together; any failure leaves request and ledger untouched.
    pub fn fulfill_request(
        &self,
        request_id: &str,
        allocations: &[Allocation],
        actor: &str,
    ) -> Result<FulfillmentOutcome, LedgerError> {
        let now = TimeStamp::new();
        let (request, units_issued) = self.store.transaction(|tx| {
            let mut request = tx.request(request_id)?;
            request.check_allocation(allocations, &now).or_abort()?;

            for allocation in allocations {
                let donation = tx.donation(&allocation.donation_id)?;
                check_donation(&request, &allocation.donation_id, donation.as_ref(), &now)?;
            }

            let units = request.fulfill(allocations, &now).or_abort()?;
            let mut ledger = self.load_or_init(tx, request.blood_type)?;
            ledger
                .debit(units, Reference::blood_request(request.id.clone()), actor)
                .or_abort()?;

            tx.put_stock(&ledger)?;
            tx.put_request(&mut request, &now)?;
            Ok((request, units))
        })?;

        info!(
            request_id,
            units_issued,
            status = ?request.status(),
            "Blood request fulfilled"
        );
        let percentage = request.fulfillment().percentage();
        Ok(FulfillmentOutcome {
            request,
            units_issued,
            percentage,
        })
    }

    /// Convenience over [`BloodBankService::fulfill_request`] taking parallel lists.
    pub fn fulfill(
        &self,
        request_id: &str,
        donation_ids: &[String],
        units: &[u32],
        actor: &str,
    ) -> Result<FulfillmentOutcome, LedgerError> {
        let allocations = Allocation::pair(donation_ids, units)?;
        self.fulfill_request(request_id, &allocations, actor)
    }

    /// Open requests ordered by priority, highest first, then oldest first.
    pub fn queue(&self) -> Result<Vec<BloodRequest>, LedgerError> {
        let now = TimeStamp::new();
        let mut open: Vec<BloodRequest> = self
            .store
            .all_requests()?
            .into_iter()
            .map(|mut r| {
                r.refresh(&now);
                r
            })
            .filter(|r| r.status().is_open())
            .collect();
        open.sort_by(|a, b| {
            b.priority()
                .cmp(&a.priority())
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(open)
    }
}

fn load_donation(tx: &Tx<'_>, donation_id: &str) -> TxResult<Donation> {
    tx.donation(donation_id)?.ok_or_else(|| {
        ConflictableTransactionError::Abort(LedgerError::NotFound(format!(
            "donation {donation_id}"
        )))
    })
}

fn check_donation(
    request: &BloodRequest,
    donation_id: &str,
    donation: Option<&Donation>,
    now: &TimeStamp<Utc>,
) -> TxResult<()> {
    let invalid = |why: String| ConflictableTransactionError::Abort(LedgerError::InvalidReference(why));

    let donation = donation.ok_or_else(|| invalid(format!("donation {donation_id} not found")))?;
    if donation.blood_type != request.blood_type {
        return Err(invalid(format!(
            "donation {donation_id} is {} but request {} needs {}",
            donation.blood_type, request.id, request.blood_type
        )));
    }
    let status = donation.derive_status(now);
    if status != DonationStatus::Approved {
        return Err(invalid(format!(
            "donation {donation_id} is {status:?}, not approved"
        )));
    }
    Ok(())
}
