//! Per blood type stock ledger.
//!
//! A [`StockLedger`] holds the unit counts for one blood type, the thresholds
//! that drive its alerts and an append-only movement history. Every mutation
//! appends exactly one [`Movement`] and re-normalizes the counts before the
//! record is handed back to the store.
use super::error::LedgerError;
use super::types::{BloodType, Reference, TimeStamp};
use super::utils::{ALERT_HRP, record_id};
use chrono::Utc;
use tracing::{debug, info, warn};

pub const DEFAULT_MINIMUM_THRESHOLD: u32 = 10;
pub const DEFAULT_CRITICAL_THRESHOLD: u32 = 5;

const EXPIRED_NOTE: &str = "Expired units removed";
const ADJUSTMENT_NOTE: &str = "Manual stock adjustment";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementAction {
    /// Units added from an approved donation
    #[n(0)]
    Credit,
    /// Units issued against a blood request
    #[n(1)]
    Debit,
    #[n(2)]
    Expire,
    #[n(3)]
    Adjust,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Movement {
    #[n(0)]
    pub at: TimeStamp<Utc>,
    #[n(1)]
    pub action: MovementAction,
    #[n(2)]
    pub delta: i64, // always balance_after - balance_before
    #[n(3)]
    pub balance_before: u32,
    #[n(4)]
    pub balance_after: u32,
    #[n(5)]
    pub reference: Option<Reference>,
    #[n(6)]
    pub actor: String,
    #[n(7)]
    pub note: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    #[n(0)]
    Low,
    #[n(1)]
    Critical,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub kind: AlertKind,
    #[n(2)]
    pub message: String,
    #[n(3)]
    pub active: bool,
    #[n(4)]
    pub created_at: TimeStamp<Utc>,
    #[n(5)]
    pub acknowledged_by: Option<String>,
    #[n(6)]
    pub acknowledged_at: Option<TimeStamp<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockStatus {
    Critical,
    Low,
    Adequate,
    Good,
}

impl StockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StockStatus::Critical => "critical",
            StockStatus::Low => "low",
            StockStatus::Adequate => "adequate",
            StockStatus::Good => "good",
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct StockLedger {
    #[n(0)]
    blood_type: BloodType,
    #[n(1)]
    total_units: u32,
    #[n(2)]
    available_units: u32,
    #[n(3)]
    used_units: u32,
    #[n(4)]
    expired_units: u32,
    #[n(5)]
    minimum_threshold: u32,
    #[n(6)]
    critical_threshold: u32,
    #[n(7)]
    history: Vec<Movement>,
    #[n(8)]
    alerts: Vec<Alert>,
    #[n(9)]
    last_updated: TimeStamp<Utc>,
    #[n(10)]
    last_donation_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    last_issued_at: Option<TimeStamp<Utc>>,
}

impl StockLedger {
    pub fn new(blood_type: BloodType, minimum_threshold: u32, critical_threshold: u32) -> Self {
        let mut ledger = Self {
            blood_type,
            total_units: 0,
            available_units: 0,
            used_units: 0,
            expired_units: 0,
            minimum_threshold,
            critical_threshold,
            history: vec![],
            alerts: vec![],
            last_updated: TimeStamp::new(),
            last_donation_at: None,
            last_issued_at: None,
        };
        ledger.normalize();
        ledger
    }

    pub fn blood_type(&self) -> BloodType {
        self.blood_type
    }
    pub fn total_units(&self) -> u32 {
        self.total_units
    }
    pub fn available_units(&self) -> u32 {
        self.available_units
    }
    pub fn used_units(&self) -> u32 {
        self.used_units
    }
    pub fn expired_units(&self) -> u32 {
        self.expired_units
    }
    pub fn minimum_threshold(&self) -> u32 {
        self.minimum_threshold
    }
    pub fn critical_threshold(&self) -> u32 {
        self.critical_threshold
    }
    pub fn history(&self) -> &[Movement] {
        &self.history
    }
    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }
    pub fn last_updated(&self) -> &TimeStamp<Utc> {
        &self.last_updated
    }
    pub fn last_donation_at(&self) -> Option<&TimeStamp<Utc>> {
        self.last_donation_at.as_ref()
    }
    pub fn last_issued_at(&self) -> Option<&TimeStamp<Utc>> {
        self.last_issued_at.as_ref()
    }

    /// Adds donated units. Clears low/critical alerts once stock is back above the minimum.
    pub fn credit(
        &mut self,
        quantity: u32,
        reference: Reference,
        actor: &str,
    ) -> Result<(), LedgerError> {
        require_positive(quantity)?;
        let before = self.available_units;
        let available = before
            .checked_add(quantity)
            .ok_or_else(|| LedgerError::InvalidQuantity(format!("{quantity} overflows stock")))?;
        let total = self
            .total_units
            .checked_add(quantity)
            .ok_or_else(|| LedgerError::InvalidQuantity(format!("{quantity} overflows stock")))?;

        self.available_units = available;
        self.total_units = total;
        let now = TimeStamp::new();
        self.last_donation_at = Some(now.clone());
        self.record(
            now,
            MovementAction::Credit,
            before,
            Some(reference),
            actor,
            None,
        );

        if self.available_units > self.minimum_threshold {
            self.deactivate_stock_alerts();
        }
        self.normalize();

        info!(
            blood_type = %self.blood_type,
            quantity,
            available = self.available_units,
            "Stock credited"
        );
        Ok(())
    }

    /// Issues units. Never partial: fails without touching the ledger when stock is short.
    pub fn debit(
        &mut self,
        quantity: u32,
        reference: Reference,
        actor: &str,
    ) -> Result<(), LedgerError> {
        require_positive(quantity)?;
        if self.available_units < quantity {
            return Err(LedgerError::InsufficientStock {
                blood_type: self.blood_type,
                requested: quantity,
                available: self.available_units,
            });
        }

        let before = self.available_units;
        self.available_units -= quantity;
        self.used_units = self.used_units.saturating_add(quantity);
        let now = TimeStamp::new();
        self.last_issued_at = Some(now.clone());
        self.record(
            now,
            MovementAction::Debit,
            before,
            Some(reference),
            actor,
            None,
        );
        self.evaluate_alerts();
        self.normalize();

        info!(
            blood_type = %self.blood_type,
            quantity,
            available = self.available_units,
            "Stock debited"
        );
        Ok(())
    }

    /// Removes expired units, clamping the available count at zero.
    pub fn expire(
        &mut self,
        quantity: u32,
        actor: &str,
        note: Option<&str>,
    ) -> Result<(), LedgerError> {
        require_positive(quantity)?;
        let before = self.available_units;
        self.available_units = before.saturating_sub(quantity);
        self.expired_units = self.expired_units.saturating_add(quantity);
        self.record(
            TimeStamp::new(),
            MovementAction::Expire,
            before,
            None,
            actor,
            Some(note.unwrap_or(EXPIRED_NOTE).to_string()),
        );
        self.evaluate_alerts();
        self.normalize();

        info!(
            blood_type = %self.blood_type,
            quantity,
            available = self.available_units,
            "Expired units removed"
        );
        Ok(())
    }

    /// Sets the available count absolutely. Total units move by the same delta.
    pub fn adjust(&mut self, new_available_units: u32, actor: &str, note: Option<&str>) {
        let before = self.available_units;
        let delta = i64::from(new_available_units) - i64::from(before);
        // total >= available before the call, so total + delta >= new_available >= 0
        let total = (i64::from(self.total_units) + delta).clamp(0, i64::from(u32::MAX));

        self.available_units = new_available_units;
        self.total_units = total as u32;
        self.record(
            TimeStamp::new(),
            MovementAction::Adjust,
            before,
            None,
            actor,
            Some(note.unwrap_or(ADJUSTMENT_NOTE).to_string()),
        );
        self.evaluate_alerts();
        self.normalize();

        info!(
            blood_type = %self.blood_type,
            delta,
            available = self.available_units,
            "Stock adjusted"
        );
    }

    /// Replaces the alert state: every active stock alert is deactivated and at
    /// most one new alert matching [`StockLedger::status`] is raised.
    pub fn evaluate_alerts(&mut self) -> Option<AlertKind> {
        self.deactivate_stock_alerts();

        let kind = match self.status() {
            StockStatus::Critical => AlertKind::Critical,
            StockStatus::Low => AlertKind::Low,
            StockStatus::Adequate | StockStatus::Good => return None,
        };
        let message = match kind {
            AlertKind::Critical => format!(
                "Critical stock alert: Only {} units of {} blood remaining",
                self.available_units, self.blood_type
            ),
            AlertKind::Low => format!(
                "Low stock alert: Only {} units of {} blood remaining",
                self.available_units, self.blood_type
            ),
        };

        warn!(blood_type = %self.blood_type, ?kind, available = self.available_units, "Stock alert raised");
        self.alerts.push(Alert {
            id: record_id(ALERT_HRP),
            kind,
            message,
            active: true,
            created_at: TimeStamp::new(),
            acknowledged_by: None,
            acknowledged_at: None,
        });
        Some(kind)
    }

    pub fn status(&self) -> StockStatus {
        if self.available_units <= self.critical_threshold {
            StockStatus::Critical
        } else if self.available_units <= self.minimum_threshold {
            StockStatus::Low
        } else if u64::from(self.available_units) > 2 * u64::from(self.minimum_threshold) {
            StockStatus::Good
        } else {
            StockStatus::Adequate
        }
    }

    pub fn set_thresholds(&mut self, minimum_threshold: u32, critical_threshold: u32) {
        self.minimum_threshold = minimum_threshold;
        self.critical_threshold = critical_threshold;
        self.normalize();
        self.evaluate_alerts();
        debug!(
            blood_type = %self.blood_type,
            minimum = self.minimum_threshold,
            critical = self.critical_threshold,
            "Thresholds updated"
        );
    }

    pub fn acknowledge_alert(&mut self, alert_id: &str, actor: &str) -> Result<(), LedgerError> {
        let alert = self
            .alerts
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| LedgerError::NotFound(format!("alert {alert_id}")))?;

        alert.active = false;
        alert.acknowledged_by = Some(actor.to_string());
        alert.acknowledged_at = Some(TimeStamp::new());
        self.last_updated = TimeStamp::new();
        Ok(())
    }

    pub fn active_alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.iter().filter(|a| a.active)
    }

    /// Percentage of all units ever held that were issued.
    pub fn utilization_rate(&self) -> u32 {
        percentage(self.used_units, self.total_units)
    }

    pub fn expiry_rate(&self) -> u32 {
        percentage(self.expired_units, self.total_units)
    }

    /// Newest-first page of the movement history.
    pub fn history_page(&self, page: usize, page_size: usize) -> Vec<&Movement> {
        self.history
            .iter()
            .rev()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .collect()
    }

    /// Re-establishes the record invariants: available never exceeds total and
    /// critical stays below minimum.
    pub fn normalize(&mut self) {
        if self.available_units > self.total_units {
            self.total_units = self.available_units;
        }
        if self.critical_threshold >= self.minimum_threshold {
            self.critical_threshold = self.minimum_threshold.saturating_sub(1);
        }
        self.last_updated = TimeStamp::new();
    }

    fn deactivate_stock_alerts(&mut self) {
        self.alerts
            .iter_mut()
            .filter(|a| a.active)
            .for_each(|a| a.active = false);
    }

    fn record(
        &mut self,
        at: TimeStamp<Utc>,
        action: MovementAction,
        balance_before: u32,
        reference: Option<Reference>,
        actor: &str,
        note: Option<String>,
    ) {
        self.history.push(Movement {
            at,
            action,
            delta: i64::from(self.available_units) - i64::from(balance_before),
            balance_before,
            balance_after: self.available_units,
            reference,
            actor: actor.to_string(),
            note,
        });
    }
}

fn require_positive(quantity: u32) -> Result<(), LedgerError> {
    if quantity == 0 {
        return Err(LedgerError::InvalidQuantity(
            "quantity must be at least 1 unit".into(),
        ));
    }
    Ok(())
}

fn percentage(part: u32, whole: u32) -> u32 {
    if whole == 0 {
        return 0;
    }
    ((f64::from(part) / f64::from(whole)) * 100.0).round() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(available: u32) -> StockLedger {
        let mut ledger = StockLedger::new(BloodType::OPositive, 10, 5);
        if available > 0 {
            ledger
                .credit(available, Reference::donation("don_seed"), "user_admin")
                .unwrap();
        }
        ledger
    }

    #[test]
    fn credit_increases_available_and_total() {
        let ledger = ledger_with(12);

        assert_eq!(ledger.available_units(), 12);
        assert_eq!(ledger.total_units(), 12);
        assert_eq!(ledger.history().len(), 1);
        assert_eq!(ledger.history()[0].action, MovementAction::Credit);
        assert!(ledger.last_donation_at().is_some());
    }

    #[test]
    fn zero_quantity_is_rejected() {
        let mut ledger = ledger_with(3);
        let res = ledger.credit(0, Reference::donation("don_x"), "user_admin");

        assert!(matches!(res, Err(LedgerError::InvalidQuantity(_))));
        assert_eq!(ledger.history().len(), 1);
    }

    #[test]
    fn debit_beyond_available_leaves_ledger_untouched() {
        let mut ledger = ledger_with(3);
        let snapshot = ledger.clone();

        let res = ledger.debit(4, Reference::blood_request("req_x"), "user_admin");

        assert!(matches!(
            res,
            Err(LedgerError::InsufficientStock {
                requested: 4,
                available: 3,
                ..
            })
        ));
        assert_eq!(ledger.available_units(), snapshot.available_units());
        assert_eq!(ledger.history().len(), snapshot.history().len());
    }

    #[test]
    fn expire_clamps_at_zero() {
        let mut ledger = ledger_with(2);
        ledger.expire(5, "user_admin", None).unwrap();

        assert_eq!(ledger.available_units(), 0);
        assert_eq!(ledger.expired_units(), 5);
        let last = ledger.history().last().unwrap();
        assert_eq!(last.delta, -2);
        assert_eq!(last.note.as_deref(), Some(EXPIRED_NOTE));
    }

    #[test]
    fn credit_past_counter_range_is_refused() {
        let mut ledger = ledger_with(0);
        ledger.adjust(u32::MAX, "user_admin", None);
        let snapshot = ledger.clone();

        let res = ledger.credit(1, Reference::donation("don_x"), "user_admin");

        assert!(matches!(res, Err(LedgerError::InvalidQuantity(_))));
        assert_eq!(ledger, snapshot);
    }

    #[test]
    fn adjust_moves_total_by_delta() {
        let mut ledger = ledger_with(20);
        ledger
            .debit(5, Reference::blood_request("req_x"), "user_admin")
            .unwrap();
        ledger.adjust(10, "user_admin", Some("recount"));

        assert_eq!(ledger.available_units(), 10);
        assert_eq!(ledger.total_units(), 15);
        assert_eq!(ledger.history().last().unwrap().delta, -5);
    }

    #[test]
    fn status_bands() {
        assert_eq!(ledger_with(5).status(), StockStatus::Critical);
        assert_eq!(ledger_with(10).status(), StockStatus::Low);
        assert_eq!(ledger_with(20).status(), StockStatus::Adequate);
        assert_eq!(ledger_with(21).status(), StockStatus::Good);
    }

    #[test]
    fn credit_above_minimum_clears_alerts() {
        let mut ledger = ledger_with(12);
        ledger
            .debit(9, Reference::blood_request("req_x"), "user_admin")
            .unwrap();
        assert_eq!(ledger.active_alerts().count(), 1);

        ledger
            .credit(5, Reference::donation("don_y"), "user_admin")
            .unwrap();
        assert_eq!(ledger.active_alerts().count(), 1, "8 units is still low");

        ledger
            .credit(3, Reference::donation("don_z"), "user_admin")
            .unwrap();
        assert_eq!(ledger.active_alerts().count(), 0);
        assert_eq!(ledger.alerts().len(), 1);
    }

    #[test]
    fn thresholds_are_clamped() {
        let mut ledger = StockLedger::new(BloodType::ANegative, 4, 9);
        assert_eq!(ledger.critical_threshold(), 3);

        ledger.set_thresholds(0, 0);
        assert_eq!(ledger.critical_threshold(), 0);
    }

    #[test]
    fn acknowledge_deactivates_alert() {
        let mut ledger = ledger_with(12);
        ledger
            .debit(10, Reference::blood_request("req_x"), "user_admin")
            .unwrap();
        let id = ledger.active_alerts().next().unwrap().id.clone();

        ledger.acknowledge_alert(&id, "user_admin").unwrap();

        let alert = &ledger.alerts()[0];
        assert!(!alert.active);
        assert_eq!(alert.acknowledged_by.as_deref(), Some("user_admin"));
        assert!(matches!(
            ledger.acknowledge_alert("alert_missing", "user_admin"),
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn rates_round_to_whole_percent() {
        let mut ledger = ledger_with(3);
        ledger
            .debit(1, Reference::blood_request("req_x"), "user_admin")
            .unwrap();

        assert_eq!(ledger.utilization_rate(), 33);
        assert_eq!(ledger.expiry_rate(), 0);
        assert_eq!(StockLedger::new(BloodType::BPositive, 10, 5).utilization_rate(), 0);
    }

    #[test]
    fn history_pages_newest_first() {
        let mut ledger = ledger_with(0);
        for i in 0..5 {
            ledger
                .credit(1, Reference::donation(format!("don_{i}")), "user_admin")
                .unwrap();
        }

        let first = ledger.history_page(0, 2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].balance_after, 5);
        assert_eq!(ledger.history_page(2, 2).len(), 1);
        assert!(ledger.history_page(3, 2).is_empty());
    }

    #[test]
    fn ledger_encoding() {
        let ledger = ledger_with(7);

        let encoding = minicbor::to_vec(&ledger).unwrap();
        let decoded: StockLedger = minicbor::decode(&encoding).unwrap();

        assert_eq!(ledger, decoded);
    }
}
