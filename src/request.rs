//! Blood requests, their fulfillment record and the lifecycle state machine.
//!
//! Status and priority are never trusted from storage: [`derive_status`] and
//! [`compute_priority`] are pure functions of the record and the current time,
//! and [`BloodRequest::refresh`] applies both before a request is persisted.
use super::error::LedgerError;
use super::types::{BloodType, TimeStamp};
use super::utils::{REQUEST_HRP, record_id};
use chrono::Utc;
use std::collections::HashSet;

pub const MIN_REQUEST_UNITS: u32 = 1;
pub const MAX_REQUEST_UNITS: u32 = 10;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Urgency {
    #[n(0)]
    Scheduled,
    #[n(1)]
    Normal,
    #[n(2)]
    Urgent,
    #[n(3)]
    Critical,
}

impl Urgency {
    pub fn weight(&self) -> u32 {
        match self {
            Urgency::Scheduled => 1,
            Urgency::Normal => 2,
            Urgency::Urgent => 3,
            Urgency::Critical => 4,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    PartiallyFulfilled,
    #[n(3)]
    Fulfilled,
    #[n(4)]
    Rejected,
    #[n(5)]
    Expired,
}

impl RequestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Fulfilled | RequestStatus::Rejected | RequestStatus::Expired
        )
    }
    /// Pending, approved or partially fulfilled.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }
    pub fn accepts_fulfillment(&self) -> bool {
        matches!(
            self,
            RequestStatus::Approved | RequestStatus::PartiallyFulfilled
        )
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentEntry {
    #[n(0)]
    pub donation_id: String,
    #[n(1)]
    pub units: u32,
    #[n(2)]
    pub provided_at: TimeStamp<Utc>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Fulfillment {
    #[n(0)]
    requested_quantity: u32,
    #[n(1)]
    units_provided: u32,
    #[n(2)]
    entries: Vec<FulfillmentEntry>,
    #[n(3)]
    fulfilled_at: Option<TimeStamp<Utc>>,
}

impl Fulfillment {
    fn new(requested_quantity: u32) -> Self {
        Self {
            requested_quantity,
            units_provided: 0,
            entries: vec![],
            fulfilled_at: None,
        }
    }
    pub fn requested_quantity(&self) -> u32 {
        self.requested_quantity
    }
    pub fn units_provided(&self) -> u32 {
        self.units_provided
    }
    pub fn entries(&self) -> &[FulfillmentEntry] {
        &self.entries
    }
    pub fn fulfilled_at(&self) -> Option<&TimeStamp<Utc>> {
        self.fulfilled_at.as_ref()
    }
    pub fn remaining(&self) -> u32 {
        self.requested_quantity.saturating_sub(self.units_provided)
    }
    pub fn is_fully_fulfilled(&self) -> bool {
        self.units_provided >= self.requested_quantity
    }
    pub fn percentage(&self) -> u32 {
        if self.requested_quantity == 0 {
            return 0;
        }
        ((f64::from(self.units_provided) / f64::from(self.requested_quantity)) * 100.0).round()
            as u32
    }
}

/// Units taken from one approved donation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub donation_id: String,
    pub units: u32,
}

impl Allocation {
    pub fn new(donation_id: impl Into<String>, units: u32) -> Self {
        Self {
            donation_id: donation_id.into(),
            units,
        }
    }

    /// Zips parallel donation id and unit lists.
    pub fn pair(donation_ids: &[String], units: &[u32]) -> Result<Vec<Allocation>, LedgerError> {
        if donation_ids.len() != units.len() {
            return Err(LedgerError::InvalidQuantity(format!(
                "{} donation ids but {} unit counts",
                donation_ids.len(),
                units.len()
            )));
        }
        Ok(donation_ids
            .iter()
            .zip(units)
            .map(|(id, u)| Allocation::new(id.clone(), *u))
            .collect())
    }
}

/// Changes allowed on a request while it is still pending.
#[derive(Debug, Clone, Default)]
pub struct RequestUpdate {
    pub urgency: Option<Urgency>,
    pub required_by: Option<TimeStamp<Utc>>,
}

impl RequestUpdate {
    pub fn set_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = Some(urgency);
        self
    }
    pub fn set_required_by(mut self, required_by: TimeStamp<Utc>) -> Self {
        self.required_by = Some(required_by);
        self
    }
}

/// Input for filing a request.
#[derive(Debug, Clone)]
pub struct NewRequest {
    pub requester: String,
    pub blood_type: BloodType,
    pub quantity: u32,
    pub urgency: Urgency,
    pub required_by: TimeStamp<Utc>,
    pub notes: Option<String>,
}

impl NewRequest {
    pub fn new(
        requester: impl Into<String>,
        blood_type: BloodType,
        quantity: u32,
        required_by: TimeStamp<Utc>,
    ) -> Self {
        Self {
            requester: requester.into(),
            blood_type,
            quantity,
            urgency: Urgency::Normal,
            required_by,
            notes: None,
        }
    }
    pub fn set_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }
    pub fn set_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct BloodRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub requester: String,
    #[n(2)]
    pub blood_type: BloodType,
    #[n(3)]
    pub urgency: Urgency,
    #[n(4)]
    pub required_by: TimeStamp<Utc>,
    #[n(5)]
    pub created_at: TimeStamp<Utc>,
    #[n(6)]
    status: RequestStatus,
    #[n(7)]
    fulfillment: Fulfillment,
    #[n(8)]
    priority: u32,
    #[n(9)]
    pub approved_by: Option<String>,
    #[n(10)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub rejection_reason: Option<String>,
    #[n(12)]
    pub notes: Option<String>,
}

impl BloodRequest {
    pub fn submit(new: NewRequest, now: &TimeStamp<Utc>) -> Result<Self, LedgerError> {
        if !(MIN_REQUEST_UNITS..=MAX_REQUEST_UNITS).contains(&new.quantity) {
            return Err(LedgerError::InvalidQuantity(format!(
                "requested {} units, allowed {MIN_REQUEST_UNITS}..={MAX_REQUEST_UNITS}",
                new.quantity
            )));
        }
        if new.required_by <= *now {
            return Err(LedgerError::Validation(
                "required by date must be in the future".into(),
            ));
        }

        let mut request = Self {
            id: record_id(REQUEST_HRP),
            requester: new.requester,
            blood_type: new.blood_type,
            urgency: new.urgency,
            required_by: new.required_by,
            created_at: now.clone(),
            status: RequestStatus::Pending,
            fulfillment: Fulfillment::new(new.quantity),
            priority: 0,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
            notes: new.notes,
        };
        request.refresh(now);
        Ok(request)
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }
    pub fn fulfillment(&self) -> &Fulfillment {
        &self.fulfillment
    }
    pub fn priority(&self) -> u32 {
        self.priority
    }
    pub fn requested_quantity(&self) -> u32 {
        self.fulfillment.requested_quantity
    }

    /// Applies the derived status and priority. Called before every save.
    pub fn refresh(&mut self, now: &TimeStamp<Utc>) {
        self.status = derive_status(self, now);
        if self.status == RequestStatus::Fulfilled && self.fulfillment.fulfilled_at.is_none() {
            self.fulfillment.fulfilled_at = Some(now.clone());
        }
        self.priority = compute_priority(self.urgency, &self.required_by, now);
    }

    pub fn approve(&mut self, approver: &str, now: &TimeStamp<Utc>) -> Result<(), LedgerError> {
        self.refresh(now);
        if self.status != RequestStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "only pending requests can be approved, {} is {:?}",
                self.id, self.status
            )));
        }
        self.status = RequestStatus::Approved;
        self.approved_by = Some(approver.to_string());
        self.approved_at = Some(now.clone());
        Ok(())
    }

    /// Changes urgency and deadline of a pending request. Priority follows on refresh.
    pub fn update(&mut self, update: RequestUpdate, now: &TimeStamp<Utc>) -> Result<(), LedgerError> {
        self.refresh(now);
        if self.status != RequestStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "only pending requests can be updated, {} is {:?}",
                self.id, self.status
            )));
        }
        if let Some(required_by) = &update.required_by {
            if required_by <= now {
                return Err(LedgerError::Validation(
                    "required by date must be in the future".into(),
                ));
            }
        }

        if let Some(urgency) = update.urgency {
            self.urgency = urgency;
        }
        if let Some(required_by) = update.required_by {
            self.required_by = required_by;
        }
        self.refresh(now);
        Ok(())
    }

    pub fn reject(&mut self, reason: &str, now: &TimeStamp<Utc>) -> Result<(), LedgerError> {
        if reason.trim().is_empty() {
            return Err(LedgerError::Validation(
                "rejection reason is required when rejecting a request".into(),
            ));
        }
        self.refresh(now);
        if self.status.is_terminal() {
            return Err(LedgerError::InvalidState(format!(
                "request {} is already {:?}",
                self.id, self.status
            )));
        }
        self.status = RequestStatus::Rejected;
        self.rejection_reason = Some(reason.to_string());
        Ok(())
    }

    /// Checks that `allocations` may be recorded against this request and
    /// returns the total units they carry. Does not modify the request.
    pub fn check_allocation(
        &self,
        allocations: &[Allocation],
        now: &TimeStamp<Utc>,
    ) -> Result<u32, LedgerError> {
        let status = derive_status(self, now);
        if !status.accepts_fulfillment() {
            return Err(LedgerError::InvalidState(format!(
                "only approved or partially fulfilled requests can be fulfilled, {} is {:?}",
                self.id, status
            )));
        }
        if allocations.is_empty() {
            return Err(LedgerError::InvalidQuantity(
                "at least one donation is required".into(),
            ));
        }
        if allocations.iter().any(|a| a.units == 0) {
            return Err(LedgerError::InvalidQuantity(
                "each donation must provide at least 1 unit".into(),
            ));
        }
        let mut seen = HashSet::with_capacity(allocations.len());
        if let Some(dup) = allocations.iter().find(|a| !seen.insert(a.donation_id.as_str())) {
            return Err(LedgerError::InvalidReference(format!(
                "donation {} allocated more than once",
                dup.donation_id
            )));
        }

        let additional = allocations
            .iter()
            .try_fold(0u32, |sum, a| sum.checked_add(a.units))
            .unwrap_or(u32::MAX);
        let provided = self.fulfillment.units_provided;
        if u64::from(provided) + u64::from(additional)
            > u64::from(self.fulfillment.requested_quantity)
        {
            return Err(LedgerError::OverAllocation {
                requested: self.fulfillment.requested_quantity,
                provided,
                additional,
            });
        }
        Ok(additional)
    }

    /// Records the allocations. All-or-nothing: on error the request is unchanged.
    pub fn fulfill(
        &mut self,
        allocations: &[Allocation],
        now: &TimeStamp<Utc>,
    ) -> Result<u32, LedgerError> {
        let additional = self.check_allocation(allocations, now)?;

        self.fulfillment
            .entries
            .extend(allocations.iter().map(|a| FulfillmentEntry {
                donation_id: a.donation_id.clone(),
                units: a.units,
                provided_at: now.clone(),
            }));
        self.fulfillment.units_provided += additional;
        self.refresh(now);
        Ok(additional)
    }
}

/// Lifecycle status of `request` at `now`.
///
/// Time-based expiry is checked first and short-circuits: an open request whose
/// deadline has passed is expired regardless of how much was provided. Otherwise
/// an approved request moves to partially fulfilled or fulfilled with the units
/// recorded against it. Terminal states never change.
pub fn derive_status(request: &BloodRequest, now: &TimeStamp<Utc>) -> RequestStatus {
    let status = request.status;
    let open = matches!(
        status,
        RequestStatus::Pending | RequestStatus::Approved | RequestStatus::PartiallyFulfilled
    );
    if open && request.required_by < *now {
        return RequestStatus::Expired;
    }

    if status.accepts_fulfillment() {
        let fulfillment = &request.fulfillment;
        if fulfillment.is_fully_fulfilled() {
            return RequestStatus::Fulfilled;
        }
        if fulfillment.units_provided > 0 {
            return RequestStatus::PartiallyFulfilled;
        }
    }
    status
}

/// Queue ordering score: urgency weight times deadline proximity.
///
/// Days until the deadline are rounded up and floored at one, so the time
/// weight ranges from 5 (due within a day) down to 1 (five or more days out).
pub fn compute_priority(
    urgency: Urgency,
    required_by: &TimeStamp<Utc>,
    now: &TimeStamp<Utc>,
) -> u32 {
    let remaining_ms = (required_by.to_datetime_utc() - now.to_datetime_utc()).num_milliseconds();
    let days = if remaining_ms <= 0 {
        1
    } else {
        ((remaining_ms + DAY_MS - 1) / DAY_MS).max(1)
    };
    let time_weight = (6 - days).max(1) as u32;
    urgency.weight() * time_weight
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn approved_request(quantity: u32) -> (BloodRequest, TimeStamp<Utc>) {
        let now = TimeStamp::new();
        let new = NewRequest::new(
            "user_requester",
            BloodType::OPositive,
            quantity,
            now.plus(Duration::days(3)),
        );
        let mut request = BloodRequest::submit(new, &now).unwrap();
        request.approve("user_admin", &now).unwrap();
        (request, now)
    }

    #[test]
    fn submit_validates_quantity_and_deadline() {
        let now = TimeStamp::new();
        let later = now.plus(Duration::days(1));

        let too_many = NewRequest::new("user_r", BloodType::ANegative, 11, later.clone());
        assert!(matches!(
            BloodRequest::submit(too_many, &now),
            Err(LedgerError::InvalidQuantity(_))
        ));

        let past = NewRequest::new("user_r", BloodType::ANegative, 2, now.plus(Duration::hours(-1)));
        assert!(matches!(
            BloodRequest::submit(past, &now),
            Err(LedgerError::Validation(_))
        ));

        let ok = BloodRequest::submit(NewRequest::new("user_r", BloodType::ANegative, 2, later), &now)
            .unwrap();
        assert_eq!(ok.status(), RequestStatus::Pending);
        assert!(ok.id.starts_with(REQUEST_HRP));
    }

    #[test]
    fn full_fulfillment_stamps_fulfilled_at() {
        let (mut request, now) = approved_request(3);
        let allocations = vec![Allocation::new("don_a", 2), Allocation::new("don_b", 1)];

        assert_eq!(request.fulfill(&allocations, &now).unwrap(), 3);

        assert_eq!(request.status(), RequestStatus::Fulfilled);
        assert_eq!(request.fulfillment().units_provided(), 3);
        assert_eq!(request.fulfillment().entries().len(), 2);
        assert!(request.fulfillment().fulfilled_at().is_some());
        assert_eq!(request.fulfillment().percentage(), 100);
    }

    #[test]
    fn partial_then_over_allocation_is_rejected() {
        let (mut request, now) = approved_request(2);
        request.fulfill(&[Allocation::new("don_a", 1)], &now).unwrap();
        assert_eq!(request.status(), RequestStatus::PartiallyFulfilled);
        assert_eq!(request.fulfillment().percentage(), 50);
        let snapshot = request.clone();

        let res = request.fulfill(&[Allocation::new("don_c", 2)], &now);

        assert!(matches!(
            res,
            Err(LedgerError::OverAllocation {
                requested: 2,
                provided: 1,
                additional: 2
            })
        ));
        assert_eq!(request, snapshot);
    }

    #[test]
    fn pending_request_cannot_be_fulfilled() {
        let now = TimeStamp::new();
        let mut request = BloodRequest::submit(
            NewRequest::new("user_r", BloodType::BPositive, 2, now.plus(Duration::days(2))),
            &now,
        )
        .unwrap();

        assert!(matches!(
            request.fulfill(&[Allocation::new("don_a", 1)], &now),
            Err(LedgerError::InvalidState(_))
        ));
    }

    #[test]
    fn deadline_passing_expires_open_request() {
        let (mut request, now) = approved_request(2);
        request.fulfill(&[Allocation::new("don_a", 1)], &now).unwrap();

        let after_deadline = request.required_by.plus(Duration::minutes(1));
        assert_eq!(derive_status(&request, &after_deadline), RequestStatus::Expired);

        request.refresh(&after_deadline);
        assert!(matches!(
            request.fulfill(&[Allocation::new("don_b", 1)], &after_deadline),
            Err(LedgerError::InvalidState(_))
        ));
    }

    #[test]
    fn fulfilled_request_never_expires() {
        let (mut request, now) = approved_request(1);
        request.fulfill(&[Allocation::new("don_a", 1)], &now).unwrap();

        let after_deadline = request.required_by.plus(Duration::days(10));
        request.refresh(&after_deadline);
        assert_eq!(request.status(), RequestStatus::Fulfilled);
    }

    #[test]
    fn reject_requires_reason_and_open_request() {
        let (mut request, now) = approved_request(2);
        assert!(matches!(
            request.reject("", &now),
            Err(LedgerError::Validation(_))
        ));

        request.reject("no matching stock", &now).unwrap();
        assert_eq!(request.status(), RequestStatus::Rejected);
        assert!(matches!(
            request.reject("again", &now),
            Err(LedgerError::InvalidState(_))
        ));
    }

    #[test]
    fn priority_grows_as_deadline_approaches() {
        let now = TimeStamp::new();
        let far = compute_priority(Urgency::Urgent, &now.plus(Duration::days(5)), &now);
        let near = compute_priority(Urgency::Urgent, &now.plus(Duration::days(1)), &now);

        assert_eq!(far, 3);
        assert_eq!(near, 15);
        assert_eq!(
            compute_priority(Urgency::Critical, &now.plus(Duration::hours(-4)), &now),
            20
        );
        assert_eq!(
            compute_priority(Urgency::Scheduled, &now.plus(Duration::days(30)), &now),
            1
        );
    }

    #[test]
    fn mismatched_allocation_lists_are_rejected() {
        let ids = vec!["don_a".to_string(), "don_b".to_string()];
        assert!(matches!(
            Allocation::pair(&ids, &[1]),
            Err(LedgerError::InvalidQuantity(_))
        ));
        assert_eq!(Allocation::pair(&ids, &[1, 2]).unwrap().len(), 2);
    }

    #[test]
    fn same_donation_twice_is_an_invalid_reference() {
        let (mut request, now) = approved_request(3);
        let snapshot = request.clone();

        let res = request.fulfill(
            &[Allocation::new("don_a", 1), Allocation::new("don_a", 1)],
            &now,
        );

        assert!(matches!(res, Err(LedgerError::InvalidReference(_))));
        assert_eq!(request, snapshot);
    }

    #[test]
    fn pending_update_recomputes_priority() {
        let now = TimeStamp::new();
        let mut request = BloodRequest::submit(
            NewRequest::new("user_r", BloodType::BNegative, 2, now.plus(Duration::days(5))),
            &now,
        )
        .unwrap();
        assert_eq!(request.priority(), 2);

        let update = RequestUpdate::default()
            .set_urgency(Urgency::Critical)
            .set_required_by(now.plus(Duration::days(1)));
        request.update(update, &now).unwrap();
        assert_eq!(request.urgency, Urgency::Critical);
        assert_eq!(request.priority(), 20);

        let past = RequestUpdate::default().set_required_by(now.plus(Duration::hours(-2)));
        assert!(matches!(
            request.update(past, &now),
            Err(LedgerError::Validation(_))
        ));

        request.approve("user_admin", &now).unwrap();
        assert!(matches!(
            request.update(RequestUpdate::default().set_urgency(Urgency::Scheduled), &now),
            Err(LedgerError::InvalidState(_))
        ));
    }
}
