//! Donation records and their screening-driven status.
use super::error::LedgerError;
use super::types::{BloodType, TimeStamp};
use super::utils::{DONATION_HRP, record_id};
use chrono::{Duration, Utc};
use std::ops::RangeInclusive;

pub const MIN_VOLUME_ML: u16 = 350;
pub const MAX_VOLUME_ML: u16 = 500;
pub const DEFAULT_VOLUME_ML: u16 = 450;

// hemoglobin is kept in tenths of g/dL
pub const MIN_HEMOGLOBIN_TENTHS: u16 = 125;
pub const MAX_HEMOGLOBIN_TENTHS: u16 = 200;

pub const SYSTOLIC_RANGE: RangeInclusive<u16> = 90..=180;
pub const DIASTOLIC_RANGE: RangeInclusive<u16> = 60..=100;
pub const PULSE_RANGE: RangeInclusive<u16> = 50..=100;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DonationStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Completed,
    #[n(4)]
    Expired,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TestOutcome {
    #[n(0)]
    #[default]
    Pending,
    #[n(1)]
    Negative,
    #[n(2)]
    Positive,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TestResults {
    #[n(0)]
    pub hiv: TestOutcome,
    #[n(1)]
    pub hepatitis_b: TestOutcome,
    #[n(2)]
    pub hepatitis_c: TestOutcome,
    #[n(3)]
    pub syphilis: TestOutcome,
}

impl TestResults {
    pub fn all_negative() -> Self {
        Self {
            hiv: TestOutcome::Negative,
            hepatitis_b: TestOutcome::Negative,
            hepatitis_c: TestOutcome::Negative,
            syphilis: TestOutcome::Negative,
        }
    }
    pub fn is_clear(&self) -> bool {
        [self.hiv, self.hepatitis_b, self.hepatitis_c, self.syphilis]
            .iter()
            .all(|t| *t == TestOutcome::Negative)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Screening {
    #[n(0)]
    pub hemoglobin_tenths: Option<u16>,
    #[n(1)]
    pub systolic: Option<u16>,
    #[n(2)]
    pub diastolic: Option<u16>,
    #[n(3)]
    pub pulse: Option<u16>,
}

impl Screening {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if let Some(hb) = self.hemoglobin_tenths {
            if !(MIN_HEMOGLOBIN_TENTHS..=MAX_HEMOGLOBIN_TENTHS).contains(&hb) {
                return Err(LedgerError::Validation(format!(
                    "hemoglobin {hb} outside {MIN_HEMOGLOBIN_TENTHS}..={MAX_HEMOGLOBIN_TENTHS} tenths of g/dL"
                )));
            }
        }
        check_vital("systolic pressure", self.systolic, &SYSTOLIC_RANGE)?;
        check_vital("diastolic pressure", self.diastolic, &DIASTOLIC_RANGE)?;
        check_vital("pulse", self.pulse, &PULSE_RANGE)
    }
}

fn check_vital(
    name: &str,
    value: Option<u16>,
    range: &RangeInclusive<u16>,
) -> Result<(), LedgerError> {
    match value {
        Some(v) if !range.contains(&v) => Err(LedgerError::Validation(format!(
            "{name} {v} outside {}..={}",
            range.start(),
            range.end()
        ))),
        _ => Ok(()),
    }
}

/// Input for registering a donation.
#[derive(Debug, Clone)]
pub struct NewDonation {
    pub donor: String,
    pub blood_type: BloodType,
    pub volume_ml: u16,
    pub donated_at: TimeStamp<Utc>,
}

impl NewDonation {
    pub fn new(donor: impl Into<String>, blood_type: BloodType) -> Self {
        Self {
            donor: donor.into(),
            blood_type,
            volume_ml: DEFAULT_VOLUME_ML,
            donated_at: TimeStamp::new(),
        }
    }
    pub fn set_volume_ml(mut self, volume_ml: u16) -> Self {
        self.volume_ml = volume_ml;
        self
    }
    pub fn set_donated_at(mut self, at: TimeStamp<Utc>) -> Self {
        self.donated_at = at;
        self
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Donation {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub donor: String,
    #[n(2)]
    pub blood_type: BloodType,
    #[n(3)]
    pub volume_ml: u16,
    #[n(4)]
    pub donated_at: TimeStamp<Utc>,
    #[n(5)]
    pub expires_at: TimeStamp<Utc>,
    #[n(6)]
    pub status: DonationStatus,
    #[n(7)]
    pub screening: Screening,
    #[n(8)]
    pub test_results: TestResults,
    #[n(9)]
    pub approved_by: Option<String>,
    #[n(10)]
    pub approved_at: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub rejection_reason: Option<String>,
}

impl Donation {
    pub fn register(new: NewDonation, shelf_life_days: u32) -> Result<Self, LedgerError> {
        if !(MIN_VOLUME_ML..=MAX_VOLUME_ML).contains(&new.volume_ml) {
            return Err(LedgerError::Validation(format!(
                "donation volume {}ml outside {MIN_VOLUME_ML}..={MAX_VOLUME_ML}ml",
                new.volume_ml
            )));
        }
        let expires_at = new
            .donated_at
            .plus(Duration::days(i64::from(shelf_life_days)));

        Ok(Self {
            id: record_id(DONATION_HRP),
            donor: new.donor,
            blood_type: new.blood_type,
            volume_ml: new.volume_ml,
            donated_at: new.donated_at,
            expires_at,
            status: DonationStatus::Pending,
            screening: Screening::default(),
            test_results: TestResults::default(),
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
        })
    }

    pub fn is_expired(&self, now: &TimeStamp<Utc>) -> bool {
        self.expires_at < *now
    }

    pub fn is_test_clear(&self) -> bool {
        self.test_results.is_clear()
    }

    /// Status the donation should hold at `now`, applied before every save.
    pub fn derive_status(&self, now: &TimeStamp<Utc>) -> DonationStatus {
        match self.status {
            DonationStatus::Approved if self.is_expired(now) => DonationStatus::Expired,
            DonationStatus::Pending
                if self.is_test_clear() && self.screening.hemoglobin_tenths.is_some() =>
            {
                DonationStatus::Approved
            }
            status => status,
        }
    }

    /// Applies the derived status. Returns true when the donation became approved.
    pub fn refresh(&mut self, now: &TimeStamp<Utc>, actor: &str) -> bool {
        let next = self.derive_status(now);
        let newly_approved =
            next == DonationStatus::Approved && self.status != DonationStatus::Approved;
        if newly_approved {
            self.approved_by = Some(actor.to_string());
            self.approved_at = Some(now.clone());
        }
        self.status = next;
        newly_approved
    }

    pub fn approve(&mut self, approver: &str, now: &TimeStamp<Utc>) -> Result<(), LedgerError> {
        if self.status != DonationStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "only pending donations can be approved, {} is {:?}",
                self.id, self.status
            )));
        }
        self.status = DonationStatus::Approved;
        self.approved_by = Some(approver.to_string());
        self.approved_at = Some(now.clone());
        Ok(())
    }

    pub fn reject(&mut self, reason: &str) -> Result<(), LedgerError> {
        if reason.trim().is_empty() {
            return Err(LedgerError::Validation(
                "rejection reason is required when rejecting a donation".into(),
            ));
        }
        if self.status != DonationStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "only pending donations can be rejected, {} is {:?}",
                self.id, self.status
            )));
        }
        self.status = DonationStatus::Rejected;
        self.rejection_reason = Some(reason.to_string());
        Ok(())
    }
}
