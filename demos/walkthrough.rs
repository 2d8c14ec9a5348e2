//! Walks one blood type through donation, request and fulfillment against a
//! throwaway sled database.
//!
//! Pass a TOML config path as the first argument to override the defaults.

use anyhow::Context;
use blood_ledger::{
    BloodBankService, BloodType,
    config::LedgerConfig,
    donation::{NewDonation, Screening, TestResults},
    request::{NewRequest, Urgency},
    telemetry,
    types::TimeStamp,
    utils::{USER_HRP, new_uuid_to_bech32},
};
use chrono::Duration;
use tracing::info;

fn main() -> anyhow::Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => LedgerConfig::load(&path).with_context(|| format!("loading {path}"))?,
        None => LedgerConfig::default(),
    };
    telemetry::init(&config.log_filter);

    let temp_dir = std::env::temp_dir().join(new_uuid_to_bech32("walkthrough_")?);
    let service = BloodBankService::open(config.with_db_path(&temp_dir))?;
    service.initialize_all()?;

    let admin = new_uuid_to_bech32(USER_HRP)?;
    let blood_type = BloodType::OPositive;

    // three donations: two approved by hand, one cleared by screening
    let mut donation_ids = vec![];
    for _ in 0..3 {
        let donor = new_uuid_to_bech32(USER_HRP)?;
        donation_ids.push(service.register_donation(NewDonation::new(donor, blood_type))?.id);
    }
    service.approve_donation(&donation_ids[0], &admin)?;
    service.approve_donation(&donation_ids[1], &admin)?;
    let screening = Screening {
        hemoglobin_tenths: Some(142),
        ..Screening::default()
    };
    service.record_screening(&donation_ids[2], screening, TestResults::all_negative(), &admin)?;

    let request = service.submit_request(
        NewRequest::new(
            "user_ward7",
            blood_type,
            3,
            TimeStamp::new().plus(Duration::days(1)),
        )
        .set_urgency(Urgency::Urgent),
    )?;
    service.approve_request(&request.id, &admin)?;

    let partial = service.fulfill(&request.id, &donation_ids[..1], &[1], &admin)?;
    info!(status = ?partial.request.status(), percentage = partial.percentage, "First allocation");

    let done = service.fulfill(&request.id, &donation_ids[1..], &[1, 1], &admin)?;
    info!(status = ?done.request.status(), percentage = done.percentage, "Second allocation");

    let ledger = service.stock(blood_type)?;
    info!(
        blood_type = %ledger.blood_type(),
        available = ledger.available_units(),
        used = ledger.used_units(),
        status = ledger.status().as_str(),
        "Ledger after fulfillment"
    );
    for alert in service.active_alerts()?.iter().filter(|a| a.blood_type == blood_type) {
        info!(kind = ?alert.kind, message = %alert.message, "Active alert");
    }

    let summary = service.summary()?;
    info!(
        available = summary.available_units,
        low = summary.low_count,
        critical = summary.critical_count,
        "Stock summary"
    );

    drop(service);
    std::fs::remove_dir_all(&temp_dir).ok();
    Ok(())
}
