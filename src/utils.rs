//! Identifier helpers

use bech32::Bech32m;
use uuid7::uuid7;

pub const REQUEST_HRP: &str = "req_";
pub const DONATION_HRP: &str = "don_";
pub const ALERT_HRP: &str = "alert_";
pub const USER_HRP: &str = "user_";

// construct a unique id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

// the prefixes above are valid hrps, so this only falls back on an encoder fault
pub(crate) fn record_id(hrp: &str) -> String {
    new_uuid_to_bech32(hrp).unwrap_or_else(|_| format!("{hrp}{}", uuid7()))
}
