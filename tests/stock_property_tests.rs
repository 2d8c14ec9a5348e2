//! Property-based tests for the stock ledger invariants
//!
//! Random sequences of credit/debit/expire/adjust operations are applied to a
//! ledger and the conservation, history and alert invariants are checked after
//! every step.

use blood_ledger::{
    BloodType, LedgerError, Reference,
    stock::{AlertKind, StockLedger, StockStatus},
};
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Credit(u32),
    Debit(u32),
    Expire(u32),
    Adjust(u32),
}

// PROPERTY TEST STRATEGIES

/// Strategy to generate a single ledger operation with small quantities
fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..=20).prop_map(Op::Credit),
        (1u32..=20).prop_map(Op::Debit),
        (1u32..=10).prop_map(Op::Expire),
        (0u32..=40).prop_map(Op::Adjust),
    ]
}

fn blood_type_strategy() -> impl Strategy<Value = BloodType> {
    (0usize..8).prop_map(|i| BloodType::ALL[i])
}

/// Strategy to generate thresholds, including inverted pairs the ledger must clamp
fn thresholds_strategy() -> impl Strategy<Value = (u32, u32)> {
    (0u32..=15, 0u32..=15)
}

fn apply(ledger: &mut StockLedger, op: &Op) -> Result<(), LedgerError> {
    match op {
        Op::Credit(q) => ledger.credit(*q, Reference::donation("don_prop"), "user_prop"),
        Op::Debit(q) => ledger.debit(*q, Reference::blood_request("req_prop"), "user_prop"),
        Op::Expire(q) => ledger.expire(*q, "user_prop", None),
        Op::Adjust(n) => {
            ledger.adjust(*n, "user_prop", None);
            Ok(())
        }
    }
}

fn alert_matches_status(ledger: &StockLedger) -> bool {
    let active: Vec<AlertKind> = ledger.active_alerts().map(|a| a.kind).collect();
    match ledger.status() {
        StockStatus::Critical => active == vec![AlertKind::Critical],
        StockStatus::Low => active == vec![AlertKind::Low],
        StockStatus::Adequate | StockStatus::Good => active.is_empty(),
    }
}

// PROPERTY TESTS
proptest! {
    /// Property: available never exceeds total, whatever the operation sequence
    #[test]
    fn prop_available_bounded_by_total(
        blood_type in blood_type_strategy(),
        (minimum, critical) in thresholds_strategy(),
        ops in prop::collection::vec(op_strategy(), 1..=40),
    ) {
        let mut ledger = StockLedger::new(blood_type, minimum, critical);

        for op in &ops {
            let _ = apply(&mut ledger, op);
            prop_assert!(ledger.available_units() <= ledger.total_units());
            prop_assert!(ledger.critical_threshold() < ledger.minimum_threshold()
                || ledger.minimum_threshold() == 0);
        }
    }

    /// Property: debit fails exactly when it asks for more than is available,
    /// and on success moves exactly q units from available to used
    #[test]
    fn prop_debit_is_exact_or_rejected(
        seed in 0u32..=30,
        quantity in 1u32..=40,
    ) {
        let mut ledger = StockLedger::new(BloodType::OPositive, 10, 5);
        if seed > 0 {
            ledger.credit(seed, Reference::donation("don_seed"), "user_prop").unwrap();
        }
        let before = ledger.clone();

        let res = ledger.debit(quantity, Reference::blood_request("req_prop"), "user_prop");

        if quantity > before.available_units() {
            let is_insufficient = matches!(res, Err(LedgerError::InsufficientStock { .. }));
            prop_assert!(is_insufficient);
            prop_assert_eq!(&ledger, &before);
        } else {
            prop_assert!(res.is_ok());
            prop_assert_eq!(ledger.available_units(), before.available_units() - quantity);
            prop_assert_eq!(ledger.used_units(), before.used_units() + quantity);
        }
    }

    /// Property: credit always succeeds and grows available and total by q
    #[test]
    fn prop_credit_grows_both_counts(
        ops in prop::collection::vec(op_strategy(), 0..=20),
        quantity in 1u32..=50,
    ) {
        let mut ledger = StockLedger::new(BloodType::ABPositive, 10, 5);
        for op in &ops {
            let _ = apply(&mut ledger, op);
        }
        let available = ledger.available_units();
        let total = ledger.total_units();

        prop_assert!(ledger.credit(quantity, Reference::donation("don_prop"), "user_prop").is_ok());
        prop_assert_eq!(ledger.available_units(), available + quantity);
        prop_assert_eq!(ledger.total_units(), total + quantity);
    }

    /// Property: one history entry per successful mutation, and the entries chain:
    /// balance_after of entry N is balance_before of entry N+1
    #[test]
    fn prop_history_chains(ops in prop::collection::vec(op_strategy(), 1..=40)) {
        let mut ledger = StockLedger::new(BloodType::BNegative, 10, 5);
        let mut successes = 0usize;

        for op in &ops {
            let len = ledger.history().len();
            match apply(&mut ledger, op) {
                Ok(()) => {
                    successes += 1;
                    prop_assert_eq!(ledger.history().len(), len + 1);
                }
                Err(_) => prop_assert_eq!(ledger.history().len(), len),
            }
        }

        prop_assert_eq!(ledger.history().len(), successes);
        for pair in ledger.history().windows(2) {
            prop_assert_eq!(pair[0].balance_after, pair[1].balance_before);
        }
        for movement in ledger.history() {
            prop_assert_eq!(
                movement.delta,
                i64::from(movement.balance_after) - i64::from(movement.balance_before)
            );
        }
    }

    /// Property: after any debit/expire/adjust at most one alert is active and it
    /// agrees with the derived status
    #[test]
    fn prop_alert_follows_status(ops in prop::collection::vec(op_strategy(), 1..=40)) {
        let mut ledger = StockLedger::new(BloodType::ONegative, 10, 5);

        for op in &ops {
            let res = apply(&mut ledger, op);
            if matches!(op, Op::Credit(_)) || res.is_err() {
                continue;
            }
            prop_assert!(ledger.active_alerts().count() <= 1);
            prop_assert!(alert_matches_status(&ledger), "alerts {:?} vs status {:?}",
                ledger.active_alerts().collect::<Vec<_>>(), ledger.status());
        }
    }
}
