//! Assertion helpers for the pipeline invariants.
//!
//! Compiled for unit tests and, via the `testutils` feature, for the
//! settlement service's integration tests.

#![allow(dead_code)]

use crate::ledger;
use crate::types::{Funding, FundingParticipant, FundingStatus, Wallet, WalletTransaction};

/// `current_amount` never exceeds `target_amount`.
pub fn assert_no_overshoot(funding: &Funding) {
    assert!(
        funding.current_amount <= funding.target_amount,
        "overshoot: funding {} holds {} over target {}",
        funding.id,
        funding.current_amount,
        funding.target_amount
    );
}

/// Participant amounts sum to `current_amount` and the row count
/// matches `participant_count`.
pub fn assert_participants_balance(funding: &Funding, participants: &[FundingParticipant]) {
    let sum: i64 = participants.iter().map(|p| p.amount).sum();
    assert_eq!(
        sum, funding.current_amount,
        "participants of funding {} sum to {} but current is {}",
        funding.id, sum, funding.current_amount
    );
    assert_eq!(
        participants.len() as i64,
        funding.participant_count,
        "participants out of balance: funding {} counts {} participants but has {} rows",
        funding.id,
        funding.participant_count,
        participants.len()
    );
}

/// A full funding is ACHIEVED or decided, never still open.
pub fn assert_full_funding_achieved(funding: &Funding) {
    if funding.current_amount == funding.target_amount {
        assert!(
            matches!(
                funding.status,
                FundingStatus::Achieved | FundingStatus::Accepted | FundingStatus::Refused
            ),
            "full funding still open: funding {} is full but {}",
            funding.id,
            funding.status
        );
    }
}

/// Replaying the history from zero yields the wallet balance.
pub fn assert_ledger_consistent(wallet: &Wallet, history_oldest_first: &[WalletTransaction]) {
    match ledger::replay(history_oldest_first) {
        Ok(balance) => assert_eq!(
            balance, wallet.balance,
            "ledger out of balance: history of member {} replays to {} but balance is {}",
            wallet.member_id, balance, wallet.balance
        ),
        Err(violation) => panic!("ledger out of balance: {violation}"),
    }
}

/// Run all stateless funding invariants.
pub fn assert_all_funding_invariants(funding: &Funding, participants: &[FundingParticipant]) {
    assert_no_overshoot(funding);
    assert_participants_balance(funding, participants);
    assert_full_funding_achieved(funding);
}
