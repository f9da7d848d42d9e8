//! # Funding accumulation rules
//!
//! Pure state transitions for a single crowd-funding campaign. The storage
//! layer loads a [`Funding`], runs one of these methods to compute the next
//! state, and persists it with a compare-and-swap on `current_amount`.
//!
//! Overshoot policy is strict rejection: a contribution that would push
//! `current_amount` past `target_amount` fails and reports the remaining
//! amount. Nothing is truncated.

use crate::error::{DomainError, Result};
use crate::types::{Funding, FundingParticipant, FundingStatus, WishItemStatus};

/// Smallest contribution accepted unless configured otherwise.
pub const DEFAULT_MIN_CONTRIBUTION: i64 = 1_000;

/// Campaign length unless configured otherwise.
pub const DEFAULT_DURATION_DAYS: i64 = 14;

pub const SECONDS_PER_DAY: i64 = 86_400;

impl FundingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted | Self::Refused | Self::Expired)
    }

    pub fn is_contributable(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// Forward-only lifecycle. Backward moves exist only for contribution
    /// reversal (`Achieved → InProgress`), which goes through
    /// [`Funding::reverse_contribution`] instead.
    pub fn can_transition_to(&self, next: FundingStatus) -> bool {
        use FundingStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Achieved)
                | (Pending, Expired)
                | (InProgress, Achieved)
                | (InProgress, Expired)
                | (Achieved, Accepted)
                | (Achieved, Refused)
        )
    }
}

impl WishItemStatus {
    /// Project the state of the wish item's latest funding onto the item.
    pub fn project(funding: Option<FundingStatus>) -> Self {
        match funding {
            None | Some(FundingStatus::Expired) | Some(FundingStatus::Refused) => Self::Available,
            Some(FundingStatus::Accepted) => Self::Funded,
            Some(_) => Self::InFunding,
        }
    }
}

/// Input for materializing a pending funding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFunding {
    pub wish_item_id: i64,
    pub organizer_id: i64,
    pub recipient_id: i64,
    pub target_amount: i64,
    pub expires_in_days: i64,
}

impl NewFunding {
    pub fn validate(&self) -> Result<()> {
        if self.target_amount <= 0 {
            return Err(DomainError::Validation(
                "funding target must be positive".to_string(),
            ));
        }
        if self.expires_in_days <= 0 {
            return Err(DomainError::Validation(
                "funding duration must be at least one day".to_string(),
            ));
        }
        Ok(())
    }

    pub fn expires_at(&self, now: i64) -> i64 {
        now + self.expires_in_days * SECONDS_PER_DAY
    }
}

/// Recipient's answer to an achieved funding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Refuse { reason: Option<String> },
}

impl Funding {
    pub fn remaining(&self) -> i64 {
        self.target_amount - self.current_amount
    }

    pub fn is_past_due(&self, now: i64) -> bool {
        now > self.expires_at
    }

    /// Preconditions of a contribution, in the order the client should see
    /// them: malformed amount, funding state, then capacity.
    pub fn check_contribution(&self, amount: i64, minimum: i64, now: i64) -> Result<()> {
        if amount <= 0 {
            return Err(DomainError::Validation(
                "contribution amount must be positive".to_string(),
            ));
        }
        if amount < minimum {
            return Err(DomainError::BelowMinimum { minimum });
        }
        if !self.status.is_contributable() || self.is_past_due(now) {
            return Err(DomainError::FundingNotContributable {
                funding_id: self.id,
                status: self.status,
            });
        }
        if amount > self.target_amount {
            return Err(DomainError::ExceedTarget {
                target: self.target_amount,
            });
        }
        if self.current_amount + amount > self.target_amount {
            return Err(DomainError::ExceedRemainingAmount {
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    /// Apply a paid contribution. Returns the resulting status.
    pub fn apply_contribution(&mut self, amount: i64, minimum: i64, now: i64) -> Result<FundingStatus> {
        self.check_contribution(amount, minimum, now)?;

        self.current_amount += amount;
        if self.current_amount == self.target_amount {
            self.status = FundingStatus::Achieved;
            self.achieved_at = Some(now);
        } else {
            self.status = FundingStatus::InProgress;
        }
        Ok(self.status)
    }

    /// Undo a previously applied contribution (order cancellation).
    pub fn reverse_contribution(&mut self, amount: i64) -> Result<FundingStatus> {
        match self.status {
            FundingStatus::InProgress
            | FundingStatus::Achieved
            | FundingStatus::Expired
            | FundingStatus::Refused => {}
            FundingStatus::Pending | FundingStatus::Accepted => {
                return Err(DomainError::Conflict(format!(
                    "funding {} is {} and cannot be reversed",
                    self.id, self.status
                )));
            }
        }
        if amount <= 0 || amount > self.current_amount {
            return Err(DomainError::Validation(format!(
                "cannot reverse {amount} from funding {} holding {}",
                self.id, self.current_amount
            )));
        }

        self.current_amount -= amount;
        if self.status == FundingStatus::Achieved {
            self.status = FundingStatus::InProgress;
            self.achieved_at = None;
        }
        Ok(self.status)
    }

    /// Time-triggered expiry. Captured contributions stay where they are;
    /// refunds are a separate explicit operation.
    pub fn expire(&mut self, now: i64) -> Result<()> {
        if !self.status.is_contributable() {
            return Err(DomainError::Conflict(format!(
                "funding {} is {} and cannot expire",
                self.id, self.status
            )));
        }
        if !self.is_past_due(now) {
            return Err(DomainError::Conflict(format!(
                "funding {} is not due until {}",
                self.id, self.expires_at
            )));
        }
        self.status = FundingStatus::Expired;
        Ok(())
    }

    /// Close a funding that never received money, ahead of its deadline.
    /// Used when the unpaid checkout that opened it is abandoned.
    pub fn abandon(&mut self) -> Result<()> {
        if self.status != FundingStatus::Pending || self.current_amount != 0 {
            return Err(DomainError::Conflict(format!(
                "funding {} is {} holding {} and cannot be abandoned",
                self.id, self.status, self.current_amount
            )));
        }
        self.status = FundingStatus::Expired;
        Ok(())
    }

    pub fn decide(&mut self, caller_id: i64, decision: Decision, now: i64) -> Result<FundingStatus> {
        if caller_id != self.recipient_id {
            return Err(DomainError::Forbidden(format!(
                "only the recipient may decide on funding {}",
                self.id
            )));
        }
        if self.status != FundingStatus::Achieved {
            return Err(DomainError::Conflict(format!(
                "funding {} is {}, not ACHIEVED",
                self.id, self.status
            )));
        }

        match decision {
            Decision::Accept => self.status = FundingStatus::Accepted,
            Decision::Refuse { reason } => {
                self.status = FundingStatus::Refused;
                self.refuse_reason = reason;
            }
        }
        self.decided_at = Some(now);
        Ok(self.status)
    }
}

impl FundingParticipant {
    /// Fold one contribution into the member's participant row.
    ///
    /// Returns the updated row and whether it is the member's first
    /// contribution to this funding (which bumps `participant_count`).
    pub fn accumulate(
        existing: Option<FundingParticipant>,
        funding: &Funding,
        member_id: i64,
        amount: i64,
        now: i64,
    ) -> (FundingParticipant, bool) {
        match existing {
            Some(mut row) => {
                row.amount += amount;
                (row, false)
            }
            None => (
                FundingParticipant {
                    funding_id: funding.id,
                    member_id,
                    amount,
                    is_organizer: member_id == funding.organizer_id,
                    participated_at: now,
                },
                true,
            ),
        }
    }

    /// Remove `amount` from the row. `None` means the row is now empty and
    /// the member no longer counts as a participant.
    pub fn reduce(mut self, amount: i64) -> Result<Option<FundingParticipant>> {
        if amount > self.amount {
            return Err(DomainError::Validation(format!(
                "member {} contributed only {} to funding {}",
                self.member_id, self.amount, self.funding_id
            )));
        }
        self.amount -= amount;
        Ok((self.amount > 0).then_some(self))
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────


#[cfg(test)]
mod proptests {
    use proptest::prelude::*;

    use super::*;

    fn open_funding(target: i64) -> Funding {
        Funding {
            id: 1,
            wish_item_id: 1,
            organizer_id: 0,
            recipient_id: 100,
            target_amount: target,
            current_amount: 0,
            participant_count: 0,
            status: FundingStatus::Pending,
            expires_at: i64::MAX,
            created_at: 0,
            achieved_at: None,
            decided_at: None,
            refuse_reason: None,
        }
    }

    proptest! {
        #[test]
        fn contributions_never_overshoot(
            target in 1_000i64..500_000,
            attempts in prop::collection::vec((0i64..5, 1i64..200_000), 0..40),
        ) {
            let mut f = open_funding(target);
            let mut participants: Vec<FundingParticipant> = Vec::new();
            let mut accepted = 0i64;

            for (member, amount) in attempts {
                if f.apply_contribution(amount, 1, 0).is_ok() {
                    accepted += amount;
                    let pos = participants.iter().position(|p| p.member_id == member);
                    let existing = pos.map(|i| participants.remove(i));
                    let (row, first) = FundingParticipant::accumulate(existing, &f, member, amount, 0);
                    if first {
                        f.participant_count += 1;
                    }
                    participants.push(row);
                }

                prop_assert!(f.current_amount <= f.target_amount);
                if f.current_amount == f.target_amount {
                    prop_assert_eq!(f.status, FundingStatus::Achieved);
                }
            }

            prop_assert_eq!(accepted, f.current_amount);
            let sum: i64 = participants.iter().map(|p| p.amount).sum();
            prop_assert_eq!(sum, f.current_amount);
            prop_assert_eq!(f.participant_count, participants.len() as i64);
        }
    }
}
