//! # GiftFund Core
//!
//! Domain rules of the gift-funding settlement pipeline. Members stage
//! contributions in a cart, check them out into orders, pay from an internal
//! wallet (topped up through an external card gateway), and the payments
//! accumulate into crowd-funding campaigns that the gift recipient finally
//! accepts or refuses.
//!
//! | Concern              | Module                              |
//! |----------------------|-------------------------------------|
//! | Entities & statuses  | [`types`]                           |
//! | Funding accumulation | [`funding`]                         |
//! | Order lifecycle      | [`order`]                           |
//! | Wallet ledger        | [`ledger`]                          |
//! | Error taxonomy       | [`error`], [`messages`]             |
//! | Client-side updates  | [`optimistic`], [`notify`]          |
//!
//! ## Architecture
//!
//! This crate performs no I/O. The settlement service loads state, runs the
//! transition functions here to compute the next state, and persists it
//! atomically. Clients reuse the same types, error codes and message table.

pub mod error;
pub mod funding;
pub mod ledger;
pub mod messages;
pub mod notify;
pub mod optimistic;
pub mod order;
pub mod types;

#[cfg(any(test, feature = "testutils"))]
pub mod invariants;

pub use error::{DomainError, ErrorBody, ErrorCode};
pub use funding::{Decision, NewFunding};
pub use optimistic::{Optimistic, Reconciled};
pub use types::*;
