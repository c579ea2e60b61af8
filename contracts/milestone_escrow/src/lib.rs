//! # Milestone Escrow Ledger
//!
//! Hierarchical escrow accounting for milestone-based collaborative funding.
//! A [`Project`] commits a budget in one asset, [`Package`]s reserve slices
//! of it for collaborators and observers, and payouts are accounted against
//! those reservations under strict conservation rules.
//!
//! | Phase        | Entry Point(s)                                                   |
//! |--------------|------------------------------------------------------------------|
//! | Lifecycle    | [`SharedLedger::create_project`], `approve`, `start`, `finish`  |
//! | Packages     | `create_package`, `create_packages`, `cancel_package`, `finish_package` |
//! | Roster       | `add_observers`, `add_collaborators`, `approve_collaborator`, `assign_bonus_scores` |
//! | Payouts      | `claim_mgp`, `claim_bonus`, `claim_observer_fee`, `reverse_payout` |
//! | Disputes     | `raise_dispute`, `resolve_dispute`, `pay_disputed_bonus`        |
//! | Persistence  | [`Project::records_for`], [`SharedLedger::records`], [`SharedLedger::restore`] |
//!
//! Everything past creation is a [`Project`] method run through
//! [`SharedLedger::with_project`].
//!
//! ## Architecture
//!
//! Entities own their children: a [`Project`] owns its packages, a
//! [`Package`] owns a collaborator and an observer roster. Every operation
//! validates first and mutates second, so an `Err` leaves state untouched.
//! [`SharedLedger`] is the store, with one lock per project. Asset movement
//! is out of scope: payouts return a [`Payout`] receipt for the caller to
//! settle.

pub mod collaborator;
pub mod dispute;
pub mod errors;
pub mod events;
pub mod invariants;
pub mod observer;
pub mod package;
pub mod project;
pub mod shared;
pub mod storage;
pub mod types;

#[cfg(test)]
mod test_events;
#[cfg(test)]
mod test_lifecycle;

pub use errors::{ErrorKind, LedgerError, Result};
pub use events::LedgerEvent;
pub use package::Package;
pub use project::Project;
pub use shared::SharedLedger;
pub use storage::{LedgerRecord, RecordKey};
pub use types::{
    Amount, ApprovalState, AssetId, ExternalRef, PackageBudget, PackageId, PackageState,
    ParticipantId, Payout, PayoutKind, ProjectId, ProjectResidual, ProjectState, Score,
    DEFAULT_MAX_BONUS_SCORES,
};
