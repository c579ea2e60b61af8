//! # Types
//!
//! Shared data structures used across all modules of the escrow ledger.
//!
//! ## Design decisions
//!
//! ### Opaque identities
//!
//! Participants, assets and external collaborator handles are carried as
//! opaque strings. The ledger compares them for equality and uses them as
//! map keys, nothing more. Authentication of whoever stands behind a
//! [`ParticipantId`] happens outside the ledger.
//!
//! ### Status as a Finite-State Machine
//!
//! [`ProjectState`] and [`PackageState`] are forward-only:
//!
//! ```text
//! Project:  Created ──► Approved ──► Active ──► Finished
//! Package:  Active ──► Cancelled
//!              └─────► Finished
//! ```
//!
//! [`ApprovalState`] is the collaborator's review outcome. The dispute flag
//! is a separate field on the collaborator and never folded into it.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{LedgerError, Result};

/// Quantity of the project's fungible asset.
pub type Amount = u128;

/// Bonus weight, on the scale set by a package's `max_bonus_scores`.
pub type Score = u64;

pub type ProjectId = u64;
pub type PackageId = u64;

/// Parts-per-million: the default bonus denominator.
pub const DEFAULT_MAX_BONUS_SCORES: Score = 1_000_000;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

opaque_id!(
    /// Address of a collaborator or observer.
    ParticipantId
);
opaque_id!(
    /// Identifier of the fungible asset a project is budgeted in.
    AssetId
);
opaque_id!(
    /// Handle to an out-of-ledger collaborator (token factory, treasury).
    ExternalRef
);

/// Lifecycle status of a project.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectState {
    /// Budget committed, awaiting approval.
    Created,
    /// Approved; not yet accepting packages.
    Approved,
    /// Packages may be created and worked.
    Active,
    /// Closed; the residual has been reported. Immutable.
    Finished,
}

/// Lifecycle status of a package.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    /// Created and open for admission, approval and payment.
    Active,
    /// Cancelled before any approval; reservation returned.
    Cancelled,
    /// All collaborators resolved; unspent MGP and bonus returned.
    Finished,
}

impl PackageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Finished)
    }
}

/// Review outcome for a collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
}

/// The three sub-budgets a package reserves from its project.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageBudget {
    /// Guaranteed-fee pool for collaborators.
    pub mgp: Amount,
    /// Score-weighted bonus pool.
    pub bonus: Amount,
    /// Flat fee pool split evenly among observers.
    pub observer_fee: Amount,
}

impl PackageBudget {
    pub fn new(mgp: Amount, bonus: Amount, observer_fee: Amount) -> Self {
        Self {
            mgp,
            bonus,
            observer_fee,
        }
    }

    /// Sum of the three pools.
    pub fn total(&self) -> Result<Amount> {
        checked_add(self.mgp, self.bonus, "package budget")
            .and_then(|sum| checked_add(sum, self.observer_fee, "package budget"))
    }
}

/// What a payout settles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutKind {
    Mgp,
    Bonus,
    /// Bonus awarded through arbitration for a disputed collaborator.
    ArbitratedBonus,
    ObserverFee,
}

impl PayoutKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mgp => "mgp",
            Self::Bonus => "bonus",
            Self::ArbitratedBonus => "arbitrated_bonus",
            Self::ObserverFee => "observer_fee",
        }
    }
}

/// Receipt for one disbursement the ledger has accounted for.
///
/// Handed to the asset-transfer collaborator, which moves `amount` of
/// `asset` to `payee`. The ledger has already counted it as paid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub project_id: ProjectId,
    pub package_id: PackageId,
    pub payee: ParticipantId,
    pub asset: AssetId,
    pub amount: Amount,
    pub kind: PayoutKind,
}

impl Payout {
    /// Stable identifier; each (package, payee, kind) is settled at most once.
    pub fn reference(&self) -> String {
        format!(
            "{}-{}-{}-{}",
            self.project_id,
            self.package_id,
            self.kind.as_str(),
            self.payee
        )
    }
}

/// Unspent project budget reported when a project finishes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectResidual {
    pub project_id: ProjectId,
    pub asset: AssetId,
    pub treasury: ExternalRef,
    pub amount: Amount,
}

pub(crate) fn checked_add(a: Amount, b: Amount, what: &'static str) -> Result<Amount> {
    a.checked_add(b).ok_or(LedgerError::ArithmeticOverflow(what))
}

pub(crate) fn checked_sub(a: Amount, b: Amount, what: &'static str) -> Result<Amount> {
    a.checked_sub(b).ok_or_else(|| {
        LedgerError::InvariantViolation(format!("{what}: {b} exceeds {a}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_budget_total_sums_pools() {
        let budget = PackageBudget::new(400, 100, 100);
        assert_eq!(budget.total(), Ok(600));
    }

    #[test]
    fn package_budget_total_reports_overflow() {
        let budget = PackageBudget::new(Amount::MAX, 1, 0);
        assert_eq!(
            budget.total(),
            Err(LedgerError::ArithmeticOverflow("package budget"))
        );
    }

    #[test]
    fn payout_reference_is_stable() {
        let payout = Payout {
            project_id: 3,
            package_id: 1,
            payee: "alice".into(),
            asset: "USDC".into(),
            amount: 150,
            kind: PayoutKind::Mgp,
        };
        assert_eq!(payout.reference(), "3-1-mgp-alice");
    }

    #[test]
    fn opaque_ids_serialize_as_plain_strings() {
        let id = ParticipantId::new("GABC");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"GABC\"");
        assert_eq!(id.to_string(), "GABC");
    }
}
