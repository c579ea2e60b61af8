//! Events emitted by the ledger.
//!
//! A [`Project`](crate::project::Project) queues one event per successful
//! state transition; failed operations emit nothing. Callers drain the queue
//! after each operation (see [`Project::drain_events`](crate::project::Project::drain_events)).

use serde::{Deserialize, Serialize};

use crate::types::{
    Amount, AssetId, ExternalRef, PackageBudget, PackageId, ParticipantId, Payout, ProjectId,
    Score,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEvent {
    ProjectCreated {
        project_id: ProjectId,
        token: AssetId,
        budget_total: Amount,
    },
    ProjectApproved {
        project_id: ProjectId,
    },
    ProjectStarted {
        project_id: ProjectId,
        token_factory: ExternalRef,
    },
    ProjectFinished {
        project_id: ProjectId,
        treasury: ExternalRef,
        residual: Amount,
    },
    PackageCreated {
        project_id: ProjectId,
        package_id: PackageId,
        budget: PackageBudget,
    },
    PackageCancelled {
        project_id: ProjectId,
        package_id: PackageId,
        returned: Amount,
    },
    PackageFinished {
        project_id: ProjectId,
        package_id: PackageId,
        returned: Amount,
    },
    ObserversAdded {
        project_id: ProjectId,
        package_id: PackageId,
        observers: Vec<ParticipantId>,
    },
    CollaboratorsAdded {
        project_id: ProjectId,
        package_id: PackageId,
        collaborators: Vec<ParticipantId>,
        reserved: Amount,
    },
    CollaboratorApproved {
        project_id: ProjectId,
        package_id: PackageId,
        collaborator: ParticipantId,
    },
    CollaboratorRejected {
        project_id: ProjectId,
        package_id: PackageId,
        collaborator: ParticipantId,
        released: Amount,
    },
    BonusScoresSet {
        project_id: ProjectId,
        package_id: PackageId,
        total_bonus_scores: Score,
        max_bonus_scores: Score,
    },
    PayoutRecorded {
        payout: Payout,
    },
    PayoutReversed {
        payout: Payout,
    },
    DisputeRaised {
        project_id: ProjectId,
        package_id: PackageId,
        collaborator: ParticipantId,
    },
    DisputeResolved {
        project_id: ProjectId,
        package_id: PackageId,
        collaborator: ParticipantId,
    },
}

impl LedgerEvent {
    /// Short identifier suitable for storage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ProjectCreated { .. } => "project_created",
            Self::ProjectApproved { .. } => "project_approved",
            Self::ProjectStarted { .. } => "project_started",
            Self::ProjectFinished { .. } => "project_finished",
            Self::PackageCreated { .. } => "package_created",
            Self::PackageCancelled { .. } => "package_cancelled",
            Self::PackageFinished { .. } => "package_finished",
            Self::ObserversAdded { .. } => "observers_added",
            Self::CollaboratorsAdded { .. } => "collaborators_added",
            Self::CollaboratorApproved { .. } => "collaborator_approved",
            Self::CollaboratorRejected { .. } => "collaborator_rejected",
            Self::BonusScoresSet { .. } => "bonus_scores_set",
            Self::PayoutRecorded { .. } => "payout_recorded",
            Self::PayoutReversed { .. } => "payout_reversed",
            Self::DisputeRaised { .. } => "dispute_raised",
            Self::DisputeResolved { .. } => "dispute_resolved",
        }
    }

    pub fn project_id(&self) -> ProjectId {
        match self {
            Self::ProjectCreated { project_id, .. }
            | Self::ProjectApproved { project_id }
            | Self::ProjectStarted { project_id, .. }
            | Self::ProjectFinished { project_id, .. }
            | Self::PackageCreated { project_id, .. }
            | Self::PackageCancelled { project_id, .. }
            | Self::PackageFinished { project_id, .. }
            | Self::ObserversAdded { project_id, .. }
            | Self::CollaboratorsAdded { project_id, .. }
            | Self::CollaboratorApproved { project_id, .. }
            | Self::CollaboratorRejected { project_id, .. }
            | Self::BonusScoresSet { project_id, .. }
            | Self::DisputeRaised { project_id, .. }
            | Self::DisputeResolved { project_id, .. } => *project_id,
            Self::PayoutRecorded { payout } | Self::PayoutReversed { payout } => {
                payout.project_id
            }
        }
    }

    pub fn package_id(&self) -> Option<PackageId> {
        match self {
            Self::ProjectCreated { .. }
            | Self::ProjectApproved { .. }
            | Self::ProjectStarted { .. }
            | Self::ProjectFinished { .. } => None,
            Self::PackageCreated { package_id, .. }
            | Self::PackageCancelled { package_id, .. }
            | Self::PackageFinished { package_id, .. }
            | Self::ObserversAdded { package_id, .. }
            | Self::CollaboratorsAdded { package_id, .. }
            | Self::CollaboratorApproved { package_id, .. }
            | Self::CollaboratorRejected { package_id, .. }
            | Self::BonusScoresSet { package_id, .. }
            | Self::DisputeRaised { package_id, .. }
            | Self::DisputeResolved { package_id, .. } => Some(*package_id),
            Self::PayoutRecorded { payout } | Self::PayoutReversed { payout } => {
                Some(payout.package_id)
            }
        }
    }

    /// The single participant the event concerns, if any.
    pub fn actor(&self) -> Option<&ParticipantId> {
        match self {
            Self::CollaboratorApproved { collaborator, .. }
            | Self::CollaboratorRejected { collaborator, .. }
            | Self::DisputeRaised { collaborator, .. }
            | Self::DisputeResolved { collaborator, .. } => Some(collaborator),
            Self::PayoutRecorded { payout } | Self::PayoutReversed { payout } => {
                Some(&payout.payee)
            }
            _ => None,
        }
    }

    /// The amount of budget the event moved, if any.
    pub fn amount(&self) -> Option<Amount> {
        match self {
            Self::ProjectCreated { budget_total, .. } => Some(*budget_total),
            Self::ProjectFinished { residual, .. } => Some(*residual),
            Self::PackageCreated { budget, .. } => budget.total().ok(),
            Self::PackageCancelled { returned, .. } | Self::PackageFinished { returned, .. } => {
                Some(*returned)
            }
            Self::CollaboratorsAdded { reserved, .. } => Some(*reserved),
            Self::CollaboratorRejected { released, .. } => Some(*released),
            Self::PayoutRecorded { payout } | Self::PayoutReversed { payout } => {
                Some(payout.amount)
            }
            _ => None,
        }
    }
}
