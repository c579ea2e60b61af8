//! # Storage
//!
//! The ledger lives in memory; this module defines the record layout a host
//! uses to make it durable. Four key shapes address every persisted record:
//!
//! | Key                                   | Record                     | Description                          |
//! |---------------------------------------|----------------------------|--------------------------------------|
//! | `project/{p}`                         | [`ProjectRecord`]          | Budget counters and lifecycle state  |
//! | `project/{p}/package/{k}`             | [`PackageRecord`]          | Pool counters and running sums       |
//! | `project/{p}/package/{k}/collaborator/{who}` | [`Collaborator`]    | Roster entry                         |
//! | `project/{p}/package/{k}/observer/{who}`     | [`Observer`]        | Roster entry                         |
//!
//! ## Why export touched records?
//!
//! A roster may grow large. After an operation the host only needs to write
//! the project record, the package it touched and the participants named in
//! the call; [`Project::records_for`] returns exactly those.
//!
//! Restoring rebuilds every running sum from the roster entries and then runs
//! the invariant checks, so a corrupted store is rejected rather than loaded.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::collaborator::{Collaborator, CollaboratorLedger};
use crate::errors::{LedgerError, Result};
use crate::invariants;
use crate::observer::{Observer, ObserverLedger};
use crate::package::Package;
use crate::project::Project;
use crate::types::{
    Amount, AssetId, ExternalRef, PackageId, PackageState, ParticipantId, ProjectId,
    ProjectState, Score,
};

// ── Keys ─────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Project(ProjectId),
    Package(ProjectId, PackageId),
    Collaborator(ProjectId, PackageId, ParticipantId),
    Observer(ProjectId, PackageId, ParticipantId),
}

impl RecordKey {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Project(_) => "project",
            Self::Package(..) => "package",
            Self::Collaborator(..) => "collaborator",
            Self::Observer(..) => "observer",
        }
    }

    pub fn project_id(&self) -> ProjectId {
        match self {
            Self::Project(p)
            | Self::Package(p, _)
            | Self::Collaborator(p, _, _)
            | Self::Observer(p, _, _) => *p,
        }
    }

    pub fn package_id(&self) -> Option<PackageId> {
        match self {
            Self::Project(_) => None,
            Self::Package(_, k) | Self::Collaborator(_, k, _) | Self::Observer(_, k, _) => Some(*k),
        }
    }

    pub fn participant(&self) -> Option<&ParticipantId> {
        match self {
            Self::Collaborator(_, _, who) | Self::Observer(_, _, who) => Some(who),
            _ => None,
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Project(p) => write!(f, "project/{p}"),
            Self::Package(p, k) => write!(f, "project/{p}/package/{k}"),
            Self::Collaborator(p, k, who) => write!(f, "project/{p}/package/{k}/collaborator/{who}"),
            Self::Observer(p, k, who) => write!(f, "project/{p}/package/{k}/observer/{who}"),
        }
    }
}

// ── Records ──────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub token: AssetId,
    pub budget_total: Amount,
    pub budget_allocated: Amount,
    pub budget_paid: Amount,
    pub state: ProjectState,
    pub package_count: u64,
    pub token_factory: Option<ExternalRef>,
    pub treasury: Option<ExternalRef>,
    pub residual: Option<Amount>,
}

/// Package counters. Roster-derived sums (approved, rejected, disputes,
/// score total) are not stored; they are rebuilt from the roster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub project_id: ProjectId,
    pub id: PackageId,
    pub mgp_budget: Amount,
    pub mgp_paid: Amount,
    pub mgp_reserved: Amount,
    pub bonus_budget: Amount,
    pub bonus_paid: Amount,
    pub observer_fee_budget: Amount,
    pub observer_fee_paid: Amount,
    pub collaborator_count: u64,
    pub observer_count: u64,
    pub total_bonus_scores: Score,
    pub max_bonus_scores: Score,
    pub state: PackageState,
    pub budget_returned: Amount,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerRecord {
    Project(ProjectRecord),
    Package(PackageRecord),
    Collaborator {
        project_id: ProjectId,
        package_id: PackageId,
        collaborator: Collaborator,
    },
    Observer {
        project_id: ProjectId,
        package_id: PackageId,
        observer: Observer,
    },
}

impl LedgerRecord {
    pub fn key(&self) -> RecordKey {
        match self {
            Self::Project(record) => RecordKey::Project(record.id),
            Self::Package(record) => RecordKey::Package(record.project_id, record.id),
            Self::Collaborator {
                project_id,
                package_id,
                collaborator,
            } => RecordKey::Collaborator(*project_id, *package_id, collaborator.participant.clone()),
            Self::Observer {
                project_id,
                package_id,
                observer,
            } => RecordKey::Observer(*project_id, *package_id, observer.participant.clone()),
        }
    }
}

// ── Export ───────────────────────────────────────────────────────────

impl Project {
    pub fn to_record(&self) -> ProjectRecord {
        ProjectRecord {
            id: self.id,
            token: self.token.clone(),
            budget_total: self.budget_total,
            budget_allocated: self.budget_allocated,
            budget_paid: self.budget_paid,
            state: self.state,
            package_count: self.package_count,
            token_factory: self.token_factory.clone(),
            treasury: self.treasury.clone(),
            residual: self.residual,
        }
    }

    /// Every record of the project, packages and rosters included.
    pub fn records(&self) -> Vec<LedgerRecord> {
        let mut records = vec![LedgerRecord::Project(self.to_record())];
        for package in self.packages.values() {
            records.extend(package.records());
        }
        records
    }

    /// The project record, plus the given package and the named participants
    /// in it when present. Unknown names are skipped.
    pub fn records_for(
        &self,
        package_id: Option<PackageId>,
        participants: &[ParticipantId],
    ) -> Vec<LedgerRecord> {
        let mut records = vec![LedgerRecord::Project(self.to_record())];
        let Some(package) = package_id.and_then(|id| self.packages.get(&id)) else {
            return records;
        };
        records.push(LedgerRecord::Package(package.to_record()));
        for who in participants {
            if let Some(collaborator) = package.collaborators.get(who) {
                records.push(package.collaborator_record(collaborator));
            }
            if let Some(observer) = package.observers.get(who) {
                records.push(package.observer_record(observer));
            }
        }
        records
    }

    fn from_record(record: ProjectRecord) -> Self {
        Self {
            id: record.id,
            token: record.token,
            budget_total: record.budget_total,
            budget_allocated: record.budget_allocated,
            budget_paid: record.budget_paid,
            state: record.state,
            package_count: record.package_count,
            open_packages: 0,
            token_factory: record.token_factory,
            treasury: record.treasury,
            residual: record.residual,
            packages: BTreeMap::new(),
            outbox: Vec::new(),
        }
    }
}

impl Package {
    pub fn to_record(&self) -> PackageRecord {
        PackageRecord {
            project_id: self.project_id,
            id: self.id,
            mgp_budget: self.mgp_budget,
            mgp_paid: self.mgp_paid,
            mgp_reserved: self.mgp_reserved,
            bonus_budget: self.bonus_budget,
            bonus_paid: self.bonus_paid,
            observer_fee_budget: self.observer_fee_budget,
            observer_fee_paid: self.observer_fee_paid,
            collaborator_count: self.collaborator_count,
            observer_count: self.observer_count,
            total_bonus_scores: self.total_bonus_scores,
            max_bonus_scores: self.max_bonus_scores,
            state: self.state,
            budget_returned: self.budget_returned,
        }
    }

    pub fn records(&self) -> Vec<LedgerRecord> {
        let mut records = vec![LedgerRecord::Package(self.to_record())];
        records.extend(self.collaborators.iter().map(|c| self.collaborator_record(c)));
        records.extend(self.observers.iter().map(|o| self.observer_record(o)));
        records
    }

    fn collaborator_record(&self, collaborator: &Collaborator) -> LedgerRecord {
        LedgerRecord::Collaborator {
            project_id: self.project_id,
            package_id: self.id,
            collaborator: collaborator.clone(),
        }
    }

    fn observer_record(&self, observer: &Observer) -> LedgerRecord {
        LedgerRecord::Observer {
            project_id: self.project_id,
            package_id: self.id,
            observer: observer.clone(),
        }
    }

    fn from_record(record: PackageRecord) -> Self {
        Self {
            project_id: record.project_id,
            id: record.id,
            mgp_budget: record.mgp_budget,
            mgp_paid: record.mgp_paid,
            mgp_reserved: record.mgp_reserved,
            bonus_budget: record.bonus_budget,
            bonus_paid: record.bonus_paid,
            observer_fee_budget: record.observer_fee_budget,
            observer_fee_paid: record.observer_fee_paid,
            collaborator_count: record.collaborator_count,
            observer_count: record.observer_count,
            total_bonus_scores: record.total_bonus_scores,
            max_bonus_scores: record.max_bonus_scores,
            state: record.state,
            budget_returned: record.budget_returned,
            collaborators: CollaboratorLedger::new(),
            observers: ObserverLedger::new(),
        }
    }
}

// ── Restore ──────────────────────────────────────────────────────────

/// Rebuild projects from persisted records, in any order. Fails if a record
/// is orphaned or duplicated, or if the rebuilt state breaks an invariant.
pub fn restore_projects(records: impl IntoIterator<Item = LedgerRecord>) -> Result<Vec<Project>> {
    let mut projects: BTreeMap<ProjectId, Project> = BTreeMap::new();
    let mut packages = Vec::new();
    let mut rosters = Vec::new();

    for record in records {
        match record {
            LedgerRecord::Project(record) => {
                let key = RecordKey::Project(record.id);
                if projects.insert(record.id, Project::from_record(record)).is_some() {
                    return Err(duplicate(&key));
                }
            }
            LedgerRecord::Package(record) => packages.push(record),
            other => rosters.push(other),
        }
    }

    for record in packages {
        let key = RecordKey::Package(record.project_id, record.id);
        let project = projects
            .get_mut(&record.project_id)
            .ok_or_else(|| orphan(&key))?;
        let package = Package::from_record(record);
        if !package.state.is_terminal() {
            project.open_packages += 1;
        }
        if project.packages.insert(package.id, package).is_some() {
            return Err(duplicate(&key));
        }
    }

    for record in rosters {
        let key = record.key();
        let (project_id, package_id) = match &record {
            LedgerRecord::Collaborator {
                project_id,
                package_id,
                ..
            }
            | LedgerRecord::Observer {
                project_id,
                package_id,
                ..
            } => (*project_id, *package_id),
            _ => continue,
        };
        let package = projects
            .get_mut(&project_id)
            .and_then(|project| project.packages.get_mut(&package_id))
            .ok_or_else(|| orphan(&key))?;
        match record {
            LedgerRecord::Collaborator { collaborator, .. } => {
                if package.collaborators.get(&collaborator.participant).is_some() {
                    return Err(duplicate(&key));
                }
                package.collaborators.restore(collaborator)?;
            }
            LedgerRecord::Observer { observer, .. } => {
                if package.observers.get(&observer.participant).is_some() {
                    return Err(duplicate(&key));
                }
                package.observers.restore(observer);
            }
            _ => {}
        }
    }

    for project in projects.values() {
        invariants::check_project(project)?;
    }
    Ok(projects.into_values().collect())
}

fn orphan(key: &RecordKey) -> LedgerError {
    LedgerError::invariant(format!("record {key} has no parent"))
}

fn duplicate(key: &RecordKey) -> LedgerError {
    LedgerError::invariant(format!("record {key} appears twice"))
}
