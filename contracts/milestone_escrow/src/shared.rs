//! Concurrent project store.
//!
//! One `Mutex` per project behind a map guarded by an `RwLock`. The map lock
//! is held only long enough to look up or insert a project handle, so
//! operations on different projects never contend. Operations never panic
//! while holding a project lock, which makes recovering a poisoned guard
//! safe: the state behind it is whatever the last successful call left.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tracing::warn;

use crate::errors::{LedgerError, Result};
use crate::events::LedgerEvent;
use crate::project::Project;
use crate::storage::{self, LedgerRecord, RecordKey};
use crate::types::{Amount, AssetId, ProjectId};

type ProjectHandle = Arc<Mutex<Project>>;

#[derive(Debug, Default)]
pub struct SharedLedger {
    projects: RwLock<HashMap<ProjectId, ProjectHandle>>,
    next_project_id: AtomicU64,
}

impl SharedLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_projects(projects: Vec<Project>) -> Self {
        let next = projects.iter().map(|p| p.id() + 1).max().unwrap_or(0);
        let map = projects
            .into_iter()
            .map(|p| (p.id(), Arc::new(Mutex::new(p))))
            .collect();
        Self {
            projects: RwLock::new(map),
            next_project_id: AtomicU64::new(next),
        }
    }

    pub fn restore(records: impl IntoIterator<Item = LedgerRecord>) -> Result<Self> {
        Ok(Self::from_projects(storage::restore_projects(records)?))
    }

    /// Create a project and return its id, the events it emitted and its
    /// record.
    pub fn create_project(
        &self,
        token: AssetId,
        budget_total: Amount,
    ) -> Result<(ProjectId, Vec<LedgerEvent>, Vec<LedgerRecord>)> {
        let mut projects = self.projects.write().unwrap_or_else(PoisonError::into_inner);
        let id = self.next_project_id.load(Ordering::SeqCst);
        let mut project = Project::create(id, token, budget_total)?;
        let events = project.drain_events();
        let records = project.records();
        projects.insert(id, Arc::new(Mutex::new(project)));
        self.next_project_id.store(id + 1, Ordering::SeqCst);
        Ok((id, events, records))
    }

    /// Id the next [`create_project`](Self::create_project) will assign.
    pub fn next_project_id(&self) -> ProjectId {
        self.next_project_id.load(Ordering::SeqCst)
    }

    pub fn contains(&self, id: ProjectId) -> bool {
        self.projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    fn handle(&self, id: ProjectId) -> Result<ProjectHandle> {
        self.projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(LedgerError::NotFound(RecordKey::Project(id)))
    }

    fn lock(handle: &ProjectHandle) -> MutexGuard<'_, Project> {
        handle.lock().unwrap_or_else(|poisoned| {
            warn!("recovering poisoned project lock");
            poisoned.into_inner()
        })
    }

    /// Run `op` under the project's lock and return its value with the
    /// events it emitted. A failed `op` emits nothing.
    pub fn with_project<T>(
        &self,
        id: ProjectId,
        op: impl FnOnce(&mut Project) -> Result<T>,
    ) -> Result<(T, Vec<LedgerEvent>)> {
        let handle = self.handle(id)?;
        let mut project = Self::lock(&handle);
        match op(&mut project) {
            Ok(value) => Ok((value, project.drain_events())),
            Err(err) => {
                project.drain_events();
                warn!(project_id = id, error = %err, "operation rejected");
                Err(err)
            }
        }
    }

    /// A point-in-time copy of one project.
    pub fn snapshot(&self, id: ProjectId) -> Result<Project> {
        let handle = self.handle(id)?;
        let project = Self::lock(&handle);
        Ok(project.clone())
    }

    pub fn project_ids(&self) -> Vec<ProjectId> {
        let mut ids: Vec<_> = self
            .projects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Every record of every project, for a full export.
    pub fn records(&self) -> Vec<LedgerRecord> {
        self.project_ids()
            .into_iter()
            .filter_map(|id| self.snapshot(id).ok())
            .flat_map(|project| project.records())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.projects.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::types::{PackageBudget, ParticipantId};

    fn active(ledger: &SharedLedger, budget: Amount) -> ProjectId {
        let (id, events, _) = ledger.create_project("USDC".into(), budget).unwrap();
        assert_eq!(events.len(), 1);
        ledger.with_project(id, |p| p.approve()).unwrap();
        ledger.with_project(id, |p| p.start("factory".into())).unwrap();
        id
    }

    #[test]
    fn ids_are_sequential() {
        let ledger = SharedLedger::new();
        assert_eq!(active(&ledger, 10), 0);
        assert_eq!(active(&ledger, 10), 1);
        assert!(ledger.create_project("USDC".into(), 0).is_err());
        assert_eq!(active(&ledger, 10), 2);
        assert_eq!(ledger.project_ids(), vec![0, 1, 2]);
    }

    #[test]
    fn failed_operation_returns_no_events() {
        let ledger = SharedLedger::new();
        let id = active(&ledger, 10);
        let err = ledger
            .with_project(id, |p| p.create_package(PackageBudget::new(11, 0, 0)))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvariantViolation(_)));
        let (_, events) = ledger
            .with_project(id, |p| p.create_package(PackageBudget::new(10, 0, 0)))
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn next_id_is_the_one_assigned() {
        let ledger = SharedLedger::new();
        assert_eq!(ledger.next_project_id(), 0);
        let (id, _, _) = ledger.create_project("USDC".into(), 10).unwrap();
        assert_eq!(id, 0);
        assert!(ledger.contains(0));
        assert!(!ledger.contains(1));
        assert_eq!(ledger.next_project_id(), 1);

        let restored = SharedLedger::restore(ledger.records()).unwrap();
        assert_eq!(restored.next_project_id(), 1);
    }

    #[test]
    fn unknown_project_is_not_found() {
        let ledger = SharedLedger::new();
        let err = ledger.with_project(7, |p| p.approve()).unwrap_err();
        assert_eq!(err, LedgerError::NotFound(RecordKey::Project(7)));
    }

    #[test]
    fn concurrent_reservations_never_overcommit() {
        let ledger = Arc::new(SharedLedger::new());
        let id = active(&ledger, 100);
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    (0..10)
                        .filter(|_| {
                            ledger
                                .with_project(id, |p| p.create_package(PackageBudget::new(2, 0, 0)))
                                .is_ok()
                        })
                        .count()
                })
            })
            .collect();
        let created: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();
        assert_eq!(created, 50);
        let project = ledger.snapshot(id).unwrap();
        assert_eq!(project.budget_allocated(), 100);
        assert_eq!(project.package_count(), 50);
        crate::invariants::assert_all_project_invariants(&project);
    }

    #[test]
    fn projects_progress_independently() {
        let ledger = Arc::new(SharedLedger::new());
        let ids: Vec<_> = (0..4).map(|_| active(&ledger, 1_000)).collect();
        let workers: Vec<_> = ids
            .iter()
            .map(|&id| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    let alice = ParticipantId::from("alice");
                    ledger
                        .with_project(id, |p| {
                            let pkg = p.create_package(PackageBudget::new(400, 0, 0))?;
                            p.add_collaborators(pkg, &[(alice.clone(), 150)])?;
                            p.approve_collaborator(pkg, &alice, true)?;
                            p.claim_mgp(pkg, &alice)
                        })
                        .unwrap()
                })
            })
            .collect();
        for worker in workers {
            let (payout, events) = worker.join().unwrap();
            assert_eq!(payout.amount, 150);
            assert_eq!(events.len(), 4);
        }
        for id in ids {
            assert_eq!(ledger.snapshot(id).unwrap().budget_paid(), 150);
        }
    }
}
