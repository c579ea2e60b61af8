//! Ordered writes to the ledger and its SQLite copy.
//!
//! A ledger operation and the commit of the records it touched run under one
//! per-project writer lock, so commits reach the database in the order the
//! mutations happened. Without it an older package snapshot could land after
//! a newer one and leave a store that no longer restores. Reads go straight
//! to the [`SharedLedger`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use milestone_escrow::{
    Amount, AssetId, LedgerError, LedgerEvent, LedgerRecord, PackageId, ParticipantId, Project,
    ProjectId, RecordKey, SharedLedger,
};
use sqlx::SqlitePool;
use tokio::sync::Mutex as WriterLock;
use tracing::error;

use crate::db;
use crate::errors::Result;

pub struct LedgerStore {
    ledger: Arc<SharedLedger>,
    pool: SqlitePool,
    writers: Mutex<HashMap<ProjectId, Arc<WriterLock<()>>>>,
    /// Serializes project creation, which picks the next id.
    creating: WriterLock<()>,
}

impl LedgerStore {
    pub fn new(ledger: Arc<SharedLedger>, pool: SqlitePool) -> Self {
        Self {
            ledger,
            pool,
            writers: Mutex::new(HashMap::new()),
            creating: WriterLock::new(()),
        }
    }

    pub fn ledger(&self) -> &SharedLedger {
        &self.ledger
    }

    fn writer(&self, id: ProjectId) -> Arc<WriterLock<()>> {
        let mut writers = self.writers.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(writers.entry(id).or_default())
    }

    /// Create a project and persist it before any other write can reach it.
    pub async fn create_project(&self, token: AssetId, budget_total: Amount) -> Result<ProjectId> {
        let _creating = self.creating.lock().await;
        let writer = self.writer(self.ledger.next_project_id());
        let _guard = writer.lock().await;
        let (id, events, records) = self.ledger.create_project(token, budget_total)?;
        self.persist(id, &records, &events).await?;
        Ok(id)
    }

    /// Run `op` and persist the records it returns together with the events
    /// it emitted.
    pub async fn commit<T>(
        &self,
        project_id: ProjectId,
        op: impl FnOnce(&mut Project) -> milestone_escrow::Result<(T, Vec<LedgerRecord>)>,
    ) -> Result<T> {
        if !self.ledger.contains(project_id) {
            return Err(LedgerError::NotFound(RecordKey::Project(project_id)).into());
        }
        let writer = self.writer(project_id);
        let _guard = writer.lock().await;
        let ((value, records), events) = self.ledger.with_project(project_id, op)?;
        self.persist(project_id, &records, &events).await?;
        Ok(value)
    }

    /// [`commit`](Self::commit) the project record, the given package and
    /// the named participants.
    pub async fn apply<T>(
        &self,
        project_id: ProjectId,
        package_id: Option<PackageId>,
        participants: &[ParticipantId],
        op: impl FnOnce(&mut Project) -> milestone_escrow::Result<T>,
    ) -> Result<T> {
        self.commit(project_id, |project| {
            let value = op(project)?;
            Ok((value, project.records_for(package_id, participants)))
        })
        .await
    }

    async fn persist(
        &self,
        project_id: ProjectId,
        records: &[LedgerRecord],
        events: &[LedgerEvent],
    ) -> Result<()> {
        if let Err(e) = db::save_changes(&self.pool, records, events).await {
            error!(project_id, "Ledger change applied in memory but not persisted: {e}");
            return Err(e);
        }
        Ok(())
    }
}
