//! Settles ledger payouts against the transfer service, plus a long-running
//! background task that retries queued transfers.
//!
//! The ledger counts a payout as paid before any funds move. If the transfer
//! then fails, the configured [`SettlementPolicy`] decides what happens:
//!
//! * `reconcile`: keep the accounting and queue the transfer in the
//!   `reconciliations` table; [`run`] retries it until it goes through.
//! * `rollback`: reverse the payout in the ledger so it can be claimed again.
//!   If the ledger refuses the reversal (the package closed in the meantime),
//!   the transfer is queued as under `reconcile`.
//!
//! A project's residual always follows `reconcile`, since a finished project
//! cannot be reopened.

use std::sync::Arc;
use std::time::Duration;

use milestone_escrow::{Payout, ProjectResidual};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::config::SettlementPolicy;
use crate::db;
use crate::errors::{ApiError, Result};
use crate::store::LedgerStore;
use crate::transfer::{AssetTransfer, TransferReceipt, TransferRequest};

/// A transfer waiting for reconciliation, as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ReconciliationRecord {
    pub id: i64,
    pub reference: String,
    pub payee: String,
    pub amount: String,
    /// JSON-encoded [`TransferRequest`].
    pub request: String,
    pub attempts: i64,
    pub last_error: String,
    pub resolved: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

pub struct Settlement {
    pub pool: SqlitePool,
    pub store: Arc<LedgerStore>,
    pub transfer: Arc<dyn AssetTransfer>,
    /// Account every transfer is paid from.
    pub payer: String,
    pub policy: SettlementPolicy,
}

impl Settlement {
    /// Move the funds for a payout the ledger has already recorded.
    pub async fn settle_payout(&self, payout: &Payout) -> Result<TransferReceipt> {
        let request = TransferRequest::for_payout(payout, &self.payer);
        let err = match self.transfer.transfer(&request).await {
            Ok(receipt) => {
                info!(
                    reference = %request.reference,
                    amount = %request.amount,
                    "Payout settled"
                );
                return Ok(receipt);
            }
            Err(err) => err,
        };
        warn!(
            reference = %request.reference,
            policy = self.policy.as_str(),
            "Payout transfer failed: {err}"
        );

        let applied = match self.policy {
            SettlementPolicy::Reconcile => {
                db::queue_reconciliation(&self.pool, &request, &err.to_string()).await?;
                SettlementPolicy::Reconcile
            }
            SettlementPolicy::Rollback => match self.roll_back(payout).await {
                Ok(()) => SettlementPolicy::Rollback,
                Err(ApiError::Ledger(refused)) => {
                    error!(
                        reference = %request.reference,
                        "Rollback refused ({refused}); queuing for reconciliation"
                    );
                    db::queue_reconciliation(&self.pool, &request, &err.to_string()).await?;
                    SettlementPolicy::Reconcile
                }
                Err(other) => return Err(other),
            },
        };

        Err(ApiError::Transfer {
            reference: request.reference,
            policy: applied.as_str(),
            message: err.to_string(),
        })
    }

    /// Return a finished project's unspent budget to its treasury. Nothing
    /// moves when the residual is zero.
    pub async fn settle_residual(
        &self,
        residual: &ProjectResidual,
    ) -> Result<Option<TransferReceipt>> {
        if residual.amount == 0 {
            return Ok(None);
        }
        let request = TransferRequest::for_residual(residual, &self.payer);
        match self.transfer.transfer(&request).await {
            Ok(receipt) => {
                info!(reference = %request.reference, "Residual returned to treasury");
                Ok(Some(receipt))
            }
            Err(err) => {
                warn!(reference = %request.reference, "Residual transfer failed: {err}");
                db::queue_reconciliation(&self.pool, &request, &err.to_string()).await?;
                Err(ApiError::Transfer {
                    reference: request.reference,
                    policy: SettlementPolicy::Reconcile.as_str(),
                    message: err.to_string(),
                })
            }
        }
    }

    async fn roll_back(&self, payout: &Payout) -> Result<()> {
        self.store
            .apply(
                payout.project_id,
                Some(payout.package_id),
                std::slice::from_ref(&payout.payee),
                |project| project.reverse_payout(payout),
            )
            .await?;
        info!(reference = %payout.reference(), "Payout rolled back");
        Ok(())
    }

    /// Retry every queued transfer once. Returns how many went through.
    pub async fn reconcile_once(&self) -> Result<usize> {
        let pending = db::pending_reconciliations(&self.pool).await?;
        let mut settled = 0;
        for row in pending {
            let request: TransferRequest = serde_json::from_str(&row.request)?;
            match self.transfer.transfer(&request).await {
                Ok(_) => {
                    db::mark_reconciled(&self.pool, row.id).await?;
                    settled += 1;
                }
                Err(err) => {
                    warn!(reference = %row.reference, attempts = row.attempts + 1, "Reconciliation failed: {err}");
                    db::record_reconcile_failure(&self.pool, row.id, &err.to_string()).await?;
                }
            }
        }
        Ok(settled)
    }
}

/// Spawn the reconciliation loop as a background [`tokio`] task.
pub async fn run(settlement: Arc<Settlement>, interval: Duration) {
    info!("Reconciler starting, every {}s", interval.as_secs());

    loop {
        tokio::time::sleep(interval).await;
        match settlement.reconcile_once().await {
            Ok(0) => {}
            Ok(settled) => info!("Reconciled {settled} queued transfer(s)"),
            Err(e) => error!("Reconciliation pass error: {e}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use milestone_escrow::{PackageBudget, ParticipantId, ProjectId, SharedLedger};

    use super::*;
    use crate::transfer::TransferError;

    /// Records every request; fails while `failing` is set.
    #[derive(Default)]
    pub(crate) struct MockTransfer {
        pub failing: AtomicBool,
        pub calls: AtomicU32,
        pub requests: Mutex<Vec<TransferRequest>>,
    }

    impl MockTransfer {
        pub fn failing() -> Self {
            let mock = Self::default();
            mock.failing.store(true, Ordering::SeqCst);
            mock
        }
    }

    #[async_trait]
    impl AssetTransfer for MockTransfer {
        async fn transfer(
            &self,
            request: &TransferRequest,
        ) -> std::result::Result<TransferReceipt, TransferError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.requests.lock().unwrap().push(request.clone());
            if self.failing.load(Ordering::SeqCst) {
                return Err(TransferError {
                    message: "transfer service unavailable".into(),
                    attempts: 1,
                });
            }
            Ok(TransferReceipt {
                transfer_id: Some(format!("tx-{n}")),
            })
        }
    }

    async fn setup(
        mock: Arc<MockTransfer>,
        policy: SettlementPolicy,
    ) -> (Settlement, ProjectId, Payout) {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        let store = Arc::new(LedgerStore::new(Arc::new(SharedLedger::new()), pool.clone()));
        let ledger = store.ledger();
        let (id, _, _) = ledger.create_project("USDC".into(), 1_000).unwrap();
        let alice = ParticipantId::from("alice");
        let (payout, _) = ledger
            .with_project(id, |p| {
                p.approve()?;
                p.start("factory".into())?;
                let pkg = p.create_package(PackageBudget::new(400, 0, 0))?;
                p.add_collaborators(pkg, &[(alice.clone(), 150)])?;
                p.approve_collaborator(pkg, &alice, true)?;
                p.claim_mgp(pkg, &alice)
            })
            .unwrap();
        let settlement = Settlement {
            pool,
            store,
            transfer: mock,
            payer: "escrow-main".into(),
            policy,
        };
        (settlement, id, payout)
    }

    #[tokio::test]
    async fn successful_transfer_keeps_the_payout() {
        let mock = Arc::new(MockTransfer::default());
        let (settlement, id, payout) = setup(Arc::clone(&mock), SettlementPolicy::Rollback).await;

        let receipt = settlement.settle_payout(&payout).await.unwrap();
        assert_eq!(receipt.transfer_id.as_deref(), Some("tx-1"));
        assert_eq!(mock.requests.lock().unwrap()[0].payer, "escrow-main");
        assert_eq!(settlement.store.ledger().snapshot(id).unwrap().budget_paid(), 150);
    }

    #[tokio::test]
    async fn rollback_reverses_the_payout() {
        let mock = Arc::new(MockTransfer::failing());
        let (settlement, id, payout) = setup(Arc::clone(&mock), SettlementPolicy::Rollback).await;

        let err = settlement.settle_payout(&payout).await.unwrap_err();
        assert!(matches!(err, ApiError::Transfer { policy: "rollback", .. }));
        let project = settlement.store.ledger().snapshot(id).unwrap();
        assert_eq!(project.budget_paid(), 0);
        assert!(!project.package(0).unwrap().collaborator(&payout.payee).unwrap().mgp_paid);

        let stored = db::get_events_for_project(&settlement.pool, id).await.unwrap();
        assert_eq!(stored.last().unwrap().event_type, "payout_reversed");
        assert!(db::pending_reconciliations(&settlement.pool).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconcile_queues_and_retries() {
        let mock = Arc::new(MockTransfer::failing());
        let (settlement, id, payout) = setup(Arc::clone(&mock), SettlementPolicy::Reconcile).await;

        let err = settlement.settle_payout(&payout).await.unwrap_err();
        assert!(matches!(err, ApiError::Transfer { policy: "reconcile", .. }));
        assert_eq!(settlement.store.ledger().snapshot(id).unwrap().budget_paid(), 150);

        assert_eq!(settlement.reconcile_once().await.unwrap(), 0);
        mock.failing.store(false, Ordering::SeqCst);
        assert_eq!(settlement.reconcile_once().await.unwrap(), 1);
        assert_eq!(settlement.reconcile_once().await.unwrap(), 0);

        let rows = db::all_reconciliations(&settlement.pool).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].resolved);
        assert_eq!(rows[0].attempts, 2);
        assert_eq!(rows[0].reference, payout.reference());
    }

    #[tokio::test]
    async fn refused_rollback_falls_back_to_reconcile() {
        let mock = Arc::new(MockTransfer::failing());
        let (settlement, id, payout) = setup(Arc::clone(&mock), SettlementPolicy::Rollback).await;
        settlement
            .store
            .ledger()
            .with_project(id, |p| p.finish_package(payout.package_id))
            .unwrap();

        let err = settlement.settle_payout(&payout).await.unwrap_err();
        assert!(matches!(err, ApiError::Transfer { policy: "reconcile", .. }));
        assert_eq!(settlement.store.ledger().snapshot(id).unwrap().budget_paid(), 150);
        assert_eq!(db::pending_reconciliations(&settlement.pool).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn zero_residual_moves_nothing() {
        let mock = Arc::new(MockTransfer::default());
        let (settlement, id, _) = setup(Arc::clone(&mock), SettlementPolicy::Reconcile).await;
        let residual = ProjectResidual {
            project_id: id,
            asset: "USDC".into(),
            treasury: "treasury".into(),
            amount: 0,
        };
        assert_eq!(settlement.settle_residual(&residual).await.unwrap(), None);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
    }
}
