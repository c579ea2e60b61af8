//! Axum REST API handlers.
//!
//! Every mutating handler goes through [`LedgerStore`], which runs one ledger
//! operation and persists the records it touched and the events it emitted
//! under the project's writer lock. Payout handlers additionally move the
//! funds through [`Settlement`] before answering.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use milestone_escrow::collaborator::Collaborator;
use milestone_escrow::observer::Observer;
use milestone_escrow::storage::{PackageRecord, ProjectRecord};
use milestone_escrow::{
    Amount, AssetId, ExternalRef, Package, PackageBudget, PackageId, ParticipantId, Payout,
    Project, ProjectId, ProjectResidual, Score, SharedLedger,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::db;
use crate::errors::Result;
use crate::events::EventRecord;
use crate::settlement::{ReconciliationRecord, Settlement};
use crate::store::LedgerStore;
use crate::transfer::TransferReceipt;

pub struct ApiState {
    pub store: Arc<LedgerStore>,
    pub pool: SqlitePool,
    pub settlement: Arc<Settlement>,
}

impl ApiState {
    fn ledger(&self) -> &SharedLedger {
        self.store.ledger()
    }

    async fn apply<T>(
        &self,
        project_id: ProjectId,
        package_id: Option<PackageId>,
        participants: &[ParticipantId],
        op: impl FnOnce(&mut Project) -> milestone_escrow::Result<T>,
    ) -> Result<T> {
        self.store
            .apply(project_id, package_id, participants, op)
            .await
    }

    /// Persist a recorded payout, then move its funds.
    async fn pay(
        &self,
        project_id: ProjectId,
        package_id: PackageId,
        who: ParticipantId,
        op: impl FnOnce(&mut Project) -> milestone_escrow::Result<Payout>,
    ) -> Result<Json<PayoutResponse>> {
        let payout = self
            .apply(project_id, Some(package_id), std::slice::from_ref(&who), op)
            .await?;
        let transfer = self.settlement.settle_payout(&payout).await?;
        Ok(Json(PayoutResponse { payout, transfer }))
    }
}

pub fn router(state: Arc<ApiState>) -> Router {
    let package = "/projects/:id/packages/:pkg";
    Router::new()
        .route("/health", get(health))
        .route("/events", get(get_all_events))
        .route("/reconciliations", get(get_reconciliations))
        .route("/projects", post(create_project).get(list_projects))
        .route("/projects/:id", get(get_project))
        .route("/projects/:id/events", get(get_project_events))
        .route("/projects/:id/approve", post(approve_project))
        .route("/projects/:id/start", post(start_project))
        .route("/projects/:id/finish", post(finish_project))
        .route("/projects/:id/packages", post(create_package))
        .route("/projects/:id/packages/batch", post(create_packages))
        .route(package, get(get_package))
        .route(&format!("{package}/cancel"), post(cancel_package))
        .route(&format!("{package}/finish"), post(finish_package))
        .route(&format!("{package}/observers"), post(add_observers))
        .route(&format!("{package}/collaborators"), post(add_collaborators))
        .route(&format!("{package}/bonus-scores"), post(assign_bonus_scores))
        .route(
            &format!("{package}/collaborators/:who/approve"),
            post(review_collaborator),
        )
        .route(&format!("{package}/collaborators/:who/mgp"), post(claim_mgp))
        .route(&format!("{package}/collaborators/:who/bonus"), post(claim_bonus))
        .route(
            &format!("{package}/collaborators/:who/dispute"),
            post(raise_dispute).delete(resolve_dispute),
        )
        .route(
            &format!("{package}/collaborators/:who/arbitration"),
            post(pay_disputed_bonus),
        )
        .route(&format!("{package}/observers/:who/fee"), post(claim_observer_fee))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Request shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub token: AssetId,
    pub budget_total: Amount,
}

#[derive(Deserialize)]
pub struct StartProjectRequest {
    pub token_factory: ExternalRef,
}

#[derive(Deserialize)]
pub struct FinishProjectRequest {
    pub treasury: ExternalRef,
}

#[derive(Deserialize)]
pub struct CreatePackagesRequest {
    pub packages: Vec<PackageBudget>,
}

#[derive(Deserialize)]
pub struct ObserversRequest {
    pub observers: Vec<ParticipantId>,
}

#[derive(Deserialize)]
pub struct CollaboratorEntry {
    pub participant: ParticipantId,
    pub mgp_amount: Amount,
}

#[derive(Deserialize)]
pub struct CollaboratorsRequest {
    pub collaborators: Vec<CollaboratorEntry>,
}

#[derive(Deserialize)]
pub struct ScoreEntry {
    pub participant: ParticipantId,
    pub score: Score,
}

#[derive(Deserialize)]
pub struct BonusScoresRequest {
    pub scores: Vec<ScoreEntry>,
    /// Overrides the package's bonus denominator.
    #[serde(default)]
    pub max_bonus_scores: Option<Score>,
}

#[derive(Deserialize)]
pub struct ReviewRequest {
    pub approve: bool,
}

#[derive(Deserialize)]
pub struct ArbitrationRequest {
    pub amount: Amount,
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ProjectView {
    #[serde(flatten)]
    pub record: ProjectRecord,
    pub budget_available: Amount,
    pub open_packages: u64,
}

impl From<&Project> for ProjectView {
    fn from(project: &Project) -> Self {
        Self {
            record: project.to_record(),
            budget_available: project.budget_available(),
            open_packages: project.open_packages(),
        }
    }
}

#[derive(Serialize)]
pub struct PackageView {
    #[serde(flatten)]
    pub record: PackageRecord,
    pub approved_count: u64,
    pub rejected_count: u64,
    pub dispute_count: u64,
    pub collaborators: Vec<Collaborator>,
    pub observers: Vec<Observer>,
}

impl From<&Package> for PackageView {
    fn from(package: &Package) -> Self {
        let mut collaborators: Vec<_> = package.collaborators().iter().cloned().collect();
        collaborators.sort_by(|a, b| a.participant.cmp(&b.participant));
        let mut observers: Vec<_> = package.observers().iter().cloned().collect();
        observers.sort_by(|a, b| a.participant.cmp(&b.participant));
        Self {
            record: package.to_record(),
            approved_count: package.collaborators().approved_count(),
            rejected_count: package.collaborators().rejected_count(),
            dispute_count: package.collaborators().dispute_count(),
            collaborators,
            observers,
        }
    }
}

#[derive(Serialize)]
pub struct PackagesCreatedResponse {
    pub project_id: ProjectId,
    pub package_ids: Vec<PackageId>,
}

#[derive(Serialize)]
pub struct BudgetReturnedResponse {
    pub project_id: ProjectId,
    pub package_id: PackageId,
    pub returned: Amount,
}

#[derive(Serialize)]
pub struct CollaboratorsAddedResponse {
    pub package: PackageView,
    pub reserved: Amount,
}

#[derive(Serialize)]
pub struct PayoutResponse {
    pub payout: Payout,
    pub transfer: TransferReceipt,
}

#[derive(Serialize)]
pub struct FinishProjectResponse {
    pub residual: ProjectResidual,
    /// Absent when there was nothing to return.
    pub transfer: Option<TransferReceipt>,
}

#[derive(Serialize)]
pub struct EventsResponse {
    pub project_id: ProjectId,
    pub count: usize,
    pub events: Vec<EventRecord>,
}

#[derive(Serialize)]
pub struct AllEventsResponse {
    pub count: usize,
    pub events: Vec<EventRecord>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub projects: usize,
}

// ─────────────────────────────────────────────────────────
// Handlers: service
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        projects: state.ledger().len(),
    })
}

/// `GET /events`
pub async fn get_all_events(State(state): State<Arc<ApiState>>) -> Result<Json<AllEventsResponse>> {
    let events = db::get_all_events(&state.pool).await?;
    Ok(Json(AllEventsResponse {
        count: events.len(),
        events,
    }))
}

/// `GET /projects/:id/events`
pub async fn get_project_events(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<ProjectId>,
) -> Result<Json<EventsResponse>> {
    let events = db::get_events_for_project(&state.pool, project_id).await?;
    Ok(Json(EventsResponse {
        project_id,
        count: events.len(),
        events,
    }))
}

/// `GET /reconciliations`
///
/// Transfers that failed after the ledger recorded them, resolved or not.
pub async fn get_reconciliations(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<ReconciliationRecord>>> {
    Ok(Json(db::all_reconciliations(&state.pool).await?))
}

// ─────────────────────────────────────────────────────────
// Handlers: projects
// ─────────────────────────────────────────────────────────

/// `POST /projects`
pub async fn create_project(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CreateProjectRequest>,
) -> Result<(StatusCode, Json<ProjectView>)> {
    let project_id = state
        .store
        .create_project(body.token, body.budget_total)
        .await?;
    let project = state.ledger().snapshot(project_id)?;
    Ok((StatusCode::CREATED, Json(ProjectView::from(&project))))
}

/// `GET /projects`
pub async fn list_projects(State(state): State<Arc<ApiState>>) -> Result<Json<Vec<ProjectView>>> {
    let mut views = Vec::new();
    for id in state.ledger().project_ids() {
        views.push(ProjectView::from(&state.ledger().snapshot(id)?));
    }
    Ok(Json(views))
}

/// `GET /projects/:id`
pub async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<ProjectId>,
) -> Result<Json<ProjectView>> {
    Ok(Json(ProjectView::from(&state.ledger().snapshot(project_id)?)))
}

/// `POST /projects/:id/approve`
pub async fn approve_project(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<ProjectId>,
) -> Result<Json<ProjectView>> {
    let view = state
        .apply(project_id, None, &[], |p| {
            p.approve()?;
            Ok(ProjectView::from(&*p))
        })
        .await?;
    Ok(Json(view))
}

/// `POST /projects/:id/start`
pub async fn start_project(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<ProjectId>,
    Json(body): Json<StartProjectRequest>,
) -> Result<Json<ProjectView>> {
    let view = state
        .apply(project_id, None, &[], |p| {
            p.start(body.token_factory)?;
            Ok(ProjectView::from(&*p))
        })
        .await?;
    Ok(Json(view))
}

/// `POST /projects/:id/finish`
///
/// Closes the project and returns the residual to the treasury.
pub async fn finish_project(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<ProjectId>,
    Json(body): Json<FinishProjectRequest>,
) -> Result<Json<FinishProjectResponse>> {
    let residual = state
        .apply(project_id, None, &[], |p| p.finish(body.treasury))
        .await?;
    let transfer = state.settlement.settle_residual(&residual).await?;
    Ok(Json(FinishProjectResponse { residual, transfer }))
}

// ─────────────────────────────────────────────────────────
// Handlers: packages
// ─────────────────────────────────────────────────────────

/// `POST /projects/:id/packages`
pub async fn create_package(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<ProjectId>,
    Json(budget): Json<PackageBudget>,
) -> Result<(StatusCode, Json<PackagesCreatedResponse>)> {
    let package_id = state
        .store
        .commit(project_id, |p| {
            let id = p.create_package(budget)?;
            Ok((id, p.records_for(Some(id), &[])))
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(PackagesCreatedResponse {
            project_id,
            package_ids: vec![package_id],
        }),
    ))
}

/// `POST /projects/:id/packages/batch`
///
/// All-or-nothing: either every package is created or none is.
pub async fn create_packages(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<ProjectId>,
    Json(body): Json<CreatePackagesRequest>,
) -> Result<(StatusCode, Json<PackagesCreatedResponse>)> {
    let package_ids = state
        .store
        .commit(project_id, |p| {
            let ids = p.create_packages(&body.packages)?;
            let mut records = p.records_for(None, &[]);
            for id in &ids {
                records.extend(p.package(*id)?.records());
            }
            Ok((ids, records))
        })
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(PackagesCreatedResponse {
            project_id,
            package_ids,
        }),
    ))
}

/// `GET /projects/:id/packages/:pkg`
pub async fn get_package(
    State(state): State<Arc<ApiState>>,
    Path((project_id, package_id)): Path<(ProjectId, PackageId)>,
) -> Result<Json<PackageView>> {
    let project = state.ledger().snapshot(project_id)?;
    Ok(Json(PackageView::from(project.package(package_id)?)))
}

/// `POST /projects/:id/packages/:pkg/cancel`
pub async fn cancel_package(
    State(state): State<Arc<ApiState>>,
    Path((project_id, package_id)): Path<(ProjectId, PackageId)>,
) -> Result<Json<BudgetReturnedResponse>> {
    let returned = state
        .apply(project_id, Some(package_id), &[], |p| p.cancel_package(package_id))
        .await?;
    Ok(Json(BudgetReturnedResponse {
        project_id,
        package_id,
        returned,
    }))
}

/// `POST /projects/:id/packages/:pkg/finish`
pub async fn finish_package(
    State(state): State<Arc<ApiState>>,
    Path((project_id, package_id)): Path<(ProjectId, PackageId)>,
) -> Result<Json<BudgetReturnedResponse>> {
    let returned = state
        .apply(project_id, Some(package_id), &[], |p| p.finish_package(package_id))
        .await?;
    Ok(Json(BudgetReturnedResponse {
        project_id,
        package_id,
        returned,
    }))
}

/// `POST /projects/:id/packages/:pkg/observers`
pub async fn add_observers(
    State(state): State<Arc<ApiState>>,
    Path((project_id, package_id)): Path<(ProjectId, PackageId)>,
    Json(body): Json<ObserversRequest>,
) -> Result<Json<PackageView>> {
    let view = state
        .apply(project_id, Some(package_id), &body.observers, |p| {
            p.add_observers(package_id, &body.observers)?;
            Ok(PackageView::from(p.package(package_id)?))
        })
        .await?;
    Ok(Json(view))
}

/// `POST /projects/:id/packages/:pkg/collaborators`
pub async fn add_collaborators(
    State(state): State<Arc<ApiState>>,
    Path((project_id, package_id)): Path<(ProjectId, PackageId)>,
    Json(body): Json<CollaboratorsRequest>,
) -> Result<Json<CollaboratorsAddedResponse>> {
    let batch: Vec<_> = body
        .collaborators
        .into_iter()
        .map(|entry| (entry.participant, entry.mgp_amount))
        .collect();
    let names: Vec<_> = batch.iter().map(|(who, _)| who.clone()).collect();
    let response = state
        .apply(project_id, Some(package_id), &names, |p| {
            let reserved = p.add_collaborators(package_id, &batch)?;
            Ok(CollaboratorsAddedResponse {
                package: PackageView::from(p.package(package_id)?),
                reserved,
            })
        })
        .await?;
    Ok(Json(response))
}

/// `POST /projects/:id/packages/:pkg/bonus-scores`
pub async fn assign_bonus_scores(
    State(state): State<Arc<ApiState>>,
    Path((project_id, package_id)): Path<(ProjectId, PackageId)>,
    Json(body): Json<BonusScoresRequest>,
) -> Result<Json<PackageView>> {
    let scores: Vec<_> = body
        .scores
        .into_iter()
        .map(|entry| (entry.participant, entry.score))
        .collect();
    let names: Vec<_> = scores.iter().map(|(who, _)| who.clone()).collect();
    let view = state
        .apply(project_id, Some(package_id), &names, |p| {
            p.assign_bonus_scores(package_id, &scores, body.max_bonus_scores)?;
            Ok(PackageView::from(p.package(package_id)?))
        })
        .await?;
    Ok(Json(view))
}

// ─────────────────────────────────────────────────────────
// Handlers: participants
// ─────────────────────────────────────────────────────────

type ParticipantPath = Path<(ProjectId, PackageId, ParticipantId)>;

/// `POST .../collaborators/:who/approve`
///
/// `{"approve": false}` rejects the collaborator and releases their MGP.
pub async fn review_collaborator(
    State(state): State<Arc<ApiState>>,
    Path((project_id, package_id, who)): ParticipantPath,
    Json(body): Json<ReviewRequest>,
) -> Result<Json<Collaborator>> {
    let collaborator = state
        .apply(project_id, Some(package_id), std::slice::from_ref(&who), |p| {
            p.approve_collaborator(package_id, &who, body.approve)?;
            p.package(package_id)?.collaborator(&who).cloned()
        })
        .await?;
    Ok(Json(collaborator))
}

/// `POST .../collaborators/:who/mgp`
pub async fn claim_mgp(
    State(state): State<Arc<ApiState>>,
    Path((project_id, package_id, who)): ParticipantPath,
) -> Result<Json<PayoutResponse>> {
    let claimant = who.clone();
    state
        .pay(project_id, package_id, who, move |p| p.claim_mgp(package_id, &claimant))
        .await
}

/// `POST .../collaborators/:who/bonus`
pub async fn claim_bonus(
    State(state): State<Arc<ApiState>>,
    Path((project_id, package_id, who)): ParticipantPath,
) -> Result<Json<PayoutResponse>> {
    let claimant = who.clone();
    state
        .pay(project_id, package_id, who, move |p| p.claim_bonus(package_id, &claimant))
        .await
}

/// `POST .../observers/:who/fee`
pub async fn claim_observer_fee(
    State(state): State<Arc<ApiState>>,
    Path((project_id, package_id, who)): ParticipantPath,
) -> Result<Json<PayoutResponse>> {
    let claimant = who.clone();
    state
        .pay(project_id, package_id, who, move |p| {
            p.claim_observer_fee(package_id, &claimant)
        })
        .await
}

/// `POST .../collaborators/:who/dispute`
pub async fn raise_dispute(
    State(state): State<Arc<ApiState>>,
    Path((project_id, package_id, who)): ParticipantPath,
) -> Result<Json<Collaborator>> {
    let collaborator = state
        .apply(project_id, Some(package_id), std::slice::from_ref(&who), |p| {
            p.raise_dispute(package_id, &who)?;
            p.package(package_id)?.collaborator(&who).cloned()
        })
        .await?;
    Ok(Json(collaborator))
}

/// `DELETE .../collaborators/:who/dispute`
///
/// Idempotent; resolving an undisputed collaborator changes nothing.
pub async fn resolve_dispute(
    State(state): State<Arc<ApiState>>,
    Path((project_id, package_id, who)): ParticipantPath,
) -> Result<Json<Collaborator>> {
    let collaborator = state
        .apply(project_id, Some(package_id), std::slice::from_ref(&who), |p| {
            p.resolve_dispute(package_id, &who)?;
            p.package(package_id)?.collaborator(&who).cloned()
        })
        .await?;
    Ok(Json(collaborator))
}

/// `POST .../collaborators/:who/arbitration`
///
/// Pays an arbitrated bonus, bypassing the dispute gate on the standard
/// bonus path.
pub async fn pay_disputed_bonus(
    State(state): State<Arc<ApiState>>,
    Path((project_id, package_id, who)): ParticipantPath,
    Json(body): Json<ArbitrationRequest>,
) -> Result<Json<PayoutResponse>> {
    let claimant = who.clone();
    state
        .pay(project_id, package_id, who, move |p| {
            p.pay_disputed_bonus(package_id, &claimant, body.amount)
        })
        .await
}

// ─────────────────────────────────────────────────────────
// Router tests
// ─────────────────────────────────────────────────────────
