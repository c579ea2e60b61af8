//! # Project Ledger
//!
//! A project commits a fixed budget in one asset and hands slices of it to
//! packages. It keeps three counters:
//!
//! ```text
//! budget_paid ≤ budget_allocated ≤ budget_total
//! ```
//!
//! `budget_allocated` always equals the sum of [`Package::live_budget`] over
//! the project's packages. Package operations that move budget upward
//! (cancel, finish) or outward (payouts) are applied here in two steps: the
//! package call, then the project-side post-processing
//! (`revert_package_budget`, `record_payment`). Both sides are validated
//! before either is mutated. The budget primitives are crate-internal: a
//! counter moved without a package behind it would break conservation.

use std::collections::BTreeMap;

use tracing::{debug, info};

use crate::errors::{LedgerError, Result};
use crate::events::LedgerEvent;
use crate::package::Package;
use crate::storage::RecordKey;
use crate::types::{
    checked_add, checked_sub, Amount, AssetId, ExternalRef, PackageBudget, PackageId,
    ParticipantId, Payout, PayoutKind, ProjectId, ProjectResidual, ProjectState, Score,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Project {
    pub(crate) id: ProjectId,
    pub(crate) token: AssetId,
    pub(crate) budget_total: Amount,
    pub(crate) budget_allocated: Amount,
    pub(crate) budget_paid: Amount,
    pub(crate) state: ProjectState,
    pub(crate) package_count: u64,
    /// Packages neither cancelled nor finished.
    pub(crate) open_packages: u64,
    pub(crate) token_factory: Option<ExternalRef>,
    pub(crate) treasury: Option<ExternalRef>,
    pub(crate) residual: Option<Amount>,
    pub(crate) packages: BTreeMap<PackageId, Package>,
    pub(crate) outbox: Vec<LedgerEvent>,
}

impl Project {
    /// Commit `budget_total` of `token` to a new project in `Created` state.
    pub fn create(id: ProjectId, token: AssetId, budget_total: Amount) -> Result<Self> {
        if budget_total == 0 {
            return Err(LedgerError::invariant("project budget must be positive"));
        }
        let mut project = Self {
            id,
            token: token.clone(),
            budget_total,
            budget_allocated: 0,
            budget_paid: 0,
            state: ProjectState::Created,
            package_count: 0,
            open_packages: 0,
            token_factory: None,
            treasury: None,
            residual: None,
            packages: BTreeMap::new(),
            outbox: Vec::new(),
        };
        project.emit(LedgerEvent::ProjectCreated {
            project_id: id,
            token,
            budget_total,
        });
        info!(project_id = id, budget_total, "project created");
        Ok(project)
    }

    pub fn id(&self) -> ProjectId {
        self.id
    }

    pub fn token(&self) -> &AssetId {
        &self.token
    }

    pub fn budget_total(&self) -> Amount {
        self.budget_total
    }

    pub fn budget_allocated(&self) -> Amount {
        self.budget_allocated
    }

    pub fn budget_paid(&self) -> Amount {
        self.budget_paid
    }

    /// Budget not yet reserved by any package.
    pub fn budget_available(&self) -> Amount {
        self.budget_total - self.budget_allocated
    }

    pub fn state(&self) -> ProjectState {
        self.state
    }

    pub fn package_count(&self) -> u64 {
        self.package_count
    }

    pub fn open_packages(&self) -> u64 {
        self.open_packages
    }

    pub fn token_factory(&self) -> Option<&ExternalRef> {
        self.token_factory.as_ref()
    }

    pub fn treasury(&self) -> Option<&ExternalRef> {
        self.treasury.as_ref()
    }

    pub fn residual(&self) -> Option<Amount> {
        self.residual
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::Project(self.id)
    }

    pub fn package(&self, id: PackageId) -> Result<&Package> {
        self.packages
            .get(&id)
            .ok_or(LedgerError::NotFound(RecordKey::Package(self.id, id)))
    }

    pub fn packages(&self) -> impl Iterator<Item = &Package> {
        self.packages.values()
    }

    pub(crate) fn package_mut(&mut self, id: PackageId) -> Result<&mut Package> {
        let project_id = self.id;
        self.packages
            .get_mut(&id)
            .ok_or(LedgerError::NotFound(RecordKey::Package(project_id, id)))
    }

    /// Take the events queued by operations since the last drain.
    pub fn drain_events(&mut self) -> Vec<LedgerEvent> {
        std::mem::take(&mut self.outbox)
    }

    pub(crate) fn emit(&mut self, event: LedgerEvent) {
        self.outbox.push(event);
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.state != ProjectState::Active {
            return Err(LedgerError::state(format!(
                "project {} is {:?}, not active",
                self.id, self.state
            )));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────

    pub fn approve(&mut self) -> Result<()> {
        if self.state != ProjectState::Created {
            return Err(LedgerError::state(format!(
                "project {} is {:?}; only created projects can be approved",
                self.id, self.state
            )));
        }
        self.state = ProjectState::Approved;
        self.emit(LedgerEvent::ProjectApproved { project_id: self.id });
        info!(project_id = self.id, "project approved");
        Ok(())
    }

    /// Activate the project. `token_factory` is stored, never called.
    pub fn start(&mut self, token_factory: ExternalRef) -> Result<()> {
        if self.state != ProjectState::Approved {
            return Err(LedgerError::state(format!(
                "project {} is {:?}; only approved projects can be started",
                self.id, self.state
            )));
        }
        self.state = ProjectState::Active;
        self.token_factory = Some(token_factory.clone());
        self.emit(LedgerEvent::ProjectStarted {
            project_id: self.id,
            token_factory,
        });
        info!(project_id = self.id, "project started");
        Ok(())
    }

    /// Close the project and report `budget_total − budget_paid` for the
    /// treasury. The ledger moves no assets itself.
    pub fn finish(&mut self, treasury: ExternalRef) -> Result<ProjectResidual> {
        self.ensure_active()?;
        if self.open_packages > 0 {
            return Err(LedgerError::state(format!(
                "project {} has {} packages still open",
                self.id, self.open_packages
            )));
        }
        let residual = checked_sub(self.budget_total, self.budget_paid, "project residual")?;
        self.state = ProjectState::Finished;
        self.treasury = Some(treasury.clone());
        self.residual = Some(residual);
        self.emit(LedgerEvent::ProjectFinished {
            project_id: self.id,
            treasury: treasury.clone(),
            residual,
        });
        info!(project_id = self.id, residual, "project finished");
        Ok(ProjectResidual {
            project_id: self.id,
            asset: self.token.clone(),
            treasury,
            amount: residual,
        })
    }

    // ─────────────────────────────────────────────────────────
    // Budget counters
    // ─────────────────────────────────────────────────────────

    fn check_reserve(&self, total_budget: Amount, count: u64) -> Result<(Amount, u64)> {
        self.ensure_active()?;
        let allocated = checked_add(self.budget_allocated, total_budget, "project allocation")?;
        if allocated > self.budget_total {
            return Err(LedgerError::invariant(format!(
                "reserving {total_budget} exceeds the {} left in project {}",
                self.budget_available(),
                self.id
            )));
        }
        let package_count = self
            .package_count
            .checked_add(count)
            .ok_or(LedgerError::ArithmeticOverflow("package count"))?;
        Ok((allocated, package_count))
    }

    /// Reserve `total_budget` for `count` new packages. Returns the id the
    /// first of them will get; the rest follow sequentially.
    pub(crate) fn reserve_package_budget(&mut self, total_budget: Amount, count: u64) -> Result<PackageId> {
        let (allocated, package_count) = self.check_reserve(total_budget, count)?;
        let first = self.package_count;
        self.budget_allocated = allocated;
        self.package_count = package_count;
        Ok(first)
    }

    fn check_revert(&self, amount: Amount) -> Result<Amount> {
        let allocated = checked_sub(self.budget_allocated, amount, "package budget reversion")?;
        if allocated < self.budget_paid {
            return Err(LedgerError::invariant(format!(
                "reverting {amount} would leave project {} allocation below what it paid",
                self.id
            )));
        }
        Ok(allocated)
    }

    /// Return budget from a cancelled or finished package.
    pub(crate) fn revert_package_budget(&mut self, amount: Amount) -> Result<()> {
        self.budget_allocated = self.check_revert(amount)?;
        Ok(())
    }

    pub(crate) fn check_payment(&self, amount: Amount) -> Result<Amount> {
        let paid = checked_add(self.budget_paid, amount, "project payments")?;
        if paid > self.budget_allocated {
            return Err(LedgerError::invariant(format!(
                "payment of {amount} exceeds project {} allocation",
                self.id
            )));
        }
        Ok(paid)
    }

    pub(crate) fn record_payment(&mut self, amount: Amount) -> Result<()> {
        self.budget_paid = self.check_payment(amount)?;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // Packages
    // ─────────────────────────────────────────────────────────

    pub fn create_package(&mut self, budget: PackageBudget) -> Result<PackageId> {
        let ids = self.create_packages(&[budget])?;
        Ok(ids[0])
    }

    /// Create several packages under a single reservation. All or nothing.
    pub fn create_packages(&mut self, budgets: &[PackageBudget]) -> Result<Vec<PackageId>> {
        if budgets.is_empty() {
            return Err(LedgerError::invariant("no packages to create"));
        }
        let mut total: Amount = 0;
        for budget in budgets {
            total = checked_add(total, budget.total()?, "package batch")?;
        }
        let count = budgets.len() as u64;
        let open_packages = self
            .open_packages
            .checked_add(count)
            .ok_or(LedgerError::ArithmeticOverflow("open packages"))?;
        let first = self.reserve_package_budget(total, count)?;
        self.open_packages = open_packages;

        let mut ids = Vec::with_capacity(budgets.len());
        for (id, budget) in (first..).zip(budgets) {
            self.packages.insert(id, Package::new(self.id, id, *budget));
            self.emit(LedgerEvent::PackageCreated {
                project_id: self.id,
                package_id: id,
                budget: *budget,
            });
            ids.push(id);
        }
        debug!(project_id = self.id, count, total, "packages created");
        Ok(ids)
    }

    /// Cancel a package that has no approved collaborators and reclaim its
    /// unspent reservation.
    pub fn cancel_package(&mut self, package_id: PackageId) -> Result<Amount> {
        self.ensure_active()?;
        let returned = self.package(package_id)?.check_cancel()?;
        self.check_revert(returned)?;
        self.package_mut(package_id)?.cancel()?;
        self.revert_package_budget(returned)?;
        self.open_packages -= 1;
        self.emit(LedgerEvent::PackageCancelled {
            project_id: self.id,
            package_id,
            returned,
        });
        info!(project_id = self.id, package_id, returned, "package cancelled");
        Ok(returned)
    }

    /// Finish a package and reclaim its unspent MGP and bonus.
    pub fn finish_package(&mut self, package_id: PackageId) -> Result<Amount> {
        self.ensure_active()?;
        let budget_left = self.package(package_id)?.check_finish()?;
        self.check_revert(budget_left)?;
        self.package_mut(package_id)?.finish()?;
        self.revert_package_budget(budget_left)?;
        self.open_packages -= 1;
        self.emit(LedgerEvent::PackageFinished {
            project_id: self.id,
            package_id,
            returned: budget_left,
        });
        info!(project_id = self.id, package_id, budget_left, "package finished");
        Ok(budget_left)
    }

    pub fn add_observers(&mut self, package_id: PackageId, observers: &[ParticipantId]) -> Result<()> {
        self.ensure_active()?;
        self.package_mut(package_id)?.admit_observers(observers)?;
        self.emit(LedgerEvent::ObserversAdded {
            project_id: self.id,
            package_id,
            observers: observers.to_vec(),
        });
        Ok(())
    }

    /// Admit collaborators with their guaranteed fees. Returns the MGP
    /// reserved for the batch.
    pub fn add_collaborators(
        &mut self,
        package_id: PackageId,
        collaborators: &[(ParticipantId, Amount)],
    ) -> Result<Amount> {
        self.ensure_active()?;
        let reserved = self
            .package_mut(package_id)?
            .admit_collaborators(collaborators)?;
        self.emit(LedgerEvent::CollaboratorsAdded {
            project_id: self.id,
            package_id,
            collaborators: collaborators.iter().map(|(who, _)| who.clone()).collect(),
            reserved,
        });
        debug!(project_id = self.id, package_id, reserved, "collaborators added");
        Ok(reserved)
    }

    pub fn approve_collaborator(
        &mut self,
        package_id: PackageId,
        who: &ParticipantId,
        approve: bool,
    ) -> Result<()> {
        self.ensure_active()?;
        let released = self
            .package_mut(package_id)?
            .review_collaborator(who, approve)?;
        let event = if approve {
            LedgerEvent::CollaboratorApproved {
                project_id: self.id,
                package_id,
                collaborator: who.clone(),
            }
        } else {
            LedgerEvent::CollaboratorRejected {
                project_id: self.id,
                package_id,
                collaborator: who.clone(),
                released,
            }
        };
        self.emit(event);
        Ok(())
    }

    /// Assign bonus scores; `max_bonus_scores` defaults to the package's
    /// current denominator.
    pub fn assign_bonus_scores(
        &mut self,
        package_id: PackageId,
        scores: &[(ParticipantId, Score)],
        max_bonus_scores: Option<Score>,
    ) -> Result<()> {
        self.ensure_active()?;
        let package = self.package_mut(package_id)?;
        let total_bonus_scores = package.assign_bonus_scores(scores, max_bonus_scores)?;
        let max_bonus_scores = package.max_bonus_scores();
        self.emit(LedgerEvent::BonusScoresSet {
            project_id: self.id,
            package_id,
            total_bonus_scores,
            max_bonus_scores,
        });
        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // Payouts
    // ─────────────────────────────────────────────────────────

    pub fn claim_mgp(&mut self, package_id: PackageId, who: &ParticipantId) -> Result<Payout> {
        self.ensure_active()?;
        let amount = self.package(package_id)?.quote_mgp(who)?;
        self.check_payment(amount)?;
        self.package_mut(package_id)?.settle_mgp(who)?;
        self.finish_payout(package_id, who, amount, PayoutKind::Mgp)
    }

    pub fn claim_bonus(&mut self, package_id: PackageId, who: &ParticipantId) -> Result<Payout> {
        self.ensure_active()?;
        let share = self.package(package_id)?.quote_bonus(who)?;
        self.check_payment(share)?;
        self.package_mut(package_id)?.settle_bonus(who)?;
        self.finish_payout(package_id, who, share, PayoutKind::Bonus)
    }

    pub fn claim_observer_fee(&mut self, package_id: PackageId, who: &ParticipantId) -> Result<Payout> {
        self.ensure_active()?;
        let share = self.package(package_id)?.quote_observer_fee(who)?;
        self.check_payment(share)?;
        self.package_mut(package_id)?.settle_observer_fee(who)?;
        self.finish_payout(package_id, who, share, PayoutKind::ObserverFee)
    }

    /// Project-side post-processing shared by every payout path.
    pub(crate) fn finish_payout(
        &mut self,
        package_id: PackageId,
        who: &ParticipantId,
        amount: Amount,
        kind: PayoutKind,
    ) -> Result<Payout> {
        self.record_payment(amount)?;
        let payout = Payout {
            project_id: self.id,
            package_id,
            payee: who.clone(),
            asset: self.token.clone(),
            amount,
            kind,
        };
        self.emit(LedgerEvent::PayoutRecorded {
            payout: payout.clone(),
        });
        info!(
            project_id = self.id,
            package_id,
            payee = %who,
            amount,
            kind = kind.as_str(),
            "payout recorded"
        );
        Ok(payout)
    }

    /// Undo a payout whose asset transfer failed. This is the only operation
    /// that lowers a paid counter.
    pub fn reverse_payout(&mut self, payout: &Payout) -> Result<()> {
        self.ensure_active()?;
        if payout.project_id != self.id || payout.asset != self.token {
            return Err(LedgerError::invariant(format!(
                "payout {} does not belong to project {}",
                payout.reference(),
                self.id
            )));
        }
        self.package(payout.package_id)?.check_reverse(payout)?;
        let paid = checked_sub(self.budget_paid, payout.amount, "payout reversal")?;
        self.package_mut(payout.package_id)?.reverse(payout)?;
        self.budget_paid = paid;
        self.emit(LedgerEvent::PayoutReversed {
            payout: payout.clone(),
        });
        info!(reference = %payout.reference(), amount = payout.amount, "payout reversed");
        Ok(())
    }
}
