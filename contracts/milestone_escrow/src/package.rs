//! # Package Ledger
//!
//! A package is one milestone of a project. It reserves three pools from the
//! project budget and accounts every disbursement against them:
//!
//! | Pool           | Reserved by            | Paid through                      |
//! |----------------|------------------------|-----------------------------------|
//! | MGP            | collaborator admission | [`Package::settle_mgp`]           |
//! | Bonus          | score assignment       | [`Package::settle_bonus`], arbitration |
//! | Observer fee   | observer admission     | [`Package::settle_observer_fee`]  |
//!
//! The lower-case primitives (`reserve_collaborators_budget`, `get_mgp`,
//! `paid_bonus`, `get_observer_fee`, ...) adjust package aggregates only.
//! The roster operations validate against the collaborator/observer ledgers
//! first and then call exactly one fallible primitive before touching the
//! roster, so a rejected call leaves everything untouched.
//!
//! Upward effects (returning budget, recording payments on the project) are
//! applied by [`Project`](crate::project::Project) after the package call
//! succeeds.

use tracing::debug;

use crate::collaborator::{Collaborator, CollaboratorLedger};
use crate::errors::{LedgerError, Result};
use crate::observer::{Observer, ObserverLedger};
use crate::storage::RecordKey;
use crate::types::{
    checked_add, checked_sub, Amount, ApprovalState, PackageBudget, PackageId, PackageState,
    ParticipantId, Payout, PayoutKind, ProjectId, Score, DEFAULT_MAX_BONUS_SCORES,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Package {
    pub(crate) project_id: ProjectId,
    pub(crate) id: PackageId,
    pub(crate) mgp_budget: Amount,
    pub(crate) mgp_paid: Amount,
    /// Sum of `mgp_amount` over admitted, non-rejected collaborators.
    pub(crate) mgp_reserved: Amount,
    pub(crate) bonus_budget: Amount,
    pub(crate) bonus_paid: Amount,
    pub(crate) observer_fee_budget: Amount,
    pub(crate) observer_fee_paid: Amount,
    pub(crate) collaborator_count: u64,
    pub(crate) observer_count: u64,
    pub(crate) total_bonus_scores: Score,
    pub(crate) max_bonus_scores: Score,
    pub(crate) state: PackageState,
    /// Amount handed back to the project by cancel or finish.
    pub(crate) budget_returned: Amount,
    pub(crate) collaborators: CollaboratorLedger,
    pub(crate) observers: ObserverLedger,
}

impl Package {
    /// A new package over pools whose total the caller has already reserved
    /// on the project.
    pub fn new(project_id: ProjectId, id: PackageId, budget: PackageBudget) -> Self {
        Self {
            project_id,
            id,
            mgp_budget: budget.mgp,
            mgp_paid: 0,
            mgp_reserved: 0,
            bonus_budget: budget.bonus,
            bonus_paid: 0,
            observer_fee_budget: budget.observer_fee,
            observer_fee_paid: 0,
            collaborator_count: 0,
            observer_count: 0,
            total_bonus_scores: 0,
            max_bonus_scores: DEFAULT_MAX_BONUS_SCORES,
            state: PackageState::Active,
            budget_returned: 0,
            collaborators: CollaboratorLedger::new(),
            observers: ObserverLedger::new(),
        }
    }

    pub fn id(&self) -> PackageId {
        self.id
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    pub fn state(&self) -> PackageState {
        self.state
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::Package(self.project_id, self.id)
    }

    pub fn budget(&self) -> PackageBudget {
        PackageBudget::new(self.mgp_budget, self.bonus_budget, self.observer_fee_budget)
    }

    pub fn mgp_budget(&self) -> Amount {
        self.mgp_budget
    }

    pub fn mgp_paid(&self) -> Amount {
        self.mgp_paid
    }

    pub fn mgp_reserved(&self) -> Amount {
        self.mgp_reserved
    }

    /// MGP still available for new collaborators.
    pub fn mgp_headroom(&self) -> Amount {
        self.mgp_budget - self.mgp_reserved
    }

    pub fn bonus_budget(&self) -> Amount {
        self.bonus_budget
    }

    pub fn bonus_paid(&self) -> Amount {
        self.bonus_paid
    }

    pub fn observer_fee_budget(&self) -> Amount {
        self.observer_fee_budget
    }

    pub fn observer_fee_paid(&self) -> Amount {
        self.observer_fee_paid
    }

    pub fn collaborator_count(&self) -> u64 {
        self.collaborator_count
    }

    pub fn observer_count(&self) -> u64 {
        self.observer_count
    }

    pub fn total_bonus_scores(&self) -> Score {
        self.total_bonus_scores
    }

    pub fn max_bonus_scores(&self) -> Score {
        self.max_bonus_scores
    }

    pub fn budget_returned(&self) -> Amount {
        self.budget_returned
    }

    pub fn collaborators(&self) -> &CollaboratorLedger {
        &self.collaborators
    }

    pub fn observers(&self) -> &ObserverLedger {
        &self.observers
    }

    pub fn collaborator(&self, who: &ParticipantId) -> Result<&Collaborator> {
        self.collaborators
            .get(who)
            .ok_or_else(|| LedgerError::NotFound(self.collaborator_key(who)))
    }

    pub fn observer(&self, who: &ParticipantId) -> Result<&Observer> {
        self.observers
            .get(who)
            .ok_or_else(|| LedgerError::NotFound(self.observer_key(who)))
    }

    pub(crate) fn collaborator_key(&self, who: &ParticipantId) -> RecordKey {
        RecordKey::Collaborator(self.project_id, self.id, who.clone())
    }

    pub(crate) fn observer_key(&self, who: &ParticipantId) -> RecordKey {
        RecordKey::Observer(self.project_id, self.id, who.clone())
    }

    /// Sum of the three pools. Validated when the package was reserved.
    pub fn total_budget(&self) -> Amount {
        self.mgp_budget + self.bonus_budget + self.observer_fee_budget
    }

    /// Everything disbursed from this package so far.
    pub fn spent(&self) -> Amount {
        self.mgp_paid + self.bonus_paid + self.observer_fee_paid
    }

    /// The part of the project's allocation this package still holds.
    pub fn live_budget(&self) -> Amount {
        self.total_budget() - self.budget_returned
    }

    pub(crate) fn ensure_active(&self, action: &str) -> Result<()> {
        if self.state != PackageState::Active {
            return Err(LedgerError::state(format!(
                "cannot {action}: package {} is {:?}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // Aggregate primitives
    // ─────────────────────────────────────────────────────────

    /// Amount returned to the project if the package were cancelled now.
    pub fn check_cancel(&self) -> Result<Amount> {
        self.ensure_active("cancel")?;
        if self.collaborators.approved_count() > 0 {
            return Err(LedgerError::state(format!(
                "package {} has approved collaborators",
                self.id
            )));
        }
        checked_sub(self.total_budget(), self.spent(), "package cancel")
    }

    /// Cancel the package and report the full unspent reservation.
    pub fn cancel(&mut self) -> Result<Amount> {
        let returned = self.check_cancel()?;
        self.state = PackageState::Cancelled;
        self.budget_returned = returned;
        debug!(package_id = self.id, returned, "package cancelled");
        Ok(returned)
    }

    pub fn add_observers(&mut self, count: u64) -> Result<()> {
        self.ensure_active("add observers")?;
        self.observer_count = self
            .observer_count
            .checked_add(count)
            .ok_or(LedgerError::ArithmeticOverflow("observer count"))?;
        Ok(())
    }

    /// Reserve `amount` of MGP headroom for `count` new collaborators.
    pub fn reserve_collaborators_budget(&mut self, count: u64, amount: Amount) -> Result<()> {
        self.ensure_active("reserve collaborator budget")?;
        let reserved = checked_add(self.mgp_reserved, amount, "mgp reservation")?;
        if reserved > self.mgp_budget {
            return Err(LedgerError::invariant(format!(
                "reserving {amount} exceeds mgp headroom {} of package {}",
                self.mgp_headroom(),
                self.id
            )));
        }
        let collaborator_count = self
            .collaborator_count
            .checked_add(count)
            .ok_or(LedgerError::ArithmeticOverflow("collaborator count"))?;
        self.mgp_reserved = reserved;
        self.collaborator_count = collaborator_count;
        Ok(())
    }

    /// Aggregate side of a review: a rejection releases `mgp_amount` back
    /// into headroom; an approval moves nothing.
    pub fn approve_collaborator(&mut self, approve: bool, mgp_amount: Amount) -> Result<()> {
        self.ensure_active("review collaborators")?;
        if !approve {
            self.mgp_reserved = checked_sub(self.mgp_reserved, mgp_amount, "mgp release")?;
        }
        Ok(())
    }

    /// Unspent MGP and bonus if the package were finished now.
    pub fn check_finish(&self) -> Result<Amount> {
        self.ensure_active("finish")?;
        let resolved = self.collaborators.approved_count() + self.collaborators.rejected_count();
        if resolved != self.collaborator_count {
            return Err(LedgerError::state(format!(
                "package {} has {} unresolved collaborators",
                self.id,
                self.collaborator_count.saturating_sub(resolved)
            )));
        }
        if self.collaborators.dispute_count() > 0 {
            return Err(LedgerError::state(format!(
                "package {} has {} open disputes",
                self.id,
                self.collaborators.dispute_count()
            )));
        }
        Ok((self.mgp_budget - self.mgp_paid) + (self.bonus_budget - self.bonus_paid))
    }

    /// Finish the package; returns `budgetLeft` for the project to reclaim.
    ///
    /// The observer fee pool stays with the package so observers can claim
    /// after the finish.
    pub fn finish(&mut self) -> Result<Amount> {
        let budget_left = self.check_finish()?;
        self.state = PackageState::Finished;
        self.budget_returned = budget_left;
        debug!(package_id = self.id, budget_left, "package finished");
        Ok(budget_left)
    }

    /// Configure the bonus denominator. May be overwritten until the first
    /// bonus is paid.
    pub fn set_bonus_scores(&mut self, total_bonus_scores: Score, max_bonus_scores: Score) -> Result<()> {
        self.ensure_active("set bonus scores")?;
        if self.bonus_paid > 0 {
            return Err(LedgerError::state(format!(
                "bonus already paid from package {}",
                self.id
            )));
        }
        if max_bonus_scores == 0 {
            return Err(LedgerError::invariant("max bonus scores must be positive"));
        }
        if total_bonus_scores > max_bonus_scores {
            return Err(LedgerError::invariant(format!(
                "total bonus scores {total_bonus_scores} exceed maximum {max_bonus_scores}"
            )));
        }
        self.total_bonus_scores = total_bonus_scores;
        self.max_bonus_scores = max_bonus_scores;
        Ok(())
    }

    /// Even share of the observer pool, rounded down. The remainder is
    /// never attributed.
    pub fn observer_fee_share(&self) -> Result<Amount> {
        if self.observer_count == 0 {
            return Err(LedgerError::invariant(format!(
                "package {} has no observers",
                self.id
            )));
        }
        Ok(self.observer_fee_budget / Amount::from(self.observer_count))
    }

    /// Account one observer's share as paid and return it.
    pub fn get_observer_fee(&mut self) -> Result<Amount> {
        let share = self.observer_fee_share()?;
        self.observer_fee_paid = self.checked_pool_payment(
            self.observer_fee_paid,
            share,
            self.observer_fee_budget,
            "observer fee",
        )?;
        Ok(share)
    }

    pub fn get_mgp(&mut self, amount: Amount) -> Result<()> {
        self.mgp_paid =
            self.checked_pool_payment(self.mgp_paid, amount, self.mgp_budget, "mgp")?;
        Ok(())
    }

    pub fn paid_bonus(&mut self, amount: Amount) -> Result<()> {
        self.bonus_paid =
            self.checked_pool_payment(self.bonus_paid, amount, self.bonus_budget, "bonus")?;
        Ok(())
    }

    fn checked_pool_payment(
        &self,
        paid: Amount,
        amount: Amount,
        budget: Amount,
        pool: &'static str,
    ) -> Result<Amount> {
        let next = checked_add(paid, amount, pool)?;
        if next > budget {
            return Err(LedgerError::invariant(format!(
                "{pool} payment of {amount} exceeds the remaining {} in package {}",
                budget - paid,
                self.id
            )));
        }
        Ok(next)
    }

    /// `bonus_budget * score / max_bonus_scores`, truncating.
    pub fn bonus_share(&self, score: Score) -> Result<Amount> {
        if self.max_bonus_scores == 0 {
            return Err(LedgerError::invariant("max bonus scores must be positive"));
        }
        let weighted = self
            .bonus_budget
            .checked_mul(Amount::from(score))
            .ok_or(LedgerError::ArithmeticOverflow("bonus share"))?;
        Ok(weighted / Amount::from(self.max_bonus_scores))
    }

    // ─────────────────────────────────────────────────────────
    // Roster operations
    // ─────────────────────────────────────────────────────────

    pub fn admit_observers(&mut self, batch: &[ParticipantId]) -> Result<()> {
        self.ensure_active("add observers")?;
        self.observers.check_admit(batch)?;
        self.add_observers(batch.len() as u64)?;
        self.observers.admit(batch);
        Ok(())
    }

    /// Admit collaborators as Pending, reserving the batch's total MGP.
    pub fn admit_collaborators(&mut self, batch: &[(ParticipantId, Amount)]) -> Result<Amount> {
        self.ensure_active("add collaborators")?;
        let total = self.collaborators.check_admit(batch)?;
        self.reserve_collaborators_budget(batch.len() as u64, total)?;
        self.collaborators.admit(batch);
        Ok(total)
    }

    /// Approve or reject a pending collaborator. Returns the MGP released by
    /// a rejection, zero for an approval.
    pub fn review_collaborator(&mut self, who: &ParticipantId, approve: bool) -> Result<Amount> {
        self.ensure_active("review collaborators")?;
        let collaborator = self.collaborator(who)?;
        if collaborator.approval != ApprovalState::Pending {
            return Err(LedgerError::state(format!(
                "collaborator {who} is already {:?}",
                collaborator.approval
            )));
        }
        let mgp_amount = collaborator.mgp_amount;
        self.approve_collaborator(approve, mgp_amount)?;
        if approve {
            self.collaborators.mark_approved(who);
            Ok(0)
        } else {
            self.collaborators.mark_rejected(who);
            Ok(mgp_amount)
        }
    }

    /// Assign per-collaborator scores and return the new score sum.
    pub fn assign_bonus_scores(
        &mut self,
        scores: &[(ParticipantId, Score)],
        max_bonus_scores: Option<Score>,
    ) -> Result<Score> {
        self.ensure_active("set bonus scores")?;
        for (who, _) in scores {
            self.collaborator(who)?;
        }
        let total = self.collaborators.check_scores(scores)?;
        let max = max_bonus_scores.unwrap_or(self.max_bonus_scores);
        self.set_bonus_scores(total, max)?;
        self.collaborators.set_scores(scores);
        Ok(total)
    }

    pub fn quote_mgp(&self, who: &ParticipantId) -> Result<Amount> {
        self.ensure_active("pay mgp")?;
        let collaborator = self.collaborator(who)?;
        if collaborator.approval != ApprovalState::Approved {
            return Err(LedgerError::state(format!(
                "collaborator {who} is {:?}, not approved",
                collaborator.approval
            )));
        }
        if collaborator.mgp_paid {
            return Err(LedgerError::state(format!("mgp already paid to {who}")));
        }
        if collaborator.mgp_amount == 0 {
            return Err(LedgerError::state(format!("no mgp owed to {who}")));
        }
        self.checked_pool_payment(self.mgp_paid, collaborator.mgp_amount, self.mgp_budget, "mgp")?;
        Ok(collaborator.mgp_amount)
    }

    pub fn settle_mgp(&mut self, who: &ParticipantId) -> Result<Amount> {
        let amount = self.quote_mgp(who)?;
        self.get_mgp(amount)?;
        self.collaborators.set_mgp_paid(who, true);
        Ok(amount)
    }

    /// Bonus share payable through the standard path.
    pub fn quote_bonus(&self, who: &ParticipantId) -> Result<Amount> {
        self.ensure_active("pay bonus")?;
        let collaborator = self.collaborator(who)?;
        if collaborator.approval != ApprovalState::Approved {
            return Err(LedgerError::state(format!(
                "collaborator {who} is {:?}, not approved",
                collaborator.approval
            )));
        }
        if collaborator.disputed {
            return Err(LedgerError::state(format!(
                "collaborator {who} is under dispute; bonus goes through arbitration"
            )));
        }
        if collaborator.bonus_settlement.is_some() {
            return Err(LedgerError::state(format!("bonus already paid to {who}")));
        }
        let share = self.bonus_share(collaborator.bonus_score)?;
        if share == 0 {
            return Err(LedgerError::state(format!("no bonus owed to {who}")));
        }
        self.checked_pool_payment(self.bonus_paid, share, self.bonus_budget, "bonus")?;
        Ok(share)
    }

    pub fn settle_bonus(&mut self, who: &ParticipantId) -> Result<Amount> {
        let share = self.quote_bonus(who)?;
        self.paid_bonus(share)?;
        self.collaborators.set_bonus_paid(who, share, PayoutKind::Bonus);
        Ok(share)
    }

    /// Observer fees become claimable once the package is finished, when the
    /// roster can no longer grow.
    pub fn quote_observer_fee(&self, who: &ParticipantId) -> Result<Amount> {
        if self.state != PackageState::Finished {
            return Err(LedgerError::state(format!(
                "observer fees of package {} are claimable once it is finished",
                self.id
            )));
        }
        let observer = self.observer(who)?;
        if observer.paid {
            return Err(LedgerError::state(format!("observer fee already paid to {who}")));
        }
        let share = self.observer_fee_share()?;
        if share == 0 {
            return Err(LedgerError::state(format!("no observer fee owed to {who}")));
        }
        self.checked_pool_payment(
            self.observer_fee_paid,
            share,
            self.observer_fee_budget,
            "observer fee",
        )?;
        Ok(share)
    }

    pub fn settle_observer_fee(&mut self, who: &ParticipantId) -> Result<Amount> {
        self.quote_observer_fee(who)?;
        let share = self.get_observer_fee()?;
        self.observers.mark_paid(who, share);
        Ok(share)
    }

    // ─────────────────────────────────────────────────────────
    // Reversal
    // ─────────────────────────────────────────────────────────

    /// Check that `payout` is the settlement currently recorded for its payee.
    pub fn check_reverse(&self, payout: &Payout) -> Result<()> {
        let who = &payout.payee;
        let recorded = match payout.kind {
            PayoutKind::Mgp => {
                self.ensure_active("reverse mgp")?;
                let collaborator = self.collaborator(who)?;
                collaborator.mgp_paid && collaborator.mgp_amount == payout.amount
            }
            PayoutKind::Bonus | PayoutKind::ArbitratedBonus => {
                self.ensure_active("reverse bonus")?;
                let collaborator = self.collaborator(who)?;
                collaborator.bonus_settlement == Some(payout.kind)
                    && collaborator.bonus_paid == payout.amount
            }
            PayoutKind::ObserverFee => {
                let observer = self.observer(who)?;
                self.state == PackageState::Finished
                    && observer.paid
                    && observer.fee_paid == payout.amount
            }
        };
        if !recorded {
            return Err(LedgerError::invariant(format!(
                "{} payout of {} to {who} is not recorded in package {}",
                payout.kind.as_str(),
                payout.amount,
                self.id
            )));
        }
        Ok(())
    }

    /// Undo a recorded settlement. Used only when the asset transfer behind
    /// it failed and the integrator chose to roll the accounting back.
    pub fn reverse(&mut self, payout: &Payout) -> Result<()> {
        self.check_reverse(payout)?;
        let who = &payout.payee;
        match payout.kind {
            PayoutKind::Mgp => {
                self.mgp_paid -= payout.amount;
                self.collaborators.set_mgp_paid(who, false);
            }
            PayoutKind::Bonus | PayoutKind::ArbitratedBonus => {
                self.bonus_paid -= payout.amount;
                self.collaborators.clear_bonus_paid(who);
            }
            PayoutKind::ObserverFee => {
                self.observer_fee_paid -= payout.amount;
                self.observers.clear_paid(who);
            }
        }
        Ok(())
    }
}
