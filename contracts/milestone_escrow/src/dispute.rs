//! # Dispute Coordinator
//!
//! A dispute is a per-collaborator hold, independent of the approval state:
//!
//! * while `disputed`, the standard bonus claim is refused and the package
//!   cannot finish;
//! * an arbitration authority settles the bonus through
//!   [`Project::pay_disputed_bonus`], which ignores the flag and does not
//!   clear it;
//! * [`Project::resolve_dispute`] clears the flag and nothing else.

use tracing::{info, warn};

use crate::errors::{LedgerError, Result};
use crate::events::LedgerEvent;
use crate::package::Package;
use crate::project::Project;
use crate::types::{checked_add, Amount, ApprovalState, PackageId, ParticipantId, Payout, PayoutKind};

impl Package {
    pub fn raise_dispute(&mut self, who: &ParticipantId) -> Result<()> {
        self.ensure_active("raise a dispute")?;
        if self.collaborator(who)?.disputed {
            return Err(LedgerError::state(format!(
                "collaborator {who} is already under dispute"
            )));
        }
        self.collaborators.set_disputed(who, true);
        Ok(())
    }

    /// Clear the flag. Returns whether a dispute was actually open.
    pub fn resolve_dispute(&mut self, who: &ParticipantId) -> Result<bool> {
        self.collaborator(who)?;
        Ok(self.collaborators.set_disputed(who, false))
    }

    pub fn quote_arbitrated_bonus(&self, who: &ParticipantId, amount: Amount) -> Result<()> {
        self.ensure_active("pay an arbitrated bonus")?;
        let collaborator = self.collaborator(who)?;
        if collaborator.approval != ApprovalState::Approved {
            return Err(LedgerError::state(format!(
                "collaborator {who} is {:?}, not approved",
                collaborator.approval
            )));
        }
        if collaborator.bonus_settlement.is_some() {
            return Err(LedgerError::state(format!("bonus already paid to {who}")));
        }
        if amount == 0 {
            return Err(LedgerError::invariant("arbitrated bonus must be positive"));
        }
        let paid = checked_add(self.bonus_paid, amount, "bonus")?;
        if paid > self.bonus_budget {
            return Err(LedgerError::invariant(format!(
                "arbitrated bonus of {amount} exceeds the remaining {} in package {}",
                self.bonus_budget - self.bonus_paid,
                self.id
            )));
        }
        Ok(())
    }

    pub fn settle_arbitrated_bonus(&mut self, who: &ParticipantId, amount: Amount) -> Result<()> {
        self.quote_arbitrated_bonus(who, amount)?;
        self.paid_bonus(amount)?;
        self.collaborators.set_bonus_paid(who, amount, PayoutKind::ArbitratedBonus);
        Ok(())
    }
}

impl Project {
    pub fn raise_dispute(&mut self, package_id: PackageId, who: &ParticipantId) -> Result<()> {
        self.ensure_active()?;
        self.package_mut(package_id)?.raise_dispute(who)?;
        self.emit(LedgerEvent::DisputeRaised {
            project_id: self.id,
            package_id,
            collaborator: who.clone(),
        });
        warn!(project_id = self.id, package_id, collaborator = %who, "dispute raised");
        Ok(())
    }

    /// Idempotent: resolving a collaborator with no open dispute succeeds and
    /// emits nothing.
    pub fn resolve_dispute(&mut self, package_id: PackageId, who: &ParticipantId) -> Result<()> {
        let cleared = self.package_mut(package_id)?.resolve_dispute(who)?;
        if cleared {
            self.emit(LedgerEvent::DisputeResolved {
                project_id: self.id,
                package_id,
                collaborator: who.clone(),
            });
            info!(project_id = self.id, package_id, collaborator = %who, "dispute resolved");
        }
        Ok(())
    }

    /// Arbitration path for bonus settlement. Works whether or not the
    /// collaborator is currently disputed; the flag is left as it is.
    pub fn pay_disputed_bonus(
        &mut self,
        package_id: PackageId,
        who: &ParticipantId,
        amount: Amount,
    ) -> Result<Payout> {
        self.ensure_active()?;
        self.package(package_id)?.quote_arbitrated_bonus(who, amount)?;
        self.check_payment(amount)?;
        self.package_mut(package_id)?
            .settle_arbitrated_bonus(who, amount)?;
        self.finish_payout(package_id, who, amount, PayoutKind::ArbitratedBonus)
    }
}
