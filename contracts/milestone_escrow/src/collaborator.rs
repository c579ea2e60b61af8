//! Per-package collaborator roster.
//!
//! Tracks each collaborator's guaranteed fee, review outcome, bonus score,
//! settlement flags and dispute flag, together with running counters the
//! package consults on every call (approved, rejected, open disputes, score
//! sum). Counters are updated by the mutators here and never recomputed by
//! scanning the roster.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::errors::{LedgerError, Result};
use crate::types::{checked_add, Amount, ApprovalState, ParticipantId, PayoutKind, Score};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collaborator {
    pub participant: ParticipantId,
    /// Guaranteed fee reserved on admission.
    pub mgp_amount: Amount,
    pub approval: ApprovalState,
    pub bonus_score: Score,
    pub mgp_paid: bool,
    /// Bonus received, through either the standard or the arbitration path.
    pub bonus_paid: Amount,
    /// Path the bonus went through, once settled.
    pub bonus_settlement: Option<PayoutKind>,
    /// Independent of `approval`.
    pub disputed: bool,
}

impl Collaborator {
    fn new(participant: ParticipantId, mgp_amount: Amount) -> Self {
        Self {
            participant,
            mgp_amount,
            approval: ApprovalState::Pending,
            bonus_score: 0,
            mgp_paid: false,
            bonus_paid: 0,
            bonus_settlement: None,
            disputed: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CollaboratorLedger {
    roster: HashMap<ParticipantId, Collaborator>,
    approved: u64,
    rejected: u64,
    disputes: u64,
    total_scores: Score,
}

impl CollaboratorLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.roster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    pub fn get(&self, who: &ParticipantId) -> Option<&Collaborator> {
        self.roster.get(who)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Collaborator> {
        self.roster.values()
    }

    pub fn approved_count(&self) -> u64 {
        self.approved
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected
    }

    pub fn pending_count(&self) -> u64 {
        self.roster.len() as u64 - self.approved - self.rejected
    }

    pub fn dispute_count(&self) -> u64 {
        self.disputes
    }

    /// Sum of all assigned bonus scores.
    pub fn total_scores(&self) -> Score {
        self.total_scores
    }

    /// Validate an admission batch and return its total MGP.
    pub fn check_admit(&self, batch: &[(ParticipantId, Amount)]) -> Result<Amount> {
        let mut seen = HashSet::with_capacity(batch.len());
        let mut total: Amount = 0;
        for (who, mgp) in batch {
            if self.roster.contains_key(who) || !seen.insert(who) {
                return Err(LedgerError::invariant(format!(
                    "collaborator {who} is already admitted"
                )));
            }
            total = checked_add(total, *mgp, "collaborator batch")?;
        }
        Ok(total)
    }

    /// Validate a score assignment and return the resulting score sum.
    ///
    /// Scores overwrite earlier assignments for the same collaborator, so the
    /// old score is taken out of the sum before the new one is added.
    pub fn check_scores(&self, scores: &[(ParticipantId, Score)]) -> Result<Score> {
        let mut seen = HashSet::with_capacity(scores.len());
        let mut total = self.total_scores;
        for (who, score) in scores {
            if !seen.insert(who) {
                return Err(LedgerError::invariant(format!(
                    "collaborator {who} is scored twice"
                )));
            }
            let collaborator = self
                .roster
                .get(who)
                .ok_or_else(|| LedgerError::invariant(format!("{who} is not a collaborator")))?;
            if collaborator.approval == ApprovalState::Rejected {
                return Err(LedgerError::state(format!(
                    "collaborator {who} was rejected and cannot be scored"
                )));
            }
            total = (total - collaborator.bonus_score)
                .checked_add(*score)
                .ok_or(LedgerError::ArithmeticOverflow("bonus scores"))?;
        }
        Ok(total)
    }

    pub(crate) fn admit(&mut self, batch: &[(ParticipantId, Amount)]) {
        for (who, mgp) in batch {
            self.roster
                .insert(who.clone(), Collaborator::new(who.clone(), *mgp));
        }
    }

    pub(crate) fn set_scores(&mut self, scores: &[(ParticipantId, Score)]) {
        for (who, score) in scores {
            if let Some(collaborator) = self.roster.get_mut(who) {
                self.total_scores = self.total_scores - collaborator.bonus_score + score;
                collaborator.bonus_score = *score;
            }
        }
    }

    pub(crate) fn mark_approved(&mut self, who: &ParticipantId) {
        if let Some(collaborator) = self.roster.get_mut(who) {
            collaborator.approval = ApprovalState::Approved;
            self.approved += 1;
        }
    }

    pub(crate) fn mark_rejected(&mut self, who: &ParticipantId) {
        if let Some(collaborator) = self.roster.get_mut(who) {
            collaborator.approval = ApprovalState::Rejected;
            self.rejected += 1;
        }
    }

    pub(crate) fn set_mgp_paid(&mut self, who: &ParticipantId, paid: bool) {
        if let Some(collaborator) = self.roster.get_mut(who) {
            collaborator.mgp_paid = paid;
        }
    }

    pub(crate) fn set_bonus_paid(&mut self, who: &ParticipantId, amount: Amount, kind: PayoutKind) {
        if let Some(collaborator) = self.roster.get_mut(who) {
            collaborator.bonus_paid = amount;
            collaborator.bonus_settlement = Some(kind);
        }
    }

    pub(crate) fn clear_bonus_paid(&mut self, who: &ParticipantId) {
        if let Some(collaborator) = self.roster.get_mut(who) {
            collaborator.bonus_paid = 0;
            collaborator.bonus_settlement = None;
        }
    }

    /// Returns `true` when the flag actually changed.
    pub(crate) fn set_disputed(&mut self, who: &ParticipantId, disputed: bool) -> bool {
        let Some(collaborator) = self.roster.get_mut(who) else {
            return false;
        };
        if collaborator.disputed == disputed {
            return false;
        }
        collaborator.disputed = disputed;
        if disputed {
            self.disputes += 1;
        } else {
            self.disputes -= 1;
        }
        true
    }

    /// Reinsert a persisted record, rebuilding the counters it contributes to.
    pub(crate) fn restore(&mut self, collaborator: Collaborator) -> Result<()> {
        match collaborator.approval {
            ApprovalState::Approved => self.approved += 1,
            ApprovalState::Rejected => self.rejected += 1,
            ApprovalState::Pending => {}
        }
        if collaborator.disputed {
            self.disputes += 1;
        }
        self.total_scores = self
            .total_scores
            .checked_add(collaborator.bonus_score)
            .ok_or(LedgerError::ArithmeticOverflow("bonus scores"))?;
        self.roster
            .insert(collaborator.participant.clone(), collaborator);
        Ok(())
    }
}
