//! Per-package observer roster.
//!
//! Observers verify collaborator work and split the package's observer fee
//! pool evenly. The roster only tracks who is admitted and who has been paid;
//! the fee pool itself is accounted on the [`Package`](crate::package::Package).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::errors::{LedgerError, Result};
use crate::types::{Amount, ParticipantId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observer {
    pub participant: ParticipantId,
    /// Amount received; zero until the fee is claimed.
    pub fee_paid: Amount,
    pub paid: bool,
}

impl Observer {
    fn new(participant: ParticipantId) -> Self {
        Self {
            participant,
            fee_paid: 0,
            paid: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObserverLedger {
    roster: HashMap<ParticipantId, Observer>,
}

impl ObserverLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.roster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }

    pub fn get(&self, who: &ParticipantId) -> Option<&Observer> {
        self.roster.get(who)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observer> {
        self.roster.values()
    }

    /// Reject batches that repeat a participant or name one already admitted.
    pub fn check_admit(&self, batch: &[ParticipantId]) -> Result<()> {
        let mut seen = HashSet::with_capacity(batch.len());
        for who in batch {
            if self.roster.contains_key(who) || !seen.insert(who) {
                return Err(LedgerError::invariant(format!(
                    "observer {who} is already admitted"
                )));
            }
        }
        Ok(())
    }

    /// Admit a batch previously accepted by [`check_admit`](Self::check_admit).
    pub(crate) fn admit(&mut self, batch: &[ParticipantId]) {
        for who in batch {
            self.roster.insert(who.clone(), Observer::new(who.clone()));
        }
    }

    pub(crate) fn mark_paid(&mut self, who: &ParticipantId, amount: Amount) {
        if let Some(observer) = self.roster.get_mut(who) {
            observer.paid = true;
            observer.fee_paid = amount;
        }
    }

    pub(crate) fn clear_paid(&mut self, who: &ParticipantId) {
        if let Some(observer) = self.roster.get_mut(who) {
            observer.paid = false;
            observer.fee_paid = 0;
        }
    }

    pub(crate) fn restore(&mut self, observer: Observer) {
        self.roster.insert(observer.participant.clone(), observer);
    }
}
