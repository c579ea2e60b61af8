//! Storage shapes for the ledger event log.
//!
//! Each [`LedgerEvent`] is flattened into a few indexed columns (kind,
//! project, package, actor, amount) plus its full JSON body.

use milestone_escrow::LedgerEvent;
use serde::{Deserialize, Serialize};

use crate::db::sql_id;
use crate::errors::Result;

/// An event ready to be inserted into the `events` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_type: &'static str,
    pub project_id: i64,
    pub package_id: Option<i64>,
    pub actor: Option<String>,
    /// Decimal string; amounts do not fit SQLite integers.
    pub amount: Option<String>,
    pub body: String,
}

impl NewEvent {
    pub fn from_ledger(event: &LedgerEvent) -> Result<Self> {
        Ok(Self {
            event_type: event.name(),
            project_id: sql_id(event.project_id())?,
            package_id: event.package_id().map(sql_id).transpose()?,
            actor: event.actor().map(|who| who.to_string()),
            amount: event.amount().map(|amount| amount.to_string()),
            body: serde_json::to_string(event)?,
        })
    }
}

/// A raw event record as stored in / read from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct EventRecord {
    pub id: i64,
    pub event_type: String,
    pub project_id: i64,
    pub package_id: Option<i64>,
    pub actor: Option<String>,
    pub amount: Option<String>,
    pub body: String,
    pub created_at: i64,
}
