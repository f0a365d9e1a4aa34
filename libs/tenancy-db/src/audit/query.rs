use chrono::{DateTime, Utc};
use sea_orm::{ColumnTrait, Condition};
use serde::{Deserialize, Serialize};
use tenancy_security::{ActorId, TenantId};

use crate::TenancyError;
use crate::audit::entity::{AuditAction, Column, Entity, Model};
use crate::secure::StoreSession;

/// Half-open `[from, to)` interval; a missing bound is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl DateRange {
    #[must_use]
    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    fn condition(self) -> Condition {
        let mut cond = Condition::all();
        if let Some(from) = self.from {
            cond = cond.add(Column::OccurredAt.gte(from));
        }
        if let Some(to) = self.to {
            cond = cond.add(Column::OccurredAt.lt(to));
        }
        cond
    }
}

#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub entity_type: Option<String>,
    pub actor_id: Option<ActorId>,
    pub action: Option<AuditAction>,
    pub range: Option<DateRange>,
}

impl AuditFilter {
    fn condition(&self) -> Condition {
        let mut cond = Condition::all();
        if let Some(entity_type) = &self.entity_type {
            cond = cond.add(Column::EntityType.eq(entity_type.as_str()));
        }
        if let Some(actor) = self.actor_id {
            cond = cond.add(Column::ActorId.eq(actor.as_uuid()));
        }
        if let Some(action) = self.action {
            cond = cond.add(Column::Action.eq(action));
        }
        if let Some(range) = self.range {
            cond = cond.add(range.condition());
        }
        cond
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: u64,
    pub limit: u64,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditPage {
    /// Newest first.
    pub entries: Vec<Model>,
    /// Matching entries across all pages.
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Csv,
}

fn ensure_bound(session: &StoreSession, tenant: TenantId) -> Result<(), TenancyError> {
    match session.current_tenant() {
        None => Err(TenancyError::MissingTenant),
        Some(bound) if bound == tenant => Ok(()),
        Some(_) => Err(TenancyError::CrossTenantRead { requested: tenant }),
    }
}

pub(crate) async fn list_entries(
    session: &StoreSession,
    tenant: TenantId,
    filter: &AuditFilter,
    page: Page,
) -> Result<AuditPage, TenancyError> {
    ensure_bound(session, tenant)?;
    let cond = filter.condition();
    let total = session.select::<Entity>().filter(cond.clone()).count().await?;
    let entries = session
        .select::<Entity>()
        .filter(cond)
        .order_by_desc(Column::OccurredAt)
        .order_by_desc(Column::Id)
        .offset(page.offset)
        .limit(page.limit)
        .all()
        .await?;
    Ok(AuditPage { entries, total })
}

pub(crate) async fn export_report(
    session: &StoreSession,
    tenant: TenantId,
    range: DateRange,
    format: ExportFormat,
) -> Result<Vec<u8>, TenancyError> {
    ensure_bound(session, tenant)?;
    let entries = session
        .select::<Entity>()
        .filter(range.condition())
        .order_by_asc(Column::OccurredAt)
        .all()
        .await?;
    tracing::info!(
        tenant_id = %tenant,
        entries = entries.len(),
        format = ?format,
        "audit report exported"
    );
    match format {
        ExportFormat::Json => Ok(serde_json::to_vec_pretty(&entries)?),
        ExportFormat::Csv => Ok(to_csv(&entries).into_bytes()),
    }
}

const CSV_HEADER: &str =
    "id,occurred_at,actor_id,entity_type,entity_id,action,before_state,after_state";

fn to_csv(entries: &[Model]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for e in entries {
        let json = |v: Option<&serde_json::Value>| v.map(ToString::to_string).unwrap_or_default();
        let fields = [
            e.id.to_string(),
            e.occurred_at.to_rfc3339(),
            e.actor_id.to_string(),
            e.entity_type.clone(),
            e.entity_id.clone(),
            e.action.as_str().to_owned(),
            json(e.before_state.as_ref()),
            json(e.after_state.as_ref()),
        ];
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&csv_field(field));
        }
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_owned()
    }
}
