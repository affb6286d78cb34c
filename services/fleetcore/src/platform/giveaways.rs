//! Giveaways and idempotent entries.
use super::{Actor, Platform, PlatformError, PlatformResult};
use crate::consistency::unique::{DuplicatePolicy, InsertOutcome, ParentCounter, UniqueGuard};
use crate::consistency::{ConsistencyError, ConsistencyResult, SqlValue, run_in_transaction};
use crate::ident::{TableRef, validate_key_segment};
use crate::ratelimit::policy::RateLimitPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Giveaway {
    pub id: i64,
    pub prize: String,
    pub entry_count: i64,
    pub ends_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiveawayEntry {
    pub giveaway_id: i64,
    pub user_id: String,
    pub outcome: InsertOutcome,
    pub entry_count: i64,
}

/// Why an entry attempt was turned away before the guard ran.
enum EntryBlock {
    Missing,
    Closed,
}

impl Platform {
    pub async fn create_giveaway(
        &self,
        actor: &Actor,
        tenant_id: &str,
        prize: &str,
        ends_at: Option<DateTime<Utc>>,
    ) -> PlatformResult<Giveaway> {
        let table = TableRef::in_tenant(tenant_id, "giveaways")?.qualified()?;
        let prize = prize.trim();
        if prize.is_empty() {
            return Err(PlatformError::InvalidInput("A prize is required.".into()));
        }
        self.enforce(RateLimitPolicy::AccessApi, actor, tenant_id).await?;
        let giveaway = sqlx::query_as::<_, Giveaway>(&format!(
            "INSERT INTO {table} (prize, ends_at) VALUES ($1, $2) RETURNING id, prize, entry_count, ends_at"
        ))
        .bind(prize)
        .bind(ends_at)
        .fetch_one(self.pool())
        .await?;
        Ok(giveaway)
    }

    pub async fn get_giveaway(&self, tenant_id: &str, giveaway_id: i64) -> PlatformResult<Giveaway> {
        let table = TableRef::in_tenant(tenant_id, "giveaways")?.qualified()?;
        sqlx::query_as::<_, Giveaway>(&format!(
            "SELECT id, prize, entry_count, ends_at FROM {table} WHERE id = $1"
        ))
        .bind(giveaway_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| giveaway_not_found(giveaway_id))
    }

    /// Enter `user_id` into a giveaway. Entering twice is not an error: the
    /// second call returns [`InsertOutcome::Existing`] and the entry count
    /// is unchanged.
    pub async fn enter_giveaway(
        &self,
        actor: &Actor,
        tenant_id: &str,
        giveaway_id: i64,
        user_id: &str,
    ) -> PlatformResult<GiveawayEntry> {
        validate_key_segment(user_id)?;
        let entries = TableRef::in_tenant(tenant_id, "giveaway_entries")?;
        let giveaways = TableRef::in_tenant(tenant_id, "giveaways")?;
        self.enforce(RateLimitPolicy::AccessApi, actor, tenant_id).await?;

        let guard = UniqueGuard::new("giveaway entry", entries, DuplicatePolicy::ReturnExisting)
            .key("giveaway_id", giveaway_id)
            .key("user_id", user_id)
            .counting(ParentCounter {
                table: giveaways.clone(),
                key_column: "id".into(),
                key: SqlValue::Int(giveaway_id),
                counter_column: "entry_count".into(),
            });
        let outcome = run_in_transaction(self.pool(), self.retry_policy(), |_| {}, |conn| {
            Box::pin(insert_entry(conn, giveaways.clone(), guard.clone(), giveaway_id))
        })
        .await;
        let outcome = match outcome {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(EntryBlock::Missing)) => return Err(giveaway_not_found(giveaway_id)),
            Ok(Err(EntryBlock::Closed)) => return Err(PlatformError::GiveawayClosed(giveaway_id)),
            Err(ConsistencyError::NotFound { .. }) => return Err(giveaway_not_found(giveaway_id)),
            Err(err) => return Err(err.into()),
        };

        let giveaway = self.get_giveaway(tenant_id, giveaway_id).await?;
        Ok(GiveawayEntry {
            giveaway_id,
            user_id: user_id.to_string(),
            outcome,
            entry_count: giveaway.entry_count,
        })
    }
}

fn giveaway_not_found(giveaway_id: i64) -> PlatformError {
    PlatformError::NotFound {
        entity: "giveaway".into(),
        id: giveaway_id.to_string(),
    }
}

async fn insert_entry(
    conn: &mut PgConnection,
    giveaways: TableRef,
    guard: UniqueGuard,
    giveaway_id: i64,
) -> ConsistencyResult<Result<InsertOutcome, EntryBlock>> {
    let ends_at: Option<Option<DateTime<Utc>>> = sqlx::query_scalar(&format!(
        "SELECT ends_at FROM {} WHERE id = $1",
        giveaways.qualified()?
    ))
    .bind(giveaway_id)
    .fetch_optional(&mut *conn)
    .await?;
    match ends_at {
        None => return Ok(Err(EntryBlock::Missing)),
        Some(Some(ends_at)) if ends_at <= Utc::now() => return Ok(Err(EntryBlock::Closed)),
        Some(_) => {}
    }
    Ok(Ok(guard.insert(conn, &[]).await?))
}
