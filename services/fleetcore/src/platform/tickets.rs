//! Support tickets numbered per tenant.
use super::{Actor, Platform, PlatformResult};
use crate::consistency::sequence::{SequenceScope, next_in_sequence};
use crate::consistency::{ConsistencyError, ConsistencyResult, is_unique_violation, run_in_transaction};
use crate::ident::TableRef;
use crate::ratelimit::policy::RateLimitPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;

pub const MAX_SUBJECT_LEN: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Ticket {
    pub id: i64,
    pub ticket_number: i64,
    pub opened_by: String,
    pub subject: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl Platform {
    /// Open a ticket with the next number in the tenant's sequence.
    ///
    /// Concurrent callers for one tenant always receive distinct,
    /// contiguous numbers.
    pub async fn issue_ticket(&self, actor: &Actor, tenant_id: &str, subject: &str) -> PlatformResult<Ticket> {
        let table = TableRef::in_tenant(tenant_id, "tickets")?;
        let subject = subject.trim();
        if subject.is_empty() || subject.chars().count() > MAX_SUBJECT_LEN {
            return Err(super::PlatformError::InvalidInput(format!(
                "Ticket subjects must be 1-{MAX_SUBJECT_LEN} characters."
            )));
        }
        self.enforce(RateLimitPolicy::AccessApi, actor, tenant_id).await?;

        let opened_by = actor.user_id.clone();
        let subject = subject.to_string();
        let ticket = run_in_transaction(self.pool(), self.retry_policy(), |_| {}, |conn| {
            Box::pin(insert_ticket(conn, table.clone(), opened_by.clone(), subject.clone()))
        })
        .await?;
        tracing::debug!(tenant_id, ticket_number = ticket.ticket_number, "ticket issued");
        Ok(ticket)
    }

    pub async fn list_tickets(&self, tenant_id: &str) -> PlatformResult<Vec<Ticket>> {
        let table = TableRef::in_tenant(tenant_id, "tickets")?.qualified()?;
        let tickets = sqlx::query_as::<_, Ticket>(&format!(
            "SELECT id, ticket_number, opened_by, subject, status, created_at FROM {table} ORDER BY ticket_number"
        ))
        .fetch_all(self.pool())
        .await?;
        Ok(tickets)
    }
}

async fn insert_ticket(
    conn: &mut PgConnection,
    table: TableRef,
    opened_by: String,
    subject: String,
) -> ConsistencyResult<Ticket> {
    let scope = SequenceScope::new(table.clone(), "ticket_number");
    let number = next_in_sequence(conn, &scope).await?;
    let sql = format!(
        "INSERT INTO {} (ticket_number, opened_by, subject) VALUES ($1, $2, $3)
         RETURNING id, ticket_number, opened_by, subject, status, created_at",
        table.qualified()?
    );
    sqlx::query_as::<_, Ticket>(&sql)
        .bind(number)
        .bind(&opened_by)
        .bind(&subject)
        .fetch_one(&mut *conn)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                ConsistencyError::DuplicateRace {
                    entity: "ticket".into(),
                }
            } else {
                err.into()
            }
        })
}
