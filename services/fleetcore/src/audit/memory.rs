//! In-memory audit sink for tests and local runs. Not durable.
use super::{AuditEvent, AuditQuery, AuditRecord, AuditResult, AuditSink};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    records: RwLock<Vec<AuditRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    async fn select(
        &self,
        query: &AuditQuery,
        matches: impl Fn(&AuditRecord) -> bool,
    ) -> Vec<AuditRecord> {
        let records = self.records.read().await;
        let mut selected: Vec<AuditRecord> = records
            .iter()
            .filter(|record| matches(record))
            .filter(|record| query.action.as_deref().is_none_or(|a| a == record.action))
            .cloned()
            .collect();
        selected.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        selected
            .into_iter()
            .skip(query.offset as usize)
            .take(query.effective_limit() as usize)
            .collect()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn insert(&self, event: AuditEvent) -> AuditResult<AuditRecord> {
        let mut records = self.records.write().await;
        let record = AuditRecord {
            id: records.len() as i64 + 1,
            action: event.action,
            tenant_id: event.tenant_id,
            user_id: event.user_id,
            metadata: event.metadata,
            ip_address: event.ip_address,
            timestamp: Utc::now(),
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn query_by_tenant(&self, tenant_id: &str, query: &AuditQuery) -> AuditResult<Vec<AuditRecord>> {
        Ok(self.select(query, |record| record.tenant_id == tenant_id).await)
    }

    async fn query_by_user(&self, user_id: &str, query: &AuditQuery) -> AuditResult<Vec<AuditRecord>> {
        Ok(self.select(query, |record| record.user_id == user_id).await)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
