//! Ordered structure steps applied to every tenant namespace.
//!
//! Steps are plain SQL with a `__SCHEMA__` placeholder that is replaced by
//! the quoted schema identifier. Versions are strictly increasing and a
//! step is never edited once released; add a new step instead.
use crate::ident::{IdentResult, quote_identifier};

/// Placeholder replaced by the quoted tenant schema.
pub const SCHEMA_PLACEHOLDER: &str = "__SCHEMA__";
/// Bookkeeping table created inside each tenant schema.
pub const STRUCTURE_TABLE: &str = "_fleet_structure";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StructureStep {
    pub version: i32,
    pub name: &'static str,
    pub sql: &'static str,
}

impl StructureStep {
    /// Render this step for `schema`, quoting it through the identifier guard.
    pub fn render(&self, schema: &str) -> IdentResult<String> {
        let quoted = quote_identifier(schema)?;
        Ok(self.sql.replace(SCHEMA_PLACEHOLDER, &quoted))
    }
}

pub static TENANT_STRUCTURE: &[StructureStep] = &[
    StructureStep {
        version: 1,
        name: "core",
        sql: include_str!("../../tenant_migrations/0001_core.sql"),
    },
    StructureStep {
        version: 2,
        name: "giveaways",
        sql: include_str!("../../tenant_migrations/0002_giveaways.sql"),
    },
];

/// Highest version in `steps`, or 0 for an empty list.
pub fn latest_version(steps: &[StructureStep]) -> i32 {
    steps.iter().map(|step| step.version).max().unwrap_or(0)
}

/// Steps newer than `current`, in version order.
pub fn pending_steps(steps: &[StructureStep], current: i32) -> Vec<StructureStep> {
    let mut pending: Vec<StructureStep> = steps
        .iter()
        .filter(|step| step.version > current)
        .copied()
        .collect();
    pending.sort_by_key(|step| step.version);
    pending
}
