//! Identifier guard for dynamically built SQL and cache keys.
//!
//! # Purpose
//! Every tenant-supplied string that ends up inside a schema-qualified SQL
//! statement or a shared cache key passes through this module first. Nothing
//! else in the crate concatenates names into SQL.
//!
//! # Key invariants
//! - A quoted identifier always matches `^[a-zA-Z_][a-zA-Z0-9_]*$` and is at
//!   most 63 bytes (the Postgres identifier limit) before quoting.
//! - A tenant namespace is `tenant_<sanitized-id>`, contains only
//!   `[a-zA-Z0-9_]` and is never longer than 63 bytes.
//! - Cache key segments use the same allowlist discipline with a slightly
//!   wider alphabet (`.`, `:` and `-` are allowed there, never in SQL).
//!
//! # Security model
//! Validation is allowlist-based. Quoting additionally doubles any embedded
//! `"` even though the allowlist already rejects it.
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Maximum identifier length accepted by Postgres.
pub const MAX_IDENTIFIER_LEN: usize = 63;
/// Maximum accepted tenant id length.
pub const MAX_TENANT_ID_LEN: usize = 50;
/// Maximum accepted cache key segment length.
pub const MAX_KEY_SEGMENT_LEN: usize = 128;
/// Prefix shared by every tenant namespace.
pub const TENANT_SCHEMA_PREFIX: &str = "tenant_";

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z_][a-zA-Z0-9_]*$").expect("identifier regex"));
static TENANT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]+$").expect("tenant id regex"));
static TENANT_SCHEMA_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^tenant_[a-zA-Z0-9_]+$").expect("tenant schema regex"));
static KEY_SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_.:-]+$").expect("key segment regex"));

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentError {
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),
    #[error("invalid tenant id: {0:?}")]
    InvalidTenantId(String),
}

pub type IdentResult<T> = Result<T, IdentError>;

/// Validate `name` and return it double-quoted for SQL interpolation.
///
/// # Errors
/// - [`IdentError::InvalidIdentifier`] when `name` is empty, longer than
///   [`MAX_IDENTIFIER_LEN`], or contains anything outside
///   `[a-zA-Z0-9_]` (or starts with a digit).
///
/// # Example
/// ```rust
/// use fleetcore::ident::quote_identifier;
///
/// assert_eq!(quote_identifier("tenant_abc").unwrap(), "\"tenant_abc\"");
/// assert!(quote_identifier("x; DROP TABLE users").is_err());
/// ```
pub fn quote_identifier(name: &str) -> IdentResult<String> {
    if name.len() > MAX_IDENTIFIER_LEN || !IDENTIFIER_RE.is_match(name) {
        return Err(IdentError::InvalidIdentifier(name.to_string()));
    }
    // The allowlist already excludes quotes; escape anyway.
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Derive the isolated schema name for `tenant_id`.
///
/// Characters outside `[a-zA-Z0-9_]` are stripped before prefixing, so
/// `"abc-123"` maps to `"tenant_abc123"`.
///
/// # Errors
/// - [`IdentError::InvalidTenantId`] unless `tenant_id` matches
///   `^[a-zA-Z0-9_-]+$` with length in `1..=50`, or if sanitizing leaves
///   nothing behind (e.g. `"---"`).
pub fn tenant_schema_name(tenant_id: &str) -> IdentResult<String> {
    if tenant_id.is_empty()
        || tenant_id.len() > MAX_TENANT_ID_LEN
        || !TENANT_ID_RE.is_match(tenant_id)
    {
        return Err(IdentError::InvalidTenantId(tenant_id.to_string()));
    }
    let sanitized: String = tenant_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    if sanitized.is_empty() {
        return Err(IdentError::InvalidTenantId(tenant_id.to_string()));
    }
    let name = format!("{TENANT_SCHEMA_PREFIX}{sanitized}");
    if !is_tenant_schema(&name) {
        return Err(IdentError::InvalidTenantId(tenant_id.to_string()));
    }
    Ok(name)
}

/// Inverse of [`tenant_schema_name`]: strip the prefix from a tenant schema.
///
/// Sanitization is lossy, so the returned id is the sanitized form
/// (`tenant_abc123` yields `abc123` even if the tenant registered `abc-123`).
pub fn schema_to_tenant_id(schema: &str) -> Option<String> {
    if !is_tenant_schema(schema) {
        return None;
    }
    schema
        .strip_prefix(TENANT_SCHEMA_PREFIX)
        .map(|rest| rest.to_string())
}

/// True when `name` is shaped like a tenant namespace.
pub fn is_tenant_schema(name: &str) -> bool {
    name.len() <= MAX_IDENTIFIER_LEN && TENANT_SCHEMA_RE.is_match(name)
}

/// Validate one segment of a shared cache key.
///
/// # Errors
/// - [`IdentError::InvalidIdentifier`] for empty, overlong, or
///   out-of-alphabet segments (whitespace, quotes, `*`, `?`, etc.).
pub fn validate_key_segment(segment: &str) -> IdentResult<&str> {
    if segment.is_empty()
        || segment.len() > MAX_KEY_SEGMENT_LEN
        || !KEY_SEGMENT_RE.is_match(segment)
    {
        return Err(IdentError::InvalidIdentifier(segment.to_string()));
    }
    Ok(segment)
}

/// A table reference whose parts are always rendered through
/// [`quote_identifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub schema: Option<String>,
    pub table: String,
}

impl TableRef {
    /// Table in the connection's default search path.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            schema: None,
            table: table.into(),
        }
    }

    /// Table inside the schema of `tenant_id`.
    pub fn in_tenant(tenant_id: &str, table: impl Into<String>) -> IdentResult<Self> {
        Ok(Self {
            schema: Some(tenant_schema_name(tenant_id)?),
            table: table.into(),
        })
    }

    /// Table inside an explicit schema.
    pub fn in_schema(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: Some(schema.into()),
            table: table.into(),
        }
    }

    /// Render `"schema"."table"` (or `"table"`).
    pub fn qualified(&self) -> IdentResult<String> {
        let table = quote_identifier(&self.table)?;
        match &self.schema {
            Some(schema) => Ok(format!("{}.{}", quote_identifier(schema)?, table)),
            None => Ok(table),
        }
    }

    /// Stable label used for logs and advisory lock keys.
    pub fn label(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{schema}.{}", self.table),
            None => self.table.clone(),
        }
    }
}
