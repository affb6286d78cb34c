//! Aggregate error for platform operations and its user-facing rendering.
use crate::audit::AuditError;
use crate::consistency::{ConsistencyError, Retryable};
use crate::crypto::CryptoError;
use crate::ident::IdentError;
use crate::schema::SchemaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error(transparent)]
    Ident(#[from] IdentError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Consistency(#[from] ConsistencyError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error("rate limited on {action}; retry in {retry_after_secs}s")]
    RateLimited { action: String, retry_after_secs: u64 },
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },
    #[error("giveaway {0} has ended")]
    GiveawayClosed(i64),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type PlatformResult<T> = Result<T, PlatformError>;

impl From<sqlx::Error> for PlatformError {
    fn from(err: sqlx::Error) -> Self {
        PlatformError::Consistency(ConsistencyError::from(err))
    }
}

impl Retryable for PlatformError {
    fn is_transient(&self) -> bool {
        matches!(self, PlatformError::Consistency(err) if err.is_transient())
    }

    fn is_conflict(&self) -> bool {
        matches!(self, PlatformError::Consistency(err) if err.is_conflict())
    }
}

impl PlatformError {
    /// True when repeating the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_transient() || self.is_conflict()
    }

    /// Message safe to show an end user.
    ///
    /// Bad identifiers, missing confirmation, and integrity failures get a
    /// specific message. Exhausted concurrency retries get a generic
    /// "try again". Internal details never appear.
    pub fn public_message(&self) -> String {
        match self {
            PlatformError::Ident(IdentError::InvalidTenantId(_)) => {
                "Tenant ids may only contain letters, digits, '-' and '_' (1-50 characters).".into()
            }
            PlatformError::Ident(IdentError::InvalidIdentifier(_))
            | PlatformError::Consistency(ConsistencyError::Ident(_))
            | PlatformError::Schema(SchemaError::Ident(_)) => {
                "The request contains a name with characters that are not allowed.".into()
            }
            PlatformError::Crypto(CryptoError::AuthenticationFailed) => {
                "Stored credentials failed an integrity check. Rotate the bot token.".into()
            }
            PlatformError::Crypto(CryptoError::EmptyInput) => "A bot token is required.".into(),
            PlatformError::Crypto(_) => "Stored credentials could not be read.".into(),
            PlatformError::Schema(SchemaError::ConfirmationRequired { tenant_id }) => format!(
                "Type DELETE_TENANT_{tenant_id} to confirm deleting this tenant and all of its data."
            ),
            PlatformError::Consistency(ConsistencyError::OptimisticLock { entity, .. }) => {
                format!("Someone else changed this {entity}. Reload and try again.")
            }
            PlatformError::Consistency(ConsistencyError::AlreadyExists { entity, .. }) => {
                format!("That {entity} already exists.")
            }
            PlatformError::Consistency(ConsistencyError::NotFound { entity, .. })
            | PlatformError::NotFound { entity, .. } => format!("The {entity} was not found."),
            PlatformError::RateLimited { retry_after_secs, .. } => {
                format!("Too many requests. Try again in {retry_after_secs} seconds.")
            }
            PlatformError::GiveawayClosed(_) => "This giveaway has ended.".into(),
            PlatformError::InvalidInput(reason) => reason.clone(),
            _ => "The service is busy. Please try again.".into(),
        }
    }
}
