//! Pre-defined rate-limit policies.
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitPolicy {
    CreateTenant,
    OperateBot,
    UpdateCredentials,
    AccessApi,
}

impl RateLimitPolicy {
    pub const ALL: [RateLimitPolicy; 4] = [
        RateLimitPolicy::CreateTenant,
        RateLimitPolicy::OperateBot,
        RateLimitPolicy::UpdateCredentials,
        RateLimitPolicy::AccessApi,
    ];

    /// Action segment of the bucket key.
    pub fn action(self) -> &'static str {
        match self {
            RateLimitPolicy::CreateTenant => "create-tenant",
            RateLimitPolicy::OperateBot => "operate-bot",
            RateLimitPolicy::UpdateCredentials => "update-credentials",
            RateLimitPolicy::AccessApi => "access-api",
        }
    }

    pub fn limit(self) -> u32 {
        match self {
            RateLimitPolicy::CreateTenant => 5,
            RateLimitPolicy::OperateBot => 30,
            RateLimitPolicy::UpdateCredentials => 10,
            RateLimitPolicy::AccessApi => 100,
        }
    }

    pub fn window(self) -> Duration {
        match self {
            RateLimitPolicy::CreateTenant | RateLimitPolicy::UpdateCredentials => {
                Duration::from_secs(3600)
            }
            RateLimitPolicy::OperateBot | RateLimitPolicy::AccessApi => Duration::from_secs(60),
        }
    }
}
