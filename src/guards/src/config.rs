//! Guard profile configuration
//!
//! A [`GuardProfile`] is selected once at startup and never mutated for the
//! lifetime of the guard instance built from it. Environment presets differ
//! only in TTLs, cache sizes, complexity limits and logging verbosity.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{GuardError, Result};

/// Environment variable naming the deployment environment
pub const ENV_PROFILE: &str = "ROUTEGUARDS_ENV";

/// Environment variable that must be set to enable caching
pub const ENV_CACHE_ENABLED: &str = "ROUTEGUARDS_CACHE_ENABLED";

/// How wildcard-capable permissions are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Expand grants into concrete permissions when the context is loaded
    PreExpansion,
    /// Cache raw patterns, match at evaluation time
    OnDemand,
}

/// Scope of a per-user invalidation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidationMode {
    /// Drop every cache entry associated with the user
    Conservative,
    /// Drop only the user's context entry
    Permissive,
}

/// Deployment environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Production,
    Serverless,
    Testing,
}

impl FromStr for Environment {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            "serverless" => Ok(Self::Serverless),
            "testing" | "test" => Ok(Self::Testing),
            other => Err(GuardError::Configuration(format!(
                "unknown environment '{}'",
                other
            ))),
        }
    }
}

/// Time-to-live settings per cache, in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheTtls {
    pub auth_token_ttl_ms: u64,
    pub user_context_ttl_ms: u64,
    pub permission_check_ttl_ms: u64,
}

impl CacheTtls {
    pub fn auth_token(&self) -> Duration {
        Duration::from_millis(self.auth_token_ttl_ms)
    }

    pub fn user_context(&self) -> Duration {
        Duration::from_millis(self.user_context_ttl_ms)
    }

    pub fn permission_check(&self) -> Duration {
        Duration::from_millis(self.permission_check_ttl_ms)
    }
}

/// Cache settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Master switch; when off no cache is read or written
    pub enabled: bool,

    /// Maximum entries per first-tier cache
    pub max_entries: usize,

    pub ttls: CacheTtls,
}

/// Construction-time bounds on expression specs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityLimits {
    /// Maximum number of leaves in an expression
    pub max_expression_complexity: usize,

    /// Maximum depth of an expression AST
    pub max_nesting_depth: usize,
}

impl Default for ComplexityLimits {
    fn default() -> Self {
        Self {
            max_expression_complexity: 50,
            max_nesting_depth: 5,
        }
    }
}

/// Observability switches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringFlags {
    /// Record latency samples
    pub performance_tracking: bool,

    /// Emit per-stage debug logs for every request
    pub detailed_logging: bool,

    /// Record denials and invalidations to the audit sink
    pub audit: bool,

    /// Default `tracing` filter directive
    pub log_level: String,
}

/// Immutable configuration bundle for a guard instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardProfile {
    pub environment: Environment,
    pub resolution_strategy: ResolutionStrategy,
    pub invalidation_mode: InvalidationMode,
    pub cache: CacheSettings,
    pub limits: ComplexityLimits,
    pub monitoring: MonitoringFlags,

    /// Upper bound on a single guard pipeline
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,

    /// Ask the permission source whether a cached context is stale on hit
    #[serde(default)]
    pub check_staleness: bool,
}

impl GuardProfile {
    /// Local development: short TTLs, verbose logging
    pub fn development() -> Self {
        Self {
            environment: Environment::Development,
            resolution_strategy: ResolutionStrategy::OnDemand,
            invalidation_mode: InvalidationMode::Conservative,
            cache: CacheSettings {
                enabled: true,
                max_entries: 1_000,
                ttls: CacheTtls {
                    auth_token_ttl_ms: 60_000,
                    user_context_ttl_ms: 30_000,
                    permission_check_ttl_ms: 30_000,
                },
            },
            limits: ComplexityLimits::default(),
            monitoring: MonitoringFlags {
                performance_tracking: true,
                detailed_logging: true,
                audit: true,
                log_level: "debug".to_string(),
            },
            request_timeout_ms: None,
            check_staleness: false,
        }
    }

    /// Long-running servers: large caches, long TTLs
    pub fn production() -> Self {
        Self {
            environment: Environment::Production,
            resolution_strategy: ResolutionStrategy::OnDemand,
            invalidation_mode: InvalidationMode::Conservative,
            cache: CacheSettings {
                enabled: true,
                max_entries: 50_000,
                ttls: CacheTtls {
                    auth_token_ttl_ms: 5 * 60_000,
                    user_context_ttl_ms: 15 * 60_000,
                    permission_check_ttl_ms: 5 * 60_000,
                },
            },
            limits: ComplexityLimits {
                max_expression_complexity: 100,
                max_nesting_depth: 8,
            },
            monitoring: MonitoringFlags {
                performance_tracking: true,
                detailed_logging: false,
                audit: true,
                log_level: "info".to_string(),
            },
            request_timeout_ms: None,
            check_staleness: false,
        }
    }

    /// Short-lived instances: small caches, short TTLs
    pub fn serverless() -> Self {
        Self {
            environment: Environment::Serverless,
            resolution_strategy: ResolutionStrategy::OnDemand,
            invalidation_mode: InvalidationMode::Conservative,
            cache: CacheSettings {
                enabled: true,
                max_entries: 500,
                ttls: CacheTtls {
                    auth_token_ttl_ms: 2 * 60_000,
                    user_context_ttl_ms: 60_000,
                    permission_check_ttl_ms: 60_000,
                },
            },
            limits: ComplexityLimits::default(),
            monitoring: MonitoringFlags {
                performance_tracking: true,
                detailed_logging: false,
                audit: true,
                log_level: "info".to_string(),
            },
            request_timeout_ms: None,
            check_staleness: false,
        }
    }

    /// Test suites: tiny caches, quiet logging
    pub fn testing() -> Self {
        Self {
            environment: Environment::Testing,
            resolution_strategy: ResolutionStrategy::OnDemand,
            invalidation_mode: InvalidationMode::Conservative,
            cache: CacheSettings {
                enabled: true,
                max_entries: 100,
                ttls: CacheTtls {
                    auth_token_ttl_ms: 1_000,
                    user_context_ttl_ms: 1_000,
                    permission_check_ttl_ms: 1_000,
                },
            },
            limits: ComplexityLimits {
                max_expression_complexity: 20,
                max_nesting_depth: 3,
            },
            monitoring: MonitoringFlags {
                performance_tracking: true,
                detailed_logging: false,
                audit: false,
                log_level: "warn".to_string(),
            },
            request_timeout_ms: None,
            check_staleness: false,
        }
    }

    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Development => Self::development(),
            Environment::Production => Self::production(),
            Environment::Serverless => Self::serverless(),
            Environment::Testing => Self::testing(),
        }
    }

    /// Resolves the profile from the process environment.
    ///
    /// Caching stays off unless `ROUTEGUARDS_CACHE_ENABLED` is `true` or `1`.
    pub fn from_env() -> Result<Self> {
        let environment = std::env::var(ENV_PROFILE).ok();
        let cache_flag = std::env::var(ENV_CACHE_ENABLED).ok();
        Self::from_env_values(environment.as_deref(), cache_flag.as_deref())
    }

    /// Resolves a profile from already-read environment values
    pub fn from_env_values(environment: Option<&str>, cache_flag: Option<&str>) -> Result<Self> {
        let environment = match environment {
            Some(value) if !value.trim().is_empty() => value.parse()?,
            _ => Environment::Development,
        };

        let cache_enabled = matches!(
            cache_flag.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
            Some("true") | Some("1")
        );

        let profile = Self::for_environment(environment).with_cache_enabled(cache_enabled);
        profile.validate()?;
        Ok(profile)
    }

    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache.enabled = enabled;
        self
    }

    pub fn with_strategy(mut self, strategy: ResolutionStrategy) -> Self {
        self.resolution_strategy = strategy;
        self
    }

    pub fn with_invalidation_mode(mut self, mode: InvalidationMode) -> Self {
        self.invalidation_mode = mode;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Rejects profiles that cannot produce a working guard
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_expression_complexity == 0 {
            return Err(GuardError::Configuration(
                "max_expression_complexity must be at least 1".to_string(),
            ));
        }
        if self.limits.max_nesting_depth == 0 {
            return Err(GuardError::Configuration(
                "max_nesting_depth must be at least 1".to_string(),
            ));
        }
        if self.cache.enabled && self.cache.max_entries == 0 {
            return Err(GuardError::Configuration(
                "max_entries must be positive when caching is enabled".to_string(),
            ));
        }
        if self.request_timeout_ms == Some(0) {
            return Err(GuardError::Configuration(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for GuardProfile {
    fn default() -> Self {
        Self::development()
    }
}

/// Where the credential lives on a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthHeaderConfig {
    /// Header name, matched case-insensitively
    pub header_name: String,

    /// Required prefix such as `"Bearer "`
    pub prefix: Option<String>,
}

impl AuthHeaderConfig {
    /// `Authorization: Bearer <token>`
    pub fn bearer() -> Self {
        Self {
            header_name: "authorization".to_string(),
            prefix: Some("Bearer ".to_string()),
        }
    }

    /// Custom header carrying the raw credential, e.g. `x-api-key`
    pub fn api_key(header_name: impl Into<String>) -> Self {
        Self {
            header_name: header_name.into(),
            prefix: None,
        }
    }
}

impl Default for AuthHeaderConfig {
    fn default() -> Self {
        Self::bearer()
    }
}
