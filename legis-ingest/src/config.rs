//! Upstream source configuration for legis-ingest
//!
//! Turns the raw `[sources.*]` TOML sections into one [`SourceConfig`] per
//! upstream. Both sources are described by the same struct (limit, window,
//! auth mode, pagination style); only the defaults differ.
//!
//! Credential priority: CLI → environment → TOML.

use crate::error::{IngestError, IngestResult};
use crate::models::SourceId;
use crate::services::rate_limiter::RateLimiter;
use legis_common::config::{SourceSection, TomlConfig};
use std::fmt;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{info, warn};

pub const CONGRESS_API_KEY_ENV: &str = "LEGIS_CONGRESS_API_KEY";
pub const LDA_API_KEY_ENV: &str = "LEGIS_LDA_API_KEY";
pub const LDA_USERNAME_ENV: &str = "LEGIS_LDA_USERNAME";
pub const LDA_PASSWORD_ENV: &str = "LEGIS_LDA_PASSWORD";

const CONGRESS_BASE_URL: &str = "https://api.congress.gov/v3";
const CONGRESS_RATE_LIMIT: u32 = 5_000;
const CONGRESS_WINDOW_SECS: u64 = 3_600;
const CONGRESS_PAGE_SIZE: u32 = 250;

const LDA_BASE_URL: &str = "https://lda.senate.gov/api/v1";
const LDA_RATE_LIMIT: u32 = 120;
const LDA_ANONYMOUS_RATE_LIMIT: u32 = 15;
const LDA_WINDOW_SECS: u64 = 60;
const LDA_PAGE_SIZE: u32 = 25;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// How requests to a source are authenticated
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// `api_key` query parameter
    ApiKeyQuery(String),
    /// `Authorization: Token <key>`
    Token(String),
    /// HTTP basic auth
    Basic { username: String, password: String },
    Anonymous,
}

impl AuthMode {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, AuthMode::Anonymous)
    }

    pub fn label(&self) -> &'static str {
        match self {
            AuthMode::ApiKeyQuery(_) => "api_key",
            AuthMode::Token(_) => "token",
            AuthMode::Basic { .. } => "basic",
            AuthMode::Anonymous => "anonymous",
        }
    }
}

// Secrets stay out of logs
impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::Basic { username, .. } => write!(f, "Basic({}, ***)", username),
            other => write!(f, "{}(***)", other.label()),
        }
    }
}

/// How a source splits list results across responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaginationStyle {
    /// Follow the absolute `pagination.next` URL until it is absent
    NextUrl,
    /// Increment `page` until `next` is null
    PageNumber,
}

/// Everything needed to talk to one upstream API
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub source: SourceId,
    pub base_url: String,
    pub auth: AuthMode,
    pub rate_limit: NonZeroU32,
    pub window: Duration,
    pub min_interval: Option<Duration>,
    pub pagination: PaginationStyle,
    pub page_size: u32,
    pub timeout: Duration,
}

impl SourceConfig {
    /// Build the rate limiter every request to this source goes through
    pub fn rate_limiter(&self) -> RateLimiter {
        let limiter = RateLimiter::new(self.source.as_str(), self.rate_limit, self.window);
        match self.min_interval {
            Some(interval) if !interval.is_zero() => limiter.with_min_interval(interval),
            _ => limiter,
        }
    }
}

/// Credentials given on the command line
#[derive(Debug, Clone, Default)]
pub struct CredentialOverrides {
    pub congress_api_key: Option<String>,
    pub lda_api_key: Option<String>,
    pub lda_username: Option<String>,
    pub lda_password: Option<String>,
}

/// Validate a credential value (non-empty, non-whitespace)
pub fn is_valid_key(key: &str) -> bool {
    !key.trim().is_empty()
}

/// Resolve one credential: CLI → environment → TOML
///
/// Logs a warning when more than one tier supplies a value.
pub fn resolve_credential(
    name: &str,
    cli: Option<&str>,
    env_var: &str,
    toml: Option<&str>,
) -> Option<String> {
    let cli = cli.filter(|k| is_valid_key(k)).map(str::to_string);
    let env = std::env::var(env_var).ok().filter(|k| is_valid_key(k));
    let toml = toml.filter(|k| is_valid_key(k)).map(str::to_string);

    let sources: Vec<&str> = [
        cli.as_ref().map(|_| "command line"),
        env.as_ref().map(|_| "environment"),
        toml.as_ref().map(|_| "TOML"),
    ]
    .into_iter()
    .flatten()
    .collect();

    if sources.len() > 1 {
        warn!(
            "{} found in multiple sources: {}. Using {} (highest priority).",
            name,
            sources.join(", "),
            sources[0]
        );
    }

    if let Some(value) = cli.or(env).or(toml) {
        info!("{} loaded from {}", name, sources[0]);
        return Some(value);
    }
    None
}

fn non_zero(value: Option<u32>, default: u32, field: &str) -> IngestResult<NonZeroU32> {
    let value = value.unwrap_or(default);
    NonZeroU32::new(value)
        .ok_or_else(|| IngestError::BadRequest(format!("{} must be greater than zero", field)))
}

fn optional_interval(section: &SourceSection) -> Option<Duration> {
    section
        .min_interval_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

/// Congress.gov source; an API key is required
pub fn congress_source(
    section: &SourceSection,
    overrides: &CredentialOverrides,
) -> IngestResult<SourceConfig> {
    let key = resolve_credential(
        "Congress.gov API key",
        overrides.congress_api_key.as_deref(),
        CONGRESS_API_KEY_ENV,
        section.api_key.as_deref(),
    )
    .ok_or_else(|| {
        IngestError::Common(legis_common::Error::Config(format!(
            "Congress.gov API key not configured. Please configure using one of:\n\
             1. Command line: --congress-api-key your-key\n\
             2. Environment: {}=your-key\n\
             3. TOML config: [sources.congress] api_key = \"your-key\"\n\
             \n\
             Obtain an API key at: https://api.congress.gov/sign-up/",
            CONGRESS_API_KEY_ENV
        )))
    })?;

    Ok(SourceConfig {
        source: SourceId::Congress,
        base_url: trim_base_url(section.base_url.as_deref().unwrap_or(CONGRESS_BASE_URL)),
        auth: AuthMode::ApiKeyQuery(key),
        rate_limit: non_zero(section.rate_limit, CONGRESS_RATE_LIMIT, "sources.congress.rate_limit")?,
        window: Duration::from_secs(section.window_secs.unwrap_or(CONGRESS_WINDOW_SECS).max(1)),
        min_interval: optional_interval(section),
        pagination: PaginationStyle::NextUrl,
        page_size: section.page_size.unwrap_or(CONGRESS_PAGE_SIZE).max(1),
        timeout: Duration::from_secs(section.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
    })
}

/// Senate LDA source; token, basic or anonymous
///
/// Anonymous mode runs under the lower anonymous ceiling.
pub fn lda_source(
    section: &SourceSection,
    overrides: &CredentialOverrides,
) -> IngestResult<SourceConfig> {
    let key = resolve_credential(
        "LDA API key",
        overrides.lda_api_key.as_deref(),
        LDA_API_KEY_ENV,
        section.api_key.as_deref(),
    );
    let username = resolve_credential(
        "LDA username",
        overrides.lda_username.as_deref(),
        LDA_USERNAME_ENV,
        section.username.as_deref(),
    );
    let password = resolve_credential(
        "LDA password",
        overrides.lda_password.as_deref(),
        LDA_PASSWORD_ENV,
        section.password.as_deref(),
    );

    let auth = match (key, username, password) {
        (Some(key), _, _) => AuthMode::Token(key),
        (None, Some(username), Some(password)) => AuthMode::Basic { username, password },
        (None, Some(_), None) | (None, None, Some(_)) => {
            warn!("LDA username and password must both be set; falling back to anonymous access");
            AuthMode::Anonymous
        }
        (None, None, None) => AuthMode::Anonymous,
    };

    let rate_limit = if auth.is_anonymous() {
        info!("LDA credentials not configured, using anonymous rate limit");
        non_zero(
            section.anonymous_rate_limit,
            LDA_ANONYMOUS_RATE_LIMIT,
            "sources.lda.anonymous_rate_limit",
        )?
    } else {
        non_zero(section.rate_limit, LDA_RATE_LIMIT, "sources.lda.rate_limit")?
    };

    Ok(SourceConfig {
        source: SourceId::Lda,
        base_url: trim_base_url(section.base_url.as_deref().unwrap_or(LDA_BASE_URL)),
        auth,
        rate_limit,
        window: Duration::from_secs(section.window_secs.unwrap_or(LDA_WINDOW_SECS).max(1)),
        min_interval: optional_interval(section),
        pagination: PaginationStyle::PageNumber,
        page_size: section.page_size.unwrap_or(LDA_PAGE_SIZE).max(1),
        timeout: Duration::from_secs(section.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS)),
    })
}

/// Source configuration for `source`, resolved from TOML plus overrides
pub fn source_config(
    source: SourceId,
    toml: &TomlConfig,
    overrides: &CredentialOverrides,
) -> IngestResult<SourceConfig> {
    match source {
        SourceId::Congress => congress_source(&toml.sources.congress, overrides),
        SourceId::Lda => lda_source(&toml.sources.lda, overrides),
    }
}

fn trim_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
