use std::time::Duration;

use eyre::{eyre, Result};

use crate::retry::RetryPolicy;
use crate::walker::WalkerConfig;

/// Validated runtime configuration for crawl/search runs.
#[derive(Debug, Clone)]
pub struct CrawlConfig {
    /// Base URL for platform API calls.
    pub api_base: String,
    /// Host used when synthesizing note URLs.
    pub explore_host: String,
    pub proxy: Option<String>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub walker: WalkerConfig,
    pub include_comments: bool,
    /// Demote short completed notes on reload so they get re-walked.
    pub recheck_incomplete: bool,
}

impl CrawlConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn from_cli(
        api_base: String,
        explore_host: String,
        proxy: Option<String>,
        timeout_seconds: u64,
        per_credential_attempts: u32,
        max_wait_rounds: u32,
        cooldown_wait_seconds: u64,
        short_backoff_ms: u64,
        top_page_delay_ms: u64,
        sub_page_delay_ms: u64,
        max_level: u32,
        include_comments: bool,
        recheck_incomplete: bool,
    ) -> Result<Self> {
        if !api_base.starts_with("http://") && !api_base.starts_with("https://") {
            return Err(eyre!("api base '{api_base}' must be an http(s) url"));
        }
        let explore_host = explore_host.trim_matches('/').to_string();
        if explore_host.is_empty() || explore_host.contains("://") {
            return Err(eyre!("explore host must be a bare hostname"));
        }
        if per_credential_attempts == 0 {
            return Err(eyre!("per-credential attempts must be > 0"));
        }
        if max_level == 0 {
            return Err(eyre!("max reply level must be > 0"));
        }
        if max_level > 10 {
            tracing::warn!(max_level, "reply trees deeper than 10 levels are unheard of");
        }

        Ok(Self {
            api_base: api_base.trim_end_matches('/').to_string(),
            explore_host,
            proxy,
            request_timeout: Duration::from_secs(timeout_seconds.max(5)),
            retry: RetryPolicy {
                per_credential_attempts,
                max_wait_rounds,
                cooldown_wait: Duration::from_secs(cooldown_wait_seconds.max(1)),
                short_backoff: Duration::from_millis(short_backoff_ms.max(50)),
            },
            walker: WalkerConfig {
                max_level,
                top_page_delay: Duration::from_millis(top_page_delay_ms),
                sub_page_delay: Duration::from_millis(sub_page_delay_ms),
            },
            include_comments,
            recheck_incomplete,
        })
    }
}
