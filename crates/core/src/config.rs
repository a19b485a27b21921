use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;

/// Top-level configuration for the audio extractor.
///
/// Every field has a usable default so an empty config file (or none at all)
/// yields a working setup. Loaded from JSON; unknown fields are ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractorConfig {
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub preload: PreloadConfig,
    #[serde(default)]
    pub adskip: AdSkipConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Requests whose destination matches one of these domains (or any
    /// subdomain) are aborted at the network layer before they load.
    #[serde(default = "default_ad_domains")]
    pub ad_domains: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            browser: BrowserConfig::default(),
            preload: PreloadConfig::default(),
            adskip: AdSkipConfig::default(),
            timeouts: TimeoutConfig::default(),
            ad_domains: default_ad_domains(),
        }
    }
}

impl ExtractorConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&content)?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserConfig {
    /// Explicit browser binary path. Auto-discovered when unset.
    #[serde(default)]
    pub binary: Option<String>,
    /// Profile directory. A per-user data dir is derived when unset.
    #[serde(default)]
    pub user_data_dir: Option<String>,
    /// Launch a visible window instead of headless (debugging aid).
    #[serde(default)]
    pub headed: bool,
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            binary: None,
            user_data_dir: None,
            headed: false,
            launch_timeout_secs: default_launch_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreloadConfig {
    /// Maximum number of speculatively primed pages held at once.
    #[serde(default = "default_max_preload_count")]
    pub max_count: usize,
    /// A cached entry older than this is discarded on next access.
    #[serde(default = "default_max_preload_age_secs")]
    pub max_age_secs: u64,
    /// Bound on the priming procedure (leading ads playing out while
    /// auto-skipped, until true content start is confirmed).
    #[serde(default = "default_prime_timeout_secs")]
    pub prime_timeout_secs: u64,
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            max_count: default_max_preload_count(),
            max_age_secs: default_max_preload_age_secs(),
            prime_timeout_secs: default_prime_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdSkipConfig {
    /// Interval between in-page ad checks.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for AdSkipConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutConfig {
    /// Bound on a page reaching its load event.
    #[serde(default = "default_navigation_timeout_secs")]
    pub navigation_secs: u64,
    /// Bound on waiting for a selector / media element to render.
    #[serde(default = "default_selector_timeout_secs")]
    pub selector_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            navigation_secs: default_navigation_timeout_secs(),
            selector_secs: default_selector_timeout_secs(),
        }
    }
}

fn default_launch_timeout_secs() -> u64 {
    15
}

fn default_max_preload_count() -> usize {
    3
}

fn default_max_preload_age_secs() -> u64 {
    300
}

fn default_prime_timeout_secs() -> u64 {
    45
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_navigation_timeout_secs() -> u64 {
    20
}

fn default_selector_timeout_secs() -> u64 {
    10
}

fn default_ad_domains() -> Vec<String> {
    [
        "doubleclick.net",
        "googleadservices.com",
        "googlesyndication.com",
        "google-analytics.com",
        "adservice.google.com",
        "ads.youtube.com",
        "moatads.com",
        "2mdn.net",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ExtractorConfig::default();
        assert_eq!(config.preload.max_count, 3);
        assert_eq!(config.preload.max_age_secs, 300);
        assert_eq!(config.adskip.poll_interval_ms, 1000);
        assert!(!config.browser.headed);
        assert!(config.ad_domains.contains(&"doubleclick.net".to_string()));
    }

    #[test]
    fn empty_json_yields_defaults() {
        let config: ExtractorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.preload.max_count, 3);
        assert_eq!(config.timeouts.navigation_secs, 20);
        assert!(!config.ad_domains.is_empty());
    }

    #[test]
    fn partial_section_picks_up_field_defaults() {
        let config: ExtractorConfig =
            serde_json::from_str(r#"{"preload": {"maxCount": 5}}"#).unwrap();
        assert_eq!(config.preload.max_count, 5);
        assert_eq!(config.preload.max_age_secs, 300);
    }

    #[test]
    fn round_trips_through_json() {
        let config = ExtractorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ExtractorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.preload.max_count, config.preload.max_count);
        assert_eq!(back.ad_domains, config.ad_domains);
    }
}
