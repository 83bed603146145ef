use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DATASET_URL: &str =
    "https://raw.githubusercontent.com/WFCD/warframe-items/master/data/json/All.json";
pub const DEFAULT_WIKI_URL: &str = "https://warframe.fandom.com/wiki";
pub const DEFAULT_USER_AGENT: &str = "frametrack/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_BIND: &str = "127.0.0.1:5000";

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct TrackerConfig {
    #[serde(default)]
    pub source: SourceSection,
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SourceSection {
    pub dataset_url: Option<String>,
    pub wiki_url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ServerSection {
    pub bind: Option<String>,
}

impl TrackerConfig {
    /// Resolve the data set URL: env FRAMETRACK_DATASET_URL > config > default.
    pub fn dataset_url(&self) -> String {
        resolve_string(
            "FRAMETRACK_DATASET_URL",
            self.source.dataset_url.as_deref(),
            DEFAULT_DATASET_URL,
        )
    }

    /// Resolve the wiki article base: env FRAMETRACK_WIKI_URL > config > default.
    pub fn wiki_url(&self) -> String {
        resolve_string(
            "FRAMETRACK_WIKI_URL",
            self.source.wiki_url.as_deref(),
            DEFAULT_WIKI_URL,
        )
    }

    pub fn user_agent(&self) -> String {
        resolve_string(
            "FRAMETRACK_USER_AGENT",
            self.source.user_agent.as_deref(),
            DEFAULT_USER_AGENT,
        )
    }

    pub fn timeout_ms(&self) -> u64 {
        env::var("FRAMETRACK_HTTP_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.trim().parse::<u64>().ok())
            .or(self.source.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS)
    }

    pub fn bind(&self) -> String {
        resolve_string("FRAMETRACK_BIND", self.server.bind.as_deref(), DEFAULT_BIND)
    }
}

fn resolve_string(env_key: &str, configured: Option<&str>, default: &str) -> String {
    if let Ok(value) = env::var(env_key) {
        let trimmed = value.trim().to_string();
        if !trimmed.is_empty() {
            return trimmed;
        }
    }
    configured
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(default)
        .to_string()
}

/// Load and parse a TrackerConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<TrackerConfig> {
    if !config_path.exists() {
        return Ok(TrackerConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: TrackerConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

pub fn render_default_config() -> String {
    format!(
        "# frametrack configuration (materialized by `frametrack init`)\n# Environment variables FRAMETRACK_* take precedence over these values.\n\n[source]\n# dataset_url = \"{DEFAULT_DATASET_URL}\"\n# wiki_url = \"{DEFAULT_WIKI_URL}\"\n# user_agent = \"{DEFAULT_USER_AGENT}\"\n# timeout_ms = {DEFAULT_TIMEOUT_MS}\n\n[server]\n# bind = \"{DEFAULT_BIND}\"\n"
    )
}
