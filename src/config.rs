//! Configuration loading for roamlink.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::ServerAddr;

/// Get the roamlink home directory (~/.roamlink).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".roamlink"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from `path`, or from ~/.roamlink/settings.json.
///
/// A missing default file yields defaults; a missing explicit file is an error.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let (path, explicit) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (get_settings_path()?, false),
    };

    if !path.exists() {
        if explicit {
            return Err(Error::Config(format!(
                "Settings file not found at {}",
                path.display()
            )));
        }
        tracing::debug!("No settings at {}, using defaults", path.display());
        return Ok(Settings::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    validate_settings(settings)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.agent.name.trim().is_empty() {
        return Err(Error::Config("agent.name must not be empty".to_string()));
    }
    if settings.server.port == 0 {
        return Err(Error::Config("server.port must not be 0".to_string()));
    }
    if let Some(dest) = &settings.travel.destination {
        if dest.port == 0 || dest.host.trim().is_empty() {
            return Err(Error::Config(format!("travel.destination '{}' is invalid", dest)));
        }
    }
    if settings.travel.connect_timeout_ms == 0 {
        return Err(Error::Config("travel.connect_timeout_ms must be positive".to_string()));
    }
    if settings.decision.timeout_ms == 0 {
        return Err(Error::Config("decision.timeout_ms must be positive".to_string()));
    }
    if !(0.0..=1.0).contains(&settings.decision.min_confidence) {
        return Err(Error::Config("decision.min_confidence must be within 0..=1".to_string()));
    }
    match settings.decision.backend.as_str() {
        "none" | "keywords" | "llm" => {}
        other => {
            return Err(Error::Config(format!(
                "decision.backend '{}' is not one of none, keywords, llm",
                other
            )))
        }
    }
    if settings.agent.broadcast_every_ms == Some(0) || settings.agent.reputation_every_ms == Some(0) {
        return Err(Error::Config("send periods must be positive".to_string()));
    }
    if settings.dashboard.enabled && settings.dashboard.port == 0 {
        return Err(Error::Config("dashboard.port must not be 0".to_string()));
    }
    Ok(())
}

/// Agent identity and receive policy.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct AgentSettings {
    #[serde(default = "default_agent_name")]
    pub name: String,
    /// Sender id prefixes accepted by the receive hooks; empty allows all.
    #[serde(default)]
    pub allowed_prefixes: Vec<String>,
    /// Start in listen mode: only act on the travel command until travelled.
    #[serde(default)]
    pub listen: bool,
    /// Outside goal handed to decision policies.
    #[serde(default)]
    pub goal: Option<String>,
    /// Greet back new peers and tell them about state changes.
    #[serde(default = "default_status_replies")]
    pub status_replies: bool,
    /// Period of the clock broadcast; off when unset.
    #[serde(default)]
    pub broadcast_every_ms: Option<u64>,
    /// Period of the good/bad notes to classified peers; off when unset.
    #[serde(default)]
    pub reputation_every_ms: Option<u64>,
}

fn default_status_replies() -> bool {
    true
}

fn default_agent_name() -> String {
    "agent".to_string()
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            allowed_prefixes: Vec::new(),
            listen: false,
            goal: None,
            status_replies: default_status_replies(),
            broadcast_every_ms: None,
            reputation_every_ms: None,
        }
    }
}

/// Home server: where `agent` connects and where `serve` listens.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ServerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Name a relay announces in its welcome.
    #[serde(default = "default_server_name")]
    pub name: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7460
}

fn default_server_name() -> String {
    "roamlink".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            name: default_server_name(),
        }
    }
}

impl ServerSettings {
    pub fn addr(&self) -> ServerAddr {
        ServerAddr::new(self.host.clone(), self.port)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TravelSettings {
    /// Where the travel command takes the agent.
    #[serde(default)]
    pub destination: Option<ServerAddr>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

impl Default for TravelSettings {
    fn default() -> Self {
        Self {
            destination: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl TravelSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Decision hook backend.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DecisionSettings {
    /// `none` (every table move commits), `keywords` or `llm`.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// LLM provider: `ollama` or `openai`.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_decision_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub min_confidence: f32,
    /// Ask the LLM for good/bad/neutral classifications too.
    #[serde(default)]
    pub classify: bool,
    #[serde(default = "default_cache")]
    pub cache: bool,
}

fn default_backend() -> String {
    "none".to_string()
}

fn default_provider() -> String {
    "ollama".to_string()
}

fn default_decision_timeout_ms() -> u64 {
    3000
}

fn default_cache() -> bool {
    true
}

impl Default for DecisionSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            provider: default_provider(),
            model: None,
            base_url: None,
            timeout_ms: default_decision_timeout_ms(),
            min_confidence: 0.0,
            classify: false,
            cache: default_cache(),
        }
    }
}

impl DecisionSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Flow graph JSON endpoints.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DashboardSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
}

fn default_dashboard_port() -> u16 {
    3333
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_dashboard_port(),
        }
    }
}

/// roamlink settings.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Settings {
    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub travel: TravelSettings,

    #[serde(default)]
    pub decision: DecisionSettings,

    #[serde(default)]
    pub dashboard: DashboardSettings,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_gets_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"agent": {"name": "Scout_1", "allowed_prefixes": ["Scout_"]},
                "travel": {"destination": {"host": "10.0.0.2", "port": 7461}}}"#,
        )
        .unwrap();

        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.agent.name, "Scout_1");
        assert_eq!(settings.server.port, 7460);
        assert_eq!(settings.travel.destination.as_ref().unwrap().to_string(), "10.0.0.2:7461");
        assert_eq!(settings.decision.backend, "none");
        assert_eq!(settings.agent.broadcast_every_ms, None);
        assert_eq!(settings.travel.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let err = load_settings(Some(&dir.path().join("nope.json"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validation() {
        let mut settings = Settings::default();
        assert!(validate_settings(&settings).is_ok());

        settings.agent.name = " ".to_string();
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.decision.backend = "oracle".to_string();
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.travel.connect_timeout_ms = 0;
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.travel.destination = Some(ServerAddr::new("", 1));
        assert!(validate_settings(&settings).is_err());

        let mut settings = Settings::default();
        settings.agent.reputation_every_ms = Some(0);
        assert!(validate_settings(&settings).is_err());
        settings.agent.reputation_every_ms = Some(3000);
        assert!(validate_settings(&settings).is_ok());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = Settings::default();
        settings.dashboard.enabled = true;
        settings.agent.listen = true;
        save_settings(&path, &settings).unwrap();

        let loaded = load_settings(Some(&path)).unwrap();
        assert!(loaded.dashboard.enabled);
        assert!(loaded.agent.listen);
    }
}
