use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HyperError, Result};

pub const DEFAULT_PORT: u16 = 50001;
pub const DEFAULT_MAXSIZE: usize = 10_000;

/// Sentinel key that the server accepts only with a loud warning.
pub const BADKEY: &str = "--BADKEY--";

/// Environment variables whose names begin with this prefix are exposed to
/// tasks with the prefix stripped. `HYPERSHELL_EXE` and `HYPERSHELL_CWD`
/// are reserved for the client itself and never forwarded.
pub const EXPORT_PREFIX: &str = "HYPERSHELL_EXPORT_";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub authkey: String,
    pub maxsize: usize,
    pub max_attempts: u32,
    pub lease_ttl: Duration,
    pub drain_deadline: Duration,
    pub database: Option<String>,
    pub failure_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            authkey: BADKEY.to_string(),
            maxsize: DEFAULT_MAXSIZE,
            max_attempts: 1,
            lease_ttl: Duration::from_secs(300),
            drain_deadline: Duration::from_secs(30),
            database: None,
            failure_path: None,
            output_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub authkey: String,
    pub num_tasks: usize,
    pub template: String,
    pub capture: bool,
    pub timeout: Duration,
    pub output_path: Option<PathBuf>,
    pub errors_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            authkey: BADKEY.to_string(),
            num_tasks: 1,
            template: crate::template::DEFAULT_TEMPLATE.to_string(),
            capture: false,
            timeout: Duration::ZERO,
            output_path: None,
            errors_path: None,
        }
    }
}

/// How cluster mode launches its clients.
#[derive(Debug, Clone)]
pub enum Launcher {
    Local { num_clients: usize },
    Ssh { nodefile: PathBuf },
    Mpi { machinefile: PathBuf },
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub server: ServerConfig,
    pub launcher: Launcher,
    pub num_tasks: usize,
    pub template: String,
    pub capture: bool,
    pub stagger: Duration,
}

/// Persisted settings backing `hyper-shell config get/set`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: SettingsServer,
    #[serde(default)]
    pub client: SettingsClient,
    #[serde(default)]
    pub database: SettingsDatabase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsServer {
    pub host: String,
    pub port: u16,
    pub maxsize: usize,
}

impl Default for SettingsServer {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            maxsize: DEFAULT_MAXSIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsClient {
    pub num_tasks: usize,
    pub timeout_secs: u64,
}

impl Default for SettingsClient {
    fn default() -> Self {
        Self {
            num_tasks: 1,
            timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsDatabase {
    pub path: String,
}

impl Default for SettingsDatabase {
    fn default() -> Self {
        Self {
            path: "hypershell.db".to_string(),
        }
    }
}

/// Path of the settings file: `HYPERSHELL_CONFIG` if set, else
/// `$HOME/.hypershell/config.json`.
pub fn settings_path() -> PathBuf {
    if let Ok(path) = std::env::var("HYPERSHELL_CONFIG") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".hypershell").join("config.json")
}

pub fn load_settings() -> Result<Settings> {
    let path = settings_path();
    match std::fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text)
            .map_err(|err| HyperError::Parse(format!("{}: {err}", path.display()))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
        Err(err) => Err(err.into()),
    }
}

pub fn store_settings(settings: &Settings) -> Result<()> {
    let path = settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = serde_json::to_string_pretty(settings)
        .map_err(|err| HyperError::Fatal(format!("cannot serialize settings: {err}")))?;
    std::fs::write(&path, text)?;
    Ok(())
}

/// Look up a dotted key (e.g. `server.port`) in the settings.
pub fn settings_get(settings: &Settings, key: &str) -> Result<String> {
    let value = serde_json::to_value(settings)
        .map_err(|err| HyperError::Fatal(format!("cannot inspect settings: {err}")))?;
    let mut node = &value;
    for part in key.split('.') {
        node = node
            .get(part)
            .ok_or_else(|| HyperError::Parse(format!("unknown configuration key '{key}'")))?;
    }
    Ok(match node {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    })
}

/// Set a dotted key. The value must parse into the field's existing type.
pub fn settings_set(settings: &mut Settings, key: &str, raw: &str) -> Result<()> {
    let mut value = serde_json::to_value(&*settings)
        .map_err(|err| HyperError::Fatal(format!("cannot inspect settings: {err}")))?;
    {
        let mut node = &mut value;
        for part in key.split('.') {
            node = node
                .get_mut(part)
                .ok_or_else(|| HyperError::Parse(format!("unknown configuration key '{key}'")))?;
        }
        let replacement = match &*node {
            serde_json::Value::String(_) => serde_json::Value::String(raw.to_string()),
            _ => serde_json::from_str(raw)
                .map_err(|_| HyperError::Parse(format!("bad value '{raw}' for key '{key}'")))?,
        };
        *node = replacement;
    }
    *settings = serde_json::from_value(value)
        .map_err(|_| HyperError::Parse(format!("bad value '{raw}' for key '{key}'")))?;
    Ok(())
}

/// Collect `HYPERSHELL_EXPORT_*` variables with the prefix stripped.
/// `HYPERSHELL_EXE` and `HYPERSHELL_CWD` lack the prefix and so never leak.
pub fn load_task_env() -> BTreeMap<String, String> {
    std::env::vars()
        .filter_map(|(name, value)| {
            let stripped = name.strip_prefix(EXPORT_PREFIX)?;
            Some((stripped.to_string(), value))
        })
        .collect()
}

/// System hostname, or "localhost" if it cannot be determined.
pub fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("HOST"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Path of this binary for launching remote/local clients:
/// `HYPERSHELL_EXE` if set, else the current executable, else `hyper-shell`
/// found on PATH.
pub fn executable() -> String {
    if let Ok(exe) = std::env::var("HYPERSHELL_EXE") {
        return exe;
    }
    std::env::current_exe()
        .ok()
        .and_then(|path| path.to_str().map(str::to_string))
        .unwrap_or_else(|| "hyper-shell".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_roundtrip_json() {
        let settings = Settings::default();
        let text = serde_json::to_string(&settings).unwrap();
        let parsed: Settings = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed.server.port, DEFAULT_PORT);
        assert_eq!(parsed.server.maxsize, DEFAULT_MAXSIZE);
        assert_eq!(parsed.client.num_tasks, 1);
    }

    #[test]
    fn partial_settings_fill_defaults() {
        let parsed: Settings = serde_json::from_str(r#"{"server": {"port": 9000}}"#).unwrap();
        assert_eq!(parsed.server.port, 9000);
        assert_eq!(parsed.server.host, "localhost");
        assert_eq!(parsed.database.path, "hypershell.db");
    }

    #[test]
    fn dotted_get_and_set() {
        let mut settings = Settings::default();
        assert_eq!(
            settings_get(&settings, "server.port").unwrap(),
            DEFAULT_PORT.to_string()
        );
        settings_set(&mut settings, "server.port", "9000").unwrap();
        assert_eq!(settings.server.port, 9000);
        settings_set(&mut settings, "database.path", "/tmp/t.db").unwrap();
        assert_eq!(settings.database.path, "/tmp/t.db");

        assert!(settings_get(&settings, "server.bogus").is_err());
        assert!(settings_set(&mut settings, "server.port", "not-a-number").is_err());
    }
}
