use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backend::ssh::SshOptions;
use crate::coalescer::CoalesceSettings;
use crate::coordinator::CoordinatorSettings;
use crate::model::ConnectionSettings;

pub const CONFIG_ENV: &str = "RUSTY_CONFIG";
const CONFIG_FILE: &str = "config.toml";

fn default_coalesce_threshold() -> usize {
    crate::coalescer::DEFAULT_THRESHOLD
}

fn default_coalesce_delay_ms() -> u64 {
    20
}

fn default_scan_line_limit() -> usize {
    crate::path_inference::DEFAULT_SCAN_LINES
}

fn default_router_buffer_limit() -> usize {
    crate::router::DEFAULT_BUFFER_LIMIT
}

fn default_scrollback_lines() -> usize {
    5000
}

fn default_keepalive_secs() -> u64 {
    20
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TuningConfig {
    #[serde(default = "default_coalesce_threshold")]
    pub coalesce_threshold: usize,
    #[serde(default = "default_coalesce_delay_ms")]
    pub coalesce_delay_ms: u64,
    #[serde(default = "default_scan_line_limit")]
    pub scan_line_limit: usize,
    #[serde(default = "default_router_buffer_limit")]
    pub router_buffer_limit: usize,
    #[serde(default = "default_scrollback_lines")]
    pub scrollback_lines: usize,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            coalesce_threshold: default_coalesce_threshold(),
            coalesce_delay_ms: default_coalesce_delay_ms(),
            scan_line_limit: default_scan_line_limit(),
            router_buffer_limit: default_router_buffer_limit(),
            scrollback_lines: default_scrollback_lines(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub name: String,
    #[serde(default)]
    pub remember_password: bool,
    #[serde(default)]
    pub remember_key_passphrase: bool,
    pub settings: ConnectionSettings,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub default_profile: Option<String>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub profiles: Vec<ConnectionProfile>,
}

impl AppConfig {
    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            coalesce: CoalesceSettings {
                threshold: self.tuning.coalesce_threshold.max(1),
                delay: Duration::from_millis(self.tuning.coalesce_delay_ms),
            },
            scan_line_limit: self.tuning.scan_line_limit.max(1),
            router_buffer_limit: self.tuning.router_buffer_limit.max(1),
        }
    }

    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            keepalive_interval: Duration::from_secs(self.tuning.keepalive_secs.max(1)),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .or_else(|| config_dir().map(|d| d.join("logs")))
            .unwrap_or_else(|| PathBuf::from("logs"))
    }

    pub fn profile(&self, name: &str) -> Option<&ConnectionProfile> {
        find_profile_index(self, name).map(|i| &self.profiles[i])
    }

    pub fn default_profile(&self) -> Option<&ConnectionProfile> {
        self.default_profile
            .as_deref()
            .and_then(|name| self.profile(name))
    }
}

fn config_dir() -> Option<PathBuf> {
    // Example: %APPDATA%\Rusty or ~/.config/rusty
    if let Some(appdata) = std::env::var_os("APPDATA") {
        return Some(PathBuf::from(appdata).join("Rusty"));
    }
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("rusty"));
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config").join("rusty"))
}

pub fn config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_ENV) {
        return PathBuf::from(path);
    }
    config_dir()
        .map(|dir| dir.join(CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
}

pub fn load() -> AppConfig {
    load_from(&config_path())
}

/// Missing or unreadable files yield defaults. `.json` files are accepted for
/// configs written by older builds.
pub fn load_from(path: &Path) -> AppConfig {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => {
            tracing::debug!(path = %path.display(), "no config loaded: {err}");
            return AppConfig::default();
        }
    };
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
    let parsed = if is_json {
        serde_json::from_str::<AppConfig>(&text).map_err(anyhow::Error::from)
    } else {
        toml::from_str::<AppConfig>(&text).map_err(anyhow::Error::from)
    };
    match parsed {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::warn!(path = %path.display(), "invalid config, using defaults: {err}");
            AppConfig::default()
        }
    }
}

/// Secrets are stripped unless the profile asks to remember them.
pub fn save_to(cfg: &AppConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Unable to create {}", parent.display()))?;
    }

    let mut cfg = cfg.clone();
    for profile in &mut cfg.profiles {
        profile.settings = write_profile_settings(profile);
    }
    let text = toml::to_string_pretty(&cfg).context("Unable to serialize config")?;

    // Atomic write: a crash never leaves a half-written config behind.
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, text).with_context(|| format!("Unable to write {}", tmp.display()))?;
    if let Err(err) = fs::rename(&tmp, path) {
        // Rename can fail across devices; fall back to a plain copy.
        let copied = fs::copy(&tmp, path).map(|_| ());
        let _ = fs::remove_file(&tmp);
        copied.with_context(|| format!("Unable to replace {} ({err})", path.display()))?;
    }
    Ok(())
}

pub fn find_profile_index(cfg: &AppConfig, name: &str) -> Option<usize> {
    cfg.profiles
        .iter()
        .position(|p| p.name.eq_ignore_ascii_case(name.trim()))
}

pub fn profile_display_name(p: &ConnectionProfile, cfg: &AppConfig) -> String {
    let mut s = format!("{} ({})", p.name, p.settings.display_target());
    if cfg
        .default_profile
        .as_deref()
        .map(|d| d.eq_ignore_ascii_case(&p.name))
        .unwrap_or(false)
    {
        s.push_str(" [default]");
    }
    s
}

pub fn write_profile_settings(profile: &ConnectionProfile) -> ConnectionSettings {
    let mut s = profile.settings.clone();
    if !profile.remember_password {
        s.password.clear();
    }
    if !profile.remember_key_passphrase {
        s.key_passphrase.clear();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str, remember_password: bool) -> ConnectionProfile {
        ConnectionProfile {
            name: name.to_string(),
            settings: ConnectionSettings {
                host: "10.0.0.5".into(),
                username: "deploy".into(),
                password: "s3cret".into(),
                ..Default::default()
            },
            remember_password,
            remember_key_passphrase: false,
        }
    }

    #[test]
    fn missing_and_partial_files_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_from(&dir.path().join("absent.toml"));
        assert!(cfg.profiles.is_empty());
        assert_eq!(cfg.tuning, TuningConfig::default());

        let path = dir.path().join("partial.toml");
        fs::write(&path, "[tuning]\ncoalesce_threshold = 64\n").unwrap();
        let cfg = load_from(&path);
        assert_eq!(cfg.tuning.coalesce_threshold, 64);
        assert_eq!(cfg.tuning.coalesce_delay_ms, 20);
        assert_eq!(cfg.coordinator_settings().coalesce.threshold, 64);
    }

    #[test]
    fn invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "profiles = 7 = 8").unwrap();
        assert!(load_from(&path).profiles.is_empty());
    }

    #[test]
    fn save_strips_unremembered_secrets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let cfg = AppConfig {
            profiles: vec![profile("web", false), profile("db", true)],
            default_profile: Some("db".into()),
            ..Default::default()
        };
        save_to(&cfg, &path).unwrap();
        assert!(!path.with_extension("toml.tmp").exists());

        let back = load_from(&path);
        assert_eq!(back.profiles.len(), 2);
        assert!(back.profile("WEB").unwrap().settings.password.is_empty());
        assert_eq!(back.default_profile().unwrap().settings.password, "s3cret");
    }

    #[test]
    fn json_configs_are_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(
            &path,
            r#"{"profiles":[{"name":"lab","settings":{"host":"lab","port":2222,"username":"me","password":""}}]}"#,
        )
        .unwrap();
        let cfg = load_from(&path);
        assert_eq!(cfg.profiles[0].settings.port, 2222);
        assert_eq!(cfg.tuning.scan_line_limit, DEFAULT_SCAN);
    }

    const DEFAULT_SCAN: usize = crate::path_inference::DEFAULT_SCAN_LINES;
}
