//! Persistent host settings (JSON file in the user data directory).

use std::fs;
use std::path::{Path, PathBuf};

use cadence_core::RuntimeConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct HostSettings {
    /// Simulated capture channels.
    pub channels: u32,
    /// How long the pipeline runs before teardown.
    pub run_ms: u64,
    /// Pace of the capture loop.
    pub frame_interval_ms: u64,
    /// Pause the last channel's capture for a quarter of the run.
    pub pause_last_channel: bool,
    pub runtime: RuntimeConfig,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            channels: 2,
            run_ms: 1_500,
            frame_interval_ms: 10,
            pause_last_channel: true,
            runtime: RuntimeConfig::default(),
        }
    }
}

impl HostSettings {
    pub fn normalize(&mut self) {
        self.channels = self.channels.clamp(1, 16);
        self.run_ms = self.run_ms.clamp(100, 600_000);
        self.frame_interval_ms = self.frame_interval_ms.clamp(1, 1_000);
        self.runtime.normalize();
        // Every stage plus the monitor and one spare per channel.
        let needed = self.channels as usize * 4 + 2;
        self.runtime.threads.max_workers = self.runtime.threads.max_workers.max(needed);
    }
}

/// Environment overrides win over the file, so one-off runs need no edit.
pub fn apply_env_overrides(settings: &mut HostSettings) {
    if let Some(v) = env_parse::<u32>("CADENCE_CHANNELS") {
        settings.channels = v;
    }
    if let Some(v) = env_parse::<u64>("CADENCE_RUN_MS") {
        settings.run_ms = v;
    }
    if let Some(v) = env_parse::<u64>("CADENCE_FRAME_INTERVAL_MS") {
        settings.frame_interval_ms = v;
    }
    if let Some(v) = env_parse::<u64>("CADENCE_MONITOR_INTERVAL_MS") {
        settings.runtime.monitor.interval_ms = v;
    }
    if let Ok(v) = std::env::var("CADENCE_FAIL_FAST") {
        settings.runtime.threads.fail_fast_on_order_violation = matches!(v.trim(), "1" | "true");
    }
    settings.normalize();
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Lattice Labs")
            .join("Cadence")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("cadence")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> HostSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<HostSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &HostSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let settings = load_settings(Path::new("/nonexistent/cadence/settings.json"));
        assert_eq!(settings.channels, 2);
        assert_eq!(settings.runtime.threads.lock_timeout_ms, 500);
    }

    #[test]
    fn partial_file_keeps_other_defaults_and_clamps() {
        let dir = std::env::temp_dir().join(format!("cadence-settings-{}", std::process::id()));
        let path = dir.join("settings.json");
        fs::create_dir_all(&dir).expect("dir");
        fs::write(
            &path,
            r#"{ "channels": 99, "runtime": { "cleanup": { "stepTimeoutMs": 750 } } }"#,
        )
        .expect("write");

        let settings = load_settings(&path);
        assert_eq!(settings.channels, 16);
        assert_eq!(settings.runtime.cleanup.step_timeout_ms, 750);
        assert_eq!(settings.run_ms, 1_500);
        assert!(settings.runtime.threads.max_workers >= 16 * 4 + 2);

        save_settings(&path, &settings).expect("save");
        let reloaded = load_settings(&path);
        assert_eq!(reloaded.channels, 16);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join(format!("cadence-bad-{}", std::process::id()));
        let path = dir.join("settings.json");
        fs::create_dir_all(&dir).expect("dir");
        fs::write(&path, "{ not json").expect("write");
        assert_eq!(load_settings(&path).run_ms, 1_500);
        let _ = fs::remove_dir_all(&dir);
    }
}
