use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::EngineConfig;
use crate::logger;

/// User settings, stored as `settings.json` next to the scenarios directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub last_scenario: Option<String>,
    pub tick_interval_ms: u64,
    pub bitmap_cache_bytes: usize,
    /// Write a JSON session report to `logs/` when a run ends.
    pub debug_report: bool,
    pub observe_all_conditions: bool,
    pub unblock_workaround: bool,
    pub allow_negative_counters: bool,
    /// Fixed gesture randomization seed. Unset seeds from the clock.
    pub random_seed: Option<u64>,
    pub debug_channel_capacity: usize,
    /// Title or owner regex of the window to capture. Empty captures the main display.
    pub window_pattern: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            last_scenario: None,
            tick_interval_ms: 50,
            bitmap_cache_bytes: 64 * 1024 * 1024,
            debug_report: false,
            observe_all_conditions: false,
            unblock_workaround: false,
            allow_negative_counters: false,
            random_seed: None,
            debug_channel_capacity: 1024,
            window_pattern: String::new(),
        }
    }
}

impl Settings {
    /// Read settings, falling back to defaults when missing or malformed.
    pub fn load(path: &Path) -> Self {
        let Ok(text) = std::fs::read_to_string(path) else { return Self::default() };
        match serde_json::from_str(&text) {
            Ok(settings) => settings,
            Err(e) => {
                logger::warn(&format!("ignoring {}: {}", path.display(), e));
                Self::default()
            }
        }
    }

    pub fn save(&self, path: &Path) {
        if let Ok(json) = serde_json::to_string_pretty(self) {
            if let Err(e) = std::fs::write(path, json) {
                logger::warn(&format!("cannot save {}: {}", path.display(), e));
            }
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            bitmap_cache_bytes: self.bitmap_cache_bytes,
            observe_all_conditions: self.observe_all_conditions,
            unblock_workaround: self.unblock_workaround,
            allow_negative_counters: self.allow_negative_counters,
            random_seed: self.random_seed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_and_partial_files_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        assert_eq!(Settings::load(&path), Settings::default());

        std::fs::write(&path, r#"{"tick_interval_ms": 200, "random_seed": 7}"#).unwrap();
        let s = Settings::load(&path);
        assert_eq!(s.tick_interval_ms, 200);
        assert_eq!(s.random_seed, Some(7));
        assert_eq!(s.debug_channel_capacity, 1024);

        std::fs::write(&path, "not json").unwrap();
        assert_eq!(Settings::load(&path), Settings::default());
    }

    #[test]
    fn save_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let s = Settings { last_scenario: Some("farm".into()), debug_report: true, ..Settings::default() };
        s.save(&path);
        assert_eq!(Settings::load(&path), s);
        assert_eq!(s.engine_config().tick_interval, Duration::from_millis(50));
    }
}
