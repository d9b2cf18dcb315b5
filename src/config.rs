use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Tunable gameplay settings loaded from game.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameSettings {
    /// First side to reach this score wins the game.
    #[serde(rename = "winScore", default = "default_win_score")]
    pub win_score: u32,
    /// Simulation tick interval; 16ms is the 60 Hz target.
    #[serde(rename = "tickIntervalMs", default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Paddle positions are clamped to [-extent, extent].
    #[serde(rename = "fieldHalfExtent", default = "default_field_half_extent")]
    pub field_half_extent: f64,
}

fn default_win_score() -> u32 {
    5
}

fn default_tick_interval_ms() -> u64 {
    16
}

fn default_field_half_extent() -> f64 {
    10.0
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            win_score: default_win_score(),
            tick_interval_ms: default_tick_interval_ms(),
            field_half_extent: default_field_half_extent(),
        }
    }
}

/// Resolves a path relative to the config directory.
fn config_path(sub: &str) -> PathBuf {
    let base = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    Path::new(&base).join(sub)
}

/// Initialize config directory with defaults if missing.
pub fn init() {
    let base = config_path("");
    if !base.exists() {
        fs::create_dir_all(&base).expect("Failed to create config directory");
    }

    let game_path = config_path("game.json");
    if !game_path.exists() {
        let defaults = GameSettings::default();
        fs::write(
            &game_path,
            serde_json::to_string_pretty(&defaults).expect("Failed to encode default settings"),
        )
        .expect("Failed to write default game.json");
    }
}

/// Load the gameplay settings.
pub fn load_settings() -> GameSettings {
    let path = config_path("game.json");
    let data = match fs::read_to_string(&path) {
        Ok(data) => data,
        Err(e) => {
            tracing::warn!("Failed to read {}: {}, using defaults", path.display(), e);
            return GameSettings::default();
        }
    };

    match serde_json::from_str(&data) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Failed to parse {}: {}, using defaults", path.display(), e);
            GameSettings::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_fall_back_to_defaults_per_field() {
        let settings: GameSettings = serde_json::from_str(r#"{"winScore": 7}"#).unwrap();
        assert_eq!(settings.win_score, 7);
        assert_eq!(settings.tick_interval_ms, 16);
        assert_eq!(settings.field_half_extent, 10.0);
    }
}
