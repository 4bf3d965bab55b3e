use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::normalize::Speaker;

const SETTINGS_FILE_NAME: &str = "settings.json";
const APP_DIR_NAME: &str = "consulta-transcribe";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Transcription endpoint receiving one multipart POST per flush.
    pub transcribe_url: String,

    /// Speaker role attached to every request and used for line prefixes.
    pub speaker: Speaker,

    /// Cadence at which the capture device delivers fragments.
    pub fragment_interval_ms: u64,

    /// When enabled, a partial identical to the previous one is not
    /// re-delivered to the host.
    pub suppress_duplicate_partials: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            transcribe_url: "http://127.0.0.1:8000/transcribir".to_string(),
            speaker: Speaker::Clinician,
            fragment_interval_ms: 500,
            suppress_duplicate_partials: false,
        }
    }
}

fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from the config file, falling back to defaults on any
/// failure. `TRANSCRIBE_URL` overrides the endpoint for development setups.
pub fn load_settings() -> AppSettings {
    let mut settings = match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    };

    if let Ok(url) = std::env::var("TRANSCRIBE_URL") {
        if !url.is_empty() {
            settings.transcribe_url = url;
        }
    }

    settings
}

fn load_settings_from(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

pub fn save_settings(settings: &AppSettings) -> Result<(), String> {
    let path = settings_path()?;
    save_settings_to(&path, settings)
}

fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: write to a temp file in the same directory, then
    // rename. This prevents a partial settings.json if the process dies
    // mid-write.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // On Unix, rename atomically replaces the destination. On Windows,
    // rename fails if the destination exists, so remove it first.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let settings = AppSettings::default();
        assert!(settings.transcribe_url.ends_with("/transcribir"));
        assert_eq!(settings.speaker, Speaker::Clinician);
        assert_eq!(settings.fragment_interval_ms, 500);
        assert!(!settings.suppress_duplicate_partials);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let mut settings = AppSettings::default();
        settings.transcribe_url = "http://example.test/transcribir".to_string();
        settings.speaker = Speaker::Patient;
        settings.suppress_duplicate_partials = true;

        save_settings_to(&path, &settings).unwrap();
        let loaded = load_settings_from(&path);

        assert_eq!(loaded.transcribe_url, settings.transcribe_url);
        assert_eq!(loaded.speaker, Speaker::Patient);
        assert!(loaded.suppress_duplicate_partials);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_settings_from(&dir.path().join("nope.json"));
        assert_eq!(loaded.fragment_interval_ms, 500);
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();

        let loaded = load_settings_from(&path);
        assert_eq!(loaded.speaker, Speaker::Clinician);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"speaker": "patient"}"#).unwrap();

        let loaded = load_settings_from(&path);
        assert_eq!(loaded.speaker, Speaker::Patient);
        assert_eq!(loaded.fragment_interval_ms, 500);
    }
}
