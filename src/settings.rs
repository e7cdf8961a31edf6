use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::config::{ConversationMode, SessionConfig};
use crate::persona;

const SETTINGS_DIR_NAME: &str = "parla-live";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Persona selected for the next session.
    pub persona_id: String,

    /// 0 = standard pronunciation, 100 = strongest regional accent.
    pub accent_intensity: u8,

    pub mode: ConversationMode,

    /// Free-text study notes woven into the persona prompt at connect time.
    pub notes: Vec<String>,

    /// Live API model override (default model when unset).
    pub live_model: Option<String>,

    /// Language finished lines are translated into. Empty disables translation.
    pub translation_language: String,

    /// Named input/output devices; system defaults when unset.
    pub input_device: Option<String>,
    pub output_device: Option<String>,

    /// Begin each session with the microphone muted.
    pub start_muted: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            persona_id: persona::default_persona().id.to_string(),
            accent_intensity: 50,
            mode: ConversationMode::default(),
            notes: Vec::new(),
            live_model: None,
            translation_language: "English".to_string(),
            input_device: None,
            output_device: None,
            start_muted: false,
        }
    }
}

impl AppSettings {
    /// Snapshot the settings into a per-connection config
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::from_persona_id(&self.persona_id)
            .with_accent_intensity(self.accent_intensity)
            .with_mode(self.mode)
            .with_notes(self.notes.clone())
    }
}

pub fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> AppSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> AppSettings {
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
    save_settings_to(&settings_path()?, settings)
}

pub fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists.
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
