//! Per-connection session configuration
//!
//! A `SessionConfig` is frozen for the life of one connection. Changing
//! persona, voice or accent intensity forces a teardown and a fresh
//! connection; mode and notes are picked up by the next connection.

use serde::{Deserialize, Serialize};

use crate::persona::{self, Persona};

/// Highest accepted accent intensity
pub const MAX_ACCENT_INTENSITY: u8 = 100;

/// How the assistant should steer the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConversationMode {
    /// Open conversation, corrections only when meaning is lost
    #[default]
    FreeTalk,
    /// Tutor-style: gently correct mistakes and recap new words
    Lesson,
    /// Stay in character inside an everyday scene
    Roleplay,
}

impl ConversationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationMode::FreeTalk => "free-talk",
            ConversationMode::Lesson => "lesson",
            ConversationMode::Roleplay => "roleplay",
        }
    }

    /// Parse the CLI/settings spelling of a mode
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "free-talk" | "freetalk" | "free" => Some(ConversationMode::FreeTalk),
            "lesson" => Some(ConversationMode::Lesson),
            "roleplay" | "role-play" => Some(ConversationMode::Roleplay),
            _ => None,
        }
    }
}

/// Everything the remote session needs to know at connect time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    pub persona_id: String,
    pub voice_id: String,
    /// 0 = standard pronunciation, 100 = strongest regional accent
    pub accent_intensity: u8,
    pub mode: ConversationMode,
    /// Snapshot of the user's study notes, injected into the prompt
    pub notes: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::for_persona(persona::default_persona())
    }
}

impl SessionConfig {
    /// Build a config using the persona's own voice and a medium accent
    pub fn for_persona(persona: &Persona) -> Self {
        Self {
            persona_id: persona.id.to_string(),
            voice_id: persona.voice_id.to_string(),
            accent_intensity: 50,
            mode: ConversationMode::default(),
            notes: Vec::new(),
        }
    }

    /// Build a config from a persona id, falling back to the default persona
    /// when the id is not in the catalog
    pub fn from_persona_id(persona_id: &str) -> Self {
        match persona::find(persona_id) {
            Some(p) => Self::for_persona(p),
            None => {
                log::warn!(
                    "Unknown persona '{}', falling back to '{}'",
                    persona_id,
                    persona::default_persona().id
                );
                Self::default()
            }
        }
    }

    pub fn with_accent_intensity(mut self, intensity: u8) -> Self {
        self.accent_intensity = intensity.min(MAX_ACCENT_INTENSITY);
        self
    }

    pub fn with_mode(mut self, mode: ConversationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_notes(mut self, notes: Vec<String>) -> Self {
        self.notes = notes;
        self
    }

    /// Switch persona, adopting that persona's voice
    pub fn with_persona(mut self, persona: &Persona) -> Self {
        self.persona_id = persona.id.to_string();
        self.voice_id = persona.voice_id.to_string();
        self
    }

    /// Whether moving from `self` to `next` needs a fresh connection
    ///
    /// Only persona, voice and accent intensity count; the remote side
    /// fixes those at setup time.
    pub fn requires_reconnect(&self, next: &SessionConfig) -> bool {
        self.persona_id != next.persona_id
            || self.voice_id != next.voice_id
            || self.accent_intensity != next.accent_intensity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_uses_default_persona_voice() {
        let config = SessionConfig::default();
        let persona = persona::default_persona();
        assert_eq!(config.persona_id, persona.id);
        assert_eq!(config.voice_id, persona.voice_id);
        assert_eq!(config.accent_intensity, 50);
        assert!(config.notes.is_empty());
    }

    #[test]
    fn test_accent_intensity_is_clamped() {
        let config = SessionConfig::default().with_accent_intensity(250);
        assert_eq!(config.accent_intensity, MAX_ACCENT_INTENSITY);
    }

    #[test]
    fn test_reconnect_only_for_persona_voice_or_intensity() {
        let base = SessionConfig::default();

        let notes_only = base.clone().with_notes(vec!["ho fame".to_string()]);
        assert!(!base.requires_reconnect(&notes_only));

        let mode_only = base.clone().with_mode(ConversationMode::Lesson);
        assert!(!base.requires_reconnect(&mode_only));

        let louder = base.clone().with_accent_intensity(90);
        assert!(base.requires_reconnect(&louder));

        let mut other_voice = base.clone();
        other_voice.voice_id = "Charon".to_string();
        assert!(base.requires_reconnect(&other_voice));

        let other = persona::PERSONAS
            .iter()
            .find(|p| p.id != base.persona_id)
            .unwrap();
        assert!(base.requires_reconnect(&base.clone().with_persona(other)));
    }

    #[test]
    fn test_unknown_persona_falls_back() {
        let config = SessionConfig::from_persona_id("nobody");
        assert_eq!(config.persona_id, persona::default_persona().id);
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!(ConversationMode::parse("Lesson"), Some(ConversationMode::Lesson));
        assert_eq!(ConversationMode::parse("free"), Some(ConversationMode::FreeTalk));
        assert_eq!(ConversationMode::parse("role-play"), Some(ConversationMode::Roleplay));
        assert_eq!(ConversationMode::parse("karaoke"), None);
    }

    #[test]
    fn test_config_serializes_camel_case() {
        let json = serde_json::to_string(&SessionConfig::default()).unwrap();
        assert!(json.contains("\"personaId\""));
        assert!(json.contains("\"accentIntensity\":50"));
        assert!(json.contains("\"mode\":\"freeTalk\""));
    }
}
