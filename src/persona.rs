//! Persona catalog and system prompt assembly
//!
//! Read-only table of conversation partners. Each persona pins a prebuilt
//! voice and a regional speaking style; the prompt is rebuilt from the
//! catalog entry plus the session config at every connect.

use crate::config::{ConversationMode, SessionConfig};

/// A selectable conversation partner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Persona {
    pub id: &'static str,
    pub name: &'static str,
    /// Prebuilt voice name understood by the speech service
    pub voice_id: &'static str,
    /// Region shown in the UI and used to describe the accent
    pub region: &'static str,
    pub prompt: &'static str,
}

pub static PERSONAS: &[Persona] = &[
    Persona {
        id: "giulia",
        name: "Giulia",
        voice_id: "Aoede",
        region: "Roma",
        prompt: "You are Giulia, a warm and talkative barista from Trastevere in Rome. \
                 You love food, football and gossip about the neighbourhood.",
    },
    Persona {
        id: "marco",
        name: "Marco",
        voice_id: "Puck",
        region: "Milano",
        prompt: "You are Marco, a fast-talking designer from Milan. You are friendly \
                 but always in a hurry, and you sprinkle in business slang.",
    },
    Persona {
        id: "nonna-rosa",
        name: "Nonna Rosa",
        voice_id: "Kore",
        region: "Napoli",
        prompt: "You are Nonna Rosa, a grandmother from Naples. You are patient, \
                 affectionate, and every topic eventually turns into a recipe.",
    },
    Persona {
        id: "salvo",
        name: "Salvo",
        voice_id: "Charon",
        region: "Palermo",
        prompt: "You are Salvo, a fisherman from Palermo. You speak slowly, tell \
                 stories about the sea and ask many questions about the learner.",
    },
    Persona {
        id: "chiara",
        name: "Chiara",
        voice_id: "Leda",
        region: "Firenze",
        prompt: "You are Chiara, an art history student from Florence. You are \
                 curious and precise, and you enjoy explaining words and their origins.",
    },
];

/// Look up a persona by id (case-insensitive)
pub fn find(id: &str) -> Option<&'static Persona> {
    PERSONAS.iter().find(|p| p.id.eq_ignore_ascii_case(id.trim()))
}

pub fn default_persona() -> &'static Persona {
    &PERSONAS[0]
}

/// Describe how strongly the regional accent should come through
fn accent_instruction(region: &str, intensity: u8) -> String {
    match intensity {
        0..=33 => format!(
            "Speak clear, standard Italian with only a light hint of a {} accent.",
            region
        ),
        34..=66 => format!(
            "Speak Italian with a noticeable {} accent and the occasional local expression.",
            region
        ),
        _ => format!(
            "Speak with a strong {} accent and use local dialect words freely, \
             explaining them if the learner is lost.",
            region
        ),
    }
}

fn mode_instruction(mode: ConversationMode) -> &'static str {
    match mode {
        ConversationMode::FreeTalk => {
            "Keep the conversation flowing naturally. Only correct mistakes that block understanding."
        }
        ConversationMode::Lesson => {
            "Act as a tutor: gently correct grammar and vocabulary mistakes, \
             then continue the conversation. Recap new words at natural pauses."
        }
        ConversationMode::Roleplay => {
            "Stay in character inside an everyday scene you choose (market, train \
             station, café). Do not break character to teach."
        }
    }
}

/// Build the system prompt sent at connect time
pub fn system_prompt(config: &SessionConfig) -> String {
    let persona = find(&config.persona_id).unwrap_or_else(default_persona);

    let mut prompt = String::with_capacity(1024);
    prompt.push_str(persona.prompt);
    prompt.push_str("\nYou are talking with someone learning Italian. Reply only in Italian, in short spoken sentences.\n");
    prompt.push_str(&accent_instruction(persona.region, config.accent_intensity));
    prompt.push('\n');
    prompt.push_str(mode_instruction(config.mode));
    prompt.push('\n');

    let notes: Vec<&str> = config
        .notes
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .collect();
    if !notes.is_empty() {
        prompt.push_str("The learner's study notes (weave these topics and words in when natural):\n");
        for note in notes {
            prompt.push_str("- ");
            prompt.push_str(note);
            prompt.push('\n');
        }
    }

    prompt.push_str(
        "When the learner tells you a personal fact worth remembering, append a tag \
         like [[name: Luca]] or [[hobby: cycling]] to your reply. Never read tags aloud.",
    );
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_ids_are_unique() {
        for (i, a) in PERSONAS.iter().enumerate() {
            for b in &PERSONAS[i + 1..] {
                assert_ne!(a.id, b.id);
            }
        }
    }

    #[test]
    fn test_find_is_case_insensitive() {
        assert_eq!(find("MARCO").map(|p| p.region), Some("Milano"));
        assert!(find("unknown").is_none());
    }

    #[test]
    fn test_prompt_includes_persona_accent_and_notes() {
        let config = SessionConfig::from_persona_id("nonna-rosa")
            .with_accent_intensity(90)
            .with_notes(vec!["  ".to_string(), "passato prossimo".to_string()]);
        let prompt = system_prompt(&config);

        assert!(prompt.contains("Nonna Rosa"));
        assert!(prompt.contains("strong Napoli accent"));
        assert!(prompt.contains("- passato prossimo"));
        assert!(!prompt.contains("- \n"));
        assert!(prompt.contains("[[name: Luca]]"));
    }

    #[test]
    fn test_accent_bands() {
        assert!(accent_instruction("Roma", 0).contains("standard Italian"));
        assert!(accent_instruction("Roma", 50).contains("noticeable Roma accent"));
        assert!(accent_instruction("Roma", 100).contains("dialect"));
    }

    #[test]
    fn test_prompt_without_notes_has_no_notes_section() {
        let prompt = system_prompt(&SessionConfig::default());
        assert!(!prompt.contains("study notes"));
    }
}
