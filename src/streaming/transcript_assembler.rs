//! Per-turn transcript assembly for both speakers
//!
//! Keeps at most one open line per role. Deltas append to the open line,
//! `TurnComplete` finalizes it, and the next delta for that role opens a
//! new line. Translations attach to finalized lines by id whenever they
//! arrive.
//!
//! # Spacing
//!
//! Fragments are joined with a single space only when neither the existing
//! text ends with whitespace nor the fragment begins with it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::protocol::Role;
use super::tags::{extract_tags, Fact};

pub type LineId = u64;

/// One speaker turn as shown to the user
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptLine {
    pub id: LineId,
    pub role: Role,
    pub text: String,
    pub translation: Option<String>,
    pub is_final: bool,
    pub started_at: DateTime<Utc>,
}

/// A line that just finished, with any facts pulled out of its text
#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedTurn {
    pub line: TranscriptLine,
    pub facts: Vec<Fact>,
}

#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    lines: Vec<TranscriptLine>,
    /// Index into `lines` of each role's open line
    open: HashMap<Role, usize>,
    next_id: LineId,
    delta_count: u64,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transcription delta to the role's open line
    ///
    /// Opens a new line if the role has none. Empty deltas are ignored and
    /// return `None`.
    pub fn push_delta(&mut self, role: Role, delta: &str) -> Option<&TranscriptLine> {
        if delta.is_empty() {
            return None;
        }

        let idx = match self.open.get(&role) {
            Some(&idx) => idx,
            None => self.open_line(role),
        };

        let line = &mut self.lines[idx];
        append_fragment(&mut line.text, delta);
        self.delta_count += 1;

        if self.delta_count % 50 == 0 {
            log::debug!(
                "TranscriptAssembler: {} deltas, {} lines",
                self.delta_count,
                self.lines.len()
            );
        }

        Some(&self.lines[idx])
    }

    fn open_line(&mut self, role: Role) -> usize {
        let idx = self.lines.len();
        self.lines.push(TranscriptLine {
            id: self.next_id,
            role,
            text: String::new(),
            translation: None,
            is_final: false,
            started_at: Utc::now(),
        });
        self.next_id += 1;
        self.open.insert(role, idx);
        idx
    }

    /// Finalize the role's open line
    ///
    /// Assistant text has its `[[key: value]]` tags stripped and returned as
    /// facts. Returns `None` if the role had no open line.
    pub fn complete_turn(&mut self, role: Role) -> Option<FinalizedTurn> {
        let idx = self.open.remove(&role)?;
        let line = &mut self.lines[idx];

        let facts = if role == Role::Assistant {
            let (cleaned, facts) = extract_tags(&line.text);
            line.text = cleaned;
            facts
        } else {
            line.text = line.text.trim().to_string();
            Vec::new()
        };
        line.is_final = true;

        log::debug!(
            "TranscriptAssembler: {:?} turn {} finalized ({} chars, {} facts)",
            role,
            line.id,
            line.text.len(),
            facts.len()
        );

        Some(FinalizedTurn {
            line: line.clone(),
            facts,
        })
    }

    /// Attach a translation to a line
    ///
    /// Empty translations (the translator's failure value) are not attached.
    /// Returns the updated line, or `None` if nothing changed.
    pub fn attach_translation(&mut self, id: LineId, translation: &str) -> Option<&TranscriptLine> {
        let translation = translation.trim();
        if translation.is_empty() {
            return None;
        }
        let line = self.lines.iter_mut().find(|l| l.id == id)?;
        line.translation = Some(translation.to_string());
        Some(&*line)
    }

    /// Currently open line for a role, if any
    pub fn open_line_for(&self, role: Role) -> Option<&TranscriptLine> {
        self.open.get(&role).map(|&idx| &self.lines[idx])
    }

    pub fn lines(&self) -> &[TranscriptLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Drop every line (conversation reset)
    ///
    /// Line ids keep increasing so late translations for dropped lines
    /// never land on new ones.
    pub fn clear(&mut self) {
        self.lines.clear();
        self.open.clear();
        self.delta_count = 0;
    }
}

fn append_fragment(text: &mut String, fragment: &str) {
    let ends_with_space = text.chars().next_back().map_or(true, char::is_whitespace);
    let starts_with_space = fragment.chars().next().map_or(true, char::is_whitespace);
    if !text.is_empty() && !ends_with_space && !starts_with_space {
        text.push(' ');
    }
    text.push_str(fragment);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deltas_collapse_without_double_spaces() {
        let mut asm = TranscriptAssembler::new();
        for delta in ["Ciao", " come", " va?"] {
            asm.push_delta(Role::Assistant, delta);
        }
        assert_eq!(asm.lines().len(), 1);
        assert_eq!(asm.lines()[0].text, "Ciao come va?");
    }

    #[test]
    fn test_missing_space_is_inserted() {
        let mut asm = TranscriptAssembler::new();
        asm.push_delta(Role::User, "Sto");
        asm.push_delta(Role::User, "bene");
        asm.push_delta(Role::User, " grazie ");
        asm.push_delta(Role::User, "mille");
        assert_eq!(asm.lines()[0].text, "Sto bene grazie mille");
    }

    #[test]
    fn test_next_delta_after_turn_complete_opens_new_line() {
        let mut asm = TranscriptAssembler::new();
        asm.push_delta(Role::Assistant, "Ciao!");
        let done = asm.complete_turn(Role::Assistant).unwrap();
        assert!(done.line.is_final);

        asm.push_delta(Role::Assistant, "Come stai?");

        assert_eq!(asm.len(), 2);
        assert_eq!(asm.lines()[0].text, "Ciao!");
        assert_eq!(asm.lines()[1].text, "Come stai?");
        assert!(!asm.lines()[1].is_final);
        assert_ne!(asm.lines()[0].id, asm.lines()[1].id);
    }

    #[test]
    fn test_roles_have_independent_open_lines() {
        let mut asm = TranscriptAssembler::new();
        asm.push_delta(Role::User, "Ciao");
        asm.push_delta(Role::Assistant, "Buongiorno");
        asm.push_delta(Role::User, "Marco");

        assert_eq!(asm.open_line_for(Role::User).unwrap().text, "Ciao Marco");
        assert_eq!(asm.open_line_for(Role::Assistant).unwrap().text, "Buongiorno");
    }

    #[test]
    fn test_complete_without_open_line_is_noop() {
        let mut asm = TranscriptAssembler::new();
        assert!(asm.complete_turn(Role::User).is_none());
        assert!(asm.is_empty());
    }

    #[test]
    fn test_empty_delta_does_not_open_line() {
        let mut asm = TranscriptAssembler::new();
        assert!(asm.push_delta(Role::User, "").is_none());
        assert!(asm.is_empty());
    }

    #[test]
    fn test_assistant_facts_are_extracted_on_finalize() {
        let mut asm = TranscriptAssembler::new();
        asm.push_delta(Role::Assistant, "Piacere Luca!");
        asm.push_delta(Role::Assistant, " [[name: Luca]]");

        let done = asm.complete_turn(Role::Assistant).unwrap();
        assert_eq!(done.line.text, "Piacere Luca!");
        assert_eq!(done.facts.len(), 1);
        assert_eq!(asm.lines()[0].text, "Piacere Luca!");
    }

    #[test]
    fn test_translation_attaches_after_later_turns() {
        let mut asm = TranscriptAssembler::new();
        asm.push_delta(Role::Assistant, "Ciao");
        let first = asm.complete_turn(Role::Assistant).unwrap().line.id;
        asm.push_delta(Role::Assistant, "Allora");

        let line = asm.attach_translation(first, "Hi").unwrap();
        assert_eq!(line.translation.as_deref(), Some("Hi"));
        assert!(asm.lines()[1].translation.is_none());
    }

    #[test]
    fn test_empty_translation_is_not_attached() {
        let mut asm = TranscriptAssembler::new();
        asm.push_delta(Role::User, "Ciao");
        let id = asm.complete_turn(Role::User).unwrap().line.id;
        assert!(asm.attach_translation(id, "").is_none());
        assert!(asm.lines()[0].translation.is_none());
    }

    #[test]
    fn test_clear_drops_lines_and_keeps_ids_increasing() {
        let mut asm = TranscriptAssembler::new();
        asm.push_delta(Role::User, "Ciao");
        let old = asm.lines()[0].id;
        asm.clear();

        assert!(asm.is_empty());
        assert!(asm.attach_translation(old, "Hi").is_none());

        asm.push_delta(Role::User, "Di nuovo");
        assert!(asm.lines()[0].id > old);
    }
}
