//! `[[key: value]]` fact tags embedded in reply text
//!
//! Extraction is best effort: well-formed tags are stripped from the
//! displayed text and returned as facts, anything else stays as written.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

/// `[[key: value]]`; the key stops at the first colon
static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[\[([^\[\]:]*):([^\[\]]*)\]\]").unwrap());

static MULTI_SPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// A personal fact the assistant chose to remember
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fact {
    pub key: String,
    pub value: String,
}

/// Strip tags from `text`, returning the cleaned text and the facts found
///
/// Keys are trimmed and lowercased. Tags with an empty key or value are
/// removed from the text but not reported.
pub fn extract_tags(text: &str) -> (String, Vec<Fact>) {
    if !text.contains("[[") {
        return (text.to_string(), Vec::new());
    }

    let mut facts = Vec::new();
    for caps in TAG_RE.captures_iter(text) {
        let key = caps[1].trim().to_lowercase();
        let value = caps[2].trim();
        if key.is_empty() || value.is_empty() {
            log::debug!("Ignoring empty tag: {}", &caps[0]);
            continue;
        }
        facts.push(Fact {
            key,
            value: value.to_string(),
        });
    }

    let stripped = TAG_RE.replace_all(text, " ");
    let cleaned = MULTI_SPACE_RE.replace_all(stripped.trim(), " ").into_owned();
    (cleaned, facts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_tags_is_untouched() {
        let (text, facts) = extract_tags("Ciao,  come va?");
        assert_eq!(text, "Ciao,  come va?");
        assert!(facts.is_empty());
    }

    #[test]
    fn test_extracts_and_strips() {
        let (text, facts) = extract_tags("Piacere, Luca! [[name: Luca]] Ti piace il ciclismo? [[ Hobby : cycling ]]");
        assert_eq!(text, "Piacere, Luca! Ti piace il ciclismo?");
        assert_eq!(
            facts,
            vec![
                Fact {
                    key: "name".to_string(),
                    value: "Luca".to_string()
                },
                Fact {
                    key: "hobby".to_string(),
                    value: "cycling".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_empty_tags_are_stripped_but_not_reported() {
        let (text, facts) = extract_tags("Bene [[name: ]] allora [[ : x]]");
        assert_eq!(text, "Bene allora");
        assert!(facts.is_empty());
    }

    #[test]
    fn test_malformed_tags_are_left_alone() {
        let (text, facts) = extract_tags("Vediamo [[name Luca]] e [[city: Roma");
        assert_eq!(text, "Vediamo [[name Luca]] e [[city: Roma");
        assert!(facts.is_empty());
    }

    #[test]
    fn test_value_may_contain_colon() {
        let (_, facts) = extract_tags("[[time: 10:30]]");
        assert_eq!(facts[0].value, "10:30");
    }
}
