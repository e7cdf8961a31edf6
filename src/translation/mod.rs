//! Translation of finalized transcript lines
//!
//! Translation is best effort and fire-and-forget: a `Translator` never
//! fails, it returns an empty string instead.

mod gemini;

use async_trait::async_trait;

pub use gemini::{GeminiTranslator, TranslationError, DEFAULT_TRANSLATION_MODEL};

/// Short translation of finished utterances
#[async_trait]
pub trait Translator: Send + Sync + 'static {
    /// Translate `text`; an empty string means "no translation available"
    async fn translate(&self, text: &str) -> String;
}

/// Translator used when no API key is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTranslator;

#[async_trait]
impl Translator for NoopTranslator {
    async fn translate(&self, _text: &str) -> String {
        String::new()
    }
}
