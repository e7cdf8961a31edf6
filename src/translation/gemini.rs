//! Gemini `generateContent` client for short translations

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::Translator;

pub const DEFAULT_TRANSLATION_MODEL: &str = "gemini-2.0-flash";

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Failed to build HTTP client ({}), using defaults", e);
                Client::new()
            })
    })
}

/// Errors that can occur during translation (never surfaced to the session)
#[derive(Debug, Error)]
pub enum TranslationError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Gemini API error ({status}): {message}")]
    ApiError { status: u16, message: String },
    #[error("Failed to parse API response: {0}")]
    ParseError(String),
    #[error("Response contained no text")]
    EmptyResponse,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<RequestContent>,
    generation_config: RequestGenerationConfig,
}

#[derive(Debug, Serialize)]
struct RequestContent {
    parts: Vec<RequestPart>,
}

#[derive(Debug, Serialize)]
struct RequestPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestGenerationConfig {
    temperature: f32,
    max_output_tokens: u32,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Default, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

/// Gemini API error response
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Translates finished lines into the learner's language
#[derive(Clone)]
pub struct GeminiTranslator {
    api_key: String,
    model: String,
    target_language: String,
}

impl GeminiTranslator {
    pub fn new(api_key: impl Into<String>, target_language: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_TRANSLATION_MODEL.to_string(),
            target_language: target_language.into(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    fn build_request(&self, text: &str) -> GenerateRequest {
        GenerateRequest {
            contents: vec![RequestContent {
                parts: vec![RequestPart {
                    text: format!(
                        "Translate the following Italian into {}. Reply with the translation only, \
                         no quotes or explanations.\n\n{}",
                        self.target_language, text
                    ),
                }],
            }],
            generation_config: RequestGenerationConfig {
                temperature: 0.2,
                max_output_tokens: 256,
            },
        }
    }

    /// Translate, surfacing errors (the `Translator` impl swallows them)
    pub async fn try_translate(&self, text: &str) -> Result<String, TranslationError> {
        let url = format!("{}/{}:generateContent", API_BASE, self.model);

        let response = get_http_client()
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&self.build_request(text))
            .send()
            .await
            .map_err(|e| TranslationError::NetworkError(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TranslationError::NetworkError(e.to_string()))?;

        if !status.is_success() {
            let message = match serde_json::from_str::<ApiErrorResponse>(&body) {
                Ok(error_response) => error_response.error.message,
                Err(_) => body,
            };
            return Err(TranslationError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: GenerateResponse =
            serde_json::from_str(&body).map_err(|e| TranslationError::ParseError(e.to_string()))?;
        response_text(parsed).ok_or(TranslationError::EmptyResponse)
    }
}

impl std::fmt::Debug for GeminiTranslator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiTranslator")
            .field("model", &self.model)
            .field("target_language", &self.target_language)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Translator for GeminiTranslator {
    async fn translate(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return String::new();
        }
        match self.try_translate(text).await {
            Ok(translation) => translation,
            Err(e) => {
                log::warn!("Translation failed: {}", e);
                String::new()
            }
        }
    }
}

/// Concatenated text of the first candidate
fn response_text(response: GenerateResponse) -> Option<String> {
    let content = response.candidates.into_iter().next()?.content?;
    let text: String = content.parts.into_iter().filter_map(|p| p.text).collect();
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let translator = GeminiTranslator::new("key", "English");
        let json = serde_json::to_value(translator.build_request("Ciao")).unwrap();

        let prompt = json["contents"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(prompt.contains("English"));
        assert!(prompt.ends_with("Ciao"));
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 256);
    }

    #[test]
    fn test_response_text_joins_parts() {
        let response: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"Hi, "},{"text":"how are you? "}]}}]}"#,
        )
        .unwrap();
        assert_eq!(response_text(response).as_deref(), Some("Hi, how are you?"));
    }

    #[test]
    fn test_response_without_candidates() {
        let response: GenerateResponse = serde_json::from_str(r#"{"promptFeedback":{}}"#).unwrap();
        assert!(response_text(response).is_none());
    }

    #[test]
    fn test_api_error_display() {
        let err = TranslationError::ApiError {
            status: 400,
            message: "API key not valid".to_string(),
        };
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("API key not valid"));
    }

    #[tokio::test]
    async fn test_blank_text_skips_request() {
        let translator = GeminiTranslator::new("unused", "English");
        assert_eq!(translator.translate("   ").await, "");
    }

    #[tokio::test]
    #[ignore] // Requires valid API key
    async fn test_translate_live() {
        let key = crate::streaming::get_api_key().expect("GEMINI_API_KEY required");
        let translation = GeminiTranslator::new(key, "English").translate("Buongiorno").await;
        assert!(!translation.is_empty());
    }
}
