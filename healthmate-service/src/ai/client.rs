//! OpenRouter-backed analysis client.
//!
//! Two call paths: `analyze` submits report file bytes with the fixed
//! analysis prompt through the raw completions API (the content array needs
//! image/file parts), while `chat` goes through a rig agent with the
//! HealthMate persona. Both try the primary model first and retry the
//! identical payload once against the fallback model.

use anyhow::anyhow;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::Client;
use rig::{client::CompletionClient, completion::Prompt, providers::openrouter};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::ai::parser::parse_or_raw;
use crate::models::AiSummary;

pub const PRIMARY_MODEL: &str = "google/gemini-2.5-flash";
pub const FALLBACK_MODEL: &str = "openai/gpt-4.1-mini";

const OPENROUTER_COMPLETIONS_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

const ANALYSIS_MAX_TOKENS: u32 = 4000;

const ANALYSIS_PROMPT: &str = r#"You are a medical AI assistant specializing in analyzing medical reports. Analyze the attached medical report and respond in exactly this format:

1. **English Summary**: A clear, easy-to-understand summary of the report in English
2. **Roman Urdu Summary**: The key findings translated into Roman Urdu for better accessibility
3. **Key Findings**: The most important findings from the report, as a bulleted list
4. **Abnormal Values**: Any values outside normal ranges, as a bulleted list
5. **Recommendations**: General health recommendations based on the report, as a bulleted list
6. **Questions for Doctor**: Specific questions the patient should ask their doctor, as a bulleted list

Use simple, non-medical language that patients can understand. Be encouraging and supportive in your tone. For Roman Urdu, use simple transliteration that is easy to read. If you notice concerning values, mention them clearly but reassuringly.

Always include a disclaimer that this analysis is for informational purposes only and the patient should consult a qualified healthcare professional for proper medical advice."#;

const CHAT_PERSONA: &str = "You are HealthMate, a friendly medical AI assistant. You help patients understand their medical reports and answer health questions in simple language.";

/// Result of a successful report analysis.
#[derive(Debug, Clone)]
pub struct AnalyzedReport {
    pub summary: AiSummary,
    pub raw_response: String,
}

/// Boundary to the generative-AI service. Object-safe so the pipeline can
/// run against a scripted double in tests.
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    /// Fetch the file at `file_location`, submit it with the analysis
    /// prompt, and parse the reply. Errors are returned as values; this
    /// never panics.
    async fn analyze(&self, file_location: &str, mime_hint: &str)
    -> anyhow::Result<AnalyzedReport>;

    /// Answer a conversational message, optionally grounded in report
    /// context, and return the raw reply text.
    async fn chat(&self, user_message: &str, context: &str) -> anyhow::Result<String>;
}

pub struct OpenRouterClient {
    api_key: String,
    http: Client,
}

impl OpenRouterClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            http: Client::new(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| anyhow!("OPENROUTER_API_KEY environment variable not set"))?;
        Ok(Self::new(api_key))
    }

    /// Report files live either behind the storage provider's URL or, with
    /// local storage, directly on disk.
    async fn fetch_file_bytes(&self, location: &str) -> anyhow::Result<Vec<u8>> {
        if location.starts_with("http://") || location.starts_with("https://") {
            let response = self.http.get(location).send().await?;
            if !response.status().is_success() {
                return Err(anyhow!("file download failed: {}", response.status()));
            }
            Ok(response.bytes().await?.to_vec())
        } else {
            Ok(tokio::fs::read(location).await?)
        }
    }

    async fn call_completions(
        &self,
        model: &str,
        content: &[Value],
        max_tokens: u32,
    ) -> anyhow::Result<String> {
        let payload = json!({
            "model": model,
            "messages": [
                {
                    "role": "user",
                    "content": content
                }
            ],
            "max_tokens": max_tokens
        });

        let response = self
            .http
            .post(OPENROUTER_COMPLETIONS_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(anyhow!("LLM API request failed: {}", response.status()));
        }

        let response_json: Value = response.json().await?;
        let content = response_json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("Invalid response format from LLM"))?;

        Ok(content.to_string())
    }

    fn agent(&self, model: &str) -> rig::agent::Agent<openrouter::CompletionModel> {
        openrouter::Client::new(&self.api_key)
            .agent(model)
            .preamble(CHAT_PERSONA)
            .build()
    }
}

#[async_trait]
impl AnalysisClient for OpenRouterClient {
    async fn analyze(
        &self,
        file_location: &str,
        mime_hint: &str,
    ) -> anyhow::Result<AnalyzedReport> {
        info!("Analyzing report file: {}", file_location);

        let bytes = self.fetch_file_bytes(file_location).await?;
        let mime_type = effective_mime_type(mime_hint);
        let encoded = STANDARD.encode(&bytes);
        let content = vec![
            json!({
                "type": "text",
                "text": ANALYSIS_PROMPT
            }),
            file_part(mime_type, &encoded),
        ];

        let raw_response = match self
            .call_completions(PRIMARY_MODEL, &content, ANALYSIS_MAX_TOKENS)
            .await
        {
            Ok(text) => text,
            Err(primary_error) => {
                warn!(
                    "Primary model {} failed ({}), retrying with fallback model {}",
                    PRIMARY_MODEL, primary_error, FALLBACK_MODEL
                );
                self.call_completions(FALLBACK_MODEL, &content, ANALYSIS_MAX_TOKENS)
                    .await?
            }
        };

        info!(
            "Analysis reply received ({} characters)",
            raw_response.len()
        );

        Ok(AnalyzedReport {
            summary: parse_or_raw(&raw_response),
            raw_response,
        })
    }

    async fn chat(&self, user_message: &str, context: &str) -> anyhow::Result<String> {
        let prompt = build_chat_prompt(user_message, context);

        match self.agent(PRIMARY_MODEL).prompt(&prompt).await {
            Ok(reply) => Ok(reply),
            Err(primary_error) => {
                warn!(
                    "Chat: primary model {} failed ({}), trying fallback {}",
                    PRIMARY_MODEL, primary_error, FALLBACK_MODEL
                );
                Ok(self.agent(FALLBACK_MODEL).prompt(&prompt).await?)
            }
        }
    }
}

/// The provider only sees two shapes: PDFs go as PDFs, everything else is
/// submitted as an image.
fn effective_mime_type(mime_hint: &str) -> &'static str {
    if mime_hint.to_lowercase().contains("pdf") {
        "application/pdf"
    } else {
        "image/png"
    }
}

fn file_part(mime_type: &str, encoded: &str) -> Value {
    let data_url = format!("data:{};base64,{}", mime_type, encoded);
    if mime_type == "application/pdf" {
        json!({
            "type": "file",
            "file": {
                "filename": "report.pdf",
                "file_data": data_url
            }
        })
    } else {
        json!({
            "type": "image_url",
            "image_url": {
                "url": data_url
            }
        })
    }
}

fn build_chat_prompt(user_message: &str, context: &str) -> String {
    format!(
        "User's question: {}\nContext: {}\n\nProvide your response in:\n1. English (clear and informative)\n2. Roman Urdu (simple transliteration)\nRemind them to consult a qualified doctor.",
        user_message, context
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdf_hint_selects_pdf_mime_type() {
        assert_eq!(effective_mime_type("application/pdf"), "application/pdf");
        assert_eq!(effective_mime_type("APPLICATION/PDF"), "application/pdf");
    }

    #[test]
    fn non_pdf_hints_default_to_image() {
        assert_eq!(effective_mime_type("image/jpeg"), "image/png");
        assert_eq!(effective_mime_type(""), "image/png");
    }

    #[test]
    fn pdf_bytes_go_as_file_part() {
        let part = file_part("application/pdf", "QUJD");
        assert_eq!(part["type"], "file");
        assert_eq!(
            part["file"]["file_data"],
            "data:application/pdf;base64,QUJD"
        );
    }

    #[test]
    fn image_bytes_go_as_image_url_part() {
        let part = file_part("image/png", "QUJD");
        assert_eq!(part["type"], "image_url");
        assert_eq!(part["image_url"]["url"], "data:image/png;base64,QUJD");
    }

    #[test]
    fn chat_prompt_carries_question_and_context() {
        let prompt = build_chat_prompt("Is my hemoglobin ok?", "Recent report: CBC");
        assert!(prompt.contains("Is my hemoglobin ok?"));
        assert!(prompt.contains("Recent report: CBC"));
        assert!(prompt.contains("Roman Urdu"));
    }
}
