//! Generation backend abstraction and provider implementations.
//!
//! [`GenerationClient`] is the single seam the orchestrator talks to; the
//! concrete provider is chosen once at process start from `[llm] provider`.
//! Each implementation translates the uniform role/content history into its
//! provider's call shape: Groq takes an explicit system role, Gemini folds
//! the system instruction and history into one text prompt.
//!
//! No internal retry — one HTTP request per generate call, bounded by the
//! configured timeout. A missing credential fails construction, which makes
//! a misconfigured provider a startup error rather than a per-request one.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LlmConfig;
use crate::models::Turn;

/// One operation: produce a completion for a question given the system
/// prompt and prior turns. `model` and `temperature` are per-request
/// overrides; each provider has a fixed default model.
#[async_trait]
pub trait GenerationClient: Send + Sync {
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[Turn],
        question: &str,
        model: Option<&str>,
        temperature: Option<f32>,
    ) -> Result<String>;
}

/// Selects and constructs the configured provider. Called once at startup;
/// an error here is fatal for `serve`.
pub fn create_generation_client(config: &LlmConfig) -> Result<Box<dyn GenerationClient>> {
    match config.provider.as_str() {
        "groq" => Ok(Box::new(GroqClient::new(config)?)),
        "gemini" => Ok(Box::new(GeminiClient::new(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

// ============ Groq (OpenAI-compatible chat completions) ============

const GROQ_DEFAULT_URL: &str = "https://api.groq.com/openai/v1";
const GROQ_DEFAULT_MODEL: &str = "llama-3.3-70b-versatile";

pub struct GroqClient {
    client: reqwest::Client,
    api_key: String,
    url: String,
    default_model: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

impl GroqClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("GROQ_API_KEY")
            .map_err(|_| anyhow::anyhow!("GROQ_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| GROQ_DEFAULT_URL.to_string()),
            default_model: config
                .model
                .clone()
                .unwrap_or_else(|| GROQ_DEFAULT_MODEL.to_string()),
        })
    }
}

#[async_trait]
impl GenerationClient for GroqClient {
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[Turn],
        question: &str,
        model: Option<&str>,
        temperature: Option<f32>,
    ) -> Result<String> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(ChatMessage {
            role: "system",
            content: system_prompt,
        });
        for turn in history {
            messages.push(ChatMessage {
                role: &turn.role,
                content: &turn.content,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: question,
        });

        let body = ChatCompletionRequest {
            model: model.unwrap_or(&self.default_model),
            messages,
            temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .context("Groq request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Groq API error {}: {}", status, body_text);
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .context("Invalid Groq response body")?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("Groq response contained no choices"))
    }
}

// ============ Gemini (Google generative language API) ============

const GEMINI_DEFAULT_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const GEMINI_DEFAULT_MODEL: &str = "gemini-pro";

pub struct GeminiClient {
    client: reqwest::Client,
    api_key: String,
    url: String,
    default_model: String,
}

#[derive(Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Serialize)]
struct GeminiContent {
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: GeminiCandidateContent,
}

#[derive(Deserialize)]
struct GeminiCandidateContent {
    parts: Vec<GeminiCandidatePart>,
}

#[derive(Deserialize)]
struct GeminiCandidatePart {
    text: String,
}

impl GeminiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| GEMINI_DEFAULT_URL.to_string()),
            default_model: config
                .model
                .clone()
                .unwrap_or_else(|| GEMINI_DEFAULT_MODEL.to_string()),
        })
    }
}

/// Gemini has no separate system role; the system instruction and history
/// are folded into a single text prompt, history turns tagged User/Model.
pub fn fold_gemini_prompt(system_prompt: &str, history: &[Turn], question: &str) -> String {
    let mut prompt = format!("System Instruction:\n{}\n\nHistory:\n", system_prompt);
    for turn in history {
        let role = if turn.role == "user" { "User" } else { "Model" };
        prompt.push_str(&format!("{}: {}\n", role, turn.content));
    }
    prompt.push_str(&format!("\nUser: {}", question));
    prompt
}

#[async_trait]
impl GenerationClient for GeminiClient {
    async fn generate(
        &self,
        system_prompt: &str,
        history: &[Turn],
        question: &str,
        model: Option<&str>,
        temperature: Option<f32>,
    ) -> Result<String> {
        let prompt = fold_gemini_prompt(system_prompt, history, question);
        let body = GeminiRequest {
            contents: vec![GeminiContent {
                parts: vec![GeminiPart { text: prompt }],
            }],
            generation_config: temperature.map(|t| GeminiGenerationConfig { temperature: t }),
        };

        let target = model.unwrap_or(&self.default_model);
        let response = self
            .client
            .post(format!(
                "{}/models/{}:generateContent?key={}",
                self.url, target, self.api_key
            ))
            .json(&body)
            .send()
            .await
            .context("Gemini request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("Gemini API error {}: {}", status, body_text);
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .context("Invalid Gemini response body")?;
        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content.parts.into_iter().next())
            .map(|p| p.text)
            .ok_or_else(|| anyhow::anyhow!("Gemini response contained no candidates"))
    }
}
