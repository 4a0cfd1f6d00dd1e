use crate::config::{Config, OpenAiConfig, TranslatorBackend};
use crate::traits::Translator;
use crate::types::{DigestError, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const SYSTEM_PROMPT: &str =
    "You are a precise bilingual scientific translator. Return only the translation.";

/// Translator backed by an OpenAI-compatible Chat Completions endpoint.
pub struct OpenAiTranslator {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

impl OpenAiTranslator {
    pub fn new(
        config: &OpenAiConfig,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: api_key.into(),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl Translator for OpenAiTranslator {
    fn name(&self) -> &str {
        "openai"
    }

    async fn translate(&self, text: &str, target_language: &str) -> Result<String> {
        if text.trim().is_empty() {
            return Ok(String::new());
        }

        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: format!(
                        "Please translate the following English text into {target_language} \
                         accurately, without explanations or bracketed notes:\n\n{text}"
                    ),
                },
            ],
            temperature: 0.2,
        };

        debug!(model = %self.model, chars = text.len(), "Requesting translation");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| DigestError::Translation(describe(&e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DigestError::Translation(format!("HTTP {status}")));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| DigestError::Translation(format!("unreadable response: {e}")))?;

        body.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty())
            .ok_or_else(|| {
                DigestError::Translation("response contained no translation".to_string())
            })
    }
}

fn describe(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else {
        error.to_string()
    }
}

/// Build the translator selected by the configuration, if any.
pub fn build_translator(config: &Config) -> Result<Option<Arc<dyn Translator>>> {
    match config.translator {
        TranslatorBackend::None => {
            info!("Translation disabled");
            Ok(None)
        }
        TranslatorBackend::OpenAi => {
            let api_key = config.openai.api_key.clone().ok_or_else(|| {
                DigestError::Config(
                    "translator \"openai\" needs openai.api_key or OPENAI_API_KEY".to_string(),
                )
            })?;
            let translator = OpenAiTranslator::new(&config.openai, api_key, config.http_timeout())?;
            info!(model = %config.openai.model, "Translation enabled");
            Ok(Some(Arc::new(translator)))
        }
    }
}
