//! Incident classification for monitored posts.
//!
//! Two gates, both required: the canonical keyword must appear in the text,
//! and the language model must judge that the event is asserted as having
//! actually occurred. Every upstream failure collapses to "not an incident";
//! the bot never shorts on uncertain input.

use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ClassifierError;

/// The keyword that must be present before the model is even consulted.
pub const INCIDENT_KEYWORD: &str = "hack";

#[async_trait]
pub trait IncidentClassifier: Send + Sync {
    /// Whether the text asserts that a security incident has actually
    /// occurred. Never fails: any upstream problem resolves to `false`.
    async fn classify(&self, text: &str) -> bool;

    /// Connection self-test for the control surface.
    async fn probe(&self) -> Result<(), ClassifierError>;
}

const SYSTEM_PROMPT: &str = "You are an assistant that analyzes social-media posts to detect \
     security-incident events. Respond only with a JSON object with a key \
     'is_incident' that contains a boolean.";

#[derive(Clone)]
pub struct LlmClassifier {
    client: Client<OpenAIConfig>,
    model: String,
}

impl LlmClassifier {
    pub fn new(api_key: String, base_url: Option<String>, model: String) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(url) = base_url {
            config = config.with_api_base(url);
        }
        Self {
            client: Client::with_config(config),
            model,
        }
    }

    async fn chat(&self, system: &str, user: &str) -> Result<String, ClassifierError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([
                ChatCompletionRequestMessage::System(
                    ChatCompletionRequestSystemMessageArgs::default()
                        .content(system)
                        .build()
                        .map_err(|e| ClassifierError::Unavailable(e.to_string()))?,
                ),
                ChatCompletionRequestMessage::User(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(user)
                        .build()
                        .map_err(|e| ClassifierError::Unavailable(e.to_string()))?,
                ),
            ])
            .build()
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| ClassifierError::Unavailable(e.to_string()))?;

        let choice = response
            .choices
            .first()
            .ok_or_else(|| ClassifierError::Malformed("empty choices".to_string()))?;
        Ok(choice.message.content.clone().unwrap_or_default())
    }

    async fn judge(&self, text: &str) -> Result<bool, ClassifierError> {
        let user = format!(
            "Analyze the following post and determine if it contains the word \"hack\" \
             AND if it asserts that a hack has actually occurred (not merely mentioned \
             hypothetically, speculated about, or denied).\n\n\
             Post: \"{}\"\n\n\
             Respond only with a JSON object with a key \"is_incident\" that contains a \
             boolean (true/false).",
            text
        );
        let reply = self.chat(SYSTEM_PROMPT, &user).await?;
        Ok(parse_verdict(&reply))
    }
}

#[async_trait]
impl IncidentClassifier for LlmClassifier {
    async fn classify(&self, text: &str) -> bool {
        if !text.to_lowercase().contains(INCIDENT_KEYWORD) {
            return false;
        }
        match self.judge(text).await {
            Ok(is_incident) => {
                info!("🤖 [CLASSIFIER] verdict: is_incident={}", is_incident);
                is_incident
            }
            Err(e) => {
                warn!(
                    "⚠️ [CLASSIFIER] judgment failed, treating as no incident: {}",
                    e
                );
                false
            }
        }
    }

    async fn probe(&self) -> Result<(), ClassifierError> {
        self.chat("You are a connectivity check.", "Say hello")
            .await
            .map(|_| ())
    }
}

#[derive(Deserialize)]
struct Verdict {
    #[serde(default)]
    is_incident: bool,
}

/// Parse the model reply. Strict JSON first; a non-JSON reply falls back to
/// substring detection; anything else is "not an incident".
pub fn parse_verdict(reply: &str) -> bool {
    let candidate = extract_json(reply).unwrap_or(reply);
    match serde_json::from_str::<Verdict>(candidate) {
        Ok(verdict) => verdict.is_incident,
        Err(_) => {
            warn!("⚠️ [CLASSIFIER] non-JSON reply: {}", reply);
            reply.to_lowercase().contains("true")
        }
    }
}

fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if start < end {
        Some(&text[start..=end])
    } else {
        None
    }
}
