// src/validate/advisor.rs
//! Pluggable anomaly advisory: an optional, external natural-language
//! assessment consulted for higher-magnitude events only. Absence or failure
//! is a no-op; the verdict is always a soft signal, never a hard reject.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ingest::types::{Event, FusedEvent};

#[async_trait::async_trait]
pub trait AnomalyAdvisor: Send + Sync {
    /// Assess one event against the recent feed. Returns flagged anomaly
    /// descriptions; an empty list means "nothing suspicious" and any
    /// internal failure must degrade to an empty list.
    async fn assess(&self, event: &Event, recent: &[FusedEvent]) -> Vec<String>;
    fn name(&self) -> &'static str;
}

pub type DynAdvisor = Arc<dyn AnomalyAdvisor>;

/// Returns no anomalies, ever; used when the advisory is not configured.
pub struct DisabledAdvisor;

#[async_trait::async_trait]
impl AnomalyAdvisor for DisabledAdvisor {
    async fn assess(&self, _event: &Event, _recent: &[FusedEvent]) -> Vec<String> {
        Vec::new()
    }
    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Fixed-answer advisor for tests.
#[derive(Clone, Default)]
pub struct MockAdvisor {
    pub anomalies: Vec<String>,
}

#[async_trait::async_trait]
impl AnomalyAdvisor for MockAdvisor {
    async fn assess(&self, _event: &Event, _recent: &[FusedEvent]) -> Vec<String> {
        self.anomalies.clone()
    }
    fn name(&self) -> &'static str {
        "mock"
    }
}

/// OpenAI-backed advisor (Chat Completions). Requires `OPENAI_API_KEY`.
pub struct OpenAiAdvisor {
    http: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiAdvisor {
    pub fn new(model_override: Option<&str>) -> Self {
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        let http = reqwest::Client::builder()
            .user_agent("quake-fusion/0.1 (+github.com/lumlich/quake-fusion)")
            .connect_timeout(Duration::from_secs(4))
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        let model = model_override.unwrap_or("gpt-4o-mini").to_string();
        Self {
            http,
            api_key,
            model,
        }
    }

    fn prompt_for(event: &Event, recent: &[FusedEvent]) -> String {
        let mut context = String::new();
        for f in recent.iter().take(10) {
            context.push_str(&format!(
                "- M{:.1}, depth {:.1} km, {} ({})\n",
                f.event.magnitude, f.event.depth_km, f.event.location, f.event.source
            ));
        }
        format!(
            "Assess this seismic report for plausibility against the recent feed.\n\
             Report: M{:.1}, depth {:.1} km, lat {:.4}, lon {:.4}, {} ({})\n\
             Recent events:\n{context}\
             Answer ONLY with JSON: {{\"is_valid\": true|false, \"anomalies\": [\"...\"]}}",
            event.magnitude,
            event.depth_km,
            event.latitude,
            event.longitude,
            event.location,
            event.source
        )
    }
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
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

#[derive(Deserialize)]
struct AdvisorVerdict {
    #[serde(default)]
    is_valid: Option<bool>,
    #[serde(default)]
    anomalies: Vec<String>,
}

/// Pull the first JSON object out of a possibly-chatty completion.
fn extract_verdict(content: &str) -> Option<AdvisorVerdict> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    serde_json::from_str(&content[start..=end]).ok()
}

#[async_trait::async_trait]
impl AnomalyAdvisor for OpenAiAdvisor {
    async fn assess(&self, event: &Event, recent: &[FusedEvent]) -> Vec<String> {
        if self.api_key.is_empty() {
            return Vec::new();
        }

        let prompt = Self::prompt_for(event, recent);
        let req = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "You validate seismic event reports. Answer only with the requested JSON.",
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            temperature: 0.3,
            max_tokens: 200,
        };

        let resp = match self
            .http
            .post("https://api.openai.com/v1/chat/completions")
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
        {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                tracing::debug!(status = %r.status(), "advisor call failed");
                return Vec::new();
            }
            Err(e) => {
                tracing::debug!(error = %e, "advisor call failed");
                return Vec::new();
            }
        };

        let Ok(body) = resp.json::<ChatResponse>().await else {
            return Vec::new();
        };
        let content = body
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("");
        match extract_verdict(content) {
            Some(v) if v.is_valid == Some(false) || !v.anomalies.is_empty() => v.anomalies,
            _ => Vec::new(),
        }
    }

    fn name(&self) -> &'static str {
        "openai"
    }
}

/// Factory: `QUAKE_ADVISOR=openai` enables the real provider, anything else
/// (including unset) wires the no-op.
pub fn build_advisor() -> DynAdvisor {
    match std::env::var("QUAKE_ADVISOR").as_deref() {
        Ok("openai") => Arc::new(OpenAiAdvisor::new(None)),
        _ => Arc::new(DisabledAdvisor),
    }
}
