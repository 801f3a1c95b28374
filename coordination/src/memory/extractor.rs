//! Fact extraction from a finished conversation turn.
//!
//! Two implementations:
//!
//! | Extractor                 | Source                                  | Summary |
//! |---------------------------|-----------------------------------------|---------|
//! | [`PatternFactExtractor`]  | first-person statements, regex          | no      |
//! | [`LlmFactExtractor`]      | gateway at `Lite` tier, JSON response   | yes     |

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::errors::MemoryError;
use super::store::MemoryContext;
use crate::gateway::{ChatMessage, GenerateOptions, LlmGateway, Tier};

/// Candidate facts and an optional refreshed summary.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Extraction {
    #[serde(default)]
    pub facts: Vec<String>,
    #[serde(default)]
    pub summary: Option<String>,
}

/// Turns one exchange into durable facts about the user.
#[async_trait]
pub trait FactExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Prepare the extractor. Failure leaves the memory service degraded.
    async fn initialize(&self) -> Result<(), MemoryError>;

    async fn extract(
        &self,
        user_message: &str,
        ai_response: &str,
        context: &MemoryContext,
    ) -> Result<Extraction, MemoryError>;
}

static FIRST_PERSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:i am|i'm|i work|i live|i own|i run|i have|i prefer|i need|call me|my (?:name|company|business|job|role) is)\b[^.!?\n]*",
    )
    .expect("FIRST_PERSON_RE regex should compile")
});

/// Regex extractor for statements the user makes about themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct PatternFactExtractor;

impl PatternFactExtractor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FactExtractor for PatternFactExtractor {
    fn name(&self) -> &str {
        "pattern"
    }

    async fn initialize(&self) -> Result<(), MemoryError> {
        Ok(())
    }

    async fn extract(
        &self,
        user_message: &str,
        _ai_response: &str,
        _context: &MemoryContext,
    ) -> Result<Extraction, MemoryError> {
        let facts = FIRST_PERSON_RE
            .find_iter(user_message)
            .map(|m| m.as_str().trim().to_string())
            .collect();
        Ok(Extraction {
            facts,
            summary: None,
        })
    }
}

const EXTRACTION_PROMPT: &str = "Extract durable facts the user states about themselves \
(profession, business, location, preferences). Ignore questions and anything the assistant \
said. Also write a one-sentence summary of the user's interests so far. Reply with JSON only: \
{\"facts\": [\"...\"], \"summary\": \"...\"}";

/// Extractor that asks a cheap model for facts and a rolling summary.
pub struct LlmFactExtractor {
    gateway: Arc<LlmGateway>,
    tier: Tier,
    options: GenerateOptions,
}

impl LlmFactExtractor {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self {
            gateway,
            tier: Tier::Lite,
            options: GenerateOptions::default()
                .with_temperature(0.0)
                .with_max_tokens(400),
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }
}

#[async_trait]
impl FactExtractor for LlmFactExtractor {
    fn name(&self) -> &str {
        "llm"
    }

    async fn initialize(&self) -> Result<(), MemoryError> {
        if self.gateway.fallback_chain(self.tier).is_empty() {
            return Err(MemoryError::Extraction(format!(
                "no providers for tier {}",
                self.tier
            )));
        }
        Ok(())
    }

    async fn extract(
        &self,
        user_message: &str,
        ai_response: &str,
        context: &MemoryContext,
    ) -> Result<Extraction, MemoryError> {
        let mut prompt = String::new();
        if !context.summary.is_empty() {
            prompt.push_str(&format!("Previous summary: {}\n\n", context.summary));
        }
        prompt.push_str(&format!("User: {user_message}\n\nAssistant: {ai_response}"));
        let messages = vec![ChatMessage::system(EXTRACTION_PROMPT), ChatMessage::user(prompt)];

        // Background work: not tied to any request's cancellation.
        let response = self
            .gateway
            .generate(self.tier, &messages, &self.options, &CancellationToken::new())
            .await
            .map_err(|e| MemoryError::Extraction(e.to_string()))?;
        let extraction = parse_extraction(&response.content)?;
        debug!(
            provider = %response.provider,
            facts = extraction.facts.len(),
            "extracted facts"
        );
        Ok(extraction)
    }
}

/// Parse the model's JSON reply, tolerating code fences and surrounding prose.
pub fn parse_extraction(content: &str) -> Result<Extraction, MemoryError> {
    let start = content.find('{');
    let end = content.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &content[s..=e],
        _ => {
            return Err(MemoryError::Extraction(
                "model reply contained no JSON object".to_string(),
            ))
        }
    };
    let mut extraction: Extraction =
        serde_json::from_str(json).map_err(|e| MemoryError::Extraction(e.to_string()))?;
    if extraction.summary.as_deref().is_some_and(|s| s.trim().is_empty()) {
        extraction.summary = None;
    }
    Ok(extraction)
}
