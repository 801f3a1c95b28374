//! Answer verification before streaming.
//!
//! Two verifiers:
//! - [`CitationVerifier`]: deterministic: the answer is non-empty and every
//!   `[n]` citation points at a retrieved passage.
//! - [`LlmVerifier`]: blind review by a cheap model. It sees the question,
//!   the passages and the answer, never the generation prompt, and replies
//!   `PASS` or `FAIL` with a reason.
//!
//! A failed verdict is a warning, not an abort: the orchestrator still
//! streams the answer after emitting a non-fatal `error` event.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use coordination::gateway::Tier;
use coordination::{ChatMessage, GatewayError, GenerateOptions, LlmGateway, SearchResult};
use regex::Regex;
use tokio_util::sync::CancellationToken;

static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d{1,3})\]").expect("CITATION_RE regex should compile"));

/// Result of a verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub feedback: String,
}

impl Verdict {
    pub fn pass() -> Self {
        Self {
            passed: true,
            feedback: String::new(),
        }
    }

    pub fn fail(feedback: impl Into<String>) -> Self {
        Self {
            passed: false,
            feedback: feedback.into(),
        }
    }
}

/// Checks a complete answer.
#[async_trait]
pub trait AnswerVerifier: Send + Sync {
    fn name(&self) -> &str;

    async fn verify(
        &self,
        question: &str,
        answer: &str,
        passages: &[SearchResult],
        cancel: &CancellationToken,
    ) -> Result<Verdict, GatewayError>;
}

/// Deterministic citation check.
#[derive(Debug, Default, Clone)]
pub struct CitationVerifier;

#[async_trait]
impl AnswerVerifier for CitationVerifier {
    fn name(&self) -> &str {
        "citations"
    }

    async fn verify(
        &self,
        _question: &str,
        answer: &str,
        passages: &[SearchResult],
        _cancel: &CancellationToken,
    ) -> Result<Verdict, GatewayError> {
        if answer.trim().is_empty() {
            return Ok(Verdict::fail("empty answer"));
        }
        let dangling: BTreeSet<usize> = CITATION_RE
            .captures_iter(answer)
            .filter_map(|c| c[1].parse::<usize>().ok())
            .filter(|n| *n == 0 || *n > passages.len())
            .collect();
        if dangling.is_empty() {
            Ok(Verdict::pass())
        } else {
            let list: Vec<String> = dangling.iter().map(|n| format!("[{n}]")).collect();
            Ok(Verdict::fail(format!(
                "answer cites unknown sources {}",
                list.join(", ")
            )))
        }
    }
}

/// Blind reviewer over the gateway.
pub struct LlmVerifier {
    gateway: Arc<LlmGateway>,
    tier: Tier,
}

impl LlmVerifier {
    pub fn new(gateway: Arc<LlmGateway>) -> Self {
        Self {
            gateway,
            tier: Tier::Lite,
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }
}

fn review_prompt(question: &str, answer: &str, passages: &[SearchResult]) -> String {
    let mut out = format!("Question:\n{question}\n\nSources:\n");
    if passages.is_empty() {
        out.push_str("(none)\n");
    }
    for (i, p) in passages.iter().enumerate() {
        out.push_str(&format!("[{}] {}\n", i + 1, p.text));
    }
    out.push_str(&format!("\nAnswer:\n{answer}"));
    out
}

/// `PASS ...` → pass, anything else → fail with the full reply as feedback.
pub fn parse_review(reply: &str) -> Verdict {
    let trimmed = reply.trim();
    if trimmed.to_uppercase().starts_with("PASS") {
        Verdict::pass()
    } else {
        Verdict::fail(trimmed)
    }
}

#[async_trait]
impl AnswerVerifier for LlmVerifier {
    fn name(&self) -> &str {
        "llm_review"
    }

    async fn verify(
        &self,
        question: &str,
        answer: &str,
        passages: &[SearchResult],
        cancel: &CancellationToken,
    ) -> Result<Verdict, GatewayError> {
        let messages = vec![
            ChatMessage::system(
                "You review answers. Reply PASS if the answer is supported by the sources \
                 and does not contradict them. Otherwise reply FAIL followed by one sentence \
                 explaining what is unsupported.",
            ),
            ChatMessage::user(review_prompt(question, answer, passages)),
        ];
        let options = GenerateOptions::default()
            .with_temperature(0.0)
            .with_max_tokens(128);
        let response = self
            .gateway
            .generate(self.tier, &messages, &options, cancel)
            .await?;
        Ok(parse_review(&response.content))
    }
}
