//! Prompt assembly for one turn.
//!
//! Message layout:
//!
//! ```text
//! system    instruction + user profile + collective insights + passages
//! user/asst last `history_window` messages of the conversation
//! user      the question
//! ```
//!
//! With no passages the system message says so, and the model answers from
//! general knowledge.

use std::fmt::Write as _;

use coordination::memory::CollectiveInsight;
use coordination::{ChatMessage, MemoryContext, SearchResult};

const DEFAULT_INSTRUCTION: &str = "You are an assistant for business and legal questions. \
Answer using the numbered sources when they are relevant and cite them as [n]. \
If the sources do not cover the question, say so.";

/// Everything the prompt is built from.
#[derive(Debug, Default, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub question: &'a str,
    pub memory: Option<&'a MemoryContext>,
    pub insights: &'a [CollectiveInsight],
    pub passages: &'a [SearchResult],
    pub history: &'a [ChatMessage],
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    instruction: String,
    history_window: usize,
    max_profile_facts: usize,
    max_passage_chars: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self {
            instruction: DEFAULT_INSTRUCTION.to_string(),
            history_window: 6,
            max_profile_facts: 10,
            max_passage_chars: 1_500,
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_history_window(mut self, n: usize) -> Self {
        self.history_window = n;
        self
    }

    pub fn with_max_passage_chars(mut self, n: usize) -> Self {
        self.max_passage_chars = n.max(1);
        self
    }

    pub fn build(&self, inputs: PromptInputs<'_>) -> Vec<ChatMessage> {
        let mut system = self.instruction.clone();

        if let Some(memory) = inputs.memory.filter(|m| !m.is_empty()) {
            system.push_str("\n\n## What you know about this user\n");
            for fact in memory.recent_facts(self.max_profile_facts) {
                let _ = writeln!(system, "- {fact}");
            }
            if !memory.summary.is_empty() {
                let _ = writeln!(system, "Summary: {}", memory.summary);
            }
        }

        if !inputs.insights.is_empty() {
            system.push_str("\n## Common among users\n");
            for insight in inputs.insights {
                let _ = writeln!(system, "- {} ({} users)", insight.fact, insight.user_count);
            }
        }

        if inputs.passages.is_empty() {
            system.push_str("\n\nNo sources were found for this question.");
        } else {
            system.push_str("\n\n## Sources\n");
            for (i, passage) in inputs.passages.iter().enumerate() {
                let _ = writeln!(
                    system,
                    "[{}] {}",
                    i + 1,
                    truncate_chars(&passage.text, self.max_passage_chars)
                );
            }
        }

        let skip = inputs.history.len().saturating_sub(self.history_window);
        let mut messages = Vec::with_capacity(2 + inputs.history.len() - skip);
        messages.push(ChatMessage::system(system));
        messages.extend(inputs.history[skip..].iter().cloned());
        messages.push(ChatMessage::user(inputs.question));
        messages
    }
}
