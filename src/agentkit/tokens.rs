//! Token estimation and budgeting.
//!
//! Counting uses an approximation of one token per four characters, which
//! works reasonably well for English text without pulling a tokenizer into
//! the dependency tree.  Conversations pay a fixed overhead of
//! [`MESSAGE_OVERHEAD`] tokens per message plus [`CONVERSATION_OVERHEAD`]
//! per request, mirroring the framing cost the remote services bill for.

use crate::agentkit::message::Role;
use crate::agentkit::provider::ChatMessage;

/// Framing overhead charged per message.
pub const MESSAGE_OVERHEAD: usize = 4;

/// Framing overhead charged once per conversation.
pub const CONVERSATION_OVERHEAD: usize = 2;

/// Context-window size assumed for models missing from the table.
pub const DEFAULT_TOKEN_LIMIT: usize = 4096;

/// Known context-window sizes, longest prefix first.  Lookup walks the table
/// top to bottom and takes the first prefix match, so more specific model
/// names must precede their family prefix.
const TOKEN_LIMITS: &[(&str, usize)] = &[
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4-32k", 32_768),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo-16k", 16_384),
    ("gpt-3.5", 4_096),
    ("claude-3", 200_000),
    ("claude-2.1", 200_000),
    ("claude-2", 100_000),
    ("claude", 100_000),
    ("gemini-1.5", 1_048_576),
    ("gemini", 32_768),
];

/// Estimate the number of tokens in a text fragment.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    (text.len() / 4).max(1)
}

/// Tokens one message costs inside a conversation, framing included.
pub fn message_tokens(message: &ChatMessage) -> usize {
    estimate_tokens(&message.content) + MESSAGE_OVERHEAD
}

/// Tokens a whole conversation costs, framing included.
pub fn conversation_tokens(messages: &[ChatMessage]) -> usize {
    if messages.is_empty() {
        return 0;
    }
    messages.iter().map(message_tokens).sum::<usize>() + CONVERSATION_OVERHEAD
}

/// Context-window size for a model name, via longest-prefix table lookup.
pub fn token_limit(model: &str) -> usize {
    TOKEN_LIMITS
        .iter()
        .find(|(prefix, _)| model.starts_with(prefix))
        .map(|(_, limit)| *limit)
        .unwrap_or(DEFAULT_TOKEN_LIMIT)
}

/// Running token total tracked against a cap.
#[derive(Debug, Clone)]
pub struct TokenBudget {
    limit: usize,
    used: usize,
}

impl TokenBudget {
    /// Create a budget with the given cap.
    pub fn new(limit: usize) -> Self {
        TokenBudget { limit, used: 0 }
    }

    /// Whether a fragment still fits.
    pub fn can_add(&self, text: &str) -> bool {
        self.used + estimate_tokens(text) <= self.limit
    }

    /// Record a fragment against the budget.
    pub fn add(&mut self, text: &str) {
        self.used += estimate_tokens(text);
    }

    /// Tokens consumed so far.
    pub fn used(&self) -> usize {
        self.used
    }

    /// Tokens left, clamped at zero.
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }
}

/// Trim a conversation to fit a token cap.
///
/// A leading system message is always preserved when the cap permits it.
/// The rest of the history is filled newest-backward until the budget runs
/// out, then restored to chronological order, so the result is the system
/// message (if any) followed by a contiguous tail of the conversation.
/// An empty input yields an empty output.
pub fn truncate_messages(messages: &[ChatMessage], max_tokens: usize) -> Vec<ChatMessage> {
    if messages.is_empty() {
        return Vec::new();
    }
    let mut remaining = max_tokens.saturating_sub(CONVERSATION_OVERHEAD);

    let mut system: Option<&ChatMessage> = None;
    let mut tail = messages;
    if messages[0].role == Role::System {
        let cost = message_tokens(&messages[0]);
        if cost <= remaining {
            system = Some(&messages[0]);
            remaining -= cost;
        }
        tail = &messages[1..];
    }

    let mut kept_rev: Vec<ChatMessage> = Vec::new();
    for message in tail.iter().rev() {
        let cost = message_tokens(message);
        if cost > remaining {
            break;
        }
        remaining -= cost;
        kept_rev.push(message.clone());
    }

    let mut out = Vec::with_capacity(kept_rev.len() + 1);
    if let Some(system) = system {
        out.push(system.clone());
    }
    out.extend(kept_rev.into_iter().rev());
    out
}
