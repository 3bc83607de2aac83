//! Token counting and history trimming.
//!
//! The counter is a deterministic BPE-shaped estimator: text is split into runs
//! of ASCII word characters, ASCII punctuation, whitespace and non-ASCII
//! characters, and each run is charged according to the tokenizer family.
//! Every message additionally costs a fixed framing overhead for the role name
//! and delimiters of the chat wire format.

use serde::{Deserialize, Serialize};

use crate::message::ChatMessage;

/// Per-message framing overhead in tokens.
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// The tokenizer vocabulary family a model belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerFamily {
    /// GPT-3.5, GPT-4, text-embedding-3
    #[default]
    Cl100kBase,
    /// GPT-4o, GPT-4.1, GPT-5, o-series
    O200kBase,
}

impl TokenizerFamily {
    /// Resolve the family for a model tag. Vendor prefixes such as
    /// `openai/` are ignored. Returns `None` for unknown tags.
    pub fn for_model(model: &str) -> Option<Self> {
        let tag = model.rsplit('/').next().unwrap_or(model).to_ascii_lowercase();
        const O200K: &[&str] = &[
            "gpt-4o", "chatgpt-4o", "gpt-4.1", "gpt-4.5", "gpt-5", "o1", "o3", "o4",
        ];
        const CL100K: &[&str] = &["gpt-4", "gpt-3.5", "text-embedding-3", "text-embedding-ada"];

        if O200K.iter().any(|p| tag.starts_with(p)) {
            Some(Self::O200kBase)
        } else if CL100K.iter().any(|p| tag.starts_with(p)) {
            Some(Self::Cl100kBase)
        } else {
            None
        }
    }

    /// Tokens for a run of `n` ASCII word characters.
    fn word_run(&self, n: usize) -> usize {
        // cl100k: ~4.0 chars/token, o200k: ~4.4 chars/token (in tenths)
        let tenths = match self {
            Self::Cl100kBase => 40,
            Self::O200kBase => 44,
        };
        (n * 10).div_ceil(tenths)
    }

    /// Tokens for a run of `n` non-ASCII characters (CJK, kana, emoji).
    fn wide_run(&self, n: usize) -> usize {
        match self {
            Self::Cl100kBase => n,
            Self::O200kBase => (n * 7).div_ceil(10),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum RunKind {
    Word,
    Punct,
    Space,
    Wide,
}

fn classify(c: char) -> RunKind {
    if c.is_ascii_alphanumeric() || c == '_' {
        RunKind::Word
    } else if c.is_whitespace() {
        RunKind::Space
    } else if c.is_ascii() {
        RunKind::Punct
    } else {
        RunKind::Wide
    }
}

/// Deterministic token counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tokenizer {
    family: TokenizerFamily,
}

impl Tokenizer {
    pub fn new(family: TokenizerFamily) -> Self {
        Self { family }
    }

    /// Tokenizer for a model tag, defaulting to cl100k for unknown tags.
    pub fn for_model(model: &str) -> Self {
        Self::new(TokenizerFamily::for_model(model).unwrap_or_default())
    }

    pub fn family(&self) -> TokenizerFamily {
        self.family
    }

    /// Count the tokens in a string. Empty string yields 0.
    pub fn count_tokens(&self, text: &str) -> usize {
        let mut total = 0;
        let mut chars = text.chars().peekable();

        while let Some(c) = chars.next() {
            let kind = classify(c);
            let mut len = 1;
            while chars.peek().is_some_and(|next| classify(*next) == kind) {
                chars.next();
                len += 1;
            }
            total += match kind {
                RunKind::Word => self.family.word_run(len),
                RunKind::Wide => self.family.wide_run(len),
                RunKind::Punct => len,
                // A single space merges into the following word piece.
                RunKind::Space if len == 1 && c == ' ' => 0,
                RunKind::Space => 1,
            };
        }
        total
    }

    /// Tokens for one message including framing overhead.
    pub fn count_message_tokens(&self, message: &ChatMessage) -> usize {
        MESSAGE_OVERHEAD_TOKENS + self.count_tokens(&message.content)
    }

    /// Tokens for a slice of messages.
    pub fn count_messages_tokens(&self, messages: &[ChatMessage]) -> usize {
        messages.iter().map(|m| self.count_message_tokens(m)).sum()
    }

    /// Keep the largest tail of `history` whose total fits in `max_tokens`.
    ///
    /// Messages are never split: if the last message alone exceeds the budget,
    /// the result is that single message.
    pub fn trim_history(&self, history: &[ChatMessage], max_tokens: usize) -> Vec<ChatMessage> {
        let Some(last) = history.last() else {
            return Vec::new();
        };

        let mut used = self.count_message_tokens(last);
        if used > max_tokens {
            return vec![last.clone()];
        }

        let mut start = history.len() - 1;
        while start > 0 {
            let cost = self.count_message_tokens(&history[start - 1]);
            if used + cost > max_tokens {
                break;
            }
            used += cost;
            start -= 1;
        }

        history[start..].to_vec()
    }
}

/// Count tokens with the default (cl100k) family.
pub fn count_tokens(text: &str) -> usize {
    Tokenizer::default().count_tokens(text)
}

/// Trim history with the default (cl100k) family.
pub fn trim_history(history: &[ChatMessage], max_tokens: usize) -> Vec<ChatMessage> {
    Tokenizer::default().trim_history(history, max_tokens)
}
