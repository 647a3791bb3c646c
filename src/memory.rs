use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Message, Role};

/// Lifetime class of a keyed memory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    ShortTerm,
    LongTerm,
    Working,
}

impl MemoryType {
    pub const ALL: [MemoryType; 3] = [
        MemoryType::ShortTerm,
        MemoryType::LongTerm,
        MemoryType::Working,
    ];
}

/// In-memory transcript storage.
#[derive(Default, Clone, Debug)]
pub struct ConversationMemory {
    messages: Vec<Message>,
}

impl ConversationMemory {
    pub fn with_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> + '_ {
        self.messages.iter()
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

/// How much of the transcript is sent with each model call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum HistoryWindow {
    #[default]
    Full,
    /// The most recent `n` messages.
    Last { n: usize },
    /// Newest messages that fit an approximate token budget (4 chars per token).
    TokenBudget { max_tokens: usize },
}

impl HistoryWindow {
    pub fn select<'a>(&self, history: &'a [Message]) -> &'a [Message] {
        match *self {
            HistoryWindow::Full => history,
            HistoryWindow::Last { n } => &history[history.len().saturating_sub(n)..],
            HistoryWindow::TokenBudget { max_tokens } => {
                let mut used = 0usize;
                let mut start = history.len();
                for (idx, message) in history.iter().enumerate().rev() {
                    let cost = message.content.len().div_ceil(4);
                    if used + cost > max_tokens {
                        break;
                    }
                    used += cost;
                    start = idx;
                }
                &history[start..]
            }
        }
    }
}

/// One result of [`Memory::search`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryHit {
    pub memory_type: MemoryType,
    pub key: String,
    pub value: Value,
    pub score: f64,
}

/// Conversation history plus a keyed scratch store partitioned by lifetime class.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    entries: HashMap<MemoryType, BTreeMap<String, Value>>,
    conversation: ConversationMemory,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: impl Into<String>, value: Value, memory_type: MemoryType) {
        self.entries
            .entry(memory_type)
            .or_default()
            .insert(key.into(), value);
    }

    pub fn get(&self, key: &str, memory_type: MemoryType) -> Option<&Value> {
        self.entries.get(&memory_type).and_then(|m| m.get(key))
    }

    pub fn has(&self, key: &str, memory_type: MemoryType) -> bool {
        self.get(key, memory_type).is_some()
    }

    pub fn remove(&mut self, key: &str, memory_type: MemoryType) -> Option<Value> {
        self.entries
            .get_mut(&memory_type)
            .and_then(|m| m.remove(key))
    }

    /// Clears one lifetime class, leaving the others and the transcript intact.
    pub fn clear_type(&mut self, memory_type: MemoryType) {
        self.entries.remove(&memory_type);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.conversation.clear();
    }

    /// Drops the transcript only; keyed entries survive.
    pub fn clear_messages(&mut self) {
        self.conversation.clear();
    }

    pub fn add_message(&mut self, message: Message) {
        self.conversation.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        self.conversation.as_slice()
    }

    pub fn conversation(&self) -> &ConversationMemory {
        &self.conversation
    }

    /// Role-labelled transcript. Truncated with `...` once it exceeds `max_len` chars.
    pub fn conversation_summary(&self, max_len: usize) -> String {
        let mut summary = String::new();
        for message in self.conversation.iter() {
            summary.push_str(message.role.label());
            summary.push_str(": ");
            summary.push_str(&message.content);
            summary.push_str("\n\n");
        }
        if summary.chars().count() <= max_len {
            return summary;
        }
        let mut truncated: String = summary.chars().take(max_len.saturating_sub(3)).collect();
        truncated.push_str("...");
        truncated
    }

    /// Ranks entries by how many query terms appear in their key or value.
    pub fn search(
        &self,
        query: &str,
        memory_type: Option<MemoryType>,
        max_results: usize,
    ) -> Vec<MemoryHit> {
        let terms: HashSet<String> = tokenize(query).collect();
        if terms.is_empty() || max_results == 0 {
            return Vec::new();
        }

        let classes: Vec<MemoryType> = match memory_type {
            Some(class) => vec![class],
            None => MemoryType::ALL.to_vec(),
        };

        let mut hits: Vec<MemoryHit> = Vec::new();
        for class in classes {
            let Some(entries) = self.entries.get(&class) else {
                continue;
            };
            for (key, value) in entries {
                let haystack = match value {
                    Value::String(s) => format!("{key} {s}"),
                    other => format!("{key} {other}"),
                };
                let found: HashSet<String> = tokenize(&haystack).collect();
                let matched = terms.intersection(&found).count();
                if matched > 0 {
                    hits.push(MemoryHit {
                        memory_type: class,
                        key: key.clone(),
                        value: value.clone(),
                        score: matched as f64 / terms.len() as f64,
                    });
                }
            }
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        hits.truncate(max_results);
        hits
    }

    pub fn len(&self, memory_type: MemoryType) -> usize {
        self.entries.get(&memory_type).map_or(0, BTreeMap::len)
    }

    pub fn last_assistant_reply(&self) -> Option<&str> {
        self.conversation
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}
