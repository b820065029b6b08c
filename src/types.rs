//! Normalized data model shared across every adapter.
//!
//! Thread IDs are opaque, adapter-owned strings of the form
//! `<adapter-name>:<adapter-defined-suffix>`. The kernel never parses past the
//! prefix; adapters own their own codec as inherent methods on the concrete
//! adapter type (see `src/adapters/*.rs`), not through the `Adapter` trait
//! object, since each platform's decoded representation differs.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::emoji::Emoji;
use crate::error::Result;

pub type ThreadId = String;

/// Whether an author is known to be a bot. Platforms that cannot tell report `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsBot {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub user_id: String,
    pub user_name: String,
    pub full_name: Option<String>,
    pub is_bot: IsBot,
    /// Set by the adapter when the event originates from this bot instance.
    pub is_me: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub date_sent: DateTime<Utc>,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
}

/// A platform-neutral document the kernel passes through without inspection.
///
/// Represented as raw Markdown source text rather than a full AST: the kernel
/// never reads it, and adapters are free to parse it however their wire
/// format needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormattedContent(pub String);

impl FormattedContent {
    pub fn markdown(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FormattedContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentType {
    Image,
    File,
    Video,
    Audio,
}

/// A one-shot byte supplier for gated downloads. Not serializable; attachments
/// carried across a wire boundary (e.g. webhook replay in tests) simply omit it.
pub type FetchData = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

#[derive(Clone)]
pub struct Attachment {
    pub kind: AttachmentType,
    pub url: Option<String>,
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fetch_data: Option<FetchData>,
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("name", &self.name)
            .field("mime_type", &self.mime_type)
            .field("size", &self.size)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("fetch_data", &self.fetch_data.is_some())
            .finish()
    }
}

/// A normalized inbound message. Value object; the kernel never mutates one
/// in place except to set `is_mention` after mention detection.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub thread_id: ThreadId,
    pub text: String,
    pub formatted: FormattedContent,
    pub raw: serde_json::Value,
    pub author: Author,
    pub metadata: MessageMetadata,
    pub attachments: Vec<Attachment>,
    pub is_mention: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct ReactionEvent {
    pub emoji: Emoji,
    pub raw_emoji: String,
    pub added: bool,
    pub user: Author,
    pub message_id: String,
    pub thread_id: ThreadId,
    pub adapter: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ActionEvent {
    pub action_id: String,
    pub value: Option<String>,
    pub user: Author,
    pub message_id: String,
    pub thread_id: ThreadId,
    pub adapter: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ThreadInfo {
    pub channel_id: String,
    pub display_name: Option<String>,
    pub is_dm: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonStyle {
    Default,
    Primary,
    Danger,
}

#[derive(Debug, Clone)]
pub struct Button {
    pub action_id: String,
    pub label: String,
    pub style: ButtonStyle,
    pub value: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SelectOption {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone)]
pub struct SelectMenu {
    pub action_id: String,
    pub placeholder: Option<String>,
    pub options: Vec<SelectOption>,
}

#[derive(Debug, Clone, Default)]
pub struct InteractiveElements {
    pub buttons: Vec<Button>,
    pub selects: Vec<SelectMenu>,
}

#[derive(Debug, Clone)]
pub struct CardField {
    pub name: String,
    pub value: String,
}

/// Minimal card shape carried opaquely to adapters; per-platform renderers
/// (Block Kit, Adaptive Cards, GChat Cards v2) are out of scope.
#[derive(Debug, Clone, Default)]
pub struct Card {
    pub title: Option<String>,
    pub text: Option<String>,
    pub fields: Vec<CardField>,
    pub interactive: InteractiveElements,
}

/// Any payload accepted by `Thread::post`.
#[derive(Debug, Clone)]
pub enum Postable {
    Raw(String),
    Markdown(String),
    Ast(FormattedContent),
    Card {
        card: Card,
        fallback_text: Option<String>,
    },
    WithFiles {
        postable: Box<Postable>,
        files: Vec<Attachment>,
    },
}

impl From<&str> for Postable {
    fn from(s: &str) -> Self {
        Postable::Raw(s.to_string())
    }
}

impl From<String> for Postable {
    fn from(s: String) -> Self {
        Postable::Raw(s)
    }
}

/// A message the kernel has already sent; exposes the IDs handler code needs
/// to manipulate it further without re-deriving them.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub id: String,
    pub thread_id: ThreadId,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDirection {
    Forward,
    Backward,
}

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub limit: Option<usize>,
    pub cursor: Option<String>,
    pub direction: Option<FetchDirection>,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub messages: Vec<Message>,
    pub next_cursor: Option<String>,
}
