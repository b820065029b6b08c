//! Discord adapter: Interactions-style webhook ingress (Ed25519-signed) plus
//! REST API egress.
//!
//! Thread ID codec: `discord:<channel>[:<message_thread>]`. Discord threads
//! are themselves channels, so the optional segment carries the thread
//! channel ID when a message lives inside one spun off its parent.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Deserialize;
use serde_json::json;

use crate::adapter::{Adapter, WaitUntil, WebhookRequest, WebhookResponse};
use crate::dispatcher::Dispatcher;
use crate::emoji::Emoji;
use crate::error::{Error, Result};
use crate::types::{
    Author, FetchDirection, FetchOptions, FetchResult, FormattedContent, IsBot, Message, MessageMetadata, Postable,
    ReactionEvent, SentMessage, ThreadInfo,
};

pub struct DiscordAdapter {
    http: reqwest::Client,
    bot_token: String,
    public_key: VerifyingKey,
    user_name: String,
    bot_user_id: Option<String>,
    kernel: OnceLock<Arc<Dispatcher>>,
}

impl DiscordAdapter {
    pub fn new(bot_token: impl Into<String>, public_key_hex: &str, user_name: impl Into<String>) -> Result<Self> {
        let key_bytes = hex::decode(public_key_hex).map_err(|e| Error::validation("discord", format!("invalid public key hex: {e}")))?;
        let key_array: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| Error::validation("discord", "public key must be 32 bytes"))?;
        let public_key = VerifyingKey::from_bytes(&key_array).map_err(|e| Error::validation("discord", e.to_string()))?;
        Ok(Self {
            http: reqwest::Client::new(),
            bot_token: bot_token.into(),
            public_key,
            user_name: user_name.into(),
            bot_user_id: None,
            kernel: OnceLock::new(),
        })
    }

    pub fn with_bot_user_id(mut self, id: impl Into<String>) -> Self {
        self.bot_user_id = Some(id.into());
        self
    }

    fn kernel(&self) -> Result<&Arc<Dispatcher>> {
        self.kernel.get().ok_or_else(|| Error::adapter("discord", "adapter not initialized"))
    }

    pub fn encode_thread_id(channel: &str, message_thread: Option<&str>) -> String {
        match message_thread {
            Some(thread) => format!("discord:{channel}:{thread}"),
            None => format!("discord:{channel}"),
        }
    }

    pub fn decode_thread_id(thread_id: &str) -> Result<(String, Option<String>)> {
        let rest = thread_id
            .strip_prefix("discord:")
            .ok_or_else(|| Error::validation("discord", "missing discord: prefix"))?;
        match rest.split_once(':') {
            Some((channel, thread)) => Ok((channel.to_string(), Some(thread.to_string()))),
            None => Ok((rest.to_string(), None)),
        }
    }

    /// The channel egress actually targets: the thread when one exists, else the parent channel.
    fn target_channel(channel: &str, message_thread: &Option<String>) -> String {
        message_thread.clone().unwrap_or_else(|| channel.to_string())
    }

    async fn api_call(&self, method: reqwest::Method, path: String, body: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let url = format!("https://discord.com/api/v10{path}");
        let mut req = self.http.request(method, url).header("Authorization", format!("Bot {}", self.bot_token));
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(|e| Error::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        if status == 204 {
            return Ok(serde_json::Value::Null);
        }
        if !(200..300).contains(&status) {
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok())
                .map(|secs| std::time::Duration::from_secs_f64(secs));
            return Err(Error::from_http_status("discord", status, retry_after));
        }
        resp.json().await.map_err(|e| Error::Network(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct DiscordMessagePayload {
    #[serde(default)]
    t: Option<String>,
    #[serde(default)]
    d: Option<serde_json::Value>,
}

fn mention_tags_to_username(text: &str, user_id: Option<&str>, user_name: &str) -> String {
    match user_id {
        Some(id) => text.replace(&format!("<@{id}>"), &format!("@{user_name}")).replace(&format!("<@!{id}>"), &format!("@{user_name}")),
        None => text.to_string(),
    }
}

#[async_trait]
impl Adapter for DiscordAdapter {
    fn name(&self) -> &str {
        "discord"
    }

    fn user_name(&self) -> &str {
        &self.user_name
    }

    fn bot_user_id(&self) -> Option<&str> {
        self.bot_user_id.as_deref()
    }

    async fn initialize(&self, kernel: Arc<Dispatcher>) -> Result<()> {
        self.kernel.set(kernel).map_err(|_| Error::adapter("discord", "already initialized"))
    }

    async fn handle_webhook(&self, request: WebhookRequest, wait_until: Option<WaitUntil>) -> Result<WebhookResponse> {
        let signature_hex = request.header("X-Signature-Ed25519").ok_or(Error::Authentication)?;
        let timestamp = request.header("X-Signature-Timestamp").ok_or(Error::Authentication)?;

        let sig_bytes = hex::decode(signature_hex).map_err(|_| Error::Authentication)?;
        let sig_array: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| Error::Authentication)?;
        let signature = Signature::from_bytes(&sig_array);

        let mut signed = timestamp.as_bytes().to_vec();
        signed.extend_from_slice(&request.body);
        self.public_key.verify(&signed, &signature).map_err(|_| Error::Authentication)?;

        let envelope: DiscordMessagePayload =
            serde_json::from_slice(&request.body).map_err(|e| Error::validation("discord", e.to_string()))?;

        // A `PING` (type 1) gateway check carries no `t`/`d` pair; Discord
        // expects a bare `{"type": 1}` PONG, distinct from the MESSAGE_CREATE
        // payload shape used for everything else.
        if envelope.t.is_none() {
            return Ok(WebhookResponse {
                status: 200,
                body: r#"{"type":1}"#.to_string(),
            });
        }

        let kernel = self.kernel()?.clone();

        match envelope.t.as_deref() {
            Some("MESSAGE_CREATE") => {
                let Some(data) = envelope.d else {
                    return Ok(WebhookResponse::ok());
                };
                let message = self.parse_message(data)?;
                kernel.process_message("discord", message, wait_until).await.or_else(|err| match err {
                    Error::Lock { .. } => Ok(()),
                    other => Err(other),
                })?;
            }
            Some("MESSAGE_REACTION_ADD") | Some("MESSAGE_REACTION_REMOVE") => {
                let Some(data) = envelope.d else {
                    return Ok(WebhookResponse::ok());
                };
                let channel = data.get("channel_id").and_then(|v| v.as_str()).unwrap_or_default();
                let thread_id = Self::encode_thread_id(channel, None);
                let user_id = data.get("user_id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let raw_name = data
                    .get("emoji")
                    .and_then(|e| e.get("name"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let reaction = ReactionEvent {
                    emoji: crate::emoji::registry().extend(&raw_name, None, None),
                    raw_emoji: raw_name,
                    added: envelope.t.as_deref() == Some("MESSAGE_REACTION_ADD"),
                    user: Author {
                        user_id: user_id.clone(),
                        user_name: user_id.clone(),
                        full_name: None,
                        is_bot: IsBot::Unknown,
                        is_me: self.bot_user_id() == Some(user_id.as_str()),
                    },
                    message_id: data.get("message_id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    thread_id,
                    adapter: "discord".into(),
                    raw: data,
                };
                kernel.process_reaction("discord", reaction, wait_until).await.or_else(|err| match err {
                    Error::Lock { .. } => Ok(()),
                    other => Err(other),
                })?;
            }
            _ => {}
        }

        Ok(WebhookResponse::ok())
    }

    async fn post_message(&self, thread_id: &str, postable: Postable) -> Result<SentMessage> {
        let (channel, thread) = Self::decode_thread_id(thread_id)?;
        let target = Self::target_channel(&channel, &thread);
        let text = render_postable(&postable);
        let resp = self
            .api_call(reqwest::Method::POST, format!("/channels/{target}/messages"), Some(json!({ "content": text })))
            .await?;
        let id = resp.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        Ok(SentMessage {
            id,
            thread_id: thread_id.to_string(),
            raw: resp,
        })
    }

    async fn edit_message(&self, thread_id: &str, message_id: &str, postable: Postable) -> Result<SentMessage> {
        let (channel, thread) = Self::decode_thread_id(thread_id)?;
        let target = Self::target_channel(&channel, &thread);
        let text = render_postable(&postable);
        let resp = self
            .api_call(
                reqwest::Method::PATCH,
                format!("/channels/{target}/messages/{message_id}"),
                Some(json!({ "content": text })),
            )
            .await?;
        Ok(SentMessage {
            id: message_id.to_string(),
            thread_id: thread_id.to_string(),
            raw: resp,
        })
    }

    async fn delete_message(&self, thread_id: &str, message_id: &str) -> Result<()> {
        let (channel, thread) = Self::decode_thread_id(thread_id)?;
        let target = Self::target_channel(&channel, &thread);
        self.api_call(reqwest::Method::DELETE, format!("/channels/{target}/messages/{message_id}"), None)
            .await?;
        Ok(())
    }

    async fn add_reaction(&self, thread_id: &str, message_id: &str, emoji: &Emoji) -> Result<()> {
        let (channel, thread) = Self::decode_thread_id(thread_id)?;
        let target = Self::target_channel(&channel, &thread);
        let encoded = urlencoding_emoji(emoji.name());
        self.api_call(
            reqwest::Method::PUT,
            format!("/channels/{target}/messages/{message_id}/reactions/{encoded}/@me"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn remove_reaction(&self, thread_id: &str, message_id: &str, emoji: &Emoji) -> Result<()> {
        let (channel, thread) = Self::decode_thread_id(thread_id)?;
        let target = Self::target_channel(&channel, &thread);
        let encoded = urlencoding_emoji(emoji.name());
        self.api_call(
            reqwest::Method::DELETE,
            format!("/channels/{target}/messages/{message_id}/reactions/{encoded}/@me"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn start_typing(&self, thread_id: &str) -> Result<()> {
        let (channel, thread) = Self::decode_thread_id(thread_id)?;
        let target = Self::target_channel(&channel, &thread);
        self.api_call(reqwest::Method::POST, format!("/channels/{target}/typing"), None).await?;
        Ok(())
    }

    async fn fetch_messages(&self, thread_id: &str, options: FetchOptions) -> Result<FetchResult> {
        let (channel, thread) = Self::decode_thread_id(thread_id)?;
        let target = Self::target_channel(&channel, &thread);
        let limit = options.limit.unwrap_or(50).min(100);
        let mut path = format!("/channels/{target}/messages?limit={limit}");
        if let Some(cursor) = &options.cursor {
            let param = if options.direction == Some(FetchDirection::Forward) { "after" } else { "before" };
            path.push_str(&format!("&{param}={cursor}"));
        }
        let resp = self.api_call(reqwest::Method::GET, path, None).await?;
        let mut messages: Vec<Message> = resp
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|raw| discord_message_from_json(raw, &channel, thread.as_deref()))
            .collect();
        let next_cursor = messages.last().map(|m| m.id.clone());
        if options.direction == Some(FetchDirection::Forward) {
            messages.reverse();
        }
        Ok(FetchResult { messages, next_cursor })
    }

    async fn fetch_thread(&self, thread_id: &str) -> Result<ThreadInfo> {
        let (channel, thread) = Self::decode_thread_id(thread_id)?;
        let target = Self::target_channel(&channel, &thread);
        let resp = self.api_call(reqwest::Method::GET, format!("/channels/{target}"), None).await?;
        let channel_type = resp.get("type").and_then(|v| v.as_i64()).unwrap_or(0);
        Ok(ThreadInfo {
            channel_id: channel,
            display_name: resp.get("name").and_then(|v| v.as_str()).map(str::to_string),
            is_dm: channel_type == 1,
        })
    }

    fn parse_message(&self, raw: serde_json::Value) -> Result<Message> {
        let channel = raw.get("channel_id").and_then(|v| v.as_str()).unwrap_or_default();
        discord_message_from_json(&raw, channel, None)
            .map(|mut m| {
                if let Some(author_id) = m.raw.get("author").and_then(|a| a.get("id")).and_then(|v| v.as_str()) {
                    m.author.is_me = self.bot_user_id() == Some(author_id);
                }
                m.text = mention_tags_to_username(&m.text, self.bot_user_id(), &self.user_name);
                m
            })
            .ok_or_else(|| Error::validation("discord", "malformed raw message"))
    }

    fn render_formatted(&self, content: &FormattedContent) -> String {
        content.as_str().to_string()
    }

    fn is_dm(&self, thread_id: &str) -> bool {
        Self::decode_thread_id(thread_id).is_ok_and(|(channel, _)| channel.starts_with("dm-"))
    }

    fn render_mention(&self, user_id: &str) -> String {
        format!("<@{user_id}>")
    }
}

fn render_postable(postable: &Postable) -> String {
    match postable {
        Postable::Raw(s) => s.clone(),
        Postable::Markdown(s) => s.clone(),
        Postable::Ast(ast) => ast.as_str().to_string(),
        Postable::Card { fallback_text, .. } => fallback_text.clone().unwrap_or_default(),
        Postable::WithFiles { postable, .. } => render_postable(postable),
    }
}

fn urlencoding_emoji(name: &str) -> String {
    name.replace(':', "%3A")
}

fn discord_message_from_json(raw: &serde_json::Value, channel: &str, thread: Option<&str>) -> Option<Message> {
    let id = raw.get("id")?.as_str()?.to_string();
    let text = raw.get("content").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let author = raw.get("author")?;
    let user_id = author.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let username = author.get("username").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let is_bot = author.get("bot").and_then(|v| v.as_bool()).unwrap_or(false);
    Some(Message {
        id: id.clone(),
        thread_id: DiscordAdapter::encode_thread_id(channel, thread),
        text: text.clone(),
        formatted: FormattedContent::markdown(text),
        raw: raw.clone(),
        author: Author {
            user_id,
            user_name: username.clone(),
            full_name: Some(username),
            is_bot: if is_bot { IsBot::True } else { IsBot::False },
            is_me: false,
        },
        metadata: MessageMetadata {
            date_sent: raw
                .get("timestamp")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(chrono::Utc::now),
            edited: raw.get("edited_timestamp").is_some_and(|v| !v.is_null()),
            edited_at: None,
        },
        attachments: vec![],
        is_mention: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_round_trip_channel_only() {
        let encoded = DiscordAdapter::encode_thread_id("123", None);
        let (channel, thread) = DiscordAdapter::decode_thread_id(&encoded).unwrap();
        assert_eq!(channel, "123");
        assert_eq!(thread, None);
    }

    #[test]
    fn thread_id_round_trip_with_thread() {
        let encoded = DiscordAdapter::encode_thread_id("123", Some("456"));
        let (channel, thread) = DiscordAdapter::decode_thread_id(&encoded).unwrap();
        assert_eq!(channel, "123");
        assert_eq!(thread.as_deref(), Some("456"));
    }

    #[test]
    fn mention_rewrite_targets_bot_id() {
        let text = mention_tags_to_username("hey <@42> look", Some("42"), "bot");
        assert_eq!(text, "hey @bot look");
    }
}
