//! Slack adapter: HTTP Events API ingress, Web API egress.
//!
//! Thread ID codec: `slack:<channel>:<ts>`. `ts` is Slack's message
//! timestamp, which also serves as a thread root when a reply sets
//! `thread_ts` equal to it; conversations without a thread use the message's
//! own `ts`, consistent with how the source records thread roots.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::adapter::{Adapter, WaitUntil, WebhookRequest, WebhookResponse};
use crate::dispatcher::Dispatcher;
use crate::emoji::{self, Emoji};
use crate::error::{Error, Result};
use crate::types::{
    Attachment, AttachmentType, Author, FetchDirection, FetchOptions, FetchResult, FormattedContent, IsBot, Message,
    MessageMetadata, Postable, ReactionEvent, SentMessage, ThreadInfo,
};

use super::support::{check_replay_window, verify_hmac_sha256_hex};

pub struct SlackAdapter {
    http: reqwest::Client,
    bot_token: String,
    signing_secret: String,
    user_name: String,
    bot_user_id: Option<String>,
    kernel: OnceLock<Arc<Dispatcher>>,
}

impl SlackAdapter {
    pub fn new(bot_token: impl Into<String>, signing_secret: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token: bot_token.into(),
            signing_secret: signing_secret.into(),
            user_name: user_name.into(),
            bot_user_id: None,
            kernel: OnceLock::new(),
        }
    }

    pub fn with_bot_user_id(mut self, id: impl Into<String>) -> Self {
        self.bot_user_id = Some(id.into());
        self
    }

    fn kernel(&self) -> Result<&Arc<Dispatcher>> {
        self.kernel.get().ok_or_else(|| Error::adapter("slack", "adapter not initialized"))
    }

    pub fn encode_thread_id(channel: &str, ts: &str) -> String {
        format!("slack:{channel}:{ts}")
    }

    pub fn decode_thread_id(thread_id: &str) -> Result<(String, String)> {
        let rest = thread_id
            .strip_prefix("slack:")
            .ok_or_else(|| Error::validation("slack", "missing slack: prefix"))?;
        let (channel, ts) = rest
            .split_once(':')
            .ok_or_else(|| Error::validation("slack", "expected <channel>:<ts>"))?;
        Ok((channel.to_string(), ts.to_string()))
    }

    async fn api_call(&self, method: &str, body: serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .http
            .post(format!("https://slack.com/api/{method}"))
            .bearer_auth(&self.bot_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(Error::from_http_status("slack", status, None));
        }
        let value: serde_json::Value = resp.json().await.map_err(|e| Error::Network(e.to_string()))?;
        if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
            let err = value.get("error").and_then(|v| v.as_str()).unwrap_or("unknown_error");
            return Err(Error::adapter("slack", err));
        }
        Ok(value)
    }
}

#[derive(Debug, Deserialize)]
struct SlackEnvelope {
    #[serde(default)]
    r#type: String,
    #[serde(default)]
    challenge: Option<String>,
    #[serde(default)]
    event: Option<SlackEvent>,
}

#[derive(Debug, Deserialize)]
struct SlackEvent {
    #[serde(default)]
    r#type: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
    #[serde(default)]
    thread_ts: Option<String>,
    #[serde(default)]
    subtype: Option<String>,
    #[serde(default)]
    reaction: Option<String>,
    #[serde(default)]
    item: Option<SlackReactionItem>,
}

#[derive(Debug, Deserialize)]
struct SlackReactionItem {
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

fn mention_syntax_to_username(text: &str, user_name: &str) -> String {
    // `<@U123>` has no display name in the payload alone; the kernel's mention
    // regex matches on `@<userName>` literally, so self-mentions of this bot
    // are rewritten using the configured handle. Other user mentions are left
    // as Slack's raw `<@Uxxx>` form — out of scope for normalization here.
    text.replace(&format!("<@{user_name}>"), &format!("@{user_name}"))
}

#[async_trait]
impl Adapter for SlackAdapter {
    fn name(&self) -> &str {
        "slack"
    }

    fn user_name(&self) -> &str {
        &self.user_name
    }

    fn bot_user_id(&self) -> Option<&str> {
        self.bot_user_id.as_deref()
    }

    async fn initialize(&self, kernel: Arc<Dispatcher>) -> Result<()> {
        self.kernel.set(kernel).map_err(|_| Error::adapter("slack", "already initialized"))
    }

    async fn handle_webhook(&self, request: WebhookRequest, wait_until: Option<WaitUntil>) -> Result<WebhookResponse> {
        let timestamp: i64 = request
            .header("X-Slack-Request-Timestamp")
            .and_then(|v| v.parse().ok())
            .ok_or(Error::Authentication)?;
        check_replay_window(timestamp)?;

        let provided_sig = request.header("X-Slack-Signature").ok_or(Error::Authentication)?;
        let signed_payload = format!("v0:{timestamp}:{}", String::from_utf8_lossy(&request.body));
        if !verify_hmac_sha256_hex(
            self.signing_secret.as_bytes(),
            signed_payload.as_bytes(),
            provided_sig.trim_start_matches("v0="),
        ) {
            return Ok(WebhookResponse::unauthorized());
        }

        let envelope: SlackEnvelope =
            serde_json::from_slice(&request.body).map_err(|e| Error::validation("slack", e.to_string()))?;

        if envelope.r#type == "url_verification" {
            return Ok(WebhookResponse {
                status: 200,
                body: envelope.challenge.unwrap_or_default(),
            });
        }

        let Some(event) = envelope.event else {
            return Ok(WebhookResponse::ok());
        };

        let kernel = self.kernel()?.clone();

        match event.r#type.as_str() {
            "message" | "app_mention" => {
                if event.subtype.is_some() {
                    return Ok(WebhookResponse::ok());
                }
                let channel = event.channel.clone().unwrap_or_default();
                let ts = event.ts.clone().unwrap_or_default();
                let thread_id = Self::encode_thread_id(&channel, event.thread_ts.as_deref().unwrap_or(&ts));
                let user_id = event.user.clone().unwrap_or_default();
                let is_me = self.bot_user_id() == Some(user_id.as_str());
                let raw_text = event.text.clone().unwrap_or_default();
                let text = mention_syntax_to_username(&raw_text, &self.user_name);

                let message = Message {
                    id: ts.clone(),
                    thread_id,
                    text: text.clone(),
                    formatted: FormattedContent::markdown(text),
                    raw: serde_json::to_value(&event).unwrap_or_default(),
                    author: Author {
                        user_id: user_id.clone(),
                        user_name: user_id,
                        full_name: None,
                        is_bot: if event.bot_id.is_some() { IsBot::True } else { IsBot::False },
                        is_me,
                    },
                    metadata: MessageMetadata {
                        date_sent: slack_ts_to_datetime(&ts),
                        edited: false,
                        edited_at: None,
                    },
                    attachments: vec![],
                    is_mention: None,
                };
                kernel.process_message("slack", message, wait_until).await.or_else(|err| match err {
                    Error::Lock { .. } => Ok(()),
                    other => Err(other),
                })?;
            }
            "reaction_added" | "reaction_removed" => {
                let Some(item) = event.item else {
                    return Ok(WebhookResponse::ok());
                };
                let channel = item.channel.unwrap_or_default();
                let ts = item.ts.unwrap_or_default();
                let thread_id = Self::encode_thread_id(&channel, &ts);
                let raw_emoji = event.reaction.clone().unwrap_or_default();
                let user_id = event.user.clone().unwrap_or_default();
                let is_me = self.bot_user_id() == Some(user_id.as_str());
                let reaction = ReactionEvent {
                    emoji: emoji::registry().from_slack(&raw_emoji),
                    raw_emoji,
                    added: event.r#type == "reaction_added",
                    user: Author {
                        user_id: user_id.clone(),
                        user_name: user_id,
                        full_name: None,
                        is_bot: IsBot::Unknown,
                        is_me,
                    },
                    message_id: ts,
                    thread_id,
                    adapter: "slack".into(),
                    raw: serde_json::Value::Null,
                };
                kernel.process_reaction("slack", reaction, wait_until).await.or_else(|err| match err {
                    Error::Lock { .. } => Ok(()),
                    other => Err(other),
                })?;
            }
            _ => {}
        }

        Ok(WebhookResponse::ok())
    }

    async fn post_message(&self, thread_id: &str, postable: Postable) -> Result<SentMessage> {
        let (channel, ts) = Self::decode_thread_id(thread_id)?;
        let text = render_postable(self, &postable);
        let resp = self
            .api_call(
                "chat.postMessage",
                json!({ "channel": channel, "text": text, "thread_ts": ts }),
            )
            .await?;
        let sent_ts = resp.get("ts").and_then(|v| v.as_str()).unwrap_or(&ts).to_string();
        Ok(SentMessage {
            id: sent_ts,
            thread_id: thread_id.to_string(),
            raw: resp,
        })
    }

    async fn edit_message(&self, thread_id: &str, message_id: &str, postable: Postable) -> Result<SentMessage> {
        let (channel, _) = Self::decode_thread_id(thread_id)?;
        let text = render_postable(self, &postable);
        let resp = self
            .api_call("chat.update", json!({ "channel": channel, "ts": message_id, "text": text }))
            .await?;
        Ok(SentMessage {
            id: message_id.to_string(),
            thread_id: thread_id.to_string(),
            raw: resp,
        })
    }

    async fn delete_message(&self, thread_id: &str, message_id: &str) -> Result<()> {
        let (channel, _) = Self::decode_thread_id(thread_id)?;
        self.api_call("chat.delete", json!({ "channel": channel, "ts": message_id })).await?;
        Ok(())
    }

    async fn add_reaction(&self, thread_id: &str, message_id: &str, emoji: &Emoji) -> Result<()> {
        let (channel, _) = Self::decode_thread_id(thread_id)?;
        let name = emoji::registry().to_slack(emoji);
        self.api_call("reactions.add", json!({ "channel": channel, "timestamp": message_id, "name": name }))
            .await?;
        Ok(())
    }

    async fn remove_reaction(&self, thread_id: &str, message_id: &str, emoji: &Emoji) -> Result<()> {
        let (channel, _) = Self::decode_thread_id(thread_id)?;
        let name = emoji::registry().to_slack(emoji);
        self.api_call(
            "reactions.remove",
            json!({ "channel": channel, "timestamp": message_id, "name": name }),
        )
        .await?;
        Ok(())
    }

    async fn start_typing(&self, _thread_id: &str) -> Result<()> {
        Err(Error::not_implemented("slack typing indicator"))
    }

    async fn fetch_messages(&self, thread_id: &str, options: FetchOptions) -> Result<FetchResult> {
        let (channel, ts) = Self::decode_thread_id(thread_id)?;
        let limit = options.limit.unwrap_or(100).min(1000);
        let mut body = json!({ "channel": channel, "ts": ts, "limit": limit });
        if let Some(cursor) = &options.cursor {
            body["cursor"] = json!(cursor);
        }
        let resp = self.api_call("conversations.replies", body).await?;
        let mut messages: Vec<Message> = resp
            .get("messages")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|raw| slack_message_from_json(raw, &channel))
            .collect();
        if options.direction == Some(FetchDirection::Backward) {
            messages.reverse();
        }
        Ok(FetchResult {
            messages,
            next_cursor: resp
                .get("response_metadata")
                .and_then(|m| m.get("next_cursor"))
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(str::to_string),
        })
    }

    async fn fetch_thread(&self, thread_id: &str) -> Result<ThreadInfo> {
        let (channel, _) = Self::decode_thread_id(thread_id)?;
        let resp = self.api_call("conversations.info", json!({ "channel": channel })).await?;
        let info = resp.get("channel").cloned().unwrap_or_default();
        Ok(ThreadInfo {
            channel_id: channel,
            display_name: info.get("name").and_then(|v| v.as_str()).map(str::to_string),
            is_dm: info.get("is_im").and_then(|v| v.as_bool()).unwrap_or(false),
        })
    }

    fn parse_message(&self, raw: serde_json::Value) -> Result<Message> {
        let channel = raw.get("channel").and_then(|v| v.as_str()).unwrap_or_default();
        slack_message_from_json(&raw, channel).ok_or_else(|| Error::validation("slack", "malformed raw message"))
    }

    fn render_formatted(&self, content: &FormattedContent) -> String {
        content.as_str().to_string()
    }

    fn is_dm(&self, thread_id: &str) -> bool {
        Self::decode_thread_id(thread_id).is_ok_and(|(channel, _)| channel.starts_with('D'))
    }

    async fn open_dm(&self, user_id: &str) -> Result<String> {
        let resp = self.api_call("conversations.open", json!({ "users": [user_id] })).await?;
        let channel = resp
            .get("channel")
            .and_then(|c| c.get("id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::adapter("slack", "conversations.open returned no channel id"))?;
        Ok(Self::encode_thread_id(channel, "0"))
    }

    fn render_mention(&self, user_id: &str) -> String {
        format!("<@{user_id}>")
    }
}

fn render_postable(adapter: &SlackAdapter, postable: &Postable) -> String {
    match postable {
        Postable::Raw(s) => s.clone(),
        Postable::Markdown(s) => s.clone(),
        Postable::Ast(ast) => adapter.render_formatted(ast),
        Postable::Card { fallback_text, .. } => fallback_text.clone().unwrap_or_default(),
        Postable::WithFiles { postable, .. } => render_postable(adapter, postable),
    }
}

fn slack_message_from_json(raw: &serde_json::Value, channel: &str) -> Option<Message> {
    let ts = raw.get("ts")?.as_str()?.to_string();
    let text = raw.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let user = raw.get("user").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let thread_ts = raw.get("thread_ts").and_then(|v| v.as_str()).unwrap_or(&ts);
    let attachments = raw
        .get("files")
        .and_then(|v| v.as_array())
        .into_iter()
        .flatten()
        .filter_map(slack_file_to_attachment)
        .collect();
    Some(Message {
        id: ts.clone(),
        thread_id: SlackAdapter::encode_thread_id(channel, thread_ts),
        text: text.clone(),
        formatted: FormattedContent::markdown(text),
        raw: raw.clone(),
        author: Author {
            user_id: user.clone(),
            user_name: user,
            full_name: None,
            is_bot: if raw.get("bot_id").is_some() { IsBot::True } else { IsBot::False },
            is_me: false,
        },
        metadata: MessageMetadata {
            date_sent: slack_ts_to_datetime(&ts),
            edited: raw.get("edited").is_some(),
            edited_at: None,
        },
        attachments,
        is_mention: None,
    })
}

fn slack_file_to_attachment(raw: &serde_json::Value) -> Option<Attachment> {
    Some(Attachment {
        kind: AttachmentType::File,
        url: raw.get("url_private").and_then(|v| v.as_str()).map(str::to_string),
        name: raw.get("name").and_then(|v| v.as_str()).map(str::to_string),
        mime_type: raw.get("mimetype").and_then(|v| v.as_str()).map(str::to_string),
        size: raw.get("size").and_then(|v| v.as_u64()),
        width: None,
        height: None,
        fetch_data: None,
    })
}

fn slack_ts_to_datetime(ts: &str) -> chrono::DateTime<chrono::Utc> {
    let secs: f64 = ts.parse().unwrap_or(0.0);
    chrono::DateTime::from_timestamp(secs as i64, ((secs.fract()) * 1e9) as u32).unwrap_or_else(chrono::Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_round_trip() {
        let encoded = SlackAdapter::encode_thread_id("C123", "1690000000.000100");
        let (channel, ts) = SlackAdapter::decode_thread_id(&encoded).unwrap();
        assert_eq!(channel, "C123");
        assert_eq!(ts, "1690000000.000100");
    }

    #[test]
    fn decode_rejects_missing_prefix() {
        assert!(SlackAdapter::decode_thread_id("teams:abc:def").is_err());
    }

    #[test]
    fn mention_rewrite_targets_configured_bot() {
        let text = mention_syntax_to_username("hey <@bot> look", "bot");
        assert_eq!(text, "hey @bot look");
    }
}
