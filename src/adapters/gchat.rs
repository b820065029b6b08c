//! Google Chat adapter: Chat REST API ingress/egress via Pub/Sub-delivered
//! or direct HTTP webhook events.
//!
//! Thread ID codec: `gchat:<space>[:<base64url(threadName)>][:dm]`. Space
//! DMs have no thread concept distinct from the space itself, so the `:dm`
//! suffix marks them instead of a thread segment.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::adapter::{Adapter, JwtVerifier, PermissiveJwtVerifier, WaitUntil, WebhookRequest, WebhookResponse};
use crate::dispatcher::Dispatcher;
use crate::emoji::Emoji;
use crate::error::{Error, Result};
use crate::types::{
    Author, FetchOptions, FetchResult, FormattedContent, IsBot, Message, MessageMetadata, Postable, SentMessage,
    ThreadInfo,
};

use super::support::{b64url_decode, b64url_encode};

pub struct GoogleChatAdapter {
    http: reqwest::Client,
    service_account_token: String,
    user_name: String,
    bot_user_id: Option<String>,
    verifier: Arc<dyn JwtVerifier>,
    kernel: OnceLock<Arc<Dispatcher>>,
}

impl GoogleChatAdapter {
    pub fn new(service_account_token: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            service_account_token: service_account_token.into(),
            user_name: user_name.into(),
            bot_user_id: None,
            verifier: Arc::new(PermissiveJwtVerifier),
            kernel: OnceLock::new(),
        }
    }

    pub fn with_bot_user_id(mut self, id: impl Into<String>) -> Self {
        self.bot_user_id = Some(id.into());
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn JwtVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    fn kernel(&self) -> Result<&Arc<Dispatcher>> {
        self.kernel.get().ok_or_else(|| Error::adapter("gchat", "adapter not initialized"))
    }

    pub fn encode_thread_id(space: &str, thread_name: Option<&str>, is_dm: bool) -> String {
        let mut out = format!("gchat:{space}");
        if let Some(thread_name) = thread_name {
            out.push(':');
            out.push_str(&b64url_encode(thread_name));
        }
        if is_dm {
            out.push_str(":dm");
        }
        out
    }

    pub fn decode_thread_id(thread_id: &str) -> Result<(String, Option<String>, bool)> {
        let rest = thread_id
            .strip_prefix("gchat:")
            .ok_or_else(|| Error::validation("gchat", "missing gchat: prefix"))?;
        let mut parts: Vec<&str> = rest.split(':').collect();
        let is_dm = parts.last() == Some(&"dm");
        if is_dm {
            parts.pop();
        }
        let space = parts
            .first()
            .ok_or_else(|| Error::validation("gchat", "missing space"))?
            .to_string();
        let thread_name = match parts.get(1) {
            Some(encoded) => Some(String::from_utf8(b64url_decode(encoded)?).map_err(|_| Error::validation("gchat", "invalid utf8"))?),
            None => None,
        };
        Ok((space, thread_name, is_dm))
    }

    async fn api_call(&self, method: reqwest::Method, url: String, body: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let mut req = self.http.request(method, url).bearer_auth(&self.service_account_token);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(|e| Error::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(Error::from_http_status("gchat", status, None));
        }
        resp.json().await.map_err(|e| Error::Network(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct GChatEvent {
    #[serde(default)]
    r#type: String,
    #[serde(default)]
    message: Option<GChatMessage>,
    #[serde(default)]
    space: Option<GChatSpace>,
}

#[derive(Debug, Deserialize)]
struct GChatMessage {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    sender: Option<GChatUser>,
    #[serde(default)]
    thread: Option<GChatThread>,
}

#[derive(Debug, Deserialize)]
struct GChatThread {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GChatUser {
    name: String,
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GChatSpace {
    name: String,
    #[serde(rename = "type", default)]
    space_type: Option<String>,
}

fn strip_mention_tags(text: &str) -> String {
    // `<users/123456789>` marks a mention inline; rewritten to a bare `@id`
    // since display names aren't carried in the mention markup itself.
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("<users/") {
        out.push_str(&rest[..open]);
        rest = &rest[open + 1..];
        if let Some(close) = rest.find('>') {
            out.push('@');
            out.push_str(&rest[..close]);
            rest = &rest[close + 1..];
        } else {
            out.push('<');
            break;
        }
    }
    out.push_str(rest);
    out
}

#[async_trait]
impl Adapter for GoogleChatAdapter {
    fn name(&self) -> &str {
        "gchat"
    }

    fn user_name(&self) -> &str {
        &self.user_name
    }

    fn bot_user_id(&self) -> Option<&str> {
        self.bot_user_id.as_deref()
    }

    async fn initialize(&self, kernel: Arc<Dispatcher>) -> Result<()> {
        self.kernel.set(kernel).map_err(|_| Error::adapter("gchat", "already initialized"))
    }

    async fn handle_webhook(&self, request: WebhookRequest, wait_until: Option<WaitUntil>) -> Result<WebhookResponse> {
        let auth_header = request.header("Authorization").ok_or(Error::Authentication)?;
        let token = auth_header.strip_prefix("Bearer ").ok_or(Error::Authentication)?;
        self.verifier.verify(token)?;

        let event: GChatEvent =
            serde_json::from_slice(&request.body).map_err(|e| Error::validation("gchat", e.to_string()))?;

        if event.r#type != "MESSAGE" {
            return Ok(WebhookResponse::ok());
        }

        let Some(gmessage) = event.message else {
            return Ok(WebhookResponse::ok());
        };
        let Some(space) = event.space else {
            return Ok(WebhookResponse::bad_request("missing space"));
        };
        let is_dm = space.space_type.as_deref() == Some("DM");
        let thread_name = gmessage.thread.as_ref().and_then(|t| t.name.as_deref());
        let thread_id = Self::encode_thread_id(&space.name, thread_name, is_dm);
        let sender = gmessage.sender.unwrap_or(GChatUser { name: String::new(), display_name: None });
        let is_me = self.bot_user_id() == Some(sender.name.as_str());
        let raw_text = gmessage.text.clone().unwrap_or_default();
        let text = strip_mention_tags(&raw_text);

        let message = Message {
            id: gmessage.name.clone().unwrap_or_default(),
            thread_id,
            text: text.clone(),
            formatted: FormattedContent::markdown(text),
            raw: serde_json::to_value(&event).unwrap_or_default(),
            author: Author {
                user_id: sender.name,
                user_name: sender.display_name.clone().unwrap_or_default(),
                full_name: sender.display_name,
                is_bot: IsBot::Unknown,
                is_me,
            },
            metadata: MessageMetadata {
                date_sent: chrono::Utc::now(),
                edited: false,
                edited_at: None,
            },
            attachments: vec![],
            is_mention: None,
        };

        let kernel = self.kernel()?.clone();
        kernel.process_message("gchat", message, wait_until).await.or_else(|err| match err {
            Error::Lock { .. } => Ok(()),
            other => Err(other),
        })?;

        Ok(WebhookResponse::ok())
    }

    async fn post_message(&self, thread_id: &str, postable: Postable) -> Result<SentMessage> {
        let (space, thread_name, _) = Self::decode_thread_id(thread_id)?;
        let text = render_postable(&postable);
        let url = format!("https://chat.googleapis.com/v1/{space}/messages");
        let mut body = json!({ "text": text });
        if let Some(thread_name) = &thread_name {
            body["thread"] = json!({ "name": thread_name });
        }
        let resp = self.api_call(reqwest::Method::POST, url, Some(body)).await?;
        let id = resp.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        Ok(SentMessage {
            id,
            thread_id: thread_id.to_string(),
            raw: resp,
        })
    }

    async fn edit_message(&self, thread_id: &str, message_id: &str, postable: Postable) -> Result<SentMessage> {
        let text = render_postable(&postable);
        let url = format!("https://chat.googleapis.com/v1/{message_id}?updateMask=text");
        let resp = self.api_call(reqwest::Method::PUT, url, Some(json!({ "text": text }))).await?;
        Ok(SentMessage {
            id: message_id.to_string(),
            thread_id: thread_id.to_string(),
            raw: resp,
        })
    }

    async fn delete_message(&self, _thread_id: &str, message_id: &str) -> Result<()> {
        let url = format!("https://chat.googleapis.com/v1/{message_id}");
        self.api_call(reqwest::Method::DELETE, url, None).await?;
        Ok(())
    }

    async fn add_reaction(&self, _thread_id: &str, message_id: &str, emoji: &Emoji) -> Result<()> {
        let url = format!("https://chat.googleapis.com/v1/{message_id}/reactions");
        let unicode = crate::emoji::registry().to_gchat(emoji);
        self.api_call(reqwest::Method::POST, url, Some(json!({ "emoji": { "unicode": unicode } })))
            .await?;
        Ok(())
    }

    async fn remove_reaction(&self, _thread_id: &str, message_id: &str, emoji: &Emoji) -> Result<()> {
        let unicode = crate::emoji::registry().to_gchat(emoji);
        let url = format!("https://chat.googleapis.com/v1/{message_id}/reactions?filter=emoji.unicode%3D\"{unicode}\"");
        self.api_call(reqwest::Method::DELETE, url, None).await?;
        Ok(())
    }

    async fn start_typing(&self, _thread_id: &str) -> Result<()> {
        Err(Error::not_implemented("gchat typing indicator"))
    }

    async fn fetch_messages(&self, thread_id: &str, options: FetchOptions) -> Result<FetchResult> {
        let (space, thread_name, _) = Self::decode_thread_id(thread_id)?;
        let mut url = format!("https://chat.googleapis.com/v1/{space}/messages?pageSize={}", options.limit.unwrap_or(25));
        if let Some(cursor) = &options.cursor {
            url.push_str(&format!("&pageToken={cursor}"));
        }
        if let Some(thread_name) = &thread_name {
            url.push_str(&format!("&filter=thread.name%3D\"{thread_name}\""));
        }
        let resp = self.api_call(reqwest::Method::GET, url, None).await?;
        let messages = resp
            .get("messages")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|raw| gchat_message_from_json(raw, &space))
            .collect();
        Ok(FetchResult {
            messages,
            next_cursor: resp.get("nextPageToken").and_then(|v| v.as_str()).map(str::to_string),
        })
    }

    async fn fetch_thread(&self, thread_id: &str) -> Result<ThreadInfo> {
        let (space, _, is_dm) = Self::decode_thread_id(thread_id)?;
        let url = format!("https://chat.googleapis.com/v1/{space}");
        let resp = self.api_call(reqwest::Method::GET, url, None).await?;
        Ok(ThreadInfo {
            channel_id: space,
            display_name: resp.get("displayName").and_then(|v| v.as_str()).map(str::to_string),
            is_dm,
        })
    }

    fn parse_message(&self, raw: serde_json::Value) -> Result<Message> {
        let space_name = raw
            .get("space")
            .and_then(|s| s.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        gchat_message_from_json(&raw, &space_name).ok_or_else(|| Error::validation("gchat", "malformed raw message"))
    }

    fn render_formatted(&self, content: &FormattedContent) -> String {
        content.as_str().to_string()
    }

    fn is_dm(&self, thread_id: &str) -> bool {
        Self::decode_thread_id(thread_id).map(|(_, _, is_dm)| is_dm).unwrap_or(false)
    }

    fn render_mention(&self, user_id: &str) -> String {
        format!("<users/{user_id}>")
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

fn gchat_message_from_json(raw: &serde_json::Value, space: &str) -> Option<Message> {
    let name = raw.get("name")?.as_str()?.to_string();
    let text = raw.get("text").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let sender = raw.get("sender");
    let user_id = sender.and_then(|s| s.get("name")).and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let display_name = sender.and_then(|s| s.get("displayName")).and_then(|v| v.as_str()).map(str::to_string);
    let thread_name = raw.get("thread").and_then(|t| t.get("name")).and_then(|v| v.as_str());
    Some(Message {
        id: name,
        thread_id: GoogleChatAdapter::encode_thread_id(space, thread_name, false),
        text: text.clone(),
        formatted: FormattedContent::markdown(text),
        raw: raw.clone(),
        author: Author {
            user_id,
            user_name: display_name.clone().unwrap_or_default(),
            full_name: display_name,
            is_bot: IsBot::Unknown,
            is_me: false,
        },
        metadata: MessageMetadata {
            date_sent: chrono::Utc::now(),
            edited: false,
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
    fn thread_id_round_trip_with_thread() {
        let encoded = GoogleChatAdapter::encode_thread_id("spaces/AAA", Some("spaces/AAA/threads/BBB"), false);
        let (space, thread_name, is_dm) = GoogleChatAdapter::decode_thread_id(&encoded).unwrap();
        assert_eq!(space, "spaces/AAA");
        assert_eq!(thread_name.as_deref(), Some("spaces/AAA/threads/BBB"));
        assert!(!is_dm);
    }

    #[test]
    fn thread_id_round_trip_dm_without_thread() {
        let encoded = GoogleChatAdapter::encode_thread_id("spaces/DM1", None, true);
        let (space, thread_name, is_dm) = GoogleChatAdapter::decode_thread_id(&encoded).unwrap();
        assert_eq!(space, "spaces/DM1");
        assert_eq!(thread_name, None);
        assert!(is_dm);
    }

    #[test]
    fn strips_user_mentions() {
        assert_eq!(strip_mention_tags("hey <users/123> look"), "hey @users/123 look");
    }
}
