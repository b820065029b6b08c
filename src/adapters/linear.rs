//! Linear adapter: GraphQL API egress, webhook ingress over HMAC.
//!
//! Thread ID codec: `linear:<issueId>[:c:<commentId>]`. The optional `c:`
//! segment addresses a reply thread rooted at a specific comment, mirroring
//! the GitHub review-comment convention.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::adapter::{Adapter, WaitUntil, WebhookRequest, WebhookResponse};
use crate::dispatcher::Dispatcher;
use crate::emoji::Emoji;
use crate::error::{Error, Result};
use crate::types::{
    Author, FetchOptions, FetchResult, FormattedContent, IsBot, Message, MessageMetadata, Postable, SentMessage,
    ThreadInfo,
};

use super::support::verify_hmac_sha256_hex;

const GRAPHQL_ENDPOINT: &str = "https://api.linear.app/graphql";

pub struct LinearAdapter {
    http: reqwest::Client,
    api_key: String,
    webhook_secret: String,
    user_name: String,
    bot_user_id: Option<String>,
    kernel: OnceLock<Arc<Dispatcher>>,
}

impl LinearAdapter {
    pub fn new(api_key: impl Into<String>, webhook_secret: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            webhook_secret: webhook_secret.into(),
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
        self.kernel.get().ok_or_else(|| Error::adapter("linear", "adapter not initialized"))
    }

    pub fn encode_thread_id(issue_id: &str, comment_id: Option<&str>) -> String {
        match comment_id {
            Some(id) => format!("linear:{issue_id}:c:{id}"),
            None => format!("linear:{issue_id}"),
        }
    }

    pub fn decode_thread_id(thread_id: &str) -> Result<(String, Option<String>)> {
        let rest = thread_id
            .strip_prefix("linear:")
            .ok_or_else(|| Error::validation("linear", "missing linear: prefix"))?;
        let parts: Vec<&str> = rest.splitn(3, ':').collect();
        let issue_id = parts
            .first()
            .ok_or_else(|| Error::validation("linear", "missing issue id"))?
            .to_string();
        let comment_id = match (parts.get(1), parts.get(2)) {
            (Some(&"c"), Some(id)) => Some(id.to_string()),
            _ => None,
        };
        Ok((issue_id, comment_id))
    }

    async fn graphql(&self, query: &str, variables: serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .http
            .post(GRAPHQL_ENDPOINT)
            .header("Authorization", &self.api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(Error::from_http_status("linear", status, None));
        }
        let body: serde_json::Value = resp.json().await.map_err(|e| Error::Network(e.to_string()))?;
        if let Some(errors) = body.get("errors").and_then(|v| v.as_array()) {
            if !errors.is_empty() {
                let message = errors[0].get("message").and_then(|v| v.as_str()).unwrap_or("unknown GraphQL error");
                return Err(Error::adapter("linear", message));
            }
        }
        Ok(body.get("data").cloned().unwrap_or(serde_json::Value::Null))
    }
}

#[derive(Debug, Deserialize)]
struct LinearWebhookPayload {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    data: Option<LinearComment>,
}

#[derive(Debug, Deserialize, Clone)]
struct LinearComment {
    id: String,
    body: String,
    #[serde(default)]
    issue: Option<LinearIssueRef>,
    #[serde(default)]
    user: Option<LinearUser>,
    #[serde(default)]
    parent: Option<LinearParentRef>,
}

#[derive(Debug, Deserialize)]
struct LinearIssueRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct LinearParentRef {
    id: String,
}

#[derive(Debug, Deserialize, Clone)]
struct LinearUser {
    id: String,
    name: String,
}

#[async_trait]
impl Adapter for LinearAdapter {
    fn name(&self) -> &str {
        "linear"
    }

    fn user_name(&self) -> &str {
        &self.user_name
    }

    fn bot_user_id(&self) -> Option<&str> {
        self.bot_user_id.as_deref()
    }

    async fn initialize(&self, kernel: Arc<Dispatcher>) -> Result<()> {
        self.kernel.set(kernel).map_err(|_| Error::adapter("linear", "already initialized"))
    }

    async fn handle_webhook(&self, request: WebhookRequest, wait_until: Option<WaitUntil>) -> Result<WebhookResponse> {
        let provided_sig = request.header("Linear-Signature").ok_or(Error::Authentication)?;
        if !verify_hmac_sha256_hex(self.webhook_secret.as_bytes(), &request.body, provided_sig) {
            return Ok(WebhookResponse::unauthorized());
        }

        let payload: LinearWebhookPayload =
            serde_json::from_slice(&request.body).map_err(|e| Error::validation("linear", e.to_string()))?;

        if payload.r#type.as_deref() != Some("Comment") || payload.action.as_deref() != Some("create") {
            return Ok(WebhookResponse::ok());
        }

        let Some(comment) = payload.data else {
            return Ok(WebhookResponse::ok());
        };
        let Some(issue) = &comment.issue else {
            return Ok(WebhookResponse::bad_request("missing issue"));
        };

        let root_comment_id = comment.parent.as_ref().map(|p| p.id.clone()).unwrap_or_else(|| comment.id.clone());
        let thread_id = if comment.parent.is_some() {
            Self::encode_thread_id(&issue.id, Some(&root_comment_id))
        } else {
            Self::encode_thread_id(&issue.id, None)
        };
        let user = comment.user.clone().unwrap_or(LinearUser { id: String::new(), name: String::new() });
        let is_me = self.bot_user_id() == Some(user.id.as_str());

        let message = Message {
            id: comment.id.clone(),
            thread_id,
            text: comment.body.clone(),
            formatted: FormattedContent::markdown(comment.body.clone()),
            raw: serde_json::to_value(&comment).unwrap_or_default(),
            author: Author {
                user_id: user.id,
                user_name: user.name.clone(),
                full_name: Some(user.name),
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
        kernel.process_message("linear", message, wait_until).await.or_else(|err| match err {
            Error::Lock { .. } => Ok(()),
            other => Err(other),
        })?;

        Ok(WebhookResponse::ok())
    }

    async fn post_message(&self, thread_id: &str, postable: Postable) -> Result<SentMessage> {
        let (issue_id, comment_id) = Self::decode_thread_id(thread_id)?;
        let text = render_postable(&postable);
        let data = self
            .graphql(
                "mutation($issueId: String!, $body: String!, $parentId: String) { \
                 commentCreate(input: { issueId: $issueId, body: $body, parentId: $parentId }) { \
                 success comment { id } } }",
                json!({ "issueId": issue_id, "body": text, "parentId": comment_id }),
            )
            .await?;
        let id = data
            .get("commentCreate")
            .and_then(|c| c.get("comment"))
            .and_then(|c| c.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        Ok(SentMessage {
            id,
            thread_id: thread_id.to_string(),
            raw: data,
        })
    }

    async fn edit_message(&self, thread_id: &str, message_id: &str, postable: Postable) -> Result<SentMessage> {
        let text = render_postable(&postable);
        let data = self
            .graphql(
                "mutation($id: String!, $body: String!) { commentUpdate(id: $id, input: { body: $body }) { success } }",
                json!({ "id": message_id, "body": text }),
            )
            .await?;
        Ok(SentMessage {
            id: message_id.to_string(),
            thread_id: thread_id.to_string(),
            raw: data,
        })
    }

    async fn delete_message(&self, _thread_id: &str, message_id: &str) -> Result<()> {
        self.graphql(
            "mutation($id: String!) { commentDelete(id: $id) { success } }",
            json!({ "id": message_id }),
        )
        .await?;
        Ok(())
    }

    async fn add_reaction(&self, _thread_id: &str, message_id: &str, emoji: &Emoji) -> Result<()> {
        self.graphql(
            "mutation($commentId: String!, $emoji: String!) { reactionCreate(input: { commentId: $commentId, emoji: $emoji }) { success } }",
            json!({ "commentId": message_id, "emoji": emoji.name() }),
        )
        .await?;
        Ok(())
    }

    async fn remove_reaction(&self, _thread_id: &str, _message_id: &str, _emoji: &Emoji) -> Result<()> {
        Err(Error::not_implemented("linear reaction removal requires the reaction id, not just its emoji"))
    }

    async fn start_typing(&self, _thread_id: &str) -> Result<()> {
        Err(Error::not_implemented("linear typing indicator"))
    }

    async fn fetch_messages(&self, thread_id: &str, options: FetchOptions) -> Result<FetchResult> {
        let (issue_id, comment_id) = Self::decode_thread_id(thread_id)?;
        let first = options.limit.unwrap_or(50).min(250);
        let data = self
            .graphql(
                "query($issueId: String!, $first: Int!, $after: String) { \
                 issue(id: $issueId) { comments(first: $first, after: $after) { \
                 nodes { id body user { id name } createdAt } pageInfo { endCursor hasNextPage } } } }",
                json!({ "issueId": issue_id, "first": first, "after": options.cursor }),
            )
            .await?;
        let comments = data
            .get("issue")
            .and_then(|i| i.get("comments"))
            .and_then(|c| c.get("nodes"))
            .and_then(|n| n.as_array())
            .cloned()
            .unwrap_or_default();
        let messages: Vec<Message> = comments
            .iter()
            .filter_map(|raw| linear_comment_from_json(raw, &issue_id, comment_id.as_deref()))
            .collect();
        let next_cursor = data
            .get("issue")
            .and_then(|i| i.get("comments"))
            .and_then(|c| c.get("pageInfo"))
            .and_then(|p| {
                if p.get("hasNextPage").and_then(|v| v.as_bool()) == Some(true) {
                    p.get("endCursor").and_then(|v| v.as_str())
                } else {
                    None
                }
            })
            .map(str::to_string);
        Ok(FetchResult { messages, next_cursor })
    }

    async fn fetch_thread(&self, thread_id: &str) -> Result<ThreadInfo> {
        let (issue_id, _) = Self::decode_thread_id(thread_id)?;
        let data = self
            .graphql("query($id: String!) { issue(id: $id) { identifier title } }", json!({ "id": issue_id }))
            .await?;
        Ok(ThreadInfo {
            channel_id: issue_id,
            display_name: data.get("issue").and_then(|i| i.get("title")).and_then(|v| v.as_str()).map(str::to_string),
            is_dm: false,
        })
    }

    fn parse_message(&self, raw: serde_json::Value) -> Result<Message> {
        let issue_id = raw
            .get("issue_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::validation("linear", "raw payload missing issue_id"))?;
        linear_comment_from_json(&raw, issue_id, None).ok_or_else(|| Error::validation("linear", "malformed raw comment"))
    }

    fn render_formatted(&self, content: &FormattedContent) -> String {
        content.as_str().to_string()
    }

    fn render_mention(&self, user_id: &str) -> String {
        format!("@{user_id}")
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

fn linear_comment_from_json(raw: &serde_json::Value, issue_id: &str, comment_id: Option<&str>) -> Option<Message> {
    let id = raw.get("id")?.as_str()?.to_string();
    let body = raw.get("body").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let user = raw.get("user");
    let user_id = user.and_then(|u| u.get("id")).and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let user_name = user.and_then(|u| u.get("name")).and_then(|v| v.as_str()).unwrap_or_default().to_string();
    Some(Message {
        id: id.clone(),
        thread_id: LinearAdapter::encode_thread_id(issue_id, comment_id),
        text: body.clone(),
        formatted: FormattedContent::markdown(body),
        raw: raw.clone(),
        author: Author {
            user_id,
            user_name: user_name.clone(),
            full_name: Some(user_name),
            is_bot: IsBot::Unknown,
            is_me: false,
        },
        metadata: MessageMetadata {
            date_sent: raw
                .get("createdAt")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(chrono::Utc::now),
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
    fn thread_id_round_trip_issue_only() {
        let encoded = LinearAdapter::encode_thread_id("ISS-123", None);
        let (issue, comment) = LinearAdapter::decode_thread_id(&encoded).unwrap();
        assert_eq!(issue, "ISS-123");
        assert_eq!(comment, None);
    }

    #[test]
    fn thread_id_round_trip_with_comment() {
        let encoded = LinearAdapter::encode_thread_id("ISS-123", Some("c-456"));
        let (issue, comment) = LinearAdapter::decode_thread_id(&encoded).unwrap();
        assert_eq!(issue, "ISS-123");
        assert_eq!(comment.as_deref(), Some("c-456"));
    }
}
