//! GitHub adapter: Issues/PR REST API egress, webhook ingress over HMAC.
//!
//! Thread ID codec: `github:<owner>/<repo>:<prNumber>[:rc:<reviewCommentId>]`.
//! The optional `rc:` segment addresses a specific review-comment thread on
//! a pull request, distinct from the PR's top-level conversation.

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

pub struct GitHubAdapter {
    http: reqwest::Client,
    token: String,
    webhook_secret: String,
    user_name: String,
    bot_user_id: Option<String>,
    kernel: OnceLock<Arc<Dispatcher>>,
}

impl GitHubAdapter {
    pub fn new(token: impl Into<String>, webhook_secret: impl Into<String>, user_name: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.into(),
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
        self.kernel.get().ok_or_else(|| Error::adapter("github", "adapter not initialized"))
    }

    pub fn encode_thread_id(owner_repo: &str, pr_number: u64, review_comment_id: Option<u64>) -> String {
        match review_comment_id {
            Some(id) => format!("github:{owner_repo}:{pr_number}:rc:{id}"),
            None => format!("github:{owner_repo}:{pr_number}"),
        }
    }

    pub fn decode_thread_id(thread_id: &str) -> Result<(String, u64, Option<u64>)> {
        let rest = thread_id
            .strip_prefix("github:")
            .ok_or_else(|| Error::validation("github", "missing github: prefix"))?;
        let parts: Vec<&str> = rest.splitn(4, ':').collect();
        let owner_repo = parts
            .first()
            .ok_or_else(|| Error::validation("github", "missing owner/repo"))?
            .to_string();
        let pr_number: u64 = parts
            .get(1)
            .ok_or_else(|| Error::validation("github", "missing PR number"))?
            .parse()
            .map_err(|_| Error::validation("github", "PR number must be numeric"))?;
        let review_comment_id = match (parts.get(2), parts.get(3)) {
            (Some(&"rc"), Some(id)) => Some(
                id.parse()
                    .map_err(|_| Error::validation("github", "review comment id must be numeric"))?,
            ),
            _ => None,
        };
        Ok((owner_repo, pr_number, review_comment_id))
    }

    async fn api_call(&self, method: reqwest::Method, path: String, body: Option<serde_json::Value>) -> Result<serde_json::Value> {
        let url = format!("https://api.github.com{path}");
        let mut req = self
            .http
            .request(method, url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", self.user_name.clone());
        if let Some(body) = body {
            req = req.json(&body);
        }
        let resp = req.send().await.map_err(|e| Error::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        if status == 204 {
            return Ok(serde_json::Value::Null);
        }
        if !(200..300).contains(&status) {
            return Err(Error::from_http_status("github", status, None));
        }
        resp.json().await.map_err(|e| Error::Network(e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct GitHubWebhookPayload {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    comment: Option<GitHubComment>,
    #[serde(default)]
    issue: Option<GitHubIssue>,
    #[serde(default)]
    pull_request: Option<GitHubPullRequest>,
    #[serde(default)]
    repository: Option<GitHubRepository>,
}

#[derive(Debug, Deserialize, Clone)]
struct GitHubComment {
    id: u64,
    body: String,
    user: GitHubUser,
    #[serde(default)]
    pull_request_review_id: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct GitHubIssue {
    number: u64,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GitHubPullRequest {
    number: u64,
}

#[derive(Debug, Deserialize)]
struct GitHubRepository {
    full_name: String,
}

#[derive(Debug, Deserialize, Clone)]
struct GitHubUser {
    login: String,
    id: u64,
    #[serde(rename = "type", default)]
    user_type: Option<String>,
}

#[async_trait]
impl Adapter for GitHubAdapter {
    fn name(&self) -> &str {
        "github"
    }

    fn user_name(&self) -> &str {
        &self.user_name
    }

    fn bot_user_id(&self) -> Option<&str> {
        self.bot_user_id.as_deref()
    }

    async fn initialize(&self, kernel: Arc<Dispatcher>) -> Result<()> {
        self.kernel.set(kernel).map_err(|_| Error::adapter("github", "already initialized"))
    }

    async fn handle_webhook(&self, request: WebhookRequest, wait_until: Option<WaitUntil>) -> Result<WebhookResponse> {
        let provided_sig = request.header("X-Hub-Signature-256").ok_or(Error::Authentication)?;
        if !verify_hmac_sha256_hex(self.webhook_secret.as_bytes(), &request.body, provided_sig) {
            return Ok(WebhookResponse::unauthorized());
        }

        let event_name = request.header("X-GitHub-Event").unwrap_or_default().to_string();
        let payload: GitHubWebhookPayload =
            serde_json::from_slice(&request.body).map_err(|e| Error::validation("github", e.to_string()))?;

        let is_comment_event = matches!(event_name.as_str(), "issue_comment" | "pull_request_review_comment");
        if !is_comment_event || payload.action.as_deref() != Some("created") {
            return Ok(WebhookResponse::ok());
        }

        let Some(comment) = payload.comment.clone() else {
            return Ok(WebhookResponse::ok());
        };
        let Some(repository) = payload.repository else {
            return Ok(WebhookResponse::bad_request("missing repository"));
        };

        let pr_number = payload
            .pull_request
            .as_ref()
            .map(|pr| pr.number)
            .or(payload.issue.as_ref().map(|i| i.number))
            .ok_or_else(|| Error::validation("github", "missing PR/issue number"))?;

        let review_comment_id = if event_name == "pull_request_review_comment" {
            Some(comment.id)
        } else {
            None
        };

        let thread_id = Self::encode_thread_id(&repository.full_name, pr_number, review_comment_id);
        let is_me = self.bot_user_id() == Some(comment.user.id.to_string().as_str());

        let message = Message {
            id: comment.id.to_string(),
            thread_id,
            text: comment.body.clone(),
            formatted: FormattedContent::markdown(comment.body.clone()),
            raw: serde_json::to_value(&comment).unwrap_or_default(),
            author: Author {
                user_id: comment.user.id.to_string(),
                user_name: comment.user.login.clone(),
                full_name: None,
                is_bot: if comment.user.user_type.as_deref() == Some("Bot") {
                    IsBot::True
                } else {
                    IsBot::False
                },
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
        kernel.process_message("github", message, wait_until).await.or_else(|err| match err {
            Error::Lock { .. } => Ok(()),
            other => Err(other),
        })?;

        Ok(WebhookResponse::ok())
    }

    async fn post_message(&self, thread_id: &str, postable: Postable) -> Result<SentMessage> {
        let (owner_repo, pr_number, review_comment_id) = Self::decode_thread_id(thread_id)?;
        let text = render_postable(&postable);
        let resp = if let Some(parent_id) = review_comment_id {
            self.api_call(
                reqwest::Method::POST,
                format!("/repos/{owner_repo}/pulls/{pr_number}/comments/{parent_id}/replies"),
                Some(json!({ "body": text })),
            )
            .await?
        } else {
            self.api_call(
                reqwest::Method::POST,
                format!("/repos/{owner_repo}/issues/{pr_number}/comments"),
                Some(json!({ "body": text })),
            )
            .await?
        };
        let id = resp.get("id").and_then(|v| v.as_u64()).map(|n| n.to_string()).unwrap_or_default();
        Ok(SentMessage {
            id,
            thread_id: thread_id.to_string(),
            raw: resp,
        })
    }

    async fn edit_message(&self, thread_id: &str, message_id: &str, postable: Postable) -> Result<SentMessage> {
        let (owner_repo, _, review_comment_id) = Self::decode_thread_id(thread_id)?;
        let text = render_postable(&postable);
        let endpoint = if review_comment_id.is_some() {
            format!("/repos/{owner_repo}/pulls/comments/{message_id}")
        } else {
            format!("/repos/{owner_repo}/issues/comments/{message_id}")
        };
        let resp = self.api_call(reqwest::Method::PATCH, endpoint, Some(json!({ "body": text }))).await?;
        Ok(SentMessage {
            id: message_id.to_string(),
            thread_id: thread_id.to_string(),
            raw: resp,
        })
    }

    async fn delete_message(&self, thread_id: &str, message_id: &str) -> Result<()> {
        let (owner_repo, _, review_comment_id) = Self::decode_thread_id(thread_id)?;
        let endpoint = if review_comment_id.is_some() {
            format!("/repos/{owner_repo}/pulls/comments/{message_id}")
        } else {
            format!("/repos/{owner_repo}/issues/comments/{message_id}")
        };
        self.api_call(reqwest::Method::DELETE, endpoint, None).await?;
        Ok(())
    }

    async fn add_reaction(&self, thread_id: &str, message_id: &str, emoji: &Emoji) -> Result<()> {
        let (owner_repo, _, review_comment_id) = Self::decode_thread_id(thread_id)?;
        let kind = if review_comment_id.is_some() { "pulls" } else { "issues" };
        let content = github_reaction_content(emoji.name());
        self.api_call(
            reqwest::Method::POST,
            format!("/repos/{owner_repo}/{kind}/comments/{message_id}/reactions"),
            Some(json!({ "content": content })),
        )
        .await?;
        Ok(())
    }

    async fn remove_reaction(&self, _thread_id: &str, _message_id: &str, _emoji: &Emoji) -> Result<()> {
        Err(Error::not_implemented("github reaction removal requires the reaction id, not just its content"))
    }

    async fn start_typing(&self, _thread_id: &str) -> Result<()> {
        Err(Error::not_implemented("github typing indicator"))
    }

    async fn fetch_messages(&self, thread_id: &str, options: FetchOptions) -> Result<FetchResult> {
        let (owner_repo, pr_number, review_comment_id) = Self::decode_thread_id(thread_id)?;
        let per_page = options.limit.unwrap_or(30).min(100);
        let page = options.cursor.as_deref().and_then(|c| c.parse::<u32>().ok()).unwrap_or(1);
        let endpoint = if review_comment_id.is_some() {
            format!("/repos/{owner_repo}/pulls/{pr_number}/comments?per_page={per_page}&page={page}")
        } else {
            format!("/repos/{owner_repo}/issues/{pr_number}/comments?per_page={per_page}&page={page}")
        };
        let resp = self.api_call(reqwest::Method::GET, endpoint, None).await?;
        let messages: Vec<Message> = resp
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|raw| github_comment_from_json(raw, &owner_repo, pr_number, review_comment_id))
            .collect();
        let next_cursor = if messages.len() == per_page {
            Some((page + 1).to_string())
        } else {
            None
        };
        Ok(FetchResult { messages, next_cursor })
    }

    async fn fetch_thread(&self, thread_id: &str) -> Result<ThreadInfo> {
        let (owner_repo, pr_number, _) = Self::decode_thread_id(thread_id)?;
        let resp = self.api_call(reqwest::Method::GET, format!("/repos/{owner_repo}/pulls/{pr_number}"), None).await?;
        Ok(ThreadInfo {
            channel_id: format!("{owner_repo}:{pr_number}"),
            display_name: resp.get("title").and_then(|v| v.as_str()).map(str::to_string),
            is_dm: false,
        })
    }

    fn parse_message(&self, raw: serde_json::Value) -> Result<Message> {
        let owner_repo = raw
            .get("repository_full_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::validation("github", "raw payload missing repository_full_name"))?;
        let pr_number = raw
            .get("pr_number")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::validation("github", "raw payload missing pr_number"))?;
        github_comment_from_json(&raw, owner_repo, pr_number, None).ok_or_else(|| Error::validation("github", "malformed raw comment"))
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

fn github_reaction_content(normalized: &str) -> &'static str {
    match normalized {
        "thumbsup" => "+1",
        "thumbsdown" => "-1",
        "laughing" => "laugh",
        "tada" => "hooray",
        "heart" => "heart",
        "eyes" => "eyes",
        "rocket" => "rocket",
        _ => "+1",
    }
}

fn github_comment_from_json(raw: &serde_json::Value, owner_repo: &str, pr_number: u64, review_comment_id: Option<u64>) -> Option<Message> {
    let id = raw.get("id")?.as_u64()?;
    let body = raw.get("body").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let user = raw.get("user")?;
    let login = user.get("login").and_then(|v| v.as_str()).unwrap_or_default().to_string();
    let user_id = user.get("id").and_then(|v| v.as_u64()).unwrap_or_default().to_string();
    let user_type = user.get("type").and_then(|v| v.as_str());
    Some(Message {
        id: id.to_string(),
        thread_id: GitHubAdapter::encode_thread_id(owner_repo, pr_number, review_comment_id),
        text: body.clone(),
        formatted: FormattedContent::markdown(body),
        raw: raw.clone(),
        author: Author {
            user_id,
            user_name: login,
            full_name: None,
            is_bot: if user_type == Some("Bot") { IsBot::True } else { IsBot::False },
            is_me: false,
        },
        metadata: MessageMetadata {
            date_sent: raw
                .get("created_at")
                .and_then(|v| v.as_str())
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(chrono::Utc::now),
            edited: raw.get("updated_at") != raw.get("created_at"),
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
    fn thread_id_round_trip_pr_only() {
        let encoded = GitHubAdapter::encode_thread_id("acme/widgets", 42, None);
        let (owner_repo, pr, rc) = GitHubAdapter::decode_thread_id(&encoded).unwrap();
        assert_eq!(owner_repo, "acme/widgets");
        assert_eq!(pr, 42);
        assert_eq!(rc, None);
    }

    #[test]
    fn thread_id_round_trip_review_comment() {
        let encoded = GitHubAdapter::encode_thread_id("acme/widgets", 42, Some(99));
        let (owner_repo, pr, rc) = GitHubAdapter::decode_thread_id(&encoded).unwrap();
        assert_eq!(owner_repo, "acme/widgets");
        assert_eq!(pr, 42);
        assert_eq!(rc, Some(99));
    }
}
