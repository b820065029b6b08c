//! Dispatcher (C5): the event-routing kernel. Turns a normalized event plus
//! its originating adapter into zero or more handler invocations, enforcing
//! dedup, per-thread mutual exclusion, and subscription dominance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use regex::Regex;

use crate::adapter::{Adapter, WaitUntil};
use crate::error::{Error, Result};
use crate::registry::HandlerRegistry;
use crate::state::StateStore;
use crate::thread::Thread;
use crate::types::{ActionEvent, Message, ReactionEvent};

pub const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);

pub struct Dispatcher {
    adapters: HashMap<String, Arc<dyn Adapter>>,
    state: Arc<dyn StateStore>,
    registry: HandlerRegistry,
    dedupe_ttl: Duration,
    lease_ttl: Duration,
}

impl Dispatcher {
    pub fn new(
        adapters: HashMap<String, Arc<dyn Adapter>>,
        state: Arc<dyn StateStore>,
        registry: HandlerRegistry,
        dedupe_ttl: Duration,
        lease_ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapters,
            state,
            registry,
            dedupe_ttl,
            lease_ttl,
        })
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(name).cloned()
    }

    pub fn adapters(&self) -> impl Iterator<Item = &Arc<dyn Adapter>> {
        self.adapters.values()
    }

    pub fn state(&self) -> &Arc<dyn StateStore> {
        &self.state
    }

    /// Calls `Adapter::initialize` on every registered adapter, handing each
    /// one a back-reference to this dispatcher.
    pub async fn initialize_adapters(self: &Arc<Self>) -> Result<()> {
        for adapter in self.adapters.values() {
            adapter.initialize(self.clone()).await?;
        }
        Ok(())
    }

    /// Entry point C2 calls for an inbound message. When `wait_until` is
    /// `Some`, dispatch runs as a background task handed to that hook and
    /// this call returns immediately with `Ok(())`; errors from the
    /// background dispatch are logged, never surfaced. When `wait_until` is
    /// `None`, dispatch runs inline and the real `Result` — including
    /// `Error::Lock` on lease contention — is returned to the caller.
    pub async fn process_message(
        self: &Arc<Self>,
        adapter_name: &str,
        message: Message,
        wait_until: Option<WaitUntil>,
    ) -> Result<()> {
        if message.author.is_me {
            return Ok(());
        }

        match wait_until {
            Some(hook) => {
                let dispatcher = self.clone();
                let adapter_name = adapter_name.to_string();
                let fut: BoxFuture<'static, ()> = Box::pin(async move {
                    if let Err(err) = dispatcher.dispatch_message(&adapter_name, message).await {
                        log_dispatch_error(&adapter_name, &err);
                    }
                });
                hook(fut);
                Ok(())
            }
            None => self.dispatch_message(adapter_name, message).await,
        }
    }

    pub async fn process_reaction(
        self: &Arc<Self>,
        adapter_name: &str,
        event: ReactionEvent,
        wait_until: Option<WaitUntil>,
    ) -> Result<()> {
        if event.user.is_me {
            return Ok(());
        }
        match wait_until {
            Some(hook) => {
                let dispatcher = self.clone();
                let adapter_name = adapter_name.to_string();
                let fut: BoxFuture<'static, ()> = Box::pin(async move {
                    if let Err(err) = dispatcher.dispatch_reaction(&adapter_name, event).await {
                        log_dispatch_error(&adapter_name, &err);
                    }
                });
                hook(fut);
                Ok(())
            }
            None => self.dispatch_reaction(adapter_name, event).await,
        }
    }

    pub async fn process_action(
        self: &Arc<Self>,
        adapter_name: &str,
        event: ActionEvent,
        wait_until: Option<WaitUntil>,
    ) -> Result<()> {
        if event.user.is_me {
            return Ok(());
        }
        match wait_until {
            Some(hook) => {
                let dispatcher = self.clone();
                let adapter_name = adapter_name.to_string();
                let fut: BoxFuture<'static, ()> = Box::pin(async move {
                    if let Err(err) = dispatcher.dispatch_action(&adapter_name, event).await {
                        log_dispatch_error(&adapter_name, &err);
                    }
                });
                hook(fut);
                Ok(())
            }
            None => self.dispatch_action(adapter_name, event).await,
        }
    }

    async fn dispatch_message(self: &Arc<Self>, adapter_name: &str, mut message: Message) -> Result<()> {
        let adapter = self
            .adapter(adapter_name)
            .ok_or_else(|| Error::adapter(adapter_name, "unknown adapter"))?;
        let thread_id = message.thread_id.clone();

        let dedupe_key = format!("dedupe:{adapter_name}:{}", message.id);
        if self.state.get(&dedupe_key).await?.is_some() {
            tracing::debug!(adapter = adapter_name, message_id = %message.id, "duplicate delivery absorbed");
            return Ok(());
        }
        self.state
            .set(&dedupe_key, serde_json::Value::Bool(true), Some(self.dedupe_ttl))
            .await?;

        let lease = match self.state.acquire_lease(&thread_id, self.lease_ttl).await? {
            Some(lease) => lease,
            None => {
                tracing::warn!(adapter = adapter_name, thread_id = %thread_id, "lease conflict");
                return Err(Error::lock(thread_id));
            }
        };

        let result = self.dispatch_message_locked(&adapter, &thread_id, &mut message).await;

        if let Err(err) = self.state.release_lease(&lease).await {
            tracing::error!(adapter = adapter_name, thread_id = %thread_id, error = %err, "failed to release lease");
        }

        if let Err(ref err) = result {
            log_dispatch_error(adapter_name, err);
        }
        result
    }

    async fn dispatch_message_locked(
        self: &Arc<Self>,
        adapter: &Arc<dyn Adapter>,
        thread_id: &str,
        message: &mut Message,
    ) -> Result<()> {
        let subscribed = self.state.is_subscribed(thread_id).await?;
        let thread = Arc::new(self.build_thread(adapter, thread_id, Some(subscribed)));

        if subscribed {
            message.is_mention = Some(detect_mention(adapter, &message.text));
            for handler in self.registry.subscribed_handlers() {
                handler(thread.clone(), message.clone()).await?;
            }
            return Ok(());
        }

        if detect_mention(adapter, &message.text) {
            message.is_mention = Some(true);
            for handler in self.registry.mention_handlers() {
                handler(thread.clone(), message.clone()).await?;
            }
            return Ok(());
        }

        message.is_mention = Some(false);
        for handler in self.registry.matching_pattern_handlers(&message.text) {
            handler(thread.clone(), message.clone()).await?;
        }
        Ok(())
    }

    async fn dispatch_reaction(self: &Arc<Self>, adapter_name: &str, event: ReactionEvent) -> Result<()> {
        let adapter = self
            .adapter(adapter_name)
            .ok_or_else(|| Error::adapter(adapter_name, "unknown adapter"))?;
        let thread_id = event.thread_id.clone();

        let lease = match self.state.acquire_lease(&thread_id, self.lease_ttl).await? {
            Some(lease) => lease,
            None => {
                tracing::warn!(adapter = adapter_name, thread_id = %thread_id, "lease conflict");
                return Err(Error::lock(thread_id));
            }
        };

        let thread = Arc::new(self.build_thread(&adapter, &thread_id, None));
        let result = async {
            for handler in self.registry.matching_reaction_handlers(&event.emoji) {
                handler(thread.clone(), event.clone()).await?;
            }
            Ok(())
        }
        .await;

        if let Err(err) = self.state.release_lease(&lease).await {
            tracing::error!(adapter = adapter_name, thread_id = %thread_id, error = %err, "failed to release lease");
        }
        if let Err(ref err) = result {
            log_dispatch_error(adapter_name, err);
        }
        result
    }

    async fn dispatch_action(self: &Arc<Self>, adapter_name: &str, event: ActionEvent) -> Result<()> {
        let adapter = self
            .adapter(adapter_name)
            .ok_or_else(|| Error::adapter(adapter_name, "unknown adapter"))?;
        let thread_id = event.thread_id.clone();

        let lease = match self.state.acquire_lease(&thread_id, self.lease_ttl).await? {
            Some(lease) => lease,
            None => {
                tracing::warn!(adapter = adapter_name, thread_id = %thread_id, "lease conflict");
                return Err(Error::lock(thread_id));
            }
        };

        let thread = Arc::new(self.build_thread(&adapter, &thread_id, None));
        let result = async {
            for handler in self.registry.matching_action_handlers(&event.action_id) {
                handler(thread.clone(), event.clone()).await?;
            }
            Ok(())
        }
        .await;

        if let Err(err) = self.state.release_lease(&lease).await {
            tracing::error!(adapter = adapter_name, thread_id = %thread_id, error = %err, "failed to release lease");
        }
        if let Err(ref err) = result {
            log_dispatch_error(adapter_name, err);
        }
        result
    }

    fn build_thread(&self, adapter: &Arc<dyn Adapter>, thread_id: &str, known_subscribed: Option<bool>) -> Thread {
        let is_dm = adapter.is_dm(thread_id);
        Thread::new(
            thread_id.to_string(),
            adapter.clone(),
            self.state.clone(),
            thread_id.to_string(),
            is_dm,
            known_subscribed,
        )
    }
}

fn log_dispatch_error(adapter_name: &str, err: &Error) {
    match err {
        Error::Lock { .. } => {
            tracing::warn!(adapter = adapter_name, error = %err, "lease conflict");
        }
        _ => {
            tracing::error!(adapter = adapter_name, error = %err, "dispatch failed");
        }
    }
}

/// Two word-boundary, case-insensitive patterns: `@<userName>` and, as a
/// fallback, `@<botUserId>`. Regex metacharacters in either identifier are
/// escaped before compiling.
fn detect_mention(adapter: &Arc<dyn Adapter>, text: &str) -> bool {
    let mut identifiers = vec![adapter.user_name().to_string()];
    if let Some(bot_user_id) = adapter.bot_user_id() {
        identifiers.push(bot_user_id.to_string());
    }
    identifiers.iter().any(|ident| mention_regex(ident).is_match(text))
}

fn mention_regex(identifier: &str) -> Regex {
    // `\b` only asserts correctly when the identifier ends in a word
    // character; an identifier like a GitHub App handle `my-bot[bot]` ends
    // in `]`, and `\b` after a non-word char requires a following word char,
    // so it would never match at end-of-string or before whitespace. Only
    // require the trailing boundary when the identifier actually ends in a
    // word character.
    let trailing_boundary = identifier.ends_with(|c: char| c.is_alphanumeric() || c == '_');
    let pattern = if trailing_boundary {
        format!(r"(?i)@{}\b", regex::escape(identifier))
    } else {
        format!(r"(?i)@{}", regex::escape(identifier))
    };
    Regex::new(&pattern).expect("mention pattern always compiles")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ActionMatcher, MessagePattern, ReactionFilter};
    use crate::state::InMemoryStateStore;
    use crate::types::{Author, FormattedContent, IsBot, MessageMetadata};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    use crate::adapter::{Adapter, WebhookRequest, WebhookResponse};
    use crate::types::{FetchOptions, FetchResult, Message as Msg, Postable, SentMessage, ThreadInfo};
    use async_trait::async_trait;

    struct StubAdapter {
        name: String,
        user_name: String,
    }

    #[async_trait]
    impl Adapter for StubAdapter {
        fn name(&self) -> &str {
            &self.name
        }
        fn user_name(&self) -> &str {
            &self.user_name
        }
        async fn initialize(&self, _kernel: Arc<Dispatcher>) -> Result<()> {
            Ok(())
        }
        async fn handle_webhook(
            &self,
            _request: WebhookRequest,
            _wait_until: Option<WaitUntil>,
        ) -> Result<WebhookResponse> {
            Ok(WebhookResponse::ok())
        }
        async fn post_message(&self, thread_id: &str, _postable: Postable) -> Result<SentMessage> {
            Ok(SentMessage {
                id: "sent-1".into(),
                thread_id: thread_id.into(),
                raw: serde_json::Value::Null,
            })
        }
        async fn edit_message(&self, thread_id: &str, message_id: &str, _postable: Postable) -> Result<SentMessage> {
            Ok(SentMessage {
                id: message_id.into(),
                thread_id: thread_id.into(),
                raw: serde_json::Value::Null,
            })
        }
        async fn delete_message(&self, _thread_id: &str, _message_id: &str) -> Result<()> {
            Ok(())
        }
        async fn add_reaction(&self, _thread_id: &str, _message_id: &str, _emoji: &crate::emoji::Emoji) -> Result<()> {
            Ok(())
        }
        async fn remove_reaction(
            &self,
            _thread_id: &str,
            _message_id: &str,
            _emoji: &crate::emoji::Emoji,
        ) -> Result<()> {
            Ok(())
        }
        async fn start_typing(&self, _thread_id: &str) -> Result<()> {
            Ok(())
        }
        async fn fetch_messages(&self, _thread_id: &str, _options: FetchOptions) -> Result<FetchResult> {
            Ok(FetchResult {
                messages: vec![],
                next_cursor: None,
            })
        }
        async fn fetch_thread(&self, thread_id: &str) -> Result<ThreadInfo> {
            Ok(ThreadInfo {
                channel_id: thread_id.into(),
                display_name: None,
                is_dm: false,
            })
        }
        fn parse_message(&self, _raw: serde_json::Value) -> Result<Msg> {
            Err(Error::not_implemented("parse_message"))
        }
        fn render_formatted(&self, content: &FormattedContent) -> String {
            content.as_str().to_string()
        }
    }

    fn make_message(id: &str, thread_id: &str, text: &str, is_me: bool) -> Message {
        Message {
            id: id.into(),
            thread_id: thread_id.into(),
            text: text.into(),
            formatted: FormattedContent::markdown(text),
            raw: serde_json::Value::Null,
            author: Author {
                user_id: "u1".into(),
                user_name: "alice".into(),
                full_name: None,
                is_bot: IsBot::False,
                is_me,
            },
            metadata: MessageMetadata {
                date_sent: chrono::Utc::now(),
                edited: false,
                edited_at: None,
            },
            attachments: vec![],
            is_mention: None,
        }
    }

    fn build_dispatcher(user_name: &str) -> Arc<Dispatcher> {
        let mut adapters: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
        adapters.insert(
            "stub".into(),
            Arc::new(StubAdapter {
                name: "stub".into(),
                user_name: user_name.into(),
            }),
        );
        let state: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        Dispatcher::new(adapters, state, HandlerRegistry::new(), DEFAULT_DEDUPE_TTL, DEFAULT_LEASE_TTL)
    }

    #[tokio::test]
    async fn s1_mention_then_subscribe() {
        let mut adapters: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
        adapters.insert(
            "stub".into(),
            Arc::new(StubAdapter {
                name: "stub".into(),
                user_name: "bot".into(),
            }),
        );
        let state: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let mut registry = HandlerRegistry::new();
        let mention_calls = Arc::new(AtomicUsize::new(0));
        let subscribed_calls = Arc::new(AtomicUsize::new(0));
        let mention_seen_mention_flag = Arc::new(AtomicUsize::new(0));

        {
            let mention_calls = mention_calls.clone();
            registry.on_new_mention(move |thread, _message| {
                let mention_calls = mention_calls.clone();
                async move {
                    mention_calls.fetch_add(1, Ordering::SeqCst);
                    thread.subscribe().await
                }
            });
        }
        {
            let subscribed_calls = subscribed_calls.clone();
            let mention_seen_mention_flag = mention_seen_mention_flag.clone();
            registry.on_subscribed_message(move |_thread, message| {
                let subscribed_calls = subscribed_calls.clone();
                let mention_seen_mention_flag = mention_seen_mention_flag.clone();
                async move {
                    subscribed_calls.fetch_add(1, Ordering::SeqCst);
                    if message.is_mention == Some(true) {
                        mention_seen_mention_flag.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
            });
        }

        let dispatcher = Dispatcher::new(adapters, state, registry, DEFAULT_DEDUPE_TTL, DEFAULT_LEASE_TTL);

        let m1 = make_message("m1", "stub:c1", "Hey @bot", false);
        dispatcher.process_message("stub", m1, None).await.unwrap();
        assert_eq!(mention_calls.load(Ordering::SeqCst), 1);
        assert_eq!(subscribed_calls.load(Ordering::SeqCst), 0);
        assert!(dispatcher.state().is_subscribed("stub:c1").await.unwrap());

        let m2 = make_message("m2", "stub:c1", "any follow-up", false);
        dispatcher.process_message("stub", m2, None).await.unwrap();
        assert_eq!(mention_calls.load(Ordering::SeqCst), 1);
        assert_eq!(subscribed_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn s2_duplicate_delivery() {
        let mut adapters: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
        adapters.insert(
            "stub".into(),
            Arc::new(StubAdapter {
                name: "stub".into(),
                user_name: "bot".into(),
            }),
        );
        let state: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let mut registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            registry.on_new_message(MessagePattern::regex(Regex::new(".*").unwrap()), move |_thread, _message| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        let dispatcher = Dispatcher::new(adapters, state, registry, DEFAULT_DEDUPE_TTL, DEFAULT_LEASE_TTL);
        for _ in 0..3 {
            let msg = make_message("x", "stub:c1", "hello", false);
            dispatcher.process_message("stub", msg, None).await.unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn s3_self_filter() {
        let mut adapters: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
        adapters.insert(
            "stub".into(),
            Arc::new(StubAdapter {
                name: "stub".into(),
                user_name: "bot".into(),
            }),
        );
        let state: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let mut registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            registry.on_new_message(MessagePattern::regex(Regex::new(".*").unwrap()), move |_thread, _message| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        let dispatcher = Dispatcher::new(adapters, state, registry, DEFAULT_DEDUPE_TTL, DEFAULT_LEASE_TTL);
        let msg = make_message("m1", "stub:c1", "hello", true);
        dispatcher.process_message("stub", msg, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn s4_lease_contention() {
        let dispatcher = build_dispatcher("bot");
        let thread_id = "stub:c1";
        let lease = dispatcher
            .state()
            .acquire_lease(thread_id, StdDuration::from_secs(30))
            .await
            .unwrap()
            .unwrap();

        let msg = make_message("m1", thread_id, "hello", false);
        let result = dispatcher.process_message("stub", msg, None).await;
        assert!(matches!(result, Err(Error::Lock { .. })));

        dispatcher.state().release_lease(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn s6_mention_inside_subscribed_thread() {
        let mut adapters: HashMap<String, Arc<dyn Adapter>> = HashMap::new();
        adapters.insert(
            "stub".into(),
            Arc::new(StubAdapter {
                name: "stub".into(),
                user_name: "bot".into(),
            }),
        );
        let state: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        state.subscribe("stub:c1").await.unwrap();
        let mut registry = HandlerRegistry::new();
        let mention_calls = Arc::new(AtomicUsize::new(0));
        let subscribed_saw_mention = Arc::new(AtomicUsize::new(0));
        {
            let mention_calls = mention_calls.clone();
            registry.on_new_mention(move |_thread, _message| {
                let mention_calls = mention_calls.clone();
                async move {
                    mention_calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            });
        }
        {
            let subscribed_saw_mention = subscribed_saw_mention.clone();
            registry.on_subscribed_message(move |_thread, message| {
                let subscribed_saw_mention = subscribed_saw_mention.clone();
                async move {
                    if message.is_mention == Some(true) {
                        subscribed_saw_mention.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }
            });
        }
        let dispatcher = Dispatcher::new(adapters, state, registry, DEFAULT_DEDUPE_TTL, DEFAULT_LEASE_TTL);
        let msg = make_message("m1", "stub:c1", "@bot still there?", false);
        dispatcher.process_message("stub", msg, None).await.unwrap();
        assert_eq!(mention_calls.load(Ordering::SeqCst), 0);
        assert_eq!(subscribed_saw_mention.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mention_regex_escapes_metacharacters() {
        assert!(mention_regex("bot.exe").is_match("hey @bot.exe how are you"));
        assert!(!mention_regex("bot.exe").is_match("hey @botXexe how are you"));
    }

    #[test]
    fn mention_regex_matches_identifier_ending_in_non_word_char() {
        assert!(mention_regex("my-bot[bot]").is_match("hey @my-bot[bot]"));
        assert!(mention_regex("my-bot[bot]").is_match("hey @my-bot[bot] can you look at this"));
    }

    #[test]
    fn action_matcher_variants() {
        assert!(ActionMatcher::Any.matches("anything"));
        assert!(ActionMatcher::Id("ok".into()).matches("ok"));
        assert!(!ActionMatcher::Id("ok".into()).matches("cancel"));
        assert!(ActionMatcher::Ids(vec!["a".into(), "b".into()]).matches("b"));
    }

    #[test]
    fn reaction_filter_variants() {
        let thumbsup = crate::emoji::registry().extend("thumbsup_reaction_test", None, None);
        let heart = crate::emoji::registry().extend("heart_reaction_test", None, None);
        assert!(ReactionFilter::Any.matches(&thumbsup));
        assert!(ReactionFilter::Names(vec![thumbsup.clone()]).matches(&thumbsup));
        assert!(!ReactionFilter::Names(vec![thumbsup]).matches(&heart));
    }
}
