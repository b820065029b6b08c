//! Handler Registry (C6): user-registered callbacks. Insertion-ordered,
//! append-only — there is no deregistration.

use std::sync::Arc;

use futures::future::BoxFuture;
use regex::Regex;

use crate::emoji::Emoji;
use crate::error::Result;
use crate::thread::Thread;
use crate::types::{ActionEvent, Message, ReactionEvent};

pub type MessageHandler = Arc<dyn Fn(Arc<Thread>, Message) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type ReactionHandler =
    Arc<dyn Fn(Arc<Thread>, ReactionEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub type ActionHandler = Arc<dyn Fn(Arc<Thread>, ActionEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>;

fn box_message_handler<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Arc<Thread>, Message) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |thread, msg| Box::pin(f(thread, msg)))
}

fn box_reaction_handler<F, Fut>(f: F) -> ReactionHandler
where
    F: Fn(Arc<Thread>, ReactionEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |thread, event| Box::pin(f(thread, event)))
}

fn box_action_handler<F, Fut>(f: F) -> ActionHandler
where
    F: Fn(Arc<Thread>, ActionEvent) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |thread, event| Box::pin(f(thread, event)))
}

/// A predicate over a message's plain text. `onNewMessage` fires every
/// pattern that matches; matching does not short-circuit.
#[derive(Clone)]
pub struct MessagePattern(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl MessagePattern {
    pub fn regex(re: Regex) -> Self {
        Self(Arc::new(move |text| re.is_match(text)))
    }

    pub fn predicate(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn matches(&self, text: &str) -> bool {
        (self.0)(text)
    }
}

pub enum ReactionFilter {
    Any,
    Names(Vec<Emoji>),
}

impl ReactionFilter {
    pub fn matches(&self, emoji: &Emoji) -> bool {
        match self {
            ReactionFilter::Any => true,
            ReactionFilter::Names(names) => names.contains(emoji),
        }
    }
}

pub enum ActionMatcher {
    Any,
    Id(String),
    Ids(Vec<String>),
}

impl ActionMatcher {
    pub fn matches(&self, action_id: &str) -> bool {
        match self {
            ActionMatcher::Any => true,
            ActionMatcher::Id(id) => id == action_id,
            ActionMatcher::Ids(ids) => ids.iter().any(|id| id == action_id),
        }
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    mention_handlers: Vec<MessageHandler>,
    pattern_handlers: Vec<(MessagePattern, MessageHandler)>,
    subscribed_handlers: Vec<MessageHandler>,
    reaction_handlers: Vec<(ReactionFilter, ReactionHandler)>,
    action_handlers: Vec<(ActionMatcher, ActionHandler)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_new_mention<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<Thread>, Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.mention_handlers.push(box_message_handler(handler));
    }

    pub fn on_new_message<F, Fut>(&mut self, pattern: MessagePattern, handler: F)
    where
        F: Fn(Arc<Thread>, Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.pattern_handlers.push((pattern, box_message_handler(handler)));
    }

    pub fn on_subscribed_message<F, Fut>(&mut self, handler: F)
    where
        F: Fn(Arc<Thread>, Message) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribed_handlers.push(box_message_handler(handler));
    }

    pub fn on_reaction<F, Fut>(&mut self, filter: ReactionFilter, handler: F)
    where
        F: Fn(Arc<Thread>, ReactionEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.reaction_handlers.push((filter, box_reaction_handler(handler)));
    }

    pub fn on_action<F, Fut>(&mut self, matcher: ActionMatcher, handler: F)
    where
        F: Fn(Arc<Thread>, ActionEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.action_handlers.push((matcher, box_action_handler(handler)));
    }

    pub fn mention_handlers(&self) -> &[MessageHandler] {
        &self.mention_handlers
    }

    pub fn subscribed_handlers(&self) -> &[MessageHandler] {
        &self.subscribed_handlers
    }

    pub fn matching_pattern_handlers<'a>(&'a self, text: &'a str) -> impl Iterator<Item = &'a MessageHandler> {
        self.pattern_handlers
            .iter()
            .filter(move |(pattern, _)| pattern.matches(text))
            .map(|(_, handler)| handler)
    }

    pub fn matching_reaction_handlers<'a>(&'a self, emoji: &'a Emoji) -> impl Iterator<Item = &'a ReactionHandler> {
        self.reaction_handlers
            .iter()
            .filter(move |(filter, _)| filter.matches(emoji))
            .map(|(_, handler)| handler)
    }

    pub fn matching_action_handlers<'a>(&'a self, action_id: &'a str) -> impl Iterator<Item = &'a ActionHandler> {
        self.action_handlers
            .iter()
            .filter(move |(matcher, _)| matcher.matches(action_id))
            .map(|(_, handler)| handler)
    }
}
