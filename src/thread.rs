//! Thread facade (C4): the per-invocation handle passed into handlers.

use std::ops::Deref;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;

use crate::adapter::Adapter;
use crate::emoji::Emoji;
use crate::error::Result;
use crate::state::StateStore;
use crate::types::{FetchDirection, FetchOptions, Message, Postable, SentMessage, ThreadId};

/// A message the kernel has just sent, with the operations handler code needs
/// to manipulate it further without re-deriving its IDs.
pub struct PostedMessage {
    pub sent: SentMessage,
    adapter: Arc<dyn Adapter>,
}

impl Deref for PostedMessage {
    type Target = SentMessage;

    fn deref(&self) -> &Self::Target {
        &self.sent
    }
}

impl PostedMessage {
    pub async fn edit(&self, postable: impl Into<Postable>) -> Result<SentMessage> {
        self.adapter
            .edit_message(&self.sent.thread_id, &self.sent.id, postable.into())
            .await
    }

    pub async fn delete(&self) -> Result<()> {
        self.adapter.delete_message(&self.sent.thread_id, &self.sent.id).await
    }

    pub async fn add_reaction(&self, emoji: &Emoji) -> Result<()> {
        self.adapter.add_reaction(&self.sent.thread_id, &self.sent.id, emoji).await
    }

    pub async fn remove_reaction(&self, emoji: &Emoji) -> Result<()> {
        self.adapter
            .remove_reaction(&self.sent.thread_id, &self.sent.id, emoji)
            .await
    }
}

pub struct Thread {
    id: ThreadId,
    adapter: Arc<dyn Adapter>,
    state: Arc<dyn StateStore>,
    channel_id: String,
    is_dm: bool,
    /// Set when the facade is constructed inside a subscribed-message
    /// dispatch, where the dispatcher has already confirmed subscription.
    known_subscribed: Option<bool>,
}

impl Thread {
    pub fn new(
        id: ThreadId,
        adapter: Arc<dyn Adapter>,
        state: Arc<dyn StateStore>,
        channel_id: String,
        is_dm: bool,
        known_subscribed: Option<bool>,
    ) -> Self {
        Self {
            id,
            adapter,
            state,
            channel_id,
            is_dm,
            known_subscribed,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn is_dm(&self) -> bool {
        self.is_dm
    }

    pub async fn is_subscribed(&self) -> Result<bool> {
        match self.known_subscribed {
            Some(v) => Ok(v),
            None => self.state.is_subscribed(&self.id).await,
        }
    }

    /// Adds the thread to the subscription set, then best-effort notifies the
    /// adapter. The subscription persists even if the adapter hook fails
    /// (at-least-once semantics for `on_thread_subscribe`).
    pub async fn subscribe(&self) -> Result<()> {
        self.state.subscribe(&self.id).await?;
        if let Err(err) = self.adapter.on_thread_subscribe(&self.id).await {
            tracing::warn!(thread_id = %self.id, error = %err, "on_thread_subscribe hook failed");
        }
        Ok(())
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.state.unsubscribe(&self.id).await
    }

    pub async fn post(&self, postable: impl Into<Postable>) -> Result<PostedMessage> {
        let sent = self.adapter.post_message(&self.id, postable.into()).await?;
        Ok(PostedMessage {
            sent,
            adapter: self.adapter.clone(),
        })
    }

    pub async fn start_typing(&self) -> Result<()> {
        self.adapter.start_typing(&self.id).await
    }

    pub async fn recent_messages(&self, limit: usize) -> Result<Vec<Message>> {
        let result = self
            .adapter
            .fetch_messages(
                &self.id,
                FetchOptions {
                    limit: Some(limit),
                    cursor: None,
                    direction: Some(FetchDirection::Backward),
                },
            )
            .await?;
        Ok(result.messages)
    }

    /// A lazy asynchronous sequence over every message in the thread, paging
    /// forward via `Adapter::fetch_messages` one page at a time.
    pub fn all_messages(&self, page_size: usize) -> Pin<Box<dyn Stream<Item = Result<Message>> + Send + '_>> {
        struct PagingState {
            cursor: Option<String>,
            buffer: std::vec::IntoIter<Message>,
            done: bool,
        }
        let state = PagingState {
            cursor: None,
            buffer: Vec::new().into_iter(),
            done: false,
        };
        Box::pin(futures::stream::unfold(state, move |mut st| async move {
            loop {
                if let Some(msg) = st.buffer.next() {
                    return Some((Ok(msg), st));
                }
                if st.done {
                    return None;
                }
                let page = self
                    .adapter
                    .fetch_messages(
                        &self.id,
                        FetchOptions {
                            limit: Some(page_size),
                            cursor: st.cursor.clone(),
                            direction: Some(FetchDirection::Forward),
                        },
                    )
                    .await;
                match page {
                    Ok(result) => {
                        st.cursor = result.next_cursor.clone();
                        st.done = result.next_cursor.is_none();
                        st.buffer = result.messages.into_iter();
                        if st.buffer.len() == 0 && st.done {
                            return None;
                        }
                    }
                    Err(err) => {
                        st.done = true;
                        return Some((Err(err), st));
                    }
                }
            }
        }))
    }

    pub async fn refresh(&self) -> Result<crate::types::ThreadInfo> {
        self.adapter.fetch_thread(&self.id).await
    }

    pub fn mention_user(&self, user_id: &str) -> String {
        self.adapter.render_mention(user_id)
    }
}
