//! Message store boundary
//!
//! The engine only needs three things from a store: append a message and get back an opaque
//! [`AckHandle`], drop it again once acknowledged, and page messages back in for recovery.
//! [`MemoryMessageStore`] is the in-process implementation used by embedded brokers and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::types::{DashMap, DestinationName, Message, MessageId};
use crate::Result;

pub const DEFAULT_MAX_MESSAGE_COUNT_RETURNED: usize = 100;

/// Store-issued handle of an enqueued message. Handles of one store sort in enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AckHandle(u64);

impl AckHandle {
    #[inline]
    pub fn new(sequence: u64) -> Self {
        AckHandle(sequence)
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub handle: AckHandle,
    pub message: Message,
}

/// Selects one page of messages to recover.
///
/// `start_id` is inclusive and `end_id` exclusive; ids that are not in the store select
/// nothing. `offset` skips messages after the start bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryContext {
    pub offset: usize,
    pub max_count: usize,
    pub start_id: Option<MessageId>,
    pub end_id: Option<MessageId>,
}

impl Default for RecoveryContext {
    fn default() -> Self {
        Self { offset: 0, max_count: DEFAULT_MAX_MESSAGE_COUNT_RETURNED, start_id: None, end_id: None }
    }
}

impl RecoveryContext {
    #[inline]
    pub fn builder() -> RecoveryContextBuilder {
        RecoveryContextBuilder::default()
    }

    /// The context selecting the page right after this one.
    #[inline]
    pub fn next_page(&self) -> Self {
        Self { offset: self.offset + self.max_count, ..self.clone() }
    }
}

#[derive(Default)]
pub struct RecoveryContextBuilder {
    ctx: RecoveryContext,
}

impl RecoveryContextBuilder {
    #[inline]
    pub fn offset(mut self, offset: usize) -> Self {
        self.ctx.offset = offset;
        self
    }

    #[inline]
    pub fn max_count(mut self, max_count: usize) -> Self {
        self.ctx.max_count = max_count.max(1);
        self
    }

    #[inline]
    pub fn start_id<I: Into<MessageId>>(mut self, id: I) -> Self {
        self.ctx.start_id = Some(id.into());
        self
    }

    #[inline]
    pub fn end_id<I: Into<MessageId>>(mut self, id: I) -> Self {
        self.ctx.end_id = Some(id.into());
        self
    }

    #[inline]
    pub fn build(self) -> RecoveryContext {
        self.ctx
    }
}

#[async_trait]
pub trait MessageStore: Sync + Send + 'static {
    ///Appends `message` to `destination`.
    async fn enqueue(&self, destination: &DestinationName, message: &Message) -> Result<AckHandle>;

    ///Removes an acknowledged or expired message, unknown handles are ignored.
    async fn dequeue(&self, destination: &DestinationName, handle: AckHandle) -> Result<()>;

    ///Returns one page of stored messages in enqueue order.
    async fn recover_range(&self, destination: &DestinationName, ctx: &RecoveryContext) -> Result<Vec<StoredMessage>>;

    #[inline]
    async fn count(&self, _destination: &DestinationName) -> Result<usize> {
        Ok(0)
    }
}

/// Pages through `destination` lazily, starting at `ctx` and stopping after the first short page.
///
/// Pages are addressed by offset, so the store must not be modified while the stream is read.
pub fn recover_stream(
    store: Arc<dyn MessageStore>,
    destination: DestinationName,
    ctx: RecoveryContext,
) -> impl Stream<Item = Result<StoredMessage>> {
    let ctx = RecoveryContext { max_count: ctx.max_count.max(1), ..ctx };
    stream::unfold(Some(ctx), move |ctx| {
        let store = store.clone();
        let destination = destination.clone();
        async move {
            let ctx = ctx?;
            match store.recover_range(&destination, &ctx).await {
                Ok(page) => {
                    let next = if page.len() < ctx.max_count { None } else { Some(ctx.next_page()) };
                    Some((page.into_iter().map(Ok).collect::<Vec<_>>(), next))
                }
                Err(e) => Some((vec![Err(e)], None)),
            }
        }
    })
    .flat_map(stream::iter)
}

#[derive(Default)]
pub struct MemoryMessageStore {
    next: AtomicU64,
    queues: DashMap<DestinationName, BTreeMap<AckHandle, Message>>,
}

impl MemoryMessageStore {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn enqueue(&self, destination: &DestinationName, message: &Message) -> Result<AckHandle> {
        let handle = AckHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1);
        self.queues.entry(destination.clone()).or_default().insert(handle, message.clone());
        Ok(handle)
    }

    async fn dequeue(&self, destination: &DestinationName, handle: AckHandle) -> Result<()> {
        if let Some(mut q) = self.queues.get_mut(destination) {
            q.remove(&handle);
        }
        Ok(())
    }

    async fn recover_range(&self, destination: &DestinationName, ctx: &RecoveryContext) -> Result<Vec<StoredMessage>> {
        let q = match self.queues.get(destination) {
            Some(q) => q,
            None => return Ok(Vec::new()),
        };
        let mut started = ctx.start_id.is_none();
        let page = q
            .iter()
            .skip_while(|(_, m)| {
                if !started && ctx.start_id.as_ref() == Some(&m.id) {
                    started = true;
                }
                !started
            })
            .take_while(|(_, m)| ctx.end_id.as_ref() != Some(&m.id))
            .skip(ctx.offset)
            .take(ctx.max_count)
            .map(|(handle, m)| StoredMessage { handle: *handle, message: m.clone() })
            .collect();
        Ok(page)
    }

    async fn count(&self, destination: &DestinationName) -> Result<usize> {
        Ok(self.queues.get(destination).map(|q| q.len()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    async fn filled(n: usize) -> (Arc<MemoryMessageStore>, DestinationName, Vec<Message>) {
        let store = Arc::new(MemoryMessageStore::new());
        let dest = DestinationName::from("orders");
        let mut msgs = Vec::new();
        for i in 0..n {
            let m = Message::new(dest.clone(), format!("m{i}"));
            store.enqueue(&dest, &m).await.unwrap();
            msgs.push(m);
        }
        (store, dest, msgs)
    }

    #[tokio::test]
    async fn recover_range_bounds() {
        let (store, dest, msgs) = filled(10).await;

        let all = store.recover_range(&dest, &RecoveryContext::default()).await.unwrap();
        assert_eq!(all.len(), 10);
        assert!(all.windows(2).all(|w| w[0].handle < w[1].handle));

        let ctx = RecoveryContext::builder().offset(2).max_count(3).build();
        let page = store.recover_range(&dest, &ctx).await.unwrap();
        let ids: Vec<_> = page.iter().map(|s| s.message.id.clone()).collect();
        assert_eq!(ids, vec![msgs[2].id.clone(), msgs[3].id.clone(), msgs[4].id.clone()]);

        let ctx = RecoveryContext::builder().start_id(msgs[5].id.clone()).end_id(msgs[8].id.clone()).build();
        let page = store.recover_range(&dest, &ctx).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].message.id, msgs[5].id);

        let ctx = RecoveryContext::builder().start_id("missing").build();
        assert!(store.recover_range(&dest, &ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dequeue_removes() {
        let (store, dest, _) = filled(3).await;
        let page = store.recover_range(&dest, &RecoveryContext::default()).await.unwrap();
        store.dequeue(&dest, page[1].handle).await.unwrap();
        store.dequeue(&dest, AckHandle::new(9999)).await.unwrap();
        assert_eq!(store.count(&dest).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn stream_pages_through_everything() {
        let (store, dest, msgs) = filled(25).await;
        let ctx = RecoveryContext::builder().max_count(10).build();
        let recovered: Vec<StoredMessage> = recover_stream(store.clone(), dest.clone(), ctx).try_collect().await.unwrap();
        assert_eq!(recovered.len(), 25);
        assert_eq!(recovered[24].message.id, msgs[24].id);

        //restart from the middle by range
        let ctx = RecoveryContext::builder().start_id(msgs[20].id.clone()).max_count(2).build();
        let tail: Vec<StoredMessage> = recover_stream(store, dest, ctx).try_collect().await.unwrap();
        assert_eq!(tail.len(), 5);
    }

    #[tokio::test]
    async fn zero_sized_pages_still_advance() {
        let (store, dest, _) = filled(3).await;
        let ctx = RecoveryContext { max_count: 0, ..Default::default() };
        let recovered = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            recover_stream(store, dest, ctx).try_collect::<Vec<_>>(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(recovered.len(), 3);
    }
}
