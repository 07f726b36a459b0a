use crate::db::DbPool;
use crate::error::{ChatError, ChatResult};
use crate::messages::list_messages;
use crate::model::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

/// Something delivered to a feed subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// The complete, ordered message set. Replaces whatever the subscriber held.
    Snapshot(Vec<Message>),
    /// The feed failed and has stopped. Re-subscribe to resume.
    Failed(ChatError),
}

/// Fan-out of "conversation changed" signals to live feeds.
#[derive(Clone)]
pub struct FeedHub {
    pool: DbPool,
    changes: broadcast::Sender<Uuid>,
    active: Arc<Mutex<HashMap<Uuid, usize>>>,
}

impl FeedHub {
    pub fn new(pool: DbPool) -> Self {
        let (changes, _rx) = broadcast::channel(256);
        Self {
            pool,
            changes,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Signal that the message set of a conversation changed.
    pub fn publish(&self, conversation_id: Uuid) {
        // no receivers is fine
        let _ = self.changes.send(conversation_id);
    }

    /// Start a live feed. The first event is the current snapshot; every later
    /// change to the conversation produces a fresh one.
    pub fn subscribe(&self, conversation_id: Uuid) -> MessageFeed {
        // subscribe before the first read so no change can slip in between
        let changes = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(run_feed(self.pool.clone(), conversation_id, changes, tx));
        *self.active.lock().entry(conversation_id).or_insert(0) += 1;
        debug!(conversation = %conversation_id, "feed opened");
        MessageFeed {
            conversation_id,
            rx,
            task,
            active: self.active.clone(),
        }
    }

    /// Number of live feeds currently open on a conversation.
    pub fn active_subscriptions(&self, conversation_id: &Uuid) -> usize {
        self.active
            .lock()
            .get(conversation_id)
            .copied()
            .unwrap_or(0)
    }
}

/// Handle to one live feed. Dropping it unsubscribes.
pub struct MessageFeed {
    conversation_id: Uuid,
    rx: mpsc::Receiver<FeedEvent>,
    task: JoinHandle<()>,
    active: Arc<Mutex<HashMap<Uuid, usize>>>,
}

impl MessageFeed {
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Wait for the next event. `None` once the feed has ended.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for MessageFeed {
    fn drop(&mut self) {
        self.task.abort();
        let mut active = self.active.lock();
        if let Some(n) = active.get_mut(&self.conversation_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                active.remove(&self.conversation_id);
            }
        }
        debug!(conversation = %self.conversation_id, "feed closed");
    }
}

async fn load_snapshot(pool: DbPool, conversation_id: Uuid) -> ChatResult<Vec<Message>> {
    tokio::task::spawn_blocking(move || {
        let conn = pool.get()?;
        list_messages(&conn, &conversation_id)
    })
    .await?
}

/// Returns false when the feed should stop.
async fn deliver(pool: &DbPool, conversation_id: Uuid, out: &mpsc::Sender<FeedEvent>) -> bool {
    match load_snapshot(pool.clone(), conversation_id).await {
        Ok(messages) => out.send(FeedEvent::Snapshot(messages)).await.is_ok(),
        Err(e) => {
            warn!(conversation = %conversation_id, error = %e, "feed read failed");
            let _ = out
                .send(FeedEvent::Failed(ChatError::Subscription(e.to_string())))
                .await;
            false
        }
    }
}

async fn run_feed(
    pool: DbPool,
    conversation_id: Uuid,
    mut changes: broadcast::Receiver<Uuid>,
    out: mpsc::Sender<FeedEvent>,
) {
    if !deliver(&pool, conversation_id, &out).await {
        return;
    }
    loop {
        let mut dirty = match changes.recv().await {
            Ok(id) => id == conversation_id,
            // missed signals; a full resync covers whatever they were
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(conversation = %conversation_id, skipped = n, "feed lagged, resyncing");
                true
            }
            Err(broadcast::error::RecvError::Closed) => {
                let _ = out
                    .send(FeedEvent::Failed(ChatError::Subscription(
                        "change stream closed".into(),
                    )))
                    .await;
                return;
            }
        };
        // coalesce signals that are already queued into one snapshot
        loop {
            match changes.try_recv() {
                Ok(id) => dirty |= id == conversation_id,
                Err(broadcast::error::TryRecvError::Lagged(_)) => dirty = true,
                Err(_) => break,
            }
        }
        if dirty && !deliver(&pool, conversation_id, &out).await {
            return;
        }
    }
}
