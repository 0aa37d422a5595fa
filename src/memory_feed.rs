//! In-process change feed for tests and local runs

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::change_feed::{
    ChangeFeed, ChangeFilter, ChangeNotification, DeliveryAck, DeliveryStream, FeedDelivery,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Naked,
}

/// Remembers how a delivery was settled
pub struct RecordingAck {
    state: watch::Sender<Option<Settlement>>,
}

impl Default for RecordingAck {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingAck {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self { state }
    }

    pub fn settlement(&self) -> Option<Settlement> {
        *self.state.borrow()
    }

    /// Wait until the delivery is acked or naked
    pub async fn settled(&self) -> Settlement {
        let mut rx = self.state.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(state) => (*state).unwrap_or(Settlement::Naked),
            // sender lives in self
            Err(_) => Settlement::Naked,
        }
    }
}

#[async_trait]
impl DeliveryAck for RecordingAck {
    async fn ack(&self) -> Result<()> {
        self.state.send_replace(Some(Settlement::Acked));
        Ok(())
    }

    async fn nak(&self) -> Result<()> {
        self.state.send_replace(Some(Settlement::Naked));
        Ok(())
    }
}

type SessionItem = Result<FeedDelivery>;

/// Feed whose subscriptions are scripted ahead of time
///
/// Each call to [`ChangeFeed::subscribe`] takes the next session opened with
/// [`ChannelFeed::open_session`]. Once none remain, subscribing yields a
/// stream that never produces anything.
#[derive(Clone, Default)]
pub struct ChannelFeed {
    sessions: Arc<Mutex<VecDeque<flume::Receiver<SessionItem>>>>,
    subscriptions: Arc<AtomicU32>,
    next_sequence: Arc<AtomicU64>,
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_session(&self) -> FeedSession {
        let (tx, rx) = flume::unbounded();
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.push_back(rx);
        }
        FeedSession {
            tx,
            next_sequence: self.next_sequence.clone(),
        }
    }

    /// Number of times a consumer has subscribed
    pub fn subscriptions(&self) -> u32 {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChangeFeed for ChannelFeed {
    async fn subscribe(&self, _filter: &ChangeFilter) -> Result<DeliveryStream> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let next = self
            .sessions
            .lock()
            .map_err(|_| anyhow::anyhow!("feed session list poisoned"))?
            .pop_front();
        Ok(match next {
            Some(rx) => rx.into_stream().boxed(),
            None => futures_util::stream::pending().boxed(),
        })
    }
}

/// Producer side of one scripted subscription; dropping it ends the stream
pub struct FeedSession {
    tx: flume::Sender<SessionItem>,
    next_sequence: Arc<AtomicU64>,
}

impl FeedSession {
    pub fn publish(&self, notification: &ChangeNotification) -> Arc<RecordingAck> {
        let payload = serde_json::to_vec(notification).unwrap_or_default();
        self.publish_raw(payload)
    }

    pub fn publish_raw(&self, payload: Vec<u8>) -> Arc<RecordingAck> {
        let ack = Arc::new(RecordingAck::new());
        let delivery = FeedDelivery {
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1,
            payload,
            ack: ack.clone(),
        };
        let _ = self.tx.send(Ok(delivery));
        ack
    }

    /// Break the subscription with an error item
    pub fn fail(&self, reason: &str) {
        let _ = self.tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}
