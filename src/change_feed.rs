//! Change-feed contract consumed by the landing consumer
//!
//! A feed delivers notifications about plane documents, at least once, each
//! with an acknowledgement handle. Acknowledged notifications are never
//! delivered again to the same durable subscription; negatively acknowledged
//! or unacknowledged ones are redelivered.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::error;

use crate::planes::Plane;

/// Name of the plane field whose changes signal a landing (or departure)
pub const LANDED_AT_FIELD: &str = "landedAt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One change to one plane document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub operation_type: OperationType,
    /// Identifier of the changed plane
    pub document_key: String,
    /// Top-level field names touched by an update
    #[serde(default)]
    pub updated_fields: Vec<String>,
    /// Post-image of the document, when the publisher included one
    #[serde(default)]
    pub full_document: Option<Plane>,
}

impl ChangeNotification {
    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn touches(&self, field: &str) -> bool {
        self.updated_fields.iter().any(|f| f == field)
    }
}

/// Which notifications a subscription wants
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    pub operations: Vec<OperationType>,
    pub changed_field: String,
}

impl ChangeFilter {
    /// Updates that modified `landedAt`
    pub fn landings() -> Self {
        Self {
            operations: vec![OperationType::Update],
            changed_field: LANDED_AT_FIELD.to_string(),
        }
    }

    pub fn matches(&self, notification: &ChangeNotification) -> bool {
        self.operations.contains(&notification.operation_type)
            && notification.touches(&self.changed_field)
    }

    /// Subjects a broker-side filter should select, one per operation
    pub fn subjects(&self, subject_prefix: &str) -> Vec<String> {
        self.operations
            .iter()
            .map(|op| format!("{}.{}", subject_prefix, op))
            .collect()
    }
}

/// Settles a single delivery with the feed
#[async_trait]
pub trait DeliveryAck: Send + Sync {
    /// Processing finished, never redeliver
    async fn ack(&self) -> Result<()>;
    /// Processing failed, redeliver later
    async fn nak(&self) -> Result<()>;
}

/// A raw notification as delivered by the feed
pub struct FeedDelivery {
    /// Position of the notification in the feed, increasing
    pub sequence: u64,
    pub payload: Vec<u8>,
    pub ack: Arc<dyn DeliveryAck>,
}

impl std::fmt::Debug for FeedDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedDelivery")
            .field("sequence", &self.sequence)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

pub type DeliveryStream = BoxStream<'static, Result<FeedDelivery>>;

/// A durable subscription source
///
/// Every call to `subscribe` resumes after the last acknowledged delivery.
/// An `Err` item or the end of the stream means the subscription is lost.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, filter: &ChangeFilter) -> Result<DeliveryStream>;
}

/// Acknowledge, logging rather than propagating failures; an un-acked
/// delivery is simply redelivered.
pub async fn ack_delivery(ack: &dyn DeliveryAck, sequence: u64) {
    if let Err(e) = ack.ack().await {
        error!("Failed to ACK delivery {}: {} - will be redelivered", sequence, e);
        metrics::counter!("landing.feed.ack_error_total").increment(1);
    }
}

pub async fn nak_delivery(ack: &dyn DeliveryAck, sequence: u64) {
    if let Err(e) = ack.nak().await {
        error!("Failed to NAK delivery {}: {}", sequence, e);
        metrics::counter!("landing.feed.ack_error_total").increment(1);
    }
}
