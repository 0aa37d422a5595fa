use anyhow::{Context, Result};
use async_nats::jetstream::{
    self, AckKind,
    consumer::{AckPolicy, DeliverPolicy, pull::Config as PullConfig},
    context::Context as JetStreamContext,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::change_feed::{ChangeFeed, ChangeFilter, DeliveryAck, DeliveryStream, FeedDelivery};

/// Plane change notifications read from a NATS JetStream durable consumer
///
/// Publishers write one JSON [`crate::change_feed::ChangeNotification`] per
/// document change to `<subject_prefix>.<operationType>`. The durable
/// consumer remembers the last acknowledged message across restarts.
#[derive(Clone)]
pub struct JetStreamChangeFeed {
    jetstream: JetStreamContext,
    stream_name: String,
    subject_prefix: String,
    consumer_name: String,
    max_ack_pending: i64,
}

impl JetStreamChangeFeed {
    pub async fn connect(
        nats_url: &str,
        stream_name: String,
        subject_prefix: String,
        consumer_name: String,
        max_ack_pending: i64,
    ) -> Result<Self> {
        info!("Connecting to NATS at {}...", nats_url);
        let client = async_nats::ConnectOptions::new()
            .name("contrail-aggregator")
            .connect(nats_url)
            .await
            .with_context(|| format!("Failed to connect to NATS at {}", nats_url))?;
        info!("Connected to NATS");

        Ok(Self {
            jetstream: jetstream::new(client),
            stream_name,
            subject_prefix,
            consumer_name,
            max_ack_pending,
        })
    }

    async fn consumer(
        &self,
        filter: &ChangeFilter,
    ) -> Result<jetstream::consumer::Consumer<PullConfig>> {
        let stream = self
            .jetstream
            .get_stream(&self.stream_name)
            .await
            .with_context(|| format!("Failed to get JetStream stream '{}'", self.stream_name))?;

        if let Ok(consumer) = stream.get_consumer::<PullConfig>(&self.consumer_name).await {
            info!(
                "JetStream consumer '{}' already exists, resuming it",
                self.consumer_name
            );
            return Ok(consumer);
        }

        info!("Creating JetStream consumer '{}'...", self.consumer_name);
        let config = PullConfig {
            durable_name: Some(self.consumer_name.clone()),
            ack_policy: AckPolicy::Explicit,
            deliver_policy: DeliverPolicy::All,
            filter_subjects: filter.subjects(&self.subject_prefix),
            max_ack_pending: self.max_ack_pending,
            ..Default::default()
        };
        stream
            .create_consumer(config)
            .await
            .with_context(|| format!("Failed to create JetStream consumer '{}'", self.consumer_name))
    }
}

#[async_trait]
impl ChangeFeed for JetStreamChangeFeed {
    async fn subscribe(&self, filter: &ChangeFilter) -> Result<DeliveryStream> {
        let consumer = self.consumer(filter).await?;
        let messages = consumer
            .messages()
            .await
            .context("Failed to open JetStream message stream")?;
        info!(
            "Subscribed to '{}' on stream '{}'",
            self.consumer_name, self.stream_name
        );

        let deliveries = messages.map(|message| {
            let message =
                message.map_err(|e| anyhow::anyhow!("Error receiving message from JetStream: {}", e))?;
            let sequence = match message.info() {
                Ok(info) => info.stream_sequence,
                Err(e) => {
                    warn!("JetStream message without delivery info: {}", e);
                    0
                }
            };
            Ok(FeedDelivery {
                sequence,
                payload: message.payload.to_vec(),
                ack: Arc::new(JetStreamAck { message }) as Arc<dyn DeliveryAck>,
            })
        });
        Ok(deliveries.boxed())
    }
}

struct JetStreamAck {
    message: jetstream::Message,
}

#[async_trait]
impl DeliveryAck for JetStreamAck {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| anyhow::anyhow!("JetStream ACK failed: {}", e))
    }

    async fn nak(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| anyhow::anyhow!("JetStream NAK failed: {}", e))
    }
}
