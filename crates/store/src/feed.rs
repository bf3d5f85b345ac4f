//! NATS-backed change feed.
//!
//! Stage handlers publish a notification after committing entity state; the
//! feed subscribes both channels and hands decoded events to the listener.
//! Malformed payloads are logged and skipped, never fatal. Transport
//! reconnects are handled by the async-nats client itself.

use crate::ChangeFeed;
use adweave_core::types::{ChangeEvent, JobChange, VariantChange};
use async_trait::async_trait;
use tokio_stream::StreamExt;
use tracing::{info, warn};

/// Subscriber over the `jobs.changed` and `variants.changed` subjects.
pub struct NatsChangeFeed {
    jobs: async_nats::Subscriber,
    variants: async_nats::Subscriber,
}

impl NatsChangeFeed {
    /// Subscribe to both change channels under the given subject prefix.
    pub async fn subscribe(
        client: &async_nats::Client,
        subject_prefix: &str,
    ) -> anyhow::Result<Self> {
        let jobs_subject = format!("{subject_prefix}.jobs.changed");
        let variants_subject = format!("{subject_prefix}.variants.changed");

        let jobs = client.subscribe(jobs_subject.clone()).await?;
        let variants = client.subscribe(variants_subject.clone()).await?;

        info!(
            jobs = %jobs_subject,
            variants = %variants_subject,
            "Subscribed to change channels"
        );
        Ok(Self { jobs, variants })
    }

    fn decode_job(payload: &[u8]) -> Option<ChangeEvent> {
        match serde_json::from_slice::<JobChange>(payload) {
            Ok(change) => Some(ChangeEvent::Job(change)),
            Err(e) => {
                warn!(error = %e, "Failed to deserialize job change notification");
                metrics::counter!("feed.decode_errors").increment(1);
                None
            }
        }
    }

    fn decode_variant(payload: &[u8]) -> Option<ChangeEvent> {
        match serde_json::from_slice::<VariantChange>(payload) {
            Ok(change) => Some(ChangeEvent::Variant(change)),
            Err(e) => {
                warn!(error = %e, "Failed to deserialize variant change notification");
                metrics::counter!("feed.decode_errors").increment(1);
                None
            }
        }
    }
}

#[async_trait]
impl ChangeFeed for NatsChangeFeed {
    async fn recv(&mut self) -> Option<ChangeEvent> {
        loop {
            tokio::select! {
                msg = self.jobs.next() => match msg {
                    Some(msg) => {
                        if let Some(event) = Self::decode_job(&msg.payload) {
                            return Some(event);
                        }
                    }
                    None => {
                        warn!("Job change subscription ended");
                        return None;
                    }
                },
                msg = self.variants.next() => match msg {
                    Some(msg) => {
                        if let Some(event) = Self::decode_variant(&msg.payload) {
                            return Some(event);
                        }
                    }
                    None => {
                        warn!("Variant change subscription ended");
                        return None;
                    }
                },
            }
        }
    }
}
