//! Stage handler invocation.
//!
//! A stage handler is a network collaborator: it performs the stage's work
//! and commits its own entity state. The orchestrator only fires the call
//! and observes the outcome; it never writes the handler's target state.

use adweave_core::error::{AdweaveError, AdweaveResult};
use adweave_core::types::StageCallPayload;
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Seam for invoking stage handlers.
#[async_trait]
pub trait StageInvoker: Send + Sync {
    /// Invoke the handler behind `subject` with the given payload.
    /// `subject` is the handler's subject suffix (e.g. `stage.overlay`).
    async fn invoke(&self, subject: &str, payload: &StageCallPayload) -> AdweaveResult<()>;
}

/// Production invoker: NATS request/reply with a generous timeout, since
/// stage work (model inference, rendering) can run for tens of minutes.
pub struct NatsInvoker {
    client: async_nats::Client,
    subject_prefix: String,
    timeout: Duration,
}

impl NatsInvoker {
    pub fn new(client: async_nats::Client, subject_prefix: String, timeout: Duration) -> Self {
        Self {
            client,
            subject_prefix,
            timeout,
        }
    }
}

#[async_trait]
impl StageInvoker for NatsInvoker {
    async fn invoke(&self, subject: &str, payload: &StageCallPayload) -> AdweaveResult<()> {
        let full_subject = format!("{}.{}", self.subject_prefix, subject);
        let bytes = serde_json::to_vec(payload)?;

        debug!(subject = %full_subject, job_id = %payload.job_id, "Invoking stage handler");

        match tokio::time::timeout(self.timeout, self.client.request(full_subject, bytes.into()))
            .await
        {
            Ok(Ok(_reply)) => Ok(()),
            Ok(Err(e)) => Err(AdweaveError::Invoke(e.to_string())),
            Err(_) => Err(AdweaveError::InvokeTimeout(self.timeout.as_secs())),
        }
    }
}

/// Test invoker: records every call and fails on configured subjects.
#[derive(Default)]
pub struct RecordingInvoker {
    calls: Mutex<Vec<(String, StageCallPayload)>>,
    fail_subjects: Mutex<Vec<String>>,
}

impl RecordingInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent invocations of `subject` return an error.
    pub fn fail_on(&self, subject: impl Into<String>) {
        self.fail_subjects
            .lock()
            .expect("invoker mutex poisoned")
            .push(subject.into());
    }

    pub fn calls(&self) -> Vec<(String, StageCallPayload)> {
        self.calls.lock().expect("invoker mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.calls.lock().expect("invoker mutex poisoned").len()
    }

    pub fn count_subject(&self, subject: &str) -> usize {
        self.calls
            .lock()
            .expect("invoker mutex poisoned")
            .iter()
            .filter(|(s, _)| s == subject)
            .count()
    }

    pub fn clear(&self) {
        self.calls.lock().expect("invoker mutex poisoned").clear();
    }
}

#[async_trait]
impl StageInvoker for RecordingInvoker {
    async fn invoke(&self, subject: &str, payload: &StageCallPayload) -> AdweaveResult<()> {
        self.calls
            .lock()
            .expect("invoker mutex poisoned")
            .push((subject.to_string(), payload.clone()));
        let should_fail = self
            .fail_subjects
            .lock()
            .expect("invoker mutex poisoned")
            .iter()
            .any(|s| s == subject);
        if should_fail {
            Err(AdweaveError::Invoke(format!("scripted failure for {subject}")))
        } else {
            Ok(())
        }
    }
}
