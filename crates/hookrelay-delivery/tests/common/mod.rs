#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hookrelay_delivery::{
    DeliveryConfig, DeliveryError, DrainOrchestrator, ManualClock, QueueMode, TransportClient,
    TransportResponse,
};
use serde_json::Value;
use time::OffsetDateTime;
use time::macros::datetime;

pub const NOW: OffsetDateTime = datetime!(2024-06-03 14:00 UTC);

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub url: String,
    pub payload: Value,
    pub secret: Option<String>,
}

/// Transport double: replays scripted outcomes (200 once the script runs
/// out) and records every call. Optionally moves the clock on each call.
#[derive(Default)]
pub struct RecordingTransport {
    script: Mutex<VecDeque<Result<TransportResponse, DeliveryError>>>,
    calls: Mutex<Vec<RecordedCall>>,
    tick: Option<(ManualClock, time::Duration)>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ticking(clock: ManualClock, per_call: time::Duration) -> Self {
        Self {
            tick: Some((clock, per_call)),
            ..Self::default()
        }
    }

    pub fn respond(self, status: u16) -> Self {
        self.script.lock().unwrap().push_back(Ok(TransportResponse {
            status,
            body: format!("status {status}"),
        }));
        self
    }

    pub fn fail(self, error: DeliveryError) -> Self {
        self.script.lock().unwrap().push_back(Err(error));
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// The `row` field of every payload posted so far, in posting order.
    pub fn posted_rows(&self) -> Vec<i64> {
        self.calls()
            .iter()
            .flat_map(|call| {
                call.payload
                    .as_object()
                    .into_iter()
                    .flat_map(|body| body.iter())
                    .filter(|(key, _)| key.as_str() != "timestamp")
                    .flat_map(|(_, payloads)| payloads.as_array().cloned().unwrap_or_default())
                    .filter_map(|payload| payload["row"].as_i64())
                    .collect::<Vec<_>>()
            })
            .collect()
    }
}

#[async_trait]
impl TransportClient for RecordingTransport {
    async fn post(
        &self,
        url: &str,
        payload: &Value,
        secret: Option<&str>,
    ) -> Result<TransportResponse, DeliveryError> {
        self.calls.lock().unwrap().push(RecordedCall {
            url: url.to_string(),
            payload: payload.clone(),
            secret: secret.map(str::to_string),
        });
        if let Some((clock, step)) = &self.tick {
            clock.advance(*step);
        }
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(TransportResponse {
            status: 200,
            body: "ok".into(),
        }))
    }
}

pub fn queued_config() -> DeliveryConfig {
    DeliveryConfig {
        queue_mode: QueueMode::Queued,
        ..Default::default()
    }
}

pub fn orchestrator(
    config: DeliveryConfig,
    clock: &ManualClock,
    storage: &Arc<hookrelay_delivery::InMemoryWebhookStorage>,
    transport: &Arc<RecordingTransport>,
) -> DrainOrchestrator {
    DrainOrchestrator::new(
        Arc::new(config),
        Arc::new(clock.clone()),
        storage.clone(),
        storage.clone(),
        storage.clone(),
        transport.clone(),
    )
}
