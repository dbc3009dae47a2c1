//! Pub/sub for classified traffic events with payload/host sanitisation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const REDACTION_TOKEN: &str = "[redacted]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventCategory {
    Observation,
    Burst,
    Policy,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventConfidence {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficEvent {
    pub id: Uuid,
    pub timestamp_ms: u64,
    pub category: EventCategory,
    pub confidence: EventConfidence,
    pub details: BTreeMap<String, Value>,
}

impl TrafficEvent {
    pub fn new(category: EventCategory, confidence: EventConfidence) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp_ms: crate::sample::unix_nanos_now() / 1_000_000,
            category,
            confidence,
            details: BTreeMap::new(),
        }
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// Sanitises events before they reach listeners: `payload` keys are always
/// stripped; host-shaped values are tokenised when enabled, unless
/// allow-listed.
#[derive(Default, Clone)]
pub struct Redactor {
    pub redact_hosts: bool,
    allow_list: HashSet<String>,
}

impl Redactor {
    pub fn new(redact_hosts: bool, allow_list: impl IntoIterator<Item = String>) -> Self {
        Self {
            redact_hosts,
            allow_list: allow_list
                .into_iter()
                .map(|entry| entry.to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn redact(&self, mut event: TrafficEvent) -> TrafficEvent {
        event.details.retain(|key, _| key != "payload");
        if self.redact_hosts {
            for (key, value) in event.details.iter_mut() {
                let lowered = key.to_ascii_lowercase();
                if !lowered.contains("host") && !lowered.contains("domain") {
                    continue;
                }
                let allowed = value
                    .as_str()
                    .map(|text| self.allow_list.contains(&text.to_ascii_lowercase()))
                    .unwrap_or(false);
                if !allowed {
                    *value = Value::String(REDACTION_TOKEN.to_string());
                }
            }
        }
        event
    }
}

pub type EventListener = Box<dyn Fn(&TrafficEvent) + Send>;

/// The synchronous dispatch core owned by the bus worker.
pub struct EventDispatcher {
    redactor: Redactor,
    listeners: Vec<(u64, EventListener)>,
}

impl EventDispatcher {
    pub fn new(redactor: Redactor) -> Self {
        Self {
            redactor,
            listeners: Vec::new(),
        }
    }

    pub fn add_listener(&mut self, token: u64, listener: EventListener) {
        self.listeners.push((token, listener));
    }

    pub fn remove_listener(&mut self, token: u64) {
        self.listeners.retain(|(id, _)| *id != token);
    }

    pub fn publish(&self, event: TrafficEvent) {
        let event = self.redactor.redact(event);
        for (_, listener) in &self.listeners {
            listener(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

enum BusCommand {
    Publish(Box<TrafficEvent>),
    AddListener(u64, EventListener),
    RemoveListener(u64),
}

/// Multi-listener bus. Callbacks run on the bus's serial executor in publish
/// order for a single publisher.
#[derive(Clone)]
pub struct TrafficEventBus {
    tx: mpsc::UnboundedSender<BusCommand>,
    next_token: Arc<AtomicU64>,
}

impl TrafficEventBus {
    pub fn spawn(redactor: Redactor, runtime: &tokio::runtime::Handle) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        runtime.spawn(async move {
            let mut dispatcher = EventDispatcher::new(redactor);
            while let Some(command) = rx.recv().await {
                match command {
                    BusCommand::Publish(event) => dispatcher.publish(*event),
                    BusCommand::AddListener(token, listener) => {
                        dispatcher.add_listener(token, listener)
                    }
                    BusCommand::RemoveListener(token) => dispatcher.remove_listener(token),
                }
            }
        });
        Self {
            tx,
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn add_listener(&self, listener: EventListener) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(BusCommand::AddListener(token, listener));
        token
    }

    pub fn remove_listener(&self, token: u64) {
        let _ = self.tx.send(BusCommand::RemoveListener(token));
    }

    pub fn publish(&self, event: TrafficEvent) {
        let _ = self.tx.send(BusCommand::Publish(Box::new(event)));
    }
}
