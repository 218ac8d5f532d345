//! Alarm dispatcher
//!
//! Fire-and-continue delivery of alarms to external targets:
//! - [`AlarmDispatcher::push`] never waits. It offers the request to a bounded queue
//!   per target and returns; a full queue drops the request for that target and
//!   counts it.
//! - Each target has a fixed pool of delivery workers, so one slow or unreachable
//!   target never delays another.
//! - Every attempt is timeout-bounded. Failed attempts are retried with exponential
//!   backoff up to the target's `max_attempts`; after that the request is dropped and
//!   exactly one exhaustion is recorded in [`Diagnostics`].
//! - [`AlarmDispatcher::shutdown`] closes the queues, lets workers drain for the grace
//!   period and then aborts whatever is still in flight.

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{AlarmConfig, AlarmTargetConfig};
use crate::diagnostics::Diagnostics;
use crate::error::AlarmDeliveryError;
use crate::health::fault::{FaultCode, Severity};
use crate::link::ChannelId;

/// What an alarm is about
#[derive(Debug, Clone, PartialEq)]
pub enum AlarmSubject {
    /// Raised or resolved fault
    Fault(FaultCode),
    /// Cycle classified as leaking
    Leak {
        /// Channel of the cycle
        channel: ChannelId,
        /// Cycle sequence on that channel
        sequence: u64,
    },
}

/// One alarm, owned by the dispatcher once pushed
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmRequest {
    /// Unique per request, repeated on every retry
    pub id: Uuid,
    /// Fault or leak
    pub subject: AlarmSubject,
    /// Severity at push time
    pub severity: Severity,
    /// Operator-facing text
    pub message: String,
    /// When the request was built
    pub created_at: DateTime<Utc>,
}

impl AlarmRequest {
    /// Request stamped with a fresh id and the current time
    pub fn new(subject: AlarmSubject, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject,
            severity,
            message: message.into(),
            created_at: Utc::now(),
        }
    }

    /// Alarm about a fault code
    pub fn fault(code: FaultCode, severity: Severity, message: impl Into<String>) -> Self {
        Self::new(AlarmSubject::Fault(code), severity, message)
    }

    /// Positive leak detection on one cycle
    pub fn leak(channel: ChannelId, sequence: u64, probability: f64) -> Self {
        Self::new(
            AlarmSubject::Leak { channel, sequence },
            Severity::Error,
            format!("Leak detected on channel {channel} (cycle {sequence}, p_no_leak={probability:.4})"),
        )
    }

    /// Reference string for leak events, e.g. `leak:ch3:seq12`
    pub fn event_ref(&self) -> Option<String> {
        match self.subject {
            AlarmSubject::Leak { channel, sequence } => Some(format!("leak:ch{channel}:seq{sequence}")),
            AlarmSubject::Fault(_) => None,
        }
    }

    /// Wire body for one target
    pub fn payload<'a>(&'a self, source: &'a str) -> AlarmPayload<'a> {
        let (fault_code, channel) = match self.subject {
            AlarmSubject::Fault(code) => (Some(code.as_str()), None),
            AlarmSubject::Leak { channel, .. } => (None, Some(channel)),
        };
        AlarmPayload {
            id: self.id,
            source,
            fault_code,
            event_ref: self.event_ref(),
            channel,
            severity: self.severity,
            message: &self.message,
            timestamp: self.created_at,
        }
    }
}

/// JSON body sent to alarm targets
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlarmPayload<'a> {
    /// Request id
    pub id: Uuid,
    /// Name of this monitor instance
    pub source: &'a str,
    /// Code such as `F001`, for fault alarms
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault_code: Option<&'static str>,
    /// Leak reference, for leak alarms
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_ref: Option<String>,
    /// Channel, for leak alarms
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelId>,
    /// Alarm severity
    pub severity: Severity,
    /// Operator-facing text
    pub message: &'a str,
    /// Creation time of the request
    pub timestamp: DateTime<Utc>,
}

/// One external alarm endpoint
#[async_trait]
pub trait AlarmTarget: Send + Sync {
    /// Target name used in logs and errors
    fn name(&self) -> &str;

    /// Single delivery attempt
    async fn deliver(&self, payload: &AlarmPayload<'_>) -> Result<(), AlarmDeliveryError>;
}

/// Retry policy for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryPolicy {
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Attempts before the alarm is dropped
    pub max_attempts: u32,
    /// Delay after the first failure, doubled per attempt
    pub backoff: Duration,
}

impl DeliveryPolicy {
    /// Delay after failed attempt `attempt` (1-based)
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff.saturating_mul(factor)
    }
}

impl From<&AlarmTargetConfig> for DeliveryPolicy {
    fn from(config: &AlarmTargetConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

/// Dispatcher sizing
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Sent as `source` in every payload
    pub source: String,
    /// Pending requests per target
    pub queue_capacity: usize,
    /// Concurrent deliveries per target
    pub workers_per_target: usize,
    /// How long shutdown waits for in-flight deliveries
    pub shutdown_grace: Duration,
}

impl From<&AlarmConfig> for DispatcherSettings {
    fn from(config: &AlarmConfig) -> Self {
        Self {
            source: config.source.clone(),
            queue_capacity: config.queue_capacity.max(1),
            workers_per_target: config.workers_per_target.max(1),
            shutdown_grace: Duration::from_millis(config.shutdown_grace_ms),
        }
    }
}

struct TargetQueue {
    name: String,
    tx: mpsc::Sender<Arc<AlarmRequest>>,
}

/// Non-blocking fan-out of alarms to every configured target
pub struct AlarmDispatcher {
    queues: Mutex<Vec<TargetQueue>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    diagnostics: Arc<Diagnostics>,
    shutdown_grace: Duration,
}

impl AlarmDispatcher {
    /// Spawn the worker pools. Must be called inside a Tokio runtime.
    pub fn new(
        settings: DispatcherSettings,
        targets: Vec<(Arc<dyn AlarmTarget>, DeliveryPolicy)>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let source: Arc<str> = Arc::from(settings.source.as_str());
        let mut queues = Vec::with_capacity(targets.len());
        let mut workers = Vec::new();

        for (target, policy) in targets {
            let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
            let rx = Arc::new(tokio::sync::Mutex::new(rx));
            for _ in 0..settings.workers_per_target.max(1) {
                workers.push(tokio::spawn(delivery_worker(
                    target.clone(),
                    policy,
                    rx.clone(),
                    source.clone(),
                    diagnostics.clone(),
                )));
            }
            tracing::info!(
                target = target.name(),
                workers = settings.workers_per_target,
                max_attempts = policy.max_attempts,
                "Alarm target registered"
            );
            queues.push(TargetQueue {
                name: target.name().to_string(),
                tx,
            });
        }

        Self {
            queues: Mutex::new(queues),
            workers: Mutex::new(workers),
            diagnostics,
            shutdown_grace: settings.shutdown_grace,
        }
    }

    /// Dispatcher that accepts and drops every request
    pub fn disabled(diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            queues: Mutex::new(Vec::new()),
            workers: Mutex::new(Vec::new()),
            diagnostics,
            shutdown_grace: Duration::ZERO,
        }
    }

    /// HTTP targets described by configuration; empty when alarms are disabled
    pub fn http_targets(config: &AlarmConfig) -> Vec<(Arc<dyn AlarmTarget>, DeliveryPolicy)> {
        if !config.enabled {
            tracing::info!("Alarm dispatch disabled");
            return Vec::new();
        }
        config
            .targets
            .iter()
            .map(|t| {
                let target: Arc<dyn AlarmTarget> = Arc::new(http::HttpTarget::new(&t.name, &t.url));
                (target, DeliveryPolicy::from(t))
            })
            .collect()
    }

    /// Targets still accepting requests
    pub fn target_count(&self) -> usize {
        self.queues.lock().len()
    }

    /// Hand a request to every target without waiting.
    ///
    /// Returns the number of targets that accepted it.
    pub fn push(&self, request: AlarmRequest) -> usize {
        let request = Arc::new(request);
        let queues = self.queues.lock();
        let mut accepted = 0;

        for queue in queues.iter() {
            match queue.tx.try_send(request.clone()) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    self.diagnostics.record_alarm_rejected();
                    let reason = match e {
                        mpsc::error::TrySendError::Full(_) => "queue full",
                        mpsc::error::TrySendError::Closed(_) => "queue closed",
                    };
                    tracing::warn!(
                        target = %queue.name,
                        alarm = %request.id,
                        reason,
                        "Alarm not queued"
                    );
                }
            }
        }
        tracing::debug!(alarm = %request.id, severity = %request.severity, accepted, "Alarm pushed");
        accepted
    }

    /// Close all queues, drain for the grace period, then abort remaining deliveries
    pub async fn shutdown(&self) {
        self.queues.lock().clear();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }

        let aborts: Vec<_> = workers.iter().map(JoinHandle::abort_handle).collect();
        let drained = tokio::time::timeout(self.shutdown_grace, futures::future::join_all(workers)).await;
        if drained.is_err() {
            for handle in aborts {
                handle.abort();
            }
            tracing::warn!(
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "Alarm deliveries abandoned at shutdown"
            );
        } else {
            tracing::info!("Alarm dispatcher drained");
        }
    }
}

async fn delivery_worker(
    target: Arc<dyn AlarmTarget>,
    policy: DeliveryPolicy,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Arc<AlarmRequest>>>>,
    source: Arc<str>,
    diagnostics: Arc<Diagnostics>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(request) = next else {
            break;
        };
        deliver_with_retry(target.as_ref(), policy, &request, &source, &diagnostics).await;
    }
}

/// Attempt delivery up to `max_attempts` times. Returns whether it succeeded.
pub async fn deliver_with_retry(
    target: &dyn AlarmTarget,
    policy: DeliveryPolicy,
    request: &AlarmRequest,
    source: &str,
    diagnostics: &Diagnostics,
) -> bool {
    let payload = request.payload(source);
    let attempts = policy.max_attempts.max(1);

    for attempt in 1..=attempts {
        let result = match tokio::time::timeout(policy.timeout, target.deliver(&payload)).await {
            Ok(result) => result,
            Err(_) => Err(AlarmDeliveryError::Timeout {
                target: target.name().to_string(),
                timeout: policy.timeout,
            }),
        };

        match result {
            Ok(()) => {
                diagnostics.record_alarm_delivered();
                tracing::info!(target = target.name(), alarm = %request.id, attempt, "Alarm delivered");
                return true;
            }
            Err(error) => {
                tracing::warn!(target = target.name(), alarm = %request.id, attempt, %error, "Alarm delivery failed");
                if attempt < attempts {
                    tokio::time::sleep(policy.backoff_after(attempt)).await;
                }
            }
        }
    }

    diagnostics.record_alarm_exhausted();
    tracing::error!(
        target = target.name(),
        alarm = %request.id,
        attempts,
        "Alarm dropped after exhausting retries"
    );
    false
}
