//! Pipeline orchestrator
//!
//! Turns each completed [`CycleWindow`] into a classified, written-back, persisted
//! and possibly alarmed result. Runs on worker tasks fed by the [`CycleQueue`], off
//! the sampling path.
//!
//! Steps run in order and each failure stays inside its step:
//! 1. Extract features (pure)
//! 2. Classify on the blocking pool, with a timeout
//! 3. Write the result back to the PLC; a failure is counted, persistence still runs
//! 4. Persist the record; a failure is counted, the next cycle still runs
//! 5. Push a leak alarm when enabled and the verdict is a leak
//!
//! A classification failure skips steps 3 and 5; the raw window is still persisted.

pub mod classifier;
pub mod features;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::acquisition::{CycleQueue, CycleWindow};
use crate::alarm::{AlarmDispatcher, AlarmRequest};
use crate::config::{LinkConfig, PipelineConfig};
use crate::diagnostics::Diagnostics;
use crate::error::{ClassifierError, StorageError};
use crate::link::layout::ResultEncoding;
use crate::link::{with_timeout, ChannelId, ProtocolLink};
use crate::storage::{CycleRecord, Storage};
use classifier::{decide, Classifier, Label};
use features::{FeatureMode, Features};

/// Verdict for one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    /// Leak or no leak
    pub label: Label,
    /// Probability of no leak
    pub probability: f64,
    /// Confidence in `label`
    pub confidence: f64,
    /// Model input, in model order
    pub features: Vec<f64>,
    /// Version of the model that produced it
    pub classifier_version: String,
    /// Wall time of the classify call
    pub latency_ms: f64,
}

/// Settings the orchestrator needs
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// No-leak probability at or above which a cycle passes
    pub threshold: f64,
    /// Model input layout
    pub feature_mode: FeatureMode,
    /// Push an alarm for every leak verdict
    pub alarm_on_leak: bool,
    /// Deadline for one classify call
    pub classify_timeout: Duration,
    /// Deadline for the result write-back
    pub write_timeout: Duration,
    /// Deadline for one persist call
    pub persist_timeout: Duration,
    /// Where results are written in the PLC
    pub write_back: ResultEncoding,
}

impl PipelineSettings {
    /// Settings from the pipeline and link sections
    pub fn from_config(pipeline: &PipelineConfig, link: &LinkConfig) -> Self {
        Self {
            threshold: pipeline.threshold,
            feature_mode: pipeline.feature_mode,
            alarm_on_leak: pipeline.alarm_on_leak,
            classify_timeout: pipeline.classify_timeout(),
            write_timeout: pipeline.write_timeout(),
            persist_timeout: pipeline.persist_timeout(),
            write_back: link.write_back.clone(),
        }
    }
}

/// What happened to one cycle; used for logging and tests
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedCycle {
    /// Channel of the cycle
    pub channel: ChannelId,
    /// Cycle sequence on that channel
    pub sequence: u64,
    /// Verdict, absent when classification failed
    pub label: Option<Label>,
    /// Result reached the PLC
    pub written_back: bool,
    /// Record reached storage
    pub persisted: bool,
    /// A leak alarm was pushed
    pub alarmed: bool,
}

/// Per-cycle orchestration over the external collaborators
pub struct Pipeline {
    settings: PipelineSettings,
    classifier: Arc<dyn Classifier>,
    link: Arc<dyn ProtocolLink>,
    storage: Arc<dyn Storage>,
    alarms: Arc<AlarmDispatcher>,
    diagnostics: Arc<Diagnostics>,
}

impl Pipeline {
    /// Orchestrator over the given collaborators
    pub fn new(
        settings: PipelineSettings,
        classifier: Arc<dyn Classifier>,
        link: Arc<dyn ProtocolLink>,
        storage: Arc<dyn Storage>,
        alarms: Arc<AlarmDispatcher>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            settings,
            classifier,
            link,
            storage,
            alarms,
            diagnostics,
        }
    }

    /// Run every step for one completed cycle
    pub async fn on_cycle_completed(&self, window: Arc<CycleWindow>) -> ProcessedCycle {
        let channel = window.channel();
        let sequence = window.sequence();

        let (features, classified) = self.classify(&window).await;
        let label = classified.as_ref().ok().map(|r| r.label);

        let mut written_back = false;
        let mut alarmed = false;
        if let Ok(result) = &classified {
            written_back = self.write_back(channel, result).await;
        }

        let outcome = classified.map_err(|e| e.to_string());
        let record = CycleRecord::new(&window, features, outcome.clone());
        let persisted = self.persist(&record).await;

        if let Ok(result) = &outcome {
            if result.label == Label::Leak && self.settings.alarm_on_leak {
                let accepted = self
                    .alarms
                    .push(AlarmRequest::leak(channel, sequence, result.probability));
                alarmed = accepted > 0;
            }
            tracing::info!(
                channel,
                sequence,
                label = ?result.label,
                probability = result.probability,
                confidence = result.confidence,
                samples = window.len(),
                latency_ms = result.latency_ms,
                "Cycle classified"
            );
        }

        ProcessedCycle {
            channel,
            sequence,
            label,
            written_back,
            persisted,
            alarmed,
        }
    }

    async fn classify(
        &self,
        window: &CycleWindow,
    ) -> (Option<Features>, Result<InferenceResult, ClassifierError>) {
        let channel = window.channel();
        let features = match features::extract(window) {
            Ok(features) => features,
            Err(e) => {
                self.diagnostics.record_classifier_failure();
                tracing::warn!(channel, sequence = window.sequence(), error = %e, "Feature extraction failed");
                return (None, Err(ClassifierError::Inference(e.to_string())));
            }
        };
        let vector = features.to_vector(self.settings.feature_mode);

        let started = Instant::now();
        let classifier = self.classifier.clone();
        let input = vector.clone();
        let task = tokio::task::spawn_blocking(move || classifier.classify(&input));

        let probability = match tokio::time::timeout(self.settings.classify_timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ClassifierError::Inference(join.to_string())),
            Err(_) => Err(ClassifierError::Timeout(self.settings.classify_timeout)),
        };
        let latency = started.elapsed();
        self.diagnostics.record_inference_latency(latency);

        let probability = match probability {
            Ok(p) => p,
            Err(e) => {
                self.diagnostics.record_classifier_failure();
                tracing::error!(channel, sequence = window.sequence(), error = %e, "Classification failed");
                return (Some(features), Err(e));
            }
        };

        let (label, confidence) = decide(probability, self.settings.threshold);
        let result = InferenceResult {
            label,
            probability,
            confidence,
            features: vector,
            classifier_version: self.classifier.version().to_string(),
            latency_ms: latency.as_secs_f64() * 1000.0,
        };
        (Some(features), Ok(result))
    }

    async fn write_back(&self, channel: ChannelId, result: &InferenceResult) -> bool {
        let encoding = &self.settings.write_back;
        let value = encoding.result_value(result.label == Label::Leak, result.probability);
        let offset = encoding.result_address(channel);

        let outcome = with_timeout(
            "write",
            self.settings.write_timeout,
            self.link.write_word(encoding.db_number, offset, value),
        )
        .await;
        self.diagnostics.record_writeback_outcome(outcome.is_ok());

        match outcome {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(channel, offset, value, error = %e, "Result write-back failed");
                false
            }
        }
    }

    async fn persist(&self, record: &CycleRecord) -> bool {
        let timeout = self.settings.persist_timeout;
        let outcome = match tokio::time::timeout(timeout, self.storage.persist(record)).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout {
                operation: "persist",
                timeout,
            }),
        };
        self.diagnostics.record_storage_outcome(outcome.is_ok());

        match outcome {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    channel = record.channel,
                    sequence = record.sequence,
                    backend = self.storage.name(),
                    error = %e,
                    "Failed to persist cycle record"
                );
                false
            }
        }
    }

    /// Spawn `count` workers draining `queue` until it is closed and empty
    pub fn spawn_workers(self: &Arc<Self>, queue: Arc<CycleQueue>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let pipeline = self.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker, "Pipeline worker started");
                    while let Some(window) = queue.pop().await {
                        pipeline.on_cycle_completed(window).await;
                    }
                    tracing::debug!(worker, "Pipeline worker stopped");
                })
            })
            .collect()
    }
}
