//! Pipeline orchestrator
//!
//! Runs bronze, silver and gold in that order. Each layer gets a fixed number of attempts;
//! once a layer exhausts them the cycle halts and downstream layers are skipped. Every
//! layer run leaves exactly one entry in the execution log.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{error, info};

use crate::error::{EtlError, Result};
use crate::execution_log::{ExecutionLog, ExecutionLogEntry, ExecutionStatus};
use crate::models::{Layer, LoadSummary, LoadTotals};
use crate::retry::RetryPolicy;
use crate::runner::LayerStep;

/// Observable orchestrator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "layer", rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Running(Layer),
    Done,
    Failed(Layer),
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineState::Idle => write!(f, "idle"),
            PipelineState::Running(layer) => write!(f, "running {}", layer),
            PipelineState::Done => write!(f, "done"),
            PipelineState::Failed(layer) => write!(f, "failed at {}", layer),
        }
    }
}

/// Outcome of one successful layer run
#[derive(Debug, Clone, Serialize)]
pub struct LayerReport {
    pub layer: Layer,
    pub attempts: u32,
    pub summaries: Vec<LoadSummary>,
    pub finished_at: DateTime<Utc>,
}

impl LayerReport {
    pub fn totals(&self) -> LoadTotals {
        LoadTotals::of(&self.summaries)
    }
}

/// Outcome of a full bronze → silver → gold cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub layers: Vec<LayerReport>,
}

pub struct PipelineOrchestrator {
    steps: Vec<Arc<dyn LayerStep>>,
    log: Arc<dyn ExecutionLog>,
    retry: RetryPolicy,
    state: watch::Sender<PipelineState>,
}

impl PipelineOrchestrator {
    pub fn new(
        mut steps: Vec<Arc<dyn LayerStep>>,
        log: Arc<dyn ExecutionLog>,
        retry: RetryPolicy,
    ) -> Self {
        steps.sort_by_key(|step| step.layer());
        let (state, _) = watch::channel(PipelineState::Idle);
        Self {
            steps,
            log,
            retry,
            state,
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<PipelineState> {
        self.state.subscribe()
    }

    /// Run every layer in order, halting at the first layer that exhausts its retries
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        info!(layers = self.steps.len(), "Starting pipeline cycle");

        let mut layers = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            layers.push(self.execute(step.as_ref()).await?);
        }

        self.state.send_replace(PipelineState::Done);
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Pipeline cycle complete");
        Ok(CycleReport { layers })
    }

    /// Run a single layer with retry and logging, regardless of upstream state
    pub async fn run_layer(&self, layer: Layer) -> Result<LayerReport> {
        let step = self
            .steps
            .iter()
            .find(|step| step.layer() == layer)
            .ok_or_else(|| EtlError::Config(format!("no step registered for layer {}", layer)))?;

        let report = self.execute(step.as_ref()).await?;
        self.state.send_replace(PipelineState::Done);
        Ok(report)
    }

    async fn execute(&self, step: &dyn LayerStep) -> Result<LayerReport> {
        let layer = step.layer();
        let label = format!("Pipeline {}", layer.title());
        self.state.send_replace(PipelineState::Running(layer));

        let mut attempts = 0;
        let outcome = self
            .retry
            .run(&label, |attempt| {
                attempts = attempt;
                step.run()
            })
            .await;

        match outcome {
            Ok(summaries) => {
                let report = LayerReport {
                    layer,
                    attempts,
                    summaries,
                    finished_at: Utc::now(),
                };
                let message = format!(
                    "{} executed successfully at {} ({})",
                    label,
                    report.finished_at.format("%Y-%m-%d %H:%M:%S%.6f"),
                    report.totals()
                );
                info!("{}", message);
                self.record(ExecutionLogEntry::new(layer.step_name(), ExecutionStatus::Success, message))
                    .await;
                Ok(report)
            },
            Err(e) => {
                self.state.send_replace(PipelineState::Failed(layer));
                let cause = match &e {
                    EtlError::Orchestration { source, .. } => source.to_string(),
                    other => other.to_string(),
                };
                let message = format!("{} failed: {}", label, cause);
                error!("{}", message);
                self.record(ExecutionLogEntry::new(layer.step_name(), ExecutionStatus::Error, message))
                    .await;
                Err(e)
            },
        }
    }

    /// Append to the execution log; failures here never change the layer outcome
    async fn record(&self, entry: ExecutionLogEntry) {
        if let Err(e) = self.log.append(&entry).await {
            error!(step = %entry.step, status = %entry.status, error = %e, "Failed to write execution log");
        }
    }
}
