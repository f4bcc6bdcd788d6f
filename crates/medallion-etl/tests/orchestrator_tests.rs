//! Orchestrator retry, halt and execution-log tests
//!
//! Layer steps are scripted fakes; time is paused so the fixed retry delay elapses
//! instantly.

use async_trait::async_trait;
use medallion_etl::execution_log::{
    ExecutionLog, ExecutionLogEntry, ExecutionStatus, MemoryExecutionLog,
};
use medallion_etl::retry::RetryPolicy;
use medallion_etl::runner::LayerStep;
use medallion_etl::{
    EtlError, Layer, LayerTarget, LoadSummary, MergeKey, PipelineOrchestrator, PipelineState,
    WriteKind, WriteMode,
};
use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Step failing its first `failures` runs, then loading `rows` rows
struct ScriptedStep {
    layer: Layer,
    failures: u32,
    rows: usize,
    calls: AtomicU32,
}

impl ScriptedStep {
    fn new(layer: Layer, failures: u32) -> Arc<Self> {
        Arc::new(Self {
            layer,
            failures,
            rows: 4,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LayerStep for ScriptedStep {
    fn layer(&self) -> Layer {
        self.layer
    }

    async fn run(&self) -> medallion_etl::Result<Vec<LoadSummary>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(EtlError::write(
                format!("{}.sales", self.layer),
                WriteKind::Connectivity,
                format!("connection reset on call {}", call),
            ));
        }

        let target = LayerTarget::new(self.layer, "sales", WriteMode::Merge, MergeKey::Natural("sale_id"));
        let mut summary = LoadSummary::new(&target, self.rows);
        summary.rows_written = self.rows;
        Ok(vec![summary])
    }
}

/// Step that blocks until its gate is opened
struct GatedStep {
    layer: Layer,
    gate: Arc<Notify>,
}

#[async_trait]
impl LayerStep for GatedStep {
    fn layer(&self) -> Layer {
        self.layer
    }

    async fn run(&self) -> medallion_etl::Result<Vec<LoadSummary>> {
        self.gate.notified().await;
        Ok(Vec::new())
    }
}

/// Log whose appends always fail
struct BrokenLog;

#[async_trait]
impl ExecutionLog for BrokenLog {
    async fn append(&self, _entry: &ExecutionLogEntry) -> medallion_etl::Result<()> {
        Err(EtlError::Config("log database unavailable".to_string()))
    }

    async fn recent(&self, _limit: usize) -> medallion_etl::Result<Vec<ExecutionLogEntry>> {
        Ok(Vec::new())
    }
}

fn orchestrator(
    steps: Vec<Arc<ScriptedStep>>,
    log: Arc<dyn ExecutionLog>,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(
        steps.into_iter().map(|s| s as Arc<dyn LayerStep>).collect(),
        log,
        RetryPolicy::new(3, Duration::from_secs(10)),
    )
}

/// Log output shared between the subscriber and the test
#[derive(Clone, Default)]
struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().unwrap();
        String::from_utf8_lossy(&bytes).lines().map(str::to_string).collect()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_then_success_logs_one_success() {
    let captured = CapturedLogs::default();
    let writer = captured.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(move || writer.clone())
        .with_ansi(false)
        .with_max_level(tracing::Level::WARN)
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let bronze = ScriptedStep::new(Layer::Bronze, 2);
    let log = Arc::new(MemoryExecutionLog::new());
    let orchestrator = orchestrator(vec![bronze.clone()], log.clone());

    let started = tokio::time::Instant::now();
    let report = orchestrator.run_cycle().await.expect("cycle should succeed");

    // one warning per failed attempt, nothing at error level
    let lines = captured.lines();
    assert_eq!(lines.len(), 2, "unexpected log output: {:?}", lines);
    assert!(lines[0].contains("WARN") && lines[0].contains("Pipeline Bronze - Attempt 1/3 failed"));
    assert!(lines[1].contains("WARN") && lines[1].contains("Pipeline Bronze - Attempt 2/3 failed"));

    assert_eq!(bronze.calls(), 3);
    assert_eq!(report.layers[0].attempts, 3);
    assert_eq!(started.elapsed(), Duration::from_secs(20));

    let entries = log.entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].step, "pipeline_bronze");
    assert_eq!(entries[0].status, ExecutionStatus::Success);
    assert!(entries[0].message.starts_with("Pipeline Bronze executed successfully at "));
    assert!(entries[0].message.contains("1 target(s), 4 row(s) read, 4 row(s) written"));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_layer_halts_downstream() {
    let bronze = ScriptedStep::new(Layer::Bronze, 0);
    let silver = ScriptedStep::new(Layer::Silver, u32::MAX);
    let gold = ScriptedStep::new(Layer::Gold, 0);
    let log = Arc::new(MemoryExecutionLog::new());
    let orchestrator = orchestrator(vec![bronze.clone(), silver.clone(), gold.clone()], log.clone());

    let err = orchestrator.run_cycle().await.expect_err("silver must exhaust retries");

    match &err {
        EtlError::Orchestration { step, attempts, source } => {
            assert_eq!(step, "Pipeline Silver");
            assert_eq!(*attempts, 3);
            assert!(matches!(**source, EtlError::Write { kind: WriteKind::Connectivity, .. }));
        },
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(silver.calls(), 3);
    assert_eq!(gold.calls(), 0);
    assert_eq!(orchestrator.state(), PipelineState::Failed(Layer::Silver));

    let entries = log.entries().await;
    let outcomes: Vec<_> = entries.iter().map(|e| (e.step.as_str(), e.status)).collect();
    assert_eq!(
        outcomes,
        vec![
            ("pipeline_bronze", ExecutionStatus::Success),
            ("pipeline_silver", ExecutionStatus::Error),
        ]
    );
    assert_eq!(
        entries[1].message,
        "Pipeline Silver failed: Write failed for silver.sales (connectivity): connection reset on call 3"
    );
}

#[tokio::test(start_paused = true)]
async fn test_log_failure_does_not_change_outcome() {
    let bronze = ScriptedStep::new(Layer::Bronze, 0);
    let orchestrator = orchestrator(vec![bronze.clone()], Arc::new(BrokenLog));

    let report = orchestrator.run_cycle().await.expect("log failure must not fail the cycle");

    assert_eq!(report.layers.len(), 1);
    assert_eq!(orchestrator.state(), PipelineState::Done);
}

#[tokio::test(start_paused = true)]
async fn test_state_transitions_are_observable() {
    let gate = Arc::new(Notify::new());
    let steps: Vec<Arc<dyn LayerStep>> = vec![
        ScriptedStep::new(Layer::Bronze, 0),
        Arc::new(GatedStep {
            layer: Layer::Silver,
            gate: gate.clone(),
        }),
    ];
    let orchestrator = Arc::new(PipelineOrchestrator::new(
        steps,
        Arc::new(MemoryExecutionLog::new()),
        RetryPolicy::default(),
    ));
    let mut rx = orchestrator.subscribe();
    assert_eq!(*rx.borrow(), PipelineState::Idle);

    let cycle = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.run_cycle().await }
    });

    rx.wait_for(|state| *state == PipelineState::Running(Layer::Silver))
        .await
        .expect("orchestrator dropped");
    gate.notify_one();
    rx.wait_for(|state| *state == PipelineState::Done)
        .await
        .expect("orchestrator dropped");

    let report = cycle.await.expect("cycle panicked").expect("cycle should succeed");
    assert_eq!(report.layers.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_standalone_layer_run_is_logged() {
    let gold = ScriptedStep::new(Layer::Gold, 1);
    let log = Arc::new(MemoryExecutionLog::new());
    let orchestrator = orchestrator(vec![gold.clone()], log.clone());

    let report = orchestrator.run_layer(Layer::Gold).await.expect("gold should succeed");

    assert_eq!(report.attempts, 2);
    let recent = log.recent(10).await.expect("memory log never fails");
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].step, "pipeline_gold");
}
