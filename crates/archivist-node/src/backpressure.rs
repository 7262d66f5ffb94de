use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
#[error("affordability probe failed: {0}")]
pub struct ProbeError(pub String);

/// Checks whether paused intake can be resumed.
#[async_trait]
pub trait AffordabilityProbe: Send + Sync {
    async fn probe(&self) -> Result<bool, ProbeError>;
}

/// Adapts an async closure into an [`AffordabilityProbe`].
pub struct ProbeFn<F>(pub F);

#[async_trait]
impl<F, Fut> AffordabilityProbe for ProbeFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, ProbeError>> + Send,
{
    async fn probe(&self) -> Result<bool, ProbeError> {
        (self.0)().await
    }
}

/// Probe and tick interval for one pause.
#[derive(Clone)]
pub struct ProbeConfig {
    pub probe: Arc<dyn AffordabilityProbe>,
    pub interval: Duration,
}

impl ProbeConfig {
    pub fn new(probe: Arc<dyn AffordabilityProbe>, interval: Duration) -> Self {
        Self { probe, interval }
    }
}

struct SourceState {
    paused: watch::Sender<bool>,
    generation: u64,
    probe_loop: Option<JoinHandle<()>>,
}

impl SourceState {
    fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            paused,
            generation: 0,
            probe_loop: None,
        }
    }
}

/// Pauses intake per source and resumes it once a probe succeeds.
///
/// At most one probe loop runs per source. Each pause bumps the source's
/// generation; a loop only clears the pause if its generation is current.
#[derive(Clone, Default)]
pub struct BackpressureController {
    sources: Arc<Mutex<HashMap<String, SourceState>>>,
}

/// Receiver side of a source's pause flag, awaited by consumers before
/// taking new work.
#[derive(Clone)]
pub struct IntakeGate {
    source: String,
    paused: watch::Receiver<bool>,
}

impl IntakeGate {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Returns immediately when open, otherwise waits for resume.
    pub async fn wait_open(&mut self) {
        if self.paused.wait_for(|paused| !*paused).await.is_err() {
            warn!("backpressure: gate for {} lost its controller", self.source);
        }
    }
}

impl BackpressureController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate(&self, source: &str) -> IntakeGate {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        let state = sources
            .entry(source.to_string())
            .or_insert_with(SourceState::new);
        IntakeGate {
            source: source.to_string(),
            paused: state.paused.subscribe(),
        }
    }

    pub fn is_paused(&self, source: &str) -> bool {
        self.sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(source)
            .is_some_and(|state| *state.paused.borrow())
    }

    /// Pauses `source` now and starts probing every `config.interval`.
    /// Replaces any probe loop already running for `source`.
    pub fn pause(&self, source: &str, config: ProbeConfig) {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        let state = sources
            .entry(source.to_string())
            .or_insert_with(SourceState::new);
        if let Some(previous) = state.probe_loop.take() {
            previous.abort();
        }
        state.generation += 1;
        state.paused.send_replace(true);
        warn!(
            "backpressure: pausing {source}, probing every {}s",
            config.interval.as_secs()
        );
        let controller = self.clone();
        let source_name = source.to_string();
        let generation = state.generation;
        state.probe_loop = Some(tokio::spawn(async move {
            controller.probe_loop(source_name, generation, config).await;
        }));
    }

    /// Clears the pause immediately and stops probing.
    pub fn resume(&self, source: &str) {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = sources.get_mut(source) else {
            return;
        };
        if let Some(probe_loop) = state.probe_loop.take() {
            probe_loop.abort();
        }
        state.generation += 1;
        if state.paused.send_replace(false) {
            info!("backpressure: resumed {source}");
        }
    }

    async fn probe_loop(&self, source: String, generation: u64, config: ProbeConfig) {
        let mut ticks = 0_u64;
        loop {
            tokio::time::sleep(config.interval).await;
            ticks += 1;
            match config.probe.probe().await {
                Ok(true) => {
                    self.finish(&source, generation, ticks);
                    return;
                }
                Ok(false) => {
                    warn!("backpressure: {source} still unaffordable after probe {ticks}");
                }
                Err(err) => {
                    error!("backpressure: probe {ticks} for {source} errored: {err}");
                }
            }
        }
    }

    fn finish(&self, source: &str, generation: u64, ticks: u64) {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = sources.get_mut(source) else {
            return;
        };
        if state.generation != generation {
            return;
        }
        state.probe_loop = None;
        state.paused.send_replace(false);
        info!("backpressure: resumed {source} after {ticks} probe(s)");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::time::Instant;

    use super::{BackpressureController, ProbeConfig, ProbeError, ProbeFn};

    fn scripted(
        answers: Vec<Result<bool, ProbeError>>,
    ) -> (Arc<AtomicUsize>, ProbeConfig) {
        let calls = Arc::new(AtomicUsize::new(0));
        let answers = Arc::new(std::sync::Mutex::new(answers.into_iter()));
        let counter = Arc::clone(&calls);
        let probe = ProbeFn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let next = answers
                .lock()
                .expect("answers lock")
                .next()
                .unwrap_or(Ok(false));
            async move { next }
        });
        (calls, ProbeConfig::new(Arc::new(probe), Duration::from_secs(10)))
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_exactly_after_first_successful_probe() {
        let controller = BackpressureController::new();
        let mut gate = controller.gate("upload");
        let (calls, config) = scripted(vec![Ok(false), Ok(false), Ok(true)]);

        let started = Instant::now();
        controller.pause("upload", config);
        assert!(controller.is_paused("upload"));
        assert!(gate.is_paused());

        gate.wait_open().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
        assert!(!controller.is_paused("upload"));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_count_as_not_yet() {
        let controller = BackpressureController::new();
        let mut gate = controller.gate("upload");
        let (calls, config) = scripted(vec![
            Err(ProbeError("gateway down".to_string())),
            Ok(false),
            Err(ProbeError("gateway down".to_string())),
            Ok(true),
        ]);
        controller.pause("upload", config);
        gate.wait_open().await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn second_pause_replaces_running_loop() {
        let controller = BackpressureController::new();
        let mut gate = controller.gate("upload");
        let (first_calls, first) = scripted(vec![]);
        let (second_calls, mut second) = scripted(vec![Ok(true)]);
        second.interval = Duration::from_secs(25);

        controller.pause("upload", first);
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(15)).await;
        tokio::task::yield_now().await;
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);

        controller.pause("upload", second);
        gate.wait_open().await;
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_stops_probing() {
        let controller = BackpressureController::new();
        let (calls, config) = scripted(vec![]);
        controller.pause("upload", config);
        controller.resume("upload");
        assert!(!controller.is_paused("upload"));

        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_source_is_open() {
        let controller = BackpressureController::new();
        assert!(!controller.is_paused("reupload"));
        controller.resume("reupload");
        let mut gate = controller.gate("reupload");
        gate.wait_open().await;
    }
}
