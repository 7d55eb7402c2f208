//! In-process engine: tracks container state without running anything.
//!
//! Backs `--engine memory` dry runs and the test suites. Failures, latency
//! and resource usage can be scripted per instance.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use super::{
    ContainerEngine, ContainerRef, ContainerSnapshot, ContainerSpec, ContainerStatus, EngineError,
    LogStream, ResourceUsage,
};

/// Lines replayed to a new log subscriber.
const LOG_HISTORY: usize = 100;
const LOG_CHANNEL_CAPACITY: usize = 1024;

struct Container {
    id: String,
    spec: ContainerSpec,
    running: bool,
    usage: ResourceUsage,
    history: VecDeque<String>,
    logs: broadcast::Sender<Result<String, EngineError>>,
    /// Returned by inspect instead of the real state.
    inspect_failure: Option<EngineError>,
}

impl Container {
    /// Replace the log channel so every open subscription ends.
    fn close_logs(&mut self) {
        self.logs = broadcast::channel(LOG_CHANNEL_CAPACITY).0;
    }
}

#[derive(Default)]
struct State {
    unavailable: bool,
    pull_failure: Option<String>,
    create_failure: Option<EngineError>,
    pull_delay: Duration,
    inspect_delay: Duration,
    pulled: Vec<String>,
    containers: Vec<Container>,
}

impl State {
    fn check_available(&self) -> Result<(), EngineError> {
        if self.unavailable {
            Err(EngineError::Unavailable("memory engine switched off".into()))
        } else {
            Ok(())
        }
    }

    /// Look a container up by id or name.
    fn find_mut(&mut self, container: &ContainerRef) -> Result<&mut Container, EngineError> {
        self.containers
            .iter_mut()
            .find(|c| c.id == container.as_str() || c.spec.name == container.as_str())
            .ok_or_else(|| EngineError::NotFound(container.to_string()))
    }
}

/// Decrements the open-subscription counter when a log stream is dropped.
struct SubscriptionGuard(Arc<AtomicUsize>);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// [`ContainerEngine`] whose containers live in a process-local table.
#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<State>,
    next_id: AtomicU64,
    open_log_streams: Arc<AtomicUsize>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every call fail with [`EngineError::Unavailable`] (or stop doing so).
    pub fn set_available(&self, available: bool) {
        self.state().unavailable = !available;
    }

    /// Fail every pull with `reason` until cleared with `None`.
    pub fn fail_pulls(&self, reason: Option<&str>) {
        self.state().pull_failure = reason.map(str::to_string);
    }

    /// Fail the next `create_and_start` with `err`.
    pub fn fail_next_create(&self, err: EngineError) {
        self.state().create_failure = Some(err);
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        self.state().pull_delay = delay;
    }

    /// Delay applied to every inspect, e.g. to exceed a caller's timeout.
    pub fn set_inspect_delay(&self, delay: Duration) {
        self.state().inspect_delay = delay;
    }

    /// Usage reported for `container` while it runs.
    pub fn set_usage(&self, container: &ContainerRef, usage: ResourceUsage) -> bool {
        self.state()
            .find_mut(container)
            .map(|c| c.usage = usage)
            .is_ok()
    }

    /// Simulate the container exiting on its own.
    pub fn kill(&self, container: &ContainerRef) -> bool {
        self.state()
            .find_mut(container)
            .map(|c| {
                c.running = false;
                c.close_logs();
            })
            .is_ok()
    }

    /// Emit a log chunk from `container`. Returns false if it does not exist.
    pub fn push_log(&self, container: &ContainerRef, chunk: &str) -> bool {
        let mut state = self.state();
        let Ok(c) = state.find_mut(container) else {
            return false;
        };
        if c.history.len() == LOG_HISTORY {
            c.history.pop_front();
        }
        c.history.push_back(chunk.to_string());
        // No receivers is fine.
        let _ = c.logs.send(Ok(chunk.to_string()));
        true
    }

    /// Make every open log stream of `container` fail with `err`.
    pub fn break_logs(&self, container: &ContainerRef, err: EngineError) -> bool {
        let mut state = self.state();
        let Ok(c) = state.find_mut(container) else {
            return false;
        };
        let _ = c.logs.send(Err(err));
        true
    }

    /// Fail inspects of `container` with `err`, or stop doing so.
    pub fn fail_inspect(&self, container: &ContainerRef, err: Option<EngineError>) -> bool {
        self.state()
            .find_mut(container)
            .map(|c| c.inspect_failure = err)
            .is_ok()
    }

    /// Number of log streams handed out and not yet dropped.
    pub fn open_log_streams(&self) -> usize {
        self.open_log_streams.load(Ordering::SeqCst)
    }

    /// Images pulled so far, in order.
    pub fn pulled_images(&self) -> Vec<String> {
        self.state().pulled.clone()
    }

    /// Spec the container was created from.
    pub fn spec_of(&self, container: &ContainerRef) -> Option<ContainerSpec> {
        self.state().find_mut(container).ok().map(|c| c.spec.clone())
    }

    pub fn container_count(&self) -> usize {
        self.state().containers.len()
    }
}

#[async_trait]
impl ContainerEngine for MemoryEngine {
    async fn ping(&self) -> Result<(), EngineError> {
        self.state().check_available()
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        let delay = {
            let state = self.state();
            state.check_available()?;
            state.pull_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.check_available()?;
        if let Some(reason) = &state.pull_failure {
            return Err(EngineError::Image(format!("{image}: {reason}")));
        }
        state.pulled.push(image.to_string());
        Ok(())
    }

    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<ContainerRef, EngineError> {
        let mut state = self.state();
        state.check_available()?;
        if let Some(err) = state.create_failure.take() {
            return Err(err);
        }
        if state.containers.iter().any(|c| c.spec.name == spec.name) {
            return Err(EngineError::Conflict(spec.name.clone()));
        }

        let id = format!("mem{:013x}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        state.containers.push(Container {
            id: id.clone(),
            spec: spec.clone(),
            running: true,
            usage: ResourceUsage::default(),
            history: VecDeque::new(),
            logs: broadcast::channel(LOG_CHANNEL_CAPACITY).0,
            inspect_failure: None,
        });
        debug!(container = %id, name = %spec.name, "Memory container started");
        Ok(ContainerRef::new(id))
    }

    async fn inspect(&self, container: &ContainerRef) -> Result<ContainerSnapshot, EngineError> {
        let delay = {
            let state = self.state();
            state.check_available()?;
            state.inspect_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.check_available()?;
        let c = state.find_mut(container)?;
        if let Some(err) = &c.inspect_failure {
            return Err(err.clone());
        }
        Ok(if c.running {
            ContainerSnapshot {
                status: ContainerStatus::Running,
                usage: c.usage,
            }
        } else {
            ContainerSnapshot {
                status: ContainerStatus::Exited,
                usage: ResourceUsage::default(),
            }
        })
    }

    async fn start(&self, container: &ContainerRef) -> Result<(), EngineError> {
        let mut state = self.state();
        state.check_available()?;
        state.find_mut(container)?.running = true;
        Ok(())
    }

    async fn stop(&self, container: &ContainerRef, _grace: Duration) -> Result<(), EngineError> {
        let mut state = self.state();
        state.check_available()?;
        let c = state.find_mut(container)?;
        c.running = false;
        c.close_logs();
        Ok(())
    }

    async fn restart(&self, container: &ContainerRef, _grace: Duration) -> Result<(), EngineError> {
        let mut state = self.state();
        state.check_available()?;
        state.find_mut(container)?.running = true;
        Ok(())
    }

    async fn remove(
        &self,
        container: &ContainerRef,
        _purge_volumes: bool,
    ) -> Result<(), EngineError> {
        let mut state = self.state();
        state.check_available()?;
        let id = state.find_mut(container)?.id.clone();
        state.containers.retain(|c| c.id != id);
        Ok(())
    }

    async fn stream_logs(&self, container: &ContainerRef) -> Result<LogStream, EngineError> {
        let (history, mut rx, running) = {
            let mut state = self.state();
            state.check_available()?;
            let c = state.find_mut(container)?;
            (
                c.history.iter().cloned().collect::<Vec<_>>(),
                c.logs.subscribe(),
                c.running,
            )
        };

        self.open_log_streams.fetch_add(1, Ordering::SeqCst);
        let guard = SubscriptionGuard(Arc::clone(&self.open_log_streams));

        let stream = async_stream::stream! {
            let _guard = guard;
            for chunk in history {
                yield Ok(chunk);
            }
            if !running {
                return;
            }
            loop {
                match rx.recv().await {
                    Ok(Ok(chunk)) => yield Ok(chunk),
                    Ok(Err(e)) => {
                        yield Err(e);
                        break;
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use tokio_stream::StreamExt;

    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.into(),
            image: "img:latest".into(),
            ports: Vec::new(),
            volumes: Vec::new(),
            environment: BTreeMap::new(),
            stop_grace: Duration::from_secs(30),
        }
    }

    #[tokio::test]
    async fn lifecycle_round_trip() {
        let engine = MemoryEngine::new();
        let id = engine.create_and_start(&spec("a")).await.unwrap();
        assert_eq!(
            engine.inspect(&id).await.unwrap().status,
            ContainerStatus::Running
        );

        engine.stop(&id, Duration::ZERO).await.unwrap();
        assert_eq!(
            engine.inspect(&id).await.unwrap().status,
            ContainerStatus::Exited
        );

        engine.remove(&id, true).await.unwrap();
        assert!(matches!(
            engine.inspect(&id).await.unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn names_are_unique_and_resolvable() {
        let engine = MemoryEngine::new();
        engine.create_and_start(&spec("a")).await.unwrap();
        assert!(matches!(
            engine.create_and_start(&spec("a")).await.unwrap_err(),
            EngineError::Conflict(_)
        ));
        let by_name = ContainerRef::new("a");
        assert!(engine.inspect(&by_name).await.is_ok());
    }

    #[tokio::test]
    async fn unavailable_engine_fails_everything() {
        let engine = MemoryEngine::new();
        let id = engine.create_and_start(&spec("a")).await.unwrap();
        engine.set_available(false);
        assert!(engine.ping().await.unwrap_err().is_unavailable());
        assert!(engine.inspect(&id).await.unwrap_err().is_unavailable());
        engine.set_available(true);
        assert!(engine.ping().await.is_ok());
    }

    #[tokio::test]
    async fn log_stream_ends_on_stop_and_releases_subscription() {
        let engine = MemoryEngine::new();
        let id = engine.create_and_start(&spec("a")).await.unwrap();
        engine.push_log(&id, "before\n");

        let mut logs = engine.stream_logs(&id).await.unwrap();
        assert_eq!(engine.open_log_streams(), 1);
        assert_eq!(logs.next().await.unwrap().unwrap(), "before\n");

        engine.push_log(&id, "after\n");
        assert_eq!(logs.next().await.unwrap().unwrap(), "after\n");

        engine.stop(&id, Duration::ZERO).await.unwrap();
        assert!(logs.next().await.is_none());
        drop(logs);
        assert_eq!(engine.open_log_streams(), 0);
    }

    #[tokio::test]
    async fn broken_log_stream_yields_error_then_ends() {
        let engine = MemoryEngine::new();
        let id = engine.create_and_start(&spec("a")).await.unwrap();
        let mut logs = engine.stream_logs(&id).await.unwrap();

        engine.break_logs(&id, EngineError::Api("gone".into()));
        assert!(logs.next().await.unwrap().is_err());
        assert!(logs.next().await.is_none());
    }

    #[tokio::test]
    async fn unpolled_stream_still_releases_on_drop() {
        let engine = MemoryEngine::new();
        let id = engine.create_and_start(&spec("a")).await.unwrap();
        let logs = engine.stream_logs(&id).await.unwrap();
        assert_eq!(engine.open_log_streams(), 1);
        drop(logs);
        assert_eq!(engine.open_log_streams(), 0);
    }
}
