//! Progress reporting: fan-out of [`ProgressEvent`]s to observers.
//!
//! [`Observer`] is the implementor-facing trait; [`DynObserver`] is its
//! dyn-compatible twin, implemented for every `Observer`. The
//! [`ProgressReporter`] delivers each event to every observer in
//! registration order. A failing observer is logged and counted; it never
//! affects the run or the observers after it.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use testbench_core::error::DeliveryError;
use testbench_core::event::{ProgressEvent, ProgressKind};
use testbench_core::instrument::BoxFuture;
use testbench_core::metrics as names;

// ─── Observer Trait ──────────────────────────────────────────────────

/// Receiver of progress events.
pub trait Observer: Send + Sync + 'static {
    /// Observer name, used in logs and metric labels.
    fn name(&self) -> &str;

    /// Delivers one event.
    fn deliver(
        &self,
        event: &ProgressEvent,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// dyn-compatible form of [`Observer`].
pub trait DynObserver: Send + Sync {
    fn name(&self) -> &str;

    fn deliver<'a>(&'a self, event: &'a ProgressEvent) -> BoxFuture<'a, Result<(), DeliveryError>>;
}

impl<T: Observer> DynObserver for T {
    fn name(&self) -> &str {
        Observer::name(self)
    }

    fn deliver<'a>(&'a self, event: &'a ProgressEvent) -> BoxFuture<'a, Result<(), DeliveryError>> {
        Box::pin(Observer::deliver(self, event))
    }
}

// ─── ProgressReporter ────────────────────────────────────────────────

/// Ordered set of observers.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    observers: Vec<Arc<dyn DynObserver>>,
}

impl ProgressReporter {
    /// Reporter with no observers; events are still built and counted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observer (builder form).
    pub fn with_observer(mut self, observer: impl Observer) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Wraps `kind` in an event and delivers it to every observer.
    pub async fn emit(&self, kind: ProgressKind) -> ProgressEvent {
        let event = ProgressEvent::new(kind);
        self.publish(&event).await;
        event
    }

    /// Delivers an event to every observer, in order.
    pub async fn publish(&self, event: &ProgressEvent) {
        counter!(names::REPORTER_EVENTS_TOTAL).increment(1);
        for observer in &self.observers {
            if let Err(e) = observer.deliver(event).await {
                warn!(
                    observer = observer.name(),
                    event_type = event.kind.type_name(),
                    test_id = event.kind.test_id(),
                    error = %e,
                    "progress event delivery failed"
                );
                counter!(
                    names::REPORTER_DELIVERY_FAILURES_TOTAL,
                    names::LABEL_OBSERVER => observer.name().to_owned()
                )
                .increment(1);
            }
        }
    }
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.observers.iter().map(|o| o.name()).collect();
        f.debug_struct("ProgressReporter")
            .field("observers", &names)
            .finish()
    }
}

// ─── ChannelObserver ─────────────────────────────────────────────────

/// Forwards events into a bounded tokio channel.
///
/// A full channel is waited on for at most `timeout`; a closed channel is a
/// delivery failure.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    name: String,
    tx: mpsc::Sender<ProgressEvent>,
    timeout: Duration,
}

impl ChannelObserver {
    pub fn new(name: impl Into<String>, tx: mpsc::Sender<ProgressEvent>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            tx,
            timeout,
        }
    }

    /// Creates an observer together with the receiving end.
    pub fn channel(
        name: impl Into<String>,
        capacity: usize,
        timeout: Duration,
    ) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(name, tx, timeout), rx)
    }
}

impl Observer for ChannelObserver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, event: &ProgressEvent) -> Result<(), DeliveryError> {
        match tokio::time::timeout(self.timeout, self.tx.send(event.clone())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DeliveryError::Disconnected),
            Err(_) => Err(DeliveryError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

// ─── TracingObserver ─────────────────────────────────────────────────

/// Writes one structured log line per event.
#[derive(Debug, Clone, Default)]
pub struct TracingObserver;

impl TracingObserver {
    pub fn new() -> Self {
        Self
    }
}

impl Observer for TracingObserver {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn deliver(&self, event: &ProgressEvent) -> Result<(), DeliveryError> {
        match &event.kind {
            ProgressKind::TestStarted {
                test_id,
                sequence,
                total_steps,
            } => info!(test_id = %test_id, sequence = %sequence, total_steps, "test started"),
            ProgressKind::StepStarted {
                test_id,
                step,
                step_number,
            } => debug!(test_id = %test_id, step = %step, step_number, "step started"),
            ProgressKind::StepCompleted {
                test_id,
                step,
                result,
            } => info!(
                test_id = %test_id,
                step = %step,
                step_number = result.step_number,
                step_type = %result.step_type,
                passed = result.passed,
                duration_seconds = result.duration_seconds,
                error = result.error.as_deref().unwrap_or(""),
                "step completed"
            ),
            ProgressKind::TestCompleted {
                test_id,
                passed,
                steps_passed,
                total_steps,
                duration,
                status,
            } => info!(
                test_id = %test_id,
                passed,
                steps_passed,
                total_steps,
                duration,
                status = %status,
                "test completed"
            ),
            ProgressKind::TestError { test_id, error } => {
                warn!(test_id = %test_id, error = %error, "test aborted")
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn started(test_id: &str) -> ProgressKind {
        ProgressKind::TestStarted {
            test_id: test_id.to_owned(),
            sequence: "seq".to_owned(),
            total_steps: 1,
        }
    }

    /// Records event types under its name into a shared log.
    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl Observer for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn deliver(&self, event: &ProgressEvent) -> Result<(), DeliveryError> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event.kind.type_name()));
            if self.fail {
                return Err(DeliveryError::Disconnected);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let reporter = ProgressReporter::new()
            .with_observer(Recorder { name: "a", log: log.clone(), fail: false })
            .with_observer(Recorder { name: "b", log: log.clone(), fail: false });

        reporter.emit(started("test_1")).await;

        assert_eq!(*log.lock().unwrap(), vec!["a:test_started", "b:test_started"]);
    }

    #[tokio::test]
    async fn failing_observer_does_not_block_later_ones() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let reporter = ProgressReporter::new()
            .with_observer(Recorder { name: "broken", log: log.clone(), fail: true })
            .with_observer(Recorder { name: "ok", log: log.clone(), fail: false });

        let event = reporter.emit(started("test_2")).await;

        assert_eq!(event.kind.test_id(), "test_2");
        assert_eq!(*log.lock().unwrap(), vec!["broken:test_started", "ok:test_started"]);
    }

    #[tokio::test]
    async fn emit_without_observers_returns_event() {
        let reporter = ProgressReporter::new();
        let event = reporter.emit(started("test_3")).await;
        assert_eq!(event.kind.type_name(), "test_started");
    }

    #[tokio::test]
    async fn channel_observer_forwards_events() {
        let (observer, mut rx) = ChannelObserver::channel("ws", 4, Duration::from_millis(100));
        let reporter = ProgressReporter::new().with_observer(observer);

        let sent = reporter.emit(started("test_4")).await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.id, sent.id);
    }

    #[tokio::test]
    async fn channel_observer_reports_disconnect() {
        let (observer, rx) = ChannelObserver::channel("ws", 1, Duration::from_millis(100));
        drop(rx);
        let err = Observer::deliver(&observer, &ProgressEvent::new(started("t")))
            .await
            .unwrap_err();
        assert!(matches!(err, DeliveryError::Disconnected));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_observer_times_out_when_full() {
        let (observer, _rx) = ChannelObserver::channel("slow", 1, Duration::from_millis(50));
        let event = ProgressEvent::new(started("t"));
        Observer::deliver(&observer, &event).await.unwrap();

        let err = Observer::deliver(&observer, &event).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Timeout { timeout_ms: 50 }));
    }

    #[tokio::test]
    async fn tracing_observer_never_fails() {
        let observer = TracingObserver::new();
        let event = ProgressEvent::new(ProgressKind::TestError {
            test_id: "t".to_owned(),
            error: "boom".to_owned(),
        });
        Observer::deliver(&observer, &event).await.unwrap();
    }

    #[test]
    fn debug_lists_observer_names() {
        let reporter = ProgressReporter::new().with_observer(TracingObserver::new());
        assert!(format!("{reporter:?}").contains("tracing"));
    }
}
