//! Ordered lifecycle events for one Run.
//!
//! Production never waits on observers: events go into a bounded
//! broadcast buffer and each subscriber reads at its own pace. A subscriber
//! that falls behind the buffer is told how many events it missed. A
//! subscriber only sees events emitted after it subscribed.

use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

use crate::run::RunId;

/// Buffer size used when none is given.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Lifecycle event type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    WorkspaceAcquired,
    DiagnosticsFound,
    DeterministicFixesProposed,
    GenerativeFixesProposed,
    GenerativeExhausted,
    FixesApplied,
    CommitOutcome,
    IterationComplete,
    Terminal,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::WorkspaceAcquired => "workspace_acquired",
            Self::DiagnosticsFound => "diagnostics_found",
            Self::DeterministicFixesProposed => "deterministic_fixes_proposed",
            Self::GenerativeFixesProposed => "generative_fixes_proposed",
            Self::GenerativeExhausted => "generative_exhausted",
            Self::FixesApplied => "fixes_applied",
            Self::CommitOutcome => "commit_outcome",
            Self::IterationComplete => "iteration_complete",
            Self::Terminal => "terminal",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One emitted event. Never modified after emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Position in the Run's stream, starting at 0.
    pub seq: u64,
    pub run_id: RunId,
    pub kind: EventKind,
    pub payload: Value,
    /// Strictly increasing within a Run.
    pub emitted_at: DateTime<Utc>,
}

/// What an observer receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(Event),
    /// The observer lagged and this many events were dropped for it.
    Missed(u64),
}

struct EmitState {
    next_seq: u64,
    last_at: Option<DateTime<Utc>>,
    history: Vec<Event>,
    sender: Option<broadcast::Sender<Event>>,
}

/// Append-only event stream of one Run.
pub struct EventBus {
    run_id: RunId,
    state: Mutex<EmitState>,
}

impl EventBus {
    #[must_use]
    pub fn new(run_id: RunId) -> Self {
        Self::with_capacity(run_id, DEFAULT_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(run_id: RunId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            run_id,
            state: Mutex::new(EmitState {
                next_seq: 0,
                last_at: None,
                history: Vec::new(),
                sender: Some(sender),
            }),
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Emit an event. Returns `None` once the bus is closed.
    pub fn emit(&self, kind: EventKind, payload: Value) -> Option<Event> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let sender = state.sender.clone()?;

        let now = Utc::now();
        let emitted_at = match state.last_at {
            Some(last) if now <= last => last + ChronoDuration::microseconds(1),
            _ => now,
        };
        let event = Event {
            seq: state.next_seq,
            run_id: self.run_id.clone(),
            kind,
            payload,
            emitted_at,
        };
        state.next_seq += 1;
        state.last_at = Some(emitted_at);
        state.history.push(event.clone());

        // No live observers is fine.
        let observers = sender.send(event.clone()).unwrap_or(0);
        trace!(seq = event.seq, kind = %kind, observers, "Event emitted");
        Some(event)
    }

    /// Start observing from the next emitted event.
    #[must_use]
    pub fn subscribe(&self) -> EventStream {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        EventStream {
            receiver: state.sender.as_ref().map(broadcast::Sender::subscribe),
        }
    }

    /// Every event emitted so far, in order.
    #[must_use]
    pub fn history(&self) -> Vec<Event> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.history.clone()
    }

    /// Stop accepting events; observers see the end of the stream after
    /// draining what is buffered.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.sender = None;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.sender.is_none()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("run_id", &self.run_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One observer's cursor into an [`EventBus`].
#[derive(Debug)]
pub struct EventStream {
    receiver: Option<broadcast::Receiver<Event>>,
}

impl EventStream {
    /// Next delivery, or `None` after the bus has closed and drained.
    pub async fn next(&mut self) -> Option<Delivery> {
        let receiver = self.receiver.as_mut()?;
        match receiver.recv().await {
            Ok(event) => Some(Delivery::Event(event)),
            Err(broadcast::error::RecvError::Lagged(missed)) => Some(Delivery::Missed(missed)),
            Err(broadcast::error::RecvError::Closed) => {
                self.receiver = None;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bus(capacity: usize) -> EventBus {
        EventBus::with_capacity(RunId::new(), capacity)
    }

    #[test]
    fn test_seq_and_timestamps_strictly_increase() {
        let bus = bus(16);
        for i in 0..50 {
            bus.emit(EventKind::DiagnosticsFound, json!({ "iteration": i }));
        }
        let history = bus.history();
        assert_eq!(history.len(), 50);
        for pair in history.windows(2) {
            assert_eq!(pair[1].seq, pair[0].seq + 1);
            assert!(pair[1].emitted_at > pair[0].emitted_at);
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = bus(16);
        let mut stream = bus.subscribe();
        bus.emit(EventKind::RunStarted, json!({}));
        bus.emit(EventKind::WorkspaceAcquired, json!({}));
        bus.close();

        let mut kinds = Vec::new();
        while let Some(delivery) = stream.next().await {
            if let Delivery::Event(e) = delivery {
                kinds.push(e.kind);
            }
        }
        assert_eq!(kinds, vec![EventKind::RunStarted, EventKind::WorkspaceAcquired]);
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let bus = bus(16);
        bus.emit(EventKind::RunStarted, json!({}));
        let mut stream = bus.subscribe();
        bus.emit(EventKind::Terminal, json!({}));
        bus.close();

        match stream.next().await {
            Some(Delivery::Event(e)) => assert_eq!(e.kind, EventKind::Terminal),
            other => panic!("unexpected delivery: {other:?}"),
        }
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_told_what_it_missed() {
        let bus = bus(2);
        let mut stream = bus.subscribe();
        for _ in 0..5 {
            bus.emit(EventKind::DiagnosticsFound, json!({}));
        }
        assert_eq!(stream.next().await, Some(Delivery::Missed(3)));
        match stream.next().await {
            Some(Delivery::Event(e)) => assert_eq!(e.seq, 3),
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[test]
    fn test_closed_bus_rejects_events() {
        let bus = bus(4);
        bus.close();
        assert!(bus.emit(EventKind::Terminal, json!({})).is_none());
        assert!(bus.history().is_empty());
    }
}
