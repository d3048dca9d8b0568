// =============================================================================
// Central Application State — shared across the API and worker tasks
// =============================================================================
//
// Thin hub: the queue handle, intake counters, and a ring of recent events
// for the introspection endpoints. Subsystems own their internal state; this
// struct only ties the seams together.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::config::ConfigStore;
use crate::notify::{EventBus, TradeEvent};
use crate::sequencer::SignalQueue;

/// Maximum number of recent events retained for the status endpoint.
const MAX_RECENT_EVENTS: usize = 100;

/// An event plus the instant it was recorded.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub at: String,
    #[serde(flatten)]
    pub event: TradeEvent,
}

/// Shared state handed to every HTTP handler via `Arc<AppState>`.
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub queue: SignalQueue,
    pub events: EventBus,

    pub signals_received: AtomicU64,
    pub signals_rejected: AtomicU64,

    pub recent_events: RwLock<Vec<EventRecord>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: Arc<ConfigStore>, queue: SignalQueue, events: EventBus) -> Self {
        Self {
            config,
            queue,
            events,
            signals_received: AtomicU64::new(0),
            signals_rejected: AtomicU64::new(0),
            recent_events: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn record_signal_received(&self) {
        self.signals_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signal_rejected(&self) {
        self.signals_rejected.fetch_add(1, Ordering::Relaxed);
    }

    fn push_event(&self, event: TradeEvent) {
        let mut events = self.recent_events.write();
        events.push(EventRecord {
            at: Utc::now().to_rfc3339(),
            event,
        });
        while events.len() > MAX_RECENT_EVENTS {
            events.remove(0);
        }
    }

    /// Mirror the event stream into the ring buffer the status endpoint
    /// serves. Runs until the process exits.
    pub fn spawn_event_recorder(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = self;
        let mut rx = state.events.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => state.push_event(event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequencer;

    fn state() -> Arc<AppState> {
        let store = Arc::new(ConfigStore::load("/nonexistent/relay.toml").unwrap());
        let (queue, _rx) = sequencer::channel();
        Arc::new(AppState::new(store, queue, EventBus::new()))
    }

    #[tokio::test]
    async fn event_recorder_fills_ring_buffer() {
        let state = state();
        let _recorder = state.clone().spawn_event_recorder();

        state.events.emit(TradeEvent::EngineError {
            broker: None,
            message: "test".into(),
        });

        for _ in 0..50 {
            if !state.recent_events.read().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let events = state.recent_events.read();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0].event, TradeEvent::EngineError { .. }));
    }

    #[test]
    fn ring_buffer_caps_length() {
        let store = Arc::new(ConfigStore::load("/nonexistent/relay.toml").unwrap());
        let (queue, _rx) = sequencer::channel();
        let state = AppState::new(store, queue, EventBus::new());
        for i in 0..150 {
            state.push_event(TradeEvent::EngineError {
                broker: None,
                message: format!("event {i}"),
            });
        }
        assert_eq!(state.recent_events.read().len(), MAX_RECENT_EVENTS);
    }

    #[test]
    fn counters_track_intake() {
        let state = state();
        state.record_signal_received();
        state.record_signal_received();
        state.record_signal_rejected();
        assert_eq!(state.signals_received.load(Ordering::Relaxed), 2);
        assert_eq!(state.signals_rejected.load(Ordering::Relaxed), 1);
    }
}
