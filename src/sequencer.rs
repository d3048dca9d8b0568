// =============================================================================
// Sequencer — single-consumer FIFO between intake and dispatch
// =============================================================================
//
// The webhook accepts any number of concurrent POSTs but only enqueues; this
// worker is the sole consumer, so at most one signal is ever being dispatched
// and arrival order is dispatch order. Between consecutive signals the worker
// enforces a randomized minimum interval, measured from the completion of the
// previous dispatch.
//
// Fail-forward: each dispatch runs in its own task. If it panics, the signal
// is discarded, the operator is notified, and the worker moves on.
// =============================================================================

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};
use tracing::{error, info};

use crate::config::ConfigStore;
use crate::dispatcher::Dispatcher;
use crate::notify::{EventBus, TradeEvent};
use crate::signal::Signal;

/// One queued intake item.
#[derive(Debug, Clone)]
pub struct QueuedSignal {
    pub request_id: String,
    pub signal: Signal,
    pub enqueued_at: DateTime<Utc>,
}

/// Producer handle given to the HTTP intake.
#[derive(Clone)]
pub struct SignalQueue {
    tx: mpsc::UnboundedSender<QueuedSignal>,
    depth: Arc<AtomicUsize>,
    in_flight: Arc<RwLock<Option<String>>>,
}

/// Consumer end owned by the worker.
pub struct QueueReceiver {
    rx: mpsc::UnboundedReceiver<QueuedSignal>,
    depth: Arc<AtomicUsize>,
    in_flight: Arc<RwLock<Option<String>>>,
}

/// Create the queue pair.
pub fn channel() -> (SignalQueue, QueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    let in_flight = Arc::new(RwLock::new(None));
    (
        SignalQueue {
            tx,
            depth: depth.clone(),
            in_flight: in_flight.clone(),
        },
        QueueReceiver {
            rx,
            depth,
            in_flight,
        },
    )
}

impl SignalQueue {
    /// Enqueue a signal; returns its queue position (1-based).
    pub fn enqueue(&self, request_id: String, signal: Signal) -> usize {
        let item = QueuedSignal {
            request_id,
            signal,
            enqueued_at: Utc::now(),
        };
        let position = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        // Receiver outlives the senders in normal operation; a send failure
        // only happens during shutdown.
        let _ = self.tx.send(item);
        position
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    /// Request id currently being dispatched, if any.
    pub fn in_flight(&self) -> Option<String> {
        self.in_flight.read().clone()
    }
}

/// Spawn the single consumer worker.
///
/// Shutdown finishes the in-flight signal first; whatever is still queued is
/// dropped with the process (the queue is memory-only by design).
pub fn spawn_worker(
    mut receiver: QueueReceiver,
    dispatcher: Arc<Dispatcher>,
    store: Arc<ConfigStore>,
    events: EventBus,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_done: Option<Instant> = None;

        loop {
            let item = tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("sequencer stopping");
                    break;
                }
                item = receiver.rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            receiver.depth.fetch_sub(1, Ordering::SeqCst);

            // Inter-signal spacing, measured from the previous completion.
            let delay = store.get().execution.delay_between_brokers.clone();
            if let Some(prev) = last_done {
                if delay.enabled && delay.max_ms > 0 {
                    let target_ms = rand::thread_rng()
                        .gen_range(delay.min_ms..=delay.max_ms.max(delay.min_ms));
                    let target = Duration::from_millis(target_ms);
                    let elapsed = prev.elapsed();
                    if elapsed < target {
                        tokio::time::sleep(target - elapsed).await;
                    }
                }
            }

            *receiver.in_flight.write() = Some(item.request_id.clone());
            info!(
                request_id = %item.request_id,
                symbol = %item.signal.symbol,
                queued_for_ms = (Utc::now() - item.enqueued_at).num_milliseconds(),
                "dispatch starting"
            );

            // Isolate the dispatch so a panic discards only this signal.
            let task_dispatcher = dispatcher.clone();
            let task_signal = item.signal.clone();
            let result = tokio::spawn(async move {
                task_dispatcher.dispatch(&task_signal, false).await
            })
            .await;

            match result {
                Ok(outcomes) => {
                    let submitted = outcomes
                        .values()
                        .filter(|o| matches!(o, crate::dispatcher::AccountOutcome::Submitted { .. }))
                        .count();
                    info!(
                        request_id = %item.request_id,
                        accounts = outcomes.len(),
                        submitted,
                        "dispatch complete"
                    );
                }
                Err(join_error) => {
                    error!(
                        request_id = %item.request_id,
                        error = %join_error,
                        "dispatch panicked, signal discarded"
                    );
                    events.emit(TradeEvent::EngineError {
                        broker: None,
                        message: format!(
                            "dispatch of {} ({}) crashed and was discarded",
                            item.request_id, item.signal.symbol
                        ),
                    });
                }
            }

            *receiver.in_flight.write() = None;
            last_done = Some(Instant::now());
        }
    })
}
