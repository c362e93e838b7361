//! Background worker draining the queue into the session
//!
//! One envelope is in flight at a time. It stays in flight until a send succeeds, so a FIFO
//! queue is delivered in enqueue order. Transient and unexpected send failures both keep
//! the envelope and wait under backoff before the next attempt. While the session is down
//! the in-flight envelope is parked: no attempt is made or counted until the supervisor
//! reconnects.

use super::stats::{DispatchStats, DispatchStatsSnapshot};
use crate::connection::{BackoffPolicy, ConnectionSupervisor};
use crate::error::{sanitize_error_message, ErrorClass, SdkError, SessionError};
use crate::queue::{Envelope, QueueStrategy};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Fallback poll interval while waiting for the queue to drain
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long `stop_processing` waits for the loop before aborting it
const LOOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Timing and retry limits for the dispatch loop
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DispatchPolicy {
    /// Sleep between checks while disconnected or idle
    pub idle_interval: Duration,
    /// Delay between attempts on the same envelope
    pub backoff: BackoffPolicy,
    /// Drop an envelope after this many failed sends. `None` retries forever.
    pub max_send_attempts: Option<u32>,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(500),
            backoff: BackoffPolicy::default(),
            max_send_attempts: None,
        }
    }
}

struct DispatchShared {
    queue: Arc<dyn QueueStrategy>,
    supervisor: Arc<ConnectionSupervisor>,
    policy: DispatchPolicy,
    in_flight: AtomicBool,
    idle: Notify,
    stats: DispatchStats,
}

impl DispatchShared {
    fn pending_count(&self) -> usize {
        self.queue.count() + usize::from(self.in_flight.load(Ordering::SeqCst))
    }

    fn finish_envelope(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
        if self.queue.is_empty() {
            self.idle.notify_waiters();
        }
    }

    fn take_next(&self) -> Option<Envelope> {
        // Raise the flag first so the envelope is never invisible to `pending_count`.
        self.in_flight.store(true, Ordering::SeqCst);
        let envelope = self.queue.try_dequeue();
        if envelope.is_none() {
            self.in_flight.store(false, Ordering::SeqCst);
        }
        envelope
    }
}

struct DispatchTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// The dispatch loop service
pub struct Dispatcher {
    shared: Arc<DispatchShared>,
    task: Mutex<Option<DispatchTask>>,
}

enum Attempt {
    Delivered,
    Failed(SessionError),
    /// The session went away before the broker took the event
    Disconnected(String),
    Stopped,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<dyn QueueStrategy>,
        supervisor: Arc<ConnectionSupervisor>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(DispatchShared {
                queue,
                supervisor,
                policy,
                in_flight: AtomicBool::new(false),
                idle: Notify::new(),
                stats: DispatchStats::default(),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn queue(&self) -> &Arc<dyn QueueStrategy> {
        &self.shared.queue
    }

    pub async fn start_processing(&self) -> Result<(), SdkError> {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return Err(SdkError::AlreadyStarted);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let span = crate::dispatch_span!(
            client_id = %shared.supervisor.client_id(),
            strategy = ?shared.queue.kind()
        );
        let handle = tokio::spawn(Self::run(shared, shutdown_rx).instrument(span));
        *task = Some(DispatchTask {
            shutdown_tx,
            handle,
        });
        info!("Dispatch loop started");
        Ok(())
    }

    /// Signal the loop and wait for its current iteration to finish
    pub async fn stop_processing(&self) {
        let Some(DispatchTask {
            shutdown_tx,
            handle,
        }) = self.task.lock().await.take()
        else {
            return;
        };

        let _ = shutdown_tx.send(true);
        let abort = handle.abort_handle();
        match tokio::time::timeout(LOOP_JOIN_TIMEOUT, handle).await {
            Ok(Ok(())) => debug!("Dispatch loop exited"),
            Ok(Err(e)) if !e.is_cancelled() => error!("Dispatch loop panicked: {}", e),
            Err(_) => {
                warn!("Dispatch loop did not exit in time, aborting");
                abort.abort();
                self.shared.in_flight.store(false, Ordering::SeqCst);
            }
            _ => {}
        }
        info!(pending = self.pending_count(), "Dispatch loop stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.task.lock().await.is_some()
    }

    /// Queued plus in-flight envelopes
    pub fn pending_count(&self) -> usize {
        self.shared.pending_count()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Wait until nothing is pending. Returns `false` when `timeout` elapsed first.
    pub async fn wait_until_drained(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.shared.idle.notified();
                if self.pending_count() == 0 {
                    return;
                }
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
                }
            }
        })
        .await;
        drained.is_ok() || self.pending_count() == 0
    }

    async fn run(shared: Arc<DispatchShared>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut backoff = shared.policy.backoff.start();
        let mut in_flight: Option<Envelope> = None;

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let connected = shared.supervisor.is_connected();
            if in_flight.is_none() && connected {
                in_flight = shared.take_next();
            }

            let Some(mut envelope) = in_flight.take() else {
                if shared.queue.is_empty() {
                    shared.idle.notify_waiters();
                }
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(shared.policy.idle_interval) => {}
                }
                continue;
            };

            if !connected {
                in_flight = Some(envelope);
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(shared.policy.idle_interval) => {}
                }
                continue;
            }

            match Self::attempt(&shared, &mut envelope, &mut shutdown_rx).await {
                Attempt::Delivered => {
                    backoff.reset();
                    Self::complete(&shared, envelope);
                }
                Attempt::Stopped => {
                    in_flight = Some(envelope);
                    break;
                }
                Attempt::Disconnected(reason) => {
                    debug!(
                        message_id = %envelope.message_id(),
                        reason = %reason,
                        "Session down, holding event until reconnect"
                    );
                    in_flight = Some(envelope);
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(shared.policy.idle_interval) => {}
                    }
                }
                Attempt::Failed(e) => {
                    shared.stats.record_send_failure();
                    let message_id = envelope.message_id();
                    let attempts = envelope.attempts();
                    let reason = sanitize_error_message(&e.to_string());

                    if let Some(max) = shared.policy.max_send_attempts {
                        if attempts >= max {
                            error!(
                                message_id = %message_id,
                                attempts,
                                error = %reason,
                                "Giving up on event after repeated send failures"
                            );
                            shared.stats.record_dead_lettered();
                            drop(envelope);
                            shared.finish_envelope();
                            backoff.reset();
                            continue;
                        }
                    }

                    let delay = backoff.next_delay();
                    match e.class() {
                        ErrorClass::Unexpected => error!(
                            message_id = %message_id,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %reason,
                            "Unexpected send failure"
                        ),
                        _ => warn!(
                            message_id = %message_id,
                            attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %reason,
                            "Send failed, will retry"
                        ),
                    }

                    in_flight = Some(envelope);
                    tokio::select! {
                        _ = shutdown_rx.changed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if let Some(envelope) = in_flight.take() {
            debug!(message_id = %envelope.message_id(), "Returning in-flight event to the queue");
            shared.queue.requeue(envelope);
        }
        shared.in_flight.store(false, Ordering::SeqCst);
    }

    async fn attempt(
        shared: &DispatchShared,
        envelope: &mut Envelope,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Attempt {
        let payload = match envelope.payload() {
            Ok(payload) => payload,
            Err(e) => {
                envelope.record_attempt();
                return Attempt::Failed(SessionError::Serialization(e));
            }
        };
        let topic = envelope.topic();

        let result = tokio::select! {
            _ = shutdown_rx.changed() => return Attempt::Stopped,
            result = shared.supervisor.send(&topic, payload) => result,
        };
        match result {
            Err(SessionError::NotConnected { reason }) => Attempt::Disconnected(reason),
            Ok(()) => {
                envelope.record_attempt();
                Attempt::Delivered
            }
            Err(e) => {
                envelope.record_attempt();
                Attempt::Failed(e)
            }
        }
    }

    fn complete(shared: &DispatchShared, envelope: Envelope) {
        let topic = envelope.topic();
        let message_id = envelope.message_id();
        // A panicking callback must not take the loop down with it.
        match std::panic::catch_unwind(AssertUnwindSafe(move || envelope.complete(topic))) {
            Ok(receipt) => debug!(
                message_id = %receipt.message_id,
                attempts = receipt.attempts,
                topic = %receipt.topic,
                "Event delivered"
            ),
            Err(_) => error!(message_id = %message_id, "Delivery callback panicked"),
        }
        shared.stats.record_delivered();
        shared.finish_envelope();
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.try_lock() {
            if let Some(task) = task.take() {
                task.handle.abort();
            }
        }
    }
}
