// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reconcile dispatcher.
//!
//! Turns registry change notifications, requeues and periodic resyncs into
//! reconcile passes:
//!
//! - at most one pass per store runs at a time; a trigger that arrives while
//!   a pass is running marks the store dirty and it runs again afterwards
//! - passes for different stores run concurrently, up to `workers`
//! - a delete request cancels the store's in-flight pass so cleanup can
//!   start without waiting for a hung provisioning step
//! - stores waiting for a provisioning slot are woken when one frees up
//! - the first pass after start is a resume pass
//!
//! Triggers carry no payload. Every pass re-reads the record, so lost or
//! duplicated notifications only cost an extra pass.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::Notify;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue;
use tracing::{debug, error, info, warn};

use crate::error::ReconcileError;
use crate::reconciler::{Action, PassKind, Reconciler};
use crate::store::StoreId;

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Maximum passes running at once.
    pub workers: usize,
    /// Interval of the full resync.
    pub resync_interval: Duration,
    /// Delay before re-running a pass that returned an error.
    pub error_backoff: Duration,
    /// Delay between attempts to list stores at startup.
    pub startup_retry: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            resync_interval: Duration::from_secs(300),
            error_backoff: Duration::from_secs(5),
            startup_retry: Duration::from_secs(2),
        }
    }
}

type PassResult = (StoreId, Result<Action, ReconcileError>);

/// Bookkeeping for the dispatch loop.
#[derive(Default)]
struct DispatchState {
    queue: DelayQueue<StoreId>,
    queued: HashMap<StoreId, (delay_queue::Key, Instant)>,
    resume: HashSet<StoreId>,
    in_flight: HashMap<StoreId, CancellationToken>,
    tasks: HashMap<task::Id, StoreId>,
    dirty: HashSet<StoreId>,
    waiting: HashSet<StoreId>,
}

impl DispatchState {
    /// Queue a pass after `delay`, keeping the earlier time if already queued.
    fn schedule(&mut self, store_id: StoreId, delay: Duration) {
        let at = Instant::now() + delay;
        match self.queued.get_mut(&store_id) {
            Some((key, current)) => {
                if at < *current {
                    self.queue.reset_at(&*key, at);
                    *current = at;
                }
            }
            None => {
                let key = self.queue.insert_at(store_id.clone(), at);
                self.queued.insert(store_id, (key, at));
            }
        }
    }
}

/// Background dispatcher driving the [`Reconciler`].
pub struct Controller {
    reconciler: Reconciler,
    config: ControllerConfig,
    shutdown: Arc<Notify>,
}

impl Controller {
    /// Create a dispatcher.
    pub fn new(reconciler: Reconciler, config: ControllerConfig) -> Self {
        Self {
            reconciler,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the dispatch loop until shutdown is signalled.
    ///
    /// In-flight passes are cancelled on shutdown; their stores are resumed
    /// from persisted state on the next start.
    pub async fn run(&self) {
        info!(
            workers = self.config.workers,
            resync_interval_secs = self.config.resync_interval.as_secs(),
            "Controller started"
        );

        let workers = self.config.workers.max(1);
        let limiter = self.reconciler.limiter().clone();
        // Subscribe before listing so no change between the two is lost.
        let mut changes = self.reconciler.registry().subscribe();
        let mut changes_open = true;

        let mut state = DispatchState::default();
        let mut passes: JoinSet<PassResult> = JoinSet::new();
        let mut resumed = false;

        let mut resync = tokio::time::interval_at(
            Instant::now() + self.config.resync_interval,
            self.config.resync_interval,
        );
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if !resumed {
                resumed = self.resume(&mut state).await;
            }

            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Controller received shutdown signal");
                    break;
                }

                Some(joined) = passes.join_next_with_id(), if !passes.is_empty() => {
                    let (task_id, result) = match joined {
                        Ok((task_id, result)) => (task_id, Some(result)),
                        Err(e) => {
                            error!(error = %e, "Reconcile task panicked");
                            (e.id(), None)
                        }
                    };
                    if let Some(store_id) = state.tasks.remove(&task_id) {
                        self.finish(&mut state, store_id, result.map(|(_, r)| r));
                    }
                    if !state.waiting.is_empty() && limiter.in_flight().await < limiter.capacity() {
                        wake_waiting(&mut state);
                    }
                }

                change = changes.recv(), if changes_open => match change {
                    Ok(change) => {
                        if change.deletion_requested
                            && let Some(token) = state.in_flight.get(&change.store_id)
                        {
                            debug!(store_id = %change.store_id, "Deletion requested, cancelling in-flight pass");
                            token.cancel();
                        }
                        state.schedule(change.store_id, Duration::ZERO);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Change notifications lagged, resyncing");
                        self.resync(&mut state).await;
                    }
                    Err(RecvError::Closed) => {
                        warn!("Change notification channel closed, relying on resync");
                        changes_open = false;
                    }
                },

                _ = limiter.slot_freed(), if !state.waiting.is_empty() => {
                    wake_waiting(&mut state);
                }

                Some(expired) = state.queue.next(), if !state.queue.is_empty() && passes.len() < workers => {
                    let store_id = expired.into_inner();
                    state.queued.remove(&store_id);
                    self.dispatch(&mut state, &mut passes, store_id);
                }

                _ = resync.tick(), if resumed => {
                    self.resync(&mut state).await;
                }

                _ = tokio::time::sleep(self.config.startup_retry), if !resumed => {}
            }
        }

        for token in state.in_flight.values() {
            token.cancel();
        }
        passes.shutdown().await;
        info!("Controller stopped");
    }

    /// List every store once and queue a resume pass for it.
    async fn resume(&self, state: &mut DispatchState) -> bool {
        match self.reconciler.registry().list().await {
            Ok(records) => {
                info!(stores = records.len(), "Resuming stores from persisted state");
                for record in records {
                    let store_id = record.store_id().clone();
                    state.resume.insert(store_id.clone());
                    state.schedule(store_id, Duration::ZERO);
                }
                true
            }
            Err(e) => {
                warn!(error = %e, "Failed to list stores at startup, retrying");
                false
            }
        }
    }

    async fn resync(&self, state: &mut DispatchState) {
        match self.reconciler.registry().list().await {
            Ok(records) => {
                debug!(stores = records.len(), "Resync");
                for record in records {
                    state.schedule(record.store_id().clone(), Duration::ZERO);
                }
            }
            Err(e) => warn!(error = %e, "Resync failed to list stores"),
        }
    }

    fn dispatch(&self, state: &mut DispatchState, passes: &mut JoinSet<PassResult>, store_id: StoreId) {
        if state.in_flight.contains_key(&store_id) {
            state.dirty.insert(store_id);
            return;
        }
        let kind = if state.resume.remove(&store_id) {
            PassKind::Resume
        } else {
            PassKind::Normal
        };
        state.waiting.remove(&store_id);

        let token = CancellationToken::new();
        state.in_flight.insert(store_id.clone(), token.clone());

        let reconciler = self.reconciler.clone();
        let id = store_id.clone();
        let handle = passes.spawn(async move {
            let result = reconciler.reconcile(&id, kind, &token).await;
            (id, result)
        });
        state.tasks.insert(handle.id(), store_id);
    }

    fn finish(
        &self,
        state: &mut DispatchState,
        store_id: StoreId,
        result: Option<Result<Action, ReconcileError>>,
    ) {
        state.in_flight.remove(&store_id);

        match result {
            Some(Ok(Action::Done)) => {}
            Some(Ok(Action::Requeue(delay))) => state.schedule(store_id.clone(), delay),
            Some(Ok(Action::WaitForSlot(delay))) => {
                state.waiting.insert(store_id.clone());
                state.schedule(store_id.clone(), delay);
            }
            Some(Err(e)) => {
                warn!(store_id = %store_id, error = %e, "Reconcile pass failed");
                state.schedule(store_id.clone(), self.config.error_backoff);
            }
            None => state.schedule(store_id.clone(), self.config.error_backoff),
        }

        if state.dirty.remove(&store_id) {
            state.schedule(store_id, Duration::ZERO);
        }
    }
}

fn wake_waiting(state: &mut DispatchState) {
    let waiting: Vec<StoreId> = state.waiting.drain().collect();
    for store_id in waiting {
        state.schedule(store_id, Duration::ZERO);
    }
}
