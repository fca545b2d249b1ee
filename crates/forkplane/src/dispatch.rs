//! Pipeline work queue.
//!
//! Holds the ordered backlog of one pipeline, hands out the next unclaimed
//! item to whichever fork asks, and tracks when the pipeline is drained.
//!
//! All state sits behind one mutex; blocked callers of `next_item` park on a
//! `Notify` that is signalled on enqueue, end of splitting, and stop.

use std::collections::{BTreeSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::Instant;

use crate::bridge::protocol::{ForkId, WorkItem};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("cannot enqueue {0}: splitting has ended")]
    SplittingEnded(String),
    #[error("cannot enqueue {0}: pipeline is stopping")]
    Stopping(String),
}

#[derive(Debug, Default)]
struct DispatchState {
    backlog: VecDeque<WorkItem>,
    queued: usize,
    executed: usize,
    splitting_ended: bool,
    stopping: bool,
    running_forks: BTreeSet<ForkId>,
}

impl DispatchState {
    fn all_executed(&self) -> bool {
        self.backlog.is_empty() && self.executed >= self.queued
    }
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    pub queued: usize,
    pub pending: usize,
    pub executed: usize,
    pub running_forks: usize,
}

pub struct PipelineDispatcher {
    state: Mutex<DispatchState>,
    changed: Notify,
    poll_timeout: Duration,
    all_stopped_tx: watch::Sender<bool>,
}

impl PipelineDispatcher {
    pub fn new(poll_timeout: Duration) -> Self {
        let (all_stopped_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(DispatchState::default()),
            changed: Notify::new(),
            poll_timeout,
            all_stopped_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        // Counters stay meaningful after a panic elsewhere; keep going.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn enqueue(&self, item: WorkItem) -> Result<(), DispatchError> {
        {
            let mut state = self.lock();
            if state.stopping {
                return Err(DispatchError::Stopping(item.name));
            }
            if state.splitting_ended {
                return Err(DispatchError::SplittingEnded(item.name));
            }
            tracing::trace!(item = %item.name, "Enqueued work item");
            state.backlog.push_back(item);
            state.queued += 1;
        }
        self.changed.notify_one();
        Ok(())
    }

    /// Puts back an item that was claimed but never handed to a fork.
    pub fn requeue(&self, item: WorkItem) {
        {
            let mut state = self.lock();
            tracing::debug!(item = %item.name, "Requeued work item");
            state.backlog.push_front(item);
        }
        self.changed.notify_one();
    }

    /// No further items will be enqueued.
    pub fn end_splitting(&self) {
        {
            let mut state = self.lock();
            if state.splitting_ended {
                return;
            }
            state.splitting_ended = true;
            tracing::debug!(queued = state.queued, "Splitting ended");
        }
        self.changed.notify_waiters();
    }

    /// Next unclaimed item.
    ///
    /// Waits up to the poll timeout for an item to arrive. Returns `None` when
    /// the wait times out, the backlog is permanently empty, or the pipeline is
    /// stopping; callers tell these apart with `is_splitting_ended`/`is_stopping`.
    pub async fn next_item(&self) -> Option<WorkItem> {
        let deadline = Instant::now() + self.poll_timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.lock();
                if state.stopping {
                    return None;
                }
                if let Some(item) = state.backlog.pop_front() {
                    return Some(item);
                }
                if state.splitting_ended {
                    return None;
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    /// Records that an item handed out earlier has a result.
    pub fn record_result(&self) {
        let mut state = self.lock();
        state.executed += 1;
        if state.executed > state.queued {
            tracing::warn!(
                executed = state.executed,
                queued = state.queued,
                "More results recorded than items queued"
            );
        }
    }

    /// Removes every unclaimed item, e.g. when no fork is left to run them.
    pub fn drain_backlog(&self) -> Vec<WorkItem> {
        let mut state = self.lock();
        state.backlog.drain(..).collect()
    }

    pub fn is_splitting_ended(&self) -> bool {
        self.lock().splitting_ended
    }

    pub fn is_all_items_executed(&self) -> bool {
        self.lock().all_executed()
    }

    /// Stops the pipeline once splitting has ended and every item has a result.
    /// Returns whether the pipeline is stopping afterwards.
    pub fn check_completion(&self) -> bool {
        let complete = {
            let state = self.lock();
            if state.stopping {
                return true;
            }
            state.splitting_ended && state.all_executed()
        };
        if complete {
            tracing::info!("All work items executed, stopping pipeline");
            self.stop();
        }
        complete
    }

    pub fn is_stopping(&self) -> bool {
        self.lock().stopping
    }

    /// Cooperative shutdown: wakes every blocked `next_item` caller.
    pub fn stop(&self) {
        let no_forks = {
            let mut state = self.lock();
            if state.stopping {
                return;
            }
            state.stopping = true;
            state.running_forks.is_empty()
        };
        self.changed.notify_waiters();
        if no_forks {
            self.signal_all_stopped();
        }
    }

    /// Registers a launching fork under the same lock that `stop` takes.
    ///
    /// `None` once the pipeline is stopping. Otherwise tells whether the fork
    /// was newly added; a fork relaunched from RESTARTING is still registered.
    pub fn try_add_running_fork(&self, fork_id: ForkId) -> Option<bool> {
        let mut state = self.lock();
        if state.stopping {
            return None;
        }
        Some(state.running_forks.insert(fork_id))
    }

    /// Returns true if the fork was running and was the last one.
    pub fn remove_running_fork(&self, fork_id: ForkId) -> bool {
        let mut state = self.lock();
        state.running_forks.remove(&fork_id) && state.running_forks.is_empty()
    }

    pub fn are_all_forks_stopped(&self) -> bool {
        self.lock().running_forks.is_empty()
    }

    pub fn running_forks(&self) -> Vec<ForkId> {
        self.lock().running_forks.iter().copied().collect()
    }

    pub(crate) fn signal_all_stopped(&self) {
        tracing::debug!("All forks stopped");
        self.all_stopped_tx.send_replace(true);
    }

    /// Resolves once the pipeline is stopping and its last fork has stopped.
    pub async fn wait_all_stopped(&self) {
        let mut rx = self.all_stopped_tx.subscribe();
        // Sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    pub fn is_all_stopped(&self) -> bool {
        *self.all_stopped_tx.borrow()
    }

    pub fn stats(&self) -> DispatchStats {
        let state = self.lock();
        DispatchStats {
            queued: state.queued,
            pending: state.backlog.len(),
            executed: state.executed,
            running_forks: state.running_forks.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn dispatcher() -> PipelineDispatcher {
        PipelineDispatcher::new(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn hands_out_items_in_order() {
        let d = dispatcher();
        for name in ["a", "b", "c"] {
            d.enqueue(WorkItem::new(name)).unwrap();
        }
        d.end_splitting();

        assert_eq!(d.next_item().await.unwrap().name, "a");
        assert_eq!(d.next_item().await.unwrap().name, "b");
        assert_eq!(d.next_item().await.unwrap().name, "c");
        assert!(d.next_item().await.is_none());
    }

    #[tokio::test]
    async fn empty_backlog_times_out_without_error() {
        let d = dispatcher();
        let start = std::time::Instant::now();
        assert!(d.next_item().await.is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(!d.is_splitting_ended());
    }

    #[tokio::test]
    async fn blocked_caller_receives_late_item() {
        let d = Arc::new(PipelineDispatcher::new(Duration::from_secs(5)));
        let waiter = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.next_item().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        d.enqueue(WorkItem::new("late")).unwrap();

        let item = waiter.await.unwrap();
        assert_eq!(item.unwrap().name, "late");
    }

    #[tokio::test]
    async fn stop_wakes_blocked_callers() {
        let d = Arc::new(PipelineDispatcher::new(Duration::from_secs(30)));
        let waiter = {
            let d = Arc::clone(&d);
            tokio::spawn(async move { d.next_item().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        d.stop();

        let item = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake on stop")
            .unwrap();
        assert!(item.is_none());
    }

    #[tokio::test]
    async fn stopping_withholds_remaining_items() {
        let d = dispatcher();
        d.enqueue(WorkItem::new("a")).unwrap();
        d.stop();
        assert!(d.next_item().await.is_none());
        assert_eq!(
            d.enqueue(WorkItem::new("b")),
            Err(DispatchError::Stopping("b".to_string()))
        );
    }

    #[test]
    fn enqueue_after_splitting_ended_is_rejected() {
        let d = dispatcher();
        d.end_splitting();
        assert_eq!(
            d.enqueue(WorkItem::new("x")),
            Err(DispatchError::SplittingEnded("x".to_string()))
        );
    }

    #[tokio::test]
    async fn all_items_executed_tracks_results() {
        let d = dispatcher();
        d.enqueue(WorkItem::new("a")).unwrap();
        d.enqueue(WorkItem::new("b")).unwrap();
        assert!(!d.is_all_items_executed());

        d.next_item().await.unwrap();
        d.next_item().await.unwrap();
        d.record_result();
        assert!(!d.is_all_items_executed());
        d.record_result();
        assert!(d.is_all_items_executed());

        assert!(!d.check_completion());
        d.end_splitting();
        assert!(d.check_completion());
        assert!(d.is_stopping());
    }

    #[tokio::test]
    async fn requeued_item_is_handed_out_first() {
        let d = dispatcher();
        d.enqueue(WorkItem::new("a")).unwrap();
        d.enqueue(WorkItem::new("b")).unwrap();
        let a = d.next_item().await.unwrap();
        d.requeue(a);
        assert_eq!(d.next_item().await.unwrap().name, "a");
    }

    #[test]
    fn running_fork_bookkeeping() {
        let d = dispatcher();
        assert_eq!(d.try_add_running_fork(ForkId::new(1)), Some(true));
        assert_eq!(d.try_add_running_fork(ForkId::new(2)), Some(true));
        assert_eq!(d.try_add_running_fork(ForkId::new(2)), Some(false));
        assert!(!d.remove_running_fork(ForkId::new(1)));
        assert!(!d.remove_running_fork(ForkId::new(1)));
        assert!(!d.are_all_forks_stopped());
        assert!(d.remove_running_fork(ForkId::new(2)));
        assert!(d.are_all_forks_stopped());
    }

    #[test]
    fn no_fork_joins_once_stopping() {
        let d = dispatcher();
        assert_eq!(d.try_add_running_fork(ForkId::new(1)), Some(true));
        d.stop();
        assert_eq!(d.try_add_running_fork(ForkId::new(2)), None);
        assert_eq!(d.running_forks(), vec![ForkId::new(1)]);
        assert!(d.remove_running_fork(ForkId::new(1)));
    }

    #[tokio::test]
    async fn stop_without_forks_signals_all_stopped() {
        let d = dispatcher();
        d.stop();
        assert!(d.is_all_stopped());
        tokio::time::timeout(Duration::from_millis(100), d.wait_all_stopped())
            .await
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_get_disjoint_items() {
        let d = Arc::new(PipelineDispatcher::new(Duration::from_millis(200)));
        let mut takers = Vec::new();
        for _ in 0..3 {
            let d = Arc::clone(&d);
            takers.push(tokio::spawn(async move {
                let mut taken = Vec::new();
                while let Some(item) = d.next_item().await {
                    taken.push(item.name);
                    tokio::task::yield_now().await;
                }
                taken
            }));
        }

        for i in 0..9 {
            d.enqueue(WorkItem::new(format!("item-{i}"))).unwrap();
        }
        d.end_splitting();

        let mut all = Vec::new();
        for taker in takers {
            all.extend(taker.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().cloned().collect();
        assert_eq!(all.len(), 9);
        assert_eq!(unique.len(), 9);
    }
}
