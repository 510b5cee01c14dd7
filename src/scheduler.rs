//! Min-heap scheduler: fires a callback exactly once per scheduled id, at or
//! after its due time, per spec.md §4.3.
//!
//! A single `BinaryHeap<Reverse<SchedNode>>` holds every `(due_at_ms, seq,
//! id)` ever scheduled; an `id -> (due_at_ms, seq)` validity map lets
//! `schedule`/`cancel` invalidate stale heap entries in O(1) without a heap
//! rebuild (`seq` distinguishes the live entry for an id from superseded
//! ones still sitting in the heap — lazy cleanup on pop). One background
//! task owns a `tokio::time::sleep_until` aimed at the earliest valid node
//! and rearms itself after every fire.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex};

#[derive(Debug, Clone, Eq, PartialEq)]
struct SchedNode {
    due_at_ms: u64,
    seq: u64,
    id: String,
}

impl Ord for SchedNode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due_at_ms
            .cmp(&other.due_at_ms)
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for SchedNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<Reverse<SchedNode>>,
    valid: HashMap<String, (u64, u64)>,
}

#[derive(Default, Clone, Copy)]
pub struct SchedulerStats {
    pub scheduled: usize,
    pub fired_total: u64,
    pub canceled_total: u64,
}

/// Public handle. `Scheduler::spawn` starts the background firing task and
/// returns both the handle and a receiver of due ids — the caller (usually
/// the publisher) drives actual work off that channel so the scheduler
/// itself never awaits anything besides its own timer.
pub struct Scheduler {
    inner: Arc<AsyncMutex<Inner>>,
    seq_counter: Arc<AtomicU64>,
    fired_total: Arc<AtomicU64>,
    canceled_total: Arc<AtomicU64>,
    notify: Arc<tokio::sync::Notify>,
    stopped: Arc<std::sync::atomic::AtomicBool>,
}

impl Scheduler {
    /// Start the scheduler and its background timer task. Returns the
    /// handle plus a channel that yields ids as they come due.
    pub fn spawn() -> (Scheduler, mpsc::UnboundedReceiver<String>) {
        let inner = Arc::new(AsyncMutex::new(Inner {
            heap: BinaryHeap::new(),
            valid: HashMap::new(),
        }));
        let notify = Arc::new(tokio::sync::Notify::new());
        let stopped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        let scheduler = Scheduler {
            inner: inner.clone(),
            seq_counter: Arc::new(AtomicU64::new(0)),
            fired_total: Arc::new(AtomicU64::new(0)),
            canceled_total: Arc::new(AtomicU64::new(0)),
            notify: notify.clone(),
            stopped: stopped.clone(),
        };

        let fired_total = scheduler.fired_total.clone();
        tokio::spawn(async move {
            loop {
                if stopped.load(AtomicOrdering::SeqCst) {
                    return;
                }

                let next_due = {
                    let guard = inner.lock().await;
                    guard
                        .heap
                        .peek()
                        .map(|Reverse(node)| node.due_at_ms)
                };

                match next_due {
                    None => {
                        notify.notified().await;
                    }
                    Some(due_at_ms) => {
                        let now_ms = crate::util::now_ms();
                        if due_at_ms > now_ms {
                            let wait = Duration::from_millis(due_at_ms - now_ms);
                            tokio::select! {
                                _ = tokio::time::sleep(wait) => {}
                                _ = notify.notified() => { continue; }
                            }
                        }

                        let now_ms = crate::util::now_ms();
                        let mut due_ids = Vec::new();
                        {
                            let mut guard = inner.lock().await;
                            while let Some(Reverse(node)) = guard.heap.peek() {
                                if node.due_at_ms > now_ms {
                                    break;
                                }
                                let Reverse(node) = guard.heap.pop().unwrap();
                                let still_valid = guard
                                    .valid
                                    .get(&node.id)
                                    .map(|&(d, s)| d == node.due_at_ms && s == node.seq)
                                    .unwrap_or(false);
                                if still_valid {
                                    guard.valid.remove(&node.id);
                                    due_ids.push(node.id);
                                }
                            }
                        }
                        for id in due_ids {
                            fired_total.fetch_add(1, AtomicOrdering::SeqCst);
                            let _ = tx.send(id);
                        }
                    }
                }
            }
        });

        (scheduler, rx)
    }

    /// Idempotent by id: a later call rewrites the due time, invalidating
    /// (not removing) any older heap entry for the same id via `seq`.
    pub async fn schedule(&self, id: &str, due_at_sec: u64) {
        let due_at_ms = due_at_sec.saturating_mul(1000);
        let seq = self.seq_counter.fetch_add(1, AtomicOrdering::SeqCst);
        {
            let mut guard = self.inner.lock().await;
            guard.valid.insert(id.to_string(), (due_at_ms, seq));
            guard.heap.push(Reverse(SchedNode {
                due_at_ms,
                seq,
                id: id.to_string(),
            }));
        }
        self.notify.notify_one();
    }

    pub async fn cancel(&self, id: &str) {
        let mut guard = self.inner.lock().await;
        if guard.valid.remove(id).is_some() {
            self.canceled_total.fetch_add(1, AtomicOrdering::SeqCst);
        }
    }

    pub async fn has(&self, id: &str) -> bool {
        self.inner.lock().await.valid.contains_key(id)
    }

    pub fn stop(&self) {
        self.stopped.store(true, AtomicOrdering::SeqCst);
        self.notify.notify_one();
    }

    pub async fn stats(&self) -> SchedulerStats {
        let guard = self.inner.lock().await;
        SchedulerStats {
            scheduled: guard.valid.len(),
            fired_total: self.fired_total.load(AtomicOrdering::SeqCst),
            canceled_total: self.canceled_total.load(AtomicOrdering::SeqCst),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_in_nondecreasing_due_order() {
        let (scheduler, mut rx) = Scheduler::spawn();
        let now = crate::util::now_secs();
        scheduler.schedule("late", now).await;
        scheduler.schedule("early", now).await;

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        // Both due "now" — tie-break is insertion order (late scheduled first).
        assert_eq!(first, "late");
        assert_eq!(second, "early");
        scheduler.stop();
    }

    #[tokio::test]
    async fn canceled_ids_never_fire() {
        let (scheduler, mut rx) = Scheduler::spawn();
        let now = crate::util::now_secs();
        scheduler.schedule("keep", now).await;
        scheduler.schedule("drop", now).await;
        scheduler.cancel("drop").await;

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, "keep");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
        scheduler.stop();
    }

    #[tokio::test]
    async fn reschedule_is_idempotent_by_id() {
        let (scheduler, mut rx) = Scheduler::spawn();
        let now = crate::util::now_secs();
        scheduler.schedule("job", now + 10).await;
        scheduler.schedule("job", now).await;

        let fired = rx.recv().await.unwrap();
        assert_eq!(fired, "job");
        assert_eq!(scheduler.stats().await.scheduled, 0);
        scheduler.stop();
    }
}
