//! Bounded request queue with delayed admission.
//!
//! The queue is a bounded FIFO plus a time-ordered set of deferred items.
//! A background poller moves deferred items into the FIFO once their
//! release time has passed, re-checking every [`POLL_INTERVAL`]. Items
//! without a delay bypass the deferred set entirely, so the FIFO order of
//! immediate items is exact; deferred items enter in release-time order,
//! modulo the poll granularity.
//!
//! Backpressure: [`DelayQueue::put`] blocks while the FIFO is full.
//! [`DelayQueue::put_later`] never does; its item waits in the heap and
//! the poller absorbs the blocking when it graduates.

use std::collections::BinaryHeap;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, sleep};
use tracing::error;

/// How often the poller re-checks the earliest deferred item.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One deferred item. Ordered by release time, then by insertion order,
/// inverted so the binary heap pops the earliest first.
struct Deferred<T> {
    release_at: Instant,
    seq: u64,
    item: T,
}

impl<T> PartialEq for Deferred<T> {
    fn eq(&self, other: &Self) -> bool {
        self.release_at == other.release_at && self.seq == other.seq
    }
}

impl<T> Eq for Deferred<T> {}

impl<T> PartialOrd for Deferred<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Deferred<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (other.release_at, other.seq).cmp(&(self.release_at, self.seq))
    }
}

struct HeapState<T> {
    heap: BinaryHeap<Deferred<T>>,
    next_seq: u64,
}

impl<T> HeapState<T> {
    fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }
}

/// Bounded FIFO of requests plus a deferred set, multi-producer and
/// multi-consumer.
pub(crate) struct DelayQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Mutex<mpsc::Receiver<T>>,
    heap: Arc<Mutex<HeapState<T>>>,
    poller: JoinHandle<()>,
}

impl<T: Send + 'static> DelayQueue<T> {
    /// Creates the queue and spawns its poller task. Must be called from
    /// within a runtime.
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let heap = Arc::new(Mutex::new(HeapState::new()));
        let poller = tokio::spawn(poll(tx.clone(), Arc::clone(&heap)));
        Self {
            tx,
            rx: Mutex::new(rx),
            heap,
            poller,
        }
    }

    /// Appends an item to the FIFO, waiting while it is full.
    pub(crate) async fn put(&self, item: T) {
        if self.tx.send(item).await.is_err() {
            // The receiver lives inside this queue, so this cannot happen
            // while a caller still holds the queue.
            error!("request queue receiver dropped");
        }
    }

    /// Defers an item until `delay` has elapsed. Never waits on the FIFO.
    pub(crate) async fn put_later(&self, item: T, delay: Duration) {
        let mut state = self.heap.lock().await;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Deferred {
            release_at: Instant::now() + delay,
            seq,
            item,
        });
    }

    /// Removes the next item, waiting while the FIFO is empty.
    pub(crate) async fn get(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }
}

impl<T> Drop for DelayQueue<T> {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

/// Poller loop: transfer the earliest deferred item once its release time
/// has passed, otherwise sleep one interval. The transfer may wait on
/// FIFO backpressure, which is fine because only this task blocks.
async fn poll<T>(tx: mpsc::Sender<T>, heap: Arc<Mutex<HeapState<T>>>) {
    loop {
        let due = {
            let mut state = heap.lock().await;
            match state.heap.peek() {
                Some(deferred) if deferred.release_at <= Instant::now() => {
                    state.heap.pop().map(|d| d.item)
                }
                _ => None,
            }
        };
        match due {
            Some(item) => {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
            None => sleep(POLL_INTERVAL).await,
        }
    }
}
