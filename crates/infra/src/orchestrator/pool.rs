//! Bounded concurrency for partition fan-out and chunk pipelines, built on
//! `crossbeam-channel` queues.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, warn};

/// Counting semaphore backed by a bounded channel of tokens.
#[derive(Debug, Clone)]
pub struct PermitPool {
    capacity: usize,
    tokens: Receiver<()>,
    returns: Sender<()>,
}

impl PermitPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (returns, tokens) = bounded(capacity);
        for _ in 0..capacity {
            // Cannot fail: the channel has room for every token and both ends are held.
            let _ = returns.try_send(());
        }
        Self {
            capacity,
            tokens,
            returns,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.tokens.len()
    }

    /// Block until a slot is free.
    pub fn acquire(&self) -> Permit {
        if self.tokens.recv().is_err() {
            // The pool owns a sender, so the channel cannot disconnect while it lives.
            warn!("permit pool disconnected, running without a permit");
        }
        Permit {
            returns: self.returns.clone(),
        }
    }
}

/// Returns its token to the pool on drop.
#[derive(Debug)]
pub struct Permit {
    returns: Sender<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        match self.returns.try_send(()) {
            Ok(()) | Err(TrySendError::Disconnected(())) => {}
            Err(TrySendError::Full(())) => warn!("permit returned to a full pool"),
        }
    }
}

/// Run `work` over `items` on at most `workers` threads and return the results
/// in input order. The calling thread takes part; a panicking item yields `Err`
/// with the panic message and does not affect its siblings.
pub fn fan_out<T, R, F>(items: Vec<T>, workers: usize, thread_prefix: &str, work: F) -> Vec<Result<R, String>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = items.len();
    let (queue_tx, queue_rx) = bounded::<(usize, T)>(total.max(1));
    for entry in items.into_iter().enumerate() {
        if queue_tx.send(entry).is_err() {
            break;
        }
    }
    drop(queue_tx);

    let (done_tx, done_rx) = bounded::<(usize, Result<R, String>)>(total.max(1));
    let drain = |queue: Receiver<(usize, T)>, done: Sender<(usize, Result<R, String>)>| {
        for (idx, item) in queue.iter() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(item)))
                .map_err(|payload| panic_message(payload.as_ref()));
            if done.send((idx, outcome)).is_err() {
                break;
            }
        }
    };

    let helpers = workers.min(total).saturating_sub(1);
    thread::scope(|scope| {
        for i in 0..helpers {
            let (queue, done) = (queue_rx.clone(), done_tx.clone());
            let spawned = thread::Builder::new()
                .name(format!("{thread_prefix}-{i}"))
                .spawn_scoped(scope, || drain(queue, done));
            if let Err(err) = spawned {
                warn!(error = %err, "failed to spawn worker thread, continuing with fewer workers");
                break;
            }
        }
        debug!(items = total, helpers, "fan-out started");
        drain(queue_rx, done_tx);
    });

    let mut results: Vec<Option<Result<R, String>>> = (0..total).map(|_| None).collect();
    for (idx, outcome) in done_rx.try_iter() {
        results[idx] = Some(outcome);
    }
    results
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err("work item was never run".to_string())))
        .collect()
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn fan_out_keeps_input_order() {
        let out = fan_out((0..20).collect(), 4, "test-worker", |i: i32| i * 10);
        let values: Vec<i32> = out.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values, (0..20).map(|i| i * 10).collect::<Vec<_>>());
    }

    #[test]
    fn fan_out_never_exceeds_worker_count() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        fan_out((0..12).collect(), 3, "test-worker", |_: usize| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn panicking_item_is_reported_and_siblings_finish() {
        let out = fan_out(vec![1, 2, 3], 2, "test-worker", |i: i32| {
            if i == 2 {
                panic!("partition exploded");
            }
            i
        });
        assert_eq!(out[0], Ok(1));
        assert_eq!(out[1], Err("partition exploded".to_string()));
        assert_eq!(out[2], Ok(3));
    }

    #[test]
    fn permits_block_until_released() {
        let pool = PermitPool::new(2);
        let a = pool.acquire();
        let _b = pool.acquire();
        assert_eq!(pool.available(), 0);

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let _c = pool.acquire();
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        drop(a);
        waiter.join().unwrap();
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let pool = PermitPool::new(0);
        assert_eq!(pool.capacity(), 1);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn permits_are_shared_across_clones() {
        let pool = PermitPool::new(3);
        let other = pool.clone();
        let held: Vec<_> = (0..3).map(|_| other.acquire()).collect();
        assert_eq!(pool.available(), 0);
        drop(held);
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn fan_out_of_nothing_returns_nothing() {
        let out = fan_out(Vec::<u8>::new(), 4, "test-worker", |i| i);
        assert!(out.is_empty());
    }
}
