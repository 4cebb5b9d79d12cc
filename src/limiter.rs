use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

/// Runs batches of jobs with at most `limit` in flight. Jobs start in
/// submission order; results come back in submission order.
pub struct BoundedPool {
    name: &'static str,
    limit: usize,
    pool: Option<rayon::ThreadPool>,
}

impl BoundedPool {
    pub fn new(name: &'static str, limit: usize) -> Self {
        let limit = limit.max(1);
        let pool = match rayon::ThreadPoolBuilder::new()
            .num_threads(limit)
            .thread_name(move |i| format!("{name}-{i}"))
            .build()
        {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!(pool = name, error = %err, "thread pool unavailable, running jobs inline");
                None
            }
        };
        Self { name, limit, pool }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn map_ordered<I, T, F>(&self, items: Vec<I>, job: F) -> Vec<T>
    where
        I: Send,
        T: Send,
        F: Fn(I) -> T + Sync,
    {
        let Some(pool) = self.pool.as_ref() else {
            return items.into_iter().map(job).collect();
        };
        let n = items.len();
        let queue: Vec<Mutex<Option<I>>> = items.into_iter().map(|i| Mutex::new(Some(i))).collect();
        let results: Vec<Mutex<Option<T>>> = (0..n).map(|_| Mutex::new(None)).collect();
        let next = AtomicUsize::new(0);

        pool.install(|| {
            rayon::scope(|scope| {
                for _ in 0..self.limit.min(n) {
                    scope.spawn(|_| {
                        loop {
                            let idx = next.fetch_add(1, Ordering::SeqCst);
                            if idx >= n {
                                break;
                            }
                            let item = queue[idx]
                                .lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner())
                                .take();
                            if let Some(item) = item {
                                let out = job(item);
                                *results[idx]
                                    .lock()
                                    .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(out);
                            }
                        }
                    });
                }
            });
        });

        results
            .into_iter()
            .filter_map(|slot| slot.into_inner().unwrap_or_else(|poisoned| poisoned.into_inner()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn results_keep_submission_order() {
        let pool = BoundedPool::new("test", 3);
        let out = pool.map_ordered((0..20).collect(), |i: u64| {
            thread::sleep(Duration::from_millis((20 - i) % 4));
            i * 2
        });
        assert_eq!(out, (0..20).map(|i| i * 2).collect::<Vec<_>>());
    }

    #[test]
    fn never_exceeds_the_limit() {
        let pool = BoundedPool::new("test", 2);
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        pool.map_ordered((0..12).collect(), |_: usize| {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
        });
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn jobs_start_in_fifo_order() {
        let pool = BoundedPool::new("test", 1);
        let started = Mutex::new(Vec::new());
        pool.map_ordered((0..8).collect(), |i: usize| {
            started.lock().expect("lock").push(i);
        });
        assert_eq!(started.into_inner().expect("lock"), (0..8).collect::<Vec<_>>());
    }
}
