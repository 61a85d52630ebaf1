use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::time::{Instant, sleep};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitOptions {
    pub requests_per_second: u32,
    pub image_concurrency: usize,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            requests_per_second: 2,
            image_concurrency: 10,
        }
    }
}

/// Per-source throttle: metadata calls run one at a time with a minimum
/// inter-call delay, image fetches share a bounded concurrent pool.
pub struct SourceRateLimiter {
    min_delay: Duration,
    serial_lane: Mutex<Option<Instant>>,
    image_permits: Semaphore,
}

impl SourceRateLimiter {
    pub fn new(options: RateLimitOptions) -> Self {
        let rps = options.requests_per_second.max(1);

        Self {
            min_delay: Duration::from_millis(1000 / u64::from(rps)),
            serial_lane: Mutex::new(None),
            image_permits: Semaphore::new(options.image_concurrency.max(1)),
        }
    }

    /// Runs `operation` once scheduling permits. The tokio mutex is fair, so
    /// serialized callers drain in FIFO order.
    pub async fn throttle<F, T>(&self, operation: F, is_image: bool) -> T
    where
        F: Future<Output = T>,
    {
        if is_image {
            if self.image_permits.available_permits() == 0 {
                // overflow image fetches wait for the serialized lane to go idle
                drop(self.serial_lane.lock().await);
            }

            let _permit = self.image_permits.acquire().await;
            return operation.await;
        }

        let mut last_call = self.serial_lane.lock().await;
        if let Some(previous) = *last_call {
            let elapsed = previous.elapsed();
            if elapsed < self.min_delay {
                let wait = self.min_delay - elapsed;
                debug!("rate limiting: waiting {wait:?}");
                sleep(wait).await;
            }
        }

        let output = operation.await;
        *last_call = Some(Instant::now());

        output
    }
}

/// One limiter per source so a slow site never throttles the others.
pub struct RateLimiterRegistry {
    options: RateLimitOptions,
    limiters: Mutex<HashMap<String, Arc<SourceRateLimiter>>>,
}

impl RateLimiterRegistry {
    pub fn new(options: RateLimitOptions) -> Self {
        Self {
            options,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, extension_id: &str) -> Arc<SourceRateLimiter> {
        let mut limiters = self.limiters.lock().await;
        limiters
            .entry(extension_id.to_string())
            .or_insert_with(|| Arc::new(SourceRateLimiter::new(self.options)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn serialized_calls_are_spaced() {
        let limiter = SourceRateLimiter::new(RateLimitOptions {
            requests_per_second: 20,
            image_concurrency: 2,
        });

        let start = Instant::now();
        for _ in 0..3 {
            limiter.throttle(async {}, false).await;
        }

        // 3 calls at 20 rps means at least 2 * 50ms of spacing
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn image_pool_is_bounded() {
        let limiter = Arc::new(SourceRateLimiter::new(RateLimitOptions {
            requests_per_second: 10,
            image_concurrency: 2,
        }));

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..6 {
            let limiter = limiter.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .throttle(
                        async {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            sleep(Duration::from_millis(20)).await;
                            running.fetch_sub(1, Ordering::SeqCst);
                        },
                        true,
                    )
                    .await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn image_calls_do_not_wait_for_api_spacing() {
        let limiter = SourceRateLimiter::new(RateLimitOptions {
            requests_per_second: 1,
            image_concurrency: 4,
        });

        limiter.throttle(async {}, false).await;

        let start = Instant::now();
        limiter.throttle(async {}, true).await;
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
