use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Sliding-window request counter keyed by client.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    window: Duration,
    max_keys: usize,
}

impl RateLimiter {
    pub fn new(window: Duration, max_keys: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            window,
            max_keys,
        }
    }

    /// Records one request for `key`. On rejection, returns how long until the
    /// oldest request in the window ages out.
    pub fn check(&self, key: &str, limit: usize) -> Result<(), Duration> {
        if limit == 0 {
            return Ok(());
        }
        let now = Instant::now();
        self.admit(key, limit, now)?;
        self.record(key, now);
        Ok(())
    }

    /// Like `check`, but records nothing.
    fn admit(&self, key: &str, limit: usize, now: Instant) -> Result<(), Duration> {
        if limit == 0 {
            return Ok(());
        }

        let mut inner = self.lock();
        let Some(queue) = inner.get_mut(key) else {
            return Ok(());
        };
        prune_queue(queue, now, self.window);
        if queue.len() >= limit {
            let retry_after = queue
                .front()
                .map(|oldest| self.window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(self.window);
            return Err(retry_after);
        }
        Ok(())
    }

    fn record(&self, key: &str, now: Instant) {
        let mut inner = self.lock();
        inner.entry(key.to_string()).or_default().push_back(now);

        inner.retain(|_, events| {
            prune_queue(events, now, self.window);
            !events.is_empty()
        });

        if inner.len() > self.max_keys {
            let mut overflow = inner.len() - self.max_keys;
            let keys = inner.keys().cloned().collect::<Vec<_>>();
            for key in keys {
                if overflow == 0 {
                    break;
                }
                if inner.remove(&key).is_some() {
                    overflow -= 1;
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<Instant>>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn reset(&self) {
        self.lock().clear();
    }
}

fn prune_queue(queue: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = queue.front() {
        if now.duration_since(*front) > window {
            queue.pop_front();
        } else {
            break;
        }
    }
}

/// Per-client minute and hour windows. A zero limit disables that window.
#[derive(Clone)]
pub struct ClientRateLimits {
    minute: RateLimiter,
    hour: RateLimiter,
    per_minute: usize,
    per_hour: usize,
}

impl ClientRateLimits {
    pub fn new(per_minute: usize, per_hour: usize) -> Self {
        Self {
            minute: RateLimiter::new(Duration::from_secs(60), 100_000),
            hour: RateLimiter::new(Duration::from_secs(3600), 100_000),
            per_minute,
            per_hour,
        }
    }

    /// Retry-After seconds (at least 1) when either window is exhausted.
    /// A request counts against both windows only when both admit it.
    pub fn check(&self, client_key: &str) -> Result<(), u64> {
        let now = Instant::now();
        self.minute
            .admit(client_key, self.per_minute, now)
            .and_then(|()| self.hour.admit(client_key, self.per_hour, now))
            .map_err(|wait| wait.as_secs().max(1))?;
        if self.per_minute > 0 {
            self.minute.record(client_key, now);
        }
        if self.per_hour > 0 {
            self.hour.record(client_key, now);
        }
        Ok(())
    }

    pub fn reset(&self) {
        self.minute.reset();
        self.hour.reset();
    }
}
