use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    delivery::port::DeliveryPort,
    domain::{ChatId, MessageRef},
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* outbound calls (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between deliveries into the same chat. Batch members are
    /// spaced by this.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(1000),
        }
    }
}

impl ThrottleConfig {
    pub fn with_per_chat(per_chat_min_interval: Duration) -> Self {
        Self {
            per_chat_min_interval,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve(&mut self) -> Duration {
        let now = Instant::now();
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }
}

/// DeliveryPort decorator that spaces outbound calls.
///
/// Best-effort defense against destination-side throttling (Telegram 429s).
/// Spacing is policy, not correctness: nothing breaks if a call goes out early.
pub struct ThrottledDelivery {
    inner: Arc<dyn DeliveryPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<i64, Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledDelivery {
    pub fn new(inner: Arc<dyn DeliveryPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, chat_id: i64) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        map.entry(chat_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_chat(&self, chat_id: i64) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(chat_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }

    async fn throttle_global(&self) {
        let wait = { self.global.lock().await.reserve() };
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl DeliveryPort for ThrottledDelivery {
    async fn deliver(
        &self,
        location: MessageRef,
        destination: ChatId,
        caption: Option<&str>,
    ) -> Result<MessageRef> {
        self.throttle_chat(destination.0).await;
        self.inner.deliver(location, destination, caption).await
    }

    async fn send_notice(&self, destination: ChatId, text: &str) -> Result<MessageRef> {
        // Notices ride along with deliveries; only global flood control applies.
        self.throttle_global().await;
        self.inner.send_notice(destination, text).await
    }

    async fn remove(&self, delivered: MessageRef) -> Result<()> {
        // Removals are driven by timers, often many at once after a restart.
        self.throttle_global().await;
        self.inner.remove(delivered).await
    }
}
