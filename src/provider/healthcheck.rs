//! Background latency probing across a member set.

use crate::outbound::OutboundProxy;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::debug;

/// Supplies the current members to probe; groups and providers implement
/// this so membership changes are picked up between rounds.
pub trait MemberSource: Send + Sync {
    fn members(&self) -> Vec<Arc<dyn OutboundProxy>>;
}

impl MemberSource for Vec<Arc<dyn OutboundProxy>> {
    fn members(&self) -> Vec<Arc<dyn OutboundProxy>> {
        self.clone()
    }
}

/// Periodic prober. Each round issues a HEAD through every member; latency
/// updates `last_delay` and transport errors flip members dead. With
/// `lazy` (touch-on-use), rounds are skipped while nothing dialed through
/// the group recently.
pub struct HealthCheck {
    url: String,
    interval: Duration,
    lazy: bool,
    source: Arc<dyn MemberSource>,
    last_touch: AtomicU64,
    running: AtomicBool,
    shutdown: broadcast::Sender<()>,
}

impl HealthCheck {
    pub fn new(
        url: String,
        interval: Duration,
        lazy: bool,
        source: Arc<dyn MemberSource>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        HealthCheck {
            url,
            interval,
            lazy,
            source,
            last_touch: AtomicU64::new(0),
            running: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_auto(&self) -> bool {
        !self.interval.is_zero()
    }

    /// Probe every member once, concurrently.
    pub async fn check(&self) {
        let members = self.source.members();
        let futures: Vec<_> = members
            .iter()
            .map(|member| {
                let url = self.url.clone();
                let member = member.clone();
                async move {
                    match member.url_test(&url).await {
                        Ok(delay) => debug!("health {}: {}ms", member.name(), delay),
                        Err(e) => debug!("health {}: dead ({})", member.name(), e),
                    }
                }
            })
            .collect();
        futures::future::join_all(futures).await;
    }

    /// Run the probe loop until `close`. Jitter spreads rounds so groups
    /// sharing an interval do not probe in lockstep.
    pub async fn start(self: Arc<Self>) {
        if !self.is_auto() || self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut shutdown_rx = self.shutdown.subscribe();

        let jitter = rand::thread_rng().gen_range(Duration::ZERO..self.interval.min(Duration::from_secs(30)));
        tokio::select! {
            _ = tokio::time::sleep(jitter) => {}
            _ = shutdown_rx.recv() => return,
        }

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.lazy && !self.touched_recently() {
                        continue;
                    }
                    self.check().await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    fn touched_recently(&self) -> bool {
        let last = self.last_touch.load(Ordering::Relaxed);
        if last == 0 {
            return false;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        now.saturating_sub(last) <= self.interval.as_secs() * 2
    }

    /// Record use; lazy checks only probe after this.
    pub fn touch(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.last_touch.store(now, Ordering::Relaxed);
    }

    pub fn close(&self) {
        let _ = self.shutdown.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_gate() {
        let source: Arc<dyn MemberSource> = Arc::new(Vec::<Arc<dyn OutboundProxy>>::new());
        let hc = HealthCheck::new(
            "http://example.com".to_string(),
            Duration::from_secs(300),
            true,
            source,
        );

        assert!(!hc.touched_recently());
        hc.touch();
        assert!(hc.touched_recently());
    }

    #[test]
    fn test_auto_flag() {
        let source: Arc<dyn MemberSource> = Arc::new(Vec::<Arc<dyn OutboundProxy>>::new());
        let auto = HealthCheck::new("u".into(), Duration::from_secs(60), true, source.clone());
        assert!(auto.is_auto());
        let manual = HealthCheck::new("u".into(), Duration::ZERO, true, source);
        assert!(!manual.is_auto());
    }
}
