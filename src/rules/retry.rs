use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, RuntimeFlavor};

use super::{Rule, RuleKind};
use crate::server::Server;

/// Pause between attempts while waiting out an empty selection.
const RETRY_BACKOFF: Duration = Duration::from_millis(5);

/// Re-asks the wrapped rule until it yields a server or the time budget runs out.
///
/// `choose` blocks the calling thread for up to the budget. On a multi-threaded
/// tokio runtime the worker hands its other tasks off while it waits; on a
/// current-thread runtime nothing else can run until the budget is spent, so
/// async callers should go through `choose_async`.
pub struct RetryRule {
    inner: Arc<dyn Rule>,
    budget: Duration,
}

impl RetryRule {
    pub fn new(inner: Arc<dyn Rule>, budget: Duration) -> Self {
        Self { inner, budget }
    }

    fn retry(&self, mut attempt: impl FnMut() -> Option<Server>) -> Option<Server> {
        let deadline = Instant::now() + self.budget;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if let Some(server) = attempt() {
                return Some(server);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!("No server after {} attempts within {:?}", attempts, self.budget);
                return None;
            }
            pause(RETRY_BACKOFF.min(deadline - now));
        }
    }
}

fn pause(wait: Duration) {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(wait))
        }
        _ => std::thread::sleep(wait),
    }
}

#[async_trait]
impl Rule for RetryRule {
    fn kind(&self) -> RuleKind {
        RuleKind::Retry
    }

    fn choose(&self, key: Option<&str>) -> Option<Server> {
        self.retry(|| self.inner.choose(key))
    }

    async fn choose_async(&self, key: Option<&str>) -> Option<Server> {
        let deadline = tokio::time::Instant::now() + self.budget;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if let Some(server) = self.inner.choose_async(key).await {
                return Some(server);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                debug!("No server after {} attempts within {:?}", attempts, self.budget);
                return None;
            }
            tokio::time::sleep(RETRY_BACKOFF.min(deadline - now)).await;
        }
    }

    fn choose_from(&self, candidates: &[Server], key: Option<&str>) -> Option<Server> {
        self.retry(|| self.inner.choose_from(candidates, key))
    }

    fn start(&self) {
        self.inner.start();
    }

    fn stop(&self) {
        self.inner.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServerRegistry;
    use crate::rules::testing::hosts;
    use crate::rules::RoundRobinRule;

    #[test]
    fn test_gives_up_after_budget() {
        let registry = Arc::new(ServerRegistry::default());
        let rule = RetryRule::new(Arc::new(RoundRobinRule::new(registry)), Duration::from_millis(30));
        let started = Instant::now();
        assert!(rule.choose(None).is_none());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(30));
        assert!(elapsed < Duration::from_secs(2));
    }

    #[test]
    fn test_rides_out_transient_emptiness() {
        let registry = Arc::new(ServerRegistry::default());
        let rule = RetryRule::new(
            Arc::new(RoundRobinRule::new(registry.clone())),
            Duration::from_secs(2),
        );
        let writer = {
            let registry = registry.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                registry.replace_all(hosts(&["a"]));
                registry.replace_reachable(hosts(&["a"]));
            })
        };
        let server = rule.choose(None);
        writer.join().unwrap();
        assert_eq!(server.unwrap().host(), "a");
    }

    fn fill_later(registry: Arc<ServerRegistry>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.replace_all(hosts(&["a"]));
            registry.replace_reachable(hosts(&["a"]));
        })
    }

    #[tokio::test]
    async fn test_async_choose_lets_runtime_tasks_fill_the_registry() {
        let registry = Arc::new(ServerRegistry::default());
        let rule = RetryRule::new(
            Arc::new(RoundRobinRule::new(registry.clone())),
            Duration::from_millis(500),
        );
        let filler = fill_later(registry);
        let started = Instant::now();
        let server = rule.choose_async(None).await;
        assert_eq!(server.unwrap().host(), "a");
        assert!(started.elapsed() < Duration::from_millis(400));
        filler.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_choose_does_not_starve_worker_tasks() {
        let registry = Arc::new(ServerRegistry::default());
        let rule = RetryRule::new(
            Arc::new(RoundRobinRule::new(registry.clone())),
            Duration::from_millis(500),
        );
        let filler = fill_later(registry);
        let server = rule.choose(None);
        assert_eq!(server.unwrap().host(), "a");
        filler.await.unwrap();
    }
}
