//! Background Maintenance
//!
//! Per-tier purge loops plus the health monitor, all stopped by one
//! cancellation token.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use super::manager::Cache;
use super::policy::Tier;
use crate::monitoring::{HealthMonitor, PrometheusExporter};

/// Handles to running background tasks
#[derive(Debug)]
pub struct BackgroundTasks {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Token that stops every task when cancelled
    pub fn token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Number of running tasks
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Cancel all tasks and wait for them to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Background task failed: {}", e);
            }
        }
    }
}

impl<V> Cache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Spawn the purge loops and the health monitor
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_background(
        self: &Arc<Self>,
        exporter: Option<Arc<PrometheusExporter>>,
    ) -> BackgroundTasks {
        let shutdown = CancellationToken::new();
        let mut handles = Vec::with_capacity(Tier::ALL.len() + 1);

        for tier in Tier::ALL {
            handles.push(tokio::spawn(
                Arc::clone(self).purge_loop(tier, shutdown.clone()),
            ));
        }

        let mut monitor = HealthMonitor::new(Arc::clone(self));
        if let Some(exporter) = exporter {
            monitor = monitor.with_exporter(exporter);
        }
        handles.push(tokio::spawn(Arc::new(monitor).run(shutdown.clone())));

        info!(tasks = handles.len(), "Background maintenance started");
        BackgroundTasks { shutdown, handles }
    }

    #[instrument(skip_all, fields(tier = %tier))]
    async fn purge_loop(self: Arc<Self>, tier: Tier, shutdown: CancellationToken) {
        let period = self.config().tier(tier).check_interval();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Purge loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let purged = self.purge_expired(tier).await;
                    // Tag records can outlive their key after a set/invalidate race
                    let pruned = self.prune_tags().await;
                    if purged > 0 || pruned > 0 {
                        debug!(purged, pruned, "Purged expired entries");
                    }
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{ManualClock, SetOptions};
    use crate::config::CacheConfig;
    use serde_json::{json, Value};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_purge_loop_removes_expired() {
        let clock = Arc::new(ManualClock::starting_now());
        let mut config = CacheConfig::default();
        config.l1.check_interval_secs = 1;
        let cache: Arc<Cache<Value>> = Arc::new(
            Cache::with_clock(config, clock.clone()).await.unwrap(),
        );

        cache
            .set(
                "session:a",
                &json!("x"),
                SetOptions::new().tier(Tier::L1).ttl(10).tag("sessions"),
            )
            .await
            .unwrap();
        assert_eq!(cache.index().keys_for_tag("sessions").len(), 1);

        let tasks = cache.start_background(None);
        assert_eq!(tasks.len(), 4);

        clock.advance(Duration::from_secs(11));
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(cache.peek(Tier::L1, "session:a").await.is_none());
        assert_eq!(cache.metrics(Tier::L1).await.total_keys, 0);
        assert!(cache.index().keys_for_tag("sessions").is_empty());

        tasks.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_loop_prunes_orphan_tags() {
        let mut config = CacheConfig::default();
        config.l1.check_interval_secs = 1;
        let cache: Arc<Cache<Value>> = Arc::new(Cache::new(config).await.unwrap());

        cache
            .set("user:1", &json!(1), SetOptions::new().tier(Tier::L1).tag("users"))
            .await
            .unwrap();
        // Tag record left behind with no stored key and nothing to purge
        cache.index().record_tags("ghost:1", &["orphans".to_string()]);

        let tasks = cache.start_background(None);
        tokio::time::sleep(Duration::from_secs(2)).await;

        assert!(cache.index().keys_for_tag("orphans").is_empty());
        assert_eq!(cache.index().keys_for_tag("users"), vec!["user:1".to_string()]);

        tasks.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_tasks() {
        let cache: Arc<Cache<Value>> = Arc::new(Cache::new(CacheConfig::default()).await.unwrap());
        let exporter = Arc::new(PrometheusExporter::new().unwrap());
        let tasks = cache.start_background(Some(exporter));
        let token = tasks.token();
        assert!(!token.is_cancelled());

        tasks.shutdown().await;
        assert!(token.is_cancelled());
    }
}
