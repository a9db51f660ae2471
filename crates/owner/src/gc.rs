// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::gauge;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use cdc_types::config::OwnerOptions;
use cdc_types::oracle;
use cdc_types::{ChangeFeedId, Ts};

use crate::metric_definitions::GC_SAFE_POINT;

/// Placement driver of the upstream cluster, as far as GC is concerned.
#[async_trait]
pub trait PdClient: Send + Sync + 'static {
    /// Registers `safe_point` for `service_id`, expiring after `ttl`. Returns the minimum
    /// service safepoint over all services of the cluster.
    async fn update_service_gc_safe_point(
        &self,
        service_id: &str,
        ttl: Duration,
        safe_point: Ts,
    ) -> anyhow::Result<Ts>;
}

#[derive(Debug, thiserror::Error)]
pub enum GcError {
    #[error(
        "checkpoint {checkpoint_ts} lags behind the wall clock by more than the GC ttl of {}",
        humantime::format_duration(*gc_ttl)
    )]
    GcTtlExceeded { checkpoint_ts: Ts, gc_ttl: Duration },
    #[error("snapshot lost by GC: checkpoint {checkpoint_ts} is below the GC safepoint {safe_point}")]
    SnapshotLostByGc { checkpoint_ts: Ts, safe_point: Ts },
    #[error("start ts {start_ts} is below the GC safepoint {safe_point}")]
    StartTsBeforeGc { start_ts: Ts, safe_point: Ts },
    #[error("failed updating the service GC safepoint: {0}")]
    UpdateSafePoint(#[source] anyhow::Error),
}

impl GcError {
    pub fn code(&self) -> &'static str {
        match self {
            GcError::GcTtlExceeded { .. } => "CDC:ErrGCTTLExceeded",
            GcError::SnapshotLostByGc { .. } => "CDC:ErrSnapshotLostByGC",
            GcError::StartTsBeforeGc { .. } => "CDC:ErrStartTsBeforeGC",
            GcError::UpdateSafePoint(_) => "CDC:ErrUpdateServiceSafepointFailed",
        }
    }
}

#[derive(Debug)]
struct GcState {
    last_updated: Option<Instant>,
    last_succeeded: Instant,
    last_safe_point: Ts,
    /// Our safepoint is the cluster minimum, so we are the ones holding back GC.
    blocking_gc: bool,
    pins: BTreeMap<ChangeFeedId, Ts>,
}

/// Keeps the service GC safepoint of the upstream cluster at or below the minimum
/// checkpoint of all changefeeds.
pub struct GcManager {
    pd: Arc<dyn PdClient>,
    service_id: String,
    gc_ttl: Duration,
    update_interval: Duration,
    ensure_start_ts_ttl: Duration,
    state: Mutex<GcState>,
}

impl GcManager {
    pub fn new(pd: Arc<dyn PdClient>, options: &OwnerOptions) -> Self {
        Self {
            pd,
            service_id: options.gc_service_id.clone(),
            gc_ttl: options.gc_ttl(),
            update_interval: *options.gc_safepoint_update_interval,
            ensure_start_ts_ttl: *options.ensure_start_ts_ttl,
            state: Mutex::new(GcState {
                last_updated: None,
                last_succeeded: Instant::now(),
                last_safe_point: 0,
                blocking_gc: false,
                pins: BTreeMap::new(),
            }),
        }
    }

    /// Advances the service safepoint to `checkpoint_ts`. Calls within the update interval
    /// are skipped unless `force` is set. Failures are tolerated until the last successful
    /// update is older than the GC ttl.
    pub async fn try_update_gc_safe_point(
        &self,
        checkpoint_ts: Ts,
        force: bool,
    ) -> Result<(), GcError> {
        {
            let mut state = self.state.lock();
            let now = Instant::now();
            if !force
                && state
                    .last_updated
                    .is_some_and(|updated| now.duration_since(updated) < self.update_interval)
            {
                return Ok(());
            }
            state.last_updated = Some(now);
        }

        let result = self
            .pd
            .update_service_gc_safe_point(&self.service_id, self.gc_ttl, checkpoint_ts)
            .await;

        let mut state = self.state.lock();
        match result {
            Ok(actual) => {
                if actual > checkpoint_ts {
                    warn!(
                        checkpoint_ts,
                        safe_point = actual,
                        "Service GC safepoint is above the checkpoint"
                    );
                }
                state.blocking_gc = actual == checkpoint_ts;
                state.last_safe_point = actual;
                state.last_succeeded = Instant::now();
                gauge!(GC_SAFE_POINT).set(oracle::extract_physical(actual) as f64);
                debug!(checkpoint_ts, safe_point = actual, "Updated service GC safepoint");
                Ok(())
            }
            Err(err) => {
                warn!(checkpoint_ts, "Failed updating service GC safepoint: {err:#}");
                if state.last_succeeded.elapsed() >= self.gc_ttl {
                    return Err(GcError::UpdateSafePoint(err));
                }
                Ok(())
            }
        }
    }

    /// Fails if data at `checkpoint_ts` may already have been collected.
    pub fn check_stale_checkpoint_ts(
        &self,
        changefeed: &ChangeFeedId,
        checkpoint_ts: Ts,
    ) -> Result<(), GcError> {
        let upper_bound = checkpoint_ts.saturating_sub(1);
        let state = self.state.lock();
        if state.blocking_gc {
            let lag = oracle::physical_distance(upper_bound, oracle::current_ts());
            if lag > self.gc_ttl {
                warn!(%changefeed, checkpoint_ts, "Checkpoint exceeded the GC ttl");
                return Err(GcError::GcTtlExceeded {
                    checkpoint_ts,
                    gc_ttl: self.gc_ttl,
                });
            }
        } else if upper_bound < state.last_safe_point {
            warn!(
                %changefeed,
                checkpoint_ts,
                safe_point = state.last_safe_point,
                "Checkpoint fell behind the GC safepoint"
            );
            return Err(GcError::SnapshotLostByGc {
                checkpoint_ts,
                safe_point: state.last_safe_point,
            });
        }
        Ok(())
    }

    /// Protects `start_ts` with a temporary service safepoint while the changefeed starts.
    pub async fn ensure_start_ts_safety(
        &self,
        changefeed: &ChangeFeedId,
        start_ts: Ts,
    ) -> Result<(), GcError> {
        let service_id = format!("{}-creating-{changefeed}", self.service_id);
        let safe_point = self
            .pd
            .update_service_gc_safe_point(&service_id, self.ensure_start_ts_ttl, start_ts)
            .await
            .map_err(GcError::UpdateSafePoint)?;
        if start_ts < safe_point {
            return Err(GcError::StartTsBeforeGc {
                start_ts,
                safe_point,
            });
        }
        info!(%changefeed, start_ts, %service_id, "Protected changefeed start ts");
        Ok(())
    }

    /// Records the checkpoint of a running changefeed.
    pub fn pin(&self, changefeed: &ChangeFeedId, ts: Ts) {
        self.state.lock().pins.insert(changefeed.clone(), ts);
    }

    pub fn release(&self, changefeed: &ChangeFeedId) {
        if self.state.lock().pins.remove(changefeed).is_some() {
            debug!(%changefeed, "Released GC pin");
        }
    }

    pub fn min_pinned(&self) -> Option<Ts> {
        self.state.lock().pins.values().copied().min()
    }

    pub fn last_safe_point(&self) -> Ts {
        self.state.lock().last_safe_point
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use googletest::prelude::*;
    use test_log::test;

    use cdc_types::config::OwnerOptionsBuilder;

    use crate::test_util::MockPdClient;

    fn manager(pd: Arc<MockPdClient>) -> GcManager {
        let options = OwnerOptionsBuilder::default()
            .gc_ttl(Duration::from_secs(60 * 60).into())
            .gc_safepoint_update_interval(Duration::from_secs(60).into())
            .build()
            .unwrap();
        GcManager::new(pd, &options)
    }

    #[test(tokio::test(start_paused = true))]
    async fn updates_are_rate_limited() {
        let pd = Arc::new(MockPdClient::default());
        let gc = manager(Arc::clone(&pd));

        gc.try_update_gc_safe_point(10, false).await.unwrap();
        gc.try_update_gc_safe_point(20, false).await.unwrap();
        assert_that!(pd.calls(), len(eq(1)));
        assert_that!(gc.last_safe_point(), eq(10));

        gc.try_update_gc_safe_point(30, true).await.unwrap();
        assert_that!(gc.last_safe_point(), eq(30));

        tokio::time::advance(Duration::from_secs(61)).await;
        gc.try_update_gc_safe_point(40, false).await.unwrap();
        assert_eq!(
            pd.calls(),
            vec![
                ("ticdc".to_owned(), 10),
                ("ticdc".to_owned(), 30),
                ("ticdc".to_owned(), 40)
            ]
        );
    }

    #[test(tokio::test(start_paused = true))]
    async fn failures_are_tolerated_within_ttl() {
        let pd = Arc::new(MockPdClient::default());
        let gc = manager(Arc::clone(&pd));
        gc.try_update_gc_safe_point(10, true).await.unwrap();

        pd.fail_updates(true);
        gc.try_update_gc_safe_point(20, true).await.unwrap();
        assert_that!(gc.last_safe_point(), eq(10));

        tokio::time::advance(Duration::from_secs(60 * 60)).await;
        let err = gc.try_update_gc_safe_point(30, true).await.unwrap_err();
        assert_eq!(err.code(), "CDC:ErrUpdateServiceSafepointFailed");
    }

    #[test(tokio::test)]
    async fn stale_checkpoints_are_detected() {
        let pd = Arc::new(MockPdClient::default());
        let gc = manager(Arc::clone(&pd));
        let cf = ChangeFeedId::from("cf");

        // another service holds the cluster safepoint above our checkpoint
        pd.set_min_safe_point(Some(100));
        gc.try_update_gc_safe_point(50, true).await.unwrap();
        assert!(gc.check_stale_checkpoint_ts(&cf, 101).is_ok());
        assert!(matches!(
            gc.check_stale_checkpoint_ts(&cf, 60),
            Err(GcError::SnapshotLostByGc {
                checkpoint_ts: 60,
                safe_point: 100
            })
        ));

        // we hold back GC with a checkpoint older than the ttl
        pd.set_min_safe_point(None);
        let old =
            oracle::ts_from_time(std::time::SystemTime::now() - Duration::from_secs(2 * 60 * 60));
        gc.try_update_gc_safe_point(old, true).await.unwrap();
        let err = gc.check_stale_checkpoint_ts(&cf, old).unwrap_err();
        assert_eq!(err.code(), "CDC:ErrGCTTLExceeded");
        assert!(gc.check_stale_checkpoint_ts(&cf, oracle::current_ts()).is_ok());
    }

    #[test(tokio::test)]
    async fn start_ts_must_be_above_safepoint() {
        let pd = Arc::new(MockPdClient::default());
        let gc = manager(Arc::clone(&pd));
        let cf = ChangeFeedId::from("cf");

        gc.ensure_start_ts_safety(&cf, 50).await.unwrap();
        assert_eq!(pd.calls(), vec![("ticdc-creating-cf".to_owned(), 50)]);

        pd.set_min_safe_point(Some(100));
        assert!(matches!(
            gc.ensure_start_ts_safety(&cf, 50).await,
            Err(GcError::StartTsBeforeGc {
                start_ts: 50,
                safe_point: 100
            })
        ));
    }

    #[test]
    fn pins_track_the_minimum() {
        let gc = manager(Arc::new(MockPdClient::default()));
        assert_that!(gc.min_pinned(), none());
        gc.pin(&"a".into(), 20);
        gc.pin(&"b".into(), 10);
        assert_that!(gc.min_pinned(), some(eq(10)));
        gc.release(&"b".into());
        assert_that!(gc.min_pinned(), some(eq(20)));
    }
}
