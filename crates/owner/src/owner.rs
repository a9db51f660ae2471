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
use std::time::Instant;

use futures::future::join_all;
use metrics::histogram;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use cdc_metadata_store::{MetadataStore, MetadataStoreClient};
use cdc_orchestrator::{GlobalReactorState, ReactorState, ReactorWorker};
use cdc_types::model::{AdminJob, FeedState};
use cdc_types::{ChangeFeedId, Ts};

use crate::changefeed::{Changefeed, OwnerContext};
use crate::error::OwnerError;
use crate::metric_definitions::OWNER_TICK_DURATION;

/// Drives every changefeed found in the reactor state and keeps the service GC safepoint
/// below all of their checkpoints.
pub struct Owner {
    ctx: OwnerContext,
    changefeeds: BTreeMap<ChangeFeedId, Changefeed>,
    pending_admin_jobs: Vec<AdminJob>,
}

static_assertions::assert_impl_all!(Owner: Send, Sync);

impl Owner {
    pub fn new(ctx: OwnerContext) -> Self {
        Self {
            ctx,
            changefeeds: BTreeMap::new(),
            pending_admin_jobs: Vec::new(),
        }
    }

    /// Queues an admin job. It is handed to its changefeed on the next tick.
    pub fn enqueue_admin_job(&mut self, job: AdminJob) {
        debug!(changefeed = %job.changefeed_id, job_type = %job.job_type, "Enqueued admin job");
        self.pending_admin_jobs.push(job);
    }

    /// Whether a controller is currently running for `id`.
    pub fn is_managing(&self, id: &ChangeFeedId) -> bool {
        self.changefeeds.contains_key(id)
    }

    pub async fn tick(&mut self, state: &mut GlobalReactorState) -> Result<(), OwnerError> {
        let start = Instant::now();
        let GlobalReactorState {
            captures,
            changefeeds,
        } = &mut *state;

        for id in changefeeds.keys() {
            if !self.changefeeds.contains_key(id) {
                info!(changefeed = %id, "Found new changefeed");
                self.changefeeds
                    .insert(id.clone(), Changefeed::new(id.clone(), self.ctx.clone()));
            }
        }

        for job in std::mem::take(&mut self.pending_admin_jobs) {
            match self.changefeeds.get(&job.changefeed_id) {
                Some(changefeed) => changefeed.push_admin_job(job),
                None => {
                    warn!(changefeed = %job.changefeed_id, "Dropping admin job of unknown changefeed")
                }
            }
        }

        let mut force_gc = false;
        let mut gone = Vec::new();
        for (id, changefeed) in self.changefeeds.iter_mut() {
            match changefeeds.get_mut(id) {
                Some(changefeed_state) => {
                    changefeed.tick(changefeed_state, captures).await;
                    if changefeed.is_removed() {
                        gone.push(id.clone());
                        force_gc = true;
                    }
                }
                None => {
                    // keys deleted by someone else
                    changefeed.close().await;
                    gone.push(id.clone());
                }
            }
        }
        for id in gone {
            debug!(changefeed = %id, "Dropping changefeed controller");
            self.changefeeds.remove(&id);
            self.ctx.gc.release(&id);
        }

        if let Some(safe_point) = self.gc_safe_point(state) {
            let gc = Arc::clone(&self.ctx.gc);
            gc.try_update_gc_safe_point(safe_point, force_gc).await?;
        }
        histogram!(OWNER_TICK_DURATION).record(start.elapsed());
        Ok(())
    }

    /// Safepoint protecting the checkpoints of all managed changefeeds.
    fn gc_safe_point(&self, state: &GlobalReactorState) -> Option<Ts> {
        let min_checkpoint_ts = state
            .changefeeds
            .values()
            .filter(|changefeed| self.changefeeds.contains_key(&changefeed.id))
            .filter_map(|changefeed| {
                let info = changefeed.info.as_ref()?;
                // data of paused and failed changefeeds is kept so they can be resumed
                if matches!(info.state, FeedState::Removed | FeedState::Finished) {
                    return None;
                }
                Some(info.checkpoint_ts(changefeed.status.as_ref()))
            })
            .chain(self.ctx.gc.min_pinned())
            .min()?;
        // everything at the checkpoint is still needed
        Some(min_checkpoint_ts.saturating_sub(1))
    }

    /// Stops the background tasks of every changefeed.
    pub async fn close(&mut self) {
        join_all(self.changefeeds.values_mut().map(|changefeed| changefeed.close())).await;
        for id in std::mem::take(&mut self.changefeeds).into_keys() {
            self.ctx.gc.release(&id);
        }
    }

    /// Runs the owner against `store` until `cancel` fires. Every tick loads the reactor
    /// state, ticks all changefeeds and writes the queued patches back. Failing ticks are
    /// retried on the next interval.
    pub async fn run<S>(mut self, store: S, cancel: CancellationToken) -> Result<(), OwnerError>
    where
        S: MetadataStore + Send + Sync + 'static,
    {
        let client = MetadataStoreClient::new(
            store,
            Some(self.ctx.options.patch_retry_policy.clone()),
        );
        let worker = ReactorWorker::new(client);
        let mut interval = tokio::time::interval(self.ctx.options.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(capture = %self.ctx.capture.id, "Owner started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let mut state = match worker.load().await {
                Ok(state) => state,
                Err(err) => {
                    warn!("Failed loading reactor state: {err}");
                    continue;
                }
            };
            if let Err(err) = self.tick(&mut state).await {
                warn!("Owner tick failed: {}", err.message());
            }
            if let Err(err) = worker.apply_patches(state.take_patches()).await {
                warn!("Failed writing reactor state: {err}");
            }
        }

        self.close().await;
        info!(capture = %self.ctx.capture.id, "Owner stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use bytes::Bytes;
    use googletest::prelude::*;
    use test_log::test;

    use cdc_metadata_store::InMemoryMetadataStore;
    use cdc_orchestrator::{CdcKey, ChangefeedReactorState, ReactorStateTester};
    use cdc_types::config::OwnerOptions;
    use cdc_types::model::{AdminJobType, CaptureInfo, ChangeFeedInfo};
    use cdc_types::{oracle, CaptureId};

    use crate::gc::GcManager;
    use crate::test_util::{MockDdlPullerHandle, MockDdlSinkHandle, MockPdClient, SchemaTestHelper};

    fn capture() -> CaptureInfo {
        CaptureInfo {
            id: CaptureId::from("capture-id-test"),
            address: "127.0.0.1:8300".to_owned(),
            version: String::new(),
        }
    }

    fn owner(pd: Arc<MockPdClient>) -> Owner {
        let options = OwnerOptions::default();
        let gc = Arc::new(GcManager::new(pd, &options));
        Owner::new(OwnerContext {
            capture: capture(),
            options,
            gc,
            schema_storage: Arc::new(SchemaTestHelper::new()),
            ddl_puller_factory: MockDdlPullerHandle::default().factory(),
            ddl_sink_factory: MockDdlSinkHandle::default().factory(),
        })
    }

    fn json<T: serde::Serialize>(value: &T) -> Option<Bytes> {
        Some(Bytes::from(serde_json::to_vec(value).unwrap()))
    }

    fn tester(changefeeds: &[(&str, Ts)]) -> ReactorStateTester<GlobalReactorState> {
        let mut tester = ReactorStateTester::new(GlobalReactorState::default());
        let capture = capture();
        tester.must_update(CdcKey::Capture(capture.id.clone()), json(&capture));
        for (id, start_ts) in changefeeds {
            tester.must_update(
                CdcKey::ChangefeedInfo(ChangeFeedId::from(*id)),
                json(&ChangeFeedInfo::new("blackhole://", *start_ts)),
            );
        }
        tester
    }

    async fn tick(owner: &mut Owner, tester: &mut ReactorStateTester<GlobalReactorState>) {
        owner.tick(tester.state_mut()).await.unwrap();
        tester.must_apply_patches();
    }

    #[test(tokio::test)]
    async fn changefeeds_get_controllers_lazily() {
        let pd = Arc::new(MockPdClient::default());
        let mut owner = owner(pd.clone());
        let start_ts = oracle::current_ts();
        let mut tester = tester(&[("cf-1", start_ts)]);

        tick(&mut owner, &mut tester).await;
        assert_that!(owner.is_managing(&"cf-1".into()), eq(true));
        assert_that!(owner.is_managing(&"cf-2".into()), eq(false));

        tester.must_update(
            CdcKey::ChangefeedInfo("cf-2".into()),
            json(&ChangeFeedInfo::new("blackhole://", start_ts + 10)),
        );
        tick(&mut owner, &mut tester).await;
        assert_that!(owner.is_managing(&"cf-2".into()), eq(true));

        let status = tester.state().changefeeds[&ChangeFeedId::from("cf-2")].status;
        assert_that!(status.map(|status| status.checkpoint_ts), some(eq(start_ts + 10)));
        owner.close().await;
    }

    #[test(tokio::test)]
    async fn safepoint_follows_the_slowest_changefeed() {
        let pd = Arc::new(MockPdClient::default());
        let mut owner = owner(pd.clone());
        let start_ts = oracle::current_ts();
        let mut tester = tester(&[("cf-1", start_ts + 100), ("cf-2", start_ts)]);

        tick(&mut owner, &mut tester).await;
        let calls = pd.calls();
        assert_eq!(calls.last(), Some(&("ticdc".to_owned(), start_ts - 1)));
        owner.close().await;
    }

    #[test(tokio::test)]
    async fn removed_changefeeds_are_dropped() {
        let pd = Arc::new(MockPdClient::default());
        let mut owner = owner(pd.clone());
        let start_ts = oracle::current_ts();
        let mut tester = tester(&[("cf-1", start_ts), ("cf-2", start_ts + 100)]);
        tick(&mut owner, &mut tester).await;
        tick(&mut owner, &mut tester).await;

        owner.enqueue_admin_job(AdminJob::new("cf-1".into(), AdminJobType::Remove));
        // unknown changefeeds are ignored
        owner.enqueue_admin_job(AdminJob::new("cf-3".into(), AdminJobType::Remove));
        tick(&mut owner, &mut tester).await;

        assert_that!(owner.is_managing(&"cf-1".into()), eq(false));
        assert_that!(owner.is_managing(&"cf-2".into()), eq(true));
        assert_that!(
            tester.state().changefeeds.contains_key(&ChangeFeedId::from("cf-1")),
            eq(false)
        );
        // removal forces an update past the removed checkpoint
        assert_eq!(
            pd.calls().last(),
            Some(&("ticdc".to_owned(), start_ts + 99))
        );
        owner.close().await;
    }

    #[test(tokio::test)]
    async fn controllers_of_deleted_keys_are_closed() {
        let pd = Arc::new(MockPdClient::default());
        let mut owner = owner(pd);
        let mut tester = tester(&[("cf-1", oracle::current_ts())]);
        tick(&mut owner, &mut tester).await;
        tick(&mut owner, &mut tester).await;

        tester.must_update(CdcKey::ChangefeedInfo("cf-1".into()), None);
        tester.must_update(CdcKey::ChangefeedStatus("cf-1".into()), None);
        tester.must_update(
            CdcKey::TaskStatus {
                capture: capture().id,
                changefeed: "cf-1".into(),
            },
            None,
        );
        tick(&mut owner, &mut tester).await;
        assert_that!(owner.is_managing(&"cf-1".into()), eq(false));
    }

    #[test(tokio::test)]
    async fn run_drives_changefeeds_in_the_store() {
        let store = InMemoryMetadataStore::default();
        let worker = ReactorWorker::new(MetadataStoreClient::new(store.clone(), None));
        let start_ts = oracle::current_ts();
        let mut changefeed = ChangefeedReactorState::new("cf-1".into());
        changefeed.patch_info(move |_| Ok((Some(ChangeFeedInfo::new("blackhole://", start_ts)), true)));
        worker.apply_patches(changefeed.take_patches()).await.unwrap();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(owner(Arc::new(MockPdClient::default())).run(store, cancel.clone()));

        let mut checkpoint_ts = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let state = worker.load().await.unwrap();
            checkpoint_ts = state
                .changefeeds
                .get(&ChangeFeedId::from("cf-1"))
                .and_then(|changefeed| changefeed.status)
                .map(|status| status.checkpoint_ts);
            if checkpoint_ts.is_some() {
                break;
            }
        }
        assert_that!(checkpoint_ts, some(eq(start_ts)));

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }
}
