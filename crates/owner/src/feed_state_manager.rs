// Copyright (c) 2023 - 2025 Restate Software, Inc., Restate GmbH.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::{BTreeMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{info, warn};

use cdc_orchestrator::ChangefeedReactorState;
use cdc_types::model::{AdminJob, AdminJobType, FeedState, RunningError};

/// Decides the lifecycle state of a changefeed from admin jobs and reported errors.
#[derive(Debug, Default)]
pub struct FeedStateManager {
    should_running: bool,
    should_removed: bool,
    admin_jobs: Mutex<VecDeque<AdminJob>>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn admin_job_type_of(state: FeedState) -> AdminJobType {
    match state {
        FeedState::Normal => AdminJobType::None,
        FeedState::Finished => AdminJobType::Finish,
        FeedState::Stopped | FeedState::Failed => AdminJobType::Stop,
        FeedState::Removed => AdminJobType::Remove,
    }
}

impl FeedStateManager {
    pub fn tick(&mut self, state: &mut ChangefeedReactorState) {
        let Some(feed_state) = state.info.as_ref().map(|info| info.state) else {
            self.should_running = false;
            return;
        };
        self.should_running = true;
        self.should_removed = feed_state == FeedState::Removed;

        if !self.handle_admin_job(state, feed_state) {
            if feed_state.is_terminated() {
                self.should_running = false;
            } else {
                let errors = Self::errors_reported_by_processors(state);
                self.handle_error(state, &errors);
            }
        }

        if self.should_running {
            Self::patch_state(state, FeedState::Normal);
        } else {
            for capture in state.captures_with_tasks() {
                state.clean_capture(&capture);
            }
        }
    }

    pub fn should_running(&self) -> bool {
        self.should_running
    }

    pub fn should_removed(&self) -> bool {
        self.should_removed
    }

    pub fn push_admin_job(&self, job: AdminJob) {
        self.admin_jobs.lock().push_back(job);
    }

    /// Queues a finish job for the changefeed, handled on its next tick.
    pub fn mark_finished(&self, state: &ChangefeedReactorState) {
        self.push_admin_job(AdminJob::new(state.id.clone(), AdminJobType::Finish));
    }

    /// Returns true if an admin job was applied on this tick.
    fn handle_admin_job(&mut self, state: &mut ChangefeedReactorState, feed_state: FeedState) -> bool {
        let Some(job) = self.admin_jobs.lock().pop_front() else {
            return false;
        };
        if job.changefeed_id != state.id {
            return false;
        }

        match job.job_type {
            AdminJobType::Stop => {
                if feed_state != FeedState::Normal {
                    warn!(changefeed = %state.id, %feed_state, "Cannot pause changefeed in its current state");
                    return false;
                }
                self.should_running = false;
                Self::patch_state(state, FeedState::Stopped);
                info!(changefeed = %state.id, "Changefeed paused");
            }
            AdminJobType::Resume => {
                if !matches!(
                    feed_state,
                    FeedState::Failed | FeedState::Stopped | FeedState::Finished
                ) {
                    warn!(changefeed = %state.id, %feed_state, "Cannot resume changefeed in its current state");
                    return false;
                }
                self.should_running = true;
                Self::patch_state(state, FeedState::Normal);
                state.patch_info(|info| {
                    let Some(mut info) = info else {
                        return Ok((None, false));
                    };
                    if info.error.is_none() && info.error_history.is_empty() {
                        return Ok((Some(info), false));
                    }
                    info.error = None;
                    info.error_history.clear();
                    Ok((Some(info), true))
                });
                info!(changefeed = %state.id, "Changefeed resumed");
            }
            AdminJobType::Remove => {
                self.should_running = false;
                self.should_removed = true;
                Self::patch_state(state, FeedState::Removed);
                info!(changefeed = %state.id, "Changefeed removal requested");
            }
            AdminJobType::Finish => {
                if feed_state != FeedState::Normal {
                    warn!(changefeed = %state.id, %feed_state, "Cannot finish changefeed in its current state");
                    return false;
                }
                self.should_running = false;
                Self::patch_state(state, FeedState::Finished);
                info!(changefeed = %state.id, "Changefeed finished");
            }
            AdminJobType::None => return false,
        }
        true
    }

    fn patch_state(state: &mut ChangefeedReactorState, feed_state: FeedState) {
        let admin_job_type = admin_job_type_of(feed_state);
        state.patch_status(move |status| match status {
            Some(mut status) if status.admin_job_type != admin_job_type => {
                status.admin_job_type = admin_job_type;
                Ok((Some(status), true))
            }
            status => Ok((status, false)),
        });
        state.patch_info(move |info| {
            let Some(mut info) = info else {
                return Ok((None, false));
            };
            let changed = info.state != feed_state || info.admin_job_type != admin_job_type;
            info.state = feed_state;
            info.admin_job_type = admin_job_type;
            Ok((Some(info), changed))
        });
    }

    /// Moves errors reported by processors out of their task positions, one per error code.
    fn errors_reported_by_processors(state: &mut ChangefeedReactorState) -> Vec<RunningError> {
        let mut errors = BTreeMap::new();
        let failed: Vec<_> = state
            .task_positions
            .iter()
            .filter_map(|(capture, position)| {
                position.error.clone().map(|error| (capture.clone(), error))
            })
            .collect();
        for (capture, error) in failed {
            errors.insert(error.code.clone(), error);
            state.patch_task_position(capture, |position| match position {
                Some(mut position) => {
                    position.error = None;
                    Ok((Some(position), true))
                }
                None => Ok((None, false)),
            });
        }
        errors.into_values().collect()
    }

    /// Records the errors and fails the changefeed. A removed changefeed stays removed and
    /// a stopped or failed one keeps its state.
    pub fn handle_error(&mut self, state: &mut ChangefeedReactorState, errors: &[RunningError]) {
        let Some(last) = errors.last().cloned() else {
            return;
        };
        let feed_state = state.info.as_ref().map(|info| info.state);
        if feed_state == Some(FeedState::Removed) {
            warn!(changefeed = %state.id, "Ignoring error of a removed changefeed: {}", last.message);
            self.should_running = false;
            return;
        }
        for error in errors {
            warn!(
                changefeed = %state.id,
                error.addr = %error.addr,
                error.code = %error.code,
                "Changefeed failed: {}",
                error.message
            );
        }

        let reported_at = now_ms();
        state.patch_info(move |info| {
            let Some(mut info) = info else {
                return Ok((None, false));
            };
            info.error = Some(last.clone());
            info.error_history.push(reported_at);
            info.clean_up_outdated_error_history(reported_at);
            Ok((Some(info), true))
        });
        self.should_running = false;
        if !matches!(feed_state, Some(FeedState::Stopped | FeedState::Failed)) {
            Self::patch_state(state, FeedState::Failed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use googletest::prelude::*;

    use cdc_orchestrator::ReactorStateTester;
    use cdc_types::model::{ChangeFeedInfo, ChangeFeedStatus, TaskPosition, TaskStatus};
    use cdc_types::CaptureId;

    fn tester() -> ReactorStateTester<ChangefeedReactorState> {
        let mut tester = ReactorStateTester::new(ChangefeedReactorState::new("cf".into()));
        let state = tester.state_mut();
        state.patch_info(|_| Ok((Some(ChangeFeedInfo::new("blackhole://", 10)), true)));
        state.patch_status(|_| {
            Ok((
                Some(ChangeFeedStatus {
                    checkpoint_ts: 10,
                    resolved_ts: 10,
                    ..Default::default()
                }),
                true,
            ))
        });
        state.patch_task_status("c1".into(), |_| Ok((Some(TaskStatus::default()), true)));
        tester.must_apply_patches();
        tester
    }

    fn tick(manager: &mut FeedStateManager, tester: &mut ReactorStateTester<ChangefeedReactorState>) {
        manager.tick(tester.state_mut());
        tester.must_apply_patches();
    }

    fn feed_state(tester: &ReactorStateTester<ChangefeedReactorState>) -> Option<FeedState> {
        tester.state().info.as_ref().map(|info| info.state)
    }

    fn admin_job(job_type: AdminJobType) -> AdminJob {
        AdminJob::new("cf".into(), job_type)
    }

    #[test]
    fn pause_and_resume() {
        let mut tester = tester();
        let mut manager = FeedStateManager::default();
        tick(&mut manager, &mut tester);
        assert_that!(manager.should_running(), eq(true));

        manager.push_admin_job(admin_job(AdminJobType::Stop));
        tick(&mut manager, &mut tester);
        assert_that!(manager.should_running(), eq(false));
        assert_that!(feed_state(&tester), some(eq(FeedState::Stopped)));
        assert_that!(
            tester.state().status.map(|status| status.admin_job_type),
            some(eq(AdminJobType::Stop))
        );
        // task entries of a stopped changefeed are removed
        assert_that!(tester.state().task_statuses, len(eq(0)));

        tick(&mut manager, &mut tester);
        assert_that!(manager.should_running(), eq(false));

        manager.push_admin_job(admin_job(AdminJobType::Resume));
        tick(&mut manager, &mut tester);
        assert_that!(manager.should_running(), eq(true));
        assert_that!(feed_state(&tester), some(eq(FeedState::Normal)));
        assert_that!(
            tester.state().status.map(|status| status.admin_job_type),
            some(eq(AdminJobType::None))
        );
    }

    #[test]
    fn jobs_of_other_changefeeds_and_invalid_transitions_are_ignored() {
        let mut tester = tester();
        let mut manager = FeedStateManager::default();

        manager.push_admin_job(AdminJob::new("other".into(), AdminJobType::Stop));
        tick(&mut manager, &mut tester);
        assert_that!(feed_state(&tester), some(eq(FeedState::Normal)));

        manager.push_admin_job(admin_job(AdminJobType::Resume));
        tick(&mut manager, &mut tester);
        assert_that!(manager.should_running(), eq(true));
        assert_that!(feed_state(&tester), some(eq(FeedState::Normal)));
    }

    #[test]
    fn remove_from_any_state() {
        let mut tester = tester();
        let mut manager = FeedStateManager::default();
        manager.push_admin_job(admin_job(AdminJobType::Stop));
        tick(&mut manager, &mut tester);

        manager.push_admin_job(admin_job(AdminJobType::Remove));
        tick(&mut manager, &mut tester);
        assert_that!(manager.should_running(), eq(false));
        assert_that!(manager.should_removed(), eq(true));
        assert_that!(feed_state(&tester), some(eq(FeedState::Removed)));

        // stays removed until the keys are gone
        tick(&mut manager, &mut tester);
        assert_that!(manager.should_removed(), eq(true));
        manager.push_admin_job(admin_job(AdminJobType::Resume));
        tick(&mut manager, &mut tester);
        assert_that!(feed_state(&tester), some(eq(FeedState::Removed)));
    }

    #[test]
    fn finish() {
        let mut tester = tester();
        let mut manager = FeedStateManager::default();
        manager.mark_finished(tester.state());
        tick(&mut manager, &mut tester);
        assert_that!(manager.should_running(), eq(false));
        assert_that!(feed_state(&tester), some(eq(FeedState::Finished)));
        assert_that!(
            tester.state().info.as_ref().map(|info| info.admin_job_type),
            some(eq(AdminJobType::Finish))
        );
    }

    #[test]
    fn processor_errors_fail_the_changefeed() {
        let mut tester = tester();
        let mut manager = FeedStateManager::default();
        let capture = CaptureId::from("c1");
        tester.state_mut().patch_task_position(capture.clone(), |_| {
            Ok((
                Some(TaskPosition {
                    error: Some(RunningError {
                        addr: "127.0.0.1:8300".to_owned(),
                        code: "CDC:ErrSinkUnavailable".to_owned(),
                        message: "downstream unreachable".to_owned(),
                    }),
                    ..Default::default()
                }),
                true,
            ))
        });
        tester.must_apply_patches();

        tick(&mut manager, &mut tester);
        assert_that!(manager.should_running(), eq(false));
        assert_that!(feed_state(&tester), some(eq(FeedState::Failed)));
        let info = tester.state().info.clone().unwrap();
        assert_eq!(info.error.map(|err| err.message), Some("downstream unreachable".to_owned()));
        assert_that!(info.error_history, len(eq(1)));
        // the failed changefeed drops its task entries, the reported error with them
        assert_that!(tester.state().task_positions, len(eq(0)));

        manager.push_admin_job(admin_job(AdminJobType::Resume));
        tick(&mut manager, &mut tester);
        let info = tester.state().info.clone().unwrap();
        assert_that!(info.state, eq(FeedState::Normal));
        assert_that!(info.error.is_none(), eq(true));
        assert_that!(info.error_history, len(eq(0)));
    }

    #[test]
    fn errors_do_not_override_removal() {
        let mut tester = tester();
        let mut manager = FeedStateManager::default();
        manager.push_admin_job(admin_job(AdminJobType::Remove));
        tick(&mut manager, &mut tester);

        let error = RunningError {
            addr: "127.0.0.1:8300".to_owned(),
            code: "CDC:ErrOwnerUnknown".to_owned(),
            message: "fake error".to_owned(),
        };
        manager.handle_error(tester.state_mut(), &[error]);
        tester.must_apply_patches();
        assert_that!(feed_state(&tester), some(eq(FeedState::Removed)));
        assert_that!(
            tester.state().info.as_ref().map(|info| info.error.is_none()),
            some(eq(true))
        );
    }

    #[test]
    fn errors_of_a_stopped_changefeed_are_recorded() {
        let mut tester = tester();
        let mut manager = FeedStateManager::default();
        manager.push_admin_job(admin_job(AdminJobType::Stop));
        tick(&mut manager, &mut tester);
        assert_that!(feed_state(&tester), some(eq(FeedState::Stopped)));

        let error = RunningError {
            addr: "127.0.0.1:8300".to_owned(),
            code: "CDC:ErrSnapshotLostByGC".to_owned(),
            message: "checkpoint is behind the gc safepoint".to_owned(),
        };
        manager.handle_error(tester.state_mut(), &[error]);
        tester.must_apply_patches();

        assert_that!(manager.should_running(), eq(false));
        assert_that!(feed_state(&tester), some(eq(FeedState::Stopped)));
        let info = tester.state().info.clone().unwrap();
        assert_eq!(
            info.error.map(|err| err.code),
            Some("CDC:ErrSnapshotLostByGC".to_owned())
        );
        assert_that!(info.error_history, len(eq(1)));
        assert_that!(info.admin_job_type, eq(AdminJobType::Stop));
    }
}
