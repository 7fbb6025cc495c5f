//! 作业生命周期状态机
//!
//! 所有作业状态变化都经过 [`JobStateMachine::apply`]，数据库层只负责把计算出的
//! 转换以条件更新的方式原子地落盘。

use crate::models::{FailureKind, JobState, ResetTarget, ResourceClass};
use crate::{TunaError, TunaResult};

/// 驱动状态转换的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEvent {
    /// 调度器领取
    Claim(ResourceClass),
    /// 后端执行成功
    Succeed,
    /// 后端执行失败
    Fail(FailureKind),
    /// 陈旧领取回收
    Requeue,
    /// 运维批量重置
    Reset(ResetTarget),
}

impl JobEvent {
    pub fn name(&self) -> String {
        match self {
            JobEvent::Claim(class) => format!("claim({class})"),
            JobEvent::Succeed => "succeed".to_string(),
            JobEvent::Fail(kind) => format!("fail({})", kind.state()),
            JobEvent::Requeue => "requeue".to_string(),
            JobEvent::Reset(target) => format!("reset({})", target.state()),
        }
    }
}

/// 状态机关心的作业字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobSnapshot {
    pub state: JobState,
    pub step: Option<ResourceClass>,
    pub retries: i32,
}

impl JobSnapshot {
    pub fn new() -> Self {
        Self {
            state: JobState::New,
            step: None,
            retries: 0,
        }
    }
}

impl Default for JobSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

/// 作业状态机，失败重试上限可配置
#[derive(Debug, Clone, Copy)]
pub struct JobStateMachine {
    max_retries: i32,
}

impl JobStateMachine {
    pub fn new(max_retries: i32) -> Self {
        Self { max_retries }
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    /// 计算事件作用后的作业快照，非法事件返回 `InvalidTransition`
    pub fn apply(&self, job: JobSnapshot, event: JobEvent) -> TunaResult<JobSnapshot> {
        let invalid = || TunaError::InvalidTransition {
            from: job.state,
            event: event.name(),
        };

        let next = match (job.state, event) {
            (state, JobEvent::Claim(class)) => {
                let retrying = matches!(state, JobState::Errored | JobState::ErrorStatus)
                    && job.step == Some(class);
                if state != class.ready_state() && !retrying {
                    return Err(invalid());
                }
                JobSnapshot {
                    state: class.running_state(),
                    step: Some(class),
                    retries: job.retries,
                }
            }
            (JobState::Running, JobEvent::Succeed) => JobSnapshot {
                state: JobState::Compiled,
                ..job
            },
            (JobState::RunningEval, JobEvent::Succeed) => JobSnapshot {
                state: JobState::Evaluated,
                ..job
            },
            (JobState::Running | JobState::RunningEval, JobEvent::Fail(kind)) => {
                let retries = job.retries + 1;
                let state = if retries > self.max_retries {
                    JobState::Aborted
                } else {
                    kind.state()
                };
                JobSnapshot {
                    state,
                    step: job.step,
                    retries,
                }
            }
            (JobState::Running, JobEvent::Requeue) => JobSnapshot {
                state: JobState::New,
                ..job
            },
            (JobState::RunningEval, JobEvent::Requeue) => JobSnapshot {
                state: JobState::Compiled,
                ..job
            },
            (_, JobEvent::Reset(target)) => JobSnapshot {
                state: target.state(),
                step: None,
                retries: 0,
            },
            _ => return Err(invalid()),
        };

        Ok(next)
    }
}

/// 状态转换表
///
/// 运维重置可以把任意状态改回 `new` 或 `compiled`，其余边只能由事件产生。
pub fn is_valid_edge(from: JobState, to: JobState) -> bool {
    use JobState::*;

    if matches!(to, New | Compiled) {
        return true;
    }

    matches!(
        (from, to),
        (New, Running)
            | (Errored | ErrorStatus, Running)
            | (Compiled, RunningEval)
            | (Errored | ErrorStatus, RunningEval)
            | (Running, Errored | ErrorStatus | ErrorConfig | Aborted)
            | (RunningEval, Evaluated)
            | (RunningEval, Errored | ErrorStatus | ErrorConfig | Aborted)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn machine() -> JobStateMachine {
        JobStateMachine::new(3)
    }

    #[test]
    fn test_happy_path() {
        let sm = machine();
        let mut job = JobSnapshot::new();
        job = sm.apply(job, JobEvent::Claim(ResourceClass::Compile)).unwrap();
        assert_eq!(job.state, JobState::Running);
        job = sm.apply(job, JobEvent::Succeed).unwrap();
        assert_eq!(job.state, JobState::Compiled);
        job = sm.apply(job, JobEvent::Claim(ResourceClass::Evaluate)).unwrap();
        assert_eq!(job.state, JobState::RunningEval);
        assert_eq!(job.step, Some(ResourceClass::Evaluate));
        job = sm.apply(job, JobEvent::Succeed).unwrap();
        assert_eq!(job.state, JobState::Evaluated);
    }

    #[test]
    fn test_new_cannot_skip_to_evaluated() {
        let sm = machine();
        assert!(sm.apply(JobSnapshot::new(), JobEvent::Succeed).is_err());
        assert!(sm
            .apply(JobSnapshot::new(), JobEvent::Claim(ResourceClass::Evaluate))
            .is_err());
        assert!(!is_valid_edge(JobState::New, JobState::Evaluated));
    }

    #[test]
    fn test_failure_increments_retries_then_aborts() {
        let sm = machine();
        let mut job = JobSnapshot::new();
        for attempt in 1..=3 {
            job = sm.apply(job, JobEvent::Claim(ResourceClass::Compile)).unwrap();
            job = sm
                .apply(job, JobEvent::Fail(FailureKind::ErrorStatus))
                .unwrap();
            assert_eq!(job.retries, attempt);
            assert_eq!(job.state, JobState::ErrorStatus);
        }
        job = sm.apply(job, JobEvent::Claim(ResourceClass::Compile)).unwrap();
        job = sm.apply(job, JobEvent::Fail(FailureKind::Errored)).unwrap();
        assert_eq!(job.state, JobState::Aborted);
        assert!(sm
            .apply(job, JobEvent::Claim(ResourceClass::Compile))
            .is_err());
    }

    #[test]
    fn test_failed_eval_is_retried_by_eval_class_only() {
        let sm = machine();
        let job = JobSnapshot {
            state: JobState::Errored,
            step: Some(ResourceClass::Evaluate),
            retries: 1,
        };
        assert!(sm.apply(job, JobEvent::Claim(ResourceClass::Compile)).is_err());
        let job = sm.apply(job, JobEvent::Claim(ResourceClass::Evaluate)).unwrap();
        assert_eq!(job.state, JobState::RunningEval);
        assert_eq!(job.retries, 1);
    }

    #[test]
    fn test_error_config_is_not_retried() {
        let sm = machine();
        let job = JobSnapshot {
            state: JobState::ErrorConfig,
            step: Some(ResourceClass::Compile),
            retries: 1,
        };
        assert!(sm.apply(job, JobEvent::Claim(ResourceClass::Compile)).is_err());
    }

    #[test]
    fn test_requeue_returns_to_pre_claim_state() {
        let sm = machine();
        let running = JobSnapshot {
            state: JobState::Running,
            step: Some(ResourceClass::Compile),
            retries: 0,
        };
        assert_eq!(
            sm.apply(running, JobEvent::Requeue).unwrap().state,
            JobState::New
        );
        let running_eval = JobSnapshot {
            state: JobState::RunningEval,
            step: Some(ResourceClass::Evaluate),
            retries: 2,
        };
        let requeued = sm.apply(running_eval, JobEvent::Requeue).unwrap();
        assert_eq!(requeued.state, JobState::Compiled);
        assert_eq!(requeued.retries, 2);
        assert!(sm.apply(JobSnapshot::new(), JobEvent::Requeue).is_err());
    }

    #[test]
    fn test_reset_clears_retries() {
        let sm = machine();
        let aborted = JobSnapshot {
            state: JobState::Aborted,
            step: Some(ResourceClass::Evaluate),
            retries: 4,
        };
        let reset = sm
            .apply(aborted, JobEvent::Reset(ResetTarget::Compiled))
            .unwrap();
        assert_eq!(reset.state, JobState::Compiled);
        assert_eq!(reset.retries, 0);
        assert_eq!(reset.step, None);
    }

    #[test]
    fn test_duplicate_success_is_rejected() {
        let sm = machine();
        let evaluated = JobSnapshot {
            state: JobState::Evaluated,
            step: Some(ResourceClass::Evaluate),
            retries: 0,
        };
        assert!(sm.apply(evaluated, JobEvent::Succeed).is_err());
    }

    fn event_strategy() -> impl Strategy<Value = JobEvent> {
        prop_oneof![
            Just(JobEvent::Claim(ResourceClass::Compile)),
            Just(JobEvent::Claim(ResourceClass::Evaluate)),
            Just(JobEvent::Succeed),
            Just(JobEvent::Fail(FailureKind::Errored)),
            Just(JobEvent::Fail(FailureKind::ErrorStatus)),
            Just(JobEvent::Fail(FailureKind::ErrorConfig)),
            Just(JobEvent::Requeue),
            Just(JobEvent::Reset(ResetTarget::New)),
            Just(JobEvent::Reset(ResetTarget::Compiled)),
        ]
    }

    proptest! {
        #[test]
        fn observed_states_follow_transition_table(
            events in proptest::collection::vec(event_strategy(), 0..64),
            max_retries in 0i32..5,
        ) {
            let sm = JobStateMachine::new(max_retries);
            let mut job = JobSnapshot::new();
            let mut path = vec![job.state];

            for event in events {
                if let Ok(next) = sm.apply(job, event) {
                    prop_assert!(
                        is_valid_edge(job.state, next.state),
                        "illegal edge {} -> {} via {:?}", job.state, next.state, event
                    );
                    if next.state == JobState::Evaluated {
                        prop_assert_eq!(job.state, JobState::RunningEval);
                    }
                    if next.state == JobState::Aborted {
                        prop_assert!(next.retries > max_retries);
                    }
                    prop_assert!(next.retries <= max_retries + 1);
                    job = next;
                    path.push(job.state);
                }
            }

            for pair in path.windows(2) {
                prop_assert!(!(pair[0] == JobState::New && pair[1] == JobState::Evaluated));
            }
        }
    }
}
