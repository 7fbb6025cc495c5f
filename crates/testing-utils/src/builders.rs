//! Test data builders
//!
//! 带合理默认值的构造器，测试只需覆盖关心的字段。

use chrono::Utc;
use tuna_core::models::{
    Job, JobState, Machine, NewJob, NewMachine, NewSession, ResourceClass, Session,
};

/// Builder for test Session entities
pub struct SessionBuilder {
    session: Session,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            session: Session::new(
                1,
                NewSession {
                    arch: "gfx90a".to_string(),
                    num_cu: 110,
                    toolchain_version: "6.2.0".to_string(),
                    reason: "test".to_string(),
                },
            ),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.session.id = id;
        self
    }

    pub fn with_arch(mut self, arch: &str, num_cu: i32) -> Self {
        self.session.arch = arch.to_string();
        self.session.num_cu = num_cu;
        self
    }

    pub fn build(self) -> Session {
        self.session
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for test Machine entities
pub struct MachineBuilder {
    machine: Machine,
}

impl MachineBuilder {
    pub fn new() -> Self {
        Self {
            machine: Machine::new(
                1,
                NewMachine {
                    hostname: "node-01".to_string(),
                    address: "10.0.0.1".to_string(),
                    ssh_port: 22,
                    ssh_user: "tuna".to_string(),
                    arch: "gfx90a".to_string(),
                    num_cu: 110,
                    gpu_count: 2,
                    power_address: None,
                },
            ),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.machine.id = id;
        self
    }

    pub fn with_hostname(mut self, hostname: &str) -> Self {
        self.machine.hostname = hostname.to_string();
        self
    }

    pub fn with_gpu_count(mut self, gpu_count: i32) -> Self {
        self.machine.gpu_count = gpu_count;
        self
    }

    pub fn with_arch(mut self, arch: &str, num_cu: i32) -> Self {
        self.machine.arch = arch.to_string();
        self.machine.num_cu = num_cu;
        self
    }

    pub fn with_power_address(mut self, address: &str) -> Self {
        self.machine.power_address = Some(address.to_string());
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.machine.available = false;
        self
    }

    pub fn build(self) -> Machine {
        self.machine
    }
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for test Job entities
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new() -> Self {
        Self {
            job: Job::new(1, NewJob::new(1, "config-1", "test")),
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.job.id = id;
        self.job.config_ref = format!("config-{id}");
        self
    }

    pub fn with_session(mut self, session_id: i64) -> Self {
        self.job.session_id = session_id;
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.job.reason = reason.to_string();
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.job.state = state;
        self
    }

    pub fn with_step(mut self, step: ResourceClass) -> Self {
        self.job.step = Some(step);
        self
    }

    pub fn with_retries(mut self, retries: i32) -> Self {
        self.job.retries = retries;
        self
    }

    /// 已编译，等待评测
    pub fn compiled(self) -> Self {
        self.with_state(JobState::Compiled)
            .with_step(ResourceClass::Compile)
    }

    pub fn invalid(mut self) -> Self {
        self.job.valid = false;
        self
    }

    pub fn build(mut self) -> Job {
        self.job.updated_at = Utc::now();
        self.job
    }
}

impl Default for JobBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// 批量构造同一会话下的作业，ID从1开始
pub fn jobs_for_session(session_id: i64, count: i64) -> Vec<Job> {
    (1..=count)
        .map(|id| JobBuilder::new().with_id(id).with_session(session_id).build())
        .collect()
}
