//! Mock implementations for repository and backend traits
//!
//! 内存实现，行为与SQLite实现保持一致：领取、结果回报和回收都是
//! 在同一把锁内完成的条件状态转换。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tuna_core::models::{
    ClaimBatch, ClaimRequest, GoldenRecord, GoldenSnapshot, GoldenVersion, Job, JobOutcome,
    JobResult, JobState, Machine, MergedRecord, NewJob, NewMachine, NewSession,
    PerformanceRecord, ReportStatus, ResetFilter, ResetTarget, ResourceClass, ResourceKey,
    Session,
};
use tuna_core::state_machine::{JobEvent, JobSnapshot, JobStateMachine};
use tuna_core::traits::{
    BackendOutput, ExecutionContext, GoldenRepository, JobRepository, MachineRepository,
    MergedRecordRepository, RecordStaging, SessionRepository, TuningBackend,
};
use tuna_core::{TunaError, TunaResult};

/// Mock implementation of SessionRepository
#[derive(Debug, Clone, Default)]
pub struct MockSessionRepository {
    sessions: Arc<Mutex<BTreeMap<i64, Session>>>,
}

impl MockSessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sessions(sessions: Vec<Session>) -> Self {
        let repo = Self::new();
        {
            let mut map = repo.sessions.lock().unwrap();
            for session in sessions {
                map.insert(session.id, session);
            }
        }
        repo
    }
}

#[async_trait]
impl SessionRepository for MockSessionRepository {
    async fn create(&self, session: &NewSession) -> TunaResult<Session> {
        let mut sessions = self.sessions.lock().unwrap();
        let id = sessions.keys().next_back().copied().unwrap_or(0) + 1;
        let created = Session::new(id, session.clone());
        sessions.insert(id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> TunaResult<Option<Session>> {
        Ok(self.sessions.lock().unwrap().get(&id).cloned())
    }

    async fn list(&self) -> TunaResult<Vec<Session>> {
        Ok(self.sessions.lock().unwrap().values().cloned().collect())
    }
}

/// Mock implementation of MachineRepository
#[derive(Debug, Clone, Default)]
pub struct MockMachineRepository {
    machines: Arc<Mutex<BTreeMap<i64, Machine>>>,
}

impl MockMachineRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_machines(machines: Vec<Machine>) -> Self {
        let repo = Self::new();
        {
            let mut map = repo.machines.lock().unwrap();
            for machine in machines {
                map.insert(machine.id, machine);
            }
        }
        repo
    }

    pub fn get(&self, id: i64) -> Option<Machine> {
        self.machines.lock().unwrap().get(&id).cloned()
    }

    fn update<F: FnOnce(&mut Machine)>(&self, id: i64, f: F) -> TunaResult<()> {
        let mut machines = self.machines.lock().unwrap();
        let machine = machines
            .get_mut(&id)
            .ok_or(TunaError::MachineNotFound { id })?;
        f(machine);
        machine.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl MachineRepository for MockMachineRepository {
    async fn create(&self, machine: &NewMachine) -> TunaResult<Machine> {
        let mut machines = self.machines.lock().unwrap();
        if machines.values().any(|m| m.hostname == machine.hostname) {
            return Err(TunaError::DatabaseOperation(format!(
                "主机名已存在: {}",
                machine.hostname
            )));
        }
        let id = machines.keys().next_back().copied().unwrap_or(0) + 1;
        let created = Machine::new(id, machine.clone());
        machines.insert(id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> TunaResult<Option<Machine>> {
        Ok(self.get(id))
    }

    async fn get_by_hostname(&self, hostname: &str) -> TunaResult<Option<Machine>> {
        Ok(self
            .machines
            .lock()
            .unwrap()
            .values()
            .find(|m| m.hostname == hostname)
            .cloned())
    }

    async fn list(&self) -> TunaResult<Vec<Machine>> {
        Ok(self.machines.lock().unwrap().values().cloned().collect())
    }

    async fn list_allocatable(&self) -> TunaResult<Vec<Machine>> {
        Ok(self
            .machines
            .lock()
            .unwrap()
            .values()
            .filter(|m| m.is_allocatable())
            .cloned()
            .collect())
    }

    async fn set_available(&self, id: i64, available: bool) -> TunaResult<()> {
        self.update(id, |m| m.available = available)
    }

    async fn set_unreachable(&self, id: i64, unreachable: bool) -> TunaResult<()> {
        self.update(id, |m| m.unreachable = unreachable)
    }

    async fn record_host_failure(&self, id: i64) -> TunaResult<i32> {
        let mut failures = 0;
        self.update(id, |m| {
            m.host_failures += 1;
            failures = m.host_failures;
        })?;
        Ok(failures)
    }

    async fn clear_host_failures(&self, id: i64) -> TunaResult<()> {
        self.update(id, |m| m.host_failures = 0)
    }
}

/// Mock implementation of JobRepository
#[derive(Debug, Clone, Default)]
pub struct MockJobRepository {
    jobs: Arc<Mutex<BTreeMap<i64, Job>>>,
}

impl MockJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(jobs: Vec<Job>) -> Self {
        let repo = Self::new();
        {
            let mut map = repo.jobs.lock().unwrap();
            for job in jobs {
                map.insert(job.id, job);
            }
        }
        repo
    }

    pub fn get(&self, id: i64) -> Option<Job> {
        self.jobs.lock().unwrap().get(&id).cloned()
    }

    pub fn all_jobs(&self) -> Vec<Job> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    pub fn count_in_state(&self, state: JobState) -> usize {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter(|j| j.state == state)
            .count()
    }

    /// 修改领取时间，模拟worker失联
    pub fn set_claimed_at(&self, id: i64, claimed_at: DateTime<Utc>) {
        if let Some(job) = self.jobs.lock().unwrap().get_mut(&id) {
            job.claimed_at = Some(claimed_at);
        }
    }

    fn clear_claim(job: &mut Job) {
        job.claim_token = None;
        job.machine_id = None;
        job.device = None;
        job.claimed_at = None;
        job.started_at = None;
    }
}

#[async_trait]
impl JobRepository for MockJobRepository {
    async fn create_batch(&self, jobs: &[NewJob]) -> TunaResult<Vec<i64>> {
        let mut map = self.jobs.lock().unwrap();
        let mut next_id = map.keys().next_back().copied().unwrap_or(0) + 1;
        let mut ids = Vec::with_capacity(jobs.len());
        for new_job in jobs {
            map.insert(next_id, Job::new(next_id, new_job.clone()));
            ids.push(next_id);
            next_id += 1;
        }
        Ok(ids)
    }

    async fn get_by_id(&self, id: i64) -> TunaResult<Option<Job>> {
        Ok(self.get(id))
    }

    async fn claim_batch(&self, request: &ClaimRequest) -> TunaResult<ClaimBatch> {
        if request.limit <= 0 {
            return Ok(ClaimBatch::default());
        }
        let (machine_id, device) = match (request.class, request.resource) {
            (ResourceClass::Evaluate, Some(ResourceKey::Device { machine_id, gpu })) => {
                (Some(machine_id), Some(gpu))
            }
            (ResourceClass::Evaluate, _) => {
                return Err(TunaError::Internal(
                    "评测作业必须绑定到具体GPU设备".to_string(),
                ))
            }
            (ResourceClass::Compile, resource) => (resource.map(|r| r.machine_id()), None),
        };

        let mut jobs = self.jobs.lock().unwrap();
        let mut candidates: Vec<(i32, i64)> = jobs
            .values()
            .filter(|j| j.session_id == request.session_id)
            .filter(|j| j.claimable_by() == Some(request.class))
            .filter(|j| request.reason.as_ref().is_none_or(|r| &j.reason == r))
            .map(|j| (j.retries, j.id))
            .collect();
        candidates.sort_unstable();
        candidates.truncate(request.limit as usize);

        let claim_token = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut job_ids = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(job) = jobs.get_mut(&id) {
                job.state = request.class.running_state();
                job.step = Some(request.class);
                job.claim_token = Some(claim_token.clone());
                job.machine_id = machine_id;
                job.device = device;
                job.claimed_at = Some(now);
                job.started_at = None;
                job.updated_at = now;
                job_ids.push(id);
            }
        }
        job_ids.sort_unstable();

        Ok(ClaimBatch {
            claim_token,
            job_ids,
        })
    }

    async fn begin_execution(
        &self,
        job_id: i64,
        claim_token: &str,
        expected: JobState,
        resource: ResourceKey,
    ) -> TunaResult<bool> {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        let machine_ok = job.machine_id.is_none_or(|m| m == resource.machine_id());
        let device_ok = job.device.is_none_or(|d| Some(d) == resource.device());
        if job.state != expected
            || job.claim_token.as_deref() != Some(claim_token)
            || job.started_at.is_some()
            || !machine_ok
            || !device_ok
        {
            return Ok(false);
        }
        let now = Utc::now();
        job.started_at = Some(now);
        job.machine_id = Some(resource.machine_id());
        job.device = resource.device();
        job.updated_at = now;
        Ok(true)
    }

    async fn report_outcome(
        &self,
        outcome: &JobOutcome,
        max_retries: i32,
    ) -> TunaResult<ReportStatus> {
        let mut jobs = self.jobs.lock().unwrap();
        let job = jobs
            .get_mut(&outcome.job_id)
            .ok_or(TunaError::JobNotFound { id: outcome.job_id })?;

        if !job.is_held_by(&outcome.claim_token) || job.step != Some(outcome.step) {
            return Ok(ReportStatus::Ignored { state: job.state });
        }

        let event = match &outcome.result {
            JobResult::Success => JobEvent::Succeed,
            JobResult::Failure { kind, .. } => JobEvent::Fail(*kind),
        };
        let current = JobSnapshot {
            state: job.state,
            step: job.step,
            retries: job.retries,
        };
        let next = JobStateMachine::new(max_retries).apply(current, event)?;

        let from = job.state;
        job.state = next.state;
        job.retries = next.retries;
        job.claim_token = None;
        job.updated_at = Utc::now();
        Ok(ReportStatus::Applied {
            from,
            to: next.state,
        })
    }

    async fn requeue_stale(&self, older_than: Duration) -> TunaResult<Vec<i64>> {
        let older_than = chrono::Duration::from_std(older_than)
            .map_err(|e| TunaError::Internal(format!("无效的陈旧阈值: {e}")))?;
        let cutoff = Utc::now() - older_than;

        let mut jobs = self.jobs.lock().unwrap();
        let mut requeued = Vec::new();
        for job in jobs.values_mut() {
            let stale = job.state.is_claimed()
                && job.started_at.or(job.claimed_at).is_some_and(|t| t <= cutoff);
            if !stale {
                continue;
            }
            job.state = match job.state {
                JobState::Running => JobState::New,
                _ => JobState::Compiled,
            };
            Self::clear_claim(job);
            job.updated_at = Utc::now();
            requeued.push(job.id);
        }
        Ok(requeued)
    }

    async fn reset(&self, filter: &ResetFilter, target: ResetTarget) -> TunaResult<u64> {
        let mut jobs = self.jobs.lock().unwrap();
        let mut affected = 0;
        for job in jobs.values_mut().filter(|j| filter.matches(j)) {
            job.state = target.state();
            job.step = None;
            job.retries = 0;
            Self::clear_claim(job);
            job.updated_at = Utc::now();
            affected += 1;
        }
        Ok(affected)
    }

    async fn state_counts(&self, session_id: i64) -> TunaResult<Vec<(JobState, i64)>> {
        let jobs = self.jobs.lock().unwrap();
        let mut counts: BTreeMap<JobState, i64> = BTreeMap::new();
        for job in jobs.values().filter(|j| j.session_id == session_id) {
            *counts.entry(job.state).or_default() += 1;
        }
        Ok(counts.into_iter().collect())
    }
}

/// Mock implementation of MergedRecordRepository
#[derive(Debug, Clone, Default)]
pub struct MockMergedRecordRepository {
    records: Arc<Mutex<HashMap<i64, BTreeMap<String, MergedRecord>>>>,
}

impl MockMergedRecordRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MergedRecordRepository for MockMergedRecordRepository {
    async fn replace_session_records(
        &self,
        session_id: i64,
        records: &[MergedRecord],
    ) -> TunaResult<u64> {
        let map: BTreeMap<String, MergedRecord> = records
            .iter()
            .map(|r| (r.key.clone(), r.clone()))
            .collect();
        let count = map.len() as u64;
        self.records.lock().unwrap().insert(session_id, map);
        Ok(count)
    }

    async fn list_session_records(&self, session_id: i64) -> TunaResult<Vec<MergedRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(&session_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }
}

/// Mock implementation of GoldenRepository
///
/// `fail_commits` 让提交在写入后、校验前失败，用于验证调用方不会留下部分数据。
#[derive(Debug, Clone, Default)]
pub struct MockGoldenRepository {
    versions: Arc<Mutex<BTreeMap<i64, (GoldenVersion, Vec<GoldenRecord>)>>>,
    fail_commits: Arc<Mutex<bool>>,
}

impl MockGoldenRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_commits(&self, fail: bool) {
        *self.fail_commits.lock().unwrap() = fail;
    }

    pub fn version_count(&self) -> usize {
        self.versions.lock().unwrap().len()
    }

    /// 直接写入一个已存在的版本
    pub fn seed_version(&self, version: i64, session_id: i64, records: Vec<GoldenRecord>) {
        let meta = GoldenVersion {
            version,
            session_id,
            base_version: None,
            record_count: records.len() as i64,
            created_at: Utc::now(),
        };
        self.versions
            .lock()
            .unwrap()
            .insert(version, (meta, records));
    }
}

#[async_trait]
impl GoldenRepository for MockGoldenRepository {
    async fn get_version(&self, version: i64) -> TunaResult<Option<GoldenVersion>> {
        Ok(self
            .versions
            .lock()
            .unwrap()
            .get(&version)
            .map(|(meta, _)| meta.clone()))
    }

    async fn load_records(&self, version: i64) -> TunaResult<Vec<GoldenRecord>> {
        let mut records = self
            .versions
            .lock()
            .unwrap()
            .get(&version)
            .map(|(_, records)| records.clone())
            .unwrap_or_default();
        records.sort_by(|a, b| (&a.arch, a.num_cu, &a.key).cmp(&(&b.arch, b.num_cu, &b.key)));
        Ok(records)
    }

    async fn commit_snapshot(
        &self,
        snapshot: &GoldenSnapshot,
        overwrite: bool,
    ) -> TunaResult<GoldenVersion> {
        let mut versions = self.versions.lock().unwrap();
        if versions.contains_key(&snapshot.version) && !overwrite {
            return Err(TunaError::GoldenVersionExists {
                version: snapshot.version,
            });
        }
        if *self.fail_commits.lock().unwrap() {
            return Err(TunaError::DatabaseOperation("注入的提交失败".to_string()));
        }

        let actual = snapshot
            .records
            .iter()
            .filter(|r| r.session_id == snapshot.session_id)
            .count() as i64;
        if actual != snapshot.expected_session_records {
            return Err(TunaError::GoldenCountMismatch {
                expected: snapshot.expected_session_records,
                actual,
            });
        }

        let meta = GoldenVersion {
            version: snapshot.version,
            session_id: snapshot.session_id,
            base_version: snapshot.base_version,
            record_count: actual,
            created_at: Utc::now(),
        };
        versions.insert(snapshot.version, (meta.clone(), snapshot.records.clone()));
        Ok(meta)
    }
}

/// 调用记录
#[derive(Debug, Clone, PartialEq)]
pub struct BackendCall {
    pub job_id: i64,
    pub step: ResourceClass,
    pub machine_id: i64,
    pub device: Option<i32>,
}

/// 可编排结果的后端
///
/// 预置的结果按调用顺序依次返回，用完后返回成功并产出一条记录。
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    scripted: Arc<Mutex<VecDeque<BackendOutput>>>,
    calls: Arc<Mutex<Vec<BackendCall>>>,
    delay: Duration,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_output(&self, output: BackendOutput) {
        self.scripted.lock().unwrap().push_back(output);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl TuningBackend for MockBackend {
    async fn execute(&self, ctx: &ExecutionContext) -> TunaResult<BackendOutput> {
        self.calls.lock().unwrap().push(BackendCall {
            job_id: ctx.job.id,
            step: ctx.step,
            machine_id: ctx.machine.id,
            device: ctx.device,
        });

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let scripted = self.scripted.lock().unwrap().pop_front();
        Ok(scripted.unwrap_or_else(|| {
            BackendOutput::success(vec![PerformanceRecord::new(
                format!("{}-{}", ctx.job.config_ref, ctx.step),
                format!("{}:1.0,1", ctx.job.id),
                tuna_core::models::Provenance::new(ctx.machine.hostname.clone(), 0),
            )])
        }))
    }

    fn name(&self) -> &str {
        "mock"
    }
}

/// 收集暂存记录的内存实现
#[derive(Debug, Clone, Default)]
pub struct MockRecordStaging {
    staged: Arc<Mutex<Vec<(i64, String, PerformanceRecord)>>>,
    failing: Arc<AtomicBool>,
}

impl MockRecordStaging {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn staged(&self) -> Vec<(i64, String, PerformanceRecord)> {
        self.staged.lock().unwrap().clone()
    }

    /// 模拟磁盘写满等暂存失败
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordStaging for MockRecordStaging {
    async fn stage(
        &self,
        session_id: i64,
        hostname: &str,
        records: &[PerformanceRecord],
    ) -> TunaResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("disk full").into());
        }
        let mut staged = self.staged.lock().unwrap();
        for record in records {
            staged.push((session_id, hostname.to_string(), record.clone()));
        }
        Ok(())
    }
}
