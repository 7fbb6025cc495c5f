use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tuna_core::TunaResult;

const MACHINE_PREFIX: &str = "tuna_abort_mid_";
const ARCH_PREFIX: &str = "tuna_abort_";

/// 取消标记
///
/// 标记文件放在取消目录下，按机器ID或架构命名。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sentinel {
    Machine(i64),
    Arch(String),
}

impl Sentinel {
    /// 从文件名解析，不是标记文件时返回 `None`
    pub fn parse(file_name: &str) -> Option<Self> {
        if let Some(id) = file_name.strip_prefix(MACHINE_PREFIX) {
            return id.parse().ok().map(Sentinel::Machine);
        }
        file_name
            .strip_prefix(ARCH_PREFIX)
            .filter(|arch| !arch.is_empty())
            .map(|arch| Sentinel::Arch(arch.to_string()))
    }

    pub fn file_name(&self) -> String {
        match self {
            Sentinel::Machine(id) => format!("{MACHINE_PREFIX}{id}"),
            Sentinel::Arch(arch) => format!("{ARCH_PREFIX}{arch}"),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    arches: HashMap<String, CancellationToken>,
    /// machine_id -> (arch, token)
    machines: HashMap<i64, (String, CancellationToken)>,
    cancelled_machines: HashSet<i64>,
    cancelled_arches: HashSet<String>,
}

/// worker取消令牌的登记表
///
/// 令牌按 根 → 架构 → 机器 三层组织：取消架构令牌会连带取消该架构下所有机器的
/// 令牌，取消根令牌用于整体关闭。标记被移除后，新领取的令牌恢复为未取消状态。
pub struct CancellationRegistry {
    root: CancellationToken,
    state: Mutex<RegistryState>,
}

impl Default for CancellationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 获取机器所在worker应持有的令牌
    pub fn token_for(&self, machine_id: i64, arch: &str) -> CancellationToken {
        let mut state = self.state();

        if let Some((_, token)) = state.machines.get(&machine_id) {
            if !token.is_cancelled() || state.cancelled_machines.contains(&machine_id) {
                return token.clone();
            }
        }

        let root = &self.root;
        let arch_token = state
            .arches
            .entry(arch.to_string())
            .or_insert_with(|| root.child_token())
            .clone();
        let token = arch_token.child_token();
        if state.cancelled_machines.contains(&machine_id) {
            token.cancel();
        }
        state
            .machines
            .insert(machine_id, (arch.to_string(), token.clone()));
        token
    }

    pub fn cancel_machine(&self, machine_id: i64) {
        let mut state = self.state();
        if !state.cancelled_machines.insert(machine_id) {
            return;
        }
        if let Some((_, token)) = state.machines.get(&machine_id) {
            token.cancel();
        }
        info!("机器 {} 的worker将在任务边界停止", machine_id);
    }

    pub fn cancel_arch(&self, arch: &str) {
        let mut state = self.state();
        if !state.cancelled_arches.insert(arch.to_string()) {
            return;
        }
        let root = &self.root;
        state
            .arches
            .entry(arch.to_string())
            .or_insert_with(|| root.child_token())
            .cancel();
        info!("架构 {} 的worker将在任务边界停止", arch);
    }

    /// 标记移除后调用，之后领取的令牌不再处于取消状态
    pub fn clear_machine(&self, machine_id: i64) {
        let mut state = self.state();
        if state.cancelled_machines.remove(&machine_id) {
            state.machines.remove(&machine_id);
            debug!("机器 {} 的取消标记已清除", machine_id);
        }
    }

    pub fn clear_arch(&self, arch: &str) {
        let mut state = self.state();
        if !state.cancelled_arches.remove(arch) {
            return;
        }
        state.arches.remove(arch);
        let RegistryState {
            machines,
            cancelled_machines,
            ..
        } = &mut *state;
        machines.retain(|id, (machine_arch, _)| {
            machine_arch != arch || cancelled_machines.contains(id)
        });
        debug!("架构 {} 的取消标记已清除", arch);
    }

    pub fn apply(&self, sentinel: &Sentinel) {
        match sentinel {
            Sentinel::Machine(id) => self.cancel_machine(*id),
            Sentinel::Arch(arch) => self.cancel_arch(arch),
        }
    }

    pub fn clear(&self, sentinel: &Sentinel) {
        match sentinel {
            Sentinel::Machine(id) => self.clear_machine(*id),
            Sentinel::Arch(arch) => self.clear_arch(arch),
        }
    }

    /// 整体关闭，所有已发出和之后发出的令牌都处于取消状态
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}

/// 取消标记监视器
///
/// 周期扫描取消目录，把出现的标记转换为令牌取消，把消失的标记从登记表中清除。
pub struct SentinelWatcher {
    dir: PathBuf,
    registry: Arc<CancellationRegistry>,
    poll_interval: Duration,
    active: Mutex<HashSet<Sentinel>>,
}

impl SentinelWatcher {
    pub fn new(
        dir: impl Into<PathBuf>,
        registry: Arc<CancellationRegistry>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            dir: dir.into(),
            registry,
            poll_interval,
            active: Mutex::new(HashSet::new()),
        }
    }

    async fn scan(&self) -> TunaResult<HashSet<Sentinel>> {
        let mut found = HashSet::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if let Some(sentinel) = entry.file_name().to_str().and_then(Sentinel::parse) {
                found.insert(sentinel);
            }
        }
        Ok(found)
    }

    /// 扫描一次，返回当前存在的标记
    pub async fn check_once(&self) -> TunaResult<Vec<Sentinel>> {
        let found = self.scan().await?;
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());

        for sentinel in found.difference(&active) {
            warn!("发现取消标记: {}", sentinel.file_name());
            self.registry.apply(sentinel);
        }
        for sentinel in active.difference(&found) {
            info!("取消标记已移除: {}", sentinel.file_name());
            self.registry.clear(sentinel);
        }

        *active = found;
        let mut current: Vec<Sentinel> = active.iter().cloned().collect();
        current.sort_by_key(|s| s.file_name());
        Ok(current)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = interval(self.poll_interval);
        info!("取消标记监视启动: {}", self.dir.display());

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        error!("扫描取消目录失败: {}", e);
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("取消标记监视收到停止信号");
                    break;
                }
            }
        }
    }
}
