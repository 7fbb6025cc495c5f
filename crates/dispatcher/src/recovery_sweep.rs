use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{error, info};
use tuna_core::traits::JobRepository;
use tuna_core::TunaResult;

/// 陈旧领取回收
///
/// worker崩溃后其领取的作业停留在运行中状态，超过阈值后被退回领取前状态。
pub struct RecoverySweep {
    job_repo: Arc<dyn JobRepository>,
    stale_after: Duration,
    sweep_interval: Duration,
}

impl RecoverySweep {
    pub fn new(job_repo: Arc<dyn JobRepository>, stale_after: Duration, sweep_interval: Duration) -> Self {
        Self {
            job_repo,
            stale_after,
            sweep_interval,
        }
    }

    pub async fn sweep_once(&self) -> TunaResult<Vec<i64>> {
        self.job_repo.requeue_stale(self.stale_after).await
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(self.sweep_interval);
        info!(
            "陈旧领取回收启动: 阈值 {}s, 间隔 {}s",
            self.stale_after.as_secs(),
            self.sweep_interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(ids) if !ids.is_empty() => info!("回收作业 {} 个", ids.len()),
                        Ok(_) => {}
                        Err(e) => error!("陈旧领取回收失败: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("陈旧领取回收收到停止信号");
                    break;
                }
            }
        }
    }
}
