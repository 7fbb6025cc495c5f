use async_trait::async_trait;

use crate::models::PerformanceRecord;
use crate::TunaResult;

/// 按机器暂存性能记录，供后续合并
#[async_trait]
pub trait RecordStaging: Send + Sync {
    async fn stage(
        &self,
        session_id: i64,
        hostname: &str,
        records: &[PerformanceRecord],
    ) -> TunaResult<()>;
}
