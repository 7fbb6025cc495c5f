use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, instrument, warn};
use tuna_core::models::{GoldenRecord, GoldenSnapshot, GoldenVersion, MergedRecord};
use tuna_core::traits::{GoldenRepository, MergedRecordRepository, SessionRepository};
use tuna_core::{TunaError, TunaResult};

use crate::parser::read_source;

/// Golden版本生成请求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoldenRequest {
    pub session_id: i64,
    pub version: i64,
    pub base_version: Option<i64>,
    pub overwrite: bool,
}

/// Golden版本生成器
///
/// 新版本先复制基础版本的记录，再用会话当前的合并记录覆盖同一
/// (架构, 计算单元, 键) 的条目。基础版本中原本属于本会话的记录不会被带入，
/// 因此新版本中归属本会话的记录数必须等于合并记录数，不一致时整体放弃提交。
pub struct GoldenVersioner {
    session_repo: Arc<dyn SessionRepository>,
    merged_repo: Arc<dyn MergedRecordRepository>,
    golden_repo: Arc<dyn GoldenRepository>,
}

impl GoldenVersioner {
    pub fn new(
        session_repo: Arc<dyn SessionRepository>,
        merged_repo: Arc<dyn MergedRecordRepository>,
        golden_repo: Arc<dyn GoldenRepository>,
    ) -> Self {
        Self {
            session_repo,
            merged_repo,
            golden_repo,
        }
    }

    /// 组装快照，不写入
    pub async fn build_snapshot(&self, request: &GoldenRequest) -> TunaResult<GoldenSnapshot> {
        let session = self
            .session_repo
            .get_by_id(request.session_id)
            .await?
            .ok_or(TunaError::SessionNotFound {
                id: request.session_id,
            })?;

        let mut records: BTreeMap<(String, i32, String), GoldenRecord> = BTreeMap::new();

        if let Some(base) = request.base_version {
            if self.golden_repo.get_version(base).await?.is_none() {
                return Err(TunaError::Configuration(format!(
                    "基础Golden版本不存在: {base}"
                )));
            }
            let mut dropped = 0;
            for record in self.golden_repo.load_records(base).await? {
                if record.session_id == session.id {
                    dropped += 1;
                    continue;
                }
                records.insert(
                    (record.arch.clone(), record.num_cu, record.key.clone()),
                    record,
                );
            }
            info!(
                "从基础版本 {} 复制 {} 条记录，丢弃本会话旧记录 {} 条",
                base,
                records.len(),
                dropped
            );
        }

        let merged = self.merged_repo.list_session_records(session.id).await?;
        for record in &merged {
            records.insert(
                (session.arch.clone(), session.num_cu, record.key.clone()),
                GoldenRecord {
                    arch: session.arch.clone(),
                    num_cu: session.num_cu,
                    key: record.key.clone(),
                    value: record.value.clone(),
                    session_id: session.id,
                },
            );
        }

        Ok(GoldenSnapshot {
            version: request.version,
            session_id: session.id,
            base_version: request.base_version,
            records: records.into_values().collect(),
            expected_session_records: merged.len() as i64,
        })
    }

    /// 生成并提交新版本
    #[instrument(skip(self))]
    pub async fn update(&self, request: &GoldenRequest) -> TunaResult<GoldenVersion> {
        if !request.overwrite
            && self
                .golden_repo
                .get_version(request.version)
                .await?
                .is_some()
        {
            return Err(TunaError::GoldenVersionExists {
                version: request.version,
            });
        }

        let snapshot = self.build_snapshot(request).await?;
        if snapshot.expected_session_records == 0 {
            warn!("会话 {} 没有合并记录", request.session_id);
        }

        let version = self
            .golden_repo
            .commit_snapshot(&snapshot, request.overwrite)
            .await?;
        info!(
            "Golden版本 {} 已提交: 会话 {}, 本会话记录 {}, 总记录 {}",
            version.version,
            version.session_id,
            version.record_count,
            snapshot.records.len()
        );
        Ok(version)
    }
}

/// 把合并输出文件导入为会话的合并记录，替换会话已有的合并记录
pub async fn import_merged_file(
    path: &Path,
    session_id: i64,
    repo: &dyn MergedRecordRepository,
) -> TunaResult<u64> {
    let records: Vec<MergedRecord> = read_source(path)
        .await?
        .into_iter()
        .map(|r| MergedRecord {
            session_id,
            key: r.key,
            value: r.value,
        })
        .collect();

    let written = repo.replace_session_records(session_id, &records).await?;
    info!(
        "会话 {} 导入合并记录 {} 条: {}",
        session_id,
        written,
        path.display()
    );
    Ok(written)
}
