use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use tuna_core::models::PerformanceRecord;
use tuna_core::traits::RecordStaging;
use tuna_core::TunaResult;

/// 文件暂存
///
/// 每台机器一个文件 `<staging_dir>/session_<id>/<hostname>.txt`，逐行追加 `key=value`，
/// 合并器稍后以这些文件为输入。
pub struct FileRecordStaging {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileRecordStaging {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn session_dir(&self, session_id: i64) -> PathBuf {
        self.root.join(format!("session_{session_id}"))
    }

    pub fn machine_file(&self, session_id: i64, hostname: &str) -> PathBuf {
        self.session_dir(session_id).join(format!("{hostname}.txt"))
    }

    /// 会话下已暂存的文件，按文件名排序
    pub async fn staged_files(&self, session_id: i64) -> TunaResult<Vec<PathBuf>> {
        let dir = self.session_dir(session_id);
        if !Path::new(&dir).exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "txt") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl RecordStaging for FileRecordStaging {
    async fn stage(
        &self,
        session_id: i64,
        hostname: &str,
        records: &[PerformanceRecord],
    ) -> TunaResult<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buffer = String::new();
        for record in records {
            buffer.push_str(&record.to_line());
            buffer.push('\n');
        }

        let _guard = self.write_lock.lock().await;
        fs::create_dir_all(self.session_dir(session_id)).await?;
        let path = self.machine_file(session_id, hostname);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await?;

        debug!("暂存 {} 条记录到 {}", records.len(), path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tuna_core::models::Provenance;

    fn record(key: &str, value: &str) -> PerformanceRecord {
        PerformanceRecord::new(key, value, Provenance::new("node-01", 0))
    }

    #[tokio::test]
    async fn test_stage_appends_per_machine() {
        let dir = tempfile::tempdir().unwrap();
        let staging = FileRecordStaging::new(dir.path());

        staging
            .stage(4, "node-01", &[record("k1", "1:1.0,2")])
            .await
            .unwrap();
        staging
            .stage(4, "node-01", &[record("k2", "3:2.5,1")])
            .await
            .unwrap();
        staging
            .stage(4, "node-02", &[record("k1", "1:0.9,2")])
            .await
            .unwrap();

        let content = std::fs::read_to_string(staging.machine_file(4, "node-01")).unwrap();
        assert_eq!(content, "k1=1:1.0,2\nk2=3:2.5,1\n");

        let files = staging.staged_files(4).await.unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("node-01.txt"));
    }

    #[tokio::test]
    async fn test_empty_batch_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let staging = FileRecordStaging::new(dir.path());
        staging.stage(1, "node-01", &[]).await.unwrap();
        assert!(staging.staged_files(1).await.unwrap().is_empty());
    }
}
