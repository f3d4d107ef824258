use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::handler::{HandlerError, TaskEnvelope, TaskHandler};
use super::orchestrator::ExhaustedTask;

/// Directory that receives one JSON document per record.
///
/// Files appear under their final `<uuid>.json` name only once fully written.
#[derive(Debug, Clone)]
pub struct SpoolDir {
    pub root: PathBuf
}

impl SpoolDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await.with_context(|| {
            format!("failed to create dir {}", self.root.display())
        })
    }

    pub async fn write_json<T: Serialize>(
        &self,
        id: Uuid,
        value: &T
    ) -> Result<PathBuf> {
        let payload = serde_json::to_vec_pretty(value)
            .with_context(|| format!("failed to encode spool record {id}"))?;
        write_atomic(&self.root, id, &payload).await
    }
}

async fn write_atomic(
    dir: &Path,
    id: Uuid,
    payload: &[u8]
) -> Result<PathBuf> {
    let tmp_path = dir.join(format!("{id}.json.tmp"));
    let final_path = dir.join(format!("{id}.json"));

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .with_context(|| format!("failed to create {}", tmp_path.display()))?;

    file.write_all(payload)
        .await
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;

    file.sync_all()
        .await
        .with_context(|| format!("failed to fsync {}", tmp_path.display()))?;

    drop(file);

    tokio::fs::rename(&tmp_path, &final_path).await.with_context(|| {
        format!("failed to rename {} -> {}", tmp_path.display(), final_path.display())
    })?;

    Ok(final_path)
}

/// `TaskHandler` that hands tasks over through the filesystem.
pub struct SpoolHandler {
    name: String,
    spool: SpoolDir
}

impl SpoolHandler {
    pub fn new(
        name: impl Into<String>,
        spool: SpoolDir
    ) -> Self {
        Self { name: name.into(), spool }
    }
}

#[async_trait]
impl TaskHandler for SpoolHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        task: &TaskEnvelope
    ) -> Result<(), HandlerError> {
        self.spool.ensure_dir().await?;
        let path = self.spool.write_json(task.task_id, task).await?;
        debug!(
            "task spooled: handler={}, task_id={}, uid={}, path={}",
            self.name,
            task.task_id,
            task.source_id,
            path.display()
        );
        Ok(())
    }
}

/// Persists every exhausted task until the orchestrator drops its sender.
pub async fn run_dead_letter_writer(
    mut rx: mpsc::Receiver<ExhaustedTask>,
    spool: SpoolDir
) {
    if let Err(err) = spool.ensure_dir().await {
        error!("ERROR_CODE=DEAD_LETTER_UNAVAILABLE dead-letter spool unusable: error={err:#}");
    }

    while let Some(task) = rx.recv().await {
        match spool.write_json(Uuid::now_v7(), &task).await {
            Ok(path) => info!(
                "dead letter written: key={}, attempt_count={}, path={}",
                task.key,
                task.attempt_count,
                path.display()
            ),
            Err(err) => error!(
                "ERROR_CODE=DEAD_LETTER_WRITE_FAILED dead letter lost: key={}, error={err:#}",
                task.key
            )
        }
    }

    debug!("dead-letter writer stopped");
}
