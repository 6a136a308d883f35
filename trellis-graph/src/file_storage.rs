use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::checkpoint::{sort_checkpoints, Checkpoint, CheckpointFilter, CheckpointStorage};
use crate::GraphError;

/// One line of a run's JSON-lines file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum FileRecord {
    Save { checkpoint: Checkpoint },
    Delete { checkpoint_id: String },
}

/// Append-only JSON-lines storage, one file per run id.
///
/// Deletions are recorded as tombstone lines so files are never rewritten.
#[derive(Clone, Debug)]
pub struct FileCheckpointStorage {
    base_dir: PathBuf,
}

impl FileCheckpointStorage {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn sanitize_run_id(run_id: &str) -> String {
        let mut out = String::with_capacity(run_id.len());
        for ch in run_id.chars() {
            match ch {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => out.push('_'),
                c if c.is_control() => {}
                c => out.push(c),
            }
        }
        let trimmed = out.trim_matches(|c: char| c == '.' || c.is_whitespace() || c == '_');
        if trimmed.is_empty() {
            let mut hasher = DefaultHasher::new();
            run_id.hash(&mut hasher);
            return format!("run-{:08x}", hasher.finish());
        }
        trimmed.to_string()
    }

    pub fn run_path(&self, run_id: &str) -> PathBuf {
        let filename = format!("{}.jsonl", Self::sanitize_run_id(run_id));
        self.base_dir.join(filename)
    }

    fn append(&self, run_id: &str, record: &FileRecord) -> Result<(), GraphError> {
        fs::create_dir_all(&self.base_dir).map_err(io_error)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_path(run_id))
            .map_err(io_error)?;
        let line = serde_json::to_string(record)?;
        file.write_all(format!("{line}\n").as_bytes())
            .map_err(io_error)?;
        Ok(())
    }

    fn replay(&self, run_id: &str) -> Result<Vec<Checkpoint>, GraphError> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&path).map_err(io_error)?);
        let mut checkpoints: Vec<Checkpoint> = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(io_error)?;
            if line.trim().is_empty() {
                continue;
            }
            let record: FileRecord = serde_json::from_str(&line)
                .map_err(|err| GraphError::Checkpoint(format!("{}: {err}", path.display())))?;
            match record {
                FileRecord::Save { checkpoint } => {
                    checkpoints.retain(|c| c.checkpoint_id != checkpoint.checkpoint_id);
                    checkpoints.push(checkpoint);
                }
                FileRecord::Delete { checkpoint_id } => {
                    checkpoints.retain(|c| c.checkpoint_id != checkpoint_id);
                }
            }
        }
        sort_checkpoints(&mut checkpoints);
        Ok(checkpoints)
    }
}

fn io_error(err: std::io::Error) -> GraphError {
    GraphError::Checkpoint(err.to_string())
}

#[async_trait::async_trait]
impl CheckpointStorage for FileCheckpointStorage {
    async fn save_checkpoint(
        &self,
        run_id: &str,
        checkpoint: &Checkpoint,
    ) -> Result<(), GraphError> {
        self.append(
            run_id,
            &FileRecord::Save {
                checkpoint: checkpoint.clone(),
            },
        )
    }

    async fn get_checkpoints(
        &self,
        run_id: &str,
        filter: &CheckpointFilter,
    ) -> Result<Vec<Checkpoint>, GraphError> {
        let mut checkpoints = self.replay(run_id)?;
        checkpoints.retain(|checkpoint| filter.matches(checkpoint));
        Ok(checkpoints)
    }

    async fn delete_checkpoint(
        &self,
        run_id: &str,
        checkpoint_id: &str,
    ) -> Result<bool, GraphError> {
        let exists = self
            .replay(run_id)?
            .iter()
            .any(|checkpoint| checkpoint.checkpoint_id == checkpoint_id);
        if exists {
            self.append(
                run_id,
                &FileRecord::Delete {
                    checkpoint_id: checkpoint_id.to_string(),
                },
            )?;
        }
        Ok(exists)
    }
}
