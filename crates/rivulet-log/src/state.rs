//! Persisted replication state.
//!
//! A small metadata file beside the segments holds the leader epoch map and
//! the last persisted high watermark. The epoch map is written synchronously
//! before the first append of a new epoch; the high watermark is checkpointed
//! periodically and clamped to the recovered newest offset on restart.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use rivulet_common::Offset;
use serde::{Deserialize, Serialize};

use crate::epoch::LeaderEpochMap;
use crate::error::Result;

const STATE_FILE_NAME: &str = "replication-state";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationState {
    pub epoch_map: LeaderEpochMap,
    pub high_watermark: Offset,
}

pub struct StateFile {
    path: PathBuf,
    tmp_path: PathBuf,
}

impl StateFile {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(STATE_FILE_NAME),
            tmp_path: dir.join(format!("{STATE_FILE_NAME}.tmp")),
        }
    }

    pub fn load(&self) -> Result<Option<ReplicationState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path)?;
        let state = bincode::deserialize(&data)?;
        Ok(Some(state))
    }

    /// Atomically replace the state file (write temp, sync, rename).
    pub fn store(&self, state: &ReplicationState) -> Result<()> {
        let data = bincode::serialize(state)?;
        let mut file = File::create(&self.tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&self.tmp_path, &self.path)?;
        Ok(())
    }
}
