//! JSON checkpoints in a directory

use std::fs;
use std::path::{Path, PathBuf};

use super::{Checkpoint, CheckpointMeta, Checkpointer};
use crate::error::{Error, Result};

const PREFIX: &str = "ckpt-";
const EXT: &str = "json";

/// Writes one `ckpt-<sequence>.json` file per save
#[derive(Debug, Clone)]
pub struct DirCheckpointer {
    dir: PathBuf,
}

impl DirCheckpointer {
    /// Checkpoint into `dir`, creating it if needed
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{PREFIX}{sequence:06}.{EXT}"))
    }

    /// Stored checkpoint files sorted by sequence
    fn stored(&self) -> Result<Vec<(u64, PathBuf)>> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXT) {
                continue;
            }
            let sequence = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.strip_prefix(PREFIX))
                .and_then(|s| s.parse::<u64>().ok());
            if let Some(sequence) = sequence {
                found.push((sequence, path));
            }
        }
        found.sort_by_key(|(seq, _)| *seq);
        Ok(found)
    }

    fn read(path: &Path) -> Result<Checkpoint> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| Error::Checkpoint(format!("failed to parse {}: {e}", path.display())))
    }
}

impl Checkpointer for DirCheckpointer {
    fn save_and_keep_only(&mut self, checkpoint: &Checkpoint, keep: usize) -> Result<()> {
        if keep == 0 {
            return Err(Error::Config("checkpoint keep count must be >= 1".into()));
        }
        let stored = self.stored()?;
        let sequence = stored.last().map_or(1, |(seq, _)| seq + 1);

        let mut to_write = checkpoint.clone();
        to_write.meta.sequence = sequence;
        let path = self.path_for(sequence);
        // Readers never observe a partial file
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(&to_write)?)?;
        fs::rename(&tmp, &path)?;

        tracing::debug!(
            path = %path.display(),
            epoch = to_write.meta.epoch,
            valid_accuracy = to_write.meta.valid_accuracy,
            "Saved checkpoint"
        );

        let total = stored.len() + 1;
        for (seq, old) in stored.into_iter().take(total.saturating_sub(keep)) {
            fs::remove_file(&old)?;
            tracing::debug!(sequence = seq, "Deleted checkpoint");
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<CheckpointMeta>> {
        self.stored()?
            .iter()
            .map(|(_, path)| Self::read(path).map(|c| c.meta))
            .collect()
    }

    fn load_latest(&self) -> Result<Option<Checkpoint>> {
        match self.stored()?.last() {
            Some((_, path)) => Self::read(path).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::Tensor;
    use crate::train::TrainState;
    use chrono::Utc;

    fn checkpoint(epoch: usize, acc: f32) -> Checkpoint {
        Checkpoint {
            meta: CheckpointMeta {
                sequence: 0,
                epoch,
                step: epoch as u64 * 10,
                valid_accuracy: acc,
                saved_at: Utc::now(),
            },
            train_state: TrainState::new(),
            params: vec![Tensor::from_vec(vec![epoch as f32; 3], true)],
            optimizer_state: serde_json::Value::Null,
            loss_scale: 1.0,
        }
    }

    #[test]
    fn test_keeps_two_most_recent() {
        let dir = tempfile::tempdir().unwrap();
        let mut ckpt = DirCheckpointer::new(dir.path()).unwrap();
        for (i, acc) in [0.10, 0.15, 0.12].into_iter().enumerate() {
            ckpt.save_and_keep_only(&checkpoint(i + 1, acc), 2).unwrap();
        }
        let epochs: Vec<usize> = ckpt.list().unwrap().iter().map(|m| m.epoch).collect();
        assert_eq!(epochs, vec![2, 3]);

        let latest = ckpt.load_latest().unwrap().unwrap();
        assert_eq!(latest.meta.epoch, 3);
        assert_eq!(latest.meta.sequence, 3);
        assert_eq!(latest.meta.valid_accuracy, 0.12);
        assert_eq!(latest.params[0].data().to_vec(), vec![3.0; 3]);
    }

    #[test]
    fn test_empty_dir_has_no_latest() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt = DirCheckpointer::new(dir.path().join("nested")).unwrap();
        assert!(ckpt.load_latest().unwrap().is_none());
        assert!(ckpt.list().unwrap().is_empty());
    }

    #[test]
    fn test_ignores_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.json"), "{}").unwrap();
        let mut ckpt = DirCheckpointer::new(dir.path()).unwrap();
        ckpt.save_and_keep_only(&checkpoint(1, 0.5), 1).unwrap();
        assert_eq!(ckpt.list().unwrap().len(), 1);
        assert!(dir.path().join("notes.json").exists());
    }

    #[test]
    fn test_keep_zero_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut ckpt = DirCheckpointer::new(dir.path()).unwrap();
        assert!(ckpt.save_and_keep_only(&checkpoint(1, 0.5), 0).is_err());
    }
}
