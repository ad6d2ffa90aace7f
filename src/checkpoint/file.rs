//! Filesystem checkpoint store.
//!
//! Layout: one CBOR file per round, `round-000007.ckpt`, inside a single
//! directory. A write goes to a hidden temp file, is synced, then hard-linked
//! to its final name. Linking fails if the name is taken, so an existing
//! checkpoint can never be replaced.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::{Checkpoint, CheckpointStore};
use crate::error::{FedError, Result, RoundNumber};
use crate::params::ParameterVector;

const PREFIX: &str = "round-";
const EXTENSION: &str = ".ckpt";

/// Checkpoint store backed by a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    /// Open a store, creating the directory if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!(dir = %dir.display(), "Checkpoint store opened");
        Ok(Self { dir })
    }

    /// Directory holding the checkpoints.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final path of the checkpoint for `round`.
    pub fn path_for(&self, round: RoundNumber) -> PathBuf {
        self.dir.join(format!("{PREFIX}{round:06}{EXTENSION}"))
    }

    fn temp_path_for(&self, round: RoundNumber) -> PathBuf {
        self.dir.join(format!(".{PREFIX}{round:06}{EXTENSION}.tmp"))
    }

    fn write_durably(&self, round: RoundNumber, bytes: &[u8]) -> io::Result<()> {
        let final_path = self.path_for(round);
        if final_path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", final_path.display()),
            ));
        }

        let temp_path = self.temp_path_for(round);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }

        let linked = fs::hard_link(&temp_path, &final_path);
        if let Err(e) = fs::remove_file(&temp_path) {
            warn!(path = %temp_path.display(), error = %e, "Failed to remove temp checkpoint");
        }
        linked?;

        sync_dir(&self.dir)
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

fn parse_round(file_name: &str) -> Option<RoundNumber> {
    file_name
        .strip_prefix(PREFIX)?
        .strip_suffix(EXTENSION)?
        .parse()
        .ok()
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&self, round: RoundNumber, parameters: &ParameterVector) -> Result<Checkpoint> {
        let checkpoint = Checkpoint::new(round, parameters.clone());
        let bytes = checkpoint.to_cbor().map_err(|e| FedError::CheckpointWrite {
            round,
            reason: e.to_string(),
        })?;

        self.write_durably(round, &bytes)
            .map_err(|e| FedError::CheckpointWrite {
                round,
                reason: e.to_string(),
            })?;

        info!(
            round,
            path = %self.path_for(round).display(),
            size_bytes = bytes.len(),
            "Checkpoint saved"
        );
        Ok(checkpoint)
    }

    fn load(&self, round: RoundNumber) -> Result<Checkpoint> {
        let path = self.path_for(round);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(FedError::NotFound(round)),
            Err(e) => return Err(e.into()),
        };
        let checkpoint = Checkpoint::from_cbor(&bytes)?;
        if checkpoint.round != round {
            return Err(FedError::Serialization(format!(
                "{} holds round {}",
                path.display(),
                checkpoint.round
            )));
        }
        Ok(checkpoint)
    }

    fn rounds(&self) -> Result<Vec<RoundNumber>> {
        let mut rounds = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(round) = entry.file_name().to_str().and_then(parse_round) {
                rounds.push(round);
            }
        }
        rounds.sort_unstable();
        Ok(rounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::TempDir;

    fn params(value: f32) -> ParameterVector {
        ParameterVector::new(vec![
            array![[value, value * 2.0]].into_dyn(),
            array![value].into_dyn(),
        ])
    }

    #[test]
    fn test_store_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("nested").join("weights");
        let store = FileCheckpointStore::open(&dir).unwrap();
        assert!(store.dir().is_dir());
    }

    #[test]
    fn test_file_name_layout() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(temp_dir.path()).unwrap();
        store.save(7, &params(1.0)).unwrap();
        assert!(temp_dir.path().join("round-000007.ckpt").is_file());
        assert!(!store.temp_path_for(7).exists());
    }

    #[test]
    fn test_parse_round() {
        assert_eq!(parse_round("round-000012.ckpt"), Some(12));
        assert_eq!(parse_round(".round-000012.ckpt.tmp"), None);
        assert_eq!(parse_round("round-abc.ckpt"), None);
        assert_eq!(parse_round("history.json"), None);
    }

    #[test]
    fn test_rounds_ignores_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(temp_dir.path()).unwrap();
        store.save(2, &params(2.0)).unwrap();
        store.save(10, &params(10.0)).unwrap();
        fs::write(temp_dir.path().join("notes.txt"), b"hello").unwrap();
        assert_eq!(store.rounds().unwrap(), vec![2, 10]);
    }

    #[test]
    fn test_load_rejects_renamed_file() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::open(temp_dir.path()).unwrap();
        store.save(1, &params(1.0)).unwrap();
        fs::copy(store.path_for(1), store.path_for(5)).unwrap();
        assert!(matches!(store.load(5), Err(FedError::Serialization(_))));
    }
}
