//! Moves job artifacts from local scratch into the object store.
//!
//! Object stores cannot rename atomically, so every artifact is renamed to
//! its final name on local disk first, then uploaded under its final key,
//! read back and checksummed. Local copies are removed only once every
//! artifact of the job verified; on any failure the uploaded objects are
//! deleted again and the scratch files stay put for manual recovery.

use std::{
    collections::BTreeMap,
    fmt, io,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use vigil_model::JobId;

use crate::{
    error::VigilError,
    retry::RetryPolicy,
    storage::{ObjectStorage, artifact_key},
};

#[derive(Debug, Error)]
pub enum FinalizeError {
    #[error("artifact {path} is outside the scratch directory")]
    OutsideScratch { path: PathBuf },

    #[error("artifact {path} does not exist")]
    Missing { path: PathBuf },

    #[error("artifact {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("upload of {key} failed: {source}")]
    Upload {
        key: String,
        #[source]
        source: VigilError,
    },

    #[error("checksum mismatch for {key}: local {expected}, stored {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },
}

impl From<FinalizeError> for VigilError {
    fn from(err: FinalizeError) -> Self {
        VigilError::StorageInconsistency(err.to_string())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct FinalizedArtifact {
    pub key: String,
    pub checksum: String,
    pub byte_len: usize,
    pub bytes: Bytes,
}

impl fmt::Debug for FinalizedArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FinalizedArtifact")
            .field("key", &self.key)
            .field("checksum", &self.checksum)
            .field("byte_len", &self.byte_len)
            .finish()
    }
}

/// Final artifact name: the last two dot-separated segments of the
/// scratch file name (`vigil.<id>.report.jsonl` -> `report.jsonl`).
pub fn artifact_name(file_name: &str) -> &str {
    let mut dots = file_name.rmatch_indices('.').map(|(idx, _)| idx);
    match (dots.next(), dots.next()) {
        (Some(_), Some(second)) => &file_name[second + 1..],
        _ => file_name,
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[derive(Debug)]
struct Candidate {
    name: String,
    source: PathBuf,
    target: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ReportFinalizer {
    storage: Arc<dyn ObjectStorage>,
    retry: RetryPolicy,
    scratch_root: PathBuf,
}

impl ReportFinalizer {
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        retry: RetryPolicy,
        scratch_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            storage,
            retry,
            scratch_root: scratch_root.into(),
        }
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    /// Finalize every artifact announced for `job_id`, plus any file the
    /// scanner left under the job's report prefix without announcing it.
    #[instrument(skip(self, announced), fields(job_id = %job_id))]
    pub async fn finalize(
        &self,
        job_id: JobId,
        announced: &[String],
    ) -> Result<Vec<FinalizedArtifact>, FinalizeError> {
        let candidates = self.collect(job_id, announced).await?;
        if candidates.is_empty() {
            debug!("no artifacts to finalize");
            return Ok(Vec::new());
        }

        let mut done: Vec<(FinalizedArtifact, PathBuf)> = Vec::new();
        for candidate in candidates {
            match self.finalize_one(job_id, &candidate).await {
                Ok(artifact) => done.push((artifact, candidate.target)),
                Err(err) => {
                    warn!(error = %err, "artifact finalization failed; rolling back uploads");
                    for (artifact, _) in &done {
                        if let Err(del) = self.storage.delete(&artifact.key).await {
                            warn!(key = %artifact.key, error = %del, "failed to roll back upload");
                        }
                    }
                    return Err(err);
                }
            }
        }

        let mut artifacts = Vec::with_capacity(done.len());
        for (artifact, local) in done {
            if let Err(err) = tokio::fs::remove_file(&local).await {
                warn!(path = %local.display(), error = %err, "failed to remove scratch copy");
            }
            info!(key = %artifact.key, bytes = artifact.byte_len, checksum = %artifact.checksum, "artifact stored");
            artifacts.push(artifact);
        }
        Ok(artifacts)
    }

    async fn finalize_one(
        &self,
        job_id: JobId,
        candidate: &Candidate,
    ) -> Result<FinalizedArtifact, FinalizeError> {
        // Local rename first: atomic, and tolerated if a previous attempt
        // already performed it.
        if candidate.source != candidate.target {
            match tokio::fs::rename(&candidate.source, &candidate.target).await {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    if !path_exists(&candidate.target).await {
                        return Err(FinalizeError::Missing {
                            path: candidate.source.clone(),
                        });
                    }
                }
                Err(source) => {
                    return Err(FinalizeError::Io {
                        path: candidate.source.clone(),
                        source,
                    });
                }
            }
        }

        let bytes = tokio::fs::read(&candidate.target).await.map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                FinalizeError::Missing {
                    path: candidate.target.clone(),
                }
            } else {
                FinalizeError::Io {
                    path: candidate.target.clone(),
                    source,
                }
            }
        })?;
        let bytes = Bytes::from(bytes);
        let checksum = sha256_hex(&bytes);
        let key = artifact_key(job_id, &candidate.name);

        self.retry
            .run("artifact upload", || self.storage.put(&key, bytes.clone()))
            .await
            .map_err(|source| FinalizeError::Upload {
                key: key.clone(),
                source,
            })?;

        let stored = self
            .retry
            .run("artifact verify", || self.storage.get(&key))
            .await
            .map_err(|source| FinalizeError::Upload {
                key: key.clone(),
                source,
            })?;
        let actual = sha256_hex(&stored);
        if actual != checksum {
            if let Err(err) = self.storage.delete(&key).await {
                warn!(key = %key, error = %err, "failed to delete corrupt upload");
            }
            return Err(FinalizeError::ChecksumMismatch {
                key,
                expected: checksum,
                actual,
            });
        }

        Ok(FinalizedArtifact {
            key,
            checksum,
            byte_len: bytes.len(),
            bytes,
        })
    }

    async fn collect(
        &self,
        job_id: JobId,
        announced: &[String],
    ) -> Result<Vec<Candidate>, FinalizeError> {
        let root = match tokio::fs::canonicalize(&self.scratch_root).await {
            Ok(root) => root,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return if announced.is_empty() {
                    Ok(Vec::new())
                } else {
                    Err(FinalizeError::Missing {
                        path: self.scratch_root.clone(),
                    })
                };
            }
            Err(source) => {
                return Err(FinalizeError::Io {
                    path: self.scratch_root.clone(),
                    source,
                });
            }
        };

        // Keyed by final name so repeated announcements collapse.
        let mut by_name: BTreeMap<String, Candidate> = BTreeMap::new();
        for location in announced {
            let candidate = self.resolve(&root, job_id, Path::new(location)).await?;
            by_name.entry(candidate.name.clone()).or_insert(candidate);
        }
        for path in self.discover(&root, job_id).await? {
            let candidate = self.resolve(&root, job_id, &path).await?;
            by_name.entry(candidate.name.clone()).or_insert(candidate);
        }
        Ok(by_name.into_values().collect())
    }

    async fn resolve(
        &self,
        root: &Path,
        job_id: JobId,
        location: &Path,
    ) -> Result<Candidate, FinalizeError> {
        let joined = if location.is_absolute() {
            location.to_path_buf()
        } else {
            root.join(location)
        };
        let (Some(parent), Some(file_name)) = (joined.parent(), joined.file_name())
        else {
            return Err(FinalizeError::OutsideScratch {
                path: joined.clone(),
            });
        };
        let parent = tokio::fs::canonicalize(parent).await.map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                FinalizeError::Missing {
                    path: joined.clone(),
                }
            } else {
                FinalizeError::Io {
                    path: joined.clone(),
                    source,
                }
            }
        })?;
        if !parent.starts_with(root) {
            return Err(FinalizeError::OutsideScratch {
                path: joined.clone(),
            });
        }

        let file_name = file_name.to_string_lossy();
        let name = artifact_name(&file_name).to_string();
        Ok(Candidate {
            source: parent.join(file_name.as_ref()),
            target: parent.join(format!("{job_id}.{name}")),
            name,
        })
    }

    /// Files under the job's report prefix, renamed or not.
    async fn discover(
        &self,
        root: &Path,
        job_id: JobId,
    ) -> Result<Vec<PathBuf>, FinalizeError> {
        let scratch_prefix = format!("vigil.{job_id}.");
        let final_prefix = format!("{job_id}.");
        let io_err = |source| FinalizeError::Io {
            path: root.to_path_buf(),
            source,
        };

        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(root).await.map_err(io_err)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !(name.starts_with(&scratch_prefix) || name.starts_with(&final_prefix))
                || name.ends_with(".config.json")
            {
                continue;
            }
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
