//! Content-hash gating of artifact uploads
//!
//! The platform records a base64-rendered SHA-256 of the deployed code.
//! Uploading is skipped when the local artifact hashes to the same
//! value, unless the caller forces it.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::reconcile::RemoteFunctionDescriptor;
use crate::transport::{ComputeService, ObjectStore};
use crate::{Error, Result};

/// The locally built deployable artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub path: PathBuf,
    pub size_bytes: u64,
    /// Base64-rendered SHA-256 of the artifact bytes
    pub content_hash: String,
}

impl ArtifactDescriptor {
    /// Fingerprint a local artifact
    ///
    /// Fails with [`Error::ArtifactNotFound`] when the file is missing,
    /// before any network call is attempted.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|_| Error::ArtifactNotFound {
            path: path.display().to_string(),
        })?;
        let size_bytes = file.metadata()?.len();

        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();
        let mut buffer = [0u8; 8192];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }

        Ok(Self {
            path: path.to_path_buf(),
            size_bytes,
            content_hash: BASE64.encode(hasher.finalize()),
        })
    }
}

/// Where an uploaded artifact is additionally archived
pub struct ArchiveTarget<'a, S: ObjectStore> {
    pub store: &'a S,
    pub bucket: &'a str,
    /// Deployment directory the artifact is archived under
    pub directory: &'a str,
}

/// Outcome of a sync attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Hashes matched and no force flag was set; nothing was uploaded
    Skipped,
    /// The artifact bytes were uploaded and acknowledged
    Uploaded,
}

/// Upload the artifact unless its hash matches the remote code hash
///
/// The comparison uses the descriptor produced by
/// [`ArtifactDescriptor::from_path`]; `force` bypasses the gate. When an
/// archive target is given, the bytes are also stored under the
/// deployment directory after a successful code update.
pub fn sync<C: ComputeService, S: ObjectStore>(
    compute: &C,
    artifact: &ArtifactDescriptor,
    remote: &RemoteFunctionDescriptor,
    force: bool,
    archive: Option<&ArchiveTarget<'_, S>>,
) -> Result<SyncOutcome> {
    debug!(
        "Local artifact {} ({} bytes, hash {})",
        artifact.path.display(),
        artifact.size_bytes,
        artifact.content_hash
    );

    if artifact.content_hash == remote.code_hash && !force {
        info!(
            "Code of {} is unchanged; skipping upload",
            remote.name
        );
        return Ok(SyncOutcome::Skipped);
    }

    let bytes = std::fs::read(&artifact.path).map_err(|_| Error::ArtifactNotFound {
        path: artifact.path.display().to_string(),
    })?;

    compute.update_function_code(&remote.name, bytes.clone())?;
    info!(
        "Uploaded {} ({} bytes) to {}",
        artifact.path.display(),
        artifact.size_bytes,
        remote.name
    );

    if let Some(target) = archive {
        let file_name = artifact
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "artifact.zip".to_string());
        let key = format!("{}/{}", target.directory, file_name);
        target.store.put(target.bucket, &key, bytes)?;
        debug!("Archived artifact at {}", key);
    }

    Ok(SyncOutcome::Uploaded)
}
