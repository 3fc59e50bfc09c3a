//! Base64-armored artifacts exchanged across the trust boundary.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use crate::{Error, Result};

/// The logical artifacts of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Secret-bearing context; only ever read and written by the client.
    SecretContext,
    /// Evaluation-only context handed to the compute party.
    PublicContext,
    /// The `n`-th encrypted ballot.
    Ballot(usize),
    /// The `n`-th encrypted feature vector.
    Vector(usize),
    /// A submission bundling every ballot or vector.
    Submission,
    /// Encrypted result returned by the compute party.
    Result,
}

impl ArtifactKind {
    /// File name of the artifact inside a store.
    pub fn file_name(&self) -> String {
        match self {
            Self::SecretContext => "secret-context".to_string(),
            Self::PublicContext => "public-context".to_string(),
            Self::Ballot(n) => format!("ballot-{n}"),
            Self::Vector(n) => format!("vector-{n}"),
            Self::Submission => "submission".to_string(),
            Self::Result => "result".to_string(),
        }
    }

    /// Whether the artifact carries secret key material.
    pub fn is_secret(&self) -> bool {
        matches!(self, Self::SecretContext)
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Armor binary data as base64 text.
pub fn armor(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode base64 text, ignoring surrounding whitespace.
pub fn dearmor(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| Error::Serialization(e.to_string()))
}

/// A directory of armored artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open the store rooted at `root`, creating the directory if needed.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// The directory holding the artifacts.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of an artifact.
    pub fn path(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.file_name())
    }

    /// Whether an artifact exists.
    pub fn contains(&self, kind: ArtifactKind) -> bool {
        self.path(kind).is_file()
    }

    /// Write an artifact, replacing any previous version.
    pub fn write(&self, kind: ArtifactKind, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.path(kind);
        fs::write(&path, armor(bytes))?;
        if kind.is_secret() {
            restrict_to_owner(&path)?;
        }
        debug!(artifact = %kind, bytes = bytes.len(), "wrote artifact");
        Ok(path)
    }

    /// Read an artifact.
    pub fn read(&self, kind: ArtifactKind) -> Result<Vec<u8>> {
        let text = fs::read_to_string(self.path(kind))?;
        dearmor(&text)
    }

    /// Delete an artifact if present.
    pub fn remove(&self, kind: ArtifactKind) -> Result<()> {
        match fs::remove_file(self.path(kind)) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}
