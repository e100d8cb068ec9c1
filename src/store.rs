use std::{
    fmt,
    fs, io,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEntry {
    pub label: String,
    /// A bare base32 secret or an `otpauth://totp/...` URI.
    pub secret: String,
}

impl SecretEntry {
    pub fn new(label: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            secret: secret.into(),
        }
    }
}

impl fmt::Debug for SecretEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretEntry")
            .field("label", &self.label)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("A label must not be empty")]
    EmptyLabel,
    #[error("A key labelled {0:?} already exists")]
    DuplicateLabel(String),
    #[error("No key labelled {0:?}")]
    UnknownLabel(String),
    #[error("Could not access the secret file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Could not parse the secret file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Could not serialize the secret file: {0}")]
    Serialize(#[from] toml::ser::Error),
}

pub trait SecretStore: Send + Sync {
    /// Every entry, in the order they were added.
    fn list(&self) -> Vec<SecretEntry>;

    fn add(&self, label: &str, secret: &str) -> Result<(), StoreError>;

    fn remove(&self, label: &str) -> Result<(), StoreError>;

    /// Bumped on every successful mutation.
    fn revision(&self) -> u64;
}

#[derive(Debug, Default, Clone)]
struct Entries {
    entries: Vec<SecretEntry>,
    revision: u64,
}

impl Entries {
    fn with_added(&self, label: &str, secret: &str) -> Result<Self, StoreError> {
        if label.trim().is_empty() {
            return Err(StoreError::EmptyLabel);
        }
        if self.entries.iter().any(|e| e.label == label) {
            return Err(StoreError::DuplicateLabel(label.to_string()));
        }

        let mut next = self.clone();
        next.entries.push(SecretEntry::new(label, secret));
        next.revision += 1;

        Ok(next)
    }

    fn with_removed(&self, label: &str) -> Result<Self, StoreError> {
        let position = self
            .entries
            .iter()
            .position(|e| e.label == label)
            .ok_or_else(|| StoreError::UnknownLabel(label.to_string()))?;

        let mut next = self.clone();
        next.entries.remove(position);
        next.revision += 1;

        Ok(next)
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Entries>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entries(entries: impl IntoIterator<Item = SecretEntry>) -> Self {
        Self {
            inner: RwLock::new(Entries {
                entries: entries.into_iter().collect(),
                revision: 0,
            }),
        }
    }
}

impl SecretStore for MemoryStore {
    fn list(&self) -> Vec<SecretEntry> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    fn add(&self, label: &str, secret: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner = inner.with_added(label, secret)?;
        debug!(label, "secret added");

        Ok(())
    }

    fn remove(&self, label: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner = inner.with_removed(label)?;
        debug!(label, "secret removed");

        Ok(())
    }

    fn revision(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .revision
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SecretFile {
    #[serde(default, rename = "secret")]
    secrets: Vec<SecretEntry>,
}

/// Secrets kept in a TOML file as an array of `[[secret]]` tables.
///
/// The file is read once on open; the in-memory copy only changes after the
/// rewritten file has been saved.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: RwLock<Entries>,
}

impl FileStore {
    /// Opens `path`, treating a missing file as an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();

        let entries = match fs::read_to_string(&path) {
            Ok(contents) => {
                let file: SecretFile =
                    toml::from_str(&contents).map_err(|source| StoreError::Parse {
                        path: path.clone(),
                        source,
                    })?;
                file.secrets
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };

        info!(path = %path.display(), count = entries.len(), "secret store opened");

        Ok(Self {
            path,
            inner: RwLock::new(Entries {
                entries,
                revision: 0,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &Entries) -> Result<(), StoreError> {
        let file = SecretFile {
            secrets: entries.entries.clone(),
        };
        let contents = toml::to_string(&file)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        fs::write(&self.path, contents).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl SecretStore for FileStore {
    fn list(&self) -> Vec<SecretEntry> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .clone()
    }

    fn add(&self, label: &str, secret: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let next = inner.with_added(label, secret)?;
        self.persist(&next)?;
        *inner = next;
        info!(label, "secret added");

        Ok(())
    }

    fn remove(&self, label: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let next = inner.with_removed(label)?;
        self.persist(&next)?;
        *inner = next;
        info!(label, "secret removed");

        Ok(())
    }

    fn revision(&self) -> u64 {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .revision
    }
}
