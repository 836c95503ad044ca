//! Credential storage.
//!
//! The store is an injected capability: the request pipeline and the auth
//! service receive an `Arc<dyn CredentialStore>` and never reach for a
//! global. Two implementations ship with the crate: an in-memory store for
//! tests and short-lived processes, and a JSON file store for the CLI.

use std::fs::OpenOptions;
use std::io::{self, Write as _};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::debug;

use kindred_protocol::auth::TokenResponse;

/// Access/refresh token pair. Present or absent as a whole.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPair {
    pub access: String,
    pub refresh: String,
}

impl CredentialPair {
    pub fn new(access: impl Into<String>, refresh: impl Into<String>) -> Self {
        Self {
            access: access.into(),
            refresh: refresh.into(),
        }
    }
}

impl From<TokenResponse> for CredentialPair {
    fn from(tokens: TokenResponse) -> Self {
        Self::new(tokens.access, tokens.refresh)
    }
}

impl std::fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialPair")
            .field("access", &"<redacted>")
            .field("refresh", &"<redacted>")
            .finish()
    }
}

/// Holder of the current credential pair.
///
/// Reads never block on I/O; writes report storage failures.
pub trait CredentialStore: Send + Sync {
    /// Current pair, if signed in.
    fn get(&self) -> Option<CredentialPair>;

    /// Replace the stored pair.
    fn set(&self, pair: CredentialPair) -> io::Result<()>;

    /// Forget the stored pair. Clearing an empty store is not an error.
    fn clear(&self) -> io::Result<()>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    pair: RwLock<Option<CredentialPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that starts signed in.
    pub fn with_pair(pair: CredentialPair) -> Self {
        Self {
            pair: RwLock::new(Some(pair)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        self.pair
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, pair: CredentialPair) -> io::Result<()> {
        *self.pair.write().unwrap_or_else(PoisonError::into_inner) = Some(pair);
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        *self.pair.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Store persisted as a JSON file (mode 0600 on unix).
///
/// The file is read once on open; afterwards the in-memory copy serves
/// reads and every write goes through to disk before the copy is updated.
#[derive(Debug)]
pub struct FileCredentialStore {
    path: PathBuf,
    cached: RwLock<Option<CredentialPair>>,
}

impl FileCredentialStore {
    /// Open the store at `path`. A missing file means signed out; a malformed
    /// file is an error so a corrupt session is not silently discarded.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let cached = match std::fs::read_to_string(&path) {
            Ok(contents) => Some(serde_json::from_str::<CredentialPair>(&contents)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => None,
            Err(err) => return Err(err),
        };
        debug!(
            "Opened credential store at {} (signed in: {})",
            path.display(),
            cached.is_some()
        );
        Ok(Self {
            path,
            cached: RwLock::new(cached),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file(&self, pair: &CredentialPair) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(pair)?;
        let mut options = OpenOptions::new();
        options.truncate(true).write(true).create(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(json.as_bytes())?;
        file.flush()
    }
}

impl CredentialStore for FileCredentialStore {
    fn get(&self) -> Option<CredentialPair> {
        self.cached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, pair: CredentialPair) -> io::Result<()> {
        self.write_file(&pair)?;
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = Some(pair);
        Ok(())
    }

    fn clear(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        *self.cached.write().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
