use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use parley_types::ApiError;
use parley_types::models::Credential;

/// Durable home of the session credential, read back on restart.
pub trait CredentialStore: Send + Sync + 'static {
    fn load(&self) -> Result<Option<Credential>, ApiError>;
    fn save(&self, credential: &Credential) -> Result<(), ApiError>;
    fn clear(&self) -> Result<(), ApiError>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<Credential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(credential: Credential) -> Self {
        Self {
            slot: Mutex::new(Some(credential)),
        }
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Result<Option<Credential>, ApiError> {
        Ok(self.slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, credential: &Credential) -> Result<(), ApiError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(credential.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), ApiError> {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// JSON file holding both tokens.
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn store_err(path: &Path, e: impl std::fmt::Display) -> ApiError {
    ApiError::Store(format!("{}: {}", path.display(), e))
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Result<Option<Credential>, ApiError> {
        let raw = match std::fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_err(&self.path, e)),
        };
        match serde_json::from_slice(&raw) {
            Ok(credential) => Ok(Some(credential)),
            Err(e) => {
                // A corrupt file means signing in again, not a hard failure.
                warn!("Ignoring unreadable credential file {}: {}", self.path.display(), e);
                Ok(None)
            }
        }
    }

    fn save(&self, credential: &Credential) -> Result<(), ApiError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| store_err(dir, e))?;
        }
        let json = serde_json::to_vec_pretty(credential).map_err(|e| store_err(&self.path, e))?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| store_err(&tmp, e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| store_err(&self.path, e))?;
        debug!("Saved credential to {}", self.path.display());
        Ok(())
    }

    fn clear(&self) -> Result<(), ApiError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_err(&self.path, e)),
        }
    }
}
