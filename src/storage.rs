use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Where the wallet's recovery phrase lives. Nothing else is persisted.
pub trait SecretStore: Send + Sync {
    fn load_mnemonic(&self) -> Result<Option<String>>;

    /// `None` forgets the phrase.
    fn save_mnemonic(&self, mnemonic: Option<String>) -> Result<()>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SecretFile {
    #[serde(default)]
    mnemonic: Option<String>,
}

/// JSON file store, `{ "mnemonic": "..." }`, readable only by the owner on unix.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<SecretFile> {
        if !self.path.exists() {
            return Ok(SecretFile::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read secret store {}", self.path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse secret store {}", self.path.display()))
    }

    fn write(&self, file: &SecretFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create store directory {}", parent.display())
                })?;
            }
        }

        let json = serde_json::to_string_pretty(file)?;

        // temp file + rename
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        restrict_permissions(&tmp_path)?;

        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            if cfg!(windows) {
                let _ = fs::remove_file(&self.path);
                fs::rename(&tmp_path, &self.path).with_context(|| {
                    format!("failed to replace secret store {}", self.path.display())
                })?;
            } else {
                return Err(err).with_context(|| {
                    format!("failed to replace secret store {}", self.path.display())
                });
            }
        }
        Ok(())
    }
}

impl SecretStore for FileStore {
    fn load_mnemonic(&self) -> Result<Option<String>> {
        Ok(self.read()?.mnemonic)
    }

    fn save_mnemonic(&self, mnemonic: Option<String>) -> Result<()> {
        self.write(&SecretFile { mnemonic })?;
        tracing::info!(path = %self.path.display(), "secret store updated");
        Ok(())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

/// Process-lifetime store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    mnemonic: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn new(mnemonic: Option<String>) -> Self {
        Self {
            mnemonic: Mutex::new(mnemonic),
        }
    }
}

impl SecretStore for MemoryStore {
    fn load_mnemonic(&self) -> Result<Option<String>> {
        let guard = self
            .mnemonic
            .lock()
            .map_err(|_| anyhow::anyhow!("secret store lock poisoned"))?;
        Ok(guard.clone())
    }

    fn save_mnemonic(&self, mnemonic: Option<String>) -> Result<()> {
        let mut guard = self
            .mnemonic
            .lock()
            .map_err(|_| anyhow::anyhow!("secret store lock poisoned"))?;
        *guard = mnemonic;
        Ok(())
    }
}
