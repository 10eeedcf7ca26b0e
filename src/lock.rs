use crate::config::{self, env_key, EffectiveConfig, Resolved};
use crate::error::ServError;
use crate::paths::{absolutize, lock_file_for, write_atomic_text};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockEntry {
    pub locked: bool,
    pub source_file: PathBuf,
    pub source_hash: String,
    pub locked_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unlocked_at: Option<String>,
    pub effective_config_snapshot: EffectiveConfig,
}

pub type LockFile = BTreeMap<String, LockEntry>;

#[derive(Debug, Clone, Serialize)]
pub struct LockOutcome {
    pub environment: String,
    pub lock_file: PathBuf,
    pub source_hash: String,
    pub updated: bool,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnlockOutcome {
    pub environment: String,
    pub lock_file: PathBuf,
    pub was_locked: bool,
    pub dry_run: bool,
}

/// Per-environment immutable snapshots stored next to the config file.
#[derive(Debug, Clone)]
pub struct LockManager {
    config_path: PathBuf,
    lock_path: PathBuf,
}

pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl LockManager {
    pub fn new(config_path: &Path) -> Self {
        let config_path = absolutize(config_path);
        let lock_path = lock_file_for(&config_path);
        Self {
            config_path,
            lock_path,
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn load(&self) -> Result<LockFile, ServError> {
        if !self.lock_path.exists() {
            return Ok(LockFile::new());
        }
        let content = fs::read_to_string(&self.lock_path)?;
        if content.trim().is_empty() {
            return Ok(LockFile::new());
        }
        serde_json::from_str(&content).map_err(|err| {
            ServError::Config(format!(
                "lock file {} is unreadable: {}",
                self.lock_path.display(),
                err
            ))
        })
    }

    fn save(&self, entries: &LockFile) -> Result<(), ServError> {
        let body = serde_json::to_string_pretty(entries)?;
        write_atomic_text(&self.lock_path, &format!("{body}\n"))
    }

    fn current_hash(&self) -> Result<String, ServError> {
        let bytes = fs::read(&self.config_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ServError::Config(format!(
                    "config file not found: {}",
                    self.config_path.display()
                ))
            } else {
                ServError::Io(err)
            }
        })?;
        Ok(hash_bytes(&bytes))
    }

    pub fn lock(
        &self,
        environment: Option<&str>,
        update: bool,
        dry_run: bool,
    ) -> Result<LockOutcome, ServError> {
        let key = env_key(environment);
        let mut entries = self.load()?;
        let existing = entries.get(&key);
        if existing.map(|entry| entry.locked).unwrap_or(false) && !update {
            return Err(ServError::AlreadyLocked { env: key });
        }
        let updated = existing.is_some();
        let source_hash = self.current_hash()?;
        let resolved = config::resolve(&self.config_path, environment)?;
        let entry = LockEntry {
            locked: true,
            source_file: self.config_path.clone(),
            source_hash: source_hash.clone(),
            locked_at: Utc::now().to_rfc3339(),
            unlocked_at: None,
            effective_config_snapshot: resolved.config,
        };
        if !dry_run {
            entries.insert(key.clone(), entry);
            self.save(&entries)?;
            info!(environment = %key, lock_file = %self.lock_path.display(), "environment locked");
        }
        Ok(LockOutcome {
            environment: key,
            lock_file: self.lock_path.clone(),
            source_hash,
            updated,
            dry_run,
        })
    }

    /// Flip `locked` off; the entry itself stays for auditing.
    pub fn unlock(&self, environment: Option<&str>, dry_run: bool) -> Result<UnlockOutcome, ServError> {
        let key = env_key(environment);
        let mut entries = self.load()?;
        let was_locked = match entries.get_mut(&key) {
            Some(entry) if entry.locked => {
                entry.locked = false;
                entry.unlocked_at = Some(Utc::now().to_rfc3339());
                true
            }
            _ => false,
        };
        if was_locked && !dry_run {
            self.save(&entries)?;
            info!(environment = %key, "environment unlocked");
        }
        Ok(UnlockOutcome {
            environment: key,
            lock_file: self.lock_path.clone(),
            was_locked,
            dry_run,
        })
    }

    /// Effective config for a start: the locked snapshot when one is active
    /// (with a drift warning if the file changed since), else a live resolve.
    pub fn resolve_for_start(&self, environment: Option<&str>) -> Result<Resolved, ServError> {
        let key = env_key(environment);
        let entries = self.load()?;
        let Some(entry) = entries.get(&key).filter(|entry| entry.locked) else {
            return config::resolve(&self.config_path, environment);
        };
        let mut warnings = Vec::new();
        match self.current_hash() {
            Ok(hash) if hash == entry.source_hash => {}
            Ok(_) => {
                let message = format!(
                    "config drift: {} changed since environment '{key}' was locked; using the locked snapshot. \
Run `servman lock --env {key} --update` to accept the changes or `servman unlock --env {key}` to use the live file.",
                    self.config_path.display()
                );
                warn!("{message}");
                warnings.push(message);
            }
            Err(err) => {
                let message = format!(
                    "config drift: unable to read {} ({err}); using the locked snapshot for '{key}'",
                    self.config_path.display()
                );
                warn!("{message}");
                warnings.push(message);
            }
        }
        Ok(Resolved {
            config: entry.effective_config_snapshot.clone(),
            warnings,
        })
    }

    pub fn active_locks(&self) -> Result<Vec<String>, ServError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|(_, entry)| entry.locked)
            .map(|(key, _)| key)
            .collect())
    }

    /// Refuse config-file writes while any environment is locked.
    pub fn guard_mutation(&self, dry_run: bool) -> Result<(), ServError> {
        if dry_run {
            return Ok(());
        }
        let envs = self.active_locks()?;
        if envs.is_empty() {
            return Ok(());
        }
        Err(ServError::LockViolation { envs })
    }
}
