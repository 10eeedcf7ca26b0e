use crate::config::RuntimeKind;
use crate::error::ServError;
use crate::paths::{InstancePaths, Layout, write_atomic_text};
use crate::provider::Launch;
use chrono::Utc;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortAssignment {
    pub http: u16,
    pub shutdown: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jmx: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https: Option<u16>,
}

impl PortAssignment {
    /// Every port this assignment claims, labelled by role.
    pub fn claimed(&self) -> Vec<(&'static str, u16)> {
        let mut ports = vec![("http", self.http), ("shutdown", self.shutdown)];
        if let Some(jmx) = self.jmx {
            ports.push(("jmx", jmx));
        }
        if let Some(https) = self.https {
            ports.push(("https", https));
        }
        ports
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRecord {
    pub name: String,
    pub directory: PathBuf,
    pub project_dir: PathBuf,
    pub config_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(default = "default_host")]
    pub host: String,
    pub ports: PortAssignment,
    pub runtime: RuntimeKind,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub state: InstanceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch: Option<Launch>,
    pub created_at: String,
    pub updated_at: String,
}

fn default_host() -> String {
    "localhost".to_string()
}

impl InstanceRecord {
    pub fn url(&self) -> String {
        format!("http://{}:{}/", self.host, self.ports.http)
    }

    pub fn paths(&self) -> InstancePaths {
        InstancePaths::new(self.directory.clone())
    }

    pub fn transition(&mut self, state: InstanceState) {
        debug!(instance = %self.name, from = self.state.as_str(), to = state.as_str(), "state transition");
        self.state = state;
        self.updated_at = Utc::now().to_rfc3339();
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Timeouts {
    pub startup_seconds: u64,
    pub shutdown_seconds: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            startup_seconds: 60,
            shutdown_seconds: 20,
        }
    }
}

/// Ports claimed by other instances, with the owning instance name.
pub type AvoidSet = BTreeMap<u16, String>;

/// Reads and writes instance records under `$SERVMAN_HOME/servers`.
///
/// Nothing is cached between calls; every query goes back to disk.
#[derive(Debug, Clone)]
pub struct Registry {
    layout: Layout,
}

/// Exclusive advisory lock on the registry; released on drop.
pub struct RegistryGuard {
    _lock: Flock<File>,
}

impl Registry {
    pub fn new(layout: Layout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn lock(&self) -> Result<RegistryGuard, ServError> {
        let path = self.layout.registry_lock_path();
        fs::create_dir_all(self.layout.servers_dir())?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        let lock = Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            ServError::Process(format!(
                "unable to lock registry {}: {}",
                path.display(),
                errno
            ))
        })?;
        Ok(RegistryGuard { _lock: lock })
    }

    pub fn instance_paths(&self, name: &str) -> InstancePaths {
        InstancePaths::new(self.layout.instance_dir(name))
    }

    pub fn load(&self, name: &str) -> Result<Option<InstanceRecord>, ServError> {
        let path = self.instance_paths(name).record();
        read_record(&path)
    }

    pub fn require(&self, name: &str) -> Result<InstanceRecord, ServError> {
        self.load(name)?
            .ok_or_else(|| ServError::InstanceNotFound(name.to_string()))
    }

    pub fn save(&self, record: &InstanceRecord) -> Result<(), ServError> {
        let body = serde_json::to_string_pretty(record)?;
        write_atomic_text(&record.paths().record(), &format!("{body}\n"))
    }

    pub fn remove(&self, name: &str) -> Result<bool, ServError> {
        let dir = self.layout.instance_dir(name);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)?;
        Ok(true)
    }

    /// Every readable record, sorted by name. Unreadable or half-written
    /// records are skipped with a warning.
    pub fn list(&self) -> Result<Vec<InstanceRecord>, ServError> {
        let dir = self.layout.servers_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let path = entry.path().join("instance.json");
            match read_record(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable instance record"),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    pub fn find_by_project(&self, project_dir: &Path) -> Result<Vec<InstanceRecord>, ServError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|record| record.project_dir == project_dir)
            .collect())
    }

    /// Ports held by every record except `exclude`, running or not.
    pub fn avoid_set(&self, exclude: Option<&str>) -> Result<AvoidSet, ServError> {
        let mut avoid = AvoidSet::new();
        for record in self.list()? {
            if Some(record.name.as_str()) == exclude {
                continue;
            }
            for (_, port) in record.ports.claimed() {
                avoid.insert(port, record.name.clone());
            }
        }
        Ok(avoid)
    }

    /// Pick a record name for a project: the configured name, unless another
    /// project already owns it, in which case a numeric suffix is added.
    pub fn claim_name(&self, wanted: &str, project_dir: &Path) -> Result<String, ServError> {
        let mut candidate = wanted.to_string();
        let mut suffix = 2;
        loop {
            match self.load(&candidate)? {
                Some(record) if record.project_dir != project_dir => {
                    candidate = format!("{wanted}-{suffix}");
                    suffix += 1;
                }
                _ => return Ok(candidate),
            }
        }
    }
}

fn read_record(path: &Path) -> Result<Option<InstanceRecord>, ServError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let record: InstanceRecord = serde_json::from_str(&content)?;
    Ok(Some(record))
}
