use crate::error::ServError;
use dirs::home_dir;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const HOME_ENV: &str = "SERVMAN_HOME";
pub const RUNTIME_HOME_ENV: &str = "SERVMAN_RUNTIME_HOME";
pub const ACTIVE_ENV_ENV: &str = "SERVMAN_ENV";
pub const LOG_ENV: &str = "SERVMAN_LOG";

pub const CONFIG_FILE_NAME: &str = "servman.json";
pub const LOCK_FILE_NAME: &str = "servman-lock.json";

/// Resolved on-disk locations shared by every command.
#[derive(Debug, Clone)]
pub struct Layout {
    pub home: PathBuf,
}

impl Layout {
    pub fn resolve() -> Result<Self, ServError> {
        if let Ok(path) = env::var(HOME_ENV) {
            if !path.trim().is_empty() {
                return Ok(Self {
                    home: PathBuf::from(path),
                });
            }
        }
        let home = home_dir().ok_or_else(|| {
            ServError::Config(format!(
                "unable to resolve $HOME; set HOME or {HOME_ENV} to an existing directory"
            ))
        })?;
        Ok(Self {
            home: home.join(".servman"),
        })
    }

    pub fn servers_dir(&self) -> PathBuf {
        self.home.join("servers")
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.servers_dir().join(name)
    }

    pub fn registry_lock_path(&self) -> PathBuf {
        self.servers_dir().join(".registry.lock")
    }

    pub fn embedded_runtime_dir(&self, version: &str) -> PathBuf {
        self.home.join("runtimes").join("embedded").join(version)
    }

    pub fn download_dir(&self) -> PathBuf {
        self.home.join("runtimes").join(".downloads")
    }
}

/// Per-instance directory tree.
#[derive(Debug, Clone)]
pub struct InstancePaths {
    pub root: PathBuf,
}

impl InstancePaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn record(&self) -> PathBuf {
        self.root.join("instance.json")
    }

    pub fn engine_config(&self) -> PathBuf {
        self.root.join("engine").join("config.json")
    }

    pub fn conf_dir(&self) -> PathBuf {
        self.root.join("conf")
    }

    pub fn server_xml(&self) -> PathBuf {
        self.conf_dir().join("server.xml")
    }

    pub fn web_xml(&self) -> PathBuf {
        self.conf_dir().join("web.xml")
    }

    pub fn rewrite_config(&self) -> PathBuf {
        self.conf_dir()
            .join("Catalina")
            .join("localhost")
            .join("rewrite.config")
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.root.join("certs")
    }

    pub fn log_file(&self) -> PathBuf {
        self.root.join("logs").join("server.log")
    }
}

pub fn lock_file_for(config_path: &Path) -> PathBuf {
    config_dir_from_path(config_path).join(LOCK_FILE_NAME)
}

pub fn config_dir_from_path(config_path: &Path) -> PathBuf {
    match config_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    }
}

pub fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    cwd.join(path)
}

pub fn ensure_parent(path: &Path) -> Result<(), ServError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

pub fn write_atomic(path: &Path, content: &[u8], mode: Option<u32>) -> Result<(), ServError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "servman".to_string()),
        pid,
        ts
    ));

    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

pub fn write_atomic_text(path: &Path, content: &str) -> Result<(), ServError> {
    write_atomic(path, content.as_bytes(), None)
}

/// Lowercase, dash-separated instance name derived from a directory name.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::new();
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if matches!(ch, '-' | '_' | '.' | ' ') && !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "server".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("record.json");
        write_atomic_text(&path, "one").unwrap();
        write_atomic_text(&path, "two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn atomic_write_applies_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let path = dir.path().join("secret");
        write_atomic(&path, b"pw", Some(0o600)).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn sanitize_name_collapses_separators() {
        assert_eq!(sanitize_name("My Project_v2"), "my-project-v2");
        assert_eq!(sanitize_name("..."), "server");
    }

    #[test]
    fn lock_file_sits_next_to_config() {
        let lock = lock_file_for(Path::new("/srv/app/servman.json"));
        assert_eq!(lock, PathBuf::from("/srv/app/servman-lock.json"));
    }
}
