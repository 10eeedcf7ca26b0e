use crate::error::ServError;
use crate::paths::{write_atomic, InstancePaths};
use crate::runner::{execute, CommandRunner};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::Serialize;
use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::info;

pub const KEYSTORE_FILE: &str = "keystore.p12";
pub const PASSWORD_FILE: &str = "keystore.pass";
pub const KEY_ALIAS: &str = "servman";
pub const VALIDITY_DAYS: u32 = 730;
const PASSWORD_BYTES: usize = 32;

pub fn keystore_path(paths: &InstancePaths) -> PathBuf {
    paths.certs_dir().join(KEYSTORE_FILE)
}

pub fn password_path(paths: &InstancePaths) -> PathBuf {
    paths.certs_dir().join(PASSWORD_FILE)
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KeystoreFiles {
    pub keystore: PathBuf,
    pub password: PathBuf,
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct KeystorePlan {
    pub keystore: PathBuf,
    pub password: PathBuf,
    pub action: &'static str,
    pub key: &'static str,
    pub validity_days: u32,
    pub subject_alt_names: Vec<String>,
    pub tool_available: bool,
}

/// Produces a self-signed PKCS#12 keystore whose password is read from
/// `password_file`.
pub trait KeystoreGenerator {
    fn generate(&self, keystore: &Path, password_file: &Path, host: &str) -> Result<(), ServError>;
}

pub struct KeytoolGenerator<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    tool: Option<PathBuf>,
}

impl<'a, R: CommandRunner + ?Sized> KeytoolGenerator<'a, R> {
    pub fn new(runner: &'a R) -> Self {
        Self::with_tool(runner, locate_keytool())
    }

    pub fn with_tool(runner: &'a R, tool: Option<PathBuf>) -> Self {
        Self { runner, tool }
    }
}

impl<R: CommandRunner + ?Sized> KeystoreGenerator for KeytoolGenerator<'_, R> {
    fn generate(&self, keystore: &Path, password_file: &Path, host: &str) -> Result<(), ServError> {
        let tool = self.tool.as_ref().ok_or_else(keytool_missing)?;
        let password_arg = password_file.to_string_lossy().to_string();
        let args = vec![
            "-genkeypair".to_string(),
            "-alias".to_string(),
            KEY_ALIAS.to_string(),
            "-keyalg".to_string(),
            "RSA".to_string(),
            "-keysize".to_string(),
            "2048".to_string(),
            "-validity".to_string(),
            VALIDITY_DAYS.to_string(),
            "-storetype".to_string(),
            "PKCS12".to_string(),
            "-keystore".to_string(),
            keystore.to_string_lossy().to_string(),
            "-storepass:file".to_string(),
            password_arg.clone(),
            "-keypass:file".to_string(),
            password_arg,
            "-dname".to_string(),
            format!("CN={host}"),
            "-ext".to_string(),
            format!("SAN={}", subject_alt_names(host).join(",")),
            "-noprompt".to_string(),
        ];
        let cwd = keystore.parent().unwrap_or_else(|| Path::new("."));
        execute(self.runner, &tool.to_string_lossy(), &args, cwd)?;
        Ok(())
    }
}

fn keytool_missing() -> ServError {
    ServError::CertificateToolingMissing {
        tool: "keytool".to_string(),
        guidance: "Install a JDK (keytool ships with it) and put its bin directory on PATH or set JAVA_HOME, \
or disable TLS with `servman config set tlsConfig.enabled=false`."
            .to_string(),
    }
}

pub fn locate_keytool() -> Option<PathBuf> {
    if let Ok(java_home) = env::var("JAVA_HOME") {
        let candidate = Path::new(&java_home).join("bin").join("keytool");
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    which::which("keytool").ok()
}

/// `localhost`, the configured host and the loopback address, deduplicated.
pub fn subject_alt_names(host: &str) -> Vec<String> {
    let mut names = vec!["dns:localhost".to_string()];
    let host = host.trim();
    if !host.is_empty() && host != "localhost" && host != "127.0.0.1" {
        match host.parse::<IpAddr>() {
            Ok(ip) => names.push(format!("ip:{ip}")),
            Err(_) => names.push(format!("dns:{host}")),
        }
    }
    names.push("ip:127.0.0.1".to_string());
    names
}

pub fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Reuse the instance keystore when both files exist; otherwise generate a
/// new password and keystore, both owner-only.
pub fn ensure_keystore<G: KeystoreGenerator + ?Sized>(
    paths: &InstancePaths,
    host: &str,
    generator: &G,
) -> Result<KeystoreFiles, ServError> {
    let keystore = keystore_path(paths);
    let password = password_path(paths);
    if keystore.is_file() && password.is_file() {
        return Ok(KeystoreFiles {
            keystore,
            password,
            created: false,
        });
    }
    fs::create_dir_all(paths.certs_dir())?;
    write_atomic(&password, generate_password().as_bytes(), Some(0o600))?;

    let staging = paths.certs_dir().join(format!(".{KEYSTORE_FILE}.tmp"));
    if staging.exists() {
        fs::remove_file(&staging)?;
    }
    if let Err(err) = generator.generate(&staging, &password, host) {
        let _ = fs::remove_file(&staging);
        return Err(err);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&staging, fs::Permissions::from_mode(0o600))?;
    }
    fs::rename(&staging, &keystore)?;
    info!(keystore = %keystore.display(), "generated self-signed keystore");
    Ok(KeystoreFiles {
        keystore,
        password,
        created: true,
    })
}

pub fn plan_keystore(paths: &InstancePaths, host: &str) -> KeystorePlan {
    let keystore = keystore_path(paths);
    let password = password_path(paths);
    let reuse = keystore.is_file() && password.is_file();
    KeystorePlan {
        keystore,
        password,
        action: if reuse { "reuse" } else { "generate" },
        key: "RSA-2048",
        validity_days: VALIDITY_DAYS,
        subject_alt_names: subject_alt_names(host),
        tool_available: reuse || locate_keytool().is_some(),
    }
}
