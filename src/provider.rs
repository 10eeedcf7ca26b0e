use crate::config::{EffectiveConfig, RuntimeKind};
use crate::error::ServError;
use crate::lock::hash_bytes;
use crate::paths::{ensure_parent, InstancePaths, Layout, RUNTIME_HOME_ENV};
use crate::registry::PortAssignment;
use crate::runner::{execute, CommandRunner};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Container-side mount points used by the docker runtime.
const CONTAINER_CATALINA_CONF: &str = "/usr/local/tomcat/conf";
const CONTAINER_WEBROOT: &str = "/var/www";
const CONTAINER_CERTS: &str = "/opt/servman/certs";
const CONTAINER_ENGINE: &str = "/opt/servman/engine";

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct Capabilities {
    pub url_rewrite: bool,
    pub live_pid_tracking: bool,
    pub server_descriptor: bool,
    pub tls: bool,
    pub shutdown_handshake: bool,
}

/// How an instance is (re)started. Persisted in the instance record so
/// `restart` does not need the config file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Launch {
    Process {
        program: String,
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
        cwd: PathBuf,
    },
    Container {
        name: String,
        run_args: Vec<String>,
    },
}

impl Launch {
    pub fn describe(&self) -> String {
        match self {
            Self::Process { program, args, .. } => crate::runner::render_command(program, args),
            Self::Container { run_args, .. } => crate::runner::render_command("docker", run_args),
        }
    }
}

/// Filesystem references written into patched artifacts, as seen by the
/// running server (host paths, or container paths for docker).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchTarget {
    pub webroot: String,
    pub keystore_file: String,
    pub password_file: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct EmbeddedOptions {
    pub distribution_url: Option<String>,
    pub distribution_path: Option<String>,
    pub sha256: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct InstallOptions {
    pub install_path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct DockerOptions {
    pub image: String,
    pub pull: bool,
}

/// Runtime backend selected by `runtime.type`.
#[derive(Debug)]
pub enum Provider {
    Embedded(EmbeddedOptions),
    External(InstallOptions),
    Docker(DockerOptions),
    Jetty(InstallOptions),
}

/// Where the runtime lives once prepared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeHome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_major: Option<u32>,
}

impl RuntimeHome {
    /// Directory holding the vendor `server.xml`/`web.xml`, when the runtime ships them.
    pub fn conf_dir(&self) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join("conf"))
    }
}

fn options<T: for<'de> Deserialize<'de>>(cfg: &EffectiveConfig) -> Result<T, ServError> {
    serde_json::from_value(Value::Object(cfg.settings.runtime.provider_options.clone())).map_err(
        |err| {
            ServError::Config(format!(
                "runtime.providerOptions for '{}': {}",
                cfg.settings.runtime.kind.as_str(),
                err
            ))
        },
    )
}

impl Provider {
    pub fn from_config(cfg: &EffectiveConfig) -> Result<Self, ServError> {
        Ok(match cfg.settings.runtime.kind {
            RuntimeKind::Embedded => Self::Embedded(options(cfg)?),
            RuntimeKind::External => Self::External(options(cfg)?),
            RuntimeKind::Jetty => Self::Jetty(options(cfg)?),
            RuntimeKind::Docker => {
                let opts: DockerOptions = options(cfg)?;
                if opts.image.trim().is_empty() {
                    return Err(ServError::Config(
                        "runtime.providerOptions.image is required for the docker runtime".to_string(),
                    ));
                }
                Self::Docker(opts)
            }
        })
    }

    pub fn kind(&self) -> RuntimeKind {
        match self {
            Self::Embedded(_) => RuntimeKind::Embedded,
            Self::External(_) => RuntimeKind::External,
            Self::Docker(_) => RuntimeKind::Docker,
            Self::Jetty(_) => RuntimeKind::Jetty,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        capabilities_of(self.kind())
    }

    /// Turn off requested features the backend cannot provide, returning one
    /// warning per dropped feature.
    pub fn degrade(&self, cfg: &mut EffectiveConfig) -> Vec<String> {
        let caps = self.capabilities();
        let kind = self.kind().as_str();
        let mut warnings = Vec::new();
        if cfg.settings.url_rewrite.enabled && !caps.url_rewrite {
            cfg.settings.url_rewrite.enabled = false;
            warnings.push(format!(
                "urlRewrite is not supported by the {kind} runtime; rewrite rules will not be installed"
            ));
        }
        if cfg.settings.tls_config.enabled && !caps.tls {
            cfg.settings.tls_config.enabled = false;
            warnings.push(format!(
                "tlsConfig is not supported by the {kind} runtime; the instance will serve plain HTTP only"
            ));
        }
        if cfg.settings.shutdown_port.is_some() && !caps.shutdown_handshake {
            warnings.push(format!(
                "shutdownPort is ignored by the {kind} runtime; stop uses signals instead"
            ));
        }
        for message in &warnings {
            warn!("{message}");
        }
        warnings
    }

    pub fn patch_target(&self, cfg: &EffectiveConfig, paths: &InstancePaths) -> PatchTarget {
        match self {
            Self::Docker(_) => PatchTarget {
                webroot: CONTAINER_WEBROOT.to_string(),
                keystore_file: format!("{CONTAINER_CERTS}/{}", crate::certs::KEYSTORE_FILE),
                password_file: format!("{CONTAINER_CERTS}/{}", crate::certs::PASSWORD_FILE),
            },
            _ => PatchTarget {
                webroot: cfg.webroot_path().to_string_lossy().to_string(),
                keystore_file: crate::certs::keystore_path(paths).to_string_lossy().to_string(),
                password_file: crate::certs::password_path(paths).to_string_lossy().to_string(),
            },
        }
    }

    /// Locate (and for the embedded runtime, fetch) the runtime, validating
    /// it against the configured engine version.
    pub fn prepare<R: CommandRunner + ?Sized>(
        &self,
        layout: &Layout,
        cfg: &EffectiveConfig,
        runner: &R,
    ) -> Result<RuntimeHome, ServError> {
        match self {
            Self::Embedded(opts) => {
                let dir = layout.embedded_runtime_dir(&cfg.settings.version);
                if !catalina_layout_ok(&dir) {
                    fetch_embedded(layout, cfg, opts, &dir, runner)?;
                }
                let major = validate_catalina(&dir, &cfg.settings.version)?;
                Ok(RuntimeHome {
                    dir: Some(dir),
                    container_major: Some(major),
                })
            }
            Self::External(opts) => {
                let dir = install_dir(opts, cfg, env::var(RUNTIME_HOME_ENV).ok())?;
                let major = validate_catalina(&dir, &cfg.settings.version)?;
                Ok(RuntimeHome {
                    dir: Some(dir),
                    container_major: Some(major),
                })
            }
            Self::Jetty(opts) => {
                let dir = install_dir(opts, cfg, env::var(RUNTIME_HOME_ENV).ok())?;
                if !dir.join("start.jar").is_file() {
                    return Err(ServError::RuntimeValidation(format!(
                        "{} does not look like a Jetty installation (start.jar missing)",
                        dir.display()
                    )));
                }
                Ok(RuntimeHome {
                    dir: Some(dir),
                    container_major: None,
                })
            }
            Self::Docker(opts) => {
                if opts.pull {
                    info!(image = %opts.image, "pulling container image");
                    execute(runner, "docker", &["pull".to_string(), opts.image.clone()], &cfg.project_dir)?;
                }
                Ok(RuntimeHome {
                    dir: None,
                    container_major: None,
                })
            }
        }
    }

    /// Read-only description of what `prepare` would do.
    pub fn plan(&self, layout: &Layout, cfg: &EffectiveConfig) -> Value {
        let kind = self.kind().as_str();
        match self {
            Self::Embedded(opts) => {
                let dir = layout.embedded_runtime_dir(&cfg.settings.version);
                let cached = catalina_layout_ok(&dir);
                let source = if cached {
                    None
                } else {
                    opts.distribution_path
                        .clone()
                        .or_else(|| opts.distribution_url.clone())
                };
                json!({
                    "runtime": kind,
                    "home": dir,
                    "cached": cached,
                    "source": source,
                })
            }
            Self::External(opts) | Self::Jetty(opts) => {
                match install_dir(opts, cfg, env::var(RUNTIME_HOME_ENV).ok()) {
                    Ok(dir) => json!({"runtime": kind, "home": dir}),
                    Err(err) => json!({"runtime": kind, "error": err.to_string()}),
                }
            }
            Self::Docker(opts) => json!({"runtime": kind, "image": opts.image, "pull": opts.pull}),
        }
    }

    /// Runtime directory if it is already on disk; never downloads.
    pub fn existing_home(&self, layout: &Layout, cfg: &EffectiveConfig) -> Option<PathBuf> {
        let dir = match self {
            Self::Embedded(_) => layout.embedded_runtime_dir(&cfg.settings.version),
            Self::External(opts) | Self::Jetty(opts) => {
                install_dir(opts, cfg, env::var(RUNTIME_HOME_ENV).ok()).ok()?
            }
            Self::Docker(_) => return None,
        };
        dir.is_dir().then_some(dir)
    }

    /// How to run the instance registered as `instance`. The container name
    /// follows the registry name, which may carry a `-N` suffix.
    pub fn launch(
        &self,
        cfg: &EffectiveConfig,
        instance: &str,
        ports: &PortAssignment,
        paths: &InstancePaths,
        home: &RuntimeHome,
    ) -> Launch {
        let jvm = jvm_options(cfg, ports);
        match self {
            Self::Embedded(_) | Self::External(_) => {
                let catalina_home = home.dir.clone().unwrap_or_default();
                let mut args = jvm;
                args.push(format!("-Dcatalina.home={}", catalina_home.display()));
                args.push(format!("-Dcatalina.base={}", paths.root.display()));
                args.push(format!("-Djava.io.tmpdir={}", paths.root.join("temp").display()));
                args.push(format!("-Dservman.engine.config={}", paths.engine_config().display()));
                args.push("-classpath".to_string());
                args.push(format!(
                    "{}:{}",
                    catalina_home.join("bin").join("bootstrap.jar").display(),
                    catalina_home.join("bin").join("tomcat-juli.jar").display()
                ));
                args.push("org.apache.catalina.startup.Bootstrap".to_string());
                args.push("start".to_string());
                Launch::Process {
                    program: java_program(),
                    args,
                    env: BTreeMap::new(),
                    cwd: paths.root.clone(),
                }
            }
            Self::Jetty(_) => {
                let jetty_home = home.dir.clone().unwrap_or_default();
                let mut args = jvm;
                args.push(format!("-Dservman.engine.config={}", paths.engine_config().display()));
                args.push("-jar".to_string());
                args.push(jetty_home.join("start.jar").display().to_string());
                args.push(format!("jetty.home={}", jetty_home.display()));
                args.push(format!("jetty.base={}", paths.root.display()));
                args.push(format!("jetty.http.host={}", cfg.settings.host));
                args.push(format!("jetty.http.port={}", ports.http));
                Launch::Process {
                    program: java_program(),
                    args,
                    env: BTreeMap::new(),
                    cwd: paths.root.clone(),
                }
            }
            Self::Docker(opts) => {
                let name = container_name(instance);
                let mut run_args = vec!["run".to_string(), "-d".to_string(), "--name".to_string(), name.clone()];
                for (_, port) in ports.claimed() {
                    run_args.push("-p".to_string());
                    run_args.push(format!("{port}:{port}"));
                }
                let mut mount = |host: &Path, container: &str, read_only: bool| {
                    run_args.push("-v".to_string());
                    let suffix = if read_only { ":ro" } else { "" };
                    run_args.push(format!("{}:{container}{suffix}", host.display()));
                };
                mount(&cfg.webroot_path(), CONTAINER_WEBROOT, false);
                mount(&paths.server_xml(), &format!("{CONTAINER_CATALINA_CONF}/server.xml"), true);
                mount(&paths.web_xml(), &format!("{CONTAINER_CATALINA_CONF}/web.xml"), true);
                if cfg.settings.url_rewrite.enabled {
                    if let Some(dir) = paths.rewrite_config().parent() {
                        mount(dir, &format!("{CONTAINER_CATALINA_CONF}/Catalina/localhost"), true);
                    }
                }
                if cfg.tls_enabled() {
                    mount(&paths.certs_dir(), CONTAINER_CERTS, true);
                }
                if let Some(dir) = paths.engine_config().parent() {
                    mount(dir, CONTAINER_ENGINE, true);
                }
                let mut java_opts = jvm;
                java_opts.push(format!("-Dservman.engine.config={CONTAINER_ENGINE}/config.json"));
                run_args.push("-e".to_string());
                run_args.push(format!("JAVA_OPTS={}", java_opts.join(" ")));
                run_args.push(opts.image.clone());
                Launch::Container { name, run_args }
            }
        }
    }
}

pub fn capabilities_of(kind: RuntimeKind) -> Capabilities {
    match kind {
        RuntimeKind::Embedded | RuntimeKind::External => Capabilities {
            url_rewrite: true,
            live_pid_tracking: true,
            server_descriptor: true,
            tls: true,
            shutdown_handshake: true,
        },
        RuntimeKind::Docker => Capabilities {
            url_rewrite: true,
            live_pid_tracking: false,
            server_descriptor: true,
            tls: true,
            shutdown_handshake: true,
        },
        RuntimeKind::Jetty => Capabilities {
            url_rewrite: false,
            live_pid_tracking: true,
            server_descriptor: false,
            tls: false,
            shutdown_handshake: false,
        },
    }
}

pub fn container_name(instance: &str) -> String {
    format!("servman-{instance}")
}

fn java_program() -> String {
    if let Ok(java_home) = env::var("JAVA_HOME") {
        let candidate = Path::new(&java_home).join("bin").join("java");
        if candidate.is_file() {
            return candidate.to_string_lossy().to_string();
        }
    }
    which::which("java")
        .map(|path| path.to_string_lossy().to_string())
        .unwrap_or_else(|_| "java".to_string())
}

/// Heap sizes, extra args, enabled agents (in id order) and JMX flags.
pub fn jvm_options(cfg: &EffectiveConfig, ports: &PortAssignment) -> Vec<String> {
    let jvm = &cfg.settings.jvm;
    let mut args = vec![format!("-Xms{}", jvm.min_memory), format!("-Xmx{}", jvm.max_memory)];
    args.extend(jvm.additional_args.iter().cloned());
    for agent in cfg.settings.agents.values().filter(|agent| agent.enabled) {
        args.extend(agent.jvm_args.iter().cloned());
    }
    if let Some(jmx) = ports.jmx {
        args.push("-Dcom.sun.management.jmxremote".to_string());
        args.push(format!("-Dcom.sun.management.jmxremote.port={jmx}"));
        args.push(format!("-Dcom.sun.management.jmxremote.rmi.port={jmx}"));
        args.push("-Dcom.sun.management.jmxremote.authenticate=false".to_string());
        args.push("-Dcom.sun.management.jmxremote.ssl=false".to_string());
        args.push("-Djava.rmi.server.hostname=127.0.0.1".to_string());
    }
    args
}

fn install_dir(
    opts: &InstallOptions,
    cfg: &EffectiveConfig,
    env_override: Option<String>,
) -> Result<PathBuf, ServError> {
    let raw = opts
        .install_path
        .clone()
        .or(env_override.filter(|value| !value.trim().is_empty()))
        .ok_or_else(|| {
            ServError::RuntimeValidation(format!(
                "the {} runtime needs runtime.providerOptions.installPath or {RUNTIME_HOME_ENV}",
                cfg.settings.runtime.kind.as_str()
            ))
        })?;
    let path = PathBuf::from(raw);
    let path = if path.is_absolute() {
        path
    } else {
        cfg.project_dir.join(path)
    };
    if !path.is_dir() {
        return Err(ServError::RuntimeValidation(format!(
            "install path {} does not exist",
            path.display()
        )));
    }
    Ok(path)
}

fn catalina_layout_ok(dir: &Path) -> bool {
    dir.join("bin").join("bootstrap.jar").is_file() && dir.join("conf").is_dir()
}

/// Servlet container major version from `RELEASE-NOTES`.
pub fn container_major_version(dir: &Path) -> Option<u32> {
    let notes = fs::read_to_string(dir.join("RELEASE-NOTES")).ok()?;
    let pattern = Regex::new(r"Apache Tomcat Version (\d+)\.").ok()?;
    pattern
        .captures(&notes)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Supported container majors for an engine version.
pub fn compatible_container_majors(engine_version: &str) -> Option<(u32, u32)> {
    let major: u32 = engine_version.split('.').next()?.trim().parse().ok()?;
    match major {
        0..=4 => None,
        5 => Some((8, 9)),
        6 => Some((9, 11)),
        _ => Some((10, 11)),
    }
}

fn validate_catalina(dir: &Path, engine_version: &str) -> Result<u32, ServError> {
    if !catalina_layout_ok(dir) {
        return Err(ServError::RuntimeValidation(format!(
            "{} is not a servlet container installation (expected bin/bootstrap.jar and conf/)",
            dir.display()
        )));
    }
    let found = container_major_version(dir).ok_or_else(|| {
        ServError::RuntimeValidation(format!(
            "unable to read the container version from {}",
            dir.join("RELEASE-NOTES").display()
        ))
    })?;
    let (low, high) = compatible_container_majors(engine_version).ok_or_else(|| {
        ServError::RuntimeValidation(format!("engine version {engine_version} is not supported"))
    })?;
    if found < low || found > high {
        return Err(ServError::RuntimeValidation(format!(
            "engine {engine_version} requires container version {low}-{high}, but {} has version {found}",
            dir.display()
        )));
    }
    Ok(found)
}

fn fetch_embedded<R: CommandRunner + ?Sized>(
    layout: &Layout,
    cfg: &EffectiveConfig,
    opts: &EmbeddedOptions,
    dest: &Path,
    runner: &R,
) -> Result<(), ServError> {
    let archive = match (&opts.distribution_path, &opts.distribution_url) {
        (Some(path), _) => {
            let path = PathBuf::from(path);
            if path.is_absolute() {
                path
            } else {
                cfg.project_dir.join(path)
            }
        }
        (None, Some(url)) => {
            let file_name = url
                .rsplit('/')
                .next()
                .filter(|name| !name.is_empty())
                .unwrap_or("runtime.tar.gz");
            let target = layout.download_dir().join(file_name);
            info!(url = %url, "downloading embedded runtime");
            download_file(url, &target)?;
            target
        }
        (None, None) => {
            return Err(ServError::RuntimeValidation(format!(
                "embedded runtime {} is not cached in {}; set runtime.providerOptions.distributionUrl or distributionPath",
                cfg.settings.version,
                dest.display()
            )))
        }
    };
    if let Some(expected) = &opts.sha256 {
        let actual = hash_bytes(&fs::read(&archive)?);
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(ServError::RuntimeValidation(format!(
                "checksum mismatch for {}: expected {}, got {}",
                archive.display(),
                expected,
                actual
            )));
        }
    }
    extract_archive(&archive, dest, runner)
}

fn download_file(url: &str, path: &Path) -> Result<(), ServError> {
    let client = reqwest::blocking::Client::new();
    let response = client.get(url).header("User-Agent", "servman").send()?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().unwrap_or_default();
        return Err(ServError::Process(format!(
            "download failed: {} (HTTP {} {})",
            url, status, body
        )));
    }
    let bytes = response.bytes()?;
    ensure_parent(path)?;
    fs::write(path, &bytes)?;
    Ok(())
}

/// Unpack into a staging directory, lift a single top-level directory, then
/// move the result into place.
fn extract_archive<R: CommandRunner + ?Sized>(
    archive: &Path,
    dest: &Path,
    runner: &R,
) -> Result<(), ServError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let staging = parent.join(format!(
        ".staging-{}",
        dest.file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default()
    ));
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    fs::create_dir_all(&staging)?;
    let archive_str = archive.to_string_lossy().to_string();
    let staging_str = staging.to_string_lossy().to_string();
    let result = if archive_str.ends_with(".zip") {
        execute(
            runner,
            "unzip",
            &["-q".to_string(), archive_str, "-d".to_string(), staging_str],
            parent,
        )
    } else {
        execute(
            runner,
            "tar",
            &["-xzf".to_string(), archive_str, "-C".to_string(), staging_str],
            parent,
        )
    };
    if let Err(err) = result {
        let _ = fs::remove_dir_all(&staging);
        return Err(err);
    }
    let entries: Vec<PathBuf> = fs::read_dir(&staging)?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();
    let root = match entries.as_slice() {
        [single] if single.is_dir() => single.clone(),
        _ => staging.clone(),
    };
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    fs::rename(&root, dest)?;
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    Ok(())
}
