use crate::certs::{ensure_keystore, KeystoreGenerator};
use crate::config::{EffectiveConfig, Resolved, RuntimeKind};
use crate::error::ServError;
use crate::lock::LockManager;
use crate::patch::{self, Artifacts, Templates};
use crate::paths::{ensure_parent, write_atomic_text, InstancePaths};
use crate::ports::{port_is_bound, PortAllocator, PortProbe};
use crate::provider::{capabilities_of, container_name, Launch, Provider, RuntimeHome};
use crate::registry::{InstanceRecord, InstanceState, PortAssignment, Registry, Timeouts};
use crate::runner::{execute, CommandRunner};
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use serde::Serialize;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_GRACE: Duration = Duration::from_secs(2);
const SHUTDOWN_COMMAND: &[u8] = b"SHUTDOWN";
// Docker commands do not depend on the working directory.
const DOCKER_CWD: &str = "/";

#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub name: String,
    pub state: InstanceState,
    pub already_running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub ports: PortAssignment,
    pub url: String,
    pub log_file: PathBuf,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub state: InstanceState,
    pub recorded_state: InstanceState,
    pub live: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    pub runtime: RuntimeKind,
    pub ports: PortAssignment,
    pub url: String,
    pub project_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub name: String,
    pub was_running: bool,
    pub method: &'static str,
    pub state: InstanceState,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkItem {
    pub name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StopOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub failed: usize,
    pub results: Vec<BulkItem>,
}

enum Claim {
    Running(InstanceRecord),
    Starting(InstanceRecord),
}

/// Drives instance state transitions. Holds no state of its own beyond the
/// interrupt flag; everything else is read from and written to the registry.
pub struct Supervisor<'a> {
    registry: &'a Registry,
    runner: &'a dyn CommandRunner,
    probe: &'a dyn PortProbe,
    keystores: &'a dyn KeystoreGenerator,
    interrupted: Arc<AtomicBool>,
    armed: Cell<bool>,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        registry: &'a Registry,
        runner: &'a dyn CommandRunner,
        probe: &'a dyn PortProbe,
        keystores: &'a dyn KeystoreGenerator,
    ) -> Self {
        Self {
            registry,
            runner,
            probe,
            keystores,
            interrupted: Arc::new(AtomicBool::new(false)),
            armed: Cell::new(false),
        }
    }

    fn arm_interrupts(&self) -> Result<(), ServError> {
        if self.armed.get() {
            return Ok(());
        }
        for signal in [SIGINT, SIGTERM] {
            flag::register(signal, Arc::clone(&self.interrupted))?;
        }
        self.armed.set(true);
        Ok(())
    }

    pub fn start(
        &self,
        config_path: &Path,
        environment: Option<&str>,
    ) -> Result<StartOutcome, ServError> {
        let Resolved {
            config: mut cfg,
            mut warnings,
        } = LockManager::new(config_path).resolve_for_start(environment)?;
        let provider = Provider::from_config(&cfg)?;
        warnings.extend(provider.degrade(&mut cfg));
        let home = provider.prepare(self.registry.layout(), &cfg, self.runner)?;

        let mut record = match self.claim(&cfg, provider.kind())? {
            Claim::Running(record) => {
                info!(instance = %record.name, "instance already running");
                return Ok(outcome(&record, true, warnings));
            }
            Claim::Starting(record) => record,
        };
        let result = self
            .materialize(&provider, &cfg, &home, &record)
            .and_then(|launch| self.spawn(&mut record, launch));
        if let Err(err) = result {
            self.mark_failed(&mut record);
            return Err(err);
        }
        Ok(outcome(&record, false, warnings))
    }

    /// Allocate ports and write the STARTING record while holding the
    /// registry lock.
    fn claim(&self, cfg: &EffectiveConfig, runtime: RuntimeKind) -> Result<Claim, ServError> {
        let _guard = self.registry.lock()?;
        let name = self.registry.claim_name(&cfg.name, &cfg.project_dir)?;
        let existing = self.registry.load(&name)?;
        if let Some(existing) = existing.as_ref() {
            if self.is_live(existing) {
                return Ok(Claim::Running(existing.clone()));
            }
        }
        let avoid = self.registry.avoid_set(Some(&name))?;
        let ports = PortAllocator::new(self.probe, avoid).assign(cfg)?;
        let now = Utc::now().to_rfc3339();
        let mut record = InstanceRecord {
            directory: self.registry.layout().instance_dir(&name),
            name,
            project_dir: cfg.project_dir.clone(),
            config_file: cfg.config_file.clone(),
            environment: cfg.environment.clone(),
            host: cfg.settings.host.clone(),
            ports,
            runtime,
            timeouts: Timeouts {
                startup_seconds: cfg.settings.startup_timeout_seconds,
                shutdown_seconds: cfg.settings.shutdown_timeout_seconds,
            },
            pid: None,
            container_id: None,
            state: existing
                .as_ref()
                .map(|record| record.state)
                .unwrap_or(InstanceState::Created),
            launch: None,
            created_at: existing
                .map(|record| record.created_at)
                .unwrap_or_else(|| now.clone()),
            updated_at: now,
        };
        record.transition(InstanceState::Starting);
        self.registry.save(&record)?;
        debug!(instance = %record.name, ports = ?record.ports, "ports claimed");
        Ok(Claim::Starting(record))
    }

    fn materialize(
        &self,
        provider: &Provider,
        cfg: &EffectiveConfig,
        home: &RuntimeHome,
        record: &InstanceRecord,
    ) -> Result<Launch, ServError> {
        let paths = record.paths();
        for dir in ["logs", "temp", "work"] {
            fs::create_dir_all(paths.root.join(dir))?;
        }
        let templates = Templates::load(home.conf_dir().as_deref(), Some(&paths.rewrite_config()))?;
        let artifacts = patch::render(
            &templates,
            cfg,
            &record.ports,
            &provider.patch_target(cfg, &paths),
            provider.capabilities(),
        )?;
        write_artifacts(&paths, &artifacts)?;
        if cfg.tls_enabled() {
            ensure_keystore(&paths, &cfg.settings.host, self.keystores)?;
        }
        Ok(provider.launch(cfg, &record.name, &record.ports, &paths, home))
    }

    fn ensure_port_free(&self, record: &InstanceRecord) -> Result<(), ServError> {
        if self.probe.is_free(record.ports.http) {
            return Ok(());
        }
        Err(ServError::PortConflict {
            port: record.ports.http,
            owner: "another process on this host".to_string(),
            remedy: "Retry once the port is released, or pick another with `servman config set port=<port>`."
                .to_string(),
        })
    }

    fn spawn(&self, record: &mut InstanceRecord, launch: Launch) -> Result<(), ServError> {
        self.ensure_port_free(record)?;
        record.launch = Some(launch.clone());
        self.registry.save(record)?;
        match launch {
            Launch::Process {
                program,
                args,
                env,
                cwd,
            } => self.spawn_process(record, &program, &args, &env, &cwd),
            Launch::Container { name, run_args } => self.spawn_container(record, &name, &run_args),
        }
    }

    fn spawn_process(
        &self,
        record: &mut InstanceRecord,
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
        cwd: &Path,
    ) -> Result<(), ServError> {
        let log_path = record.paths().log_file();
        ensure_parent(&log_path)?;
        let log = OpenOptions::new().create(true).append(true).open(&log_path)?;
        let log_err = log.try_clone()?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .envs(env)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .process_group(0);
        // The child gets its own process group, so Ctrl-C only reaches us.
        self.arm_interrupts()?;
        let mut child = cmd.spawn().map_err(|err| ServError::ProcessStartFailed {
            name: record.name.clone(),
            message: format!("unable to run `{program}`: {err}"),
        })?;
        let pid = child.id();
        debug!(instance = %record.name, pid, "spawned");

        let port = record.ports.http;
        let deadline = Instant::now() + Duration::from_secs(record.timeouts.startup_seconds);
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                signal_group(pid, Signal::SIGKILL);
                let _ = child.wait();
                return Err(ServError::Interrupted {
                    name: record.name.clone(),
                });
            }
            if let Some(status) = child.try_wait()? {
                return Err(ServError::ProcessStartFailed {
                    name: record.name.clone(),
                    message: format!(
                        "process exited ({status}) before binding port {port}; see {}",
                        log_path.display()
                    ),
                });
            }
            if port_is_bound(port) {
                break;
            }
            if Instant::now() >= deadline {
                signal_group(pid, Signal::SIGKILL);
                let _ = child.wait();
                return Err(ServError::ProcessStartTimeout {
                    name: record.name.clone(),
                    port,
                    timeout_sec: record.timeouts.startup_seconds,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }

        record.pid = Some(pid);
        record.transition(InstanceState::Running);
        self.registry.save(record)?;
        info!(instance = %record.name, pid, port, "instance running");
        Ok(())
    }

    fn spawn_container(
        &self,
        record: &mut InstanceRecord,
        name: &str,
        run_args: &[String],
    ) -> Result<(), ServError> {
        let cwd = record.project_dir.clone();
        self.arm_interrupts()?;
        // A stopped container with the same name would make `docker run` fail.
        let _ = execute(self.runner, "docker", &docker_args(&["rm", "-f", name]), &cwd);
        let output = execute(self.runner, "docker", run_args, &cwd)?;
        let container_id = output.stdout_text();

        let port = record.ports.http;
        let deadline = Instant::now() + Duration::from_secs(record.timeouts.startup_seconds);
        loop {
            if self.interrupted.load(Ordering::SeqCst) {
                self.remove_container(name, &record.paths());
                return Err(ServError::Interrupted {
                    name: record.name.clone(),
                });
            }
            if self.container_running(name) != Some(true) {
                self.remove_container(name, &record.paths());
                return Err(ServError::ProcessStartFailed {
                    name: record.name.clone(),
                    message: format!(
                        "container {name} exited before binding port {port}; see {}",
                        record.paths().log_file().display()
                    ),
                });
            }
            if port_is_bound(port) {
                break;
            }
            if Instant::now() >= deadline {
                self.remove_container(name, &record.paths());
                return Err(ServError::ProcessStartTimeout {
                    name: record.name.clone(),
                    port,
                    timeout_sec: record.timeouts.startup_seconds,
                });
            }
            thread::sleep(POLL_INTERVAL);
        }

        record.container_id = Some(container_id);
        record.transition(InstanceState::Running);
        self.registry.save(record)?;
        info!(instance = %record.name, container = name, port, "container running");
        Ok(())
    }

    /// Copy the container's output into the instance log, then remove it.
    fn remove_container(&self, name: &str, paths: &InstancePaths) {
        let cwd = Path::new(DOCKER_CWD);
        if let Ok(output) = execute(self.runner, "docker", &docker_args(&["logs", name]), cwd) {
            let log_path = paths.log_file();
            if ensure_parent(&log_path).is_ok() {
                if let Ok(mut log) = OpenOptions::new().create(true).append(true).open(&log_path) {
                    let _ = log.write_all(&output.stdout);
                    let _ = log.write_all(&output.stderr);
                }
            }
        }
        if let Err(err) = execute(self.runner, "docker", &docker_args(&["rm", "-f", name]), cwd) {
            warn!(container = name, error = %err, "unable to remove container");
        }
    }

    fn container_running(&self, name: &str) -> Option<bool> {
        let args = docker_args(&["inspect", "-f", "{{.State.Running}}", name]);
        execute(self.runner, "docker", &args, Path::new(DOCKER_CWD))
            .ok()
            .map(|output| output.stdout_text() == "true")
    }

    fn record_container(record: &InstanceRecord) -> String {
        match &record.launch {
            Some(Launch::Container { name, .. }) => name.clone(),
            _ => container_name(&record.name),
        }
    }

    fn mark_failed(&self, record: &mut InstanceRecord) {
        record.pid = None;
        record.transition(InstanceState::Failed);
        if let Err(err) = self.registry.save(record) {
            warn!(instance = %record.name, error = %err, "unable to record failed state");
        }
    }

    /// PID (or container) alive and, for processes, the HTTP port bound.
    pub fn is_live(&self, record: &InstanceRecord) -> bool {
        if record.runtime == RuntimeKind::Docker {
            let name = Self::record_container(record);
            return self.container_running(&name) == Some(true);
        }
        record.pid.map(pid_alive).unwrap_or(false) && port_is_bound(record.ports.http)
    }

    pub fn status(&self, name: &str) -> Result<InstanceStatus, ServError> {
        let record = self.registry.require(name)?;
        Ok(self.describe(&record))
    }

    pub fn list(&self) -> Result<Vec<InstanceStatus>, ServError> {
        Ok(self
            .registry
            .list()?
            .iter()
            .map(|record| self.describe(record))
            .collect())
    }

    fn describe(&self, record: &InstanceRecord) -> InstanceStatus {
        let live = self.is_live(record);
        let state = match (live, record.state) {
            (true, _) => InstanceState::Running,
            (false, InstanceState::Running) | (false, InstanceState::Stopping) => InstanceState::Stopped,
            (false, other) => other,
        };
        InstanceStatus {
            name: record.name.clone(),
            state,
            recorded_state: record.state,
            live,
            pid: record.pid,
            container_id: record.container_id.clone(),
            runtime: record.runtime,
            ports: record.ports,
            url: record.url(),
            project_dir: record.project_dir.clone(),
            environment: record.environment.clone(),
        }
    }

    pub fn stop(&self, name: &str, timeout: Option<u64>) -> Result<StopOutcome, ServError> {
        let mut record = self.registry.require(name)?;
        let timeout_sec = timeout.unwrap_or(record.timeouts.shutdown_seconds);
        let method = if record.runtime == RuntimeKind::Docker {
            self.stop_container(&mut record, timeout_sec)?
        } else {
            self.stop_process(&mut record, timeout_sec)?
        };
        Ok(StopOutcome {
            name: record.name.clone(),
            was_running: method != "none",
            method,
            state: record.state,
        })
    }

    fn settle_stopped(&self, record: &mut InstanceRecord) -> Result<(), ServError> {
        record.pid = None;
        if record.state != InstanceState::Stopped {
            record.transition(InstanceState::Stopped);
        }
        self.registry.save(record)
    }

    fn stop_process(&self, record: &mut InstanceRecord, timeout_sec: u64) -> Result<&'static str, ServError> {
        let Some(pid) = record.pid.filter(|pid| pid_alive(*pid)) else {
            self.settle_stopped(record)?;
            return Ok("none");
        };
        // A live PID with the port unbound is someone else's process now.
        if !self.is_live(record) {
            debug!(instance = %record.name, pid, "recorded pid no longer serves the instance; not signalling");
            self.settle_stopped(record)?;
            return Ok("none");
        }
        record.transition(InstanceState::Stopping);
        self.registry.save(record)?;

        let timeout = Duration::from_secs(timeout_sec);
        let handshake = capabilities_of(record.runtime).shutdown_handshake && send_shutdown(record.ports.shutdown);
        let mut method = if handshake { "handshake" } else { "sigterm" };
        if !handshake {
            signal_group(pid, Signal::SIGTERM);
        }
        let start = Instant::now();
        let term_at = if handshake { start + timeout / 2 } else { start };
        let kill_at = start + timeout;
        let mut term_sent = !handshake;
        while pid_alive(pid) {
            let now = Instant::now();
            if !term_sent && now >= term_at {
                debug!(instance = %record.name, pid, "shutdown handshake not honoured yet; sending SIGTERM");
                signal_group(pid, Signal::SIGTERM);
                term_sent = true;
            }
            if now >= kill_at {
                warn!(instance = %record.name, pid, "did not stop in time; sending SIGKILL");
                signal_group(pid, Signal::SIGKILL);
                method = "sigkill";
                let grace = Instant::now() + KILL_GRACE;
                while pid_alive(pid) && Instant::now() < grace {
                    thread::sleep(POLL_INTERVAL);
                }
                if pid_alive(pid) {
                    return Err(ServError::ProcessStopTimeout {
                        name: record.name.clone(),
                        pid,
                        timeout_sec,
                    });
                }
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        self.settle_stopped(record)?;
        info!(instance = %record.name, method, "instance stopped");
        Ok(method)
    }

    fn stop_container(&self, record: &mut InstanceRecord, timeout_sec: u64) -> Result<&'static str, ServError> {
        let name = Self::record_container(record);
        let cwd = Path::new(DOCKER_CWD);
        if self.container_running(&name) != Some(true) {
            record.container_id = None;
            self.settle_stopped(record)?;
            return Ok("none");
        }
        record.transition(InstanceState::Stopping);
        self.registry.save(record)?;
        let timeout = timeout_sec.to_string();
        execute(self.runner, "docker", &docker_args(&["stop", "-t", timeout.as_str(), name.as_str()]), cwd)?;
        if let Err(err) = execute(self.runner, "docker", &docker_args(&["rm", name.as_str()]), cwd) {
            debug!(container = %name, error = %err, "container already removed");
        }
        record.container_id = None;
        self.settle_stopped(record)?;
        Ok("container")
    }

    /// Stop every registered instance; failures are collected, never fatal.
    pub fn stop_all(&self, timeout: Option<u64>) -> Result<BulkSummary, ServError> {
        let records = self.registry.list()?;
        let mut results = Vec::with_capacity(records.len());
        for record in &records {
            match self.stop(&record.name, timeout) {
                Ok(outcome) => results.push(BulkItem {
                    name: record.name.clone(),
                    ok: true,
                    outcome: Some(outcome),
                    error: None,
                }),
                Err(err) => {
                    warn!(instance = %record.name, error = %err, "stop failed");
                    results.push(BulkItem {
                        name: record.name.clone(),
                        ok: false,
                        outcome: None,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        let failed = results.iter().filter(|item| !item.ok).count();
        Ok(BulkSummary {
            total: results.len(),
            failed,
            results,
        })
    }

    /// Stop, then re-spawn the recorded launch without resolving config again.
    pub fn restart(&self, name: &str) -> Result<StartOutcome, ServError> {
        let record = self.registry.require(name)?;
        let launch = record.launch.clone().ok_or_else(|| {
            ServError::Process(format!(
                "instance '{name}' has no recorded launch; run `servman start` first"
            ))
        })?;
        self.stop(name, None)?;
        let mut record = self.registry.require(name)?;
        record.transition(InstanceState::Starting);
        self.registry.save(&record)?;
        if let Err(err) = self.spawn(&mut record, launch) {
            self.mark_failed(&mut record);
            return Err(err);
        }
        Ok(outcome(&record, false, Vec::new()))
    }

    /// Instances that may be pruned (not live), and the names of live ones.
    pub fn prune_candidates(&self) -> Result<(Vec<InstanceRecord>, Vec<String>), ServError> {
        let mut prunable = Vec::new();
        let mut running = Vec::new();
        for record in self.registry.list()? {
            if self.is_live(&record) {
                running.push(record.name);
            } else {
                prunable.push(record);
            }
        }
        Ok((prunable, running))
    }

    pub fn prune(&self, records: &[InstanceRecord]) -> Result<Vec<String>, ServError> {
        let _guard = self.registry.lock()?;
        let mut removed = Vec::new();
        for record in records {
            if self.is_live(record) {
                warn!(instance = %record.name, "instance came up since listing; not pruned");
                continue;
            }
            if record.runtime == RuntimeKind::Docker {
                let name = Self::record_container(record);
                let _ = execute(self.runner, "docker", &docker_args(&["rm", "-f", name.as_str()]), Path::new(DOCKER_CWD));
            }
            if self.registry.remove(&record.name)? {
                removed.push(record.name.clone());
            }
        }
        Ok(removed)
    }
}

fn outcome(record: &InstanceRecord, already_running: bool, warnings: Vec<String>) -> StartOutcome {
    StartOutcome {
        name: record.name.clone(),
        state: record.state,
        already_running,
        pid: record.pid,
        container_id: record.container_id.clone(),
        ports: record.ports,
        url: record.url(),
        log_file: record.paths().log_file(),
        warnings,
    }
}

fn docker_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|part| part.to_string()).collect()
}

pub fn write_artifacts(paths: &InstancePaths, artifacts: &Artifacts) -> Result<(), ServError> {
    write_atomic_text(&paths.engine_config(), &artifacts.engine_config)?;
    write_atomic_text(&paths.web_xml(), &artifacts.web_xml)?;
    for (path, content) in [
        (paths.server_xml(), &artifacts.server_xml),
        (paths.rewrite_config(), &artifacts.rewrite_config),
    ] {
        match content {
            Some(content) => write_atomic_text(&path, content)?,
            None if path.exists() => fs::remove_file(&path)?,
            None => {}
        }
    }
    Ok(())
}

/// Liveness by signal 0. Exited children of this process are reaped first so
/// they do not read as alive.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    let pid = Pid::from_raw(raw);
    if let Ok(status) = waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        if status != WaitStatus::StillAlive {
            return false;
        }
    }
    match kill(pid, None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

fn signal_group(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let pid = Pid::from_raw(raw);
    if killpg(pid, signal).is_err() {
        let _ = kill(pid, signal);
    }
}

fn send_shutdown(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    match TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
        Ok(mut stream) => stream.write_all(SHUTDOWN_COMMAND).and_then(|_| stream.flush()).is_ok(),
        Err(_) => false,
    }
}

/// Last `lines` lines of the instance log.
pub fn tail_log(paths: &InstancePaths, lines: usize) -> Result<String, ServError> {
    let path = paths.log_file();
    if !path.exists() {
        return Ok(String::new());
    }
    let content = fs::read_to_string(&path)?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::Layout;
    use crate::ports::tests::FakeProbe;
    use crate::provider::tests::{effective_at, fake_catalina};
    use crate::registry::tests::sample_record;
    use crate::runner::tests::{failed, MockRunner};
    use crate::runner::CommandOutput;
    use serde_json::json;
    use std::net::TcpListener;
    use tempfile::{tempdir, TempDir};

    struct FakeKeystores;

    impl KeystoreGenerator for FakeKeystores {
        fn generate(&self, keystore: &Path, _password_file: &Path, _host: &str) -> Result<(), ServError> {
            fs::write(keystore, b"pkcs12")?;
            Ok(())
        }
    }

    struct Fixture {
        dir: TempDir,
        registry: Registry,
        runner: MockRunner,
        probe: FakeProbe,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let registry = Registry::new(Layout {
                home: dir.path().join("home"),
            });
            Self {
                dir,
                registry,
                runner: MockRunner::default(),
                probe: FakeProbe::default(),
            }
        }

        fn supervisor(&self) -> Supervisor<'_> {
            Supervisor::new(&self.registry, &self.runner, &self.probe, &FakeKeystores)
        }
    }

    fn unused_port() -> u16 {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    fn process_record(fx: &Fixture, name: &str, http: u16, startup: u64) -> InstanceRecord {
        let mut record = sample_record(
            fx.registry.layout(),
            name,
            &fx.dir.path().join(name),
            PortAssignment {
                http,
                shutdown: unused_port(),
                jmx: None,
                https: None,
            },
        );
        record.runtime = RuntimeKind::Jetty;
        record.timeouts.startup_seconds = startup;
        fx.registry.save(&record).unwrap();
        record
    }

    fn sleeper(fx: &Fixture) -> Launch {
        Launch::Process {
            program: "sleep".to_string(),
            args: vec!["30".to_string()],
            env: BTreeMap::new(),
            cwd: fx.dir.path().to_path_buf(),
        }
    }

    #[test]
    fn pid_is_recorded_only_after_the_port_binds_and_stop_terminates() {
        let fx = Fixture::new();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut record = process_record(&fx, "alpha", port, 5);
        let supervisor = fx.supervisor();

        supervisor.spawn(&mut record, sleeper(&fx)).unwrap();
        let stored = fx.registry.require("alpha").unwrap();
        assert_eq!(stored.state, InstanceState::Running);
        let pid = stored.pid.unwrap();
        assert!(pid_alive(pid));
        assert!(supervisor.status("alpha").unwrap().live);

        let stopped = supervisor.stop("alpha", Some(5)).unwrap();
        assert_eq!(stopped.method, "sigterm");
        assert!(!pid_alive(pid));
        let stored = fx.registry.require("alpha").unwrap();
        assert_eq!(stored.state, InstanceState::Stopped);
        assert_eq!(stored.pid, None);
        drop(listener);
    }

    #[test]
    fn bind_timeout_kills_the_child() {
        let fx = Fixture::new();
        let mut record = process_record(&fx, "slow", unused_port(), 1);
        let err = fx.supervisor().spawn(&mut record, sleeper(&fx)).unwrap_err();
        assert!(matches!(err, ServError::ProcessStartTimeout { timeout_sec: 1, .. }));
        assert_eq!(record.pid, None);
    }

    #[test]
    fn early_exit_is_a_start_failure() {
        let fx = Fixture::new();
        let mut record = process_record(&fx, "crash", unused_port(), 5);
        let launch = Launch::Process {
            program: "false".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: fx.dir.path().to_path_buf(),
        };
        let err = fx.supervisor().spawn(&mut record, launch).unwrap_err();
        assert!(matches!(err, ServError::ProcessStartFailed { .. }));
    }

    #[test]
    fn interrupt_during_bind_wait_kills_the_child() {
        let fx = Fixture::new();
        let mut record = process_record(&fx, "cancel", unused_port(), 30);
        let supervisor = fx.supervisor();
        supervisor.interrupted.store(true, Ordering::SeqCst);
        let err = supervisor.spawn(&mut record, sleeper(&fx)).unwrap_err();
        assert!(matches!(err, ServError::Interrupted { .. }));
    }

    #[test]
    fn stop_leaves_a_reused_pid_alone_when_the_port_is_unbound() {
        let fx = Fixture::new();
        let mut stranger = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let mut record = process_record(&fx, "reused", unused_port(), 5);
        record.pid = Some(stranger.id());
        record.state = InstanceState::Running;
        fx.registry.save(&record).unwrap();

        let outcome = fx.supervisor().stop("reused", Some(1)).unwrap();
        assert_eq!(outcome.method, "none");
        assert!(!outcome.was_running);
        let stored = fx.registry.require("reused").unwrap();
        assert_eq!(stored.state, InstanceState::Stopped);
        assert_eq!(stored.pid, None);
        assert!(stranger.try_wait().unwrap().is_none());

        stranger.kill().unwrap();
        stranger.wait().unwrap();
    }

    #[test]
    fn interrupts_are_armed_before_the_child_exists() {
        let fx = Fixture::new();
        let mut record = process_record(&fx, "missing", unused_port(), 5);
        let supervisor = fx.supervisor();
        let launch = Launch::Process {
            program: "servman-no-such-program".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: fx.dir.path().to_path_buf(),
        };
        let err = supervisor.spawn(&mut record, launch).unwrap_err();
        assert!(matches!(err, ServError::ProcessStartFailed { .. }));
        assert!(supervisor.armed.get());
    }

    #[test]
    fn interrupt_before_container_bind_removes_the_container() {
        let fx = Fixture::new();
        let mut record = process_record(&fx, "boxed", unused_port(), 30);
        record.runtime = RuntimeKind::Docker;
        for stdout in [Vec::new(), b"abc123\n".to_vec()] {
            fx.runner.push_output(CommandOutput {
                status_code: 0,
                stdout,
                stderr: Vec::new(),
            });
        }
        let supervisor = fx.supervisor();
        supervisor.interrupted.store(true, Ordering::SeqCst);
        let launch = Launch::Container {
            name: "servman-boxed".to_string(),
            run_args: vec!["run".to_string(), "-d".to_string(), "engine:6".to_string()],
        };
        let err = supervisor.spawn(&mut record, launch).unwrap_err();
        assert!(matches!(err, ServError::Interrupted { .. }));
        assert!(supervisor.armed.get());
        let calls = fx.runner.calls();
        let tail: Vec<&str> = calls[calls.len() - 2..]
            .iter()
            .map(|call| call.args[0].as_str())
            .collect();
        assert_eq!(tail, vec!["logs", "rm"]);
        assert_eq!(calls.last().unwrap().args, vec!["rm", "-f", "servman-boxed"]);
    }

    #[test]
    fn busy_http_port_is_a_conflict_before_spawn() {
        let mut fx = Fixture::new();
        let port = unused_port();
        fx.probe.busy.insert(port);
        let mut record = process_record(&fx, "busy", port, 5);
        let err = fx.supervisor().spawn(&mut record, sleeper(&fx)).unwrap_err();
        assert!(matches!(err, ServError::PortConflict { port: p, .. } if p == port));
    }

    #[test]
    fn stop_all_reports_every_failure_without_aborting() {
        let fx = Fixture::new();
        let mut stale = process_record(&fx, "alpha", unused_port(), 5);
        stale.state = InstanceState::Running;
        stale.pid = None;
        fx.registry.save(&stale).unwrap();
        let mut docker = process_record(&fx, "beta", unused_port(), 5);
        docker.runtime = RuntimeKind::Docker;
        docker.state = InstanceState::Running;
        fx.registry.save(&docker).unwrap();
        let _ = process_record(&fx, "gamma", unused_port(), 5);

        fx.runner.push_output(CommandOutput {
            status_code: 0,
            stdout: b"true\n".to_vec(),
            stderr: Vec::new(),
        });
        fx.runner.push_output(failed("Cannot connect to the Docker daemon. Is the docker daemon running?"));

        let summary = fx.supervisor().stop_all(Some(1)).unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.failed, 1);
        let beta = summary.results.iter().find(|item| item.name == "beta").unwrap();
        assert!(!beta.ok);
        assert!(beta.error.as_deref().unwrap().contains("Hint"));
        let gamma = summary.results.iter().find(|item| item.name == "gamma").unwrap();
        assert!(gamma.ok);
        assert_eq!(
            fx.registry.require("alpha").unwrap().state,
            InstanceState::Stopped
        );
    }

    #[test]
    fn container_start_records_the_container_id() {
        let fx = Fixture::new();
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut record = process_record(&fx, "boxed", port, 5);
        record.runtime = RuntimeKind::Docker;
        fx.runner.push_output(CommandOutput {
            status_code: 0,
            stdout: Vec::new(),
            stderr: Vec::new(),
        });
        fx.runner.push_output(CommandOutput {
            status_code: 0,
            stdout: b"abc123\n".to_vec(),
            stderr: Vec::new(),
        });
        fx.runner.push_output(CommandOutput {
            status_code: 0,
            stdout: b"true\n".to_vec(),
            stderr: Vec::new(),
        });
        let launch = Launch::Container {
            name: "servman-boxed".to_string(),
            run_args: vec!["run".to_string(), "-d".to_string(), "engine:6".to_string()],
        };
        fx.supervisor().spawn(&mut record, launch).unwrap();
        assert_eq!(record.container_id.as_deref(), Some("abc123"));
        assert_eq!(record.state, InstanceState::Running);
        let calls = fx.runner.calls();
        assert_eq!(calls[0].args, vec!["rm", "-f", "servman-boxed"]);
        assert_eq!(calls[1].args[0], "run");
        drop(listener);
    }

    #[test]
    fn claim_writes_a_starting_record_and_skips_stopped_ports() {
        let fx = Fixture::new();
        let first_dir = fx.dir.path().join("first");
        let second_dir = fx.dir.path().join("second");
        fs::create_dir_all(&first_dir).unwrap();
        fs::create_dir_all(&second_dir).unwrap();
        let supervisor = fx.supervisor();

        let first = effective_at(&first_dir, json!({"port": 8080}));
        let Claim::Starting(mut record) = supervisor.claim(&first, RuntimeKind::Embedded).unwrap() else {
            panic!("expected a fresh claim");
        };
        assert_eq!((record.ports.http, record.ports.shutdown), (8080, 9080));
        assert_eq!(record.pid, None);
        assert_eq!(
            fx.registry.require("first").unwrap().state,
            InstanceState::Starting
        );
        record.transition(InstanceState::Stopped);
        fx.registry.save(&record).unwrap();

        let second = effective_at(&second_dir, json!({"port": 8080}));
        let Claim::Starting(other) = supervisor.claim(&second, RuntimeKind::Embedded).unwrap() else {
            panic!("expected a fresh claim");
        };
        assert_eq!((other.ports.http, other.ports.shutdown), (8081, 9081));

        // Re-claiming the first project keeps its own ports.
        let Claim::Starting(again) = supervisor.claim(&first, RuntimeKind::Embedded).unwrap() else {
            panic!("expected a fresh claim");
        };
        assert_eq!(again.ports.http, 8080);
        assert_eq!(again.created_at, record.created_at);
    }

    #[test]
    fn materialize_writes_artifacts_and_keystore() {
        let fx = Fixture::new();
        let project = fx.dir.path().join("shop");
        fs::create_dir_all(&project).unwrap();
        let cfg = effective_at(
            &project,
            json!({"tlsConfig": {"enabled": true}, "urlRewrite": {"enabled": true}}),
        );
        fake_catalina(&fx.registry.layout().embedded_runtime_dir(&cfg.settings.version), 10);
        let supervisor = fx.supervisor();
        let provider = Provider::from_config(&cfg).unwrap();
        let home = provider
            .prepare(fx.registry.layout(), &cfg, &fx.runner)
            .unwrap();
        let Claim::Starting(record) = supervisor.claim(&cfg, provider.kind()).unwrap() else {
            panic!("expected a fresh claim");
        };
        assert_eq!(record.ports.https, Some(8443));

        let launch = supervisor.materialize(&provider, &cfg, &home, &record).unwrap();
        let paths = record.paths();
        let server_xml = fs::read_to_string(paths.server_xml()).unwrap();
        assert!(server_xml.contains(r#"<Server port="9080""#));
        assert!(server_xml.contains(r#"port="8443""#));
        assert!(paths.web_xml().is_file());
        assert!(paths.rewrite_config().is_file());
        assert!(paths.engine_config().is_file());
        assert!(paths.certs_dir().join(crate::certs::KEYSTORE_FILE).is_file());
        assert!(launch.describe().contains("org.apache.catalina.startup.Bootstrap"));
    }

    #[test]
    fn same_named_projects_get_distinct_containers() {
        let fx = Fixture::new();
        let supervisor = fx.supervisor();
        let mut containers = Vec::new();
        for parent in ["one", "two"] {
            let project = fx.dir.path().join(parent).join("shop");
            fs::create_dir_all(&project).unwrap();
            let cfg = effective_at(
                &project,
                json!({"name": "shop", "runtime": {"type": "docker", "providerOptions": {"image": "engine:6"}}}),
            );
            let provider = Provider::from_config(&cfg).unwrap();
            let home = provider
                .prepare(fx.registry.layout(), &cfg, &fx.runner)
                .unwrap();
            let Claim::Starting(record) = supervisor.claim(&cfg, provider.kind()).unwrap() else {
                panic!("expected a fresh claim");
            };
            let Launch::Container { name, .. } = supervisor.materialize(&provider, &cfg, &home, &record).unwrap() else {
                panic!("expected a container launch");
            };
            containers.push((record.name, name));
        }
        assert_eq!(containers[0], ("shop".to_string(), "servman-shop".to_string()));
        assert_eq!(containers[1], ("shop-2".to_string(), "servman-shop-2".to_string()));
        assert_ne!(containers[0].1, containers[1].1);
    }

    #[test]
    fn tail_log_returns_the_last_lines() {
        let dir = tempdir().unwrap();
        let paths = InstancePaths::new(dir.path().to_path_buf());
        fs::create_dir_all(paths.log_file().parent().unwrap()).unwrap();
        fs::write(paths.log_file(), "one\ntwo\nthree\n").unwrap();
        assert_eq!(tail_log(&paths, 2).unwrap(), "two\nthree");
        assert_eq!(tail_log(&paths, 10).unwrap(), "one\ntwo\nthree");
    }
}
