use crate::certs::{plan_keystore, KeystorePlan};
use crate::config::Resolved;
use crate::error::ServError;
use crate::lock::LockManager;
use crate::patch::{self, Templates};
use crate::ports::{PortAllocator, PortProbe};
use crate::provider::Provider;
use crate::registry::{PortAssignment, Registry};
use crate::supervisor::pid_alive;
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Artifact selectable for a dry-run preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PreviewKind {
    Engine,
    Server,
    Web,
    Keystore,
    Redirect,
    All,
}

impl PreviewKind {
    fn selected(kinds: &[PreviewKind], kind: PreviewKind) -> bool {
        kinds.is_empty() || kinds.contains(&PreviewKind::All) || kinds.contains(&kind)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RedirectPlan {
    pub enabled: bool,
    pub http_port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_guarantee: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub instance_dir: PathBuf,
    pub ports: PortAssignment,
    pub runtime: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_xml: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_xml: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewrite_config: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keystore: Option<KeystorePlan>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect: Option<RedirectPlan>,
    pub warnings: Vec<String>,
}

/// Everything `start` would produce, computed without touching disk.
///
/// Ports are assigned without taking the registry lock, so a concurrent
/// start may end up with different ones.
pub fn preview(
    registry: &Registry,
    probe: &dyn PortProbe,
    config_path: &Path,
    environment: Option<&str>,
    kinds: &[PreviewKind],
) -> Result<Preview, ServError> {
    let Resolved {
        config: mut cfg,
        mut warnings,
    } = LockManager::new(config_path).resolve_for_start(environment)?;
    let provider = Provider::from_config(&cfg)?;
    warnings.extend(provider.degrade(&mut cfg));

    let name = registry.claim_name(&cfg.name, &cfg.project_dir)?;
    let running = registry
        .load(&name)?
        .filter(|record| record.pid.map(pid_alive).unwrap_or(false));
    let ports = match running {
        Some(record) => {
            warnings.push(format!(
                "instance '{name}' is already running; start would leave it untouched"
            ));
            record.ports
        }
        None => {
            let avoid = registry.avoid_set(Some(&name))?;
            PortAllocator::new(probe, avoid).assign(&cfg)?
        }
    };
    debug!(instance = %name, ports = ?ports, "preview ports");

    let paths = registry.instance_paths(&name);
    let vendor_conf = provider
        .existing_home(registry.layout(), &cfg)
        .map(|dir| dir.join("conf"));
    let templates = Templates::load(vendor_conf.as_deref(), Some(&paths.rewrite_config()))?;
    let artifacts = patch::render(
        &templates,
        &cfg,
        &ports,
        &provider.patch_target(&cfg, &paths),
        provider.capabilities(),
    )?;

    let want = |kind| PreviewKind::selected(kinds, kind);
    let redirect_on = cfg.tls_enabled() && cfg.settings.tls_config.redirect;
    Ok(Preview {
        runtime: provider.plan(registry.layout(), &cfg),
        engine_config: want(PreviewKind::Engine).then(|| cfg.engine_config.clone()),
        server_xml: if want(PreviewKind::Server) {
            artifacts.server_xml
        } else {
            None
        },
        web_xml: want(PreviewKind::Web).then_some(artifacts.web_xml),
        rewrite_config: if want(PreviewKind::Server) {
            artifacts.rewrite_config
        } else {
            None
        },
        keystore: (want(PreviewKind::Keystore) && cfg.tls_enabled())
            .then(|| plan_keystore(&paths, &cfg.settings.host)),
        redirect: want(PreviewKind::Redirect).then(|| RedirectPlan {
            enabled: redirect_on,
            http_port: ports.http,
            https_port: ports.https,
            transport_guarantee: redirect_on.then_some("CONFIDENTIAL"),
        }),
        name,
        environment: cfg.environment.clone(),
        instance_dir: paths.root,
        ports,
        warnings,
    })
}
