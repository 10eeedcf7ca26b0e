use crate::error::ServError;
use crate::jsonc;
use crate::merge::deep_merge;
use crate::paths::{absolutize, config_dir_from_path, sanitize_name};
use crate::vars::Variables;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_ENGINE_VERSION: &str = "6.2.2.91";
pub const DEFAULT_ENV_KEY: &str = "_default";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct InstanceConfig {
    pub name: Option<String>,
    pub version: String,
    #[serde(deserialize_with = "port_value")]
    pub port: u16,
    #[serde(deserialize_with = "optional_port_value", skip_serializing_if = "Option::is_none")]
    pub shutdown_port: Option<u16>,
    pub webroot: String,
    pub host: String,
    pub monitoring: Monitoring,
    pub jvm: Jvm,
    pub url_rewrite: UrlRewrite,
    pub admin: Toggle,
    pub rest: Toggle,
    pub tls_config: TlsConfig,
    pub script_engine_enabled: bool,
    pub agents: BTreeMap<String, Agent>,
    pub runtime: RuntimeSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedded_config: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedded_config_file: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment_overrides: BTreeMap<String, Value>,
    pub startup_timeout_seconds: u64,
    pub shutdown_timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Monitoring {
    pub enabled: bool,
    #[serde(deserialize_with = "optional_port_value", skip_serializing_if = "Option::is_none")]
    pub jmx_port: Option<u16>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Jvm {
    pub max_memory: String,
    pub min_memory: String,
    pub additional_args: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct UrlRewrite {
    pub enabled: bool,
    pub router_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Toggle {
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct TlsConfig {
    pub enabled: bool,
    #[serde(deserialize_with = "optional_port_value", skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub redirect: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct Agent {
    pub enabled: bool,
    pub jvm_args: Vec<String>,
    pub description: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RuntimeKind {
    #[default]
    Embedded,
    External,
    Docker,
    Jetty,
}

impl RuntimeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedded => "embedded",
            Self::External => "external",
            Self::Docker => "docker",
            Self::Jetty => "jetty",
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct RuntimeSettings {
    #[serde(rename = "type")]
    pub kind: RuntimeKind,
    pub provider_options: Map<String, Value>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            name: None,
            version: DEFAULT_ENGINE_VERSION.to_string(),
            port: 8080,
            shutdown_port: None,
            webroot: "./".to_string(),
            host: "localhost".to_string(),
            monitoring: Monitoring::default(),
            jvm: Jvm::default(),
            url_rewrite: UrlRewrite::default(),
            admin: Toggle::default(),
            rest: Toggle::default(),
            tls_config: TlsConfig::default(),
            script_engine_enabled: true,
            agents: BTreeMap::new(),
            runtime: RuntimeSettings::default(),
            embedded_config: None,
            embedded_config_file: None,
            environment_overrides: BTreeMap::new(),
            startup_timeout_seconds: 60,
            shutdown_timeout_seconds: 20,
        }
    }
}

impl Default for Monitoring {
    fn default() -> Self {
        Self {
            enabled: false,
            jmx_port: None,
        }
    }
}

impl Default for Jvm {
    fn default() -> Self {
        Self {
            max_memory: "512m".to_string(),
            min_memory: "256m".to_string(),
            additional_args: Vec::new(),
        }
    }
}

impl Default for UrlRewrite {
    fn default() -> Self {
        Self {
            enabled: false,
            router_file: "index.cfm".to_string(),
        }
    }
}

impl Default for Toggle {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortRepr {
    Number(u64),
    Text(String),
}

fn port_from_repr(repr: PortRepr) -> Result<u16, String> {
    let raw = match repr {
        PortRepr::Number(n) => n,
        PortRepr::Text(text) => text
            .trim()
            .parse::<u64>()
            .map_err(|_| format!("invalid port '{text}'"))?,
    };
    match u16::try_from(raw) {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(format!("port {raw} is out of range (1-65535)")),
    }
}

fn port_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u16, D::Error> {
    port_from_repr(PortRepr::deserialize(deserializer)?).map_err(serde::de::Error::custom)
}

fn optional_port_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u16>, D::Error> {
    match Option::<PortRepr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(repr) => port_from_repr(repr).map(Some).map_err(serde::de::Error::custom),
    }
}

/// Fully resolved configuration for one instance at one point in time.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveConfig {
    pub name: String,
    pub project_dir: PathBuf,
    pub config_file: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub settings: InstanceConfig,
    pub engine_config: Value,
}

impl EffectiveConfig {
    /// Absolute path of the document root.
    pub fn webroot_path(&self) -> PathBuf {
        let raw = Path::new(&self.settings.webroot);
        if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.project_dir.join(raw)
        }
    }

    pub fn jmx_enabled(&self) -> bool {
        self.settings.monitoring.enabled
    }

    pub fn tls_enabled(&self) -> bool {
        self.settings.tls_config.enabled
    }
}

/// Result of a resolution: the config plus any non-fatal warnings.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub config: EffectiveConfig,
    pub warnings: Vec<String>,
}

pub fn env_key(environment: Option<&str>) -> String {
    environment.unwrap_or(DEFAULT_ENV_KEY).to_string()
}

/// Read and parse the raw config document. Always hits the filesystem.
pub fn read_raw(path: &Path) -> Result<(Vec<u8>, Value), ServError> {
    let bytes = fs::read(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ServError::Config(format!("config file not found: {}", path.display()))
        } else {
            ServError::Io(err)
        }
    })?;
    let text = std::str::from_utf8(&bytes).map_err(|err| {
        let valid = &bytes[..err.valid_up_to()];
        let line = valid.iter().filter(|byte| **byte == b'\n').count() + 1;
        let line_start = valid.iter().rposition(|byte| *byte == b'\n').map_or(0, |idx| idx + 1);
        ServError::ConfigParse {
            path: path.to_path_buf(),
            line,
            column: String::from_utf8_lossy(&valid[line_start..]).chars().count() + 1,
            message: "invalid UTF-8".to_string(),
        }
    })?;
    let value = jsonc::parse(path, text)?;
    if !value.is_object() {
        return Err(ServError::Config(format!(
            "{} must contain a JSON object",
            path.display()
        )));
    }
    Ok((bytes, value))
}

pub fn resolve(path: &Path, environment: Option<&str>) -> Result<Resolved, ServError> {
    let path = absolutize(path);
    let project_dir = config_dir_from_path(&path);
    let (_, raw) = read_raw(&path)?;
    let vars = Variables::load(&project_dir);
    resolve_document(&path, &project_dir, &raw, environment, &vars)
}

pub fn resolve_document(
    path: &Path,
    project_dir: &Path,
    raw: &Value,
    environment: Option<&str>,
    vars: &Variables,
) -> Result<Resolved, ServError> {
    let mut unresolved: Vec<String> = Vec::new();
    let mut document = raw.clone();

    let embedded = merged_embedded_config(path, project_dir, &document, vars, &mut unresolved)?;
    if let (Some(embedded), Value::Object(map)) = (embedded, &mut document) {
        map.insert("embeddedConfig".to_string(), embedded);
    }

    if let Some(env_name) = environment {
        let overrides = document
            .get("environmentOverrides")
            .and_then(|all| all.get(env_name))
            .cloned();
        let Some(overrides) = overrides else {
            let defined: Vec<String> = document
                .get("environmentOverrides")
                .and_then(Value::as_object)
                .map(|map| map.keys().cloned().collect())
                .unwrap_or_default();
            return Err(ServError::Config(format!(
                "environment '{env_name}' is not defined in environmentOverrides (defined: {})",
                if defined.is_empty() {
                    "none".to_string()
                } else {
                    defined.join(", ")
                }
            )));
        };
        if !overrides.is_object() {
            return Err(ServError::Config(format!(
                "environmentOverrides.{env_name} must be an object"
            )));
        }
        debug!(environment = env_name, "applying environment override");
        document = deep_merge(&document, &overrides);
    }

    if let Value::Object(map) = &mut document {
        map.remove("environmentOverrides");
        map.remove("embeddedConfigFile");
    }
    let document = vars.substitute_document(&document, &mut unresolved);

    let mut settings: InstanceConfig = serde_json::from_value(document).map_err(|err| {
        ServError::Config(format!("{}: {}", path.display(), err))
    })?;
    validate(&settings)?;

    let engine_config = settings
        .embedded_config
        .take()
        .unwrap_or_else(|| Value::Object(Map::new()));
    let name = match settings.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => sanitize_name(name),
        _ => sanitize_name(
            &project_dir
                .file_name()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
        ),
    };
    settings.name = Some(name.clone());

    let mut warnings = Vec::new();
    for var in unresolved {
        let message = format!("variable '{var}' is not defined in .env or the environment; left unresolved");
        warn!("{message}");
        warnings.push(message);
    }

    Ok(Resolved {
        config: EffectiveConfig {
            name,
            project_dir: project_dir.to_path_buf(),
            config_file: path.to_path_buf(),
            environment: environment.map(str::to_string),
            settings,
            engine_config,
        },
        warnings,
    })
}

/// Base-then-override merge of `embeddedConfigFile` and inline `embeddedConfig`.
fn merged_embedded_config(
    path: &Path,
    project_dir: &Path,
    document: &Value,
    vars: &Variables,
    unresolved: &mut Vec<String>,
) -> Result<Option<Value>, ServError> {
    let inline = document.get("embeddedConfig").cloned();
    let file_ref = match document.get("embeddedConfigFile") {
        None | Some(Value::Null) => None,
        Some(Value::String(raw)) => Some(vars.substitute_str(raw, true, unresolved)),
        Some(_) => {
            return Err(ServError::Config(format!(
                "{}: embeddedConfigFile must be a string path",
                path.display()
            )))
        }
    };
    let Some(file_ref) = file_ref else {
        return Ok(inline);
    };
    let file_path = {
        let candidate = PathBuf::from(&file_ref);
        if candidate.is_absolute() {
            candidate
        } else {
            project_dir.join(candidate)
        }
    };
    let text = fs::read_to_string(&file_path).map_err(|err| {
        ServError::Config(format!(
            "unable to read embeddedConfigFile {}: {}",
            file_path.display(),
            err
        ))
    })?;
    let base = jsonc::parse(&file_path, &text)?;
    Ok(Some(match inline {
        Some(inline) => deep_merge(&base, &inline),
        None => base,
    }))
}

fn validate_memory(field: &str, value: &str) -> Result<(), ServError> {
    let trimmed = value.trim();
    let digits = trimmed.trim_end_matches(['k', 'K', 'm', 'M', 'g', 'G']);
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ServError::Config(format!(
            "jvm.{field} must look like 512m or 2g (got '{value}')"
        )));
    }
    Ok(())
}

fn validate(cfg: &InstanceConfig) -> Result<(), ServError> {
    if cfg.version.trim().is_empty() {
        return Err(ServError::Config("version must be non-empty".to_string()));
    }
    if cfg.webroot.trim().is_empty() {
        return Err(ServError::Config("webroot must be non-empty".to_string()));
    }
    validate_memory("maxMemory", &cfg.jvm.max_memory)?;
    validate_memory("minMemory", &cfg.jvm.min_memory)?;
    if let Some(shutdown) = cfg.shutdown_port {
        if shutdown == cfg.port {
            return Err(ServError::Config(format!(
                "shutdownPort {shutdown} must differ from port"
            )));
        }
    }
    if let Some(tls_port) = cfg.tls_config.port {
        if tls_port == cfg.port {
            return Err(ServError::Config(format!(
                "tlsConfig.port {tls_port} must differ from port"
            )));
        }
    }
    if cfg.url_rewrite.enabled && cfg.url_rewrite.router_file.trim().is_empty() {
        return Err(ServError::Config(
            "urlRewrite.routerFile must be non-empty when urlRewrite is enabled".to_string(),
        ));
    }
    if cfg.startup_timeout_seconds == 0 {
        return Err(ServError::Config(
            "startupTimeoutSeconds must be greater than 0".to_string(),
        ));
    }
    for (id, agent) in &cfg.agents {
        if agent.enabled && agent.jvm_args.is_empty() {
            return Err(ServError::Config(format!(
                "agents.{id} is enabled but has no jvmArgs"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn no_vars() -> Variables {
        Variables::from_maps(BTreeMap::new(), BTreeMap::new())
    }

    fn resolve_value(raw: Value, environment: Option<&str>) -> Result<Resolved, ServError> {
        let dir = Path::new("/projects/demo-app");
        resolve_document(&dir.join("servman.json"), dir, &raw, environment, &no_vars())
    }

    #[test]
    fn defaults_fill_a_minimal_config() {
        let resolved = resolve_value(json!({}), None).unwrap();
        let cfg = &resolved.config;
        assert_eq!(cfg.name, "demo-app");
        assert_eq!(cfg.settings.port, 8080);
        assert_eq!(cfg.settings.shutdown_port, None);
        assert_eq!(cfg.settings.jvm.max_memory, "512m");
        assert!(cfg.settings.script_engine_enabled);
        assert!(cfg.settings.admin.enabled);
        assert_eq!(cfg.settings.runtime.kind, RuntimeKind::Embedded);
        assert_eq!(cfg.engine_config, json!({}));
    }

    #[test]
    fn partial_sections_keep_their_other_defaults() {
        let resolved = resolve_value(json!({"jvm": {"maxMemory": "2g"}}), None).unwrap();
        assert_eq!(resolved.config.settings.jvm.max_memory, "2g");
        assert_eq!(resolved.config.settings.jvm.min_memory, "256m");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = resolve_value(json!({"prot": 8080}), None).unwrap_err();
        assert!(err.to_string().contains("prot"));
    }

    #[test]
    fn environment_override_merges_onto_base() {
        let raw = json!({
            "port": 8080,
            "jvm": {"maxMemory": "1g", "minMemory": "512m"},
            "environmentOverrides": {
                "prod": {"jvm": {"maxMemory": "4g"}, "admin": {"enabled": false}}
            }
        });
        let resolved = resolve_value(raw, Some("prod")).unwrap();
        let settings = &resolved.config.settings;
        assert_eq!(settings.port, 8080);
        assert_eq!(settings.jvm.max_memory, "4g");
        assert_eq!(settings.jvm.min_memory, "512m");
        assert!(!settings.admin.enabled);
        assert!(settings.environment_overrides.is_empty());
        assert_eq!(resolved.config.environment.as_deref(), Some("prod"));
    }

    #[test]
    fn unknown_environment_lists_defined_ones() {
        let raw = json!({"environmentOverrides": {"dev": {}, "prod": {}}});
        let err = resolve_value(raw, Some("staging")).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("staging"));
        assert!(message.contains("dev, prod"));
    }

    #[test]
    fn embedded_file_is_base_and_inline_overrides() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("engine.json"),
            r#"{ // base
  "mappings": {"/app": "/srv/app"},
  "mode": "single",
  "list": [1, 2]
}"#,
        )
        .unwrap();
        let raw = json!({
            "embeddedConfigFile": "engine.json",
            "embeddedConfig": {"mode": "multi", "list": [3]},
            "environmentOverrides": {"prod": {"embeddedConfig": {"debug": false}}}
        });
        let resolved = resolve_document(
            &dir.path().join("servman.json"),
            dir.path(),
            &raw,
            Some("prod"),
            &no_vars(),
        )
        .unwrap();
        assert_eq!(
            resolved.config.engine_config,
            json!({"mappings": {"/app": "/srv/app"}, "mode": "multi", "list": [3], "debug": false})
        );
    }

    #[test]
    fn variables_resolve_in_ports_and_stay_in_engine_config() {
        let vars = Variables::from_maps(
            BTreeMap::from([("HTTP_PORT".to_string(), "8181".to_string())]),
            BTreeMap::new(),
        );
        let raw = json!({
            "port": "#env:HTTP_PORT#",
            "shutdownPort": "${SHUTDOWN:-9191}",
            "embeddedConfig": {"dsn": "${DB_URL}"}
        });
        let dir = Path::new("/projects/vars");
        let resolved =
            resolve_document(&dir.join("servman.json"), dir, &raw, None, &vars).unwrap();
        assert_eq!(resolved.config.settings.port, 8181);
        assert_eq!(resolved.config.settings.shutdown_port, Some(9191));
        assert_eq!(resolved.config.engine_config, json!({"dsn": "${DB_URL}"}));
        assert!(resolved.warnings.is_empty());
    }

    #[test]
    fn unresolved_variables_produce_warnings() {
        let resolved = resolve_value(json!({"host": "${APP_HOST}"}), None).unwrap();
        assert_eq!(resolved.config.settings.host, "${APP_HOST}");
        assert_eq!(resolved.warnings.len(), 1);
        assert!(resolved.warnings[0].contains("APP_HOST"));
    }

    #[test]
    fn resolve_rereads_the_file_each_time() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("servman.json");
        fs::write(&path, r#"{"port": 8080, "environmentOverrides": {"prod": {}}}"#).unwrap();
        let first = resolve(&path, Some("prod")).unwrap();
        fs::write(&path, r#"{"port": 9090, "environmentOverrides": {"prod": {}}}"#).unwrap();
        let second = resolve(&path, Some("prod")).unwrap();
        assert_eq!(first.config.settings.port, 8080);
        assert_eq!(second.config.settings.port, 9090);
    }

    #[test]
    fn invalid_memory_is_a_config_error() {
        let err = resolve_value(json!({"jvm": {"maxMemory": "lots"}}), None).unwrap_err();
        assert!(matches!(err, ServError::Config(_)));
    }

    #[test]
    fn runtime_type_is_a_discriminator() {
        let resolved = resolve_value(
            json!({"runtime": {"type": "docker", "providerOptions": {"image": "engine:6"}}}),
            None,
        )
        .unwrap();
        assert_eq!(resolved.config.settings.runtime.kind, RuntimeKind::Docker);
        assert_eq!(
            resolved.config.settings.runtime.provider_options["image"],
            json!("engine:6")
        );
    }

    #[test]
    fn non_utf8_config_is_a_parse_error_with_position() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("servman.json");
        fs::write(&path, b"{\n  \"host\": \"\xff\"\n}\n").unwrap();
        match read_raw(&path).unwrap_err() {
            ServError::ConfigParse { line, column, message, .. } => {
                assert_eq!((line, column), (2, 12));
                assert_eq!(message, "invalid UTF-8");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
