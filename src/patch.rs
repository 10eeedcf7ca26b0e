//! Artifact patching. Every function here is pure: template text in,
//! patched text out. Each toggle is an "ensure" over the parsed tree keyed by
//! a discriminating attribute or name, so re-patching updates in place.

use crate::config::EffectiveConfig;
use crate::error::ServError;
use crate::provider::{Capabilities, PatchTarget};
use crate::registry::PortAssignment;
use crate::xml::{Document, Element};
use serde::Serialize;
use std::fs;
use std::path::Path;

const SERVER_XML_TEMPLATE: &str = include_str!("../templates/server.xml");
const WEB_XML_TEMPLATE: &str = include_str!("../templates/web.xml");
const REWRITE_TEMPLATE: &str = include_str!("../templates/rewrite.config");

const HTTPS_PROTOCOLS: &str = "TLSv1.2+TLSv1.3";
const REWRITE_VALVE: &str = "org.apache.catalina.valves.rewrite.RewriteValve";

const ENGINE_SERVLET: &str = "CFMLServlet";
const ENGINE_SERVLET_CLASS: &str = "lucee.loader.servlet.jakarta.CFMLServlet";
const ENGINE_PATTERNS: &[&str] = &["*.cfm", "*.cfml", "*.cfc", "/index.cfm/*"];
const REST_SERVLET: &str = "RESTServlet";
const REST_SERVLET_CLASS: &str = "lucee.loader.servlet.jakarta.RestServlet";
const REST_PATTERN: &str = "/rest/*";
const ADMIN_PATTERN: &str = "/lucee/*";
const ADMIN_DENY_PATTERN: &str = "/lucee/admin/*";

const CONFIG_CONSTRAINT: &str = "servman-config-files";
const ADMIN_CONSTRAINT: &str = "servman-admin-deny";
const REDIRECT_CONSTRAINT: &str = "servman-https-redirect";
const PROTECTED_FILES: &[&str] = &["/servman.json", "/servman-lock.json", "/.env"];

const REWRITE_BEGIN: &str = "# BEGIN servman managed rules";
const REWRITE_END: &str = "# END servman managed rules";

/// Vendor templates an instance is patched from.
#[derive(Debug, Clone)]
pub struct Templates {
    pub server_xml: String,
    pub web_xml: String,
    pub rewrite_config: String,
}

impl Templates {
    pub fn bundled() -> Self {
        Self {
            server_xml: SERVER_XML_TEMPLATE.to_string(),
            web_xml: WEB_XML_TEMPLATE.to_string(),
            rewrite_config: REWRITE_TEMPLATE.to_string(),
        }
    }

    /// The runtime's own descriptors when present, else the bundled ones.
    /// An existing instance `rewrite.config` is kept so hand-written rules
    /// outside the managed block survive.
    pub fn load(vendor_conf: Option<&Path>, existing_rewrite: Option<&Path>) -> Result<Self, ServError> {
        let mut templates = Self::bundled();
        if let Some(conf) = vendor_conf {
            let server = conf.join("server.xml");
            if server.is_file() {
                templates.server_xml = fs::read_to_string(server)?;
            }
            let web = conf.join("web.xml");
            if web.is_file() {
                templates.web_xml = fs::read_to_string(web)?;
            }
        }
        if let Some(path) = existing_rewrite.filter(|path| path.is_file()) {
            templates.rewrite_config = fs::read_to_string(path)?;
        }
        Ok(templates)
    }
}

/// Everything written into an instance directory before launch.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Artifacts {
    pub engine_config: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_xml: Option<String>,
    pub web_xml: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rewrite_config: Option<String>,
}

pub fn render(
    templates: &Templates,
    cfg: &EffectiveConfig,
    ports: &PortAssignment,
    target: &PatchTarget,
    caps: Capabilities,
) -> Result<Artifacts, ServError> {
    let server_xml = if caps.server_descriptor {
        Some(patch_server_xml(&templates.server_xml, cfg, ports, target, caps)?)
    } else {
        None
    };
    let rewrite_config = if cfg.settings.url_rewrite.enabled && caps.url_rewrite {
        Some(patch_rewrite_config(
            &templates.rewrite_config,
            &cfg.settings.url_rewrite.router_file,
        ))
    } else {
        None
    };
    Ok(Artifacts {
        engine_config: render_engine_config(cfg)?,
        server_xml,
        web_xml: patch_web_xml(&templates.web_xml, cfg, ports)?,
        rewrite_config,
    })
}

pub fn render_engine_config(cfg: &EffectiveConfig) -> Result<String, ServError> {
    Ok(format!("{}\n", serde_json::to_string_pretty(&cfg.engine_config)?))
}

fn missing(what: &str) -> ServError {
    ServError::Config(format!("server descriptor has no <{what}> element"))
}

fn is_https_connector(element: &Element) -> bool {
    element.name == "Connector"
        && (element.attr("scheme") == Some("https") || element.attr("SSLEnabled") == Some("true"))
}

fn is_http_connector(element: &Element) -> bool {
    element.name == "Connector"
        && !is_https_connector(element)
        && !element
            .attr("protocol")
            .map(|protocol| protocol.starts_with("AJP"))
            .unwrap_or(false)
}

fn is_root_context(element: &Element) -> bool {
    element.name == "Context" && matches!(element.attr("path"), Some("") | Some("/") | None)
}

fn is_rewrite_valve(element: &Element) -> bool {
    element.name == "Valve" && element.attr("className") == Some(REWRITE_VALVE)
}

fn https_connector(port: u16, target: &PatchTarget) -> Element {
    Element::new("Connector")
        .with_attr("port", &port.to_string())
        .with_attr("protocol", "org.apache.coyote.http11.Http11NioProtocol")
        .with_attr("SSLEnabled", "true")
        .with_attr("scheme", "https")
        .with_attr("secure", "true")
        .with_attr("maxThreads", "150")
        .with_child(
            Element::new("SSLHostConfig")
                .with_attr("protocols", HTTPS_PROTOCOLS)
                .with_child(
                    Element::new("Certificate")
                        .with_attr("certificateKeystoreFile", &target.keystore_file)
                        .with_attr("certificateKeystorePasswordFile", &target.password_file)
                        .with_attr("certificateKeystoreType", "PKCS12")
                        .with_attr("type", "RSA"),
                ),
        )
}

pub fn patch_server_xml(
    template: &str,
    cfg: &EffectiveConfig,
    ports: &PortAssignment,
    target: &PatchTarget,
    caps: Capabilities,
) -> Result<String, ServError> {
    let mut doc = Document::parse(template)?;
    let server = &mut doc.root;
    if server.name != "Server" {
        return Err(ServError::Config(format!(
            "server descriptor root must be <Server>, found <{}>",
            server.name
        )));
    }
    server.set_attr("port", &ports.shutdown.to_string());
    if server.attr("shutdown").is_none() {
        server.set_attr("shutdown", "SHUTDOWN");
    }

    let service = server.child_mut("Service").ok_or_else(|| missing("Service"))?;
    let https = ports.https.filter(|_| cfg.tls_enabled() && caps.tls);
    match service.find_mut(is_http_connector) {
        Some(connector) => {
            connector.set_attr("port", &ports.http.to_string());
            if let Some(port) = https {
                connector.set_attr("redirectPort", &port.to_string());
            }
        }
        None => {
            let mut connector = Element::new("Connector")
                .with_attr("port", &ports.http.to_string())
                .with_attr("protocol", "HTTP/1.1")
                .with_attr("connectionTimeout", "20000");
            if let Some(port) = https {
                connector.set_attr("redirectPort", &port.to_string());
            }
            service.insert_before(connector, 1, |e| e.name == "Engine");
        }
    }
    match https {
        Some(port) => service.upsert(https_connector(port, target), 1, is_https_connector, |e| {
            e.name == "Engine"
        }),
        None => {
            service.remove_where(is_https_connector);
        }
    }

    let engine = service.child_mut("Engine").ok_or_else(|| missing("Engine"))?;
    let host = engine.child_mut("Host").ok_or_else(|| missing("Host"))?;
    if cfg.settings.url_rewrite.enabled && caps.url_rewrite {
        host.upsert(
            Element::new("Valve").with_attr("className", REWRITE_VALVE),
            3,
            is_rewrite_valve,
            |e| e.name == "Context",
        );
    } else {
        host.remove_where(is_rewrite_valve);
    }
    match host.find_mut(is_root_context) {
        Some(context) => context.set_attr("docBase", &target.webroot),
        None => host.append(
            Element::new("Context")
                .with_attr("path", "")
                .with_attr("docBase", &target.webroot),
            3,
        ),
    }
    Ok(doc.to_xml())
}

fn text(name: &str, value: &str) -> Element {
    Element::new(name).with_text(value)
}

fn is_servlet(servlet: &str) -> impl Fn(&Element) -> bool + '_ {
    move |e| e.name == "servlet" && e.child_text("servlet-name").as_deref() == Some(servlet)
}

fn is_mapping<'a>(servlet: &'a str, pattern: Option<&'a str>) -> impl Fn(&Element) -> bool + 'a {
    move |e| {
        e.name == "servlet-mapping"
            && e.child_text("servlet-name").as_deref() == Some(servlet)
            && pattern.map_or(true, |pattern| {
                e.elements()
                    .any(|child| child.name == "url-pattern" && child.text() == pattern)
            })
    }
}

fn is_constraint(id: &str) -> impl Fn(&Element) -> bool + '_ {
    move |e| {
        e.name == "security-constraint"
            && e.child("web-resource-collection")
                .and_then(|collection| collection.child_text("web-resource-name"))
                .as_deref()
                == Some(id)
    }
}

fn is_mapping_or_later(e: &Element) -> bool {
    matches!(
        e.name.as_str(),
        "servlet-mapping" | "welcome-file-list" | "security-constraint" | "error-page"
    )
}

fn is_after_mappings(e: &Element) -> bool {
    matches!(
        e.name.as_str(),
        "welcome-file-list" | "security-constraint" | "error-page"
    )
}

fn ensure_servlet(web_app: &mut Element, servlet: &str, class: &str) {
    if web_app.count(is_servlet(servlet)) > 0 {
        return;
    }
    web_app.insert_before(
        Element::new("servlet")
            .with_child(text("servlet-name", servlet))
            .with_child(text("servlet-class", class))
            .with_child(text("load-on-startup", "1")),
        0,
        is_mapping_or_later,
    );
}

fn ensure_mapping(web_app: &mut Element, servlet: &str, pattern: &str) {
    if web_app.count(is_mapping(servlet, Some(pattern))) > 0 {
        return;
    }
    web_app.insert_before(
        Element::new("servlet-mapping")
            .with_child(text("servlet-name", servlet))
            .with_child(text("url-pattern", pattern)),
        0,
        is_after_mappings,
    );
}

fn constraint(id: &str, patterns: &[&str]) -> Element {
    let mut collection = Element::new("web-resource-collection").with_child(text("web-resource-name", id));
    for pattern in patterns {
        collection = collection.with_child(text("url-pattern", pattern));
    }
    Element::new("security-constraint").with_child(collection)
}

fn deny_constraint(id: &str, patterns: &[&str]) -> Element {
    constraint(id, patterns).with_child(Element::new("auth-constraint"))
}

fn redirect_constraint() -> Element {
    constraint(REDIRECT_CONSTRAINT, &["/*"]).with_child(
        Element::new("user-data-constraint").with_child(text("transport-guarantee", "CONFIDENTIAL")),
    )
}

fn upsert_constraint(web_app: &mut Element, id: &str, element: Element) {
    web_app.upsert(element, 0, is_constraint(id), |e| e.name == "error-page");
}

pub fn patch_web_xml(
    template: &str,
    cfg: &EffectiveConfig,
    ports: &PortAssignment,
) -> Result<String, ServError> {
    let mut doc = Document::parse(template)?;
    let web_app = &mut doc.root;
    if web_app.name != "web-app" {
        return Err(ServError::Config(format!(
            "web descriptor root must be <web-app>, found <{}>",
            web_app.name
        )));
    }
    let settings = &cfg.settings;
    let engine = settings.script_engine_enabled;

    if engine {
        ensure_servlet(web_app, ENGINE_SERVLET, ENGINE_SERVLET_CLASS);
        for pattern in ENGINE_PATTERNS {
            ensure_mapping(web_app, ENGINE_SERVLET, pattern);
        }
    } else {
        web_app.remove_where(is_mapping(ENGINE_SERVLET, None));
        web_app.remove_where(is_servlet(ENGINE_SERVLET));
    }

    if engine && settings.rest.enabled {
        ensure_servlet(web_app, REST_SERVLET, REST_SERVLET_CLASS);
        ensure_mapping(web_app, REST_SERVLET, REST_PATTERN);
    } else {
        web_app.remove_where(is_mapping(REST_SERVLET, None));
        web_app.remove_where(is_servlet(REST_SERVLET));
    }

    if engine && settings.admin.enabled {
        ensure_mapping(web_app, ENGINE_SERVLET, ADMIN_PATTERN);
        web_app.remove_where(is_constraint(ADMIN_CONSTRAINT));
    } else {
        web_app.remove_where(is_mapping(ENGINE_SERVLET, Some(ADMIN_PATTERN)));
        upsert_constraint(
            web_app,
            ADMIN_CONSTRAINT,
            deny_constraint(ADMIN_CONSTRAINT, &[ADMIN_DENY_PATTERN]),
        );
    }

    upsert_constraint(
        web_app,
        CONFIG_CONSTRAINT,
        deny_constraint(CONFIG_CONSTRAINT, PROTECTED_FILES),
    );

    if cfg.tls_enabled() && settings.tls_config.redirect && ports.https.is_some() {
        upsert_constraint(web_app, REDIRECT_CONSTRAINT, redirect_constraint());
    } else {
        web_app.remove_where(is_constraint(REDIRECT_CONSTRAINT));
    }
    Ok(doc.to_xml())
}

/// Replace (or append) the managed block; everything else is kept.
pub fn patch_rewrite_config(existing: &str, router_file: &str) -> String {
    let router = router_file.trim_start_matches('/');
    let block = format!(
        "{REWRITE_BEGIN}\n\
RewriteCond %{{REQUEST_URI}} !^/(lucee|rest)/.*\n\
RewriteCond %{{REQUEST_FILENAME}} !-f\n\
RewriteCond %{{REQUEST_FILENAME}} !-d\n\
RewriteRule ^/(.*)$ /{router}/$1 [L]\n\
{REWRITE_END}\n"
    );
    let mut kept = String::new();
    let mut inside = false;
    for line in existing.lines() {
        if line.trim() == REWRITE_BEGIN {
            inside = true;
            continue;
        }
        if line.trim() == REWRITE_END {
            inside = false;
            continue;
        }
        if !inside {
            kept.push_str(line);
            kept.push('\n');
        }
    }
    if !kept.is_empty() && !kept.ends_with("\n\n") {
        kept.push('\n');
    }
    kept.push_str(&block);
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{resolve_document, Resolved, RuntimeKind};
    use crate::provider::capabilities_of;
    use crate::vars::Variables;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;

    fn effective(raw: Value) -> EffectiveConfig {
        let dir = Path::new("/projects/shop");
        let Resolved { config, .. } = resolve_document(
            &dir.join("servman.json"),
            dir,
            &raw,
            None,
            &Variables::from_maps(BTreeMap::new(), BTreeMap::new()),
        )
        .unwrap();
        config
    }

    fn target() -> PatchTarget {
        PatchTarget {
            webroot: "/projects/shop/www".to_string(),
            keystore_file: "/home/u/.servman/servers/shop/certs/keystore.p12".to_string(),
            password_file: "/home/u/.servman/servers/shop/certs/keystore.pass".to_string(),
        }
    }

    fn ports(https: Option<u16>) -> PortAssignment {
        PortAssignment {
            http: 8080,
            shutdown: 9080,
            jmx: None,
            https,
        }
    }

    fn caps() -> Capabilities {
        capabilities_of(RuntimeKind::Embedded)
    }

    fn server(xml: &str) -> Element {
        Document::parse(xml).unwrap().root
    }

    fn service(root: &Element) -> &Element {
        root.child("Service").unwrap()
    }

    #[test]
    fn http_and_shutdown_ports_are_applied() {
        let cfg = effective(json!({}));
        let xml = patch_server_xml(SERVER_XML_TEMPLATE, &cfg, &ports(None), &target(), caps()).unwrap();
        let root = server(&xml);
        assert_eq!(root.attr("port"), Some("9080"));
        let connector = service(&root).child("Connector").unwrap();
        assert_eq!(connector.attr("port"), Some("8080"));
        assert!(xml.contains("&quot;%r&quot;"));
        assert!(xml.contains("<!-- Servlet container descriptor"));
    }

    #[test]
    fn tls_patch_twice_yields_one_https_connector() {
        let cfg = effective(json!({"tlsConfig": {"enabled": true}}));
        let once = patch_server_xml(SERVER_XML_TEMPLATE, &cfg, &ports(Some(8443)), &target(), caps()).unwrap();
        let twice = patch_server_xml(&once, &cfg, &ports(Some(8443)), &target(), caps()).unwrap();
        assert_eq!(once, twice);
        let root = server(&twice);
        assert_eq!(service(&root).count(is_https_connector), 1);
        let https = service(&root).elements().find(|e| is_https_connector(e)).unwrap();
        let host_config = https.child("SSLHostConfig").unwrap();
        assert_eq!(host_config.attr("protocols"), Some("TLSv1.2+TLSv1.3"));
        let certificate = host_config.child("Certificate").unwrap();
        assert_eq!(
            certificate.attr("certificateKeystoreFile"),
            Some(target().keystore_file.as_str())
        );
        assert_eq!(
            service(&root).child("Connector").unwrap().attr("redirectPort"),
            Some("8443")
        );
    }

    #[test]
    fn disabling_tls_removes_the_connector() {
        let tls = effective(json!({"tlsConfig": {"enabled": true}}));
        let with_tls = patch_server_xml(SERVER_XML_TEMPLATE, &tls, &ports(Some(8443)), &target(), caps()).unwrap();
        let plain = effective(json!({}));
        let without = patch_server_xml(&with_tls, &plain, &ports(None), &target(), caps()).unwrap();
        assert_eq!(service(&server(&without)).count(is_https_connector), 0);
    }

    #[test]
    fn webroot_and_rewrite_valve() {
        let cfg = effective(json!({"urlRewrite": {"enabled": true}}));
        let once = patch_server_xml(SERVER_XML_TEMPLATE, &cfg, &ports(None), &target(), caps()).unwrap();
        let twice = patch_server_xml(&once, &cfg, &ports(None), &target(), caps()).unwrap();
        let root = server(&twice);
        let host = service(&root).child("Engine").unwrap().child("Host").unwrap();
        assert_eq!(host.count(is_rewrite_valve), 1);
        assert_eq!(
            host.child("Context").unwrap().attr("docBase"),
            Some("/projects/shop/www")
        );
    }

    #[test]
    fn rewrite_valve_is_skipped_without_capability() {
        let cfg = effective(json!({"urlRewrite": {"enabled": true}}));
        let jetty = capabilities_of(RuntimeKind::Jetty);
        let artifacts = render(&Templates::bundled(), &cfg, &ports(None), &target(), jetty).unwrap();
        assert!(artifacts.server_xml.is_none());
        assert!(artifacts.rewrite_config.is_none());
    }

    #[test]
    fn engine_disabled_leaves_a_static_file_server() {
        let cfg = effective(json!({"scriptEngineEnabled": false}));
        let xml = patch_web_xml(WEB_XML_TEMPLATE, &cfg, &ports(None)).unwrap();
        let root = server(&xml);
        assert_eq!(root.count(is_servlet(ENGINE_SERVLET)), 0);
        assert_eq!(root.count(is_mapping(ENGINE_SERVLET, None)), 0);
        assert_eq!(root.count(is_servlet(REST_SERVLET)), 0);
        assert_eq!(root.count(is_servlet("default")), 1);
        assert_eq!(root.count(is_constraint(CONFIG_CONSTRAINT)), 1);
    }

    #[test]
    fn web_xml_patch_is_idempotent_and_complete() {
        let cfg = effective(json!({"tlsConfig": {"enabled": true, "redirect": true}}));
        let once = patch_web_xml(WEB_XML_TEMPLATE, &cfg, &ports(Some(8443))).unwrap();
        let twice = patch_web_xml(&once, &cfg, &ports(Some(8443))).unwrap();
        assert_eq!(once, twice);
        let root = server(&twice);
        for pattern in ENGINE_PATTERNS {
            assert_eq!(root.count(is_mapping(ENGINE_SERVLET, Some(pattern))), 1, "{pattern}");
        }
        assert_eq!(root.count(is_mapping(REST_SERVLET, Some(REST_PATTERN))), 1);
        assert_eq!(root.count(is_mapping(ENGINE_SERVLET, Some(ADMIN_PATTERN))), 1);
        assert_eq!(root.count(is_constraint(REDIRECT_CONSTRAINT)), 1);
        assert!(twice.contains("<transport-guarantee>CONFIDENTIAL</transport-guarantee>"));
        assert!(twice.contains(r#"xmlns="https://jakarta.ee/xml/ns/jakartaee""#));
    }

    #[test]
    fn admin_and_rest_toggles() {
        let cfg = effective(json!({"admin": {"enabled": false}, "rest": {"enabled": false}}));
        let xml = patch_web_xml(WEB_XML_TEMPLATE, &cfg, &ports(None)).unwrap();
        let root = server(&xml);
        assert_eq!(root.count(is_mapping(ENGINE_SERVLET, Some(ADMIN_PATTERN))), 0);
        assert_eq!(root.count(is_constraint(ADMIN_CONSTRAINT)), 1);
        assert_eq!(root.count(is_servlet(REST_SERVLET)), 0);
        assert!(xml.contains(ADMIN_DENY_PATTERN));

        let enabled = effective(json!({}));
        let restored = patch_web_xml(&xml, &enabled, &ports(None)).unwrap();
        assert_eq!(server(&restored).count(is_constraint(ADMIN_CONSTRAINT)), 0);
    }

    #[test]
    fn config_file_is_always_protected() {
        let cfg = effective(json!({}));
        let xml = patch_web_xml(WEB_XML_TEMPLATE, &cfg, &ports(None)).unwrap();
        assert!(xml.contains("<url-pattern>/servman.json</url-pattern>"));
        assert!(xml.contains("<auth-constraint/>"));
    }

    #[test]
    fn rewrite_block_is_replaced_not_duplicated() {
        let custom = "# mine\nRewriteRule ^/old$ /new [R=301]\n";
        let once = patch_rewrite_config(custom, "index.cfm");
        let twice = patch_rewrite_config(&once, "router.cfm");
        assert_eq!(twice.matches(REWRITE_BEGIN).count(), 1);
        assert!(twice.contains("RewriteRule ^/old$ /new [R=301]"));
        assert!(twice.contains("/router.cfm/$1"));
        assert!(!twice.contains("/index.cfm/$1"));
    }

    #[test]
    fn engine_config_is_pretty_json() {
        let cfg = effective(json!({"embeddedConfig": {"mode": "single"}}));
        assert_eq!(render_engine_config(&cfg).unwrap(), "{\n  \"mode\": \"single\"\n}\n");
    }
}
