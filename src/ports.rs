use crate::config::EffectiveConfig;
use crate::error::ServError;
use crate::registry::{AvoidSet, PortAssignment};
use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

pub const HTTP_RANGE: PortRange = PortRange::new(8000, 8999);
pub const SHUTDOWN_RANGE: PortRange = PortRange::new(9000, 9999);
pub const JMX_RANGE: PortRange = PortRange::new(10000, 10999);
pub const HTTPS_RANGE: PortRange = PortRange::new(8400, 8499);

const SHUTDOWN_OFFSET: u16 = 1000;
const JMX_OFFSET: u16 = 2000;
const HTTPS_OFFSET: u16 = 363;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }

    /// Ports after `from` to the end of the range, then wrapping from the
    /// start up to `from`. A `from` outside the range scans it all.
    fn scan_order(&self, from: u16) -> impl Iterator<Item = u16> {
        let (start, end) = (self.start, self.end);
        if !self.contains(from) {
            return (start..=end).chain(start..start);
        }
        let upper = if from < end { from + 1..=end } else { 1..=0 };
        upper.chain(start..from)
    }
}

/// OS-level check that a port can currently be bound.
pub trait PortProbe {
    fn is_free(&self, port: u16) -> bool;
}

pub struct OsPortProbe;

impl PortProbe for OsPortProbe {
    fn is_free(&self, port: u16) -> bool {
        // One listener at a time: the first must be dropped before the
        // wildcard bind or the two would collide with each other.
        let loopback = TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok();
        loopback && TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
    }
}

/// Whether something accepts connections on the loopback port.
pub fn port_is_bound(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, Duration::from_millis(200)).is_ok()
}

pub struct PortAllocator<'a, P: PortProbe + ?Sized> {
    probe: &'a P,
    avoid: AvoidSet,
}

impl<'a, P: PortProbe + ?Sized> PortAllocator<'a, P> {
    pub fn new(probe: &'a P, avoid: AvoidSet) -> Self {
        Self { probe, avoid }
    }

    fn usable(&self, port: u16, taken: &BTreeSet<u16>) -> bool {
        !self.avoid.contains_key(&port) && !taken.contains(&port) && self.probe.is_free(port)
    }

    fn owner_of(&self, port: u16, taken: &BTreeSet<u16>) -> String {
        if let Some(owner) = self.avoid.get(&port) {
            return format!("instance '{owner}'");
        }
        if taken.contains(&port) {
            return "another port of this instance".to_string();
        }
        "another process on this host".to_string()
    }

    /// `preferred` if usable, else the first usable port scanning forward
    /// through `range` (wrapping).
    pub fn allocate(
        &self,
        preferred: u16,
        range: PortRange,
        taken: &BTreeSet<u16>,
    ) -> Result<u16, ServError> {
        if self.usable(preferred, taken) {
            return Ok(preferred);
        }
        range
            .scan_order(preferred)
            .find(|port| self.usable(*port, taken))
            .ok_or(ServError::PortExhausted {
                start: range.start,
                end: range.end,
            })
    }

    // Explicit ports are validated, never moved.
    fn explicit(&self, field: &str, port: u16, taken: &BTreeSet<u16>) -> Result<u16, ServError> {
        if self.usable(port, taken) {
            return Ok(port);
        }
        Err(ServError::PortConflict {
            port,
            owner: self.owner_of(port, taken),
            remedy: format!(
                "Choose a different {field} with `servman config set {field}=<port>`, or stop/prune the owner."
            ),
        })
    }

    fn derived(
        &self,
        default: Option<u16>,
        range: PortRange,
        taken: &BTreeSet<u16>,
    ) -> Result<u16, ServError> {
        if let Some(port) = default {
            if self.usable(port, taken) {
                return Ok(port);
            }
        }
        (range.start..=range.end)
            .find(|port| self.usable(*port, taken))
            .ok_or(ServError::PortExhausted {
                start: range.start,
                end: range.end,
            })
    }

    pub fn derive_shutdown(
        &self,
        http: u16,
        explicit: Option<u16>,
        taken: &BTreeSet<u16>,
    ) -> Result<u16, ServError> {
        match explicit {
            Some(port) => self.explicit("shutdownPort", port, taken),
            None => self.derived(http.checked_add(SHUTDOWN_OFFSET), SHUTDOWN_RANGE, taken),
        }
    }

    pub fn derive_jmx(
        &self,
        http: u16,
        explicit: Option<u16>,
        taken: &BTreeSet<u16>,
    ) -> Result<u16, ServError> {
        match explicit {
            Some(port) => self.explicit("monitoring.jmxPort", port, taken),
            None => self.derived(http.checked_add(JMX_OFFSET), JMX_RANGE, taken),
        }
    }

    pub fn derive_https(
        &self,
        http: u16,
        explicit: Option<u16>,
        taken: &BTreeSet<u16>,
    ) -> Result<u16, ServError> {
        match explicit {
            Some(port) => self.explicit("tlsConfig.port", port, taken),
            None => self.derived(http.checked_add(HTTPS_OFFSET), HTTPS_RANGE, taken),
        }
    }

    /// Full port set for an instance.
    pub fn assign(&self, cfg: &EffectiveConfig) -> Result<PortAssignment, ServError> {
        let settings = &cfg.settings;
        let mut taken = BTreeSet::new();
        let http = self.allocate(settings.port, HTTP_RANGE, &taken)?;
        taken.insert(http);
        let shutdown = self.derive_shutdown(http, settings.shutdown_port, &taken)?;
        taken.insert(shutdown);
        let jmx = if cfg.jmx_enabled() {
            let port = self.derive_jmx(http, settings.monitoring.jmx_port, &taken)?;
            taken.insert(port);
            Some(port)
        } else {
            None
        };
        let https = if cfg.tls_enabled() {
            Some(self.derive_https(http, settings.tls_config.port, &taken)?)
        } else {
            None
        };
        Ok(PortAssignment {
            http,
            shutdown,
            jmx,
            https,
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{resolve_document, Resolved};
    use crate::vars::Variables;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::path::Path;

    #[derive(Default)]
    pub(crate) struct FakeProbe {
        pub busy: BTreeSet<u16>,
    }

    impl PortProbe for FakeProbe {
        fn is_free(&self, port: u16) -> bool {
            !self.busy.contains(&port)
        }
    }

    fn effective(raw: Value) -> EffectiveConfig {
        let dir = Path::new("/projects/ports");
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

    fn avoid(entries: &[(u16, &str)]) -> AvoidSet {
        entries
            .iter()
            .map(|(port, owner)| (*port, owner.to_string()))
            .collect()
    }

    #[test]
    fn empty_registry_gets_8080_and_9080() {
        let probe = FakeProbe::default();
        let ports = PortAllocator::new(&probe, AvoidSet::new())
            .assign(&effective(json!({"port": 8080})))
            .unwrap();
        assert_eq!((ports.http, ports.shutdown), (8080, 9080));
        assert_eq!(ports.jmx, None);
        assert_eq!(ports.https, None);
    }

    #[test]
    fn stopped_instance_ports_are_skipped() {
        let probe = FakeProbe::default();
        let allocator = PortAllocator::new(&probe, avoid(&[(8080, "first"), (9080, "first")]));
        let ports = allocator.assign(&effective(json!({}))).unwrap();
        assert_eq!((ports.http, ports.shutdown), (8081, 9081));
    }

    #[test]
    fn shutdown_collision_falls_back_into_9000_range() {
        let probe = FakeProbe::default();
        let allocator = PortAllocator::new(&probe, avoid(&[(9500, "other")]));
        let ports = allocator.assign(&effective(json!({"port": 8500}))).unwrap();
        assert_eq!(ports.http, 8500);
        assert!(SHUTDOWN_RANGE.contains(ports.shutdown));
        assert_ne!(ports.shutdown, 9500);
    }

    #[test]
    fn os_busy_ports_are_skipped() {
        let probe = FakeProbe {
            busy: BTreeSet::from([8080, 8081]),
        };
        let ports = PortAllocator::new(&probe, AvoidSet::new())
            .assign(&effective(json!({})))
            .unwrap();
        assert_eq!((ports.http, ports.shutdown), (8082, 9082));
    }

    #[test]
    fn scan_wraps_to_range_start() {
        let probe = FakeProbe {
            busy: (8990..=8999).collect(),
        };
        let allocator = PortAllocator::new(&probe, AvoidSet::new());
        let port = allocator.allocate(8995, HTTP_RANGE, &BTreeSet::new()).unwrap();
        assert_eq!(port, 8000);
    }

    #[test]
    fn exhausted_range_is_an_error() {
        let probe = FakeProbe {
            busy: (9000..=9010).collect(),
        };
        let allocator = PortAllocator::new(&probe, AvoidSet::new());
        let err = allocator
            .allocate(9000, PortRange::new(9000, 9010), &BTreeSet::new())
            .unwrap_err();
        assert!(matches!(err, ServError::PortExhausted { start: 9000, end: 9010 }));
    }

    #[test]
    fn explicit_shutdown_collision_fails_loudly() {
        let probe = FakeProbe::default();
        let allocator = PortAllocator::new(&probe, avoid(&[(9005, "legacy")]));
        let err = allocator
            .assign(&effective(json!({"port": 8080, "shutdownPort": 9005})))
            .unwrap_err();
        match err {
            ServError::PortConflict { port, owner, remedy } => {
                assert_eq!(port, 9005);
                assert!(owner.contains("legacy"));
                assert!(remedy.contains("shutdownPort"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn jmx_and_https_avoid_http_and_shutdown() {
        let probe = FakeProbe::default();
        let allocator = PortAllocator::new(&probe, avoid(&[(10080, "other"), (8443, "other")]));
        let ports = allocator
            .assign(&effective(json!({
                "monitoring": {"enabled": true},
                "tlsConfig": {"enabled": true}
            })))
            .unwrap();
        let jmx = ports.jmx.unwrap();
        let https = ports.https.unwrap();
        assert!(JMX_RANGE.contains(jmx));
        assert_ne!(jmx, 10080);
        assert!(HTTPS_RANGE.contains(https));
        assert_ne!(https, 8443);
        let all: BTreeSet<u16> = [ports.http, ports.shutdown, jmx, https].into_iter().collect();
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn explicit_jmx_equal_to_http_is_rejected() {
        let probe = FakeProbe::default();
        let err = PortAllocator::new(&probe, AvoidSet::new())
            .assign(&effective(json!({"monitoring": {"enabled": true, "jmxPort": 8080}})))
            .unwrap_err();
        assert!(matches!(err, ServError::PortConflict { port: 8080, .. }));
    }

    #[test]
    fn os_probe_sees_a_held_listener() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!OsPortProbe.is_free(port));
        assert!(port_is_bound(port));
        drop(listener);
    }
}
