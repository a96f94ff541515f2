/**
 * KERNEL CONFIG - pools, hosts, VMs, rights and backend selection
 *
 * ROLE:
 * Loads kernel.yaml (path from POOLWARDEN_KERNEL_CONFIG) and freezes it into an
 * immutable `Registry` that every component receives explicitly.
 *
 * VALIDATION:
 * - pool names unique, no ':' (fullnames are "<pool>:<resource>")
 * - host names unique per pool, VM identifiers unique per pool
 * - console ports unique: ":N" => 5900+N (N <= 99), or 1024..=65535, or "-"
 */

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use tokio::fs;

use crate::hypervisor::simulated::SimulationConf;
use crate::rights::RightsRule;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("duplicate pool name {0}")]
    DuplicatePool(String),
    #[error("invalid pool name {0:?}")]
    InvalidPoolName(String),
    #[error("duplicate host {host} in pool {pool}")]
    DuplicateHost { pool: String, host: String },
    #[error("duplicate VM {vm} in pool {pool}")]
    DuplicateVm { pool: String, vm: String },
    #[error("invalid console port {0:?}")]
    InvalidConsole(String),
    #[error("console port {0} used twice")]
    DuplicateConsole(u16),
    #[error("unknown capability level {0:?}")]
    UnknownLevel(String),
    #[error("unknown action {0:?}")]
    UnknownAction(String),
    #[error("backend {0} needs a `simulation` section")]
    MissingSimulation(&'static str),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Simulated,
    Xenapi,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct KernelConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    #[serde(default)]
    pub log_json: bool,
    #[serde(default)]
    pub pools: Vec<PoolConf>,
    #[serde(default)]
    pub groups: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub rights: Vec<RightsRule>,
    /// action name -> level name or "disabled"
    #[serde(default)]
    pub operations: BTreeMap<String, String>,
    #[serde(default)]
    pub simulation: Option<SimulationConf>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}

fn default_token_ttl() -> u64 {
    300
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            backend: BackendKind::Simulated,
            token_ttl_secs: default_token_ttl(),
            log_json: false,
            pools: Vec::new(),
            groups: HashMap::new(),
            rights: Vec::new(),
            operations: BTreeMap::new(),
            simulation: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PoolConf {
    pub name: String,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub manager: Option<ManagerConf>,
    #[serde(default)]
    pub hosts: Vec<HostConf>,
    #[serde(default)]
    pub vms: Vec<VmConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ManagerConf {
    pub username: String,
    pub password: String,
    /// Hosts with self-signed certificates.
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostConf {
    pub name: String,
    #[serde(default)]
    pub address: Option<Ipv4Addr>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VmConf {
    /// UUID or name-label
    pub name: String,
    #[serde(default)]
    pub console: Option<ConsoleSpec>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(untagged)]
pub enum ConsoleSpec {
    Port(u32),
    Text(String),
}

impl ConsoleSpec {
    fn port(&self) -> Result<Option<u16>, ConfigError> {
        let invalid = || ConfigError::InvalidConsole(self.to_string());
        let explicit = |n: u32| {
            if (1024..=65535).contains(&n) { Ok(Some(n as u16)) } else { Err(invalid()) }
        };
        match self {
            ConsoleSpec::Port(n) => explicit(*n),
            ConsoleSpec::Text(t) if t.trim() == "-" => Ok(None),
            ConsoleSpec::Text(t) => match t.trim().strip_prefix(':') {
                Some(display) => match display.parse::<u16>() {
                    Ok(n) if n <= 99 => Ok(Some(5900 + n)),
                    _ => Err(invalid()),
                },
                None => explicit(t.trim().parse().map_err(|_| invalid())?),
            },
        }
    }
}

impl std::fmt::Display for ConsoleSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsoleSpec::Port(n) => write!(f, "{n}"),
            ConsoleSpec::Text(t) => f.write_str(t),
        }
    }
}

pub fn fullname(pool: &str, resource: &str) -> String {
    format!("{pool}:{resource}")
}

/// 36 chars, lowercase hex, dashes at 8/13/18/23.
pub fn is_uuid(s: &str) -> bool {
    s.len() == 36
        && s.char_indices().all(|(i, c)| match i {
            8 | 13 | 18 | 23 => c == '-',
            _ => c.is_ascii_digit() || ('a'..='f').contains(&c),
        })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmIdent {
    Uuid(String),
    Name(String),
}

impl VmIdent {
    pub fn as_str(&self) -> &str {
        match self {
            VmIdent::Uuid(s) | VmIdent::Name(s) => s,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VmDesc {
    pub ident: VmIdent,
    pub fullname: String,
    pub console_port: Option<u16>,
}

impl VmDesc {
    pub fn id(&self) -> &str {
        self.ident.as_str()
    }
}

#[derive(Debug, Clone)]
pub struct HostDesc {
    pub name: String,
    pub address: Option<Ipv4Addr>,
    pub fullname: String,
}

impl HostDesc {
    /// Configured address, else the name itself when it is an IPv4 literal.
    pub fn effective_address(&self) -> Option<Ipv4Addr> {
        self.address.or_else(|| self.name.parse().ok())
    }

    /// Does a hypervisor host record (hostname, address) describe this host?
    pub fn matches(&self, domain: &str, hostname: &str, address: &str) -> bool {
        match self.effective_address() {
            Some(ip) => address == ip.to_string(),
            None => hostname.eq_ignore_ascii_case(&format!("{}{}", self.name, domain)),
        }
    }

    /// Where to reach the host's management endpoint.
    pub fn endpoint(&self, domain: &str) -> String {
        match self.address {
            Some(ip) => ip.to_string(),
            None => format!("{}{}", self.name, domain),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolDesc {
    pub name: String,
    /// Empty, or starts with '.'
    pub domain: String,
    pub manager: Option<ManagerConf>,
    pub hosts: Vec<HostDesc>,
    pub vms: Vec<VmDesc>,
}

impl PoolDesc {
    pub fn vm(&self, id: &str) -> Option<&VmDesc> {
        self.vms.iter().find(|v| v.id() == id)
    }
}

/// Frozen view of the configured pools. Built once, shared read-only.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    pools: Vec<PoolDesc>,
}

impl Registry {
    pub fn from_config(cfg: &KernelConfig) -> Result<Self, ConfigError> {
        let mut pool_names = HashSet::new();
        let mut console_ports = HashSet::new();
        let mut pools = Vec::with_capacity(cfg.pools.len());

        for pc in &cfg.pools {
            let name = pc.name.trim().to_string();
            if name.is_empty() || name.contains(':') {
                return Err(ConfigError::InvalidPoolName(pc.name.clone()));
            }
            if !pool_names.insert(name.clone()) {
                return Err(ConfigError::DuplicatePool(name));
            }

            let domain = match pc.domain.as_deref().map(str::trim) {
                None | Some("") => String::new(),
                Some(d) if d.starts_with('.') => d.to_string(),
                Some(d) => format!(".{d}"),
            };

            let mut hosts: Vec<HostDesc> = Vec::with_capacity(pc.hosts.len());
            for hc in &pc.hosts {
                if hosts.iter().any(|h| h.name == hc.name) {
                    return Err(ConfigError::DuplicateHost { pool: name.clone(), host: hc.name.clone() });
                }
                hosts.push(HostDesc { name: hc.name.clone(), address: hc.address, fullname: fullname(&name, &hc.name) });
            }

            let mut vms: Vec<VmDesc> = Vec::with_capacity(pc.vms.len());
            for vc in &pc.vms {
                let id = vc.name.trim();
                if vms.iter().any(|v| v.id() == id) {
                    return Err(ConfigError::DuplicateVm { pool: name.clone(), vm: id.to_string() });
                }
                let console_port = match &vc.console {
                    Some(spec) => spec.port()?,
                    None => None,
                };
                if let Some(port) = console_port {
                    if !console_ports.insert(port) {
                        return Err(ConfigError::DuplicateConsole(port));
                    }
                }
                let ident = if is_uuid(id) { VmIdent::Uuid(id.to_string()) } else { VmIdent::Name(id.to_string()) };
                vms.push(VmDesc { ident, fullname: fullname(&name, id), console_port });
            }

            pools.push(PoolDesc { name, domain, manager: pc.manager.clone(), hosts, vms });
        }

        if cfg.backend == BackendKind::Simulated && cfg.simulation.is_none() && !pools.is_empty() {
            return Err(ConfigError::MissingSimulation("simulated"));
        }

        Ok(Registry { pools })
    }

    pub fn pools(&self) -> &[PoolDesc] {
        &self.pools
    }

    pub fn pool(&self, name: &str) -> Option<&PoolDesc> {
        self.pools.iter().find(|p| p.name == name)
    }

    pub fn vm(&self, pool: &str, vm: &str) -> Option<(&PoolDesc, &VmDesc)> {
        let pool = self.pool(pool)?;
        Some((pool, pool.vm(vm)?))
    }

    pub fn vm_count(&self) -> usize {
        self.pools.iter().map(|p| p.vms.len()).sum()
    }
}

pub async fn load_config() -> anyhow::Result<KernelConfig> {
    let path = std::env::var("POOLWARDEN_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: &str) -> anyhow::Result<KernelConfig> {
    use anyhow::Context;

    if !Path::new(path).exists() {
        tracing::warn!(path, "[kernel] no config file, using empty configuration");
        return Ok(KernelConfig::default());
    }
    let txt = fs::read_to_string(path).await.with_context(|| format!("reading {path}"))?;
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(&txt).with_context(|| format!("parsing {path}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> KernelConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn uuid_shape() {
        assert!(is_uuid("0f3c2a8e-7b1d-4c5e-9a2f-112233445566"));
        assert!(!is_uuid("0F3C2A8E-7B1D-4C5E-9A2F-112233445566"));
        assert!(!is_uuid("0f3c2a8e7b1d-4c5e-9a2f-112233445566-"));
        assert!(!is_uuid("web01"));
    }

    #[test]
    fn registry_builds_fullnames_and_idents() {
        let cfg = parse(
            r#"
backend: xenapi
pools:
  - name: lab
    domain: example.com
    hosts: [{ name: xs1 }, { name: 10.0.0.2 }]
    vms:
      - { name: web01, console: ":3" }
      - { name: 0f3c2a8e-7b1d-4c5e-9a2f-112233445566, console: 6000 }
"#,
        );
        let reg = Registry::from_config(&cfg).unwrap();
        let pool = reg.pool("lab").unwrap();
        assert_eq!(pool.domain, ".example.com");
        assert_eq!(pool.hosts[0].fullname, "lab:xs1");

        let (_, web) = reg.vm("lab", "web01").unwrap();
        assert_eq!(web.fullname, "lab:web01");
        assert_eq!(web.console_port, Some(5903));
        assert!(matches!(web.ident, VmIdent::Name(_)));

        let (_, by_uuid) = reg.vm("lab", "0f3c2a8e-7b1d-4c5e-9a2f-112233445566").unwrap();
        assert!(matches!(by_uuid.ident, VmIdent::Uuid(_)));
        assert_eq!(by_uuid.console_port, Some(6000));
        assert_eq!(reg.vm_count(), 2);
    }

    #[test]
    fn host_matching_rules() {
        let by_name = HostDesc { name: "xs1".into(), address: None, fullname: "lab:xs1".into() };
        assert!(by_name.matches(".example.com", "xs1.example.com", "10.0.0.1"));
        assert!(!by_name.matches(".example.com", "xs1", "10.0.0.1"));

        let by_ip_name = HostDesc { name: "10.0.0.2".into(), address: None, fullname: "lab:10.0.0.2".into() };
        assert!(by_ip_name.matches(".example.com", "whatever", "10.0.0.2"));

        let with_addr = HostDesc { name: "xs3".into(), address: Some("10.0.0.3".parse().unwrap()), fullname: "lab:xs3".into() };
        assert!(with_addr.matches("", "other", "10.0.0.3"));
        assert!(!with_addr.matches("", "xs3", "10.0.0.9"));
    }

    #[test]
    fn rejects_bad_pool_names_and_duplicates() {
        let colon = parse("backend: xenapi\npools: [{ name: 'a:b' }]");
        assert!(matches!(Registry::from_config(&colon), Err(ConfigError::InvalidPoolName(_))));

        let dup = parse("backend: xenapi\npools: [{ name: a }, { name: a }]");
        assert!(matches!(Registry::from_config(&dup), Err(ConfigError::DuplicatePool(_))));

        let dup_vm = parse("backend: xenapi\npools: [{ name: a, vms: [{ name: v }, { name: v }] }]");
        assert!(matches!(Registry::from_config(&dup_vm), Err(ConfigError::DuplicateVm { .. })));
    }

    #[test]
    fn console_port_rules() {
        let too_high = parse("backend: xenapi\npools: [{ name: a, vms: [{ name: v, console: ':100' }] }]");
        assert!(matches!(Registry::from_config(&too_high), Err(ConfigError::InvalidConsole(_))));

        let privileged = parse("backend: xenapi\npools: [{ name: a, vms: [{ name: v, console: 80 }] }]");
        assert!(Registry::from_config(&privileged).is_err());

        let shared = parse(
            "backend: xenapi\npools: [{ name: a, vms: [{ name: v, console: ':1' }, { name: w, console: 5901 }] }]",
        );
        assert!(matches!(Registry::from_config(&shared), Err(ConfigError::DuplicateConsole(5901))));

        let none = parse("backend: xenapi\npools: [{ name: a, vms: [{ name: v, console: '-' }] }]");
        assert_eq!(Registry::from_config(&none).unwrap().vm("a", "v").unwrap().1.console_port, None);
    }

    #[tokio::test]
    async fn missing_file_gives_defaults_and_bad_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.yaml");
        let cfg = load_config_from(missing.to_str().unwrap()).await.unwrap();
        assert!(cfg.pools.is_empty());
        assert_eq!(cfg.token_ttl_secs, 300);

        let bad = dir.path().join("bad.yaml");
        std::fs::write(&bad, "pools: [ {name: ").unwrap();
        assert!(load_config_from(bad.to_str().unwrap()).await.is_err());

        let good = dir.path().join("good.yaml");
        std::fs::write(&good, "listen: 127.0.0.1:9000\nbackend: xenapi\n").unwrap();
        let cfg = load_config_from(good.to_str().unwrap()).await.unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9000");
        assert_eq!(cfg.backend, BackendKind::Xenapi);
    }
}
