/**
 * STATUS AGGREGATOR - rights-filtered snapshot of pools, hosts and VMs
 *
 * ROLE:
 * Builds the read model polled by agents. Built fresh per request, never cached.
 *
 * FILTERING:
 * - pool with rights "none"  : omitted
 * - host inventory           : only with host rights above "none"
 * - VM with rights "none"    : omitted (no fullname, no state, nothing)
 *
 * PARTIAL FAILURE:
 * A failed login or bulk read blanks the entities it covers; the snapshot
 * still completes with everything that did load.
 */

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::authz::{Action, Gate, Level, Principal};
use crate::config::{HostDesc, PoolDesc, Registry, VmDesc, VmIdent};
use crate::hypervisor::{
    GuestMetricsRecord, HostMetricsRecord, HostRecord, HostRef, Hypervisor, OpaqueRef, PowerState, Session,
    VmMetricsRecord, VmRecord,
};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
const MIB: f64 = 1024.0 * 1024.0;

pub const UNKNOWN_LABEL: &str = "Unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Windows,
    Linux,
    Appliance,
    Blank,
}

const LINUX_DISTROS: [&str; 7] = ["redhat", "centos", "fedora", "suse", "debian", "ubuntu", "gentoo"];

pub fn classify_platform(os_version: &str) -> Platform {
    let os = os_version.to_ascii_lowercase();
    if os.contains("microsoft") {
        Platform::Windows
    } else if os.contains("xvp") {
        Platform::Appliance
    } else if LINUX_DISTROS.iter().any(|d| os.contains(d)) {
        Platform::Linux
    } else {
        Platform::Blank
    }
}

/// "N days, H:MM" since a "%Y%m%dT%H:%M:%SZ" timestamp.
pub fn format_uptime(start_time: &str, now: OffsetDateTime) -> Option<String> {
    let fmt = format_description!("[year][month][day]T[hour]:[minute]:[second]Z");
    let then = PrimitiveDateTime::parse(start_time.trim(), fmt).ok()?.assume_utc();
    let secs = (now - then).whole_seconds().max(0);
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let mins = (secs % 3600) / 60;
    Some(format!("{days} days, {hours}:{mins:02}"))
}

pub fn format_vm_memory(bytes: u64) -> String {
    let mb = bytes as f64 / MIB;
    if mb >= 1024.0 {
        format!("{:.1} GB", mb / 1024.0)
    } else {
        format!("{} MB", mb as u64)
    }
}

pub fn format_host_memory(free: u64, total: u64) -> String {
    if total == 0 {
        return String::new();
    }
    format!("{:.1}/{:.1} GB free", free as f64 / GIB, total as f64 / GIB)
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HostStatus {
    pub fullname: String,
    pub role: String,
    pub state: String,
    pub osversion: String,
    pub memfree: String,
}

impl HostStatus {
    fn blank(host: &HostDesc) -> Self {
        Self {
            fullname: host.fullname.clone(),
            role: String::new(),
            state: String::new(),
            osversion: String::new(),
            memfree: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct VmStatus {
    pub fullname: String,
    pub label: String,
    pub rights: Level,
    pub state: Option<PowerState>,
    pub platform: Platform,
    pub osversion: String,
    pub uptime: String,
    pub memtotal: String,
}

impl VmStatus {
    fn blank(vm: &VmDesc, rights: Level) -> Self {
        let label = match &vm.ident {
            VmIdent::Name(name) => name.clone(),
            VmIdent::Uuid(_) => UNKNOWN_LABEL.to_string(),
        };
        Self {
            fullname: vm.fullname.clone(),
            label,
            rights,
            state: None,
            platform: Platform::Blank,
            osversion: String::new(),
            uptime: String::new(),
            memtotal: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub hosts: Vec<HostStatus>,
    pub vms: Vec<VmStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotResponse {
    /// unix seconds
    pub timestamp: i64,
    pub operations: BTreeMap<Action, Level>,
    pub pools: Vec<PoolStatus>,
}

pub struct StatusAggregator {
    registry: Arc<Registry>,
    gate: Gate,
    hypervisor: Arc<dyn Hypervisor>,
}

impl StatusAggregator {
    pub fn new(registry: Arc<Registry>, gate: Gate, hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { registry, gate, hypervisor }
    }

    pub async fn snapshot(&self, principal: &Principal, now: OffsetDateTime) -> SnapshotResponse {
        let mut pools = Vec::new();
        for pool in self.registry.pools() {
            if let Some(status) = self.pool_status(principal, pool, now).await {
                pools.push(status);
            }
        }
        SnapshotResponse {
            timestamp: now.unix_timestamp(),
            operations: self.gate.operations().entries().clone(),
            pools,
        }
    }

    async fn pool_status(&self, principal: &Principal, pool: &PoolDesc, now: OffsetDateTime) -> Option<PoolStatus> {
        if self.gate.rights_of(principal, &pool.name, None) == Level::None {
            return None;
        }
        let show_hosts = self.gate.host_rights(principal, &pool.name) > Level::None;
        let visible: Vec<(&VmDesc, Level)> = pool
            .vms
            .iter()
            .map(|vm| (vm, self.gate.rights_of(principal, &pool.name, Some(vm.id()))))
            // list alone makes the pool visible, not the VM
            .filter(|(_, level)| *level >= Level::Read)
            .collect();

        let session = match self.hypervisor.login(pool).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(pool = %pool.name, error = %e, kind = "partial_data_failure", "[aggregator] pool unreachable");
                let hosts = if show_hosts { pool.hosts.iter().map(HostStatus::blank).collect() } else { Vec::new() };
                let vms = visible.iter().map(|(vm, level)| VmStatus::blank(vm, *level)).collect();
                return Some(PoolStatus { name: pool.name.clone(), hosts, vms });
            }
        };

        let hosts = if show_hosts { host_statuses(session.as_ref(), pool).await } else { Vec::new() };
        let vms = vm_statuses(session.as_ref(), pool, &visible, now).await;
        session.logout().await;

        Some(PoolStatus { name: pool.name.clone(), hosts, vms })
    }
}

async fn host_statuses(session: &dyn Session, pool: &PoolDesc) -> Vec<HostStatus> {
    let records = match session.host_records().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(pool = %pool.name, error = %e, kind = "partial_data_failure", "[aggregator] host records");
            return pool.hosts.iter().map(HostStatus::blank).collect();
        }
    };
    let metrics = session.host_metrics_records().await.unwrap_or_else(|e| {
        tracing::warn!(pool = %pool.name, error = %e, "[aggregator] host metrics");
        BTreeMap::new()
    });
    let master = session.pool_master().await.ok();

    pool.hosts
        .iter()
        .map(|host| {
            let found = records.iter().find(|(_, rec)| host.matches(&pool.domain, &rec.hostname, &rec.address));
            match found {
                Some((href, rec)) => host_status(host, href, rec, &metrics, master.as_ref()),
                None => {
                    tracing::debug!(host = %host.fullname, "[aggregator] host not reported by pool");
                    HostStatus::blank(host)
                }
            }
        })
        .collect()
}

fn host_status(
    host: &HostDesc,
    href: &HostRef,
    rec: &HostRecord,
    metrics: &BTreeMap<OpaqueRef, HostMetricsRecord>,
    master: Option<&HostRef>,
) -> HostStatus {
    let mut status = HostStatus::blank(host);
    status.osversion = format!("{} {} build {}", rec.product_brand, rec.product_version, rec.build_number);
    if rec.enabled {
        status.state = "Running".into();
        if let Some(m) = rec.metrics.as_ref().and_then(|m| metrics.get(m)) {
            status.memfree = format_host_memory(m.memory_free, m.memory_total);
        }
    }
    status.role = if master == Some(href) {
        "master".into()
    } else if status.state == "Running" {
        "slave".into()
    } else {
        String::new()
    };
    status
}

async fn vm_statuses(session: &dyn Session, pool: &PoolDesc, visible: &[(&VmDesc, Level)], now: OffsetDateTime) -> Vec<VmStatus> {
    let records = match session.vm_records().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(pool = %pool.name, error = %e, kind = "partial_data_failure", "[aggregator] vm records");
            return visible.iter().map(|(vm, level)| VmStatus::blank(vm, *level)).collect();
        }
    };
    let metrics = session.vm_metrics_records().await.unwrap_or_else(|e| {
        tracing::warn!(pool = %pool.name, error = %e, "[aggregator] vm metrics");
        BTreeMap::new()
    });
    let guests = session.guest_metrics_records().await.unwrap_or_else(|e| {
        tracing::warn!(pool = %pool.name, error = %e, "[aggregator] guest metrics");
        BTreeMap::new()
    });

    let real_vms: Vec<&VmRecord> = records.values().filter(|r| !r.is_a_template && !r.is_control_domain).collect();

    visible
        .iter()
        .map(|(vm, level)| {
            let found = real_vms.iter().find(|r| match &vm.ident {
                VmIdent::Uuid(uuid) => &r.uuid == uuid,
                VmIdent::Name(name) => &r.name_label == name,
            });
            match found {
                Some(rec) => vm_status(vm, *level, rec, &metrics, &guests, now),
                None => VmStatus::blank(vm, *level),
            }
        })
        .collect()
}

fn vm_status(
    vm: &VmDesc,
    rights: Level,
    rec: &VmRecord,
    metrics: &BTreeMap<OpaqueRef, VmMetricsRecord>,
    guests: &BTreeMap<OpaqueRef, GuestMetricsRecord>,
    now: OffsetDateTime,
) -> VmStatus {
    let mut status = VmStatus::blank(vm, rights);
    if let VmIdent::Uuid(_) = vm.ident {
        if !rec.name_label.is_empty() {
            status.label = rec.name_label.clone();
        }
    }
    status.state = Some(rec.power_state);

    let os = rec
        .guest_metrics
        .as_ref()
        .and_then(|g| guests.get(g))
        .map(|g| g.os_name.split('|').next().unwrap_or_default().to_string())
        .unwrap_or_default();
    status.platform = classify_platform(&os);
    status.osversion = os;

    if rec.power_state == PowerState::Running {
        if let Some(m) = rec.metrics.as_ref().and_then(|m| metrics.get(m)) {
            status.memtotal = format_vm_memory(m.memory_actual);
            status.uptime = format_uptime(&m.start_time, now).unwrap_or_default();
        }
    }
    status
}
