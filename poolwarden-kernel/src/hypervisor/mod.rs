/**
 * HYPERVISOR SEAM - session-scoped access to a pool's control API
 *
 * ROLE:
 * Everything the kernel needs from the hypervisor, behind two traits:
 * - `Hypervisor::login(pool)` opens a session for ONE request
 * - `Session` exposes lookups, property accessors, mutating calls and bulk reads
 *
 * Sessions are never cached or shared between requests; the caller logs out
 * (best effort) when the request ends.
 *
 * BACKENDS:
 * - simulated : in-memory pool model (demo + tests)
 * - xenapi    : JSON-RPC over HTTPS to the pool master
 */

pub mod simulated;
pub mod xenapi;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::PoolDesc;
use crate::error::RemoteError;

/// Opaque object reference handed out by the hypervisor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpaqueRef(pub String);

impl OpaqueRef {
    pub fn new(s: impl Into<String>) -> Self {
        OpaqueRef(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// XenAPI uses this sentinel for "no object".
    pub fn is_null(&self) -> bool {
        self.0.is_empty() || self.0 == "OpaqueRef:NULL"
    }
}

impl fmt::Display for OpaqueRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub type VmRef = OpaqueRef;
pub type HostRef = OpaqueRef;
pub type VbdRef = OpaqueRef;
pub type VdiRef = OpaqueRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerState {
    Running,
    Halted,
    Suspended,
    Paused,
    #[serde(other)]
    Unknown,
}

impl PowerState {
    pub fn parse(s: &str) -> Self {
        match s {
            "Running" => PowerState::Running,
            "Halted" => PowerState::Halted,
            "Suspended" => PowerState::Suspended,
            "Paused" => PowerState::Paused,
            _ => PowerState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::Running => "Running",
            PowerState::Halted => "Halted",
            PowerState::Suspended => "Suspended",
            PowerState::Paused => "Paused",
            PowerState::Unknown => "Unknown",
        }
    }
}

pub type BootParams = BTreeMap<String, String>;

#[derive(Debug, Clone, Default)]
pub struct HostRecord {
    pub uuid: String,
    pub name_label: String,
    pub hostname: String,
    pub address: String,
    pub enabled: bool,
    pub product_brand: String,
    pub product_version: String,
    pub build_number: String,
    pub metrics: Option<OpaqueRef>,
}

#[derive(Debug, Clone, Default)]
pub struct HostMetricsRecord {
    pub memory_total: u64,
    pub memory_free: u64,
}

#[derive(Debug, Clone)]
pub struct VmRecord {
    pub uuid: String,
    pub name_label: String,
    pub power_state: PowerState,
    pub is_a_template: bool,
    pub is_control_domain: bool,
    pub metrics: Option<OpaqueRef>,
    pub guest_metrics: Option<OpaqueRef>,
}

#[derive(Debug, Clone, Default)]
pub struct VmMetricsRecord {
    pub memory_actual: u64,
    /// "%Y%m%dT%H:%M:%SZ"
    pub start_time: String,
}

#[derive(Debug, Clone, Default)]
pub struct GuestMetricsRecord {
    /// "Name|kernel|..." as reported by the guest tools
    pub os_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbdKind {
    Disk,
    Cd,
}

#[derive(Debug, Clone)]
pub struct VbdRecord {
    pub kind: VbdKind,
    pub empty: bool,
    pub vdi: Option<VdiRef>,
}

#[derive(Debug, Clone)]
pub struct VdiRecord {
    pub uuid: String,
    pub name_label: String,
    pub is_a_snapshot: bool,
    pub vbd_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CdSource {
    IsoLibrary,
    HostDrive { host: String },
}

#[derive(Debug, Clone)]
pub struct CdImage {
    pub vdi: VdiRef,
    pub uuid: String,
    pub name_label: String,
    pub source: CdSource,
}

#[async_trait]
pub trait Hypervisor: Send + Sync {
    async fn login(&self, pool: &PoolDesc) -> Result<Box<dyn Session>, RemoteError>;
}

#[async_trait]
pub trait Session: Send + Sync {
    // lookups
    async fn vm_by_uuid(&self, uuid: &str) -> Result<VmRef, RemoteError>;
    async fn vm_by_name(&self, name: &str) -> Result<VmRef, RemoteError>;
    async fn host_by_name(&self, name: &str) -> Result<HostRef, RemoteError>;
    async fn pool_master(&self) -> Result<HostRef, RemoteError>;

    // VM properties
    async fn vm_name_label(&self, vm: &VmRef) -> Result<String, RemoteError>;
    async fn vm_description(&self, vm: &VmRef) -> Result<String, RemoteError>;
    async fn vm_power_state(&self, vm: &VmRef) -> Result<PowerState, RemoteError>;
    async fn vm_vcpus(&self, vm: &VmRef) -> Result<u32, RemoteError>;
    async fn vm_boot_policy(&self, vm: &VmRef) -> Result<String, RemoteError>;
    async fn set_vm_boot_policy(&self, vm: &VmRef, policy: &str) -> Result<(), RemoteError>;
    async fn vm_boot_params(&self, vm: &VmRef) -> Result<BootParams, RemoteError>;
    async fn set_vm_boot_params(&self, vm: &VmRef, params: &BootParams) -> Result<(), RemoteError>;
    async fn vm_restart_priority(&self, vm: &VmRef) -> Result<String, RemoteError>;
    async fn vm_ha_always_run(&self, vm: &VmRef) -> Result<bool, RemoteError>;
    async fn set_vm_ha_always_run(&self, vm: &VmRef, value: bool) -> Result<(), RemoteError>;
    async fn vm_affinity(&self, vm: &VmRef) -> Result<Option<HostRef>, RemoteError>;
    async fn vm_resident_on(&self, vm: &VmRef) -> Result<Option<HostRef>, RemoteError>;
    async fn vm_possible_hosts(&self, vm: &VmRef) -> Result<Vec<HostRef>, RemoteError>;
    async fn vm_vbds(&self, vm: &VmRef) -> Result<Vec<VbdRef>, RemoteError>;
    async fn vm_snapshots(&self, vm: &VmRef) -> Result<Vec<VmRef>, RemoteError>;
    async fn host_name_label(&self, host: &HostRef) -> Result<String, RemoteError>;

    // lifecycle
    async fn vm_start(&self, vm: &VmRef) -> Result<(), RemoteError>;
    async fn vm_start_on(&self, vm: &VmRef, host: &HostRef) -> Result<(), RemoteError>;
    async fn vm_resume(&self, vm: &VmRef) -> Result<(), RemoteError>;
    async fn vm_resume_on(&self, vm: &VmRef, host: &HostRef) -> Result<(), RemoteError>;
    async fn vm_migrate(&self, vm: &VmRef, host: &HostRef) -> Result<(), RemoteError>;
    async fn vm_clean_shutdown(&self, vm: &VmRef) -> Result<(), RemoteError>;
    async fn vm_hard_shutdown(&self, vm: &VmRef) -> Result<(), RemoteError>;
    async fn vm_clean_reboot(&self, vm: &VmRef) -> Result<(), RemoteError>;
    async fn vm_hard_reboot(&self, vm: &VmRef) -> Result<(), RemoteError>;
    async fn vm_suspend(&self, vm: &VmRef) -> Result<(), RemoteError>;

    // snapshots
    async fn vm_snapshot(&self, vm: &VmRef, name: &str) -> Result<VmRef, RemoteError>;
    async fn vm_revert(&self, snapshot: &VmRef) -> Result<(), RemoteError>;
    async fn vm_destroy(&self, vm: &VmRef) -> Result<(), RemoteError>;

    // block devices
    async fn vbd_record(&self, vbd: &VbdRef) -> Result<VbdRecord, RemoteError>;
    async fn vbd_eject(&self, vbd: &VbdRef) -> Result<(), RemoteError>;
    async fn vbd_insert(&self, vbd: &VbdRef, vdi: &VdiRef) -> Result<(), RemoteError>;
    async fn vdi_record(&self, vdi: &VdiRef) -> Result<VdiRecord, RemoteError>;
    async fn vdi_destroy(&self, vdi: &VdiRef) -> Result<(), RemoteError>;
    async fn cd_images(&self) -> Result<Vec<CdImage>, RemoteError>;

    // bulk reads for aggregation
    async fn host_records(&self) -> Result<BTreeMap<HostRef, HostRecord>, RemoteError>;
    async fn host_metrics_records(&self) -> Result<BTreeMap<OpaqueRef, HostMetricsRecord>, RemoteError>;
    async fn vm_records(&self) -> Result<BTreeMap<VmRef, VmRecord>, RemoteError>;
    async fn vm_metrics_records(&self) -> Result<BTreeMap<OpaqueRef, VmMetricsRecord>, RemoteError>;
    async fn guest_metrics_records(&self) -> Result<BTreeMap<OpaqueRef, GuestMetricsRecord>, RemoteError>;

    async fn logout(&self);
}
