//! In-memory hypervisor pool.
//!
//! Seeded from the `simulation` section of kernel.yaml. State changes are applied
//! for real (power state, resident host, boot settings, HA flag, snapshots, CD
//! drives) so the kernel can run end to end without a hypervisor. Every call is
//! recorded, and any method can be made to fail, which is what the tests lean on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use time::macros::format_description;
use time::OffsetDateTime;

use super::{
    BootParams, CdImage, CdSource, GuestMetricsRecord, HostMetricsRecord, HostRecord, HostRef, Hypervisor,
    OpaqueRef, PowerState, Session, VbdKind, VbdRecord, VbdRef, VdiRecord, VdiRef, VmMetricsRecord, VmRecord, VmRef,
};
use crate::config::PoolDesc;
use crate::error::RemoteError;
use crate::state::{new_state, Shared};

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationConf {
    #[serde(default)]
    pub pools: Vec<SimPoolConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimPoolConf {
    pub name: String,
    /// Defaults to the first host.
    #[serde(default)]
    pub master: Option<String>,
    #[serde(default)]
    pub hosts: Vec<SimHostConf>,
    #[serde(default)]
    pub vms: Vec<SimVmConf>,
    #[serde(default)]
    pub iso_images: Vec<String>,
    /// Method names that fail from the start, e.g. "VM.start".
    #[serde(default)]
    pub fail: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimHostConf {
    pub name_label: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub address: String,
    #[serde(default = "yes")]
    pub enabled: bool,
    #[serde(default = "default_host_memory_gb")]
    pub memory_total_gb: u64,
    #[serde(default)]
    pub memory_free_gb: u64,
    #[serde(default)]
    pub drives: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimVmConf {
    #[serde(default)]
    pub uuid: Option<String>,
    pub name_label: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "halted")]
    pub power_state: PowerState,
    #[serde(default)]
    pub resident_on: Option<String>,
    #[serde(default)]
    pub affinity: Option<String>,
    /// Defaults to every enabled host.
    #[serde(default)]
    pub possible_hosts: Option<Vec<String>>,
    #[serde(default = "default_boot_policy")]
    pub boot_policy: String,
    #[serde(default)]
    pub boot_order: Option<String>,
    #[serde(default)]
    pub restart_priority: String,
    #[serde(default)]
    pub ha_always_run: bool,
    #[serde(default = "default_vm_memory_mb")]
    pub memory_mb: u64,
    #[serde(default = "one")]
    pub vcpus: u32,
    #[serde(default)]
    pub os_name: String,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub snapshots: Vec<String>,
}

fn yes() -> bool {
    true
}
fn one() -> u32 {
    1
}
fn halted() -> PowerState {
    PowerState::Halted
}
fn default_host_memory_gb() -> u64 {
    64
}
fn default_vm_memory_mb() -> u64 {
    1024
}
fn default_boot_policy() -> String {
    "BIOS order".into()
}

#[derive(Debug, Clone)]
pub struct SimHost {
    pub uuid: String,
    pub name_label: String,
    pub hostname: String,
    pub address: String,
    pub enabled: bool,
    pub memory_total: u64,
    pub memory_free: u64,
}

#[derive(Debug, Clone)]
pub struct SimVm {
    pub uuid: String,
    pub name_label: String,
    pub description: String,
    pub power_state: PowerState,
    pub resident_on: Option<HostRef>,
    pub affinity: Option<HostRef>,
    pub possible_hosts: Option<Vec<HostRef>>,
    pub boot_policy: String,
    pub boot_params: BootParams,
    pub restart_priority: String,
    pub ha_always_run: bool,
    pub memory_actual: u64,
    pub vcpus: u32,
    pub os_name: String,
    pub start_time: String,
    pub is_a_template: bool,
    pub is_control_domain: bool,
    pub snapshot_of: Option<VmRef>,
    pub vbds: Vec<VbdRef>,
}

#[derive(Debug, Clone)]
struct SimVbd {
    kind: VbdKind,
    vdi: Option<VdiRef>,
}

#[derive(Debug, Clone)]
struct SimVdi {
    uuid: String,
    name_label: String,
    is_a_snapshot: bool,
    cd_source: Option<CdSource>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCall {
    pub method: String,
    pub target: String,
    pub detail: String,
}

pub struct SimPool {
    master: HostRef,
    hosts: BTreeMap<HostRef, SimHost>,
    vms: BTreeMap<VmRef, SimVm>,
    vbds: BTreeMap<VbdRef, SimVbd>,
    vdis: BTreeMap<VdiRef, SimVdi>,
    calls: Vec<SimCall>,
    failing: HashSet<String>,
    next_id: u64,
}

fn now_stamp() -> String {
    OffsetDateTime::now_utc()
        .format(format_description!("[year][month][day]T[hour]:[minute]:[second]Z"))
        .unwrap_or_default()
}

fn handle_invalid(what: &OpaqueRef) -> RemoteError {
    RemoteError::NoSuchObject(format!("HANDLE_INVALID {what}"))
}

fn bad_power_state(method: &str, state: PowerState) -> RemoteError {
    RemoteError::call(method, format!("VM_BAD_POWER_STATE {}", state.as_str()))
}

impl SimPool {
    fn from_conf(conf: &SimPoolConf) -> Self {
        let mut pool = SimPool {
            master: OpaqueRef::new("OpaqueRef:NULL"),
            hosts: BTreeMap::new(),
            vms: BTreeMap::new(),
            vbds: BTreeMap::new(),
            vdis: BTreeMap::new(),
            calls: Vec::new(),
            failing: conf.fail.iter().cloned().collect(),
            next_id: 0,
        };

        let mut by_name: HashMap<String, HostRef> = HashMap::new();
        for hc in &conf.hosts {
            let href = pool.fresh("host");
            by_name.insert(hc.name_label.clone(), href.clone());
            pool.hosts.insert(
                href.clone(),
                SimHost {
                    uuid: pool.fresh_uuid(),
                    name_label: hc.name_label.clone(),
                    hostname: hc.hostname.clone().unwrap_or_else(|| hc.name_label.clone()),
                    address: hc.address.clone(),
                    enabled: hc.enabled,
                    memory_total: hc.memory_total_gb * GIB,
                    memory_free: hc.memory_free_gb * GIB,
                },
            );
            for drive in &hc.drives {
                pool.add_vdi(drive, false, Some(CdSource::HostDrive { host: hc.name_label.clone() }));
            }
        }
        let master_name = conf.master.clone().or_else(|| conf.hosts.first().map(|h| h.name_label.clone()));
        if let Some(m) = master_name.and_then(|n| by_name.get(&n).cloned()) {
            pool.master = m;
        }
        for iso in &conf.iso_images {
            pool.add_vdi(iso, false, Some(CdSource::IsoLibrary));
        }

        let resolve = |name: &Option<String>| name.as_ref().and_then(|n| by_name.get(n).cloned());
        for vc in &conf.vms {
            let vref = pool.fresh("vm");
            let mut boot_params = BootParams::new();
            if let Some(order) = &vc.boot_order {
                boot_params.insert("order".into(), order.clone());
            }
            let running = vc.power_state == PowerState::Running;
            let vm = SimVm {
                uuid: vc.uuid.clone().unwrap_or_else(|| pool.fresh_uuid()),
                name_label: vc.name_label.clone(),
                description: vc.description.clone(),
                power_state: vc.power_state,
                resident_on: resolve(&vc.resident_on).or_else(|| running.then(|| pool.master.clone())),
                affinity: resolve(&vc.affinity),
                possible_hosts: vc
                    .possible_hosts
                    .as_ref()
                    .map(|names| names.iter().filter_map(|n| by_name.get(n).cloned()).collect()),
                boot_policy: vc.boot_policy.clone(),
                boot_params,
                restart_priority: vc.restart_priority.clone(),
                ha_always_run: vc.ha_always_run,
                memory_actual: vc.memory_mb * MIB,
                vcpus: vc.vcpus,
                os_name: vc.os_name.clone(),
                start_time: vc.start_time.clone().unwrap_or_else(|| if running { now_stamp() } else { String::new() }),
                is_a_template: false,
                is_control_domain: false,
                snapshot_of: None,
                vbds: Vec::new(),
            };
            pool.vms.insert(vref.clone(), vm);

            let disk = pool.add_vdi(&format!("{} disk 0", vc.name_label), false, None);
            pool.attach(&vref, VbdKind::Disk, Some(disk));
            pool.attach(&vref, VbdKind::Cd, None);
            for snap in &vc.snapshots {
                let _ = pool.snapshot_vm(&vref, snap);
            }
        }
        pool
    }

    fn fresh(&mut self, kind: &str) -> OpaqueRef {
        self.next_id += 1;
        OpaqueRef::new(format!("OpaqueRef:{kind}-{}", self.next_id))
    }

    fn fresh_uuid(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn add_vdi(&mut self, name: &str, is_a_snapshot: bool, cd_source: Option<CdSource>) -> VdiRef {
        let r = self.fresh("vdi");
        let uuid = self.fresh_uuid();
        self.vdis.insert(r.clone(), SimVdi { uuid, name_label: name.to_string(), is_a_snapshot, cd_source });
        r
    }

    fn attach(&mut self, vm: &VmRef, kind: VbdKind, vdi: Option<VdiRef>) -> VbdRef {
        let r = self.fresh("vbd");
        self.vbds.insert(r.clone(), SimVbd { kind, vdi });
        if let Some(v) = self.vms.get_mut(vm) {
            v.vbds.push(r.clone());
        }
        r
    }

    fn snapshot_vm(&mut self, vm: &VmRef, name: &str) -> Result<VmRef, RemoteError> {
        let source = self.vms.get(vm).cloned().ok_or_else(|| handle_invalid(vm))?;
        let sref = self.fresh("vm");
        let snapshot = SimVm {
            uuid: self.fresh_uuid(),
            name_label: name.to_string(),
            power_state: PowerState::Halted,
            resident_on: None,
            is_a_template: true,
            snapshot_of: Some(vm.clone()),
            vbds: Vec::new(),
            ..source.clone()
        };
        self.vms.insert(sref.clone(), snapshot);
        for vbd in &source.vbds {
            let Some(SimVbd { kind: VbdKind::Disk, .. }) = self.vbds.get(vbd) else { continue };
            let disk = self.add_vdi(&format!("{name} disk"), true, None);
            self.attach(&sref, VbdKind::Disk, Some(disk));
        }
        Ok(sref)
    }

    fn vm(&self, vm: &VmRef) -> Result<&SimVm, RemoteError> {
        self.vms.get(vm).ok_or_else(|| handle_invalid(vm))
    }

    fn vm_mut(&mut self, vm: &VmRef) -> Result<&mut SimVm, RemoteError> {
        self.vms.get_mut(vm).ok_or_else(|| handle_invalid(vm))
    }

    fn host(&self, host: &HostRef) -> Result<&SimHost, RemoteError> {
        self.hosts.get(host).ok_or_else(|| handle_invalid(host))
    }

    fn note(&mut self, detail: String) {
        if let Some(last) = self.calls.last_mut() {
            last.detail = detail;
        }
    }

    /// Boot settings as seen by the firmware at start time.
    fn note_boot(&mut self, vm: &VmRef) {
        if let Some(v) = self.vms.get(vm) {
            let order = v.boot_params.get("order").cloned().unwrap_or_default();
            let detail = format!("policy={};order={order}", v.boot_policy);
            self.note(detail);
        }
    }

    fn eligible(&self, vm: &SimVm, host: &HostRef) -> bool {
        let enabled = self.hosts.get(host).is_some_and(|h| h.enabled);
        enabled && vm.possible_hosts.as_ref().map_or(true, |hosts| hosts.contains(host))
    }

    fn power_on(&mut self, method: &str, vm: &VmRef, from: PowerState, on: Option<&HostRef>) -> Result<(), RemoteError> {
        let current = self.vm(vm)?;
        if current.power_state != from {
            return Err(bad_power_state(method, current.power_state));
        }
        let target = match on {
            Some(h) => h.clone(),
            None => current
                .affinity
                .clone()
                .filter(|a| self.eligible(current, a))
                .unwrap_or_else(|| self.master.clone()),
        };
        if !self.eligible(current, &target) {
            return Err(RemoteError::call(method, format!("VM_HOST_INCOMPATIBLE {target}")));
        }
        self.note_boot(vm);
        let v = self.vm_mut(vm)?;
        v.power_state = PowerState::Running;
        v.resident_on = Some(target);
        v.start_time = now_stamp();
        Ok(())
    }

    fn power_off(&mut self, method: &str, vm: &VmRef, allowed: &[PowerState]) -> Result<(), RemoteError> {
        let v = self.vm_mut(vm)?;
        if !allowed.contains(&v.power_state) {
            return Err(bad_power_state(method, v.power_state));
        }
        v.power_state = PowerState::Halted;
        v.resident_on = None;
        v.start_time.clear();
        Ok(())
    }

    fn reboot(&mut self, method: &str, vm: &VmRef) -> Result<(), RemoteError> {
        let v = self.vm_mut(vm)?;
        if v.power_state != PowerState::Running {
            return Err(bad_power_state(method, v.power_state));
        }
        v.start_time = now_stamp();
        Ok(())
    }

    fn vbd_count(&self, vdi: &VdiRef) -> usize {
        self.vbds.values().filter(|b| b.vdi.as_ref() == Some(vdi)).count()
    }

    /// Inspection helpers for tests and demos.
    pub fn calls(&self) -> &[SimCall] {
        &self.calls
    }

    pub fn methods(&self) -> Vec<&str> {
        self.calls.iter().map(|c| c.method.as_str()).collect()
    }

    pub fn clear_calls(&mut self) {
        self.calls.clear();
    }

    pub fn fail(&mut self, method: &str) {
        self.failing.insert(method.to_string());
    }

    pub fn heal(&mut self, method: &str) {
        self.failing.remove(method);
    }

    pub fn vm_named(&self, label: &str) -> Option<(&VmRef, &SimVm)> {
        self.vms.iter().find(|(_, v)| v.name_label == label && !v.is_a_template)
    }

    pub fn host_named(&self, label: &str) -> Option<&HostRef> {
        self.hosts.iter().find(|(_, h)| h.name_label == label).map(|(r, _)| r)
    }

    pub fn vdi_exists(&self, vdi: &VdiRef) -> bool {
        self.vdis.contains_key(vdi)
    }

    pub fn snapshots_of(&self, vm: &VmRef) -> Vec<(VmRef, String)> {
        self.vms
            .iter()
            .filter(|(_, v)| v.snapshot_of.as_ref() == Some(vm))
            .map(|(r, v)| (r.clone(), v.name_label.clone()))
            .collect()
    }

    pub fn disk_vdis(&self, vm: &VmRef) -> Vec<VdiRef> {
        let Some(v) = self.vms.get(vm) else { return Vec::new() };
        v.vbds
            .iter()
            .filter_map(|b| self.vbds.get(b))
            .filter(|b| b.kind == VbdKind::Disk)
            .filter_map(|b| b.vdi.clone())
            .collect()
    }

    pub fn cd_drive(&self, vm: &VmRef) -> Option<Option<String>> {
        let v = self.vms.get(vm)?;
        let vbd = v.vbds.iter().filter_map(|b| self.vbds.get(b)).find(|b| b.kind == VbdKind::Cd)?;
        Some(vbd.vdi.as_ref().and_then(|d| self.vdis.get(d)).map(|d| d.uuid.clone()))
    }

    pub fn iso_uuid(&self, name: &str) -> Option<String> {
        self.vdis.values().find(|d| d.name_label == name && d.cd_source.is_some()).map(|d| d.uuid.clone())
    }
}

pub struct SimulatedHypervisor {
    pools: HashMap<String, Shared<SimPool>>,
}

impl SimulatedHypervisor {
    pub fn from_conf(conf: &SimulationConf) -> Self {
        let pools = conf.pools.iter().map(|p| (p.name.clone(), new_state(SimPool::from_conf(p)))).collect();
        Self { pools }
    }

    pub fn pool(&self, name: &str) -> Option<Shared<SimPool>> {
        self.pools.get(name).cloned()
    }
}

#[async_trait]
impl Hypervisor for SimulatedHypervisor {
    async fn login(&self, pool: &PoolDesc) -> Result<Box<dyn Session>, RemoteError> {
        let Some(state) = self.pools.get(&pool.name) else {
            return Err(RemoteError::Transport(format!("no simulated pool {}", pool.name)));
        };
        {
            let mut p = state.lock();
            p.calls.push(SimCall { method: "session.login".into(), target: pool.name.clone(), detail: String::new() });
            if p.failing.contains("session.login") {
                return Err(RemoteError::call("session.login", "injected failure"));
            }
        }
        Ok(Box::new(SimSession { pool: state.clone() }))
    }
}

pub struct SimSession {
    pool: Shared<SimPool>,
}

impl SimSession {
    fn call<T>(
        &self,
        method: &str,
        target: impl ToString,
        f: impl FnOnce(&mut SimPool) -> Result<T, RemoteError>,
    ) -> Result<T, RemoteError> {
        let mut pool = self.pool.lock();
        pool.calls.push(SimCall { method: method.to_string(), target: target.to_string(), detail: String::new() });
        if pool.failing.contains(method) {
            return Err(RemoteError::call(method, "injected failure"));
        }
        f(&mut pool)
    }
}

#[async_trait]
impl Session for SimSession {
    async fn vm_by_uuid(&self, uuid: &str) -> Result<VmRef, RemoteError> {
        self.call("VM.get_by_uuid", uuid, |p| {
            p.vms
                .iter()
                .find(|(_, v)| v.uuid == uuid)
                .map(|(r, _)| r.clone())
                .ok_or_else(|| RemoteError::NoSuchObject(format!("UUID_INVALID {uuid}")))
        })
    }

    async fn vm_by_name(&self, name: &str) -> Result<VmRef, RemoteError> {
        self.call("VM.get_by_name_label", name, |p| {
            p.vm_named(name).map(|(r, _)| r.clone()).ok_or_else(|| RemoteError::NoSuchObject(name.to_string()))
        })
    }

    async fn host_by_name(&self, name: &str) -> Result<HostRef, RemoteError> {
        self.call("host.get_by_name_label", name, |p| {
            p.host_named(name).cloned().ok_or_else(|| RemoteError::NoSuchObject(name.to_string()))
        })
    }

    async fn pool_master(&self) -> Result<HostRef, RemoteError> {
        self.call("pool.get_master", "", |p| Ok(p.master.clone()))
    }

    async fn vm_name_label(&self, vm: &VmRef) -> Result<String, RemoteError> {
        self.call("VM.get_name_label", vm, |p| Ok(p.vm(vm)?.name_label.clone()))
    }

    async fn vm_description(&self, vm: &VmRef) -> Result<String, RemoteError> {
        self.call("VM.get_name_description", vm, |p| Ok(p.vm(vm)?.description.clone()))
    }

    async fn vm_power_state(&self, vm: &VmRef) -> Result<PowerState, RemoteError> {
        self.call("VM.get_power_state", vm, |p| Ok(p.vm(vm)?.power_state))
    }

    async fn vm_vcpus(&self, vm: &VmRef) -> Result<u32, RemoteError> {
        self.call("VM.get_VCPUs_at_startup", vm, |p| Ok(p.vm(vm)?.vcpus))
    }

    async fn vm_boot_policy(&self, vm: &VmRef) -> Result<String, RemoteError> {
        self.call("VM.get_HVM_boot_policy", vm, |p| Ok(p.vm(vm)?.boot_policy.clone()))
    }

    async fn set_vm_boot_policy(&self, vm: &VmRef, policy: &str) -> Result<(), RemoteError> {
        self.call("VM.set_HVM_boot_policy", vm, |p| {
            p.note(policy.to_string());
            p.vm_mut(vm)?.boot_policy = policy.to_string();
            Ok(())
        })
    }

    async fn vm_boot_params(&self, vm: &VmRef) -> Result<BootParams, RemoteError> {
        self.call("VM.get_HVM_boot_params", vm, |p| Ok(p.vm(vm)?.boot_params.clone()))
    }

    async fn set_vm_boot_params(&self, vm: &VmRef, params: &BootParams) -> Result<(), RemoteError> {
        self.call("VM.set_HVM_boot_params", vm, |p| {
            p.note(params.get("order").cloned().unwrap_or_default());
            p.vm_mut(vm)?.boot_params = params.clone();
            Ok(())
        })
    }

    async fn vm_restart_priority(&self, vm: &VmRef) -> Result<String, RemoteError> {
        self.call("VM.get_ha_restart_priority", vm, |p| Ok(p.vm(vm)?.restart_priority.clone()))
    }

    async fn vm_ha_always_run(&self, vm: &VmRef) -> Result<bool, RemoteError> {
        self.call("VM.get_ha_always_run", vm, |p| Ok(p.vm(vm)?.ha_always_run))
    }

    async fn set_vm_ha_always_run(&self, vm: &VmRef, value: bool) -> Result<(), RemoteError> {
        self.call("VM.set_ha_always_run", vm, |p| {
            p.note(value.to_string());
            p.vm_mut(vm)?.ha_always_run = value;
            Ok(())
        })
    }

    async fn vm_affinity(&self, vm: &VmRef) -> Result<Option<HostRef>, RemoteError> {
        self.call("VM.get_affinity", vm, |p| Ok(p.vm(vm)?.affinity.clone()))
    }

    async fn vm_resident_on(&self, vm: &VmRef) -> Result<Option<HostRef>, RemoteError> {
        self.call("VM.get_resident_on", vm, |p| Ok(p.vm(vm)?.resident_on.clone()))
    }

    async fn vm_possible_hosts(&self, vm: &VmRef) -> Result<Vec<HostRef>, RemoteError> {
        self.call("VM.get_possible_hosts", vm, |p| {
            let v = p.vm(vm)?;
            Ok(p.hosts.keys().filter(|h| p.eligible(v, h)).cloned().collect())
        })
    }

    async fn vm_vbds(&self, vm: &VmRef) -> Result<Vec<VbdRef>, RemoteError> {
        self.call("VM.get_VBDs", vm, |p| Ok(p.vm(vm)?.vbds.clone()))
    }

    async fn vm_snapshots(&self, vm: &VmRef) -> Result<Vec<VmRef>, RemoteError> {
        self.call("VM.get_snapshots", vm, |p| {
            p.vm(vm)?;
            Ok(p.snapshots_of(vm).into_iter().map(|(r, _)| r).collect())
        })
    }

    async fn host_name_label(&self, host: &HostRef) -> Result<String, RemoteError> {
        self.call("host.get_name_label", host, |p| Ok(p.host(host)?.name_label.clone()))
    }

    async fn vm_start(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.call("VM.start", vm, |p| p.power_on("VM.start", vm, PowerState::Halted, None))
    }

    async fn vm_start_on(&self, vm: &VmRef, host: &HostRef) -> Result<(), RemoteError> {
        self.call("VM.start_on", vm, |p| p.power_on("VM.start_on", vm, PowerState::Halted, Some(host)))
    }

    async fn vm_resume(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.call("VM.resume", vm, |p| p.power_on("VM.resume", vm, PowerState::Suspended, None))
    }

    async fn vm_resume_on(&self, vm: &VmRef, host: &HostRef) -> Result<(), RemoteError> {
        self.call("VM.resume_on", vm, |p| p.power_on("VM.resume_on", vm, PowerState::Suspended, Some(host)))
    }

    async fn vm_migrate(&self, vm: &VmRef, host: &HostRef) -> Result<(), RemoteError> {
        self.call("VM.pool_migrate", vm, |p| {
            let v = p.vm(vm)?;
            if v.power_state != PowerState::Running {
                return Err(bad_power_state("VM.pool_migrate", v.power_state));
            }
            if v.resident_on.as_ref() == Some(host) || !p.eligible(v, host) {
                return Err(RemoteError::call("VM.pool_migrate", format!("HOST_NOT_ENOUGH_FREE_MEMORY {host}")));
            }
            p.note(host.to_string());
            p.vm_mut(vm)?.resident_on = Some(host.clone());
            Ok(())
        })
    }

    async fn vm_clean_shutdown(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.call("VM.clean_shutdown", vm, |p| p.power_off("VM.clean_shutdown", vm, &[PowerState::Running]))
    }

    async fn vm_hard_shutdown(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.call("VM.hard_shutdown", vm, |p| {
            p.power_off(
                "VM.hard_shutdown",
                vm,
                &[PowerState::Running, PowerState::Suspended, PowerState::Paused],
            )
        })
    }

    async fn vm_clean_reboot(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.call("VM.clean_reboot", vm, |p| p.reboot("VM.clean_reboot", vm))
    }

    async fn vm_hard_reboot(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.call("VM.hard_reboot", vm, |p| p.reboot("VM.hard_reboot", vm))
    }

    async fn vm_suspend(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.call("VM.suspend", vm, |p| {
            let v = p.vm_mut(vm)?;
            if v.power_state != PowerState::Running {
                return Err(bad_power_state("VM.suspend", v.power_state));
            }
            v.power_state = PowerState::Suspended;
            v.resident_on = None;
            Ok(())
        })
    }

    async fn vm_snapshot(&self, vm: &VmRef, name: &str) -> Result<VmRef, RemoteError> {
        self.call("VM.snapshot", vm, |p| p.snapshot_vm(vm, name))
    }

    async fn vm_revert(&self, snapshot: &VmRef) -> Result<(), RemoteError> {
        self.call("VM.revert", snapshot, |p| {
            let parent = p.vm(snapshot)?.snapshot_of.clone().ok_or_else(|| handle_invalid(snapshot))?;
            let v = p.vm_mut(&parent)?;
            v.power_state = PowerState::Halted;
            v.resident_on = None;
            v.start_time.clear();
            Ok(())
        })
    }

    async fn vm_destroy(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.call("VM.destroy", vm, |p| {
            let removed = p.vms.remove(vm).ok_or_else(|| handle_invalid(vm))?;
            for vbd in &removed.vbds {
                p.vbds.remove(vbd);
            }
            Ok(())
        })
    }

    async fn vbd_record(&self, vbd: &VbdRef) -> Result<VbdRecord, RemoteError> {
        self.call("VBD.get_record", vbd, |p| {
            let b = p.vbds.get(vbd).ok_or_else(|| handle_invalid(vbd))?;
            Ok(VbdRecord { kind: b.kind, empty: b.vdi.is_none(), vdi: b.vdi.clone() })
        })
    }

    async fn vbd_eject(&self, vbd: &VbdRef) -> Result<(), RemoteError> {
        self.call("VBD.eject", vbd, |p| {
            let b = p.vbds.get_mut(vbd).ok_or_else(|| handle_invalid(vbd))?;
            if b.vdi.take().is_none() {
                return Err(RemoteError::call("VBD.eject", "VBD_IS_EMPTY"));
            }
            Ok(())
        })
    }

    async fn vbd_insert(&self, vbd: &VbdRef, vdi: &VdiRef) -> Result<(), RemoteError> {
        self.call("VBD.insert", vbd, |p| {
            if !p.vdis.contains_key(vdi) {
                return Err(handle_invalid(vdi));
            }
            let b = p.vbds.get_mut(vbd).ok_or_else(|| handle_invalid(vbd))?;
            if b.vdi.is_some() {
                return Err(RemoteError::call("VBD.insert", "VBD_NOT_EMPTY"));
            }
            p.note(vdi.to_string());
            if let Some(b) = p.vbds.get_mut(vbd) {
                b.vdi = Some(vdi.clone());
            }
            Ok(())
        })
    }

    async fn vdi_record(&self, vdi: &VdiRef) -> Result<VdiRecord, RemoteError> {
        self.call("VDI.get_record", vdi, |p| {
            let d = p.vdis.get(vdi).ok_or_else(|| handle_invalid(vdi))?;
            Ok(VdiRecord {
                uuid: d.uuid.clone(),
                name_label: d.name_label.clone(),
                is_a_snapshot: d.is_a_snapshot,
                vbd_count: p.vbd_count(vdi),
            })
        })
    }

    async fn vdi_destroy(&self, vdi: &VdiRef) -> Result<(), RemoteError> {
        self.call("VDI.destroy", vdi, |p| {
            if p.vbd_count(vdi) > 0 {
                return Err(RemoteError::call("VDI.destroy", "VDI_IN_USE"));
            }
            p.vdis.remove(vdi).map(|_| ()).ok_or_else(|| handle_invalid(vdi))
        })
    }

    async fn cd_images(&self) -> Result<Vec<CdImage>, RemoteError> {
        self.call("SR.get_cd_images", "", |p| {
            let mut images: Vec<CdImage> = p
                .vdis
                .iter()
                .filter_map(|(r, d)| {
                    Some(CdImage {
                        vdi: r.clone(),
                        uuid: d.uuid.clone(),
                        name_label: d.name_label.clone(),
                        source: d.cd_source.clone()?,
                    })
                })
                .collect();
            images.sort_by(|a, b| a.name_label.cmp(&b.name_label));
            Ok(images)
        })
    }

    async fn host_records(&self) -> Result<BTreeMap<HostRef, HostRecord>, RemoteError> {
        self.call("host.get_all_records", "", |p| {
            Ok(p.hosts
                .iter()
                .map(|(r, h)| {
                    let rec = HostRecord {
                        uuid: h.uuid.clone(),
                        name_label: h.name_label.clone(),
                        hostname: h.hostname.clone(),
                        address: h.address.clone(),
                        enabled: h.enabled,
                        product_brand: "XCP-ng".into(),
                        product_version: "8.2.1".into(),
                        build_number: "release/yangtze".into(),
                        metrics: Some(OpaqueRef::new(format!("{r}/metrics"))),
                    };
                    (r.clone(), rec)
                })
                .collect())
        })
    }

    async fn host_metrics_records(&self) -> Result<BTreeMap<OpaqueRef, HostMetricsRecord>, RemoteError> {
        self.call("host_metrics.get_all_records", "", |p| {
            Ok(p.hosts
                .iter()
                .map(|(r, h)| {
                    let rec = HostMetricsRecord { memory_total: h.memory_total, memory_free: h.memory_free };
                    (OpaqueRef::new(format!("{r}/metrics")), rec)
                })
                .collect())
        })
    }

    async fn vm_records(&self) -> Result<BTreeMap<VmRef, VmRecord>, RemoteError> {
        self.call("VM.get_all_records", "", |p| {
            Ok(p.vms
                .iter()
                .map(|(r, v)| {
                    let rec = VmRecord {
                        uuid: v.uuid.clone(),
                        name_label: v.name_label.clone(),
                        power_state: v.power_state,
                        is_a_template: v.is_a_template,
                        is_control_domain: v.is_control_domain,
                        metrics: Some(OpaqueRef::new(format!("{r}/metrics"))),
                        guest_metrics: Some(OpaqueRef::new(format!("{r}/guest"))),
                    };
                    (r.clone(), rec)
                })
                .collect())
        })
    }

    async fn vm_metrics_records(&self) -> Result<BTreeMap<OpaqueRef, VmMetricsRecord>, RemoteError> {
        self.call("VM_metrics.get_all_records", "", |p| {
            Ok(p.vms
                .iter()
                .map(|(r, v)| {
                    let rec = VmMetricsRecord { memory_actual: v.memory_actual, start_time: v.start_time.clone() };
                    (OpaqueRef::new(format!("{r}/metrics")), rec)
                })
                .collect())
        })
    }

    async fn guest_metrics_records(&self) -> Result<BTreeMap<OpaqueRef, GuestMetricsRecord>, RemoteError> {
        self.call("VM_guest_metrics.get_all_records", "", |p| {
            Ok(p.vms
                .iter()
                .filter(|(_, v)| !v.os_name.is_empty())
                .map(|(r, v)| (OpaqueRef::new(format!("{r}/guest")), GuestMetricsRecord { os_name: v.os_name.clone() }))
                .collect())
        })
    }

    async fn logout(&self) {
        let _ = self.call("session.logout", "", |_| Ok(()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelConfig, Registry};

    const FIXTURE: &str = r#"
backend: simulated
pools:
  - name: lab
    hosts: [{ name: xs1 }, { name: xs2 }]
    vms: [{ name: web01 }]
simulation:
  pools:
    - name: lab
      hosts:
        - { name_label: xs1, memory_free_gb: 10 }
        - { name_label: xs2 }
      iso_images: [debian.iso]
      vms:
        - { name_label: web01, boot_order: c, snapshots: [before-upgrade] }
"#;

    fn setup() -> (SimulatedHypervisor, Registry) {
        let cfg: KernelConfig = serde_yaml::from_str(FIXTURE).unwrap();
        let sim = SimulatedHypervisor::from_conf(cfg.simulation.as_ref().unwrap());
        (sim, Registry::from_config(&cfg).unwrap())
    }

    #[tokio::test]
    async fn start_then_shutdown_moves_power_state() {
        let (sim, reg) = setup();
        let s = sim.login(reg.pool("lab").unwrap()).await.unwrap();
        let vm = s.vm_by_name("web01").await.unwrap();

        assert_eq!(s.vm_power_state(&vm).await.unwrap(), PowerState::Halted);
        s.vm_start(&vm).await.unwrap();
        assert_eq!(s.vm_power_state(&vm).await.unwrap(), PowerState::Running);
        assert!(s.vm_resident_on(&vm).await.unwrap().is_some());
        // starting twice is a power state error
        assert!(s.vm_start(&vm).await.is_err());

        s.vm_hard_shutdown(&vm).await.unwrap();
        assert_eq!(s.vm_power_state(&vm).await.unwrap(), PowerState::Halted);
        s.logout().await;

        let pool = sim.pool("lab").unwrap();
        let methods = pool.lock().methods().join(",");
        assert!(methods.starts_with("session.login,"));
        assert!(methods.ends_with(",session.logout"));
    }

    #[tokio::test]
    async fn injected_failures_surface_as_remote_errors() {
        let (sim, reg) = setup();
        sim.pool("lab").unwrap().lock().fail("VM.start");
        let s = sim.login(reg.pool("lab").unwrap()).await.unwrap();
        let vm = s.vm_by_name("web01").await.unwrap();
        assert!(matches!(s.vm_start(&vm).await, Err(RemoteError::Call { .. })));
        assert_eq!(s.vm_power_state(&vm).await.unwrap(), PowerState::Halted);

        sim.pool("lab").unwrap().lock().fail("session.login");
        assert!(sim.login(reg.pool("lab").unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn seeded_snapshots_are_templates_with_snapshot_disks() {
        let (sim, reg) = setup();
        let s = sim.login(reg.pool("lab").unwrap()).await.unwrap();
        let vm = s.vm_by_name("web01").await.unwrap();
        let snaps = s.vm_snapshots(&vm).await.unwrap();
        assert_eq!(snaps.len(), 1);

        let records = s.vm_records().await.unwrap();
        assert!(records[&snaps[0]].is_a_template);

        let vbds = s.vm_vbds(&snaps[0]).await.unwrap();
        let rec = s.vbd_record(&vbds[0]).await.unwrap();
        let vdi = s.vdi_record(rec.vdi.as_ref().unwrap()).await.unwrap();
        assert!(vdi.is_a_snapshot);
        assert_eq!(vdi.vbd_count, 1);
    }

    #[tokio::test]
    async fn cd_drive_insert_and_eject() {
        let (sim, reg) = setup();
        let s = sim.login(reg.pool("lab").unwrap()).await.unwrap();
        let vm = s.vm_by_name("web01").await.unwrap();
        let images = s.cd_images().await.unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].source, CdSource::IsoLibrary);

        let mut cd = None;
        for vbd in s.vm_vbds(&vm).await.unwrap() {
            if s.vbd_record(&vbd).await.unwrap().kind == VbdKind::Cd {
                cd = Some(vbd);
            }
        }
        let cd = cd.unwrap();
        assert!(s.vbd_eject(&cd).await.is_err());
        s.vbd_insert(&cd, &images[0].vdi).await.unwrap();
        assert!(!s.vbd_record(&cd).await.unwrap().empty);
        s.vbd_eject(&cd).await.unwrap();
        assert!(s.vbd_record(&cd).await.unwrap().empty);
    }
}
