/**
 * XENAPI BACKEND - JSON-RPC client for the pool master
 *
 * - POST https://<host>/jsonrpc, one session per request
 * - login walks the configured hosts in order; a HOST_IS_SLAVE answer carries
 *   the master address, which is tried once before moving on
 * - results are decoded leniently (XenAPI sends int64 as number or string)
 */

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{
    BootParams, CdImage, CdSource, GuestMetricsRecord, HostMetricsRecord, HostRecord, HostRef, Hypervisor,
    OpaqueRef, PowerState, Session, VbdKind, VbdRecord, VbdRef, VdiRecord, VdiRef, VmMetricsRecord, VmRecord, VmRef,
};
use crate::config::{ManagerConf, PoolDesc};
use crate::error::RemoteError;

pub struct XenApi {
    http: reqwest::Client,
    strict: reqwest::Client,
}

impl XenApi {
    pub fn new() -> Result<Self, RemoteError> {
        let build = |insecure: bool| {
            reqwest::Client::builder()
                .danger_accept_invalid_certs(insecure)
                .build()
                .map_err(|e| RemoteError::Transport(e.to_string()))
        };
        Ok(Self { http: build(true)?, strict: build(false)? })
    }

    fn client(&self, manager: &ManagerConf) -> &reqwest::Client {
        if manager.accept_invalid_certs { &self.http } else { &self.strict }
    }
}

const LOGIN: &str = "session.login_with_password";

#[async_trait]
impl Hypervisor for XenApi {
    async fn login(&self, pool: &PoolDesc) -> Result<Box<dyn Session>, RemoteError> {
        let Some(manager) = &pool.manager else {
            return Err(RemoteError::Transport(format!("pool {} has no manager credentials", pool.name)));
        };
        let http = self.client(manager).clone();
        let endpoints: Vec<String> = pool.hosts.iter().map(|h| h.endpoint(&pool.domain)).collect();
        if endpoints.is_empty() {
            return Err(RemoteError::Transport(format!("pool {} has no hosts", pool.name)));
        }

        let session = walk_hosts(&endpoints, |endpoint| {
            let url = format!("https://{endpoint}/jsonrpc");
            let mut session = XenSession { http: http.clone(), url, session: String::new(), ids: AtomicU64::new(0) };
            let params = vec![json!(manager.username), json!(manager.password), json!("1.0"), json!("poolwarden")];
            async move {
                match session.rpc(LOGIN, params).await {
                    Ok(Value::String(id)) => {
                        session.session = id;
                        Ok(session)
                    }
                    Ok(other) => Err(Fault { code: "UNEXPECTED_RESULT".into(), data: vec![other] }),
                    Err(fault) => Err(fault),
                }
            }
        })
        .await?;
        Ok(Box::new(session))
    }
}

/// Tries each configured host in order. A HOST_IS_SLAVE answer is followed
/// once to the master it names; bad credentials stop the walk.
async fn walk_hosts<T, F, Fut>(endpoints: &[String], mut attempt: F) -> Result<T, RemoteError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, Fault>>,
{
    let mut last = RemoteError::Transport("no hosts configured".into());
    for endpoint in endpoints {
        let mut target = endpoint.clone();
        let mut redirected = false;
        loop {
            match attempt(target.clone()).await {
                Ok(v) => return Ok(v),
                Err(fault) if fault.code == "SESSION_AUTHENTICATION_FAILED" => {
                    tracing::warn!(endpoint = %target, "[xenapi] authentication rejected");
                    return Err(fault.into_remote(LOGIN));
                }
                Err(fault) if fault.code == "HOST_IS_SLAVE" && !redirected => {
                    let master = fault.data.first().and_then(Value::as_str).map(str::to_string);
                    last = fault.into_remote(LOGIN);
                    let Some(master) = master else { break };
                    tracing::debug!(%master, from = %target, "[xenapi] redirected to pool master");
                    target = master;
                    redirected = true;
                }
                Err(fault) => {
                    tracing::warn!(endpoint = %target, error = %fault.code, "[xenapi] login failed");
                    last = fault.into_remote(LOGIN);
                    break;
                }
            }
        }
    }
    Err(last)
}

#[derive(Debug)]
struct Fault {
    code: String,
    data: Vec<Value>,
}

impl Fault {
    fn into_remote(self, method: &str) -> RemoteError {
        match self.code.as_str() {
            "HANDLE_INVALID" | "UUID_INVALID" => RemoteError::NoSuchObject(format!("{} {:?}", self.code, self.data)),
            "TRANSPORT" => RemoteError::Transport(self.data.first().map(|v| v.to_string()).unwrap_or_default()),
            _ => RemoteError::call(method, self.code),
        }
    }
}

pub struct XenSession {
    http: reqwest::Client,
    url: String,
    session: String,
    ids: AtomicU64,
}

fn transport(e: impl std::fmt::Display) -> Fault {
    Fault { code: "TRANSPORT".into(), data: vec![Value::String(e.to_string())] }
}

impl XenSession {
    async fn rpc(&self, method: &str, params: Vec<Value>) -> Result<Value, Fault> {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let body = json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": id });
        let resp: Value = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(transport)?
            .json()
            .await
            .map_err(transport)?;

        if let Some(err) = resp.get("error").filter(|e| !e.is_null()) {
            let mut data = err.get("data").and_then(Value::as_array).cloned().unwrap_or_default();
            let code = match err.get("message").and_then(Value::as_str) {
                Some(m) => m.to_string(),
                None if data.first().is_some_and(Value::is_string) => as_string(&data.remove(0)),
                None => "UNKNOWN_ERROR".to_string(),
            };
            return Err(Fault { code, data });
        }
        Ok(resp.get("result").cloned().unwrap_or(Value::Null))
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RemoteError> {
        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(Value::String(self.session.clone()));
        params.extend(args);
        self.rpc(method, params).await.map_err(|f| f.into_remote(method))
    }

    async fn get(&self, method: &str, obj: &OpaqueRef) -> Result<Value, RemoteError> {
        self.call(method, vec![json!(obj.as_str())]).await
    }

    async fn unit(&self, method: &str, args: Vec<Value>) -> Result<(), RemoteError> {
        self.call(method, args).await.map(|_| ())
    }

    async fn get_string(&self, method: &str, obj: &OpaqueRef) -> Result<String, RemoteError> {
        Ok(as_string(&self.get(method, obj).await?))
    }

    async fn get_ref(&self, method: &str, obj: &OpaqueRef) -> Result<Option<OpaqueRef>, RemoteError> {
        Ok(as_ref(&self.get(method, obj).await?))
    }

    async fn get_refs(&self, method: &str, obj: &OpaqueRef) -> Result<Vec<OpaqueRef>, RemoteError> {
        Ok(as_refs(&self.get(method, obj).await?))
    }

    async fn records(&self, method: &str) -> Result<BTreeMap<OpaqueRef, Value>, RemoteError> {
        let all = self.call(method, vec![]).await?;
        let Value::Object(map) = all else {
            return Err(RemoteError::call(method, "expected a record map"));
        };
        Ok(map.into_iter().map(|(k, v)| (OpaqueRef(k), v)).collect())
    }
}

fn as_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn as_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::String(s) => s == "true",
        _ => false,
    }
}

fn as_u64(v: &Value) -> u64 {
    match v {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn as_ref(v: &Value) -> Option<OpaqueRef> {
    v.as_str().map(OpaqueRef::new).filter(|r| !r.is_null())
}

fn as_refs(v: &Value) -> Vec<OpaqueRef> {
    v.as_array().map(|a| a.iter().filter_map(as_ref).collect()).unwrap_or_default()
}

fn field<'a>(rec: &'a Value, key: &str) -> &'a Value {
    rec.get(key).unwrap_or(&Value::Null)
}

fn host_record(rec: &Value) -> HostRecord {
    let sw = field(rec, "software_version");
    HostRecord {
        uuid: as_string(field(rec, "uuid")),
        name_label: as_string(field(rec, "name_label")),
        hostname: as_string(field(rec, "hostname")),
        address: as_string(field(rec, "address")),
        enabled: as_bool(field(rec, "enabled")),
        product_brand: as_string(field(sw, "product_brand")),
        product_version: as_string(field(sw, "product_version")),
        build_number: as_string(field(sw, "build_number")),
        metrics: as_ref(field(rec, "metrics")),
    }
}

fn vm_record(rec: &Value) -> VmRecord {
    VmRecord {
        uuid: as_string(field(rec, "uuid")),
        name_label: as_string(field(rec, "name_label")),
        power_state: PowerState::parse(&as_string(field(rec, "power_state"))),
        is_a_template: as_bool(field(rec, "is_a_template")),
        is_control_domain: as_bool(field(rec, "is_control_domain")),
        metrics: as_ref(field(rec, "metrics")),
        guest_metrics: as_ref(field(rec, "guest_metrics")),
    }
}

#[async_trait]
impl Session for XenSession {
    async fn vm_by_uuid(&self, uuid: &str) -> Result<VmRef, RemoteError> {
        as_ref(&self.call("VM.get_by_uuid", vec![json!(uuid)]).await?)
            .ok_or_else(|| RemoteError::NoSuchObject(uuid.to_string()))
    }

    async fn vm_by_name(&self, name: &str) -> Result<VmRef, RemoteError> {
        as_refs(&self.call("VM.get_by_name_label", vec![json!(name)]).await?)
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::NoSuchObject(name.to_string()))
    }

    async fn host_by_name(&self, name: &str) -> Result<HostRef, RemoteError> {
        as_refs(&self.call("host.get_by_name_label", vec![json!(name)]).await?)
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::NoSuchObject(name.to_string()))
    }

    async fn pool_master(&self) -> Result<HostRef, RemoteError> {
        let pools = as_refs(&self.call("pool.get_all", vec![]).await?);
        let pool = pools.first().ok_or_else(|| RemoteError::NoSuchObject("pool".into()))?;
        self.get_ref("pool.get_master", pool).await?.ok_or_else(|| RemoteError::NoSuchObject("pool master".into()))
    }

    async fn vm_name_label(&self, vm: &VmRef) -> Result<String, RemoteError> {
        self.get_string("VM.get_name_label", vm).await
    }

    async fn vm_description(&self, vm: &VmRef) -> Result<String, RemoteError> {
        self.get_string("VM.get_name_description", vm).await
    }

    async fn vm_power_state(&self, vm: &VmRef) -> Result<PowerState, RemoteError> {
        Ok(PowerState::parse(&self.get_string("VM.get_power_state", vm).await?))
    }

    async fn vm_vcpus(&self, vm: &VmRef) -> Result<u32, RemoteError> {
        Ok(as_u64(&self.get("VM.get_VCPUs_at_startup", vm).await?) as u32)
    }

    async fn vm_boot_policy(&self, vm: &VmRef) -> Result<String, RemoteError> {
        self.get_string("VM.get_HVM_boot_policy", vm).await
    }

    async fn set_vm_boot_policy(&self, vm: &VmRef, policy: &str) -> Result<(), RemoteError> {
        self.unit("VM.set_HVM_boot_policy", vec![json!(vm.as_str()), json!(policy)]).await
    }

    async fn vm_boot_params(&self, vm: &VmRef) -> Result<BootParams, RemoteError> {
        let v = self.get("VM.get_HVM_boot_params", vm).await?;
        let map = v.as_object().ok_or_else(|| RemoteError::call("VM.get_HVM_boot_params", "expected a map"))?;
        Ok(map.iter().map(|(k, v)| (k.clone(), as_string(v))).collect())
    }

    async fn set_vm_boot_params(&self, vm: &VmRef, params: &BootParams) -> Result<(), RemoteError> {
        self.unit("VM.set_HVM_boot_params", vec![json!(vm.as_str()), json!(params)]).await
    }

    async fn vm_restart_priority(&self, vm: &VmRef) -> Result<String, RemoteError> {
        self.get_string("VM.get_ha_restart_priority", vm).await
    }

    async fn vm_ha_always_run(&self, vm: &VmRef) -> Result<bool, RemoteError> {
        Ok(as_bool(&self.get("VM.get_ha_always_run", vm).await?))
    }

    async fn set_vm_ha_always_run(&self, vm: &VmRef, value: bool) -> Result<(), RemoteError> {
        self.unit("VM.set_ha_always_run", vec![json!(vm.as_str()), json!(value)]).await
    }

    async fn vm_affinity(&self, vm: &VmRef) -> Result<Option<HostRef>, RemoteError> {
        self.get_ref("VM.get_affinity", vm).await
    }

    async fn vm_resident_on(&self, vm: &VmRef) -> Result<Option<HostRef>, RemoteError> {
        self.get_ref("VM.get_resident_on", vm).await
    }

    async fn vm_possible_hosts(&self, vm: &VmRef) -> Result<Vec<HostRef>, RemoteError> {
        self.get_refs("VM.get_possible_hosts", vm).await
    }

    async fn vm_vbds(&self, vm: &VmRef) -> Result<Vec<VbdRef>, RemoteError> {
        self.get_refs("VM.get_VBDs", vm).await
    }

    async fn vm_snapshots(&self, vm: &VmRef) -> Result<Vec<VmRef>, RemoteError> {
        self.get_refs("VM.get_snapshots", vm).await
    }

    async fn host_name_label(&self, host: &HostRef) -> Result<String, RemoteError> {
        self.get_string("host.get_name_label", host).await
    }

    async fn vm_start(&self, vm: &VmRef) -> Result<(), RemoteError> {
        // start_paused=false, force=false
        self.unit("VM.start", vec![json!(vm.as_str()), json!(false), json!(false)]).await
    }

    async fn vm_start_on(&self, vm: &VmRef, host: &HostRef) -> Result<(), RemoteError> {
        self.unit("VM.start_on", vec![json!(vm.as_str()), json!(host.as_str()), json!(false), json!(false)]).await
    }

    async fn vm_resume(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.unit("VM.resume", vec![json!(vm.as_str()), json!(false), json!(false)]).await
    }

    async fn vm_resume_on(&self, vm: &VmRef, host: &HostRef) -> Result<(), RemoteError> {
        self.unit("VM.resume_on", vec![json!(vm.as_str()), json!(host.as_str()), json!(false), json!(false)]).await
    }

    async fn vm_migrate(&self, vm: &VmRef, host: &HostRef) -> Result<(), RemoteError> {
        let options = json!({ "live": "true" });
        self.unit("VM.pool_migrate", vec![json!(vm.as_str()), json!(host.as_str()), options]).await
    }

    async fn vm_clean_shutdown(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.unit("VM.clean_shutdown", vec![json!(vm.as_str())]).await
    }

    async fn vm_hard_shutdown(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.unit("VM.hard_shutdown", vec![json!(vm.as_str())]).await
    }

    async fn vm_clean_reboot(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.unit("VM.clean_reboot", vec![json!(vm.as_str())]).await
    }

    async fn vm_hard_reboot(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.unit("VM.hard_reboot", vec![json!(vm.as_str())]).await
    }

    async fn vm_suspend(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.unit("VM.suspend", vec![json!(vm.as_str())]).await
    }

    async fn vm_snapshot(&self, vm: &VmRef, name: &str) -> Result<VmRef, RemoteError> {
        as_ref(&self.call("VM.snapshot", vec![json!(vm.as_str()), json!(name)]).await?)
            .ok_or_else(|| RemoteError::call("VM.snapshot", "no snapshot reference returned"))
    }

    async fn vm_revert(&self, snapshot: &VmRef) -> Result<(), RemoteError> {
        self.unit("VM.revert", vec![json!(snapshot.as_str())]).await
    }

    async fn vm_destroy(&self, vm: &VmRef) -> Result<(), RemoteError> {
        self.unit("VM.destroy", vec![json!(vm.as_str())]).await
    }

    async fn vbd_record(&self, vbd: &VbdRef) -> Result<VbdRecord, RemoteError> {
        let rec = self.get("VBD.get_record", vbd).await?;
        let kind = if as_string(field(&rec, "type")) == "CD" { VbdKind::Cd } else { VbdKind::Disk };
        Ok(VbdRecord { kind, empty: as_bool(field(&rec, "empty")), vdi: as_ref(field(&rec, "VDI")) })
    }

    async fn vbd_eject(&self, vbd: &VbdRef) -> Result<(), RemoteError> {
        self.unit("VBD.eject", vec![json!(vbd.as_str())]).await
    }

    async fn vbd_insert(&self, vbd: &VbdRef, vdi: &VdiRef) -> Result<(), RemoteError> {
        self.unit("VBD.insert", vec![json!(vbd.as_str()), json!(vdi.as_str())]).await
    }

    async fn vdi_record(&self, vdi: &VdiRef) -> Result<VdiRecord, RemoteError> {
        let rec = self.get("VDI.get_record", vdi).await?;
        Ok(VdiRecord {
            uuid: as_string(field(&rec, "uuid")),
            name_label: as_string(field(&rec, "name_label")),
            is_a_snapshot: as_bool(field(&rec, "is_a_snapshot")),
            vbd_count: as_refs(field(&rec, "VBDs")).len(),
        })
    }

    async fn vdi_destroy(&self, vdi: &VdiRef) -> Result<(), RemoteError> {
        self.unit("VDI.destroy", vec![json!(vdi.as_str())]).await
    }

    async fn cd_images(&self) -> Result<Vec<CdImage>, RemoteError> {
        let srs = self.records("SR.get_all_records").await?;
        let pbds = self.records("PBD.get_all_records").await?;
        let vdis = self.records("VDI.get_all_records").await?;

        let mut images = Vec::new();
        for (sr_ref, sr) in &srs {
            if as_string(field(sr, "content_type")) != "iso" {
                continue;
            }
            let source = if as_string(field(sr, "type")) == "udev" {
                // a physical drive belongs to the host of its (single) PBD
                let host = as_refs(field(sr, "PBDs"))
                    .first()
                    .and_then(|p| pbds.get(p))
                    .and_then(|p| as_ref(field(p, "host")));
                let name = match host {
                    Some(h) => self.host_name_label(&h).await.unwrap_or_default(),
                    None => String::new(),
                };
                CdSource::HostDrive { host: name }
            } else {
                CdSource::IsoLibrary
            };
            for (vdi_ref, vdi) in &vdis {
                if as_ref(field(vdi, "SR")).as_ref() != Some(sr_ref) {
                    continue;
                }
                images.push(CdImage {
                    vdi: vdi_ref.clone(),
                    uuid: as_string(field(vdi, "uuid")),
                    name_label: as_string(field(vdi, "name_label")),
                    source: source.clone(),
                });
            }
        }
        images.sort_by(|a, b| a.name_label.cmp(&b.name_label));
        Ok(images)
    }

    async fn host_records(&self) -> Result<BTreeMap<HostRef, HostRecord>, RemoteError> {
        Ok(self.records("host.get_all_records").await?.into_iter().map(|(r, v)| (r, host_record(&v))).collect())
    }

    async fn host_metrics_records(&self) -> Result<BTreeMap<OpaqueRef, HostMetricsRecord>, RemoteError> {
        let all = self.records("host_metrics.get_all_records").await?;
        Ok(all
            .into_iter()
            .map(|(r, v)| {
                let rec = HostMetricsRecord {
                    memory_total: as_u64(field(&v, "memory_total")),
                    memory_free: as_u64(field(&v, "memory_free")),
                };
                (r, rec)
            })
            .collect())
    }

    async fn vm_records(&self) -> Result<BTreeMap<VmRef, VmRecord>, RemoteError> {
        Ok(self.records("VM.get_all_records").await?.into_iter().map(|(r, v)| (r, vm_record(&v))).collect())
    }

    async fn vm_metrics_records(&self) -> Result<BTreeMap<OpaqueRef, VmMetricsRecord>, RemoteError> {
        let all = self.records("VM_metrics.get_all_records").await?;
        Ok(all
            .into_iter()
            .map(|(r, v)| {
                let rec = VmMetricsRecord {
                    memory_actual: as_u64(field(&v, "memory_actual")),
                    start_time: as_string(field(&v, "start_time")),
                };
                (r, rec)
            })
            .collect())
    }

    async fn guest_metrics_records(&self) -> Result<BTreeMap<OpaqueRef, GuestMetricsRecord>, RemoteError> {
        let all = self.records("VM_guest_metrics.get_all_records").await?;
        Ok(all
            .into_iter()
            .map(|(r, v)| (r, GuestMetricsRecord { os_name: as_string(field(field(&v, "os_version"), "name")) }))
            .collect())
    }

    async fn logout(&self) {
        if let Err(e) = self.rpc("session.logout", vec![json!(self.session)]).await {
            tracing::debug!(error = %e.code, "[xenapi] logout failed");
        }
    }
}
