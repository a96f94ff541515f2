/**
 * ACTION COORDINATOR - every mutating request against a VM goes through here
 *
 * SHAPES:
 * - single-phase : authorize -> resolve VM -> direct or compensated call
 * - two-phase    : prepare (authorize, resolve, list candidate hosts, sign a token)
 *                  then confirm (verify token, re-authorize, re-resolve VM and host, execute)
 *
 * RULES:
 * - authorization is re-checked on every call, whatever the client displayed
 * - nothing mutates before the VM (and the target host, if any) resolved
 * - one hypervisor session per call, logged out before returning
 */

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;

use crate::authz::{Action, Gate, Principal};
use crate::compensation::{self, StartKind};
use crate::config::{PoolDesc, Registry, VmDesc, VmIdent};
use crate::error::{ActionError, RemoteError};
use crate::hypervisor::{CdSource, Hypervisor, HostRef, Session, VbdKind, VbdRef, VmRef};
use crate::tokens::{ActionClaims, TokenSigner};

#[derive(Debug, Clone, Deserialize)]
pub struct ActionRequest {
    pub pool: String,
    pub vm: String,
    #[serde(default)]
    pub recovery: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfirmRequest {
    pub token: String,
    pub target: String,
    #[serde(default)]
    pub recovery: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub name: String,
    pub home: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Prepared {
    Ready {
        token: String,
        label: String,
        home: Option<String>,
        candidates: Vec<Candidate>,
        recovery_allowed: bool,
    },
    NoTargets {
        label: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsoleGrant {
    pub fullname: String,
    pub port: u16,
    pub kbdmouse: bool,
    /// Power controls offered inside the console window.
    pub controls: Vec<Action>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DvdImage {
    pub uuid: String,
    pub name: String,
    pub source: CdSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct DvdDrive {
    /// None when the drive is empty.
    pub current: Option<DvdImage>,
    pub images: Vec<DvdImage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmProperties {
    pub fullname: String,
    pub label: String,
    pub description: String,
    pub ha: &'static str,
    pub home: Option<String>,
    pub current: Option<String>,
    pub vcpus: Option<u32>,
    pub dvd: Option<DvdDrive>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum SnapshotOp {
    Create { name: String },
    Revert { snapshot: String },
    Delete { snapshot: String },
}

pub const DVD_EMPTY: &str = "empty";

pub fn ha_protection(restart_priority: &str) -> &'static str {
    match restart_priority {
        "1" | "restart" => "protected",
        "best-effort" => "restart if possible",
        _ => "do not restart",
    }
}

async fn resolve_vm(session: &dyn Session, vm: &VmDesc) -> Result<VmRef, ActionError> {
    let found = match &vm.ident {
        VmIdent::Uuid(uuid) => session.vm_by_uuid(uuid).await,
        VmIdent::Name(name) => session.vm_by_name(name).await,
    };
    found.map_err(|e| match e {
        RemoteError::NoSuchObject(_) => ActionError::NotFound(vm.fullname.clone()),
        other => ActionError::Remote(other),
    })
}

async fn vm_label(session: &dyn Session, vm: &VmDesc, vm_ref: &VmRef) -> String {
    match &vm.ident {
        VmIdent::Name(name) => name.clone(),
        VmIdent::Uuid(uuid) => session.vm_name_label(vm_ref).await.unwrap_or_else(|_| uuid.clone()),
    }
}

async fn host_name(session: &dyn Session, host: Option<HostRef>) -> Option<String> {
    session.host_name_label(&host?).await.ok()
}

async fn first_cd_drive(session: &dyn Session, vm: &VmRef) -> Result<Option<(VbdRef, Option<String>)>, ActionError> {
    for vbd in session.vm_vbds(vm).await? {
        let rec = session.vbd_record(&vbd).await?;
        if rec.kind != VbdKind::Cd {
            continue;
        }
        let inserted = match rec.vdi.filter(|_| !rec.empty) {
            Some(vdi) => Some(session.vdi_record(&vdi).await?.uuid),
            None => None,
        };
        return Ok(Some((vbd, inserted)));
    }
    Ok(None)
}

pub struct ActionCoordinator {
    registry: Arc<Registry>,
    gate: Gate,
    hypervisor: Arc<dyn Hypervisor>,
    tokens: TokenSigner,
}

impl ActionCoordinator {
    pub fn new(registry: Arc<Registry>, gate: Gate, hypervisor: Arc<dyn Hypervisor>, tokens: TokenSigner) -> Self {
        Self { registry, gate, hypervisor, tokens }
    }

    fn target(&self, pool: &str, vm: &str) -> Result<(&PoolDesc, &VmDesc), ActionError> {
        self.registry.vm(pool, vm).ok_or_else(|| ActionError::NotFound(crate::config::fullname(pool, vm)))
    }

    async fn open(&self, pool: &PoolDesc) -> Result<Box<dyn Session>, ActionError> {
        Ok(self.hypervisor.login(pool).await?)
    }

    /// Single-phase lifecycle actions.
    pub async fn perform(&self, principal: &Principal, action: Action, req: &ActionRequest) -> Result<(), ActionError> {
        let (pool, vm) = self.target(&req.pool, &req.vm)?;
        let recovery = req.recovery || action == Action::BootRecovery;

        match action {
            Action::Boot | Action::BootRecovery => {
                self.gate.check(principal, &pool.name, vm.id(), Action::Boot)?;
                if recovery {
                    self.gate.check(principal, &pool.name, vm.id(), Action::BootRecovery)?;
                }
            }
            Action::Shutdown
            | Action::Reboot
            | Action::Reset
            | Action::Poweroff
            | Action::Suspend
            | Action::Resume => self.gate.check(principal, &pool.name, vm.id(), action)?,
            // host-targeted actions only run through prepare/confirm
            other => {
                return Err(ActionError::NotFound(format!("{other} is not a single-phase action")));
            }
        }

        let session = self.open(pool).await?;
        let result = self.perform_in(session.as_ref(), vm, action, recovery).await;
        session.logout().await;
        result
    }

    async fn perform_in(&self, session: &dyn Session, vm: &VmDesc, action: Action, recovery: bool) -> Result<(), ActionError> {
        let vm_ref = resolve_vm(session, vm).await?;
        match action {
            Action::Boot | Action::BootRecovery => compensation::boot(session, &vm_ref, StartKind::Start, recovery).await,
            Action::Resume => compensation::start_with_ha(session, &vm_ref, StartKind::Resume).await,
            Action::Poweroff => compensation::poweroff(session, &vm_ref).await,
            Action::Shutdown => Ok(session.vm_clean_shutdown(&vm_ref).await?),
            Action::Reboot => Ok(session.vm_clean_reboot(&vm_ref).await?),
            Action::Reset => Ok(session.vm_hard_reboot(&vm_ref).await?),
            Action::Suspend => Ok(session.vm_suspend(&vm_ref).await?),
            other => Err(ActionError::NotFound(format!("{other} is not a single-phase action"))),
        }
    }

    /// Discovery phase of booton / resumeon / migrate.
    pub async fn prepare(&self, principal: &Principal, action: Action, pool: &str, vm: &str) -> Result<Prepared, ActionError> {
        if !action.is_two_phase() {
            return Err(ActionError::NotFound(format!("{action} has no discovery phase")));
        }
        let (pool, vm) = self.target(pool, vm)?;
        self.gate.check(principal, &pool.name, vm.id(), action)?;

        let session = self.open(pool).await?;
        let result = self.prepare_in(session.as_ref(), principal, action, pool, vm).await;
        session.logout().await;
        result
    }

    async fn prepare_in(
        &self,
        session: &dyn Session,
        principal: &Principal,
        action: Action,
        pool: &PoolDesc,
        vm: &VmDesc,
    ) -> Result<Prepared, ActionError> {
        let vm_ref = resolve_vm(session, vm).await?;
        let label = vm_label(session, vm, &vm_ref).await;
        let home = host_name(session, session.vm_affinity(&vm_ref).await.ok().flatten()).await;

        let resident = if action == Action::Migrate { session.vm_resident_on(&vm_ref).await.ok().flatten() } else { None };

        let mut candidates = Vec::new();
        for host in session.vm_possible_hosts(&vm_ref).await? {
            if resident.as_ref() == Some(&host) {
                continue;
            }
            // unnamed hosts cannot be picked by name later
            let Ok(name) = session.host_name_label(&host).await else { continue };
            let is_home = home.as_deref() == Some(name.as_str());
            candidates.push(Candidate { name, home: is_home });
        }
        candidates.sort_by(|a, b| a.name.cmp(&b.name));

        if candidates.is_empty() {
            tracing::info!(%principal, vm = %vm.fullname, %action, "[coordinator] no eligible targets");
            return Ok(Prepared::NoTargets { label });
        }

        let recovery_allowed =
            action == Action::BootOn && self.gate.authorize(principal, &pool.name, vm.id(), Action::BootRecovery);
        let claims = ActionClaims {
            principal: principal.name().to_string(),
            pool: pool.name.clone(),
            vm: vm.id().to_string(),
            action,
            candidates: candidates.iter().map(|c| c.name.clone()).collect(),
            expires_at: 0,
        };
        let token = self.tokens.issue(claims, OffsetDateTime::now_utc());
        Ok(Prepared::Ready { token, label, home, candidates, recovery_allowed })
    }

    /// Execution phase: runs only against a host offered by a valid token.
    pub async fn confirm(&self, principal: &Principal, req: &ConfirmRequest) -> Result<(), ActionError> {
        let claims = self.tokens.verify(&req.token, OffsetDateTime::now_utc())?;
        if claims.principal != principal.name() {
            return Err(ActionError::Denied {
                principal: principal.to_string(),
                action: claims.action,
                target: crate::config::fullname(&claims.pool, &claims.vm),
            });
        }
        let (pool, vm) = self.target(&claims.pool, &claims.vm)?;
        self.gate.check(principal, &pool.name, vm.id(), claims.action)?;

        let recovery = req.recovery && claims.action == Action::BootOn;
        if recovery {
            self.gate.check(principal, &pool.name, vm.id(), Action::BootRecovery)?;
        }
        if !claims.candidates.iter().any(|c| c == &req.target) {
            return Err(ActionError::NotFound(format!("{} is not a candidate for {}", req.target, vm.fullname)));
        }

        let session = self.open(pool).await?;
        let result = self.confirm_in(session.as_ref(), vm, claims.action, &req.target, recovery).await;
        session.logout().await;
        result
    }

    async fn confirm_in(
        &self,
        session: &dyn Session,
        vm: &VmDesc,
        action: Action,
        target: &str,
        recovery: bool,
    ) -> Result<(), ActionError> {
        let vm_ref = resolve_vm(session, vm).await?;
        let host = session.host_by_name(target).await.map_err(|e| match e {
            RemoteError::NoSuchObject(_) => ActionError::NotFound(target.to_string()),
            other => ActionError::Remote(other),
        })?;

        match action {
            Action::BootOn => compensation::boot(session, &vm_ref, StartKind::StartOn(&host), recovery).await,
            Action::ResumeOn => compensation::start_with_ha(session, &vm_ref, StartKind::ResumeOn(&host)).await,
            Action::Migrate => Ok(session.vm_migrate(&vm_ref, &host).await?),
            other => Err(ActionError::NotFound(format!("{other} has no execution phase"))),
        }
    }

    pub fn console(&self, principal: &Principal, pool: &str, vm: &str) -> Result<ConsoleGrant, ActionError> {
        let (pool, vm) = self.target(pool, vm)?;
        self.gate.check(principal, &pool.name, vm.id(), Action::Console)?;
        let port = vm.console_port.ok_or_else(|| ActionError::NotFound(format!("{} has no console", vm.fullname)))?;

        let kbdmouse = self.gate.authorize(principal, &pool.name, vm.id(), Action::KbdMouse);
        let controls = if kbdmouse {
            [Action::Shutdown, Action::Reboot, Action::Reset]
                .into_iter()
                .filter(|a| self.gate.authorize(principal, &pool.name, vm.id(), *a))
                .collect()
        } else {
            Vec::new()
        };
        Ok(ConsoleGrant { fullname: vm.fullname.clone(), port, kbdmouse, controls })
    }

    pub async fn properties(&self, principal: &Principal, pool: &str, vm: &str) -> Result<VmProperties, ActionError> {
        let (pool, vm) = self.target(pool, vm)?;
        self.gate.check(principal, &pool.name, vm.id(), Action::Properties)?;

        let session = self.open(pool).await?;
        let result = self.properties_in(session.as_ref(), principal, pool, vm).await;
        session.logout().await;
        result
    }

    async fn properties_in(
        &self,
        session: &dyn Session,
        principal: &Principal,
        pool: &PoolDesc,
        vm: &VmDesc,
    ) -> Result<VmProperties, ActionError> {
        let vm_ref = resolve_vm(session, vm).await?;
        let label = vm_label(session, vm, &vm_ref).await;
        let description = session.vm_description(&vm_ref).await.unwrap_or_default();
        let priority = session.vm_restart_priority(&vm_ref).await.unwrap_or_default();
        let home = host_name(session, session.vm_affinity(&vm_ref).await.ok().flatten()).await;
        let current = host_name(session, session.vm_resident_on(&vm_ref).await.ok().flatten()).await;
        let vcpus = session.vm_vcpus(&vm_ref).await.ok();

        let iso = self.gate.authorize(principal, &pool.name, vm.id(), Action::DvdIso);
        let host_drive = self.gate.authorize(principal, &pool.name, vm.id(), Action::DvdHost);
        let dvd = match first_cd_drive(session, &vm_ref).await {
            Ok(Some((_, inserted))) => {
                let all = session.cd_images().await.unwrap_or_default();
                let current = inserted.and_then(|uuid| {
                    all.iter()
                        .find(|i| i.uuid == uuid)
                        .map(|i| DvdImage { uuid, name: i.name_label.clone(), source: i.source.clone() })
                });
                let images = all
                    .into_iter()
                    .filter(|i| match i.source {
                        CdSource::IsoLibrary => iso,
                        CdSource::HostDrive { .. } => host_drive,
                    })
                    .map(|i| DvdImage { uuid: i.uuid, name: i.name_label, source: i.source })
                    .collect();
                Some(DvdDrive { current, images })
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(vm = %vm.fullname, error = %e, "[coordinator] cd drive unreadable");
                None
            }
        };

        Ok(VmProperties {
            fullname: vm.fullname.clone(),
            label,
            description,
            ha: ha_protection(&priority),
            home,
            current,
            vcpus,
            dvd,
        })
    }

    /// Insert `image` (a CD image uuid) in the first CD drive, or eject with "empty".
    pub async fn change_dvd(&self, principal: &Principal, pool: &str, vm: &str, image: &str) -> Result<(), ActionError> {
        let (pool, vm) = self.target(pool, vm)?;
        let iso = self.gate.authorize(principal, &pool.name, vm.id(), Action::DvdIso);
        let host_drive = self.gate.authorize(principal, &pool.name, vm.id(), Action::DvdHost);
        if !iso && !host_drive {
            return Err(ActionError::Denied {
                principal: principal.to_string(),
                action: Action::DvdIso,
                target: vm.fullname.clone(),
            });
        }

        let session = self.open(pool).await?;
        let result = self.change_dvd_in(session.as_ref(), principal, vm, image, iso, host_drive).await;
        session.logout().await;
        result
    }

    async fn change_dvd_in(
        &self,
        session: &dyn Session,
        principal: &Principal,
        vm: &VmDesc,
        image: &str,
        iso: bool,
        host_drive: bool,
    ) -> Result<(), ActionError> {
        let vm_ref = resolve_vm(session, vm).await?;
        let (vbd, inserted) = first_cd_drive(session, &vm_ref)
            .await?
            .ok_or_else(|| ActionError::NotFound(format!("{} has no CD drive", vm.fullname)))?;

        if image == DVD_EMPTY {
            if inserted.is_some() {
                session.vbd_eject(&vbd).await?;
            }
            return Ok(());
        }

        let wanted = session
            .cd_images()
            .await?
            .into_iter()
            .find(|i| i.uuid == image)
            .ok_or_else(|| ActionError::NotFound(format!("CD image {image}")))?;
        let (allowed, needed) = match wanted.source {
            CdSource::IsoLibrary => (iso, Action::DvdIso),
            CdSource::HostDrive { .. } => (host_drive, Action::DvdHost),
        };
        if !allowed {
            return Err(ActionError::Denied { principal: principal.to_string(), action: needed, target: vm.fullname.clone() });
        }
        if inserted.as_deref() == Some(image) {
            return Ok(());
        }
        if inserted.is_some() {
            session.vbd_eject(&vbd).await?;
        }
        Ok(session.vbd_insert(&vbd, &wanted.vdi).await?)
    }

    pub async fn snapshots(&self, principal: &Principal, pool: &str, vm: &str) -> Result<Vec<SnapshotInfo>, ActionError> {
        let (pool, vm) = self.target(pool, vm)?;
        self.gate.check(principal, &pool.name, vm.id(), Action::Snapshot)?;

        let session = self.open(pool).await?;
        let result = async {
            let vm_ref = resolve_vm(session.as_ref(), vm).await?;
            list_snapshots(session.as_ref(), &vm_ref).await
        }
        .await;
        session.logout().await;
        result
    }

    pub async fn snapshot(&self, principal: &Principal, pool: &str, vm: &str, op: &SnapshotOp) -> Result<(), ActionError> {
        let (pool, vm) = self.target(pool, vm)?;
        self.gate.check(principal, &pool.name, vm.id(), Action::Snapshot)?;

        let session = self.open(pool).await?;
        let result = snapshot_in(session.as_ref(), vm, op).await;
        session.logout().await;
        result
    }
}

async fn list_snapshots(session: &dyn Session, vm: &VmRef) -> Result<Vec<SnapshotInfo>, ActionError> {
    let mut out = Vec::new();
    for snap in session.vm_snapshots(vm).await? {
        // a snapshot deleted concurrently just drops out of the list
        if let Ok(name) = session.vm_name_label(&snap).await {
            out.push(SnapshotInfo { id: snap.0, name });
        }
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

async fn snapshot_in(session: &dyn Session, vm: &VmDesc, op: &SnapshotOp) -> Result<(), ActionError> {
    let vm_ref = resolve_vm(session, vm).await?;
    match op {
        SnapshotOp::Create { name } => {
            let name = name.trim();
            if name.is_empty() {
                return Err(ActionError::NotFound("empty snapshot name".into()));
            }
            session.vm_snapshot(&vm_ref, name).await?;
            Ok(())
        }
        SnapshotOp::Revert { snapshot } => {
            let snap = owned_snapshot(session, vm, &vm_ref, snapshot).await?;
            Ok(session.vm_revert(&snap).await?)
        }
        SnapshotOp::Delete { snapshot } => {
            let snap = owned_snapshot(session, vm, &vm_ref, snapshot).await?;
            delete_snapshot(session, &snap).await
        }
    }
}

async fn owned_snapshot(session: &dyn Session, vm: &VmDesc, vm_ref: &VmRef, id: &str) -> Result<VmRef, ActionError> {
    session
        .vm_snapshots(vm_ref)
        .await?
        .into_iter()
        .find(|s| s.as_str() == id)
        .ok_or_else(|| ActionError::NotFound(format!("snapshot {id} of {}", vm.fullname)))
}

/// Destroy a snapshot VM, then the disk images that only it was using.
async fn delete_snapshot(session: &dyn Session, snap: &VmRef) -> Result<(), ActionError> {
    let mut orphans = Vec::new();
    for vbd in session.vm_vbds(snap).await? {
        let rec = session.vbd_record(&vbd).await?;
        let Some(vdi) = rec.vdi.filter(|_| rec.kind == VbdKind::Disk) else { continue };
        let info = session.vdi_record(&vdi).await?;
        if info.is_a_snapshot && info.vbd_count == 1 {
            orphans.push(vdi);
        }
    }

    session.vm_destroy(snap).await?;

    let mut first_error = None;
    for vdi in orphans {
        if let Err(e) = session.vdi_destroy(&vdi).await {
            tracing::warn!(%vdi, error = %e, "[coordinator] snapshot disk not destroyed");
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}
