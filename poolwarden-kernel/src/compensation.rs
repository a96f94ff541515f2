/**
 * COMPENSATING TRANSACTIONS - boot overrides and HA flags never outlive one attempt
 *
 * ROLE:
 * Wraps policy- and HA-sensitive operations so that temporary changes to a VM
 * are undone on every exit path.
 *
 * STATE MACHINE (per invocation):
 *   NORMAL -> OVERRIDE_PENDING -> OVERRIDE_ACTIVE -> RESTORING -> NORMAL
 *   - apply fails       : OVERRIDE_PENDING -> NORMAL (apply cleans up after itself)
 *   - guarded op runs   : OVERRIDE_ACTIVE, whatever its outcome
 *   - restore           : always for recovery boot, only on failure for the HA guard
 *
 * KNOWN GAP:
 * There is no durable log. A crash between apply and restore leaves the VM
 * altered; a failed restore is logged at error level for the same reason.
 */

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;

use crate::error::ActionError;
use crate::hypervisor::{BootParams, HostRef, Session, VmRef};

pub const RECOVERY_BOOT_POLICY: &str = "BIOS order";
/// CD/DVD first, then network.
pub const RECOVERY_BOOT_ORDER: &str = "dn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxnState {
    Normal,
    OverridePending,
    OverrideActive,
    Restoring,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestorePolicy {
    Always,
    OnFailure,
}

/// A temporary change made to a VM around a guarded operation.
#[async_trait]
pub trait Override: Send + Sync {
    /// Whatever `restore` needs to put things back.
    type Saved: Send;

    fn name(&self) -> &'static str;

    fn policy(&self) -> RestorePolicy;

    /// Either fully applied, or an error with nothing left behind.
    async fn apply(&self, session: &dyn Session, vm: &VmRef) -> Result<Self::Saved, ActionError>;

    async fn restore(&self, session: &dyn Session, vm: &VmRef, saved: Self::Saved);
}

struct Txn<'a> {
    name: &'static str,
    vm: &'a VmRef,
    state: TxnState,
    trail: Vec<TxnState>,
}

impl<'a> Txn<'a> {
    fn new(name: &'static str, vm: &'a VmRef) -> Self {
        Self { name, vm, state: TxnState::Normal, trail: vec![TxnState::Normal] }
    }

    fn enter(&mut self, next: TxnState) {
        tracing::debug!(txn = self.name, vm = %self.vm, from = ?self.state, to = ?next, "[txn] transition");
        self.state = next;
        self.trail.push(next);
    }
}

/// Result of a guarded operation plus the states it went through.
#[derive(Debug)]
pub struct Guarded<T> {
    pub result: Result<T, ActionError>,
    pub trail: Vec<TxnState>,
}

impl<T> Guarded<T> {
    pub fn into_result(self) -> Result<T, ActionError> {
        self.result
    }
}

/// Apply `ov`, run `op`, then restore according to the override's policy.
pub async fn guarded<O, T, F, Fut>(ov: &O, session: &dyn Session, vm: &VmRef, op: F) -> Guarded<T>
where
    O: Override,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, ActionError>>,
{
    let mut txn = Txn::new(ov.name(), vm);
    txn.enter(TxnState::OverridePending);

    let saved = match ov.apply(session, vm).await {
        Ok(saved) => saved,
        Err(e) => {
            txn.enter(TxnState::Normal);
            return Guarded { result: Err(e), trail: txn.trail };
        }
    };
    txn.enter(TxnState::OverrideActive);

    let result = op().await;

    let restore = match ov.policy() {
        RestorePolicy::Always => true,
        RestorePolicy::OnFailure => result.is_err(),
    };
    if restore {
        txn.enter(TxnState::Restoring);
        ov.restore(session, vm, saved).await;
    }
    txn.enter(TxnState::Normal);
    Guarded { result, trail: txn.trail }
}

/// Boot from CD/DVD then network for exactly one start attempt.
pub struct RecoveryBoot;

pub struct SavedBoot {
    policy: String,
    params: BootParams,
}

#[async_trait]
impl Override for RecoveryBoot {
    type Saved = SavedBoot;

    fn name(&self) -> &'static str {
        "recovery-boot"
    }

    fn policy(&self) -> RestorePolicy {
        RestorePolicy::Always
    }

    async fn apply(&self, session: &dyn Session, vm: &VmRef) -> Result<SavedBoot, ActionError> {
        let policy = session.vm_boot_policy(vm).await?;
        let params = session.vm_boot_params(vm).await?;

        let mut recovery = params.clone();
        recovery.insert("order".into(), RECOVERY_BOOT_ORDER.into());
        session.set_vm_boot_params(vm, &recovery).await?;

        if let Err(e) = session.set_vm_boot_policy(vm, RECOVERY_BOOT_POLICY).await {
            if let Err(undo) = session.set_vm_boot_params(vm, &params).await {
                tracing::error!(%vm, error = %undo, "[txn] could not roll back boot params");
            }
            return Err(e.into());
        }
        Ok(SavedBoot { policy, params })
    }

    async fn restore(&self, session: &dyn Session, vm: &VmRef, saved: SavedBoot) {
        if let Err(e) = session.set_vm_boot_policy(vm, &saved.policy).await {
            tracing::error!(%vm, error = %e, policy = %saved.policy, "[txn] boot policy left overridden");
        }
        if let Err(e) = session.set_vm_boot_params(vm, &saved.params).await {
            tracing::error!(%vm, error = %e, "[txn] boot params left overridden");
        }
    }
}

/// Keep HA from restarting a VM that is being forced off.
pub struct HaSuspended;

#[async_trait]
impl Override for HaSuspended {
    /// true when ha-always-run was on and has been switched off
    type Saved = bool;

    fn name(&self) -> &'static str {
        "ha-suspend"
    }

    fn policy(&self) -> RestorePolicy {
        RestorePolicy::OnFailure
    }

    async fn apply(&self, session: &dyn Session, vm: &VmRef) -> Result<bool, ActionError> {
        // an unreadable flag is left alone; the shutdown still proceeds
        match session.vm_ha_always_run(vm).await {
            Ok(true) => match session.set_vm_ha_always_run(vm, false).await {
                Ok(()) => Ok(true),
                Err(e) => {
                    tracing::warn!(%vm, error = %e, "[txn] could not disable ha-always-run");
                    Ok(false)
                }
            },
            Ok(false) => Ok(false),
            Err(e) => {
                tracing::warn!(%vm, error = %e, "[txn] could not read ha-always-run");
                Ok(false)
            }
        }
    }

    async fn restore(&self, session: &dyn Session, vm: &VmRef, was_on: bool) {
        if !was_on {
            return;
        }
        if let Err(e) = session.set_vm_ha_always_run(vm, true).await {
            tracing::error!(%vm, error = %e, "[txn] ha-always-run left disabled");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum StartKind<'h> {
    Start,
    StartOn(&'h HostRef),
    Resume,
    ResumeOn(&'h HostRef),
}

/// Start or resume, then re-arm HA when the VM has a restart priority but
/// ha-always-run was switched off (typically by an earlier poweroff).
pub async fn start_with_ha(session: &dyn Session, vm: &VmRef, kind: StartKind<'_>) -> Result<(), ActionError> {
    let priority = session.vm_restart_priority(vm).await.unwrap_or_default();
    let always = session.vm_ha_always_run(vm).await.ok();

    match kind {
        StartKind::Start => session.vm_start(vm).await?,
        StartKind::StartOn(host) => session.vm_start_on(vm, host).await?,
        StartKind::Resume => session.vm_resume(vm).await?,
        StartKind::ResumeOn(host) => session.vm_resume_on(vm, host).await?,
    }

    if !priority.is_empty() && always == Some(false) {
        if let Err(e) = session.set_vm_ha_always_run(vm, true).await {
            tracing::warn!(%vm, error = %e, "[txn] started, but ha-always-run not re-enabled");
        }
    }
    Ok(())
}

/// Start (optionally in recovery mode) with HA reconciliation.
pub async fn boot(session: &dyn Session, vm: &VmRef, kind: StartKind<'_>, recovery: bool) -> Result<(), ActionError> {
    if recovery {
        guarded(&RecoveryBoot, session, vm, || start_with_ha(session, vm, kind)).await.into_result()
    } else {
        start_with_ha(session, vm, kind).await
    }
}

/// Forced shutdown with ha-always-run switched off around it.
pub async fn poweroff(session: &dyn Session, vm: &VmRef) -> Result<(), ActionError> {
    guarded(&HaSuspended, session, vm, || async { session.vm_hard_shutdown(vm).await.map_err(ActionError::from) })
        .await
        .into_result()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelConfig, Registry};
    use crate::hypervisor::simulated::{SimPool, SimulatedHypervisor};
    use crate::hypervisor::{Hypervisor, PowerState};
    use crate::state::Shared;

    const FIXTURE: &str = r#"
pools:
  - name: p1
    hosts: [{ name: h1 }, { name: h2 }]
    vms: [{ name: v1 }, { name: ha1 }, { name: up1 }]
simulation:
  pools:
    - name: p1
      hosts: [{ name_label: h1 }, { name_label: h2 }]
      vms:
        - { name_label: v1, boot_policy: BIOS order, boot_order: c }
        - { name_label: ha1, restart_priority: restart, ha_always_run: false }
        - { name_label: up1, power_state: Running, restart_priority: restart, ha_always_run: true }
"#;

    async fn open(label: &str) -> (Box<dyn Session>, VmRef, Shared<SimPool>) {
        let cfg: KernelConfig = serde_yaml::from_str(FIXTURE).unwrap();
        let reg = Registry::from_config(&cfg).unwrap();
        let sim = SimulatedHypervisor::from_conf(cfg.simulation.as_ref().unwrap());
        let session = sim.login(reg.pool("p1").unwrap()).await.unwrap();
        let vm = session.vm_by_name(label).await.unwrap();
        let pool = sim.pool("p1").unwrap();
        pool.lock().clear_calls();
        (session, vm, pool)
    }

    fn boot_settings(pool: &Shared<SimPool>, label: &str) -> (String, Option<String>) {
        let p = pool.lock();
        let (_, vm) = p.vm_named(label).unwrap();
        (vm.boot_policy.clone(), vm.boot_params.get("order").cloned())
    }

    #[tokio::test]
    async fn recovery_boot_uses_dn_then_restores() {
        let (s, vm, pool) = open("v1").await;
        boot(s.as_ref(), &vm, StartKind::Start, true).await.unwrap();

        let p = pool.lock();
        let start = p.calls().iter().find(|c| c.method == "VM.start").unwrap();
        assert_eq!(start.detail, "policy=BIOS order;order=dn");
        assert_eq!(p.vm_named("v1").unwrap().1.power_state, PowerState::Running);
        drop(p);
        assert_eq!(boot_settings(&pool, "v1"), ("BIOS order".to_string(), Some("c".to_string())));
    }

    #[tokio::test]
    async fn recovery_boot_restores_when_start_fails() {
        let (s, vm, pool) = open("v1").await;
        pool.lock().fail("VM.start");

        let g = guarded(&RecoveryBoot, s.as_ref(), &vm, || start_with_ha(s.as_ref(), &vm, StartKind::Start)).await;
        assert!(g.result.is_err());
        assert_eq!(
            g.trail,
            vec![
                TxnState::Normal,
                TxnState::OverridePending,
                TxnState::OverrideActive,
                TxnState::Restoring,
                TxnState::Normal
            ]
        );
        assert_eq!(boot_settings(&pool, "v1"), ("BIOS order".to_string(), Some("c".to_string())));
        assert_eq!(pool.lock().vm_named("v1").unwrap().1.power_state, PowerState::Halted);
    }

    #[tokio::test]
    async fn policy_write_failure_rolls_back_params_and_never_starts() {
        let (s, vm, pool) = open("v1").await;
        pool.lock().fail("VM.set_HVM_boot_policy");

        let g = guarded(&RecoveryBoot, s.as_ref(), &vm, || start_with_ha(s.as_ref(), &vm, StartKind::Start)).await;
        assert!(g.result.is_err());
        assert_eq!(g.trail, vec![TxnState::Normal, TxnState::OverridePending, TxnState::Normal]);

        let p = pool.lock();
        assert!(!p.methods().contains(&"VM.start"));
        // params went to dn and straight back
        let param_writes: Vec<&str> = p
            .calls()
            .iter()
            .filter(|c| c.method == "VM.set_HVM_boot_params")
            .map(|c| c.detail.as_str())
            .collect();
        assert_eq!(param_writes, vec!["dn", "c"]);
        drop(p);
        assert_eq!(boot_settings(&pool, "v1"), ("BIOS order".to_string(), Some("c".to_string())));
    }

    #[tokio::test]
    async fn failed_read_or_params_write_mutates_nothing() {
        for method in ["VM.get_HVM_boot_params", "VM.set_HVM_boot_params"] {
            let (s, vm, pool) = open("v1").await;
            pool.lock().fail(method);
            assert!(boot(s.as_ref(), &vm, StartKind::Start, true).await.is_err());

            let p = pool.lock();
            assert!(!p.methods().contains(&"VM.set_HVM_boot_policy"), "{method}");
            assert!(!p.methods().contains(&"VM.start"), "{method}");
        }
    }

    #[tokio::test]
    async fn successful_start_rearms_ha() {
        let (s, vm, pool) = open("ha1").await;
        boot(s.as_ref(), &vm, StartKind::Start, false).await.unwrap();
        assert!(pool.lock().vm_named("ha1").unwrap().1.ha_always_run);
    }

    #[tokio::test]
    async fn failed_start_leaves_ha_alone() {
        let (s, vm, pool) = open("ha1").await;
        pool.lock().fail("VM.start");
        assert!(boot(s.as_ref(), &vm, StartKind::Start, false).await.is_err());
        assert!(!pool.lock().vm_named("ha1").unwrap().1.ha_always_run);
    }

    #[tokio::test]
    async fn poweroff_disables_ha_before_shutdown() {
        let (s, vm, pool) = open("up1").await;
        poweroff(s.as_ref(), &vm).await.unwrap();

        let p = pool.lock();
        let methods = p.methods();
        let disable = methods.iter().position(|m| *m == "VM.set_ha_always_run").unwrap();
        let shutdown = methods.iter().position(|m| *m == "VM.hard_shutdown").unwrap();
        assert!(disable < shutdown);
        let (_, v) = p.vm_named("up1").unwrap();
        assert_eq!(v.power_state, PowerState::Halted);
        assert!(!v.ha_always_run);
    }

    #[tokio::test]
    async fn failed_poweroff_restores_ha() {
        let (s, vm, pool) = open("up1").await;
        pool.lock().fail("VM.hard_shutdown");
        assert!(poweroff(s.as_ref(), &vm).await.is_err());

        let p = pool.lock();
        let (_, v) = p.vm_named("up1").unwrap();
        assert!(v.ha_always_run);
        assert_eq!(v.power_state, PowerState::Running);
    }
}
