//! Local view of the VMs the principal can see.
//!
//! Each VM moves through `Idle -> Pending -> Stale -> Idle`:
//! - `Pending` is set the moment an action is submitted, the VM shows as busy
//! - `Stale` once the action completed, its last known state is outdated
//! - the next merged poll brings it back to `Idle`
//!
//! A poll merged while an action is pending leaves the VM busy.
//! The allowed-action set is a display hint; the kernel checks again.

use std::collections::BTreeMap;

use crate::snapshot::{Action, Level, StatusSnapshot, VmStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Pending,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectiveState {
    Running,
    Halted,
    Suspended,
    Busy,
    Other,
}

const RUNNING: [Action; 9] = [
    Action::Console,
    Action::Shutdown,
    Action::Poweroff,
    Action::Reboot,
    Action::Reset,
    Action::Suspend,
    Action::Migrate,
    Action::Snapshot,
    Action::Properties,
];
const HALTED: [Action; 5] = [Action::Boot, Action::BootOn, Action::BootRecovery, Action::Snapshot, Action::Properties];
const SUSPENDED: [Action; 3] = [Action::Resume, Action::ResumeOn, Action::Properties];
const BUSY: [Action; 1] = [Action::Console];

impl EffectiveState {
    pub fn candidate_actions(self) -> &'static [Action] {
        match self {
            EffectiveState::Running => &RUNNING,
            EffectiveState::Halted => &HALTED,
            EffectiveState::Suspended => &SUSPENDED,
            EffectiveState::Busy => &BUSY,
            EffectiveState::Other => &[],
        }
    }

    fn primary(self) -> Option<Action> {
        match self {
            EffectiveState::Running => Some(Action::Console),
            EffectiveState::Halted => Some(Action::Boot),
            EffectiveState::Suspended => Some(Action::Resume),
            _ => None,
        }
    }
}

/// An action not listed in the operation map is disabled for everybody.
pub fn rights_ok(operations: &BTreeMap<String, Level>, action: Action, rights: Level) -> bool {
    operations.get(action.as_str()).is_some_and(|required| rights >= *required)
}

#[derive(Debug, Clone)]
pub struct Resource {
    pub status: VmStatus,
    pub phase: Phase,
}

impl Resource {
    pub fn effective_state(&self) -> EffectiveState {
        if self.phase == Phase::Pending {
            return EffectiveState::Busy;
        }
        match self.status.state.as_deref() {
            Some("Running") => EffectiveState::Running,
            Some("Halted") => EffectiveState::Halted,
            Some("Suspended") => EffectiveState::Suspended,
            _ => EffectiveState::Other,
        }
    }
}

/// Per-VM summary handed to the display after every merge and submit.
#[derive(Debug, Clone, PartialEq)]
pub struct VmView {
    pub fullname: String,
    pub state: EffectiveState,
    pub allowed: Vec<Action>,
    pub primary: Option<Action>,
}

#[derive(Debug, Default)]
pub struct Reconciler {
    resources: BTreeMap<String, Resource>,
    operations: BTreeMap<String, Level>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, snapshot: StatusSnapshot) {
        self.operations = snapshot.operations;

        let mut seen = BTreeMap::new();
        for vm in snapshot.pools.into_iter().flat_map(|p| p.vms) {
            let phase = match self.resources.get(&vm.fullname).map(|r| r.phase) {
                Some(Phase::Pending) => Phase::Pending,
                _ => Phase::Idle,
            };
            seen.insert(vm.fullname.clone(), Resource { status: vm, phase });
        }
        // a VM that vanished while an action is in flight stays until it completes
        for (name, res) in std::mem::take(&mut self.resources) {
            if res.phase == Phase::Pending && !seen.contains_key(&name) {
                seen.insert(name, res);
            }
        }
        self.resources = seen;
    }

    /// Mark the VM busy. False if it is unknown or already busy.
    pub fn submit(&mut self, fullname: &str) -> bool {
        match self.resources.get_mut(fullname) {
            Some(res) if res.phase != Phase::Pending => {
                res.phase = Phase::Pending;
                true
            }
            _ => false,
        }
    }

    pub fn complete(&mut self, fullname: &str) {
        if let Some(res) = self.resources.get_mut(fullname) {
            if res.phase == Phase::Pending {
                res.phase = Phase::Stale;
            }
        }
    }

    pub fn get(&self, fullname: &str) -> Option<&Resource> {
        self.resources.get(fullname)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn is_busy(&self, fullname: &str) -> bool {
        self.get(fullname).is_some_and(|r| r.phase == Phase::Pending)
    }

    pub fn allowed_actions(&self, fullname: &str) -> Vec<Action> {
        let Some(res) = self.get(fullname) else { return Vec::new() };
        res.effective_state()
            .candidate_actions()
            .iter()
            .copied()
            .filter(|a| rights_ok(&self.operations, *a, res.status.rights))
            .collect()
    }

    /// Default action for a click on the VM.
    pub fn primary_action(&self, fullname: &str) -> Option<Action> {
        let res = self.get(fullname)?;
        let action = res.effective_state().primary()?;
        rights_ok(&self.operations, action, res.status.rights).then_some(action)
    }

    pub fn view_of(&self, fullname: &str) -> Option<VmView> {
        let res = self.get(fullname)?;
        Some(VmView {
            fullname: fullname.to_string(),
            state: res.effective_state(),
            allowed: self.allowed_actions(fullname),
            primary: self.primary_action(fullname),
        })
    }

    pub fn views(&self) -> Vec<VmView> {
        self.resources.keys().filter_map(|name| self.view_of(name)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::PoolStatus;

    fn vm(name: &str, state: Option<&str>, rights: Level) -> VmStatus {
        VmStatus {
            fullname: format!("p1:{name}"),
            label: name.into(),
            rights,
            state: state.map(str::to_string),
            platform: String::new(),
            uptime: String::new(),
            memtotal: String::new(),
        }
    }

    fn operations() -> BTreeMap<String, Level> {
        [
            ("console", Level::Read),
            ("properties", Level::Read),
            ("boot", Level::Write),
            ("resume", Level::Write),
            ("shutdown", Level::Control),
            ("reboot", Level::Control),
            ("reset", Level::Control),
            ("poweroff", Level::Control),
            ("suspend", Level::Control),
            ("booton", Level::Control),
            ("resumeon", Level::Control),
            ("bootrecovery", Level::Control),
            ("migrate", Level::All),
            ("snapshot", Level::All),
        ]
        .into_iter()
        .map(|(a, l)| (a.to_string(), l))
        .collect()
    }

    fn snapshot(vms: Vec<VmStatus>) -> StatusSnapshot {
        StatusSnapshot {
            timestamp: 0,
            operations: operations(),
            pools: vec![PoolStatus { name: "p1".into(), hosts: Vec::new(), vms }],
        }
    }

    #[test]
    fn allowed_actions_follow_state_and_rights() {
        let mut r = Reconciler::new();
        r.merge(snapshot(vec![
            vm("up", Some("Running"), Level::Control),
            vm("down", Some("Halted"), Level::Write),
            vm("asleep", Some("Suspended"), Level::All),
            vm("odd", Some("Paused"), Level::All),
            vm("blank", None, Level::All),
        ]));

        assert_eq!(
            r.allowed_actions("p1:up"),
            vec![
                Action::Console,
                Action::Shutdown,
                Action::Poweroff,
                Action::Reboot,
                Action::Reset,
                Action::Suspend,
                Action::Properties
            ]
        );
        assert_eq!(r.allowed_actions("p1:down"), vec![Action::Boot, Action::Properties]);
        assert_eq!(r.allowed_actions("p1:asleep"), vec![Action::Resume, Action::ResumeOn, Action::Properties]);
        assert!(r.allowed_actions("p1:odd").is_empty());
        assert!(r.allowed_actions("p1:blank").is_empty());
        assert!(r.allowed_actions("p1:missing").is_empty());

        assert_eq!(r.primary_action("p1:up"), Some(Action::Console));
        assert_eq!(r.primary_action("p1:down"), Some(Action::Boot));
        assert_eq!(r.primary_action("p1:odd"), None);
    }

    #[test]
    fn missing_operation_entry_disables_the_action() {
        let mut ops = operations();
        ops.remove("boot");
        assert!(!rights_ok(&ops, Action::Boot, Level::All));
        assert!(rights_ok(&ops, Action::Console, Level::Read));
        assert!(!rights_ok(&ops, Action::Console, Level::List));
    }

    #[test]
    fn busy_vm_only_offers_console() {
        let mut r = Reconciler::new();
        r.merge(snapshot(vec![vm("up", Some("Running"), Level::All)]));
        assert!(r.submit("p1:up"));
        assert!(!r.submit("p1:up"));
        assert_eq!(r.allowed_actions("p1:up"), vec![Action::Console]);
        assert_eq!(r.primary_action("p1:up"), None);

        let view = r.view_of("p1:up").unwrap();
        assert_eq!(view.state, EffectiveState::Busy);
        assert_eq!(view.allowed, vec![Action::Console]);
        assert_eq!(r.views(), vec![view]);
    }

    #[test]
    fn lifecycle_idle_pending_stale_idle() {
        let mut r = Reconciler::new();
        r.merge(snapshot(vec![vm("up", Some("Running"), Level::All)]));
        assert_eq!(r.get("p1:up").unwrap().phase, Phase::Idle);

        r.submit("p1:up");
        // a poll landing mid-action does not clear the busy flag
        r.merge(snapshot(vec![vm("up", Some("Running"), Level::All)]));
        assert!(r.is_busy("p1:up"));

        r.complete("p1:up");
        assert_eq!(r.get("p1:up").unwrap().phase, Phase::Stale);
        assert!(!r.is_busy("p1:up"));

        r.merge(snapshot(vec![vm("up", Some("Halted"), Level::All)]));
        let res = r.get("p1:up").unwrap();
        assert_eq!(res.phase, Phase::Idle);
        assert_eq!(res.effective_state(), EffectiveState::Halted);
    }

    #[test]
    fn vanished_vms_are_dropped_unless_pending() {
        let mut r = Reconciler::new();
        r.merge(snapshot(vec![vm("a", Some("Running"), Level::All), vm("b", Some("Halted"), Level::All)]));
        r.submit("p1:b");
        r.merge(snapshot(Vec::new()));
        assert!(r.get("p1:a").is_none());
        assert!(r.is_busy("p1:b"));
    }
}
