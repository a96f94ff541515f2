/**
 * AUTHORIZATION GATE - who may do what on which VM
 *
 * ROLE:
 * Maps (principal, pool, vm, action) to allow/deny. Every action entry point
 * and every status aggregation goes through the gate before touching a pool.
 *
 * HOW IT WORKS:
 * - Capability levels are totally ordered: none < list < read < write < control < all
 * - The operation map gives the minimum level for each action (missing = disabled)
 * - The rights store answers "what level does this principal hold here"
 * - An action is allowed iff held level >= required level
 *
 * SECURITY:
 * - Deny by default: unknown principal or missing rule => none
 * - A disabled action is denied to everyone, including "all" holders
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::ConfigError;
use crate::error::ActionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    None,
    List,
    Read,
    Write,
    Control,
    All,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::None => "none",
            Level::List => "list",
            Level::Read => "read",
            Level::Write => "write",
            Level::Control => "control",
            Level::All => "all",
        }
    }

    pub fn satisfies(self, required: Level) -> bool {
        self >= required
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Level {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Level::None),
            "list" => Ok(Level::List),
            "read" => Ok(Level::Read),
            "write" => Ok(Level::Write),
            "control" => Ok(Level::Control),
            "all" => Ok(Level::All),
            other => Err(ConfigError::UnknownLevel(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Boot,
    BootRecovery,
    BootOn,
    Console,
    KbdMouse,
    Shutdown,
    Reboot,
    Reset,
    Poweroff,
    Suspend,
    Resume,
    ResumeOn,
    Migrate,
    Snapshot,
    Properties,
    DvdIso,
    DvdHost,
}

impl Action {
    pub const ALL: [Action; 17] = [
        Action::Boot,
        Action::BootRecovery,
        Action::BootOn,
        Action::Console,
        Action::KbdMouse,
        Action::Shutdown,
        Action::Reboot,
        Action::Reset,
        Action::Poweroff,
        Action::Suspend,
        Action::Resume,
        Action::ResumeOn,
        Action::Migrate,
        Action::Snapshot,
        Action::Properties,
        Action::DvdIso,
        Action::DvdHost,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Boot => "boot",
            Action::BootRecovery => "bootrecovery",
            Action::BootOn => "booton",
            Action::Console => "console",
            Action::KbdMouse => "kbdmouse",
            Action::Shutdown => "shutdown",
            Action::Reboot => "reboot",
            Action::Reset => "reset",
            Action::Poweroff => "poweroff",
            Action::Suspend => "suspend",
            Action::Resume => "resume",
            Action::ResumeOn => "resumeon",
            Action::Migrate => "migrate",
            Action::Snapshot => "snapshot",
            Action::Properties => "properties",
            Action::DvdIso => "dvdiso",
            Action::DvdHost => "dvdhost",
        }
    }

    /// Host-targeted actions: discovery first, execution against a confirmed host.
    pub fn is_two_phase(&self) -> bool {
        matches!(self, Action::BootOn | Action::ResumeOn | Action::Migrate)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Action::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == wanted)
            .ok_or_else(|| ConfigError::UnknownAction(s.to_string()))
    }
}

/// Minimum capability per action. An action absent from the map is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct OperationMap(BTreeMap<Action, Level>);

impl Default for OperationMap {
    fn default() -> Self {
        use Action::*;
        let table = [
            (Console, Level::Read),
            (Properties, Level::Read),
            (KbdMouse, Level::Write),
            (Boot, Level::Write),
            (Resume, Level::Write),
            (DvdIso, Level::Write),
            (Shutdown, Level::Control),
            (Reboot, Level::Control),
            (Reset, Level::Control),
            (Poweroff, Level::Control),
            (Suspend, Level::Control),
            (BootOn, Level::Control),
            (ResumeOn, Level::Control),
            (BootRecovery, Level::Control),
            (DvdHost, Level::Control),
            (Migrate, Level::All),
            (Snapshot, Level::All),
        ];
        OperationMap(table.into_iter().collect())
    }
}

impl OperationMap {
    /// Defaults, then per-action overrides from config. "disabled" removes the entry.
    pub fn with_overrides(overrides: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut map = OperationMap::default();
        for (name, value) in overrides {
            let action: Action = name.parse()?;
            if value.trim().eq_ignore_ascii_case("disabled") {
                map.0.remove(&action);
            } else {
                map.0.insert(action, value.parse()?);
            }
        }
        Ok(map)
    }

    pub fn required(&self, action: Action) -> Option<Level> {
        self.0.get(&action).copied()
    }

    pub fn entries(&self) -> &BTreeMap<Action, Level> {
        &self.0
    }
}

/// Authenticated identity, as handed over by the fronting auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Principal(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of held capability levels.
pub trait RightsStore: Send + Sync {
    /// Level on a VM, or on the pool as a whole when `vm` is None.
    fn rights_of(&self, principal: &Principal, pool: &str, vm: Option<&str>) -> Level;

    /// Level on the pool's host inventory (host status visibility).
    fn host_rights(&self, principal: &Principal, pool: &str) -> Level;
}

#[derive(Clone)]
pub struct Gate {
    store: Arc<dyn RightsStore>,
    operations: Arc<OperationMap>,
}

impl Gate {
    pub fn new(store: Arc<dyn RightsStore>, operations: OperationMap) -> Self {
        Self { store, operations: Arc::new(operations) }
    }

    pub fn operations(&self) -> &OperationMap {
        &self.operations
    }

    pub fn required_capability(&self, action: Action) -> Option<Level> {
        self.operations.required(action)
    }

    pub fn rights_of(&self, principal: &Principal, pool: &str, vm: Option<&str>) -> Level {
        self.store.rights_of(principal, pool, vm)
    }

    pub fn host_rights(&self, principal: &Principal, pool: &str) -> Level {
        self.store.host_rights(principal, pool)
    }

    pub fn authorize(&self, principal: &Principal, pool: &str, vm: &str, action: Action) -> bool {
        let Some(required) = self.required_capability(action) else {
            tracing::debug!(%principal, %action, "action disabled");
            return false;
        };
        let held = self.rights_of(principal, pool, Some(vm));
        held.satisfies(required)
    }

    /// Same as `authorize`, as a `Result` for `?` chains.
    pub fn check(&self, principal: &Principal, pool: &str, vm: &str, action: Action) -> Result<(), ActionError> {
        if self.authorize(principal, pool, vm, action) {
            Ok(())
        } else {
            Err(ActionError::Denied {
                principal: principal.to_string(),
                action,
                target: crate::config::fullname(pool, vm),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Level);

    impl RightsStore for Fixed {
        fn rights_of(&self, _: &Principal, _: &str, _: Option<&str>) -> Level {
            self.0
        }
        fn host_rights(&self, _: &Principal, _: &str) -> Level {
            Level::None
        }
    }

    fn gate(level: Level, ops: OperationMap) -> Gate {
        Gate::new(Arc::new(Fixed(level)), ops)
    }

    #[test]
    fn levels_are_ordered() {
        assert!(Level::None < Level::List);
        assert!(Level::List < Level::Read);
        assert!(Level::Read < Level::Write);
        assert!(Level::Write < Level::Control);
        assert!(Level::Control < Level::All);
        assert!(Level::All.satisfies(Level::Control));
        assert!(!Level::Write.satisfies(Level::Control));
    }

    #[test]
    fn action_names_round_trip() {
        for action in Action::ALL {
            assert_eq!(action.as_str().parse::<Action>().unwrap(), action);
        }
        assert!("teleport".parse::<Action>().is_err());
        assert_eq!("BootOn".parse::<Action>().unwrap(), Action::BootOn);
    }

    #[test]
    fn default_map_covers_every_action() {
        let ops = OperationMap::default();
        for action in Action::ALL {
            assert!(ops.required(action).is_some(), "{action} has no default");
        }
        assert_eq!(ops.required(Action::Migrate), Some(Level::All));
        assert_eq!(ops.required(Action::Console), Some(Level::Read));
    }

    #[test]
    fn write_holder_can_boot_but_not_poweroff() {
        let g = gate(Level::Write, OperationMap::default());
        let who = Principal::new("alice");
        assert!(g.authorize(&who, "lab", "web01", Action::Boot));
        assert!(!g.authorize(&who, "lab", "web01", Action::Poweroff));
        assert!(g.check(&who, "lab", "web01", Action::Poweroff).is_err());
    }

    #[test]
    fn disabled_action_is_denied_even_to_all() {
        let overrides = BTreeMap::from([("snapshot".to_string(), "disabled".to_string())]);
        let ops = OperationMap::with_overrides(&overrides).unwrap();
        let g = gate(Level::All, ops);
        assert!(!g.authorize(&Principal::new("root"), "lab", "web01", Action::Snapshot));
        assert!(g.authorize(&Principal::new("root"), "lab", "web01", Action::Migrate));
    }

    #[test]
    fn overrides_change_required_level() {
        let overrides = BTreeMap::from([("boot".to_string(), "control".to_string())]);
        let ops = OperationMap::with_overrides(&overrides).unwrap();
        assert_eq!(ops.required(Action::Boot), Some(Level::Control));

        let bad = BTreeMap::from([("boot".to_string(), "superuser".to_string())]);
        assert!(OperationMap::with_overrides(&bad).is_err());
    }
}
