//! Wire types of the kernel API, as the agent reads them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

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

    /// Needs a target host, chosen between prepare and confirm.
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
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_ascii_lowercase()))
            .map_err(|_| format!("unknown action `{s}`"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusSnapshot {
    pub timestamp: i64,
    /// Unknown action names from a newer kernel are kept, not rejected.
    pub operations: BTreeMap<String, Level>,
    pub pools: Vec<PoolStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolStatus {
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<HostStatus>,
    #[serde(default)]
    pub vms: Vec<VmStatus>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostStatus {
    pub fullname: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub memfree: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VmStatus {
    pub fullname: String,
    pub label: String,
    pub rights: Level,
    /// None when the kernel could not read the VM.
    pub state: Option<String>,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub uptime: String,
    #[serde(default)]
    pub memtotal: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Candidate {
    pub name: String,
    pub home: bool,
}

/// Answer to a prepare request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
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
    Unavailable,
}

/// "pool:vm" -> (pool, vm). Pool names never contain ':'.
pub fn split_fullname(fullname: &str) -> Option<(&str, &str)> {
    fullname.split_once(':').filter(|(p, v)| !p.is_empty() && !v.is_empty())
}
