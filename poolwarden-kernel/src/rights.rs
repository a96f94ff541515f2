/**
 * STATIC RIGHTS STORE - capability levels from the kernel config
 *
 * Rules look like `{ who: alice | "@ops" | "*", pool: lab | "*", vm: web01, level: control }`.
 * A rule with `hosts: true` grants visibility on the pool's host inventory instead of VMs.
 *
 * Resolution for a VM: the most specific matching rule wins
 * (vm rule > pool-wide rule, exact pool > "*", user > group > everyone).
 * Equally specific rules combine to the highest level.
 * Pool rights are the best level the principal holds anywhere in the pool.
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::authz::{Level, Principal, RightsStore};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RightsRule {
    pub who: String,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub vm: Option<String>,
    #[serde(default)]
    pub hosts: bool,
    pub level: Level,
}

pub struct StaticRightsStore {
    rules: Vec<RightsRule>,
    groups: HashMap<String, Vec<String>>,
}

impl StaticRightsStore {
    pub fn new(rules: Vec<RightsRule>, groups: HashMap<String, Vec<String>>) -> Self {
        Self { rules, groups }
    }

    fn who_rank(&self, rule: &RightsRule, principal: &Principal) -> Option<u8> {
        if rule.who == "*" {
            return Some(0);
        }
        if let Some(group) = rule.who.strip_prefix('@') {
            let member = self
                .groups
                .get(group)
                .is_some_and(|members| members.iter().any(|m| m == principal.name()));
            return member.then_some(1);
        }
        (rule.who == principal.name()).then_some(2)
    }

    fn pool_rank(rule: &RightsRule, pool: &str) -> Option<u8> {
        match rule.pool.as_deref() {
            None | Some("*") => Some(0),
            Some(p) if p == pool => Some(1),
            Some(_) => None,
        }
    }

    /// Highest level among the most specific matching rules.
    fn most_specific<'a, I>(candidates: I) -> Level
    where
        I: Iterator<Item = ((u8, u8, u8), &'a RightsRule)>,
    {
        let mut best: Option<((u8, u8, u8), Level)> = None;
        for (rank, rule) in candidates {
            best = match best {
                Some((r, lvl)) if r > rank => Some((r, lvl)),
                Some((r, lvl)) if r == rank => Some((r, lvl.max(rule.level))),
                _ => Some((rank, rule.level)),
            };
        }
        best.map(|(_, lvl)| lvl).unwrap_or(Level::None)
    }
}

impl RightsStore for StaticRightsStore {
    fn rights_of(&self, principal: &Principal, pool: &str, vm: Option<&str>) -> Level {
        let matching = self.rules.iter().filter(|r| !r.hosts).filter_map(|r| {
            let who = self.who_rank(r, principal)?;
            let p = Self::pool_rank(r, pool)?;
            Some((r, who, p))
        });

        match vm {
            Some(vm) => Self::most_specific(matching.filter_map(|(r, who, p)| {
                let v = match r.vm.as_deref() {
                    None => 0,
                    Some(name) if name == vm => 1,
                    Some(_) => return None,
                };
                Some(((v, p, who), r))
            })),
            // any grant inside the pool makes the pool visible
            None => matching.map(|(r, _, _)| r.level).max().unwrap_or(Level::None),
        }
    }

    fn host_rights(&self, principal: &Principal, pool: &str) -> Level {
        Self::most_specific(self.rules.iter().filter(|r| r.hosts).filter_map(|r| {
            let who = self.who_rank(r, principal)?;
            let p = Self::pool_rank(r, pool)?;
            Some(((0, p, who), r))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StaticRightsStore {
        let rules: Vec<RightsRule> = serde_yaml::from_str(
            r#"
- { who: "*", pool: lab, level: list }
- { who: "@ops", pool: lab, level: control }
- { who: alice, pool: lab, vm: web01, level: all }
- { who: alice, pool: lab, vm: db01, level: read }
- { who: "@ops", pool: lab, hosts: true, level: read }
- { who: bob, pool: prod, vm: api, level: write }
"#,
        )
        .unwrap();
        let groups = HashMap::from([("ops".to_string(), vec!["alice".to_string(), "carol".to_string()])]);
        StaticRightsStore::new(rules, groups)
    }

    #[test]
    fn vm_rule_beats_group_rule() {
        let s = store();
        let alice = Principal::new("alice");
        assert_eq!(s.rights_of(&alice, "lab", Some("web01")), Level::All);
        // narrower rule wins even when it grants less
        assert_eq!(s.rights_of(&alice, "lab", Some("db01")), Level::Read);
        assert_eq!(s.rights_of(&alice, "lab", Some("cache")), Level::Control);
    }

    #[test]
    fn unknown_principal_falls_back_to_wildcard_then_none() {
        let s = store();
        let mallory = Principal::new("mallory");
        assert_eq!(s.rights_of(&mallory, "lab", Some("web01")), Level::List);
        assert_eq!(s.rights_of(&mallory, "prod", Some("api")), Level::None);
        assert_eq!(s.rights_of(&mallory, "prod", None), Level::None);
    }

    #[test]
    fn pool_rights_take_the_best_grant_in_the_pool() {
        let s = store();
        assert_eq!(s.rights_of(&Principal::new("bob"), "prod", None), Level::Write);
        assert_eq!(s.rights_of(&Principal::new("alice"), "lab", None), Level::All);
    }

    #[test]
    fn host_rights_only_come_from_host_rules() {
        let s = store();
        assert_eq!(s.host_rights(&Principal::new("carol"), "lab"), Level::Read);
        assert_eq!(s.host_rights(&Principal::new("bob"), "prod"), Level::None);
        assert_eq!(s.host_rights(&Principal::new("mallory"), "lab"), Level::None);
    }
}
