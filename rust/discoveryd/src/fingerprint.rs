//! OS fingerprinting.
//!
//! Evaluation order, first match wins: recheck fast path for a previously
//! known OS, complex rules without network conditions, sysObjectID prefix
//! table, sysDescr patterns, complex rules with network conditions, then
//! registered custom matchers. Complex rules outrank the sysObjectID table
//! because one sysObjectID can be shared by several product families while
//! a conjunction of OIDs disambiguates reliably.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::osdb::{CompiledRule, ConditionSource, OsDb, GENERIC_OS};
use crate::snmp::{SnmpClient, SnmpTarget};

/// Static fingerprints captured right after the first successful probe.
#[derive(Debug, Clone, Default)]
pub struct Fingerprint {
    pub sys_object_id: Option<String>,
    pub sys_descr: Option<String>,
}

/// A custom matcher inspects the fingerprints and may claim a device that
/// no declarative rule covered. Registered at startup; unknown OS names
/// simply have no entry.
pub type MatcherFn = Box<dyn Fn(&Fingerprint) -> Option<String> + Send + Sync>;

#[derive(Default)]
pub struct CustomMatchers {
    entries: Vec<(String, MatcherFn)>,
}

impl CustomMatchers {
    pub fn new() -> Self {
        CustomMatchers::default()
    }

    pub fn register(&mut self, os: impl Into<String>, matcher: MatcherFn) {
        self.entries.push((os.into(), matcher));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn run(&self, fingerprint: &Fingerprint) -> Option<String> {
        for (os, matcher) in &self.entries {
            if let Some(found) = matcher(fingerprint) {
                if !found.is_empty() {
                    debug!(os = %os, found = %found, "custom matcher claimed device");
                    return Some(found);
                }
            }
        }
        None
    }
}

/// Everything one `identify` call needs: fingerprints, a live SNMP path for
/// network-dependent rules, and a memo of OID fetches so the same OID is
/// never pulled twice within one identification.
pub struct MatchContext<'a> {
    pub fingerprint: &'a Fingerprint,
    client: &'a dyn SnmpClient,
    target: &'a SnmpTarget,
    fetched: Mutex<HashMap<String, Option<Vec<String>>>>,
}

impl<'a> MatchContext<'a> {
    pub fn new(
        fingerprint: &'a Fingerprint,
        client: &'a dyn SnmpClient,
        target: &'a SnmpTarget,
    ) -> Self {
        MatchContext {
            fingerprint,
            client,
            target,
            fetched: Mutex::new(HashMap::new()),
        }
    }

    /// Values a condition source can be tested against. `None` means the
    /// fetch failed or returned nothing; the rule simply does not match.
    async fn values_for(&self, source: &ConditionSource) -> Option<Vec<String>> {
        match source {
            ConditionSource::SysObjectId => self
                .fingerprint
                .sys_object_id
                .clone()
                .map(|v| vec![crate::snmp::normalize_numeric(&v).to_string()]),
            ConditionSource::SysDescr => self.fingerprint.sys_descr.clone().map(|v| vec![v]),
            ConditionSource::Get(oid) => self.fetch(&format!("get:{oid}"), source).await,
            ConditionSource::Walk(root) => self.fetch(&format!("walk:{root}"), source).await,
        }
    }

    async fn fetch(&self, key: &str, source: &ConditionSource) -> Option<Vec<String>> {
        if let Some(cached) = self.fetched.lock().get(key) {
            return cached.clone();
        }
        let result = match source {
            ConditionSource::Get(oid) => match self.client.get(self.target, oid).await {
                Ok(value) => {
                    let text = crate::snmp::fix_string(&value.as_text());
                    if text.is_empty() {
                        None
                    } else {
                        Some(vec![text])
                    }
                }
                Err(err) => {
                    debug!(oid = %oid, error = %err, "discovery OID fetch failed");
                    None
                }
            },
            ConditionSource::Walk(root) => match self.client.walk(self.target, root).await {
                Ok(varbinds) => {
                    let values: Vec<String> = varbinds
                        .into_iter()
                        .map(|(_, v)| crate::snmp::fix_string(&v.as_text()))
                        .filter(|v| !v.is_empty())
                        .collect();
                    if values.is_empty() {
                        None
                    } else {
                        Some(values)
                    }
                }
                Err(err) => {
                    debug!(root = %root, error = %err, "discovery walk failed");
                    None
                }
            },
            _ => None,
        };
        self.fetched.lock().insert(key.to_string(), result.clone());
        result
    }
}

pub struct OsMatcher {
    db: Arc<OsDb>,
    custom: Arc<CustomMatchers>,
}

impl OsMatcher {
    pub fn new(db: Arc<OsDb>, custom: Arc<CustomMatchers>) -> Self {
        OsMatcher { db, custom }
    }

    pub fn db(&self) -> &OsDb {
        &self.db
    }

    /// Identify the device's OS. `prior` enables the recheck fast path: if
    /// the previously known OS still matches one of its own complex rules,
    /// no other definition is consulted.
    pub async fn identify(&self, ctx: &MatchContext<'_>, prior: Option<&str>) -> String {
        if let Some(prior_os) = prior {
            if let Some(def) = self.db.get(prior_os) {
                if self.any_rule_matches(ctx, &def.discovery).await
                    || self.any_rule_matches(ctx, &def.discovery_network).await
                {
                    debug!(os = %prior_os, "recheck fast path confirmed prior OS");
                    return prior_os.to_string();
                }
            }
        }

        // Complex rules first: more specific than a single sysObjectID.
        for def in self.db.defs() {
            if self.any_rule_matches(ctx, &def.discovery).await {
                debug!(os = %def.name, "matched complex definition");
                return def.name.clone();
            }
        }

        if let Some(sys_object_id) = ctx.fingerprint.sys_object_id.as_deref() {
            if let Some((def, pattern)) = self.db.best_sys_object_id(sys_object_id) {
                debug!(os = %def.name, pattern = %pattern, "matched sysObjectID");
                return def.name.clone();
            }
        }

        if let Some(sys_descr) = ctx.fingerprint.sys_descr.as_deref() {
            for def in self.db.defs() {
                for re in &def.sys_descr {
                    if re.is_match(sys_descr) {
                        debug!(os = %def.name, pattern = %re, "matched sysDescr");
                        return def.name.clone();
                    }
                }
            }
        }

        for def in self.db.defs() {
            if self.any_rule_matches(ctx, &def.discovery_network).await {
                debug!(os = %def.name, "matched network discovery definition");
                return def.name.clone();
            }
        }

        if let Some(found) = self.custom.run(ctx.fingerprint) {
            return found;
        }

        GENERIC_OS.to_string()
    }

    async fn any_rule_matches(&self, ctx: &MatchContext<'_>, rules: &[CompiledRule]) -> bool {
        for rule in rules {
            if self.rule_matches(ctx, rule).await {
                return true;
            }
        }
        false
    }

    /// A rule is a conjunction: every condition must be satisfied by at
    /// least one of its source's values. Fetch failures fail the condition,
    /// never the identification.
    async fn rule_matches(&self, ctx: &MatchContext<'_>, rule: &CompiledRule) -> bool {
        for cond in &rule.conditions {
            let Some(values) = ctx.values_for(&cond.source).await else {
                return false;
            };
            if !values.iter().any(|v| cond.matcher.matches(v)) {
                return false;
            }
        }
        true
    }
}
