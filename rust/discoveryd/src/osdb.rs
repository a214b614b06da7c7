//! OS definition corpus.
//!
//! Definitions are JSON documents compiled once at startup into an
//! [`OsDb`]: sysObjectID patterns in a longest-prefix lookup, sysDescr
//! patterns as compiled regexes, and complex multi-OID rules split into
//! static and network-dependent sets. Definition order is preserved; it
//! breaks ties everywhere.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::Deserialize;

use crate::error::{DiscoveryError, Result};
use crate::snmp::{self, SYS_DESCR, SYS_OBJECT_ID};

/// Sentinel returned when no definition matches.
pub const GENERIC_OS: &str = "generic";

const EMBEDDED_DEFINITIONS: &str = include_str!("../defs/os_definitions.json");

#[derive(Debug, Clone, Deserialize)]
pub struct OsDefDocument {
    pub os: Vec<OsDef>,
}

/// One OS definition as authored.
#[derive(Debug, Clone, Deserialize)]
pub struct OsDef {
    pub name: String,
    #[serde(default)]
    pub text: String,
    /// Exact or prefix sysObjectID patterns.
    #[serde(default)]
    pub sys_object_id: Vec<String>,
    /// Regular expressions applied to sysDescr.
    #[serde(default)]
    pub sys_descr: Vec<String>,
    /// Complex rules: conjunctions of OID conditions.
    #[serde(default)]
    pub discovery: Vec<ComplexRule>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComplexRule {
    pub conditions: Vec<OidCondition>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OidCondition {
    /// `sysObjectID`, `sysDescr`, or a numeric OID fetched from the device.
    pub oid: String,
    pub op: MatchOp,
    pub value: String,
    /// Fetch with a walk from this root instead of a direct get.
    #[serde(default)]
    pub walk: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchOp {
    Equals,
    Starts,
    Contains,
    Regex,
}

/// Where a condition's value comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionSource {
    /// Static fingerprint, no network round trip.
    SysObjectId,
    /// Static fingerprint, no network round trip.
    SysDescr,
    /// Live GET of a numeric OID.
    Get(String),
    /// Live walk under a numeric OID root; any value may satisfy the match.
    Walk(String),
}

impl ConditionSource {
    pub fn is_network(&self) -> bool {
        matches!(self, ConditionSource::Get(_) | ConditionSource::Walk(_))
    }
}

#[derive(Debug, Clone)]
pub enum CompiledMatcher {
    Equals(String),
    Starts(String),
    Contains(String),
    Regex(Regex),
}

impl CompiledMatcher {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            CompiledMatcher::Equals(want) => value == want,
            CompiledMatcher::Starts(want) => value.starts_with(want.as_str()),
            CompiledMatcher::Contains(want) => value.contains(want.as_str()),
            CompiledMatcher::Regex(re) => re.is_match(value),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledCondition {
    pub source: ConditionSource,
    pub matcher: CompiledMatcher,
}

#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub conditions: Vec<CompiledCondition>,
}

impl CompiledRule {
    pub fn is_network(&self) -> bool {
        self.conditions.iter().any(|c| c.source.is_network())
    }
}

/// One compiled OS definition.
#[derive(Debug, Clone)]
pub struct CompiledOs {
    pub name: String,
    pub text: String,
    pub sys_object_id: Vec<String>,
    pub sys_descr: Vec<Regex>,
    /// Complex rules with static fingerprints only.
    pub discovery: Vec<CompiledRule>,
    /// Complex rules needing live OIDs beyond the fingerprints.
    pub discovery_network: Vec<CompiledRule>,
}

/// The compiled corpus, in definition order.
#[derive(Debug, Default)]
pub struct OsDb {
    defs: Vec<CompiledOs>,
    by_name: HashMap<String, usize>,
}

impl OsDb {
    /// Compile the embedded corpus, then any documents found in
    /// `definitions_dir` (lexical filename order).
    pub fn load(definitions_dir: Option<&Path>) -> Result<Self> {
        let mut db = OsDb::default();
        let doc: OsDefDocument = serde_json::from_str(EMBEDDED_DEFINITIONS)
            .map_err(|e| DiscoveryError::Definition(format!("embedded corpus: {e}")))?;
        db.extend(doc)?;

        if let Some(dir) = definitions_dir {
            let mut paths: Vec<_> = fs::read_dir(dir)
                .map_err(|e| DiscoveryError::Definition(format!("{}: {e}", dir.display())))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
                .collect();
            paths.sort();
            for path in paths {
                let raw = fs::read_to_string(&path)
                    .map_err(|e| DiscoveryError::Definition(format!("{}: {e}", path.display())))?;
                let doc: OsDefDocument = serde_json::from_str(&raw)
                    .map_err(|e| DiscoveryError::Definition(format!("{}: {e}", path.display())))?;
                db.extend(doc)?;
            }
        }
        Ok(db)
    }

    fn extend(&mut self, doc: OsDefDocument) -> Result<()> {
        for def in doc.os {
            let compiled = compile(&def)?;
            if let Some(&idx) = self.by_name.get(&compiled.name) {
                // Later documents replace earlier definitions of the same OS.
                self.defs[idx] = compiled;
            } else {
                self.by_name.insert(compiled.name.clone(), self.defs.len());
                self.defs.push(compiled);
            }
        }
        Ok(())
    }

    pub fn defs(&self) -> &[CompiledOs] {
        &self.defs
    }

    pub fn get(&self, name: &str) -> Option<&CompiledOs> {
        self.by_name.get(name).map(|&idx| &self.defs[idx])
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    /// Most specific sysObjectID match: longest pattern wins, definition
    /// order breaks ties.
    pub fn best_sys_object_id(&self, sys_object_id: &str) -> Option<(&CompiledOs, &str)> {
        let oid = snmp::normalize_numeric(sys_object_id);
        let mut best: Option<(&CompiledOs, &str)> = None;
        for def in &self.defs {
            for pattern in &def.sys_object_id {
                if oid_pattern_matches(pattern, oid)
                    && best.map(|(_, b)| pattern.len() > b.len()).unwrap_or(true)
                {
                    best = Some((def, pattern.as_str()));
                }
            }
        }
        best
    }
}

/// Exact match, or prefix match on a label boundary.
pub fn oid_pattern_matches(pattern: &str, oid: &str) -> bool {
    let pattern = snmp::normalize_numeric(pattern);
    let oid = snmp::normalize_numeric(oid);
    oid == pattern || oid.starts_with(&format!("{pattern}."))
}

fn compile(def: &OsDef) -> Result<CompiledOs> {
    if def.name.is_empty() {
        return Err(DiscoveryError::Definition("definition without a name".into()));
    }

    let mut sys_descr = Vec::with_capacity(def.sys_descr.len());
    for pattern in &def.sys_descr {
        let re = Regex::new(pattern).map_err(|e| {
            DiscoveryError::Definition(format!("{}: bad sysDescr pattern: {e}", def.name))
        })?;
        sys_descr.push(re);
    }

    let mut discovery = Vec::new();
    let mut discovery_network = Vec::new();
    for rule in &def.discovery {
        let compiled = compile_rule(&def.name, rule)?;
        if compiled.is_network() {
            discovery_network.push(compiled);
        } else {
            discovery.push(compiled);
        }
    }

    Ok(CompiledOs {
        name: def.name.clone(),
        text: def.text.clone(),
        sys_object_id: def
            .sys_object_id
            .iter()
            .map(|p| snmp::normalize_numeric(p).to_string())
            .collect(),
        sys_descr,
        discovery,
        discovery_network,
    })
}

fn compile_rule(os: &str, rule: &ComplexRule) -> Result<CompiledRule> {
    if rule.conditions.is_empty() {
        return Err(DiscoveryError::Definition(format!(
            "{os}: complex rule without conditions"
        )));
    }
    let mut conditions = Vec::with_capacity(rule.conditions.len());
    for cond in &rule.conditions {
        let source = match cond.oid.as_str() {
            "sysObjectID" | SYS_OBJECT_ID => ConditionSource::SysObjectId,
            "sysDescr" | SYS_DESCR => ConditionSource::SysDescr,
            other if snmp::is_numeric_oid(other) => {
                let numeric = snmp::normalize_numeric(other).to_string();
                if cond.walk {
                    ConditionSource::Walk(numeric)
                } else {
                    ConditionSource::Get(numeric)
                }
            }
            other => {
                return Err(DiscoveryError::Definition(format!(
                    "{os}: condition OID '{other}' is neither a fingerprint field nor numeric"
                )))
            }
        };
        let matcher = match cond.op {
            MatchOp::Equals => CompiledMatcher::Equals(cond.value.clone()),
            MatchOp::Starts => CompiledMatcher::Starts(cond.value.clone()),
            MatchOp::Contains => CompiledMatcher::Contains(cond.value.clone()),
            MatchOp::Regex => CompiledMatcher::Regex(Regex::new(&cond.value).map_err(|e| {
                DiscoveryError::Definition(format!("{os}: bad condition pattern: {e}"))
            })?),
        };
        conditions.push(CompiledCondition { source, matcher });
    }
    Ok(CompiledRule { conditions })
}
