//! Configuration Normalizer: reduces either user-facing config shape
//! to the canonical `GVR → Vec<FilterRule>` multimap the rest of the
//! engine consumes.
//!
//! Normalization is a fallible, total function over a concrete input
//! enum — a tagged variant collapsing to one product type — rather than
//! reflection over an arbitrary YAML tree.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{FilterRule, Gvr};

/// Scope hint carried by the resource-indexed config shape.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// One entry of the namespace-indexed input shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NamespaceEntry {
    pub namespace: String,
    pub resources: HashMap<String, ResourceSelector>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ResourceSelector {
    #[serde(default)]
    pub name_selector: Option<String>,
    #[serde(default)]
    pub label_selector: Option<String>,
}

/// One entry of the resource-indexed input shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub gvr: String,
    pub scope: Scope,
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default)]
    pub name_selector: Option<String>,
    #[serde(default)]
    pub label_selector: Option<String>,
}

/// The configuration value the Engine is constructed with.
/// Either or both of `namespaces`/`resources` may be populated.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub namespaces: Vec<NamespaceEntry>,
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub json_export: bool,
    #[serde(default)]
    pub auto_shutdown_sec: Option<u64>,
}

/// The normalized output: one or more filter rules per GVR.
pub type NormalizedConfig = HashMap<Gvr, Vec<FilterRule>>;

/// Parses the canonical `"group/version/resource"` or `"version/resource"`
/// string form into a [`Gvr`].
pub fn parse_gvr(s: &str) -> Result<Gvr> {
    let parts: Vec<&str> = s.split('/').collect();
    match parts.as_slice() {
        [version, resource] => Ok(Gvr::new("", *version, *resource)),
        [group, version, resource] => Ok(Gvr::new(*group, *version, *resource)),
        _ => Err(Error::ConfigError(format!("malformed gvr string: {s:?}"))),
    }
}

/// True if `s` contains characters that would make it a regex/glob rather
/// than a literal Kubernetes object name. The legacy textual pattern
/// field is refused outright, never interpreted.
fn has_regex_metacharacters(s: &str) -> bool {
    s.chars()
        .any(|c| matches!(c, '*' | '?' | '[' | ']' | '(' | ')' | '^' | '$' | '|' | '+' | '\\' | '.'))
}

fn validate_name_selector(name_selector: &Option<String>) -> Result<()> {
    if let Some(selector) = name_selector {
        if has_regex_metacharacters(selector) {
            return Err(Error::ConfigError(format!(
                "nameSelector {selector:?} contains regex metacharacters; only exact names are supported"
            )));
        }
    }
    Ok(())
}

/// Reduces an [`EngineConfig`] to the canonical `GVR → Vec<FilterRule>`
/// multimap. Identical rules for the same `(gvr, namespace)` collapse;
/// an empty result is a configuration error.
pub fn normalize(config: &EngineConfig) -> Result<NormalizedConfig> {
    let mut rules_by_gvr: HashMap<Gvr, Vec<FilterRule>> = HashMap::new();

    for entry in &config.namespaces {
        for (gvr_str, selector) in &entry.resources {
            let gvr = parse_gvr(gvr_str)?;
            validate_name_selector(&selector.name_selector)?;
            push_rule(
                &mut rules_by_gvr,
                FilterRule {
                    gvr,
                    namespaces: vec![entry.namespace.clone()],
                    name_selector: selector.name_selector.clone(),
                    label_selector: selector.label_selector.clone(),
                },
            );
        }
    }

    for entry in &config.resources {
        let gvr = parse_gvr(&entry.gvr)?;
        validate_name_selector(&entry.name_selector)?;
        let namespaces = if entry.namespaces.is_empty() {
            match entry.scope {
                Scope::Cluster => vec!["".to_string()],
                Scope::Namespaced => vec![],
            }
        } else {
            entry.namespaces.clone()
        };
        push_rule(
            &mut rules_by_gvr,
            FilterRule {
                gvr,
                namespaces,
                name_selector: entry.name_selector.clone(),
                label_selector: entry.label_selector.clone(),
            },
        );
    }

    if rules_by_gvr.is_empty() {
        return Err(Error::ConfigError(
            "normalized configuration is empty: no namespace or resource rules provided".into(),
        ));
    }

    for (gvr, rules) in &rules_by_gvr {
        check_label_selector_conflict(gvr, rules)?;
    }

    Ok(rules_by_gvr)
}

fn push_rule(map: &mut HashMap<Gvr, Vec<FilterRule>>, rule: FilterRule) {
    let rules = map.entry(rule.gvr.clone()).or_default();
    if !rules.contains(&rule) {
        rules.push(rule);
    }
}

/// The Informer Factory applies the union of `labelSelector` values
/// among rules for the same `(gvr, namespace)`; more than one *distinct*
/// selector for the same pair is a configuration error reported here
/// rather than at watch-construction time.
fn check_label_selector_conflict(gvr: &Gvr, rules: &[FilterRule]) -> Result<()> {
    let mut seen: HashMap<&str, &str> = HashMap::new();
    for rule in rules {
        for namespace in namespaces_or_wildcard(rule) {
            if let Some(selector) = &rule.label_selector {
                if let Some(existing) = seen.insert(namespace, selector.as_str()) {
                    if existing != selector {
                        return Err(Error::ConfigError(format!(
                            "conflicting labelSelector for {gvr} in namespace {namespace:?}: {existing:?} vs {selector:?}"
                        )));
                    }
                }
            }
        }
    }
    Ok(())
}

fn namespaces_or_wildcard(rule: &FilterRule) -> Vec<&str> {
    if rule.namespaces.is_empty() {
        vec![""]
    } else {
        rule.namespaces.iter().map(String::as_str).collect()
    }
}
