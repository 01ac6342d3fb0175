use crate::condition::Condition;
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Breadth of a granted permission.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Valid across all tenants.
    Global,
    /// Valid within the granting tenant.
    #[default]
    Tenant,
    /// Valid only for resources owned by the subject.
    Own,
}

impl Scope {
    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Tenant => "tenant",
            Self::Own => "own",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compiled permission: a `resource:action` code plus scope, gating
/// conditions and free-form metadata.
///
/// The code is derived from the validated segments at compile time and is
/// never edited afterwards; builder methods consume and return the value
/// so a finished permission is immutable in practice.
#[derive(Clone, Debug)]
pub struct Permission {
    code: String,
    resource: String,
    action: String,
    scope: Scope,
    conditions: Vec<Condition>,
    metadata: BTreeMap<String, Value>,
}

impl Permission {
    /// Validates `resource` and `action` and compiles them into a
    /// permission with scope [`Scope::Tenant`] and no conditions.
    pub fn compile(resource: impl AsRef<str>, action: impl AsRef<str>) -> Result<Self> {
        let resource = resource.as_ref().trim();
        let action = action.as_ref().trim();
        if !is_valid_segment(resource) {
            return Err(Error::InvalidPermission(format!(
                "invalid resource segment: {resource:?}"
            )));
        }
        if !is_valid_segment(action) {
            return Err(Error::InvalidPermission(format!(
                "invalid action segment: {action:?}"
            )));
        }
        Ok(Self {
            code: format!("{resource}:{action}"),
            resource: resource.to_string(),
            action: action.to_string(),
            scope: Scope::default(),
            conditions: Vec::new(),
            metadata: BTreeMap::new(),
        })
    }

    /// Replaces the scope.
    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    /// Appends a gating condition.
    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Inserts a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns the derived `resource:action` code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Returns the resource segment.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Returns the action segment.
    pub fn action(&self) -> &str {
        &self.action
    }

    /// Returns the scope.
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Returns the gating conditions.
    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Returns the metadata map.
    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    let mut chars = segment.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn is_valid_pattern_segment(segment: &str) -> bool {
    segment == "*" || is_valid_segment(segment)
}

/// Validates a concrete `resource:action` code (no wildcards).
pub fn validate_code(code: &str) -> Result<()> {
    let Some((resource, action)) = code.split_once(':') else {
        return Err(Error::InvalidPermission(format!(
            "permission code must be resource:action, got {code:?}"
        )));
    };
    if !is_valid_segment(resource) || !is_valid_segment(action) {
        return Err(Error::InvalidPermission(format!(
            "invalid permission code: {code:?}"
        )));
    }
    Ok(())
}

/// Validates a grant pattern: a code, `*`, `resource:*` or `*:action`.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern == "*" {
        return Ok(());
    }
    let Some((resource, action)) = pattern.split_once(':') else {
        return Err(Error::InvalidPermission(format!(
            "permission pattern must be resource:action or *, got {pattern:?}"
        )));
    };
    if !is_valid_pattern_segment(resource) || !is_valid_pattern_segment(action) {
        return Err(Error::InvalidPermission(format!(
            "invalid permission pattern: {pattern:?}"
        )));
    }
    Ok(())
}

/// Tests a requested code against a granted pattern.
///
/// `pattern` is always the granted side and `requested` the candidate
/// side; `*` matches everything, `resource:*` any action on the resource,
/// `*:action` that action on any resource, anything else exactly.
/// Malformed input matches nothing.
pub fn code_matches(pattern: &str, requested: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let Some((p_res, p_act)) = pattern.split_once(':') else {
        return false;
    };
    let Some((r_res, r_act)) = requested.split_once(':') else {
        return false;
    };
    (p_res == "*" || p_res == r_res) && (p_act == "*" || p_act == r_act)
}
