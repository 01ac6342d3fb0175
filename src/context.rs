use crate::types::{RoleId, SubjectId, SubjectKind, TenantId};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a tenant as seen by the authorizer.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    #[default]
    Active,
    Suspended,
}

impl TenantStatus {
    /// Returns the canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspended => "suspended",
        }
    }
}

impl fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tenant view carried in an evaluation context.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TenantRef {
    pub id: TenantId,
    pub status: TenantStatus,
    /// Free-form tenant attributes visible to field conditions
    /// (`tenant.plan` and the like).
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl TenantRef {
    /// Creates an active tenant reference.
    pub fn new(id: TenantId) -> Self {
        Self {
            id,
            status: TenantStatus::Active,
            attributes: BTreeMap::new(),
        }
    }

    /// Replaces the status.
    pub fn with_status(mut self, status: TenantStatus) -> Self {
        self.status = status;
        self
    }

    /// Inserts a tenant attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

/// The actor a check runs for.
///
/// `roles` and `permissions` here are context data declared by the
/// caller: field conditions can read them, and direct `permissions`
/// patterns join the resolved set during checks. They are not consulted
/// for role expansion, which always goes through the store.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct Subject {
    pub kind: SubjectKind,
    pub id: SubjectId,
    #[serde(default)]
    pub roles: Vec<RoleId>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Subject {
    fn with_kind(kind: SubjectKind, id: SubjectId) -> Self {
        Self {
            kind,
            id,
            roles: Vec::new(),
            permissions: Vec::new(),
            attributes: BTreeMap::new(),
        }
    }

    /// Creates a user subject.
    pub fn user(id: SubjectId) -> Self {
        Self::with_kind(SubjectKind::User, id)
    }

    /// Creates a service subject.
    pub fn service(id: SubjectId) -> Self {
        Self::with_kind(SubjectKind::Service, id)
    }

    /// Creates the system subject, which bypasses all checks.
    pub fn system() -> Self {
        Self::with_kind(SubjectKind::System, SubjectId::from_string("system".to_string()))
    }

    /// Creates the anonymous subject.
    pub fn anonymous() -> Self {
        Self::with_kind(
            SubjectKind::Anonymous,
            SubjectId::from_string("anonymous".to_string()),
        )
    }

    /// Declares a role for condition visibility.
    pub fn with_role(mut self, role: RoleId) -> Self {
        self.roles.push(role);
        self
    }

    /// Declares a direct permission pattern.
    pub fn with_permission(mut self, pattern: impl Into<String>) -> Self {
        self.permissions.push(pattern.into());
        self
    }

    /// Inserts a subject attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }
}

impl Default for Subject {
    fn default() -> Self {
        Self::anonymous()
    }
}

/// Request metadata carried through a check.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RequestInfo {
    pub id: String,
    pub ip: Option<String>,
    /// Evaluation instant for time conditions and binding expiry.
    /// Carried explicitly so evaluation never reads the wall clock.
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl RequestInfo {
    /// Creates request metadata with a generated id and the given instant.
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            ip: None,
            timestamp,
            attributes: BTreeMap::new(),
        }
    }
}

/// Everything a single permission check evaluates against.
#[derive(Clone, Debug)]
pub struct EvaluationContext {
    pub tenant: TenantRef,
    pub subject: Subject,
    /// Requested `resource:action` code.
    pub permission: String,
    /// Attributes of the concrete resource instance, if any.
    pub resource: Option<Value>,
    pub request: RequestInfo,
    pub environment: BTreeMap<String, Value>,
}

impl EvaluationContext {
    /// Starts building a context for the given tenant.
    pub fn builder(tenant: TenantRef) -> ContextBuilder {
        ContextBuilder::new(tenant)
    }

    /// Resolves a dotted field path against the context.
    ///
    /// The first segment selects the root (`subject`, `tenant`,
    /// `resource`, `request` or `environment`); the rest walks nested
    /// objects. Unknown roots and missing fields resolve to `None`.
    pub fn resolve(&self, path: &str) -> Option<Value> {
        let mut segments = path.split('.');
        let root = segments.next()?;
        let rest: Vec<&str> = segments.collect();
        match root {
            "subject" => self.resolve_subject(&rest),
            "tenant" => self.resolve_tenant(&rest),
            "resource" => lookup_value(self.resource.as_ref()?, &rest).cloned(),
            "request" => self.resolve_request(&rest),
            "environment" => lookup_map(&self.environment, &rest).cloned(),
            _ => None,
        }
    }

    fn resolve_subject(&self, rest: &[&str]) -> Option<Value> {
        match rest {
            [] => None,
            ["id"] => Some(Value::String(self.subject.id.to_string())),
            ["kind"] | ["type"] => Some(Value::String(self.subject.kind.to_string())),
            ["roles"] => Some(Value::Array(
                self.subject
                    .roles
                    .iter()
                    .map(|role| Value::String(role.to_string()))
                    .collect(),
            )),
            ["permissions"] => Some(Value::Array(
                self.subject
                    .permissions
                    .iter()
                    .map(|code| Value::String(code.clone()))
                    .collect(),
            )),
            _ => lookup_map(&self.subject.attributes, rest).cloned(),
        }
    }

    fn resolve_tenant(&self, rest: &[&str]) -> Option<Value> {
        match rest {
            [] => None,
            ["id"] => Some(Value::String(self.tenant.id.to_string())),
            ["status"] => Some(Value::String(self.tenant.status.to_string())),
            _ => lookup_map(&self.tenant.attributes, rest).cloned(),
        }
    }

    fn resolve_request(&self, rest: &[&str]) -> Option<Value> {
        match rest {
            [] => None,
            ["id"] => Some(Value::String(self.request.id.clone())),
            ["ip"] => self.request.ip.clone().map(Value::String),
            ["timestamp"] => Some(Value::String(self.request.timestamp.to_rfc3339())),
            _ => lookup_map(&self.request.attributes, rest).cloned(),
        }
    }
}

fn lookup_map<'a>(map: &'a BTreeMap<String, Value>, segments: &[&str]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    lookup_value(map.get(*first)?, rest)
}

fn lookup_value<'a>(value: &'a Value, segments: &[&str]) -> Option<&'a Value> {
    let mut current = value;
    for segment in segments {
        current = current.as_object()?.get(*segment)?;
    }
    Some(current)
}

/// Builder for [`EvaluationContext`].
///
/// Fills in an anonymous subject, a generated request id and the current
/// instant when the caller does not provide them.
pub struct ContextBuilder {
    tenant: TenantRef,
    subject: Option<Subject>,
    permission: String,
    resource: Option<Value>,
    request_id: Option<String>,
    ip: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    request_attributes: BTreeMap<String, Value>,
    environment: BTreeMap<String, Value>,
}

impl ContextBuilder {
    /// Starts a builder for the given tenant.
    pub fn new(tenant: TenantRef) -> Self {
        Self {
            tenant,
            subject: None,
            permission: String::new(),
            resource: None,
            request_id: None,
            ip: None,
            timestamp: None,
            request_attributes: BTreeMap::new(),
            environment: BTreeMap::new(),
        }
    }

    /// Sets the subject.
    pub fn subject(mut self, subject: Subject) -> Self {
        self.subject = Some(subject);
        self
    }

    /// Sets the requested permission code.
    pub fn permission(mut self, code: impl Into<String>) -> Self {
        self.permission = code.into();
        self
    }

    /// Attaches the resource instance under check.
    pub fn resource(mut self, resource: Value) -> Self {
        self.resource = Some(resource);
        self
    }

    /// Overrides the generated request id.
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    /// Sets the client IP.
    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Pins the evaluation instant.
    pub fn timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.timestamp = Some(at);
        self
    }

    /// Inserts a request attribute.
    pub fn request_attribute(mut self, key: impl Into<String>, value: Value) -> Self {
        self.request_attributes.insert(key.into(), value);
        self
    }

    /// Inserts an environment entry.
    pub fn environment(mut self, key: impl Into<String>, value: Value) -> Self {
        self.environment.insert(key.into(), value);
        self
    }

    /// Finishes the context.
    pub fn build(self) -> EvaluationContext {
        let timestamp = self.timestamp.unwrap_or_else(Utc::now);
        let mut request = RequestInfo::new(timestamp);
        if let Some(id) = self.request_id {
            request.id = id;
        }
        request.ip = self.ip;
        request.attributes = self.request_attributes;
        EvaluationContext {
            tenant: self.tenant,
            subject: self.subject.unwrap_or_default(),
            permission: self.permission,
            resource: self.resource,
            request,
            environment: self.environment,
        }
    }
}
