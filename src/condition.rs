use crate::context::EvaluationContext;
use crate::error::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Timelike, Utc};
use ipnet::Ipv4Net;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// A predicate gating whether a rule or permission applies.
///
/// Evaluation never fails: malformed conditions, missing context fields,
/// invalid regexes or CIDR patterns and predicate errors all resolve to
/// `false` (except the deliberate block-list asymmetry of
/// [`IpMode::NotIn`]).
#[derive(Clone, Debug)]
pub enum Condition {
    Field(FieldCondition),
    Time(TimeCondition),
    Ip(IpCondition),
    Custom(CustomCondition),
}

impl Condition {
    /// Builds a field condition on a dotted context path.
    pub fn field(field: impl Into<String>, op: FieldOp, value: Value) -> Self {
        Self::Field(FieldCondition::new(field, op, value))
    }

    /// Builds a time-window condition.
    pub fn time(condition: TimeCondition) -> Self {
        Self::Time(condition)
    }

    /// Builds an IP condition over the given patterns.
    pub fn ip<I, S>(patterns: I, mode: IpMode) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Ip(IpCondition {
            patterns: patterns.into_iter().map(Into::into).collect(),
            mode,
        })
    }

    /// Builds a custom condition around a named predicate.
    pub fn custom(name: impl Into<String>, predicate: impl Predicate + 'static) -> Self {
        Self::Custom(CustomCondition {
            name: name.into(),
            predicate: Arc::new(predicate),
        })
    }

    /// Evaluates the condition against a context.
    pub async fn evaluate(&self, ctx: &EvaluationContext) -> bool {
        match self {
            Self::Field(condition) => condition.evaluate(ctx),
            Self::Time(condition) => condition.evaluate(ctx.request.timestamp),
            Self::Ip(condition) => condition.evaluate(ctx.request.ip.as_deref()),
            Self::Custom(condition) => condition.evaluate(ctx).await,
        }
    }
}

/// Comparison operator for [`FieldCondition`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FieldOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    Exists,
    NotExists,
}

/// Compares a dotted context path against an expected value.
///
/// A [`FieldOp::Matches`] pattern is compiled once when the condition is
/// built; a pattern that does not compile never matches.
#[derive(Clone, Debug)]
pub struct FieldCondition {
    pub field: String,
    pub op: FieldOp,
    pub value: Value,
    regex: Option<Regex>,
}

impl FieldCondition {
    /// Builds the condition, compiling a `Matches` pattern up front.
    pub fn new(field: impl Into<String>, op: FieldOp, value: Value) -> Self {
        let regex = match (op, value.as_str()) {
            (FieldOp::Matches, Some(pattern)) => match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(error) => {
                    debug!(pattern, %error, "match pattern does not compile");
                    None
                }
            },
            _ => None,
        };
        Self {
            field: field.into(),
            op,
            value,
            regex,
        }
    }

    /// Evaluates against the context; type mismatches resolve to `false`.
    pub fn evaluate(&self, ctx: &EvaluationContext) -> bool {
        let actual = ctx.resolve(&self.field);
        match self.op {
            FieldOp::Exists => matches!(&actual, Some(value) if !value.is_null()),
            FieldOp::NotExists => !matches!(&actual, Some(value) if !value.is_null()),
            _ => {
                let Some(actual) = actual else {
                    return false;
                };
                self.compare(&actual)
            }
        }
    }

    fn compare(&self, actual: &Value) -> bool {
        let expected = &self.value;
        match self.op {
            FieldOp::Eq => json_eq(actual, expected),
            FieldOp::Neq => same_kind(actual, expected) && !json_eq(actual, expected),
            FieldOp::Gt => matches!(json_cmp(actual, expected), Some(Ordering::Greater)),
            FieldOp::Gte => matches!(
                json_cmp(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FieldOp::Lt => matches!(json_cmp(actual, expected), Some(Ordering::Less)),
            FieldOp::Lte => matches!(
                json_cmp(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FieldOp::In => expected
                .as_array()
                .is_some_and(|items| items.iter().any(|item| json_eq(actual, item))),
            FieldOp::NotIn => expected
                .as_array()
                .is_some_and(|items| !items.iter().any(|item| json_eq(actual, item))),
            FieldOp::Contains => match actual {
                Value::Array(items) => items.iter().any(|item| json_eq(item, expected)),
                Value::String(haystack) => expected
                    .as_str()
                    .is_some_and(|needle| haystack.contains(needle)),
                _ => false,
            },
            FieldOp::StartsWith => match (actual.as_str(), expected.as_str()) {
                (Some(haystack), Some(prefix)) => haystack.starts_with(prefix),
                _ => false,
            },
            FieldOp::EndsWith => match (actual.as_str(), expected.as_str()) {
                (Some(haystack), Some(suffix)) => haystack.ends_with(suffix),
                _ => false,
            },
            FieldOp::Matches => match (actual.as_str(), &self.regex) {
                (Some(haystack), Some(regex)) => regex.is_match(haystack),
                _ => false,
            },
            FieldOp::Exists | FieldOp::NotExists => unreachable!("handled in evaluate"),
        }
    }
}

fn same_kind(a: &Value, b: &Value) -> bool {
    if a.is_number() && b.is_number() {
        return true;
    }
    std::mem::discriminant(a) == std::mem::discriminant(b)
}

fn json_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    same_kind(a, b) && a == b
}

fn json_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

/// Time window evaluated against the context-carried request timestamp,
/// never the wall clock.
///
/// All constraints are optional and combined with AND; the empty
/// condition always matches. `after` is inclusive, `before` exclusive,
/// and `hours` is a half-open `[start, end)` range of UTC hours that
/// does not wrap past midnight.
#[derive(Clone, Debug, Default)]
pub struct TimeCondition {
    pub after: Option<DateTime<Utc>>,
    pub before: Option<DateTime<Utc>>,
    /// Allowed weekdays, Sunday = 0.
    pub days: Option<Vec<u32>>,
    pub hours: Option<(u32, u32)>,
}

impl TimeCondition {
    /// Creates the empty (always-matching) condition.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requires the timestamp to be at or past the instant.
    pub fn with_after(mut self, at: DateTime<Utc>) -> Self {
        self.after = Some(at);
        self
    }

    /// Requires the timestamp to be strictly before the instant.
    pub fn with_before(mut self, at: DateTime<Utc>) -> Self {
        self.before = Some(at);
        self
    }

    /// Restricts to the given weekdays (Sunday = 0).
    pub fn with_days(mut self, days: impl IntoIterator<Item = u32>) -> Self {
        self.days = Some(days.into_iter().collect());
        self
    }

    /// Restricts to UTC hours in `[start, end)`.
    pub fn with_hours(mut self, start: u32, end: u32) -> Self {
        self.hours = Some((start, end));
        self
    }

    /// Evaluates against the given instant.
    pub fn evaluate(&self, at: DateTime<Utc>) -> bool {
        if let Some(after) = self.after
            && at < after
        {
            return false;
        }
        if let Some(before) = self.before
            && at >= before
        {
            return false;
        }
        if let Some(days) = &self.days
            && !days.contains(&at.weekday().num_days_from_sunday())
        {
            return false;
        }
        if let Some((start, end)) = self.hours {
            let hour = at.hour();
            if hour < start || hour >= end {
                return false;
            }
        }
        true
    }
}

/// Whether an IP condition is an allow-list or a block-list.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IpMode {
    /// Client IP must match one of the patterns; a missing IP fails.
    #[default]
    In,
    /// Client IP must match none of the patterns; a missing IP passes,
    /// so an absent address is never treated as blocked.
    NotIn,
}

/// Matches the request IP against exact addresses, dotted-prefix
/// wildcards (`192.168.1.*`) and IPv4 CIDR blocks.
#[derive(Clone, Debug)]
pub struct IpCondition {
    pub patterns: Vec<String>,
    pub mode: IpMode,
}

impl IpCondition {
    /// Evaluates against an optional client address.
    pub fn evaluate(&self, ip: Option<&str>) -> bool {
        let Some(ip) = ip else {
            return self.mode == IpMode::NotIn;
        };
        let hit = self
            .patterns
            .iter()
            .any(|pattern| ip_pattern_matches(pattern, ip));
        match self.mode {
            IpMode::In => hit,
            IpMode::NotIn => !hit,
        }
    }
}

fn ip_pattern_matches(pattern: &str, ip: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        // Dotted-prefix form only: the star must replace whole trailing
        // segments, as in `192.168.1.*`.
        return prefix.ends_with('.') && !prefix.contains('*') && ip.starts_with(prefix);
    }
    if pattern.contains('*') {
        return false;
    }
    if pattern.contains('/') {
        let Ok(net) = pattern.parse::<Ipv4Net>() else {
            return false;
        };
        return match ip.parse::<IpAddr>() {
            Ok(IpAddr::V4(addr)) => net.contains(&addr),
            _ => false,
        };
    }
    match (pattern.parse::<IpAddr>(), ip.parse::<IpAddr>()) {
        (Ok(expected), Ok(actual)) => expected == actual,
        _ => false,
    }
}

/// Caller-supplied predicate for [`Condition::Custom`].
#[async_trait]
pub trait Predicate: Send + Sync {
    /// Decides whether the condition holds; errors are treated as `false`.
    async fn test(&self, ctx: &EvaluationContext) -> std::result::Result<bool, StoreError>;
}

/// Adapts a synchronous closure into a [`Predicate`].
pub struct FnPredicate<F> {
    f: F,
}

impl<F> FnPredicate<F>
where
    F: Fn(&EvaluationContext) -> std::result::Result<bool, StoreError> + Send + Sync,
{
    /// Wraps the closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> Predicate for FnPredicate<F>
where
    F: Fn(&EvaluationContext) -> std::result::Result<bool, StoreError> + Send + Sync,
{
    async fn test(&self, ctx: &EvaluationContext) -> std::result::Result<bool, StoreError> {
        (self.f)(ctx)
    }
}

/// Named wrapper around a [`Predicate`].
#[derive(Clone)]
pub struct CustomCondition {
    name: String,
    predicate: Arc<dyn Predicate>,
}

impl CustomCondition {
    /// Returns the predicate name used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Evaluates the predicate; an error resolves to `false`.
    pub async fn evaluate(&self, ctx: &EvaluationContext) -> bool {
        match self.predicate.test(ctx).await {
            Ok(outcome) => outcome,
            Err(error) => {
                debug!(condition = %self.name, %error, "custom condition failed, treating as unmatched");
                false
            }
        }
    }
}

impl fmt::Debug for CustomCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomCondition")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
