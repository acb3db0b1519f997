//! Actions: named, versioned units of request-handling business logic
//!
//! An [`Action`] declares its input schema ([`InputSpec`]), the middleware it
//! participates in, and an async `run` body. The per-request pipeline lives in
//! [`processor`]; param defaulting/formatting/validation lives in [`params`].

pub mod params;
pub mod processor;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::connection::{Connection, JsonMap};

pub use params::Params;

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by action bodies, middleware, and the params bag
#[derive(Error, Debug)]
pub enum ActionError {
    /// The params bag was frozen after validation and cannot be modified
    #[error("params are frozen and cannot be modified")]
    ParamsFrozen,

    /// An action body or middleware failed with a message
    #[error("{0}")]
    Failed(String),
}

impl ActionError {
    /// Create a failure with a message
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

// ============================================================================
// API Versions
// ============================================================================

/// An orderable action version: numeric or named
///
/// Many actions may share a name differentiated by version; the registry
/// keeps each name's versions sorted ascending so "latest" is the last
/// element. Numeric versions order before named versions so that a mixed set
/// still resolves deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ApiVersion {
    Number(u32),
    Name(String),
}

impl ApiVersion {
    /// Parse a version from a request param (number or string)
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_u64().map(|n| Self::Number(n as u32)),
            Value::String(s) => match s.parse::<u32>() {
                Ok(n) => Some(Self::Number(n)),
                Err(_) => Some(Self::Name(s.clone())),
            },
            _ => None,
        }
    }
}

impl Default for ApiVersion {
    fn default() -> Self {
        Self::Number(1)
    }
}

impl Ord for ApiVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => a.cmp(b),
            (Self::Name(a), Self::Name(b)) => a.cmp(b),
            (Self::Number(_), Self::Name(_)) => Ordering::Less,
            (Self::Name(_), Self::Number(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for ApiVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(s) => write!(f, "{s}"),
        }
    }
}

// ============================================================================
// Input Specifications
// ============================================================================

/// A formatter: transforms a param value, or fails with a message
pub type FormatterFn = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// A validator: `Ok(true)` passes, `Ok(false)` records a generic keyed error,
/// `Err(msg)` records the message verbatim
pub type ValidatorFn = Arc<dyn Fn(&Value) -> Result<bool, String> + Send + Sync>;

/// A computed default: receives the current value (`Null` when absent)
pub type DefaultFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Default for a declared input: a literal value or a computed one
#[derive(Clone)]
pub enum ParamDefault {
    Value(Value),
    Computed(DefaultFn),
}

impl fmt::Debug for ParamDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "ParamDefault::Value({v})"),
            Self::Computed(_) => write!(f, "ParamDefault::Computed(..)"),
        }
    }
}

/// Reference to a formatter: registered by name, or inline
#[derive(Clone)]
pub enum FormatterRef {
    Named(String),
    Inline(FormatterFn),
}

impl fmt::Debug for FormatterRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => write!(f, "FormatterRef::Named({name})"),
            Self::Inline(_) => write!(f, "FormatterRef::Inline(..)"),
        }
    }
}

/// Reference to a validator: registered by name, or inline
#[derive(Clone)]
pub enum ValidatorRef {
    Named(String),
    Inline(ValidatorFn),
}

impl fmt::Debug for ValidatorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(name) => write!(f, "ValidatorRef::Named({name})"),
            Self::Inline(_) => write!(f, "ValidatorRef::Inline(..)"),
        }
    }
}

/// Declared schema for one action input
///
/// Processing order is fixed: defaulting, then formatting, then validation,
/// then the required check; nested schemas recurse last.
#[derive(Clone, Debug, Default)]
pub struct InputSpec {
    /// Whether the (possibly defaulted/formatted) value must be present
    pub required: bool,

    /// Default applied when the value is missing
    pub default: Option<ParamDefault>,

    /// Formatters applied in order, each feeding the next
    pub formatters: Vec<FormatterRef>,

    /// Validators applied in order
    pub validators: Vec<ValidatorRef>,

    /// Nested schema for structured params
    pub schema: Option<HashMap<String, InputSpec>>,
}

impl InputSpec {
    /// A required input with no other constraints
    pub fn required() -> Self {
        Self {
            required: true,
            ..Self::default()
        }
    }

    /// An optional input with no constraints
    pub fn optional() -> Self {
        Self::default()
    }

    /// Set a literal default value
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(ParamDefault::Value(value));
        self
    }

    /// Set a computed default
    pub fn with_computed_default(mut self, f: DefaultFn) -> Self {
        self.default = Some(ParamDefault::Computed(f));
        self
    }

    /// Append an inline formatter
    pub fn with_formatter(mut self, f: FormatterFn) -> Self {
        self.formatters.push(FormatterRef::Inline(f));
        self
    }

    /// Append a registered formatter by name
    pub fn with_named_formatter(mut self, name: impl Into<String>) -> Self {
        self.formatters.push(FormatterRef::Named(name.into()));
        self
    }

    /// Append an inline validator
    pub fn with_validator(mut self, f: ValidatorFn) -> Self {
        self.validators.push(ValidatorRef::Inline(f));
        self
    }

    /// Append a registered validator by name
    pub fn with_named_validator(mut self, name: impl Into<String>) -> Self {
        self.validators.push(ValidatorRef::Named(name.into()));
        self
    }

    /// Set a nested schema
    pub fn with_schema(mut self, schema: HashMap<String, InputSpec>) -> Self {
        self.schema = Some(schema);
        self
    }
}

// ============================================================================
// Responses
// ============================================================================

/// The eventual body of an action response
///
/// Most actions build an object, but string and array bodies are supported;
/// the completion funnel replaces those wholesale when an error occurs.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Object(JsonMap),
    Array(Vec<Value>),
    Text(String),
}

impl Default for ResponseBody {
    fn default() -> Self {
        Self::Object(JsonMap::new())
    }
}

impl ResponseBody {
    /// Set a key on an object body; no-op for array/text bodies
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        if let Self::Object(map) = self {
            map.insert(key.into(), value);
        }
    }

    /// Read a key from an object body
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Whether an object body already carries an `error` key
    pub fn has_error(&self) -> bool {
        matches!(self, Self::Object(map) if map.contains_key("error"))
    }

    /// Convert into a serializable JSON value
    pub fn into_value(self) -> Value {
        match self {
            Self::Object(map) => Value::Object(map),
            Self::Array(items) => Value::Array(items),
            Self::Text(text) => Value::String(text),
        }
    }
}

// ============================================================================
// Action Trait
// ============================================================================

/// Context handed to middleware and action bodies
///
/// Middleware see an open params bag; by the time `run` is invoked the bag
/// has been frozen, so the body cannot mutate its own validated input.
pub struct ActionContext {
    /// The connection this action is running for
    pub connection: Arc<Connection>,

    /// Resolved action name
    pub action: String,

    /// Resolved API version
    pub version: ApiVersion,

    /// The params bag (frozen before `run`)
    pub params: Params,

    /// The response under construction
    pub response: ResponseBody,
}

/// A named, versioned unit of request-handling business logic
#[async_trait]
pub trait Action: Send + Sync {
    /// Unique name (shared across versions)
    fn name(&self) -> &str;

    /// Version of this template
    fn version(&self) -> ApiVersion {
        ApiVersion::default()
    }

    /// Human description for status surfaces
    fn description(&self) -> &str {
        ""
    }

    /// Declared inputs, keyed by param name
    fn inputs(&self) -> HashMap<String, InputSpec> {
        HashMap::new()
    }

    /// Names of middleware this action opts into (global middleware always runs)
    fn middleware(&self) -> Vec<String> {
        Vec::new()
    }

    /// Connection types this action refuses to serve
    fn blocked_connection_types(&self) -> Vec<String> {
        Vec::new()
    }

    /// The action body
    async fn run(&self, ctx: &mut ActionContext) -> Result<(), ActionError>;
}

// ============================================================================
// Middleware
// ============================================================================

/// A named, priority-ordered hook around action execution
///
/// Middleware run sequentially in ascending priority order; a failing
/// pre-processor aborts the whole action with its error as the terminal
/// status.
#[async_trait]
pub trait ActionMiddleware: Send + Sync {
    /// Unique middleware name; actions opt in by listing it
    fn name(&self) -> &str;

    /// Ascending execution order (lower runs first)
    fn priority(&self) -> i32 {
        100
    }

    /// Global middleware runs for every action without opt-in
    fn global(&self) -> bool {
        false
    }

    /// Runs before scrubbing/validation
    async fn pre_process(&self, _ctx: &mut ActionContext) -> Result<(), ActionError> {
        Ok(())
    }

    /// Runs after the action body
    async fn post_process(&self, _ctx: &mut ActionContext) -> Result<(), ActionError> {
        Ok(())
    }
}
