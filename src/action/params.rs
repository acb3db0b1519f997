//! Param bags, scrubbing, and per-input validation
//!
//! The [`Params`] bag is a shallow copy of the connection's params taken when
//! a processor is created. It stays open while middleware run and validation
//! mutates it (defaults, formatters), then is frozen before the action body
//! runs; mutation attempts after the freeze fail loudly.
//!
//! [`validate_param`] applies one [`InputSpec`] to one key in strict order:
//! default, formatters, validators, required check, nested-schema recursion.
//! Validation failures are recorded into a [`ValidationOutcome`], never
//! raised.

use serde_json::Value;
use std::collections::{HashMap, HashSet};

use super::{ActionError, FormatterRef, InputSpec, ParamDefault, ValidatorRef};
use crate::connection::JsonMap;
use crate::registry::FunctionTable;

// ============================================================================
// Params Bag
// ============================================================================

/// A freezeable params bag
#[derive(Debug, Clone, Default)]
pub struct Params {
    values: JsonMap,
    frozen: bool,
}

impl Params {
    /// Wrap an existing params map (open for mutation)
    pub fn new(values: JsonMap) -> Self {
        Self {
            values,
            frozen: false,
        }
    }

    /// Read one param
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Whether a key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Insert one param; fails once the bag is frozen
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Result<(), ActionError> {
        if self.frozen {
            return Err(ActionError::ParamsFrozen);
        }
        self.values.insert(key.into(), value);
        Ok(())
    }

    /// Remove one param; fails once the bag is frozen
    pub fn remove(&mut self, key: &str) -> Result<Option<Value>, ActionError> {
        if self.frozen {
            return Err(ActionError::ParamsFrozen);
        }
        Ok(self.values.remove(key))
    }

    /// Freeze the bag; all later mutation attempts fail
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Whether the bag has been frozen
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Read-only view of the underlying map
    pub fn as_map(&self) -> &JsonMap {
        &self.values
    }

    /// Mutable access for the validation pipeline; `None` once frozen
    pub(crate) fn values_mut(&mut self) -> Option<&mut JsonMap> {
        if self.frozen {
            None
        } else {
            Some(&mut self.values)
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

// ============================================================================
// Scrubbing
// ============================================================================

/// Delete every key that is neither a declared input nor whitelisted.
///
/// Returns the removed keys. Runs before validation so validators only ever
/// see intentionally-declared inputs.
pub fn scrub_params(
    params: &mut JsonMap,
    declared: &HashMap<String, InputSpec>,
    whitelist: &HashSet<String>,
) -> Vec<String> {
    let doomed: Vec<String> = params
        .keys()
        .filter(|k| !declared.contains_key(*k) && !whitelist.contains(*k))
        .cloned()
        .collect();
    for key in &doomed {
        params.remove(key);
    }
    doomed
}

// ============================================================================
// Validation
// ============================================================================

/// Collected results of validating one processor's inputs
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    /// Keys flagged missing by the required check, in declaration order
    pub missing_params: Vec<String>,

    /// Validator failure messages, in declaration order
    pub validator_errors: Vec<String>,
}

impl ValidationOutcome {
    pub fn is_clean(&self) -> bool {
        self.missing_params.is_empty() && self.validator_errors.is_empty()
    }
}

/// Apply one input spec to one key of a params bag.
///
/// `schema_key` carries the dotted prefix while recursing into nested
/// schemas, so a missing nested key is reported as `parent.child`.
pub fn validate_param(
    spec: &InputSpec,
    params: &mut JsonMap,
    key: &str,
    schema_key: Option<&str>,
    table: &FunctionTable,
    missing_sentinels: &[Value],
    outcome: &mut ValidationOutcome,
) {
    let display_key = match schema_key {
        Some(prefix) => format!("{prefix}.{key}"),
        None => key.to_string(),
    };

    // 1. Default: only an absent key counts as undefined
    if !params.contains_key(key) {
        if let Some(default) = &spec.default {
            let value = match default {
                ParamDefault::Value(v) => v.clone(),
                ParamDefault::Computed(f) => f(&Value::Null),
            };
            params.insert(key.to_string(), value);
        }
    }

    // 2. Formatters: applied in order, each feeding the next
    if params.contains_key(key) && !spec.formatters.is_empty() {
        let mut value = params.get(key).cloned().unwrap_or(Value::Null);
        let mut failed = false;
        for formatter in &spec.formatters {
            let result = match formatter {
                FormatterRef::Inline(f) => f(value.clone()),
                FormatterRef::Named(name) => match table.formatter(name) {
                    Some(f) => f(value.clone()),
                    None => Err(format!("unknown formatter '{name}'")),
                },
            };
            match result {
                Ok(next) => value = next,
                Err(msg) => {
                    outcome.validator_errors.push(msg);
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            params.insert(key.to_string(), value);
        }
    }

    // 3. Validators
    if params.contains_key(key) && !spec.validators.is_empty() {
        let value = params.get(key).cloned().unwrap_or(Value::Null);
        for validator in &spec.validators {
            let result = match validator {
                ValidatorRef::Inline(f) => f(&value),
                ValidatorRef::Named(name) => match table.validator(name) {
                    Some(f) => f(&value),
                    None => Err(format!("unknown validator '{name}'")),
                },
            };
            match result {
                Ok(true) => {}
                Ok(false) => outcome
                    .validator_errors
                    .push(format!("Error: {display_key} is an invalid value")),
                Err(msg) => outcome.validator_errors.push(msg),
            }
        }
    }

    // 4. Required check: evaluated last, against the current value
    if spec.required {
        let missing = match params.get(key) {
            None => true,
            Some(value) => missing_sentinels.contains(value),
        };
        if missing {
            outcome.missing_params.push(display_key.clone());
        }
    }

    // 5. Nested schema recursion
    if let Some(schema) = &spec.schema {
        if let Some(Value::Object(nested)) = params.get_mut(key) {
            // Re-apply scrubbing scoped to the nested object
            let schema_whitelist = HashSet::new();
            scrub_params(nested, schema, &schema_whitelist);

            let mut nested_keys: Vec<&String> = schema.keys().collect();
            nested_keys.sort();
            for nested_key in nested_keys {
                let nested_spec = &schema[nested_key];
                validate_param(
                    nested_spec,
                    nested,
                    nested_key,
                    Some(&display_key),
                    table,
                    missing_sentinels,
                    outcome,
                );
            }
        }
    }
}

/// Redact secrets and truncate oversized values before a params bag is
/// written to a completion log line.
pub fn filter_params_for_logging(
    params: &JsonMap,
    secret_params: &[String],
    max_len: usize,
) -> JsonMap {
    let mut filtered = JsonMap::new();
    for (key, value) in params {
        if secret_params.iter().any(|s| s == key) {
            filtered.insert(key.clone(), Value::String(String::from("[redacted]")));
            continue;
        }
        let rendered = match value {
            Value::String(s) if s.len() > max_len => {
                Value::String(format!("{}...", truncate_at_char_boundary(s, max_len)))
            }
            other => {
                let text = other.to_string();
                if text.len() > max_len {
                    Value::String(format!("{}...", truncate_at_char_boundary(&text, max_len)))
                } else {
                    other.clone()
                }
            }
        };
        filtered.insert(key.clone(), rendered);
    }
    filtered
}

/// Longest prefix of `s` that is at most `max_len` bytes and ends on a
/// character boundary. Byte-slicing at the raw limit panics on multibyte
/// text.
fn truncate_at_char_boundary(s: &str, max_len: usize) -> &str {
    let mut end = 0;
    for (idx, ch) in s.char_indices() {
        if idx + ch.len_utf8() > max_len {
            break;
        }
        end = idx + ch.len_utf8();
    }
    &s[..end]
}
