//! # Filter
//!
//! Decides whether an event should be delivered to a destination by evaluating the
//! destination's filter rules. Evaluation never fails: rules that cannot be evaluated
//! simply do not pass.
use regex::RegexBuilder;
use serde_json::Value;

use crate::destination::{Destination, FilterKind, FilterOperator, FilterRule};
use crate::event::{normalize_header_name, Event, TRANSPORT_HEADER_PREFIX};

/// Returns true when `event` satisfies every filter rule of `destination`.
/// A destination without rules accepts every event.
pub fn passes(event: &Event, destination: &Destination) -> bool {
    let mut payload = LazyPayload::new(&event.payload);

    destination
        .filters
        .iter()
        .all(|rule| rule_passes(rule, event, &mut payload))
}

/// The event payload, parsed at most once and only if a payload rule needs it.
struct LazyPayload<'a> {
    raw: &'a [u8],
    parsed: Option<Option<Value>>,
}

impl<'a> LazyPayload<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self { raw, parsed: None }
    }

    fn json(&mut self) -> Option<&Value> {
        let raw = self.raw;
        self.parsed
            .get_or_insert_with(|| {
                if raw.is_empty() {
                    None
                } else {
                    serde_json::from_slice::<Value>(raw).ok()
                }
            })
            .as_ref()
    }
}

/// Outcome of walking a dotted path through the payload.
enum Resolution<'v> {
    Found(&'v Value),
    Missing,
    Unreachable,
}

fn rule_passes(rule: &FilterRule, event: &Event, payload: &mut LazyPayload) -> bool {
    match rule.kind {
        FilterKind::Header => {
            let value = header_value(event, &rule.field);
            apply_operator(rule, value, value.is_some_and(is_present))
        }
        FilterKind::Payload => {
            let Some(json) = payload.json() else {
                return false;
            };

            match resolve_path(json, &rule.field) {
                Resolution::Found(value) => {
                    let present = is_present_value(value);
                    let value = to_string_representation(value);
                    apply_operator(rule, Some(&value), present)
                }
                Resolution::Missing => apply_operator(rule, None, false),
                Resolution::Unreachable => false,
            }
        }
    }
}

/// Look up a header by its literal name, then by its `HTTP_` prefixed form, then by its bare
/// normalized form.
pub fn header_value<'e>(event: &'e Event, field: &str) -> Option<&'e str> {
    let normalized = normalize_header_name(field);

    event
        .headers
        .get(field)
        .or_else(|| {
            event
                .headers
                .get(&format!("{}{}", TRANSPORT_HEADER_PREFIX, normalized))
        })
        .or_else(|| event.headers.get(&normalized))
        .map(String::as_str)
}

fn resolve_path<'v>(json: &'v Value, field: &str) -> Resolution<'v> {
    let path = match field.strip_prefix('$') {
        Some(rest) => rest.strip_prefix('.').unwrap_or(rest),
        None => field,
    };

    if path.is_empty() {
        return Resolution::Found(json);
    }

    let mut current = json;
    for key in path.split('.') {
        let Value::Object(map) = current else {
            return Resolution::Unreachable;
        };

        match map.get(key) {
            Some(next) => current = next,
            None => return Resolution::Missing,
        }
    }

    Resolution::Found(current)
}

fn apply_operator(rule: &FilterRule, value: Option<&str>, present: bool) -> bool {
    match rule.operator {
        FilterOperator::Exists => present,
        FilterOperator::Equals => rule
            .value
            .as_deref()
            .is_some_and(|expected| value.unwrap_or_default() == expected),
        FilterOperator::Matches => rule
            .value
            .as_deref()
            .is_some_and(|pattern| glob_matches(pattern, value.unwrap_or_default())),
    }
}

/// Case-insensitive, fully anchored glob match where `*` matches any sequence of characters.
/// Blank or unusable patterns never match.
pub fn glob_matches(pattern: &str, value: &str) -> bool {
    if pattern.trim().is_empty() {
        return false;
    }

    let expression = format!("^{}$", regex::escape(pattern).replace(r"\*", ".*"));

    match RegexBuilder::new(&expression)
        .case_insensitive(true)
        .dot_matches_new_line(true)
        .build()
    {
        Ok(re) => re.is_match(value),
        Err(_) => false,
    }
}

pub fn to_string_representation(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_present(value: &str) -> bool {
    !value.trim().is_empty()
}

fn is_present_value(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => is_present(s),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(flag) => *flag,
        Value::Number(_) => true,
    }
}
