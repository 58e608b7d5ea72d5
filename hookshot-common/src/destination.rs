//! # Destination
//!
//! Endpoints that receive copies of inbound events, and the filter rules gating them.
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TIMEOUT_SECS: i32 = 30;
pub const MAX_TIMEOUT_SECS: i32 = 300;

/// Reasons for rejecting a destination or one of its filter rules.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DestinationError {
    #[error("destination name must not be blank")]
    BlankName,
    #[error("{0} is not a valid http(s) url")]
    InvalidUrl(String),
    #[error("timeout must be between 1 and {MAX_TIMEOUT_SECS} seconds, got {0}")]
    InvalidTimeout(i32),
    #[error("filter field must not be blank")]
    BlankField,
    #[error("a value is required for the {0} operator")]
    MissingValue(FilterOperator),
    #[error("{0} is not a valid filter kind")]
    ParseFilterKindError(String),
    #[error("{0} is not a valid filter operator")]
    ParseFilterOperatorError(String),
}

/// Where a filter rule reads its value from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "filter_kind", rename_all = "lowercase")]
pub enum FilterKind {
    Header,
    Payload,
}

impl FromStr for FilterKind {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "header" => Ok(FilterKind::Header),
            "payload" => Ok(FilterKind::Payload),
            invalid => Err(DestinationError::ParseFilterKindError(invalid.to_owned())),
        }
    }
}

/// How a filter rule compares the resolved value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "filter_operator", rename_all = "lowercase")]
pub enum FilterOperator {
    Exists,
    Equals,
    Matches,
}

impl FromStr for FilterOperator {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exists" => Ok(FilterOperator::Exists),
            "equals" => Ok(FilterOperator::Equals),
            "matches" => Ok(FilterOperator::Matches),
            invalid => Err(DestinationError::ParseFilterOperatorError(invalid.to_owned())),
        }
    }
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterOperator::Exists => write!(f, "exists"),
            FilterOperator::Equals => write!(f, "equals"),
            FilterOperator::Matches => write!(f, "matches"),
        }
    }
}

/// A single predicate an event must satisfy to be delivered to a destination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UncheckedFilterRule")]
pub struct FilterRule {
    pub kind: FilterKind,
    pub field: String,
    pub operator: FilterOperator,
    pub value: Option<String>,
}

impl FilterRule {
    /// Build a rule, requiring a non-blank value for every operator except `exists`.
    pub fn new(
        kind: FilterKind,
        field: &str,
        operator: FilterOperator,
        value: Option<&str>,
    ) -> Result<Self, DestinationError> {
        if field.trim().is_empty() {
            return Err(DestinationError::BlankField);
        }

        let value = value.map(str::to_owned);
        let has_value = value.as_deref().is_some_and(|v| !v.trim().is_empty());

        match operator {
            FilterOperator::Exists => {}
            FilterOperator::Equals | FilterOperator::Matches if !has_value => {
                return Err(DestinationError::MissingValue(operator));
            }
            FilterOperator::Equals | FilterOperator::Matches => {}
        }

        Ok(Self {
            kind,
            field: field.to_owned(),
            operator,
            value,
        })
    }

    pub fn header(field: &str, operator: FilterOperator, value: Option<&str>) -> Result<Self, DestinationError> {
        Self::new(FilterKind::Header, field, operator, value)
    }

    pub fn payload(field: &str, operator: FilterOperator, value: Option<&str>) -> Result<Self, DestinationError> {
        Self::new(FilterKind::Payload, field, operator, value)
    }
}

#[derive(Deserialize)]
struct UncheckedFilterRule {
    kind: FilterKind,
    field: String,
    operator: FilterOperator,
    value: Option<String>,
}

impl TryFrom<UncheckedFilterRule> for FilterRule {
    type Error = DestinationError;

    fn try_from(rule: UncheckedFilterRule) -> Result<Self, Self::Error> {
        FilterRule::new(rule.kind, &rule.field, rule.operator, rule.value.as_deref())
    }
}

/// A configured endpoint receiving copies of inbound events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Destination {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub active: bool,
    pub custom_headers: HashMap<String, String>,
    pub timeout_secs: i32,
    pub filters: Vec<FilterRule>,
}

impl Destination {
    pub fn timeout(&self) -> time::Duration {
        time::Duration::from_secs(u64::from(self.timeout_secs.unsigned_abs()))
    }
}

fn default_active() -> bool {
    true
}

fn default_timeout_secs() -> i32 {
    DEFAULT_TIMEOUT_SECS
}

/// A destination that has not been persisted yet.
#[derive(Clone, Debug, Deserialize)]
pub struct NewDestination {
    pub name: String,
    pub url: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub custom_headers: HashMap<String, String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: i32,
    #[serde(default)]
    pub filters: Vec<FilterRule>,
}

impl NewDestination {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_owned(),
            url: url.to_owned(),
            active: true,
            custom_headers: HashMap::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, rule: FilterRule) -> Self {
        self.filters.push(rule);
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        drop(self.custom_headers.insert(name.to_owned(), value.to_owned()));
        self
    }

    pub fn with_timeout_secs(mut self, timeout_secs: i32) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    /// Check the invariants a destination must hold before it is stored.
    pub fn validate(&self) -> Result<(), DestinationError> {
        if self.name.trim().is_empty() {
            return Err(DestinationError::BlankName);
        }

        match url::Url::parse(&self.url) {
            Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
            _ => return Err(DestinationError::InvalidUrl(self.url.clone())),
        }

        if !(1..=MAX_TIMEOUT_SECS).contains(&self.timeout_secs) {
            return Err(DestinationError::InvalidTimeout(self.timeout_secs));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_required_unless_exists() {
        assert!(FilterRule::header("X-Api-Key", FilterOperator::Exists, None).is_ok());
        assert_eq!(
            FilterRule::header("X-Api-Key", FilterOperator::Equals, None),
            Err(DestinationError::MissingValue(FilterOperator::Equals))
        );
        assert_eq!(
            FilterRule::payload("a.b", FilterOperator::Matches, Some("  ")),
            Err(DestinationError::MissingValue(FilterOperator::Matches))
        );
        assert_eq!(
            FilterRule::payload(" ", FilterOperator::Exists, None),
            Err(DestinationError::BlankField)
        );
    }

    #[test]
    fn test_deserialize_rejects_invalid_rule() {
        let rule: Result<FilterRule, _> =
            serde_json::from_str(r#"{"kind":"header","field":"X-Api-Key","operator":"equals"}"#);
        assert!(rule.is_err());

        let rule: FilterRule = serde_json::from_str(
            r#"{"kind":"payload","field":"$.type","operator":"matches","value":"order.*"}"#,
        )
        .unwrap();
        assert_eq!(rule.kind, FilterKind::Payload);
        assert_eq!(rule.operator, FilterOperator::Matches);
    }

    #[test]
    fn test_validate_destination() {
        assert!(NewDestination::new("orders", "https://example.com/hook")
            .validate()
            .is_ok());
        assert_eq!(
            NewDestination::new("orders", "ftp://example.com").validate(),
            Err(DestinationError::InvalidUrl("ftp://example.com".to_owned()))
        );
        assert_eq!(
            NewDestination::new("", "https://example.com").validate(),
            Err(DestinationError::BlankName)
        );
        assert_eq!(
            NewDestination::new("orders", "https://example.com")
                .with_timeout_secs(301)
                .validate(),
            Err(DestinationError::InvalidTimeout(301))
        );
        assert_eq!(
            NewDestination::new("orders", "https://example.com")
                .with_timeout_secs(0)
                .validate(),
            Err(DestinationError::InvalidTimeout(0))
        );
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("header".parse::<FilterKind>(), Ok(FilterKind::Header));
        assert_eq!("matches".parse::<FilterOperator>(), Ok(FilterOperator::Matches));
        assert!("contains".parse::<FilterOperator>().is_err());
    }
}
