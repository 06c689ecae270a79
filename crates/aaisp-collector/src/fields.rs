//! Alias-tolerant field extraction from CHAOS payloads.
//!
//! The upstream API is not consistent about key names, so every expected
//! field is looked up through an ordered alias list. A missing field yields
//! `None` and no error; a present field that cannot be converted yields
//! `None` plus a [`FieldError`].

use crate::{FieldError, FieldErrorKind};
use aaisp_common::types::ServiceId;
use chrono::NaiveDateTime;
use serde_json::Value;

/// An expected payload field and the keys it may appear under, in order
/// of preference.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
}

impl FieldSpec {
    pub const fn new(name: &'static str, aliases: &'static [&'static str]) -> Self {
        Self { name, aliases }
    }

    /// First alias present with a non-null value.
    pub fn lookup<'a>(&self, payload: &'a Value) -> Option<&'a Value> {
        self.aliases
            .iter()
            .find_map(|key| payload.get(*key).filter(|value| !value.is_null()))
    }
}

/// A number, or a string holding one.
pub fn to_number(value: &Value) -> Result<f64, String> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n.is_finite() => Ok(n),
        _ => Err(format!("expected a number, got {value}")),
    }
}

/// A non-negative byte count.
pub fn to_bytes(value: &Value) -> Result<f64, String> {
    let n = to_number(value)?;
    if n < 0.0 {
        return Err(format!("negative byte count {n}"));
    }
    Ok(n)
}

/// `Y`/`N` style tokens as 1.0 or 0.0.
pub fn to_flag(value: &Value) -> Result<f64, String> {
    match value {
        Value::Bool(b) => Ok(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => match n.as_f64() {
            Some(v) if v == 0.0 => Ok(0.0),
            Some(v) if v == 1.0 => Ok(1.0),
            _ => Err(format!("expected a flag, got {n}")),
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "y" | "yes" | "true" | "1" => Ok(1.0),
            "n" | "no" | "false" | "0" => Ok(0.0),
            _ => Err(format!("expected a flag, got {s:?}")),
        },
        other => Err(format!("expected a flag, got {other}")),
    }
}

/// `YYYY-MM-DD HH:MM:SS` (read as UTC) or epoch seconds.
pub fn to_timestamp(value: &Value) -> Result<f64, String> {
    if let Value::String(s) = value {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s.trim(), "%Y-%m-%d %H:%M:%S") {
            return Ok(dt.and_utc().timestamp() as f64);
        }
    }
    to_number(value).map_err(|_| format!("expected a timestamp, got {value}"))
}

/// Scalar rendered as a label value. Empty strings and containers are absent.
pub fn to_label(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Reads fields from one payload object and collects conversion failures.
pub struct Extractor<'a> {
    payload: &'a Value,
    service: Option<&'a ServiceId>,
    errors: Vec<FieldError>,
}

impl<'a> Extractor<'a> {
    pub fn new(payload: &'a Value, service: Option<&'a ServiceId>) -> Self {
        Self {
            payload,
            service,
            errors: Vec::new(),
        }
    }

    /// Extractor over a nested object found under any of `spec`'s aliases.
    /// Errors from the child must be folded back with [`Extractor::absorb`].
    pub fn nested(&self, spec: &FieldSpec) -> Option<Extractor<'a>> {
        spec.lookup(self.payload)
            .filter(|value| value.is_object())
            .map(|value| Extractor::new(value, self.service))
    }

    pub fn absorb(&mut self, child: Extractor<'_>) {
        self.errors.extend(child.errors);
    }

    pub fn number(&mut self, spec: &FieldSpec) -> Option<f64> {
        self.convert(spec, to_number)
    }

    pub fn bytes(&mut self, spec: &FieldSpec) -> Option<f64> {
        self.convert(spec, to_bytes)
    }

    pub fn flag(&mut self, spec: &FieldSpec) -> Option<f64> {
        self.convert(spec, to_flag)
    }

    pub fn timestamp(&mut self, spec: &FieldSpec) -> Option<f64> {
        self.convert(spec, to_timestamp)
    }

    pub fn label(&self, spec: &FieldSpec) -> Option<String> {
        spec.lookup(self.payload).and_then(to_label)
    }

    pub fn label_or(&self, spec: &FieldSpec, default: &str) -> String {
        self.label(spec).unwrap_or_else(|| default.to_string())
    }

    /// Records a payload-shape problem not tied to a single conversion.
    pub fn shape_error(&mut self, field: &str, reason: impl Into<String>) {
        self.errors.push(FieldError {
            service: self.service.cloned(),
            field: field.to_string(),
            reason: FieldErrorKind::Shape(reason.into()),
        });
    }

    /// Records a present field that could not be converted.
    pub fn conversion_error(&mut self, field: &str, reason: impl Into<String>) {
        self.errors.push(FieldError {
            service: self.service.cloned(),
            field: field.to_string(),
            reason: FieldErrorKind::Conversion(reason.into()),
        });
    }

    pub fn into_errors(self) -> Vec<FieldError> {
        self.errors
    }

    fn convert(&mut self, spec: &FieldSpec, f: fn(&Value) -> Result<f64, String>) -> Option<f64> {
        let value = spec.lookup(self.payload)?;
        match f(value) {
            Ok(v) => Some(v),
            Err(reason) => {
                self.conversion_error(spec.name, reason);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TOTAL: FieldSpec = FieldSpec::new("total", &["quota_monthly", "quota", "total"]);

    #[test]
    fn first_present_alias_wins() {
        let payload = json!({"quota": "10", "total": 20});
        assert_eq!(TOTAL.lookup(&payload), Some(&json!("10")));

        let payload = json!({"quota_monthly": null, "total": 20});
        assert_eq!(TOTAL.lookup(&payload), Some(&json!(20)));
    }

    #[test]
    fn missing_fields_are_absent_without_errors() {
        let payload = json!({"other": 1});
        let mut ex = Extractor::new(&payload, None);
        assert_eq!(ex.bytes(&TOTAL), None);
        assert!(ex.into_errors().is_empty());
    }

    #[test]
    fn unconvertible_fields_become_field_errors() {
        let payload = json!({"quota": "lots"});
        let service = ServiceId::from("0123456789");
        let mut ex = Extractor::new(&payload, Some(&service));
        assert_eq!(ex.bytes(&TOTAL), None);

        let errors = ex.into_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "total");
        assert_eq!(errors[0].service.as_ref(), Some(&service));
        assert!(matches!(errors[0].reason, FieldErrorKind::Conversion(_)));
    }

    #[test]
    fn converters_normalise_upstream_tokens() {
        assert_eq!(to_number(&json!(" 12.5 ")), Ok(12.5));
        assert!(to_bytes(&json!(-1)).is_err());
        assert_eq!(to_flag(&json!("Y")), Ok(1.0));
        assert_eq!(to_flag(&json!("no")), Ok(0.0));
        assert_eq!(to_flag(&json!(true)), Ok(1.0));
        assert!(to_flag(&json!("maybe")).is_err());
        assert_eq!(to_timestamp(&json!("1970-01-02 00:00:00")), Ok(86_400.0));
        assert_eq!(to_timestamp(&json!(1_700_000_000)), Ok(1_700_000_000.0));
        assert!(to_timestamp(&json!("yesterday")).is_err());
        assert_eq!(to_label(&json!(" SW1A 1AA ")), Some("SW1A 1AA".to_string()));
        assert_eq!(to_label(&json!("")), None);
    }

    #[test]
    fn nested_extractors_feed_errors_back_to_the_parent() {
        const STATS: FieldSpec = FieldSpec::new("call_stats", &["call_stats", "statistics"]);
        const CALLS: FieldSpec = FieldSpec::new("inbound_calls", &["inbound_calls"]);

        let payload = json!({"statistics": {"inbound_calls": "many"}});
        let mut ex = Extractor::new(&payload, None);
        let mut child = ex.nested(&STATS).unwrap();
        assert_eq!(child.number(&CALLS), None);
        ex.absorb(child);
        assert_eq!(ex.into_errors().len(), 1);
    }
}
