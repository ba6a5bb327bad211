//! Argument validation
//!
//! Checks raw tool arguments against a [`ToolSpec`] before any backend work
//! happens: required parameters must be present, values must have the
//! declared type, defaults fill the gaps and `limit`-like values are clamped.

use super::registry::{ParamSpec, ParamType, ToolSpec};
use crate::config::Limits;
use crate::error::{Error, Result};
use serde_json::{Map, Value};

/// Validated arguments of one invocation
///
/// Every value has already been checked against its declared type, so the
/// accessors only fail when a handler asks for a parameter its spec does not
/// declare as required or defaulted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    values: Map<String, Value>,
}

impl Args {
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    fn require(&self, name: &str) -> Result<&Value> {
        self.values
            .get(name)
            .ok_or_else(|| Error::validation(name, "missing required parameter"))
    }

    pub fn str(&self, name: &str) -> Result<&str> {
        self.require(name)?
            .as_str()
            .ok_or_else(|| expected(name, ParamType::String))
    }

    pub fn opt_str(&self, name: &str) -> Option<&str> {
        self.values.get(name).and_then(Value::as_str)
    }

    pub fn i64(&self, name: &str) -> Result<i64> {
        self.require(name)?
            .as_i64()
            .ok_or_else(|| expected(name, ParamType::Integer))
    }

    pub fn opt_i64(&self, name: &str) -> Option<i64> {
        self.values.get(name).and_then(Value::as_i64)
    }

    /// Limit values are clamped during validation
    pub fn usize(&self, name: &str) -> Result<usize> {
        let value = self.i64(name)?;
        usize::try_from(value).map_err(|_| Error::validation(name, "must not be negative"))
    }

    pub fn f64(&self, name: &str) -> Result<f64> {
        self.require(name)?
            .as_f64()
            .ok_or_else(|| expected(name, ParamType::Number))
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        self.require(name)?
            .as_bool()
            .ok_or_else(|| expected(name, ParamType::Boolean))
    }

    pub fn vector(&self, name: &str) -> Result<Vec<f32>> {
        to_vector(self.require(name)?).ok_or_else(|| expected(name, ParamType::Vector))
    }

    pub fn vectors(&self, name: &str) -> Result<Vec<Vec<f32>>> {
        self.require(name)?
            .as_array()
            .and_then(|rows| rows.iter().map(to_vector).collect())
            .ok_or_else(|| expected(name, ParamType::VectorList))
    }

    pub fn numbers(&self, name: &str) -> Option<Vec<f64>> {
        self.values
            .get(name)?
            .as_array()?
            .iter()
            .map(Value::as_f64)
            .collect()
    }

    pub fn strings(&self, name: &str) -> Option<Vec<String>> {
        self.values
            .get(name)?
            .as_array()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    pub fn mapping(&self, name: &str) -> Option<&Map<String, Value>> {
        self.values.get(name).and_then(Value::as_object)
    }
}

fn to_vector(value: &Value) -> Option<Vec<f32>> {
    value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect()
}

fn expected(name: &str, param_type: ParamType) -> Error {
    Error::validation(name, format!("expected {}", param_type.name()))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

/// Validate raw arguments against a tool spec
///
/// Arguments the tool does not declare are dropped. A `null` argument is
/// treated as absent.
pub fn validate(spec: &ToolSpec, mut raw: Map<String, Value>, limits: &Limits) -> Result<Args> {
    let mut values = Map::new();

    for param in &spec.params {
        let supplied = take(&mut raw, param);
        let value = match (supplied, &param.default) {
            (Some(value), _) => check(param, value, limits)?,
            (None, _) if param.required => {
                return Err(Error::validation(param.name, "missing required parameter"));
            }
            (None, Some(default)) => check(param, default.clone(), limits)?,
            (None, None) => continue,
        };
        values.insert(param.name.to_string(), value);
    }

    if !raw.is_empty() {
        let ignored: Vec<&String> = raw.keys().collect();
        tracing::debug!("Ignoring undeclared arguments for {}: {:?}", spec.name, ignored);
    }

    Ok(Args { values })
}

fn take(raw: &mut Map<String, Value>, param: &ParamSpec) -> Option<Value> {
    std::iter::once(param.name)
        .chain(param.aliases.iter().copied())
        .filter_map(|key| raw.remove(key))
        .find(|value| !value.is_null())
}

fn check(param: &ParamSpec, value: Value, limits: &Limits) -> Result<Value> {
    let mismatch = |value: &Value| {
        Error::validation(
            param.name,
            format!(
                "expected {}, got {}",
                param.param_type.name(),
                json_type(value)
            ),
        )
    };

    match param.param_type {
        ParamType::String => match value {
            Value::String(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        ParamType::Integer => integer(&value).map(Value::from).ok_or_else(|| mismatch(&value)),
        ParamType::Limit => integer(&value)
            .map(|n| Value::from(limits.clamp_limit(n)))
            .ok_or_else(|| mismatch(&value)),
        ParamType::Number => match value {
            Value::Number(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        ParamType::Boolean => match value {
            Value::Bool(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        ParamType::Vector => {
            if is_number_list(&value) {
                Ok(value)
            } else {
                Err(mismatch(&value))
            }
        }
        ParamType::VectorList => {
            let ok = value
                .as_array()
                .map(|rows| rows.iter().all(is_number_list))
                .unwrap_or(false);
            if ok {
                Ok(value)
            } else {
                Err(mismatch(&value))
            }
        }
        ParamType::StringList => {
            let ok = value
                .as_array()
                .map(|items| items.iter().all(Value::is_string))
                .unwrap_or(false);
            if ok {
                Ok(value)
            } else {
                Err(mismatch(&value))
            }
        }
        ParamType::Mapping => match value {
            Value::Object(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
        ParamType::Data => match value {
            Value::Object(_) | Value::Array(_) => Ok(value),
            other => Err(mismatch(&other)),
        },
    }
}

/// Integers, and floats with no fractional part
///
/// Out-of-range values saturate to the `i64` bounds.
fn integer(value: &Value) -> Option<i64> {
    let Value::Number(n) = value else {
        return None;
    };
    if let Some(i) = n.as_i64() {
        return Some(i);
    }
    if n.as_u64().is_some() {
        return Some(i64::MAX);
    }
    n.as_f64()
        .filter(|f| f.is_finite() && f.fract() == 0.0)
        .map(|f| f as i64)
}

fn is_number_list(value: &Value) -> bool {
    value
        .as_array()
        .map(|items| items.iter().all(|v| v.as_f64().is_some()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> ToolSpec {
        ToolSpec::new(
            "vector_search",
            "Search",
            vec![
                ParamSpec::required("collection_name", ParamType::String, "Collection")
                    .aliases(&["collection"]),
                ParamSpec::required("vector", ParamType::Vector, "Query vector"),
                ParamSpec::optional("limit", ParamType::Limit, "Max results").default(json!(5)),
                ParamSpec::optional("metric_type", ParamType::String, "Metric")
                    .default(json!("COSINE"))
                    .aliases(&["metric"]),
                ParamSpec::optional("output_fields", ParamType::StringList, "Fields"),
                ParamSpec::optional("filter_expr", ParamType::String, "Filter"),
            ],
        )
    }

    fn raw(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn limits() -> Limits {
        Limits {
            max_limit: 100,
            batch_size: 10,
        }
    }

    #[test]
    fn test_defaults_are_applied() {
        let args = validate(
            &spec(),
            raw(json!({"collection_name": "docs", "vector": [0.1, 0.2]})),
            &limits(),
        )
        .unwrap();

        assert_eq!(args.str("collection_name").unwrap(), "docs");
        assert_eq!(args.usize("limit").unwrap(), 5);
        assert_eq!(args.str("metric_type").unwrap(), "COSINE");
        assert!(args.opt_str("filter_expr").is_none());
        assert!(args.strings("output_fields").is_none());
    }

    #[test]
    fn test_missing_required_parameter() {
        let err = validate(&spec(), raw(json!({"collection_name": "docs"})), &limits()).unwrap_err();
        match err {
            Error::Validation { param, message } => {
                assert_eq!(param, "vector");
                assert_eq!(message, "missing required parameter");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_null_counts_as_missing() {
        let err = validate(
            &spec(),
            raw(json!({"collection_name": "docs", "vector": null})),
            &limits(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("'vector'"));
    }

    #[test]
    fn test_wrong_type_names_expected_type() {
        let err = validate(
            &spec(),
            raw(json!({"collection_name": "docs", "vector": "0.1,0.2"})),
            &limits(),
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation error for 'vector': expected list of numbers, got string"
        );

        let err = validate(
            &spec(),
            raw(json!({"collection_name": "docs", "vector": [1], "limit": 2.5})),
            &limits(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("'limit'"));
    }

    #[test]
    fn test_limit_is_clamped() {
        let base = json!({"collection_name": "docs", "vector": [1.0]});
        for (requested, expected) in [
            (json!(0), 1),
            (json!(-3), 1),
            (json!(1000), 100),
            (json!(7.0), 7),
            (json!(1e20), 100),
            (json!(-1e20), 1),
            (json!(u64::MAX), 100),
        ] {
            let mut args = raw(base.clone());
            args.insert("limit".to_string(), requested);
            let args = validate(&spec(), args, &limits()).unwrap();
            assert_eq!(args.usize("limit").unwrap(), expected);
        }
    }

    #[test]
    fn test_aliases_and_unknown_arguments() {
        let args = validate(
            &spec(),
            raw(json!({
                "collection": "docs",
                "vector": [1, 2],
                "metric": "L2",
                "shiny": true
            })),
            &limits(),
        )
        .unwrap();

        assert_eq!(args.str("collection_name").unwrap(), "docs");
        assert_eq!(args.str("metric_type").unwrap(), "L2");
        assert!(!args.contains("shiny"));
        assert_eq!(args.vector("vector").unwrap(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_string_list_rejects_mixed_items() {
        let err = validate(
            &spec(),
            raw(json!({"collection_name": "docs", "vector": [1], "output_fields": ["a", 3]})),
            &limits(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("list of strings"));
    }
}
