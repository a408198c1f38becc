//! Typed access to a handler's weakly-typed parameter map.
//!
//! Handlers validate their own parameters; these helpers turn a missing or
//! mistyped value into the matching [`HandlerError`] signature.

use super::classify::HandlerError;
use super::protocol::Parameters;
use serde_json::Value;

/// Extension methods for reading handler parameters.
pub trait ParamsExt {
    /// Required string parameter.
    fn require_str(&self, key: &str) -> Result<&str, HandlerError>;
    /// Optional string parameter.
    fn opt_str(&self, key: &str) -> Result<Option<&str>, HandlerError>;
    /// Required integer parameter.
    fn require_i64(&self, key: &str) -> Result<i64, HandlerError>;
    /// Optional integer parameter.
    fn opt_i64(&self, key: &str) -> Result<Option<i64>, HandlerError>;
    /// Optional numeric parameter (integer or float).
    fn opt_f64(&self, key: &str) -> Result<Option<f64>, HandlerError>;
    /// Optional boolean parameter.
    fn opt_bool(&self, key: &str) -> Result<Option<bool>, HandlerError>;
    /// Optional nested map parameter.
    fn opt_object(&self, key: &str) -> Result<Option<&Parameters>, HandlerError>;
}

fn wrong_type(key: &str, expected: &str, got: &Value) -> HandlerError {
    HandlerError::InvalidArgument(format!(
        "Parameter '{}' must be {}, got {}",
        key,
        expected,
        json_kind(got)
    ))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Look up a key, treating an explicit null as absent.
fn present<'a>(params: &'a Parameters, key: &str) -> Option<&'a Value> {
    params.get(key).filter(|v| !v.is_null())
}

impl ParamsExt for Parameters {
    fn require_str(&self, key: &str) -> Result<&str, HandlerError> {
        match self.opt_str(key)? {
            Some(s) if !s.is_empty() => Ok(s),
            Some(_) => Err(HandlerError::InvalidArgument(format!(
                "Parameter '{}' must not be empty",
                key
            ))),
            None => Err(HandlerError::ArgumentMissing(key.to_string())),
        }
    }

    fn opt_str(&self, key: &str) -> Result<Option<&str>, HandlerError> {
        match present(self, key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(wrong_type(key, "a string", other)),
        }
    }

    fn require_i64(&self, key: &str) -> Result<i64, HandlerError> {
        self.opt_i64(key)?
            .ok_or_else(|| HandlerError::ArgumentMissing(key.to_string()))
    }

    fn opt_i64(&self, key: &str) -> Result<Option<i64>, HandlerError> {
        match present(self, key) {
            None => Ok(None),
            Some(v @ Value::Number(n)) => n
                .as_i64()
                .map(Some)
                .ok_or_else(|| wrong_type(key, "an integer", v)),
            Some(other) => Err(wrong_type(key, "an integer", other)),
        }
    }

    fn opt_f64(&self, key: &str) -> Result<Option<f64>, HandlerError> {
        match present(self, key) {
            None => Ok(None),
            Some(v @ Value::Number(n)) => n
                .as_f64()
                .map(Some)
                .ok_or_else(|| wrong_type(key, "a number", v)),
            Some(other) => Err(wrong_type(key, "a number", other)),
        }
    }

    fn opt_bool(&self, key: &str) -> Result<Option<bool>, HandlerError> {
        match present(self, key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(wrong_type(key, "a boolean", other)),
        }
    }

    fn opt_object(&self, key: &str) -> Result<Option<&Parameters>, HandlerError> {
        match present(self, key) {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(other) => Err(wrong_type(key, "an object", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => map,
            _ => panic!("test params must be an object"),
        }
    }

    #[test]
    fn test_require_str() {
        let p = params(json!({"elementId": "cb1", "empty": "", "num": 3}));
        assert_eq!(p.require_str("elementId").unwrap(), "cb1");
        assert_eq!(
            p.require_str("missing").unwrap_err(),
            HandlerError::ArgumentMissing("missing".into())
        );
        assert!(matches!(
            p.require_str("empty").unwrap_err(),
            HandlerError::InvalidArgument(_)
        ));
        let err = p.require_str("num").unwrap_err();
        assert!(err.to_string().contains("must be a string, got a number"));
    }

    #[test]
    fn test_null_treated_as_absent() {
        let p = params(json!({"x": null}));
        assert_eq!(p.opt_str("x").unwrap(), None);
        assert!(matches!(
            p.require_i64("x").unwrap_err(),
            HandlerError::ArgumentMissing(_)
        ));
    }

    #[test]
    fn test_numbers() {
        let p = params(json!({"i": 42, "f": 1.5, "s": "7"}));
        assert_eq!(p.require_i64("i").unwrap(), 42);
        assert_eq!(p.opt_f64("i").unwrap(), Some(42.0));
        assert_eq!(p.opt_f64("f").unwrap(), Some(1.5));
        assert!(p.opt_i64("f").is_err());
        assert!(p.opt_i64("s").is_err());
    }

    #[test]
    fn test_bool_and_object() {
        let p = params(json!({"b": true, "o": {"row": 1}, "arr": [1]}));
        assert_eq!(p.opt_bool("b").unwrap(), Some(true));
        assert_eq!(p.opt_object("o").unwrap().unwrap()["row"], 1);
        assert!(p.opt_object("arr").is_err());
        assert_eq!(p.opt_bool("nope").unwrap(), None);
    }
}
