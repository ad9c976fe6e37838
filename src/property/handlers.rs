//! Typed property values and their handlers.
//!
//! A handler knows how to validate a value against its constraints, how to
//! marshal it from and to the configuration file, and how to render it for
//! display. The built-in handlers cover int (min/max), float (min/max),
//! string (enum) and bool. Editor-widget hooks of the GUI services are not
//! part of this headless implementation.

use serde_json::Value;

use crate::error::{NexxTError, Result};

/// A typed property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl PropertyValue {
    /// Convert from a JSON value, failing for unsupported types.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(b) => Ok(PropertyValue::Bool(*b)),
            Value::Number(n) if n.is_i64() => Ok(PropertyValue::Int(n.as_i64().unwrap_or(0))),
            Value::Number(n) => Ok(PropertyValue::Float(n.as_f64().unwrap_or(0.0))),
            Value::String(s) => Ok(PropertyValue::Str(s.clone())),
            other => Err(NexxTError::PropertyUnknownType(other.to_string())),
        }
    }

    /// Convert to a JSON value.
    pub fn to_json(&self) -> Value {
        match self {
            PropertyValue::Bool(b) => Value::Bool(*b),
            PropertyValue::Int(i) => Value::from(*i),
            PropertyValue::Float(f) => Value::from(*f),
            PropertyValue::Str(s) => Value::String(s.clone()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            PropertyValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            PropertyValue::Float(f) => Some(*f),
            PropertyValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl std::fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::Str(s) => f.write_str(s),
        }
    }
}

/// Validation and marshaling rules of a property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyHandler {
    Int { min: Option<i64>, max: Option<i64> },
    Float { min: Option<f64>, max: Option<f64> },
    Str { enum_values: Option<Vec<String>> },
    Bool,
}

impl PropertyHandler {
    /// The default handler deduced from a value's type.
    pub fn default_for(value: &PropertyValue) -> Self {
        match value {
            PropertyValue::Bool(_) => PropertyHandler::Bool,
            PropertyValue::Int(_) => PropertyHandler::Int {
                min: None,
                max: None,
            },
            PropertyValue::Float(_) => PropertyHandler::Float {
                min: None,
                max: None,
            },
            PropertyValue::Str(_) => PropertyHandler::Str { enum_values: None },
        }
    }

    fn type_matches(&self, value: &PropertyValue) -> bool {
        matches!(
            (self, value),
            (PropertyHandler::Int { .. }, PropertyValue::Int(_))
                | (PropertyHandler::Float { .. }, PropertyValue::Float(_))
                | (PropertyHandler::Float { .. }, PropertyValue::Int(_))
                | (PropertyHandler::Str { .. }, PropertyValue::Str(_))
                | (PropertyHandler::Bool, PropertyValue::Bool(_))
        )
    }

    /// Clamp/coerce a value to the handler's constraints.
    pub fn validate(&self, value: PropertyValue) -> Result<PropertyValue> {
        if !self.type_matches(&value) {
            return Err(NexxTError::PropertyParsing(format!(
                "value {} is not compatible with the property type",
                value
            )));
        }
        Ok(match self {
            PropertyHandler::Int { min, max } => {
                let mut v = value.as_int().unwrap_or(0);
                if let Some(min) = min {
                    if v < *min {
                        tracing::warn!("Adapted option value {} to minimum value {}.", v, min);
                        v = *min;
                    }
                }
                if let Some(max) = max {
                    if v > *max {
                        tracing::warn!("Adapted option value {} to maximum value {}.", v, max);
                        v = *max;
                    }
                }
                PropertyValue::Int(v)
            }
            PropertyHandler::Float { min, max } => {
                let mut v = value.as_float().unwrap_or(0.0);
                if let Some(min) = min {
                    if v < *min {
                        tracing::warn!("Adapted option value {} to minimum value {}.", v, min);
                        v = *min;
                    }
                }
                if let Some(max) = max {
                    if v > *max {
                        tracing::warn!("Adapted option value {} to maximum value {}.", v, max);
                        v = *max;
                    }
                }
                PropertyValue::Float(v)
            }
            PropertyHandler::Str { enum_values } => {
                let s = value.as_str().unwrap_or("").to_string();
                match enum_values {
                    Some(allowed) if !allowed.iter().any(|a| a == &s) => {
                        tracing::warn!(
                            "Enum validation failed. Using first value in allowed list."
                        );
                        PropertyValue::Str(allowed[0].clone())
                    }
                    _ => PropertyValue::Str(s),
                }
            }
            PropertyHandler::Bool => value,
        })
    }

    /// Unmarshal a config value and validate it.
    pub fn from_config(&self, value: &Value) -> Result<PropertyValue> {
        self.validate(PropertyValue::from_json(value)?)
    }

    /// Marshal a value for persistence.
    pub fn to_config(&self, value: &PropertyValue) -> Value {
        value.to_json()
    }

    /// Render a value for display.
    pub fn to_view_value(&self, value: &PropertyValue) -> String {
        value.to_string()
    }

    /// Parse a value from its string form and validate it.
    pub fn parse(&self, input: &str) -> Result<PropertyValue> {
        let value = match self {
            PropertyHandler::Int { .. } => PropertyValue::Int(input.parse().map_err(|_| {
                NexxTError::PropertyParsing(format!("Cannot convert '{}' to int.", input))
            })?),
            PropertyHandler::Float { .. } => PropertyValue::Float(input.parse().map_err(|_| {
                NexxTError::PropertyParsing(format!("Cannot convert '{}' to double.", input))
            })?),
            PropertyHandler::Str { .. } => PropertyValue::Str(input.to_string()),
            PropertyHandler::Bool => PropertyValue::Bool(input.parse().map_err(|_| {
                NexxTError::PropertyParsing(format!("Cannot convert '{}' to bool.", input))
            })?),
        };
        self.validate(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_handler_clamps() {
        let h = PropertyHandler::Int {
            min: Some(0),
            max: Some(10),
        };
        assert_eq!(
            h.validate(PropertyValue::Int(-5)).unwrap(),
            PropertyValue::Int(0)
        );
        assert_eq!(
            h.validate(PropertyValue::Int(42)).unwrap(),
            PropertyValue::Int(10)
        );
        assert_eq!(
            h.validate(PropertyValue::Int(5)).unwrap(),
            PropertyValue::Int(5)
        );
    }

    #[test]
    fn test_string_enum_falls_back_to_first() {
        let h = PropertyHandler::Str {
            enum_values: Some(vec!["a".into(), "b".into()]),
        };
        assert_eq!(
            h.validate(PropertyValue::Str("b".into())).unwrap(),
            PropertyValue::Str("b".into())
        );
        assert_eq!(
            h.validate(PropertyValue::Str("z".into())).unwrap(),
            PropertyValue::Str("a".into())
        );
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let h = PropertyHandler::Int {
            min: None,
            max: None,
        };
        assert!(h.validate(PropertyValue::Str("3".into())).is_err());
    }

    #[test]
    fn test_parse_round_trip() {
        let h = PropertyHandler::Float {
            min: None,
            max: None,
        };
        let v = h.parse("0.25").unwrap();
        assert_eq!(v, PropertyValue::Float(0.25));
        assert_eq!(h.to_view_value(&v), "0.25");
        assert!(h.parse("abc").is_err());
    }

    #[test]
    fn test_json_round_trip() {
        for v in [
            PropertyValue::Bool(true),
            PropertyValue::Int(-3),
            PropertyValue::Float(1.5),
            PropertyValue::Str("x".into()),
        ] {
            assert_eq!(PropertyValue::from_json(&v.to_json()).unwrap(), v);
        }
        assert!(PropertyValue::from_json(&Value::Null).is_err());
    }

    #[test]
    fn test_float_accepts_int_config_values() {
        let h = PropertyHandler::Float {
            min: None,
            max: None,
        };
        let v = h.from_config(&Value::from(2)).unwrap();
        assert_eq!(v, PropertyValue::Float(2.0));
    }
}
