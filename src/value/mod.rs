use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};

/// Template data and VM operand. Hash members are kept in key order so
/// iteration and output are stable.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(from = "serde_json::Value")]
pub enum Value {
    #[default]
    Undefined,
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Hash(BTreeMap<String, Value>),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ArithError {
    #[error("integer overflow")]
    Overflow,
    #[error("division by zero")]
    DivisionByZero,
    #[error("cannot apply '{op}' to {kind}")]
    Type { op: &'static str, kind: &'static str },
}

/// A value coerced for arithmetic or numeric comparison.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(f) => f,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            Number::Int(i) => i,
            Number::Float(f) => f as i64,
        }
    }
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Hash(_) => "hash",
        }
    }

    pub fn is_defined(&self) -> bool {
        !matches!(self, Value::Undefined)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined => false,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Hash(map) => !map.is_empty(),
        }
    }

    /// Number of members for collections, characters for strings.
    pub fn len(&self) -> usize {
        match self {
            Value::String(s) => s.chars().count(),
            Value::Array(items) => items.len(),
            Value::Hash(map) => map.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Hash(map) => map.get(key),
            _ => None,
        }
    }

    pub fn to_number(&self) -> Number {
        match self {
            Value::Undefined => Number::Int(0),
            Value::Int(i) => Number::Int(*i),
            Value::Float(f) => Number::Float(*f),
            Value::String(s) => parse_number(s),
            Value::Array(items) => Number::Int(items.len() as i64),
            Value::Hash(map) => Number::Int(map.len() as i64),
        }
    }

    pub fn compare_numeric(&self, other: &Value) -> Ordering {
        match (self.to_number(), other.to_number()) {
            (Number::Int(a), Number::Int(b)) => a.cmp(&b),
            (a, b) => a.as_f64().partial_cmp(&b.as_f64()).unwrap_or(Ordering::Less),
        }
    }

    pub fn compare_text(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a.as_bytes().cmp(b.as_bytes()),
            _ => self.to_string().as_bytes().cmp(other.to_string().as_bytes()),
        }
    }

    pub fn add(&self, rhs: &Value) -> Result<Value, ArithError> {
        if matches!(self, Value::String(_)) || matches!(rhs, Value::String(_)) {
            return Ok(Value::String(format!("{self}{rhs}")));
        }
        match (numeric_operand(self, "+")?, numeric_operand(rhs, "+")?) {
            (Number::Int(a), Number::Int(b)) => a.checked_add(b).map(Value::Int).ok_or(ArithError::Overflow),
            (a, b) => Ok(Value::Float(a.as_f64() + b.as_f64())),
        }
    }

    pub fn sub(&self, rhs: &Value) -> Result<Value, ArithError> {
        match (numeric_operand(self, "-")?, numeric_operand(rhs, "-")?) {
            (Number::Int(a), Number::Int(b)) => a.checked_sub(b).map(Value::Int).ok_or(ArithError::Overflow),
            (a, b) => Ok(Value::Float(a.as_f64() - b.as_f64())),
        }
    }

    pub fn mul(&self, rhs: &Value) -> Result<Value, ArithError> {
        match (numeric_operand(self, "*")?, numeric_operand(rhs, "*")?) {
            (Number::Int(a), Number::Int(b)) => a.checked_mul(b).map(Value::Int).ok_or(ArithError::Overflow),
            (a, b) => Ok(Value::Float(a.as_f64() * b.as_f64())),
        }
    }

    /// `/` always produces a float.
    pub fn div(&self, rhs: &Value) -> Result<Value, ArithError> {
        let a = numeric_operand(self, "/")?.as_f64();
        let b = numeric_operand(rhs, "/")?.as_f64();
        if b == 0.0 {
            return Err(ArithError::DivisionByZero);
        }
        Ok(Value::Float(a / b))
    }

    pub fn int_div(&self, rhs: &Value) -> Result<Value, ArithError> {
        let a = numeric_operand(self, "div")?.as_i64();
        let b = numeric_operand(rhs, "div")?.as_i64();
        if b == 0 {
            return Err(ArithError::DivisionByZero);
        }
        a.checked_div(b).map(Value::Int).ok_or(ArithError::Overflow)
    }

    pub fn int_mod(&self, rhs: &Value) -> Result<Value, ArithError> {
        let a = numeric_operand(self, "mod")?.as_i64();
        let b = numeric_operand(rhs, "mod")?.as_i64();
        if b == 0 {
            return Err(ArithError::DivisionByZero);
        }
        a.checked_rem(b).map(Value::Int).ok_or(ArithError::Overflow)
    }

    pub fn neg(&self) -> Result<Value, ArithError> {
        match numeric_operand(self, "-")? {
            Number::Int(i) => i.checked_neg().map(Value::Int).ok_or(ArithError::Overflow),
            Number::Float(f) => Ok(Value::Float(-f)),
        }
    }

    pub fn not(&self) -> Value {
        Value::Int(i64::from(!self.is_truthy()))
    }
}

fn numeric_operand(v: &Value, op: &'static str) -> Result<Number, ArithError> {
    match v {
        Value::Array(_) | Value::Hash(_) => Err(ArithError::Type { op, kind: v.kind() }),
        _ => Ok(v.to_number()),
    }
}

fn parse_number(s: &str) -> Number {
    let s = s.trim();
    if let Ok(i) = s.parse::<i64>() {
        return Number::Int(i);
    }
    match s.parse::<f64>() {
        Ok(f) => Number::Float(f),
        Err(_) => Number::Int(0),
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Undefined => Ok(()),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(n) => write!(f, "{}", n),
            Value::String(s) => f.write_str(s),
            Value::Array(_) | Value::Hash(_) => {
                let json = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
                f.write_str(&json)
            }
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Undefined => serializer.serialize_unit(),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Hash(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

// ---- Conversions ----

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Undefined,
            serde_json::Value::Bool(b) => Value::Int(i64::from(b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Hash(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Int(i64::from(b))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Hash(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json(s: &str) -> Value {
        serde_json::from_str(s).unwrap()
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::Int(0).is_truthy());
        assert!(Value::Int(-3).is_truthy());
        assert!(!Value::Float(0.0).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(Value::from("0").is_truthy());
        assert!(!json("[]").is_truthy());
        assert!(json("{\"a\":1}").is_truthy());
    }

    #[test]
    fn display_scalars() {
        assert_eq!(Value::Undefined.to_string(), "");
        assert_eq!(Value::Int(42).to_string(), "42");
        assert_eq!(Value::Float(2.5).to_string(), "2.5");
        assert_eq!(Value::Float(3.0).to_string(), "3");
        assert_eq!(Value::from("héllo").to_string(), "héllo");
    }

    #[test]
    fn display_collections_as_json() {
        assert_eq!(json("[1,\"a\",null]").to_string(), "[1,\"a\",null]");
        assert_eq!(json("{\"b\":2,\"a\":1}").to_string(), "{\"a\":1,\"b\":2}");
    }

    #[test]
    fn from_json_maps_scalars() {
        assert_eq!(json("null"), Value::Undefined);
        assert_eq!(json("true"), Value::Int(1));
        assert_eq!(json("false"), Value::Int(0));
        assert_eq!(json("7"), Value::Int(7));
        assert_eq!(json("1.5"), Value::Float(1.5));
        assert_eq!(json("18446744073709551615"), Value::Float(18446744073709551615.0));
    }

    #[test]
    fn numeric_coercion() {
        assert_eq!(Value::from(" 12 ").to_number(), Number::Int(12));
        assert_eq!(Value::from("1.25").to_number(), Number::Float(1.25));
        assert_eq!(Value::from("abc").to_number(), Number::Int(0));
        assert_eq!(Value::Undefined.to_number(), Number::Int(0));
        assert_eq!(json("[1,2,3]").to_number(), Number::Int(3));
    }

    #[test]
    fn add_concatenates_strings() {
        assert_eq!(Value::from("a").add(&Value::Int(1)).unwrap(), Value::from("a1"));
        assert_eq!(Value::Int(1).add(&Value::from("b")).unwrap(), Value::from("1b"));
    }

    #[test]
    fn integer_arithmetic() {
        assert_eq!(Value::Int(2).add(&Value::Int(3)).unwrap(), Value::Int(5));
        assert_eq!(Value::Int(2).sub(&Value::Int(3)).unwrap(), Value::Int(-1));
        assert_eq!(Value::Int(4).mul(&Value::Float(0.5)).unwrap(), Value::Float(2.0));
        assert_eq!(Value::Int(7).int_div(&Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!(Value::Int(7).int_mod(&Value::Int(4)).unwrap(), Value::Int(3));
        assert_eq!(Value::Int(7).div(&Value::Int(2)).unwrap(), Value::Float(3.5));
    }

    #[test]
    fn overflow_and_division_errors() {
        assert_eq!(Value::Int(i64::MAX).add(&Value::Int(1)), Err(ArithError::Overflow));
        assert_eq!(Value::Int(i64::MIN).neg(), Err(ArithError::Overflow));
        assert_eq!(Value::Int(1).div(&Value::Int(0)), Err(ArithError::DivisionByZero));
        assert_eq!(Value::Int(1).int_mod(&Value::Undefined), Err(ArithError::DivisionByZero));
    }

    #[test]
    fn collections_reject_arithmetic() {
        let err = json("[1]").sub(&Value::Int(1)).unwrap_err();
        assert_eq!(err, ArithError::Type { op: "-", kind: "array" });
    }

    #[test]
    fn comparisons() {
        assert_eq!(Value::from("10").compare_numeric(&Value::Int(9)), Ordering::Greater);
        assert_eq!(Value::from("10").compare_text(&Value::from("9")), Ordering::Less);
        assert_eq!(Value::Int(2).compare_numeric(&Value::Float(2.0)), Ordering::Equal);
        assert_eq!(Value::Undefined.compare_text(&Value::from("")), Ordering::Equal);
    }

    #[test]
    fn not_is_int() {
        assert_eq!(Value::Undefined.not(), Value::Int(1));
        assert_eq!(Value::from("x").not(), Value::Int(0));
    }

    #[test]
    fn len_counts_chars() {
        assert_eq!(Value::from("héllo").len(), 5);
        assert_eq!(Value::Int(5).len(), 0);
    }
}
