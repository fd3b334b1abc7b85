//! Records and Django-style lookups (`poll_id`, `votes__gte`, `id__in`).

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ShardError, ShardResult};

/// A row of a partitioned entity, keyed by column name.
pub type Record = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupOp {
    Exact,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
}

impl LookupOp {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "exact" => LookupOp::Exact,
            "ne" => LookupOp::Ne,
            "gt" => LookupOp::Gt,
            "gte" => LookupOp::Gte,
            "lt" => LookupOp::Lt,
            "lte" => LookupOp::Lte,
            "in" => LookupOp::In,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lookup {
    pub field: String,
    pub op: LookupOp,
    pub value: Value,
    /// True when written as a bare `field = value`. Only these carry routing keys.
    pub plain: bool,
}

impl Lookup {
    fn matches(&self, record: &Record) -> bool {
        let Some(have) = record.get(&self.field) else { return false };
        match self.op {
            LookupOp::Exact => values_equal(have, &self.value),
            LookupOp::Ne => !values_equal(have, &self.value),
            LookupOp::Gt => compare(have, &self.value) == Some(Ordering::Greater),
            LookupOp::Gte => matches!(compare(have, &self.value), Some(Ordering::Greater | Ordering::Equal)),
            LookupOp::Lt => compare(have, &self.value) == Some(Ordering::Less),
            LookupOp::Lte => matches!(compare(have, &self.value), Some(Ordering::Less | Ordering::Equal)),
            LookupOp::In => match &self.value {
                Value::Array(options) => options.iter().any(|o| values_equal(have, o)),
                _ => false,
            },
        }
    }
}

/// Conjunction of lookups.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    lookups: Vec<Lookup>,
}

impl Filter {
    pub fn new() -> Self { Self::default() }

    /// `field = value`.
    pub fn eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.lookups.push(Lookup { field: field.to_string(), op: LookupOp::Exact, value: value.into(), plain: true });
        self
    }

    pub fn op(mut self, field: &str, op: LookupOp, value: impl Into<Value>) -> Self {
        self.lookups.push(Lookup { field: field.to_string(), op, value: value.into(), plain: false });
        self
    }

    /// Add `key = value` where `key` may carry a `__op` suffix.
    pub fn push(&mut self, key: &str, value: Value) -> ShardResult<()> {
        let lookup = match key.split_once("__") {
            None => Lookup { field: key.to_string(), op: LookupOp::Exact, value, plain: true },
            Some((field, op)) => {
                let op = LookupOp::parse(op).ok_or_else(|| ShardError::InvalidLookup(key.to_string()))?;
                if field.is_empty() {
                    return Err(ShardError::InvalidLookup(key.to_string()));
                }
                if op == LookupOp::In && !value.is_array() {
                    return Err(ShardError::InvalidLookup(format!("{} expects a list", key)));
                }
                Lookup { field: field.to_string(), op, value, plain: false }
            }
        };
        self.lookups.push(lookup);
        Ok(())
    }

    pub fn from_pairs<I, K>(pairs: I) -> ShardResult<Self>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        let mut f = Self::new();
        for (k, v) in pairs {
            f.push(k.as_ref(), v)?;
        }
        Ok(f)
    }

    pub fn lookups(&self) -> &[Lookup] { &self.lookups }
    pub fn is_empty(&self) -> bool { self.lookups.is_empty() }

    /// Value of the bare equality lookup on `field`, if any.
    pub fn exact(&self, field: &str) -> Option<&Value> {
        self.lookups.iter().find(|l| l.plain && l.field == field).map(|l| &l.value)
    }

    /// Bare equality lookups as a record; suffixed lookups are dropped.
    pub fn equality_fields(&self) -> Record {
        self.lookups.iter().filter(|l| l.plain).map(|l| (l.field.clone(), l.value.clone())).collect()
    }

    pub fn matches(&self, record: &Record) -> bool { self.lookups.iter().all(|l| l.matches(record)) }

    /// Copy with every non-null value on `fields` coerced by [`as_key_int`],
    /// `in` lists element by element.
    pub fn with_key_ints(&self, fields: &[String]) -> ShardResult<Filter> {
        let mut out = self.clone();
        for l in out.lookups.iter_mut().filter(|l| fields.contains(&l.field)) {
            l.value = match &l.value {
                Value::Array(items) => {
                    Value::Array(items.iter().map(|v| key_int_value(&l.field, v)).collect::<ShardResult<_>>()?)
                }
                v => key_int_value(&l.field, v)?,
            };
        }
        Ok(out)
    }
}

fn key_int_value(field: &str, v: &Value) -> ShardResult<Value> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    as_key_int(field, v).map(Value::from)
}

/// Coerce the non-null values of `fields` in `record` by [`as_key_int`].
pub fn key_ints_in_place(record: &mut Record, fields: &[String]) -> ShardResult<()> {
    for field in fields {
        if let Some(v) = record.get_mut(field.as_str()) {
            *v = key_int_value(field, v)?;
        }
    }
    Ok(())
}

/// Anything routing key fields can be read from.
pub trait FieldSource {
    fn field_value(&self, name: &str) -> Option<Value>;
}

impl FieldSource for Record {
    fn field_value(&self, name: &str) -> Option<Value> { self.get(name).cloned() }
}

impl FieldSource for Filter {
    fn field_value(&self, name: &str) -> Option<Value> { self.exact(name).cloned() }
}

impl FieldSource for BTreeMap<String, i64> {
    fn field_value(&self, name: &str) -> Option<Value> { self.get(name).map(|v| Value::from(*v)) }
}

impl FieldSource for HashMap<String, i64> {
    fn field_value(&self, name: &str) -> Option<Value> { self.get(name).map(|v| Value::from(*v)) }
}

impl FieldSource for [(&str, i64)] {
    fn field_value(&self, name: &str) -> Option<Value> {
        self.iter().find(|(k, _)| *k == name).map(|(_, v)| Value::from(*v))
    }
}

/// Coerce a key value the way an integer cast would: ints, integral numeric strings, bools.
pub fn as_key_int(field: &str, v: &Value) -> ShardResult<i64> {
    let bad = || ShardError::InvalidRoutingKey { field: field.to_string(), value: v.to_string() };
    match v {
        Value::Number(n) => n.as_i64().ok_or_else(bad),
        Value::String(s) => s.trim().parse::<i64>().map_err(|_| bad()),
        Value::Bool(b) => Ok(i64::from(*b)),
        _ => Err(bad()),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record { v.as_object().cloned().unwrap() }

    #[test]
    fn parses_suffixed_lookups() {
        let f = Filter::from_pairs([
            ("poll_id", json!(3)),
            ("votes__gte", json!(2)),
            ("id__in", json!([1, 2, 9])),
        ])
        .unwrap();
        assert_eq!(f.lookups().len(), 3);
        assert_eq!(f.exact("poll_id"), Some(&json!(3)));
        assert_eq!(f.exact("votes"), None);
        assert_eq!(f.equality_fields(), rec(json!({"poll_id": 3})));

        assert!(f.matches(&rec(json!({"poll_id": 3, "votes": 2, "id": 9}))));
        assert!(!f.matches(&rec(json!({"poll_id": 3, "votes": 1, "id": 9}))));
        assert!(!f.matches(&rec(json!({"poll_id": 3, "votes": 5, "id": 4}))));
    }

    #[test]
    fn rejects_unknown_ops() {
        assert!(matches!(Filter::from_pairs([("a__like", json!(1))]), Err(ShardError::InvalidLookup(_))));
        assert!(matches!(Filter::from_pairs([("a__in", json!(1))]), Err(ShardError::InvalidLookup(_))));
    }

    #[test]
    fn key_coercion() {
        assert_eq!(as_key_int("k", &json!(7)).unwrap(), 7);
        assert_eq!(as_key_int("k", &json!(" 12 ")).unwrap(), 12);
        assert_eq!(as_key_int("k", &json!(true)).unwrap(), 1);
        assert!(as_key_int("k", &json!(1.5)).is_err());
        assert!(as_key_int("k", &json!("abc")).is_err());
        assert!(as_key_int("k", &Value::Null).is_err());
    }

    #[test]
    fn key_fields_become_integers() {
        let keys = vec!["poll_id".to_string()];
        let f = Filter::from_pairs([("poll_id", json!("3")), ("choice_text", json!("7")), ("poll_id__in", json!(["1", 2]))])
            .unwrap()
            .with_key_ints(&keys)
            .unwrap();
        assert_eq!(f.exact("poll_id"), Some(&json!(3)));
        assert_eq!(f.exact("choice_text"), Some(&json!("7")));
        assert_eq!(f.lookups()[2].value, json!([1, 2]));
        assert!(Filter::new().eq("poll_id", "x").with_key_ints(&keys).is_err());

        let mut r = rec(json!({"poll_id": " 4 ", "id": null}));
        key_ints_in_place(&mut r, &keys).unwrap();
        assert_eq!(r, rec(json!({"poll_id": 4, "id": null})));
    }

    #[test]
    fn missing_field_never_matches() {
        let f = Filter::new().op("votes", LookupOp::Ne, 1);
        assert!(!f.matches(&rec(json!({"poll_id": 1}))));
    }
}
