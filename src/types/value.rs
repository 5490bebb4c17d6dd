//! Tagged attribute values and their index ordering.
use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use super::{AssocError, ItemId, Result};

/// A single attribute value: either a scalar or a reference to another item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    /// Boolean scalar.
    Bool(bool),
    /// Signed 64-bit integer scalar.
    Int(i64),
    /// 64-bit floating point scalar. NaN and infinities are rejected when linked.
    Float(f64),
    /// UTF-8 string scalar, ordered lexicographically.
    String(String),
    /// Nanoseconds since the Unix epoch, UTC.
    DateTime(i64),
    /// Reference to another item.
    Ref(ItemId),
}

/// Value domain used to keep an attribute index totally ordered.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    /// `Value::Bool`.
    Bool,
    /// `Value::Int` and `Value::Float`, which compare with each other.
    Number,
    /// `Value::String`.
    String,
    /// `Value::DateTime`.
    DateTime,
    /// `Value::Ref`.
    Reference,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::DateTime => "datetime",
            ValueKind::Reference => "reference",
        };
        f.write_str(name)
    }
}

impl Value {
    /// Parses a `YYYY-MM-DD` calendar date into a midnight UTC [`Value::DateTime`].
    pub fn date(text: &str) -> Result<Self> {
        let format = format_description!("[year]-[month]-[day]");
        let date = Date::parse(text, &format)
            .map_err(|err| AssocError::InvalidOwned(format!("invalid date '{text}': {err}")))?;
        Self::try_from_datetime(date.midnight().assume_utc())
    }

    /// Converts an [`OffsetDateTime`] into a [`Value::DateTime`].
    pub fn try_from_datetime(at: OffsetDateTime) -> Result<Self> {
        let nanos = i64::try_from(at.unix_timestamp_nanos())
            .map_err(|_| AssocError::Invalid("datetime outside the representable range"))?;
        Ok(Value::DateTime(nanos))
    }

    /// Returns the ordering domain of this value.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) | Value::Float(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::Ref(_) => ValueKind::Reference,
        }
    }

    /// Returns the referenced item, if this is a reference value.
    pub fn as_ref_id(&self) -> Option<ItemId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }

    /// Returns the string payload, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Compares two values of the same kind; `None` when the kinds differ.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        if self.kind() != other.kind() {
            return None;
        }
        Some(cmp_same_kind(self, other))
    }

    /// Floats must be finite: NaN has no place in the index order and the
    /// commit log's JSON encoding has no representation for infinities.
    pub(crate) fn validate(&self) -> Result<()> {
        if let Value::Float(f) = self {
            if !f.is_finite() {
                return Err(AssocError::InvalidOwned(format!(
                    "float {f} cannot be stored or compared; only finite floats are allowed"
                )));
            }
        }
        Ok(())
    }
}

fn cmp_same_kind(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Int(a), Value::Int(b)) => a.cmp(b),
        (Value::Float(a), Value::Float(b)) => a.partial_cmp(b).unwrap_or_else(|| a.total_cmp(b)),
        (Value::Int(a), Value::Float(b)) => cmp_int_float(*a, *b),
        (Value::Float(a), Value::Int(b)) => cmp_int_float(*b, *a).reverse(),
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
        (Value::Ref(a), Value::Ref(b)) => a.cmp(b),
        _ => left.kind().cmp(&right.kind()),
    }
}

/// Exact comparison between an integer and a float, without rounding the integer.
fn cmp_int_float(int: i64, float: f64) -> Ordering {
    const TWO_POW_63: f64 = 9_223_372_036_854_775_808.0;
    if float.is_nan() {
        return Ordering::Less;
    }
    if float >= TWO_POW_63 {
        return Ordering::Less;
    }
    if float < -TWO_POW_63 {
        return Ordering::Greater;
    }
    let whole = float.trunc();
    match int.cmp(&(whole as i64)) {
        Ordering::Equal => {
            let frac = float - whole;
            if frac > 0.0 {
                Ordering::Less
            } else if frac < 0.0 {
                Ordering::Greater
            } else {
                Ordering::Equal
            }
        }
        other => other,
    }
}

/// Totally ordered wrapper used as the key of attribute indexes.
///
/// Values of different kinds order by kind first; the index layer never mixes
/// kinds under one attribute, so that branch only keeps `Ord` lawful.
#[derive(Clone, Debug)]
pub struct IndexKey(pub Value);

impl IndexKey {
    /// Borrows the wrapped value.
    pub fn value(&self) -> &Value {
        &self.0
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        cmp_same_kind(&self.0, &other.0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::DateTime(ns) => write!(f, "datetime({ns})"),
            Value::Ref(id) => write!(f, "{id}"),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<ItemId> for Value {
    fn from(value: ItemId) -> Self {
        Value::Ref(value)
    }
}
