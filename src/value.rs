//! Dynamic values that make up a function's state.
//!
//! State is a [`StateMap`]: an ordered map from [`Key`] to [`Value`].
//! Values nest arbitrarily through [`Value::List`] and [`Value::Map`].
//! Ownership rules out cyclic values, so every `Value` is a finite tree.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The top-level state of a function, and the payload of [`Value::Map`].
pub type StateMap = BTreeMap<Key, Value>;

/// A map key. Restricted to totally ordered scalars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Key {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Key {
    /// Returns the string if this is a string key.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Key::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Bool(b) => write!(f, "{b}"),
            Key::Int(i) => write!(f, "{i}"),
            Key::Str(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

impl From<&String> for Key {
    fn from(s: &String) -> Self {
        Key::Str(s.clone())
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Key::Int(i)
    }
}

impl From<i32> for Key {
    fn from(i: i32) -> Self {
        Key::Int(i64::from(i))
    }
}

impl From<u32> for Key {
    fn from(i: u32) -> Self {
        Key::Int(i64::from(i))
    }
}

impl From<bool> for Key {
    fn from(b: bool) -> Self {
        Key::Bool(b)
    }
}

/// A state value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(StateMap),
}

impl Value {
    /// An empty map value.
    pub fn map() -> Self {
        Value::Map(StateMap::new())
    }

    /// An empty list value.
    pub fn list() -> Self {
        Value::List(Vec::new())
    }

    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Integers widen to floats.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut Vec<Value>> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&StateMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_map_mut(&mut self) -> Option<&mut StateMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Look up `key` if this value is a map.
    pub fn get(&self, key: impl Into<Key>) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(&key.into()))
    }

    /// Mutable lookup of `key` if this value is a map.
    pub fn get_mut(&mut self, key: impl Into<Key>) -> Option<&mut Value> {
        self.as_map_mut().and_then(|m| m.get_mut(&key.into()))
    }

    /// Add `delta` to an integer value, treating `Null` as zero.
    ///
    /// Returns the new value, or `None` if this is neither `Int` nor `Null`
    /// or the addition overflows.
    pub fn increment(&mut self, delta: i64) -> Option<i64> {
        let current = match self {
            Value::Null => 0,
            Value::Int(i) => *i,
            _ => return None,
        };
        let next = current.checked_add(delta)?;
        *self = Value::Int(next);
        Some(next)
    }

    /// Equality that compares floats by bit pattern, so `NaN` equals itself
    /// and `0.0` differs from `-0.0`, as their encodings do.
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
            }
            (Value::Map(a), Value::Map(b)) => same_map(a, b),
            _ => self == other,
        }
    }
}

/// [`Value::same_as`] over whole maps.
pub fn same_map(a: &StateMap, b: &StateMap) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|((ka, va), (kb, vb))| ka == kb && va.same_as(vb))
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<StateMap> for Value {
    fn from(m: StateMap) -> Self {
        Value::Map(m)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<Key> for Value {
    fn from(k: Key) -> Self {
        match k {
            Key::Bool(b) => Value::Bool(b),
            Key::Int(i) => Value::Int(i),
            Key::Str(s) => Value::Str(s),
        }
    }
}

/// Build a [`StateMap`] from key/value pairs.
///
/// ```
/// use stateful_fn::state_map;
///
/// let m = state_map! { "total" => 0, "name" => "worker" };
/// assert_eq!(m.len(), 2);
/// ```
#[macro_export]
macro_rules! state_map {
    () => { $crate::StateMap::new() };
    ($($k:expr => $v:expr),+ $(,)?) => {{
        let mut m = $crate::StateMap::new();
        $( m.insert($crate::Key::from($k), $crate::Value::from($v)); )+
        m
    }};
}
