//! Execution contexts and the values they carry.
//!
//! An [`ExecutionContext`] is the parameter set a template is instantiated
//! under, most commonly a single `frame`. Contexts are persistent values: the
//! variable map is shared behind an [`Arc`] and every modification goes
//! through copy-on-write, so a [`Task`](crate::Task) holding a context can
//! never observe a later change made through another handle.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Name of the variable holding the current frame.
pub const FRAME: &str = "frame";

/// Name of the variable holding the frame rate.
pub const FRAMES_PER_SECOND: &str = "framesPerSecond";

/// A typed context value.
///
/// Equality and hashing are by value. Numbers compare across representations
/// whenever they denote the same quantity, so `Int(3)` equals `Float(3.0)`,
/// `-0.0` equals `0`, and all NaNs are equal to each other. This keeps
/// integer and floating point frames in the same identity class.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
}

/// Canonical form used for equality and hashing.
#[derive(PartialEq, Eq, Hash)]
enum Canonical<'a> {
    Bool(bool),
    Int(i64),
    Float(u64),
    Nan,
    Str(&'a str),
    Array(Vec<Canonical<'a>>),
}

impl Value {
    fn canonical(&self) -> Canonical<'_> {
        match self {
            Value::Bool(b) => Canonical::Bool(*b),
            Value::Int(i) => Canonical::Int(*i),
            Value::Float(f) => canonical_float(*f),
            Value::Str(s) => Canonical::Str(s),
            Value::Array(items) => Canonical::Array(items.iter().map(Value::canonical).collect()),
        }
    }

    /// Numeric view of the value, if it is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

fn canonical_float<'a>(f: f64) -> Canonical<'a> {
    // i64::MAX as f64 rounds up to 2^63, which is already out of range.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;

    if f.is_nan() {
        Canonical::Nan
    } else if f.fract() == 0.0 && (-LIMIT..LIMIT).contains(&f) {
        Canonical::Int(f as i64)
    } else {
        Canonical::Float(f.to_bits())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

macro_rules! impl_from_int {
    ($($T:ty),*) => {
        $(
            impl From<$T> for Value {
                fn from(value: $T) -> Self {
                    Value::Int(value.into())
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Float(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::Array(value.into_iter().map(Into::into).collect())
    }
}

/// Mapping from variable name to [`Value`].
///
/// Cloning is cheap and yields an independent value: setting a variable on a
/// clone never affects the original.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionContext {
    vars: Arc<BTreeMap<String, Value>>,
}

impl ExecutionContext {
    /// A context at frame 1 running at 24 frames per second.
    pub fn new() -> Self {
        Self::empty().with(FRAME, 1).with(FRAMES_PER_SECOND, 24)
    }

    /// A context without any variables.
    pub fn empty() -> Self {
        Self {
            vars: Arc::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    /// Sets a variable, copying the underlying map if it is shared.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        Arc::make_mut(&mut self.vars).insert(name.into(), value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        Arc::make_mut(&mut self.vars).remove(name)
    }

    /// Builder flavour of [`set`](Self::set).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn frame(&self) -> Option<f64> {
        self.get(FRAME).and_then(Value::as_f64)
    }

    pub fn with_frame(self, frame: impl Into<Value>) -> Self {
        self.with(FRAME, frame)
    }

    pub fn frames_per_second(&self) -> Option<f64> {
        self.get(FRAMES_PER_SECOND).and_then(Value::as_f64)
    }

    /// Time in seconds, derived from the frame and the frame rate.
    pub fn time(&self) -> Option<f64> {
        match (self.frame(), self.frames_per_second()) {
            (Some(frame), Some(fps)) if fps != 0.0 => Some(frame / fps),
            _ => None,
        }
    }

    /// Whether both contexts agree on every variable in `names`. A variable
    /// missing from both contexts counts as agreeing.
    pub fn variable_equal_on<'a>(
        &self,
        other: &ExecutionContext,
        names: impl IntoIterator<Item = &'a str>,
    ) -> bool {
        names
            .into_iter()
            .all(|name| self.get(name) == other.get(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_map().entries(self.vars.iter()).finish()
    }
}

impl Display for ExecutionContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (i, (name, value)) in self.vars.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_int_and_float_frames_are_equal() {
        assert_eq!(Value::Int(3), Value::Float(3.0));
        assert_eq!(Value::Int(0), Value::Float(-0.0));
        assert_ne!(Value::Int(3), Value::Float(3.5));

        let set: HashSet<Value> = [Value::Int(3), Value::Float(3.0)].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_nan_equals_itself() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(-f64::NAN));
    }

    #[test]
    fn test_types_do_not_mix() {
        assert_ne!(Value::Str("1".into()), Value::Int(1));
        assert_ne!(Value::Bool(true), Value::Int(1));
        assert_eq!(Value::from("1").as_str(), Some("1"));
        assert_eq!(Value::Int(1).as_str(), None);
        assert_eq!(Value::Int(1).as_f64(), Some(1.0));
    }

    #[test]
    fn test_copy_on_write() {
        let original = ExecutionContext::new().with_frame(5);
        let mut copy = original.clone();
        copy.set(FRAME, 6);

        assert_eq!(original.frame(), Some(5.0));
        assert_eq!(copy.frame(), Some(6.0));
    }

    #[test]
    fn test_defaults_and_time() {
        let ctx = ExecutionContext::new().with_frame(48);
        assert_eq!(ctx.frames_per_second(), Some(24.0));
        assert_eq!(ctx.time(), Some(2.0));
        assert_eq!(ExecutionContext::empty().time(), None);
    }

    #[test]
    fn test_variable_equal_on() {
        let a = ExecutionContext::new().with_frame(1).with("shot", "a");
        let b = ExecutionContext::new().with_frame(1.0).with("shot", "b");

        assert!(a.variable_equal_on(&b, [FRAME]));
        assert!(!a.variable_equal_on(&b, [FRAME, "shot"]));
        assert!(a.variable_equal_on(&b, ["missing"]));
    }

    #[test]
    fn test_serde_roundtrip() {
        let ctx = ExecutionContext::empty()
            .with_frame(10)
            .with("scale", 0.5)
            .with("tags", vec!["a", "b"]);

        let json = serde_json::to_string(&ctx).unwrap();
        assert_eq!(json, r#"{"frame":10,"scale":0.5,"tags":["a","b"]}"#);

        let back: ExecutionContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctx);
    }

    #[test]
    fn test_display() {
        let ctx = ExecutionContext::empty().with_frame(2).with("name", "x");
        assert_eq!(ctx.to_string(), r#"{frame: 2, name: "x"}"#);
    }
}
