use std::collections::HashMap;

use crate::error::{KvError, Result};
use crate::types::{ExpireTime, HScanPage, ZMember, ZScanPage};

/// A decoded result of any command, as returned slot by slot from `exec`.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Strings(Vec<String>),
    OptStrings(Vec<Option<String>>),
    OptInts(Vec<Option<i64>>),
    Members(Vec<ZMember>),
    Map(HashMap<String, String>),
    HashPage(HScanPage),
    ZPage(ZScanPage),
    Expiry(ExpireTime),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Unit => "Unit",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::Float(_) => "Float",
            Value::Str(_) => "Str",
            Value::Strings(_) => "Strings",
            Value::OptStrings(_) => "OptStrings",
            Value::OptInts(_) => "OptInts",
            Value::Members(_) => "Members",
            Value::Map(_) => "Map",
            Value::HashPage(_) => "HashPage",
            Value::ZPage(_) => "ZPage",
            Value::Expiry(_) => "Expiry",
        }
    }
}

macro_rules! value_conversions {
    ($($variant:ident($ty:ty)),* $(,)?) => {$(
        impl From<$ty> for Value {
            fn from(v: $ty) -> Self {
                Value::$variant(v)
            }
        }

        impl TryFrom<Value> for $ty {
            type Error = KvError;

            fn try_from(value: Value) -> Result<Self> {
                match value {
                    Value::$variant(v) => Ok(v),
                    other => Err(KvError::UnexpectedReply {
                        expected: stringify!($variant),
                        got: other.kind().to_string(),
                    }),
                }
            }
        }
    )*};
}

value_conversions! {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Strings(Vec<String>),
    OptStrings(Vec<Option<String>>),
    OptInts(Vec<Option<i64>>),
    Members(Vec<ZMember>),
    Map(HashMap<String, String>),
    HashPage(HScanPage),
    ZPage(ZScanPage),
    Expiry(ExpireTime),
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Unit
    }
}

impl TryFrom<Value> for () {
    type Error = KvError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Unit => Ok(()),
            other => Err(KvError::UnexpectedReply {
                expected: "Unit",
                got: other.kind().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(Value::from(3i64), Value::Int(3));
        assert_eq!(i64::try_from(Value::Int(3)).unwrap(), 3);
        assert_eq!(String::try_from(Value::Str("x".into())).unwrap(), "x");
        assert!(<()>::try_from(Value::Unit).is_ok());
    }

    #[test]
    fn test_mismatch_is_unexpected_reply() {
        let err = f64::try_from(Value::Str("1.5".into())).unwrap_err();
        assert!(matches!(
            err,
            KvError::UnexpectedReply {
                expected: "Float",
                ..
            }
        ));
    }
}
