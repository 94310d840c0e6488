//! Type converters between application and storage representations.

use ormgraph_proto::Value;

use crate::error::{Error, Result};

/// Bidirectional conversion for fields whose stored representation differs
/// from their logical type.
pub trait TypeConverter: Send + Sync + std::fmt::Debug {
    /// Registry name referenced by [`FieldDef::converter`](super::FieldDef).
    fn name(&self) -> &str;

    /// Application value to column value.
    fn to_storage(&self, value: &Value) -> Result<Value>;

    /// Column value to application value.
    fn from_storage(&self, value: &Value) -> Result<Value>;
}

/// Stores timestamps as decimal strings of epoch microseconds, for backends
/// whose timestamp columns lose precision.
#[derive(Debug, Default, Clone, Copy)]
pub struct TimestampAsString;

impl TimestampAsString {
    /// Registry name.
    pub const NAME: &'static str = "timestamp_as_string";

    fn fail(&self, message: String) -> Error {
        Error::Conversion {
            converter: Self::NAME.to_string(),
            message,
        }
    }
}

impl TypeConverter for TimestampAsString {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn to_storage(&self, value: &Value) -> Result<Value> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::Timestamp(micros) => Ok(Value::String(micros.to_string())),
            other => Err(self.fail(format!("expected timestamp, got {other}"))),
        }
    }

    fn from_storage(&self, value: &Value) -> Result<Value> {
        match value {
            Value::Null => Ok(Value::Null),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(Value::Timestamp)
                .map_err(|e| self.fail(format!("'{s}' is not a timestamp: {e}"))),
            other => Err(self.fail(format!("expected string, got {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_as_string() {
        let conv = TimestampAsString;
        let stored = conv.to_storage(&Value::Timestamp(1_704_067_200_000_000)).unwrap();
        assert_eq!(stored, Value::from("1704067200000000"));
        assert_eq!(
            conv.from_storage(&stored).unwrap(),
            Value::Timestamp(1_704_067_200_000_000)
        );
        assert_eq!(conv.to_storage(&Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_rejects_garbage() {
        let err = TimestampAsString.from_storage(&Value::from("yesterday")).unwrap_err();
        assert!(matches!(err, Error::Conversion { .. }));
        assert!(TimestampAsString.to_storage(&Value::Int32(1)).is_err());
    }
}
