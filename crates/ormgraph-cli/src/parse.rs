//! Parsing of filters, assignments and literal values.

use ormgraph_core::{FieldDef, ScalarType, Value};

use crate::error::{CliError, Result};

/// Comparison in a `--where` filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
}

/// A parsed `path<op>value` filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    /// Relations to walk from the root, followed by the compared field.
    pub path: Vec<String>,
    pub op: FilterOp,
    pub raw: String,
}

impl Filter {
    /// Field compared at the end of the path.
    pub fn field(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or_default()
    }

    /// Relations walked before the field.
    pub fn relations(&self) -> &[String] {
        &self.path[..self.path.len().saturating_sub(1)]
    }
}

/// Parse `owner.name=Ann`, `age>=18`, `title~A%`.
pub fn parse_filter(input: &str) -> Result<Filter> {
    let (at, first) = input
        .char_indices()
        .find(|(_, c)| matches!(c, '=' | '!' | '<' | '>' | '~'))
        .ok_or_else(|| CliError::argument(input, "expected an operator (= != < <= > >= ~)"))?;
    let rest = &input[at + first.len_utf8()..];
    let (op, raw) = match (first, rest.strip_prefix('=')) {
        ('!', Some(raw)) => (FilterOp::Ne, raw),
        ('<', Some(raw)) => (FilterOp::Le, raw),
        ('>', Some(raw)) => (FilterOp::Ge, raw),
        ('=', _) => (FilterOp::Eq, rest),
        ('<', None) => (FilterOp::Lt, rest),
        ('>', None) => (FilterOp::Gt, rest),
        ('~', _) => (FilterOp::Like, rest),
        _ => return Err(CliError::argument(input, "'!' must be followed by '='")),
    };

    let path: Vec<String> = input[..at].split('.').map(str::to_string).collect();
    if path.iter().any(String::is_empty) {
        return Err(CliError::argument(input, "empty field name"));
    }
    Ok(Filter {
        path,
        op,
        raw: raw.to_string(),
    })
}

/// Split `field=value`.
pub fn parse_assignment(input: &str) -> Result<(&str, &str)> {
    match input.split_once('=') {
        Some((field, value)) if !field.is_empty() => Ok((field, value)),
        _ => Err(CliError::argument(input, "expected FIELD=VALUE")),
    }
}

/// Parse a literal for the field's value type (the key type for
/// references). `null` is accepted for every type.
pub fn parse_value(field: &FieldDef, raw: &str) -> Result<Value> {
    if raw == "null" {
        return Ok(Value::Null);
    }
    let Some(scalar) = field.value_type() else {
        return Err(CliError::argument(raw, format!("'{}' is a collection", field.name)));
    };
    parse_scalar(scalar, raw)
}

fn parse_scalar(scalar: ScalarType, raw: &str) -> Result<Value> {
    let invalid = |what: &str| CliError::argument(raw, format!("expected {what}"));
    let value = match scalar {
        ScalarType::Bool => Value::Bool(raw.parse().map_err(|_| invalid("true or false"))?),
        ScalarType::Int32 => Value::Int32(raw.parse().map_err(|_| invalid("a 32-bit integer"))?),
        ScalarType::Int64 => Value::Int64(raw.parse().map_err(|_| invalid("an integer"))?),
        ScalarType::Float64 => Value::Float64(raw.parse().map_err(|_| invalid("a number"))?),
        ScalarType::String => Value::String(raw.to_string()),
        ScalarType::Bytes => {
            let digits = raw.strip_prefix("0x").unwrap_or(raw);
            Value::Bytes(hex::decode(digits).map_err(|_| invalid("hex digits"))?)
        }
        ScalarType::Timestamp => {
            Value::Timestamp(raw.parse().map_err(|_| invalid("microseconds since the epoch"))?)
        }
        ScalarType::Uuid => {
            let uuid = uuid::Uuid::parse_str(raw).map_err(|_| invalid("a UUID"))?;
            Value::Uuid(*uuid.as_bytes())
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_filter_operators() {
        let cases = [
            ("name=Ann", FilterOp::Eq, "Ann"),
            ("name!=Ann", FilterOp::Ne, "Ann"),
            ("age<3", FilterOp::Lt, "3"),
            ("age<=3", FilterOp::Le, "3"),
            ("age>3", FilterOp::Gt, "3"),
            ("age>=3", FilterOp::Ge, "3"),
            ("title~A%", FilterOp::Like, "A%"),
            ("note=a=b", FilterOp::Eq, "a=b"),
        ];
        for (input, op, raw) in cases {
            let filter = parse_filter(input).unwrap();
            assert_eq!((filter.op, filter.raw.as_str()), (op, raw), "{input}");
        }

        let nested = parse_filter("owner.name=Ann").unwrap();
        assert_eq!(nested.relations(), ["owner".to_string()]);
        assert_eq!(nested.field(), "name");

        assert!(parse_filter("name").is_err());
        assert!(parse_filter("name!Ann").is_err());
        assert!(parse_filter(".name=x").is_err());
    }

    #[test]
    fn test_parse_value_by_type() {
        let int = FieldDef::value("n", ScalarType::Int64);
        assert_eq!(parse_value(&int, "42").unwrap(), Value::Int64(42));
        assert!(matches!(parse_value(&int, "null").unwrap(), Value::Null));
        assert!(parse_value(&int, "x").is_err());

        let bytes = FieldDef::value("b", ScalarType::Bytes);
        assert_eq!(parse_value(&bytes, "0xcafe").unwrap(), Value::Bytes(vec![0xca, 0xfe]));

        let id = FieldDef::value("u", ScalarType::Uuid);
        let parsed = parse_value(&id, "67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        assert_eq!(parsed.as_uuid().map(|u| u[0]), Some(0x67));

        assert_eq!(parse_assignment("name=Ann").unwrap(), ("name", "Ann"));
        assert!(parse_assignment("=Ann").is_err());
    }
}
