use serde::Deserialize;

/// Semantic column type, the projection target for record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
pub enum TypeCode {
    Bool,
    Int64,
    Float64,
    String,
    DateTime,
    Object,
}

impl TypeCode {
    /// Parse a `system.columns` type string. Returns `None` for types the
    /// pipeline cannot project into (the caller skips such columns).
    pub fn from_clickhouse(typ: &str) -> Option<ColumnType> {
        let mut inner = typ.trim();
        let mut nullable = false;
        loop {
            if let Some(rest) = strip_wrapper(inner, "Nullable") {
                nullable = true;
                inner = rest;
            } else if let Some(rest) = strip_wrapper(inner, "LowCardinality") {
                inner = rest;
            } else {
                break;
            }
        }
        let code = match inner {
            "Bool" => TypeCode::Bool,
            "Int8" | "Int16" | "Int32" | "Int64" | "UInt8" | "UInt16" | "UInt32" | "UInt64" => {
                TypeCode::Int64
            }
            "Float32" | "Float64" => TypeCode::Float64,
            "String" | "UUID" | "IPv4" | "IPv6" => TypeCode::String,
            "Date" | "Date32" | "DateTime" => TypeCode::DateTime,
            "JSON" => TypeCode::Object,
            other => {
                if other.starts_with("FixedString(") || other.starts_with("Enum") {
                    TypeCode::String
                } else if other.starts_with("Decimal") {
                    TypeCode::Float64
                } else if other.starts_with("DateTime64(") || other.starts_with("DateTime(") {
                    TypeCode::DateTime
                } else if other.starts_with("Object(") {
                    TypeCode::Object
                } else {
                    return None;
                }
            }
        };
        Some(ColumnType { code, nullable })
    }
}

/// Column type plus nullability (the `Nullable(...)` wrapper).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnType {
    pub code: TypeCode,
    pub nullable: bool,
}

impl ColumnType {
    pub fn plain(code: TypeCode) -> Self {
        Self {
            code,
            nullable: false,
        }
    }
}

/// One target column with its source-field path and role flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnWithType {
    pub name: String,
    pub typ: ColumnType,
    /// Field path in the record; differs from `name` only for the
    /// path-based parser where dots are escaped.
    pub source_name: String,
    /// Column whose value selects the tenant database.
    pub is_db_key: bool,
}

impl ColumnWithType {
    pub fn new(name: impl Into<String>, typ: ColumnType, source_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            typ,
            source_name: source_name.into(),
            is_db_key: false,
        }
    }

    pub fn not_nullable(&self) -> bool {
        !self.typ.nullable
    }
}

fn strip_wrapper<'a>(typ: &'a str, wrapper: &str) -> Option<&'a str> {
    let body = typ.strip_prefix(wrapper)?.strip_prefix('(')?;
    body.strip_suffix(')')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_scalar_types() {
        let t = TypeCode::from_clickhouse("Int64").unwrap();
        assert_eq!(t.code, TypeCode::Int64);
        assert!(!t.nullable);

        let t = TypeCode::from_clickhouse("Nullable(Float64)").unwrap();
        assert_eq!(t.code, TypeCode::Float64);
        assert!(t.nullable);

        let t = TypeCode::from_clickhouse("LowCardinality(Nullable(String))").unwrap();
        assert_eq!(t.code, TypeCode::String);
        assert!(t.nullable);
    }

    #[test]
    fn parses_datetime_variants() {
        for typ in ["Date", "DateTime", "DateTime64(3)", "DateTime64(3, 'UTC')"] {
            let t = TypeCode::from_clickhouse(typ).unwrap();
            assert_eq!(t.code, TypeCode::DateTime, "{typ}");
        }
    }

    #[test]
    fn parses_object_and_unknown() {
        assert_eq!(
            TypeCode::from_clickhouse("Object('json')").unwrap().code,
            TypeCode::Object
        );
        assert!(TypeCode::from_clickhouse("Array(Int64)").is_none());
        assert!(TypeCode::from_clickhouse("Map(String, String)").is_none());
    }
}
