//! Column type metadata and table schemas.
use std::{fmt, str::FromStr};

use super::{error::StorageError, header::record::MAX_COLUMNS, record::is_number};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    String,
}

impl ColumnType {
    /// Byte width of the in-memory type, `None` for variable-length columns.
    pub fn size(&self) -> Option<usize> {
        match self {
            ColumnType::Int8 | ColumnType::UInt8 => Some(size_of::<u8>()),
            ColumnType::Int16 | ColumnType::UInt16 => Some(size_of::<u16>()),
            ColumnType::Int32 | ColumnType::UInt32 => Some(size_of::<u32>()),
            ColumnType::Int64 | ColumnType::UInt64 => Some(size_of::<u64>()),
            ColumnType::Float32 => Some(size_of::<f32>()),
            ColumnType::Float64 => Some(size_of::<f64>()),
            ColumnType::String => None,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.size().is_none()
    }

    /// Checks that `value` is the textual form of this type. Empty values are
    /// nulls and always valid.
    pub fn validate(&self, value: &[u8]) -> Result<(), String> {
        if value.is_empty() || self.is_variable() {
            return Ok(());
        }

        let text = std::str::from_utf8(value).map_err(|e| e.to_string())?;
        let parsed = match self {
            ColumnType::Int8 => text.parse::<i8>().map(drop).map_err(|e| e.to_string()),
            ColumnType::Int16 => text.parse::<i16>().map(drop).map_err(|e| e.to_string()),
            ColumnType::Int32 => text.parse::<i32>().map(drop).map_err(|e| e.to_string()),
            ColumnType::Int64 => text.parse::<i64>().map(drop).map_err(|e| e.to_string()),
            ColumnType::UInt8 => text.parse::<u8>().map(drop).map_err(|e| e.to_string()),
            ColumnType::UInt16 => text.parse::<u16>().map(drop).map_err(|e| e.to_string()),
            ColumnType::UInt32 => text.parse::<u32>().map(drop).map_err(|e| e.to_string()),
            ColumnType::UInt64 => text.parse::<u64>().map(drop).map_err(|e| e.to_string()),
            ColumnType::Float32 | ColumnType::Float64 if !is_number(value) => {
                Err("not a number".to_string())
            }
            ColumnType::Float32 => text.parse::<f32>().map(drop).map_err(|e| e.to_string()),
            ColumnType::Float64 => text.parse::<f64>().map(drop).map_err(|e| e.to_string()),
            ColumnType::String => Ok(()),
        };
        parsed.map_err(|reason| format!("'{text}' is not a valid {self}: {reason}"))
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::Int8 => "int8",
            ColumnType::Int16 => "int16",
            ColumnType::Int32 => "int32",
            ColumnType::Int64 => "int64",
            ColumnType::UInt8 => "uint8",
            ColumnType::UInt16 => "uint16",
            ColumnType::UInt32 => "uint32",
            ColumnType::UInt64 => "uint64",
            ColumnType::Float32 => "float32",
            ColumnType::Float64 => "float64",
            ColumnType::String => "string",
        };
        write!(f, "{name}")
    }
}

impl FromStr for ColumnType {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "int8" => ColumnType::Int8,
            "int16" => ColumnType::Int16,
            "int" | "int32" => ColumnType::Int32,
            "int64" => ColumnType::Int64,
            "uint8" => ColumnType::UInt8,
            "uint16" => ColumnType::UInt16,
            "uint" | "uint32" => ColumnType::UInt32,
            "uint64" => ColumnType::UInt64,
            "float32" => ColumnType::Float32,
            "float64" => ColumnType::Float64,
            "string" | "text" => ColumnType::String,
            other => {
                return Err(StorageError::parse(
                    "column type",
                    format!("unknown type '{other}'"),
                ));
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub kind: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, kind: ColumnType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Ordered list of columns. Position decides both the field's place in an
/// encoded record and its null-bitmap bit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<Column>,
}

impl Schema {
    pub fn new(columns: Vec<Column>) -> Result<Self, StorageError> {
        if columns.len() > MAX_COLUMNS {
            return Err(StorageError::InvalidValue {
                column: "schema".into(),
                reason: format!("at most {MAX_COLUMNS} columns are supported"),
            });
        }

        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(StorageError::InvalidValue {
                    column: column.name.clone(),
                    reason: "duplicate column name".into(),
                });
            }
        }

        Ok(Self { columns })
    }

    /// Parses `name:type,name:type,...`.
    pub fn parse(definition: &str) -> Result<Self, StorageError> {
        let mut columns = Vec::new();
        for part in definition.split(',').filter(|p| !p.trim().is_empty()) {
            let (name, kind) = part.split_once(':').ok_or_else(|| {
                StorageError::parse("schema", format!("expected name:type, found '{part}'"))
            })?;
            columns.push(Column::new(name.trim(), kind.parse()?));
        }
        Self::new(columns)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column(&self, name: &str) -> Option<(usize, &Column)> {
        self.columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
    }

    /// Index of the column among columns of the same storage class (fixed or
    /// variable) that precede it.
    pub fn ordinal(&self, index: usize) -> usize {
        let variable = self.columns[index].kind.is_variable();
        self.columns[..index]
            .iter()
            .filter(|c| c.kind.is_variable() == variable)
            .count()
    }

    pub fn fixed_count(&self) -> usize {
        self.columns.iter().filter(|c| !c.kind.is_variable()).count()
    }

    pub fn variable_count(&self) -> usize {
        self.columns.iter().filter(|c| c.kind.is_variable()).count()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", column.name, column.kind)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_sizes() {
        assert_eq!(ColumnType::Int8.size(), Some(1));
        assert_eq!(ColumnType::UInt32.size(), Some(4));
        assert_eq!(ColumnType::Float64.size(), Some(8));
        assert_eq!(ColumnType::String.size(), None);
    }

    #[test]
    fn validate_checks_declared_type() {
        assert!(ColumnType::Int8.validate(b"-12").is_ok());
        assert!(ColumnType::Int8.validate(b"300").is_err());
        assert!(ColumnType::UInt16.validate(b"-1").is_err());
        assert!(ColumnType::Float32.validate(b"1.5e3").is_ok());
        assert!(ColumnType::Float64.validate(b"-0.25").is_ok());
        assert!(ColumnType::Float64.validate(b"NaN").is_err());
        assert!(ColumnType::Float32.validate(b"inf").is_err());
        assert!(ColumnType::Int64.validate(b"").is_ok());
        assert!(ColumnType::String.validate(b"any:thing\n").is_ok());
    }

    #[test]
    fn parse_schema() {
        let schema = Schema::parse("id:int64, name:string,age:uint8").unwrap();
        assert_eq!(schema.len(), 3);
        assert_eq!(schema.position("name"), Some(1));
        assert_eq!(schema.ordinal(2), 1);
        assert_eq!(schema.ordinal(1), 0);
        assert_eq!(schema.fixed_count(), 2);
        assert_eq!(schema.variable_count(), 1);
        assert_eq!(schema.to_string(), "id:int64,name:string,age:uint8");
    }

    #[test]
    #[should_panic(expected = "duplicate column name")]
    fn duplicate_columns() {
        Schema::parse("id:int64,id:string").unwrap();
    }

    #[test]
    #[should_panic(expected = "unknown type")]
    fn unknown_type() {
        Schema::parse("id:decimal").unwrap();
    }
}
