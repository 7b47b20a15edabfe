//! Column definitions and table schemas

use super::{DataType, Value};
use serde::{Deserialize, Serialize};

/// Column position within a schema
pub type ColumnId = u16;

/// Column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column ID (its position in the schema)
    pub id: ColumnId,
    /// Column name
    pub name: String,
    /// Data type
    pub data_type: DataType,
    /// Whether the column can contain null values
    pub nullable: bool,
    /// Value used when a row is created without this column
    pub default_value: Option<Value>,
}

impl ColumnDef {
    /// Create a new column definition
    pub fn new(id: ColumnId, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            id,
            name: name.into(),
            data_type,
            nullable: true,
            default_value: None,
        }
    }

    /// Set nullable flag
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set default value
    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// Bytes needed to encode `value` in an undo record: a null flag plus the payload
    pub fn encoded_len(&self, value: &Value) -> usize {
        let payload = match (self.data_type.fixed_width(), value) {
            (_, Value::Null) => 0,
            (Some(width), _) => width,
            (None, Value::String(s)) => 4 + s.len(),
            (None, _) => 0,
        };
        1 + payload
    }
}

/// Ordered set of column definitions shared by every row of a tile group
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<ColumnDef>,
}

impl Schema {
    /// Build a schema; column ids are reassigned to match positions
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        let columns = columns
            .into_iter()
            .enumerate()
            .map(|(i, mut c)| {
                c.id = i as ColumnId;
                c
            })
            .collect();
        Self { columns }
    }

    /// Shorthand for tests and demos: `(name, type)` pairs
    pub fn from_pairs(pairs: &[(&str, DataType)]) -> Self {
        Self::new(
            pairs
                .iter()
                .enumerate()
                .map(|(i, (name, ty))| ColumnDef::new(i as ColumnId, *name, *ty))
                .collect(),
        )
    }

    pub fn column(&self, id: ColumnId) -> Option<&ColumnDef> {
        self.columns.get(id as usize)
    }

    pub fn column_by_name(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn columns(&self) -> &[ColumnDef] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// A row of defaults (or nulls)
    pub fn empty_row(&self) -> Vec<Value> {
        self.columns
            .iter()
            .map(|c| c.default_value.clone().unwrap_or(Value::Null))
            .collect()
    }

    /// Whether every value fits its column
    pub fn accepts_row(&self, row: &[Value]) -> bool {
        row.len() == self.columns.len()
            && self.columns.iter().zip(row).all(|(c, v)| {
                c.data_type.accepts(v) && (c.nullable || !v.is_null())
            })
    }
}
