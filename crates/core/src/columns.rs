//! Result tables: typed column definitions and per-type cell encoders.
//!
//! Cells are raw bytes; an empty cell means "no value". Fixed-width numbers are
//! big-endian, arrays and objects are JSON, strings are UTF-8.

use serde::{Deserialize, Serialize};

use crate::ResourceKey;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Boolean,
    Int64,
    Double,
    DateTime,
    StringArray,
    Json,
}

impl ColumnType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Int64 | ColumnType::Double | ColumnType::DateTime)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ColumnType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Lower is more important; fields above 10 are left out of the default projection.
    #[serde(default)]
    pub priority: i32,
}

pub fn col(name: &str, kind: ColumnType, priority: i32) -> ColumnDefinition {
    ColumnDefinition { name: name.to_string(), kind, description: String::new(), priority }
}

/// Typed value before encoding (or after decoding) a cell.
#[derive(Clone, Debug, PartialEq)]
pub enum CellValue {
    Null,
    String(String),
    Bool(bool),
    Int(i64),
    Double(f64),
    /// Milliseconds since the epoch.
    DateTime(i64),
    Strings(Vec<String>),
    Json(serde_json::Value),
}

impl CellValue {
    /// Map a JSON value onto the closest cell value.
    pub fn from_json(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => CellValue::Null,
            serde_json::Value::Bool(b) => CellValue::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => CellValue::Int(i),
                None => CellValue::Double(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => CellValue::String(s.clone()),
            serde_json::Value::Array(items) if items.iter().all(|x| x.is_string()) => {
                CellValue::Strings(items.iter().filter_map(|x| x.as_str().map(str::to_string)).collect())
            }
            other => CellValue::Json(other.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TableError {
    #[error("cannot encode {value} as {kind:?}")]
    Encode { kind: ColumnType, value: String },
    #[error("cannot decode {len} bytes as {kind:?}")]
    Decode { kind: ColumnType, len: usize },
    #[error("row {row} has {cells} cells but the table has {columns} columns")]
    Shape { row: usize, cells: usize, columns: usize },
}

fn encode_err(kind: ColumnType, v: &CellValue) -> TableError {
    TableError::Encode { kind, value: format!("{:?}", v) }
}

/// Encode one value for a column of type `kind`.
pub fn encode_cell(kind: ColumnType, v: &CellValue) -> Result<Vec<u8>, TableError> {
    if matches!(v, CellValue::Null) {
        return Ok(Vec::new());
    }
    match kind {
        ColumnType::String => match v {
            CellValue::String(s) => Ok(s.as_bytes().to_vec()),
            CellValue::Bool(b) => Ok(b.to_string().into_bytes()),
            CellValue::Int(i) | CellValue::DateTime(i) => Ok(i.to_string().into_bytes()),
            CellValue::Double(d) => Ok(d.to_string().into_bytes()),
            CellValue::Strings(items) => Ok(items.join(",").into_bytes()),
            CellValue::Json(j) => Ok(j.to_string().into_bytes()),
            CellValue::Null => Ok(Vec::new()),
        },
        ColumnType::Boolean => match v {
            CellValue::Bool(b) => Ok(vec![u8::from(*b)]),
            CellValue::String(s) => match s.as_str() {
                "true" => Ok(vec![1]),
                "false" => Ok(vec![0]),
                _ => Err(encode_err(kind, v)),
            },
            _ => Err(encode_err(kind, v)),
        },
        ColumnType::Int64 => {
            let i = match v {
                CellValue::Int(i) | CellValue::DateTime(i) => *i,
                CellValue::Double(d) if d.fract() == 0.0 => *d as i64,
                CellValue::String(s) => s.trim().parse::<i64>().map_err(|_| encode_err(kind, v))?,
                _ => return Err(encode_err(kind, v)),
            };
            Ok(i.to_be_bytes().to_vec())
        }
        ColumnType::Double => {
            let d = match v {
                CellValue::Double(d) => *d,
                CellValue::Int(i) => *i as f64,
                CellValue::String(s) => s.trim().parse::<f64>().map_err(|_| encode_err(kind, v))?,
                _ => return Err(encode_err(kind, v)),
            };
            Ok(d.to_bits().to_be_bytes().to_vec())
        }
        ColumnType::DateTime => {
            let ms = match v {
                CellValue::DateTime(ms) | CellValue::Int(ms) => *ms,
                CellValue::Double(d) => *d as i64,
                CellValue::String(s) => chrono::DateTime::parse_from_rfc3339(s)
                    .map(|dt| dt.timestamp_millis())
                    .map_err(|_| encode_err(kind, v))?,
                _ => return Err(encode_err(kind, v)),
            };
            Ok(ms.to_be_bytes().to_vec())
        }
        ColumnType::StringArray => {
            let items = match v {
                CellValue::Strings(items) => items.clone(),
                CellValue::String(s) => vec![s.clone()],
                _ => return Err(encode_err(kind, v)),
            };
            serde_json::to_vec(&items).map_err(|_| encode_err(kind, v))
        }
        ColumnType::Json => {
            let j = match v {
                CellValue::Json(j) => j.clone(),
                CellValue::String(s) => serde_json::Value::String(s.clone()),
                CellValue::Bool(b) => serde_json::Value::Bool(*b),
                CellValue::Int(i) | CellValue::DateTime(i) => serde_json::Value::from(*i),
                CellValue::Double(d) => serde_json::Value::from(*d),
                CellValue::Strings(items) => serde_json::Value::from(items.clone()),
                CellValue::Null => serde_json::Value::Null,
            };
            serde_json::to_vec(&j).map_err(|_| encode_err(kind, v))
        }
    }
}

fn fixed8(kind: ColumnType, raw: &[u8]) -> Result<[u8; 8], TableError> {
    raw.try_into().map_err(|_| TableError::Decode { kind, len: raw.len() })
}

pub fn decode_cell(kind: ColumnType, raw: &[u8]) -> Result<CellValue, TableError> {
    if raw.is_empty() {
        return Ok(CellValue::Null);
    }
    let bad = || TableError::Decode { kind, len: raw.len() };
    Ok(match kind {
        ColumnType::String => CellValue::String(String::from_utf8(raw.to_vec()).map_err(|_| bad())?),
        ColumnType::Boolean => match raw {
            [0] => CellValue::Bool(false),
            [1] => CellValue::Bool(true),
            _ => return Err(bad()),
        },
        ColumnType::Int64 => CellValue::Int(i64::from_be_bytes(fixed8(kind, raw)?)),
        ColumnType::Double => CellValue::Double(f64::from_bits(u64::from_be_bytes(fixed8(kind, raw)?))),
        ColumnType::DateTime => CellValue::DateTime(i64::from_be_bytes(fixed8(kind, raw)?)),
        ColumnType::StringArray => CellValue::Strings(serde_json::from_slice(raw).map_err(|_| bad())?),
        ColumnType::Json => CellValue::Json(serde_json::from_slice(raw).map_err(|_| bad())?),
    })
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub key: ResourceKey,
    pub cells: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceTable {
    pub columns: Vec<ColumnDefinition>,
    pub rows: Vec<TableRow>,
}

impl ResourceTable {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Decode every cell of one row; a shape mismatch fails the whole row.
    pub fn decode_row(&self, row: usize) -> Result<Vec<CellValue>, TableError> {
        let Some(r) = self.rows.get(row) else {
            return Err(TableError::Shape { row, cells: 0, columns: self.columns.len() });
        };
        if r.cells.len() != self.columns.len() {
            return Err(TableError::Shape { row, cells: r.cells.len(), columns: self.columns.len() });
        }
        self.columns.iter().zip(r.cells.iter()).map(|(c, raw)| decode_cell(c.kind, raw)).collect()
    }

    /// Convenience for callers reading one string column.
    pub fn string_column(&self, name: &str) -> Vec<String> {
        let Some(i) = self.column_index(name) else { return Vec::new() };
        self.rows
            .iter()
            .map(|r| r.cells.get(i).map(|c| String::from_utf8_lossy(c).to_string()).unwrap_or_default())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_cell_is_null() {
        assert!(encode_cell(ColumnType::Int64, &CellValue::Null).unwrap().is_empty());
        assert_eq!(decode_cell(ColumnType::Double, &[]).unwrap(), CellValue::Null);
    }

    #[test]
    fn typed_cells_decode_to_their_value() {
        let raw = encode_cell(ColumnType::Int64, &CellValue::String("42".into())).unwrap();
        assert_eq!(decode_cell(ColumnType::Int64, &raw).unwrap(), CellValue::Int(42));
        let raw = encode_cell(ColumnType::DateTime, &CellValue::String("2021-01-01T01:00:00Z".into())).unwrap();
        assert_eq!(decode_cell(ColumnType::DateTime, &raw).unwrap(), CellValue::DateTime(1609462800000));
        let raw = encode_cell(ColumnType::StringArray, &CellValue::Strings(vec!["aa".into(), "bb".into()])).unwrap();
        assert_eq!(raw, br#"["aa","bb"]"#.to_vec());
    }

    #[test]
    fn incompatible_values_fail() {
        assert!(encode_cell(ColumnType::Int64, &CellValue::String("x".into())).is_err());
        assert!(encode_cell(ColumnType::Boolean, &CellValue::Int(3)).is_err());
        assert!(decode_cell(ColumnType::Int64, &[1, 2, 3]).is_err());
    }

    #[test]
    fn row_shape_is_checked() {
        let table = ResourceTable {
            columns: vec![col("title", ColumnType::String, 0), col("rv", ColumnType::Int64, 0)],
            rows: vec![TableRow { key: ResourceKey::default(), cells: vec![b"a".to_vec()] }],
        };
        assert!(matches!(table.decode_row(0), Err(TableError::Shape { cells: 1, columns: 2, .. })));
    }
}
