//! Decoding SQLite values into JSON rows

use base64::Engine;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteRow, SqliteValueRef};
use sqlx::{Column, Decode, Row as SqlxRow, Sqlite, TypeInfo, ValueRef};

use crate::{Error, Result, Row};

/// Convert a single SQLite value to its JSON representation.
///
/// BLOBs encode as base64 strings; integers keep full i64 precision.
pub(crate) fn to_json(value: SqliteValueRef<'_>) -> Result<JsonValue> {
   if value.is_null() {
      return Ok(JsonValue::Null);
   }

   let type_name = value.type_info().name().to_string();
   let decoded = match type_name.as_str() {
      "TEXT" | "DATETIME" | "DATE" | "TIME" => JsonValue::String(
         <String as Decode<Sqlite>>::decode(value).map_err(decode_err)?,
      ),
      "INTEGER" | "NUMERIC" | "BOOLEAN" => JsonValue::Number(
         <i64 as Decode<Sqlite>>::decode(value).map_err(decode_err)?.into(),
      ),
      "REAL" => {
         let float = <f64 as Decode<Sqlite>>::decode(value).map_err(decode_err)?;
         serde_json::Number::from_f64(float)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)
      }
      "BLOB" => {
         let bytes = <Vec<u8> as Decode<Sqlite>>::decode(value).map_err(decode_err)?;
         JsonValue::String(base64::engine::general_purpose::STANDARD.encode(bytes))
      }
      other => return Err(Error::UnsupportedDatatype(other.to_string())),
   };

   Ok(decoded)
}

fn decode_err(e: sqlx::error::BoxDynError) -> Error {
   Error::Pool(sqlx_sqlite_task_pool::Error::Sqlx(sqlx::Error::Decode(e)))
}

/// Decode SQLite rows to ordered JSON maps, preserving column order.
pub(crate) fn decode_rows(rows: Vec<SqliteRow>) -> Result<Vec<Row>> {
   let mut values = Vec::with_capacity(rows.len());
   for row in rows {
      let mut value = IndexMap::default();
      for (i, column) in row.columns().iter().enumerate() {
         let v = row.try_get_raw(i).map_err(sqlx_sqlite_task_pool::Error::Sqlx)?;
         let v = to_json(v)?;
         value.insert(column.name().to_string(), v);
      }
      values.push(value);
   }
   Ok(values)
}
