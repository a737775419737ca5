//! Shared row mapping helpers
//!
//! SQLite stores every integer as i64 and JSON as TEXT; these helpers do the
//! conversions in one place so the repositories stay readable.

use serde::de::DeserializeOwned;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use taskgate_errors::{QueueError, QueueResult};

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn get_u64(row: &SqliteRow, field_name: &str) -> QueueResult<u64> {
        let value: i64 = row.try_get(field_name)?;
        Ok(value.max(0) as u64)
    }

    pub fn get_u32(row: &SqliteRow, field_name: &str) -> QueueResult<u32> {
        let value: i64 = row.try_get(field_name)?;
        u32::try_from(value.max(0))
            .map_err(|_| QueueError::Serialization(format!("字段 {field_name} 超出范围: {value}")))
    }

    pub fn get_opt_u64(row: &SqliteRow, field_name: &str) -> QueueResult<Option<u64>> {
        let value: Option<i64> = row.try_get(field_name)?;
        Ok(value.map(|v| v.max(0) as u64))
    }

    pub fn get_bool(row: &SqliteRow, field_name: &str) -> QueueResult<bool> {
        let value: i64 = row.try_get(field_name)?;
        Ok(value != 0)
    }

    /// Parse a JSON TEXT column into a `serde_json::Value`
    pub fn parse_json_value(row: &SqliteRow, field_name: &str) -> QueueResult<serde_json::Value> {
        let json_str: Option<String> = row.try_get(field_name)?;
        match json_str {
            Some(s) => serde_json::from_str(&s)
                .map_err(|e| QueueError::Serialization(format!("解析字段 {field_name} 失败: {e}"))),
            None => Ok(serde_json::Value::Null),
        }
    }

    /// Parse a JSON TEXT column into a typed value, empty column means default
    pub fn parse_json_or_default<T: DeserializeOwned + Default>(
        row: &SqliteRow,
        field_name: &str,
    ) -> QueueResult<T> {
        let json_str: Option<String> = row.try_get(field_name)?;
        match json_str {
            Some(s) if !s.is_empty() => serde_json::from_str(&s)
                .map_err(|e| QueueError::Serialization(format!("解析字段 {field_name} 失败: {e}"))),
            _ => Ok(T::default()),
        }
    }

    pub fn to_i64(value: u64) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }

    pub fn opt_to_i64(value: Option<u64>) -> Option<i64> {
        value.map(Self::to_i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_i64_saturates() {
        assert_eq!(MappingHelpers::to_i64(42), 42);
        assert_eq!(MappingHelpers::to_i64(u64::MAX), i64::MAX);
        assert_eq!(MappingHelpers::opt_to_i64(None), None);
    }
}
