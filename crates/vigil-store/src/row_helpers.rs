use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    get(row, idx, table, column)
}

/// Parse a JSON column into any deserializable type.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Render a list of status-like values as a quoted SQL `IN (...)` body.
/// Only used with compile-time enum strings, never caller input.
pub fn sql_in_list<T: AsRef<str>>(values: &[T]) -> String {
    values
        .iter()
        .map(|v| format!("'{}'", v.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::run::RunStatus;

    #[test]
    fn parse_enum_success() {
        let result: Result<RunStatus, _> = parse_enum("suspended", "runs", "status");
        assert_eq!(result.unwrap(), RunStatus::Suspended);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<RunStatus, _> = parse_enum("INVALID", "runs", "status");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "runs", column: "status", .. })
        ));
    }

    #[test]
    fn parse_json_success() {
        let value: serde_json::Value =
            parse_json(r#"{"key": "value"}"#, "journal_entries", "payload").unwrap();
        assert_eq!(value["key"], "value");
    }

    #[test]
    fn parse_json_failure() {
        let result: Result<serde_json::Value, _> =
            parse_json("not valid json", "journal_entries", "payload");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "journal_entries", column: "payload", .. })
        ));
    }

    #[test]
    fn in_list_quotes_values() {
        assert_eq!(sql_in_list(&["pending", "running"]), "'pending', 'running'");
    }
}
