//! Schema for the durable record store.

/// Bookkeeping for which object stores exist at which version.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS object_stores (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Table for one object store with an auto-incrementing key.
///
/// `name` must already be validated as a plain identifier.
pub fn object_store_table(name: &str) -> String {
  format!(
    r#"CREATE TABLE IF NOT EXISTS "{name}" (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    data TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);
INSERT OR IGNORE INTO object_stores (name) VALUES ('{name}');"#
  )
}

/// Store names are interpolated into SQL, so only plain identifiers are allowed.
pub fn is_valid_store_name(name: &str) -> bool {
  let mut chars = name.chars();
  matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_store_names() {
    assert!(is_valid_store_name("contactForms"));
    assert!(is_valid_store_name("_queue2"));
    assert!(!is_valid_store_name(""));
    assert!(!is_valid_store_name("2forms"));
    assert!(!is_valid_store_name("forms\"; DROP TABLE x; --"));
  }
}
