// ABOUTME: Source table identity and the fragment column layouts derived from it
// ABOUTME: TableKey names a table, TableDef knows where commit-ts and primary-key columns live

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Hidden column holding the encoded composite primary key.
pub const COMPOSITE_PK_COLUMN: &str = "__cpkey";
/// Hidden column holding each row's commit timestamp.
pub const COMMIT_TS_COLUMN: &str = "__commit_ts";

/// Identity of a source table: (database, table).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableKey {
    pub db: String,
    pub table: String,
}

impl TableKey {
    pub fn new(db: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            table: table.into(),
        }
    }

    /// Registry key in the form `db.table`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.db, self.table)
    }
}

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.table)
    }
}

impl FromStr for TableKey {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let (db, table) = value
            .split_once('.')
            .ok_or_else(|| anyhow!("table must be given as db.table, got '{}'", value))?;
        if db.is_empty() || table.is_empty() {
            bail!("table must be given as db.table, got '{}'", value);
        }
        Ok(Self::new(db, table))
    }
}

/// Position of the commit-ts and primary-key columns inside a fragment batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnLayout {
    pub ts_index: usize,
    pub pk_index: usize,
}

/// Definition of the replicated source table.
///
/// Insert fragments carry the visible columns, then `__cpkey` when the primary
/// key is composite, then `__commit_ts`. Delete fragments carry the primary key
/// (raw value, or the encoded composite key) followed by `__commit_ts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    pub key: TableKey,
    pub columns: Vec<String>,
    pub primary_key: Vec<String>,
}

impl TableDef {
    pub fn new(key: TableKey, columns: Vec<String>, primary_key: Vec<String>) -> Result<Self> {
        if columns.is_empty() {
            bail!("table {} has no columns", key);
        }
        if primary_key.is_empty() {
            bail!("table {} has no primary key", key);
        }
        if let Some(missing) = primary_key.iter().find(|pk| !columns.contains(pk)) {
            bail!(
                "primary key column {} is not a column of table {}",
                missing,
                key
            );
        }
        Ok(Self {
            key,
            columns,
            primary_key,
        })
    }

    pub fn has_composite_pk(&self) -> bool {
        self.primary_key.len() > 1
    }

    /// Column list of insert fragments.
    pub fn insert_columns(&self) -> Vec<String> {
        let mut cols = self.columns.clone();
        if self.has_composite_pk() {
            cols.push(COMPOSITE_PK_COLUMN.to_string());
        }
        cols.push(COMMIT_TS_COLUMN.to_string());
        cols
    }

    /// Column list of delete fragments.
    pub fn delete_columns(&self) -> Vec<String> {
        let pk = if self.has_composite_pk() {
            COMPOSITE_PK_COLUMN.to_string()
        } else {
            self.primary_key[0].clone()
        };
        vec![pk, COMMIT_TS_COLUMN.to_string()]
    }

    pub fn insert_layout(&self) -> ColumnLayout {
        let ts_index = self.insert_columns().len() - 1;
        let pk_index = if self.has_composite_pk() {
            ts_index - 1
        } else {
            self.column_position(&self.primary_key[0])
        };
        ColumnLayout { ts_index, pk_index }
    }

    pub fn delete_layout(&self) -> ColumnLayout {
        ColumnLayout {
            ts_index: 1,
            pk_index: 0,
        }
    }

    /// Positions of the primary-key columns among the visible columns.
    pub fn primary_key_positions(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .map(|pk| self.column_position(pk))
            .collect()
    }

    // Validated in `new`, every primary-key column is present.
    fn column_position(&self, name: &str) -> usize {
        self.columns.iter().position(|c| c == name).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_table_key_parse() {
        let key: TableKey = "shop.orders".parse().unwrap();
        assert_eq!(key, TableKey::new("shop", "orders"));
        assert_eq!(key.qualified_name(), "shop.orders");
        assert!("orders".parse::<TableKey>().is_err());
        assert!(".orders".parse::<TableKey>().is_err());
    }

    #[test]
    fn test_single_pk_layout() {
        let def = TableDef::new(
            TableKey::new("shop", "users"),
            cols(&["name", "id", "email"]),
            cols(&["id"]),
        )
        .unwrap();

        assert_eq!(
            def.insert_columns(),
            cols(&["name", "id", "email", COMMIT_TS_COLUMN])
        );
        assert_eq!(
            def.insert_layout(),
            ColumnLayout {
                ts_index: 3,
                pk_index: 1
            }
        );
        assert_eq!(def.delete_columns(), cols(&["id", COMMIT_TS_COLUMN]));
    }

    #[test]
    fn test_composite_pk_layout() {
        let def = TableDef::new(
            TableKey::new("shop", "order_items"),
            cols(&["order_id", "item_id", "quantity"]),
            cols(&["order_id", "item_id"]),
        )
        .unwrap();

        assert_eq!(
            def.insert_columns(),
            cols(&[
                "order_id",
                "item_id",
                "quantity",
                COMPOSITE_PK_COLUMN,
                COMMIT_TS_COLUMN
            ])
        );
        assert_eq!(
            def.insert_layout(),
            ColumnLayout {
                ts_index: 4,
                pk_index: 3
            }
        );
        assert_eq!(def.primary_key_positions(), vec![0, 1]);
    }

    #[test]
    fn test_rejects_unknown_pk() {
        let result = TableDef::new(
            TableKey::new("shop", "users"),
            cols(&["id"]),
            cols(&["uid"]),
        );
        assert!(result.is_err());
    }
}
