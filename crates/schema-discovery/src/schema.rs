//! `DatabaseSchema`: tables, columns, and foreign keys discovered from a
//! read-only connection, plus a deterministic text rendering (spec.md §3
//! `DatabaseSchema`, §4.8 "Rendered once at startup into a deterministic
//! text block").

use std::fmt::Write as _;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use subterm_error::CoreError;

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub type_name: String,
    pub nullable: bool,
    pub primary_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: String,
    pub references_column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub foreign_keys: Vec<ForeignKey>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatabaseSchema {
    pub tables: Vec<TableSchema>,
}

impl DatabaseSchema {
    /// Deterministic for equal schemas (spec.md §8 round-trip property):
    /// table and column order both come from `ORDER BY name` / SQLite's
    /// own `cid` column order, never from iteration over a `HashMap`.
    pub fn to_prompt_text(&self) -> String {
        let mut out = String::new();
        for table in &self.tables {
            let _ = writeln!(out, "TABLE {}", table.name);
            for col in &table.columns {
                let _ = write!(out, "  {} {}", col.name, col.type_name);
                if col.primary_key {
                    out.push_str(" PRIMARY KEY");
                }
                if !col.nullable {
                    out.push_str(" NOT NULL");
                }
                out.push('\n');
            }
            for fk in &table.foreign_keys {
                let _ = writeln!(
                    out,
                    "  FOREIGN KEY ({}) REFERENCES {}({})",
                    fk.column, fk.references_table, fk.references_column
                );
            }
            out.push('\n');
        }
        out.truncate(out.trim_end().len());
        out
    }
}

/// Opens `path` via the native `file:...?mode=ro` connection URI and
/// enumerates the schema. Never writes; a read-only connection cannot
/// create the write-probe table that [`crate::verify_read_only`] attempts
/// on a separate, ordinarily-opened connection.
pub fn discover_schema(path: &Path) -> Result<DatabaseSchema, CoreError> {
    let uri = format!("file:{}?mode=ro", path.display());
    let conn = Connection::open_with_flags(
        &uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
    )
    .map_err(|e| CoreError::DatabaseUnavailable(format!("open {uri}: {e}")))?;

    let table_names = list_tables(&conn)?;
    let mut tables = Vec::with_capacity(table_names.len());
    for name in table_names {
        let columns = list_columns(&conn, &name)?;
        let foreign_keys = list_foreign_keys(&conn, &name)?;
        tables.push(TableSchema {
            name,
            columns,
            foreign_keys,
        });
    }
    Ok(DatabaseSchema { tables })
}

fn list_tables(conn: &Connection) -> Result<Vec<String>, CoreError> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\' \
             ORDER BY name",
        )
        .map_err(|e| CoreError::DatabaseUnavailable(format!("list tables: {e}")))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| CoreError::DatabaseUnavailable(format!("list tables: {e}")))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| CoreError::DatabaseUnavailable(format!("list tables: {e}")))
}

fn list_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnSchema>, CoreError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{}\")", escape_quotes(table)))
        .map_err(|e| CoreError::DatabaseUnavailable(format!("table_info({table}): {e}")))?;
    let rows = stmt
        .query_map([], |row| {
            let name: String = row.get(1)?;
            let type_name: String = row.get(2)?;
            let notnull: i64 = row.get(3)?;
            let pk: i64 = row.get(5)?;
            Ok(ColumnSchema {
                name,
                type_name,
                nullable: notnull == 0,
                primary_key: pk != 0,
            })
        })
        .map_err(|e| CoreError::DatabaseUnavailable(format!("table_info({table}): {e}")))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| CoreError::DatabaseUnavailable(format!("table_info({table}): {e}")))
}

fn list_foreign_keys(conn: &Connection, table: &str) -> Result<Vec<ForeignKey>, CoreError> {
    let mut stmt = conn
        .prepare(&format!(
            "PRAGMA foreign_key_list(\"{}\")",
            escape_quotes(table)
        ))
        .map_err(|e| CoreError::DatabaseUnavailable(format!("foreign_key_list({table}): {e}")))?;
    let rows = stmt
        .query_map([], |row| {
            let references_table: String = row.get(2)?;
            let column: String = row.get(3)?;
            let references_column: String = row.get(4)?;
            Ok(ForeignKey {
                column,
                references_table,
                references_column,
            })
        })
        .map_err(|e| CoreError::DatabaseUnavailable(format!("foreign_key_list({table}): {e}")))?;
    rows.collect::<Result<Vec<_>, _>>()
        .map_err(|e| CoreError::DatabaseUnavailable(format!("foreign_key_list({table}): {e}")))
}

/// `table` names come from `sqlite_master` (trusted, not caller input) but
/// are still escaped before interpolation into a PRAGMA statement, since
/// rusqlite has no bind-parameter support for identifiers.
fn escape_quotes(ident: &str) -> String {
    ident.replace('"', "\"\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection as RwConnection;

    fn fixture_db() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.db");
        let conn = RwConnection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE customers (id INTEGER PRIMARY KEY, name TEXT NOT NULL, tier TEXT);
             CREATE TABLE orders (id INTEGER PRIMARY KEY, customer_id INTEGER NOT NULL,
                 amount REAL, FOREIGN KEY (customer_id) REFERENCES customers(id));",
        )
        .unwrap();
        (dir, path)
    }

    #[test]
    fn discovers_tables_columns_and_foreign_keys() {
        let (_dir, path) = fixture_db();
        let schema = discover_schema(&path).unwrap();
        assert_eq!(schema.tables.len(), 2);
        let customers = &schema.tables[0];
        assert_eq!(customers.name, "customers");
        assert!(customers.columns.iter().any(|c| c.name == "id" && c.primary_key));
        let orders = &schema.tables[1];
        assert_eq!(orders.foreign_keys.len(), 1);
        assert_eq!(orders.foreign_keys[0].references_table, "customers");
    }

    #[test]
    fn to_prompt_text_is_deterministic() {
        let (_dir, path) = fixture_db();
        let a = discover_schema(&path).unwrap().to_prompt_text();
        let b = discover_schema(&path).unwrap().to_prompt_text();
        assert_eq!(a, b);
        assert!(a.contains("TABLE customers"));
        assert!(a.contains("FOREIGN KEY (customer_id) REFERENCES customers(id)"));
    }

    #[test]
    fn sqlite_internal_tables_are_excluded() {
        let (_dir, path) = fixture_db();
        let schema = discover_schema(&path).unwrap();
        assert!(schema.tables.iter().all(|t| !t.name.starts_with("sqlite_")));
    }

    #[test]
    fn missing_file_maps_to_database_unavailable() {
        let err = discover_schema(Path::new("/nonexistent/does-not-exist.db")).unwrap_err();
        assert!(matches!(err, CoreError::DatabaseUnavailable(_)));
    }
}
