//! Read-only database introspection for the analyst gateway (Core B,
//! spec.md §4.8). Opens the configured SQLite file with the native
//! `?mode=ro` connection URI, enumerates tables/columns/foreign keys, and
//! renders a deterministic text block. A separate read-only *write probe*
//! checks the file's OS-level permissions independently of the connection
//! mode, as a defense-in-depth check orthogonal to the tool-layer deny
//! list the agent session enforces.

mod probe;
mod prompt;
mod schema;

pub use probe::verify_read_only;
pub use prompt::build_system_prompt;
pub use schema::{discover_schema, ColumnSchema, DatabaseSchema, ForeignKey, TableSchema};
