//! Write-probe verification (spec.md §4.8 "Read-only verification"): at
//! startup, attempt `CREATE TABLE _probe_...` over an ordinarily-opened
//! connection and expect failure. Succeeding means the file is not
//! actually protected at the OS level (spec.md §5: "protected by OS-level
//! read-only permissions (0o444) ... and by the read-only probe at
//! startup"), so the process must refuse to start.

use std::path::Path;

use rusqlite::Connection;
use subterm_error::CoreError;

pub fn verify_read_only(path: &Path) -> Result<(), CoreError> {
    let conn = Connection::open(path)
        .map_err(|e| CoreError::Configuration(format!("open {}: {e}", path.display())))?;

    let probe_table = format!("_probe_{}", uuid::Uuid::new_v4().simple());
    let create = conn.execute(&format!("CREATE TABLE \"{probe_table}\" (x INTEGER)"), []);

    match create {
        Err(_) => Ok(()),
        Ok(_) => {
            let _ = conn.execute(&format!("DROP TABLE \"{probe_table}\""), []);
            Err(CoreError::Configuration(format!(
                "database file {} is writable; refusing to start \
                 (expected the write probe to fail — set file mode to 0o444)",
                path.display()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writable_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.db");
        Connection::open(&path).unwrap();
        let err = verify_read_only(&path).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[cfg(unix)]
    #[test]
    fn read_only_file_mode_passes_the_probe() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.db");
        Connection::open(&path).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o444);
        std::fs::set_permissions(&path, perms).unwrap();

        let result = verify_read_only(&path);

        // Restore write permission so the tempdir can clean itself up.
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o644);
        std::fs::set_permissions(&path, perms).unwrap();

        assert!(result.is_ok());
    }

    #[test]
    fn missing_parent_directory_is_a_configuration_error() {
        let err = verify_read_only(Path::new("/nonexistent/dir/demo.db")).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }
}
