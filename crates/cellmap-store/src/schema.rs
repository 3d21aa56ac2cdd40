//! Database schema and migrations.
//!
//! The version lives in `PRAGMA user_version`, the same slot the handset's
//! database helper uses, so files pulled off a phone migrate in place.
//!
//! | Version | Layout |
//! |---------|--------|
//! | 1-3 | legacy signal columns `cdmaDbm`, `evdoDbm`, `evdoSnr`, `signalStrength` |
//! | 4 | single `signalStrength` column |
//! | 5 | adds `androidRelease` |
//! | 6 | adds `manufacturer`, `model`, `device`, `osVersion` |

use rusqlite::{Connection, Transaction};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 6;

/// Name of the sample table, stable across all versions.
pub const TABLE: &str = "Base";

/// Columns that survive the removal of the legacy signal fields.
const V4_COLUMNS: &str =
    "time, accuracy, altitude, satellites, latitude, longitude, speed, signalStrength, carrier";

/// Context columns added after the signal collapse.
const CONTEXT_COLUMNS: [&str; 4] = ["manufacturer", "model", "device", "osVersion"];

/// Initialize the database schema, migrating older layouts.
pub fn initialize(conn: &mut Connection) -> Result<()> {
    let mut version = get_schema_version(conn)?;

    if version == 0 && table_exists(conn, TABLE)? {
        // Oldest builds created the table without recording a version
        debug!("Found unversioned {} table, treating as version 1", TABLE);
        version = 1;
    }

    if version == 0 {
        info!("Creating schema version {}", SCHEMA_VERSION);
        let tx = conn.transaction()?;
        create_schema(&tx)?;
        set_schema_version(&tx, SCHEMA_VERSION)?;
        tx.commit()?;
    } else if version < SCHEMA_VERSION {
        migrate(conn, version)?;
    } else if version > SCHEMA_VERSION {
        return Err(Error::UnsupportedVersion {
            found: version,
            supported: SCHEMA_VERSION,
        });
    }

    Ok(())
}

/// Get the current schema version.
pub(crate) fn get_schema_version(conn: &Connection) -> Result<i32> {
    let version: i32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version.
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?1",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists)
}

/// Names of the columns currently present in `table`.
pub(crate) fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Create the current schema.
fn create_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS Base (
            time INTEGER PRIMARY KEY,
            accuracy REAL,
            altitude REAL,
            satellites INTEGER,
            latitude REAL,
            longitude REAL,
            speed REAL,
            signalStrength INTEGER,
            carrier TEXT,
            androidRelease TEXT,
            manufacturer TEXT,
            model TEXT,
            device TEXT,
            osVersion TEXT
        );
        "#,
    )?;
    Ok(())
}

/// Run migrations from old_version to current, one transaction per step.
fn migrate(conn: &mut Connection, old_version: i32) -> Result<()> {
    info!("Upgrading schema from {} to {}", old_version, SCHEMA_VERSION);

    if old_version < 4 {
        let tx = conn.transaction()?;
        keep_columns(&tx, V4_COLUMNS)?;
        set_schema_version(&tx, 4)?;
        tx.commit()?;
    }

    if old_version < 5 {
        let tx = conn.transaction()?;
        add_text_column(&tx, "androidRelease")?;
        set_schema_version(&tx, 5)?;
        tx.commit()?;
    }

    if old_version < 6 {
        let tx = conn.transaction()?;
        for column in CONTEXT_COLUMNS {
            add_text_column(&tx, column)?;
        }
        set_schema_version(&tx, 6)?;
        tx.commit()?;
    }

    Ok(())
}

/// Add a nullable text column unless it is already there.
///
/// Handset databases created fresh at version 5 already carry every column.
fn add_text_column(tx: &Transaction<'_>, column: &str) -> Result<()> {
    if column_names(tx, TABLE)?.iter().any(|c| c == column) {
        debug!("Column {} already present", column);
        return Ok(());
    }
    debug!("Adding column {}", column);
    tx.execute_batch(&format!("ALTER TABLE {TABLE} ADD COLUMN {column} TEXT"))?;
    Ok(())
}

/// Rebuild the table with only `cols`, going through a temporary copy.
fn keep_columns(tx: &Transaction<'_>, cols: &str) -> Result<()> {
    debug!("Dropping all columns except {}", cols);
    tx.execute_batch(&format!(
        "CREATE TEMPORARY TABLE base_backup({cols});
         INSERT INTO base_backup SELECT {cols} FROM {TABLE};
         DROP TABLE {TABLE};
         CREATE TABLE {TABLE} (
             time INTEGER PRIMARY KEY,
             accuracy REAL,
             altitude REAL,
             satellites INTEGER,
             latitude REAL,
             longitude REAL,
             speed REAL,
             signalStrength INTEGER,
             carrier TEXT
         );
         INSERT INTO {TABLE} ({cols}) SELECT {cols} FROM base_backup;
         DROP TABLE base_backup;"
    ))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_legacy_v1(conn: &Connection) {
        conn.execute_batch(
            "CREATE TABLE Base (
                time INT PRIMARY KEY,
                accuracy REAL,
                altitude REAL,
                satellites INT,
                latitude REAL,
                longitude REAL,
                speed REAL,
                cdmaDbm INT,
                evdoDbm INT,
                evdoSnr INT,
                signalStrength INT,
                carrier TEXT
            );
            INSERT INTO Base VALUES (100, 5.0, 30.0, 4, 52.5, 13.4, 0.0, -1, -1, -1, 17, 'E-Plus');
            INSERT INTO Base VALUES (200, 8.0, 31.0, 5, 52.6, 13.5, 1.0, -1, -1, -1, 12, 'O2');
            PRAGMA user_version = 1;",
        )
        .unwrap();
    }

    #[test]
    fn test_initialize_fresh_database() {
        let mut conn = Connection::open_in_memory().unwrap();
        initialize(&mut conn).unwrap();

        let columns = column_names(&conn, TABLE).unwrap();
        for expected in [
            "time",
            "accuracy",
            "signalStrength",
            "carrier",
            "androidRelease",
            "manufacturer",
            "model",
            "device",
            "osVersion",
        ] {
            assert!(columns.contains(&expected.to_string()), "missing {expected}");
        }
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_schema_version_tracking() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 0);

        initialize(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        // Second initialization is a no-op
        initialize(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_legacy_drops_signal_columns_and_keeps_rows() {
        let mut conn = Connection::open_in_memory().unwrap();
        create_legacy_v1(&conn);

        initialize(&mut conn).unwrap();

        let columns = column_names(&conn, TABLE).unwrap();
        assert!(!columns.contains(&"cdmaDbm".to_string()));
        assert!(!columns.contains(&"evdoDbm".to_string()));
        assert!(!columns.contains(&"evdoSnr".to_string()));
        assert!(columns.contains(&"osVersion".to_string()));

        let (count, strength, carrier): (i64, i64, String) = conn
            .query_row(
                "SELECT COUNT(*), MAX(signalStrength), MIN(carrier) FROM Base",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(count, 2);
        assert_eq!(strength, 17);
        assert_eq!(carrier, "E-Plus");

        let release: Option<String> = conn
            .query_row("SELECT androidRelease FROM Base WHERE time = 100", [], |row| row.get(0))
            .unwrap();
        assert_eq!(release, None);
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migrated_table_keeps_time_as_primary_key() {
        let mut conn = Connection::open_in_memory().unwrap();
        create_legacy_v1(&conn);
        initialize(&mut conn).unwrap();

        conn.execute("INSERT OR REPLACE INTO Base (time, signalStrength) VALUES (100, 3)", [])
            .unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM Base WHERE time = 100", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_unversioned_table_is_treated_as_legacy() {
        let mut conn = Connection::open_in_memory().unwrap();
        create_legacy_v1(&conn);
        conn.execute_batch("PRAGMA user_version = 0;").unwrap();

        initialize(&mut conn).unwrap();

        let columns = column_names(&conn, TABLE).unwrap();
        assert!(!columns.contains(&"cdmaDbm".to_string()));
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_migration_skips_existing_context_columns() {
        let mut conn = Connection::open_in_memory().unwrap();
        // A version 5 file created with the full column set
        create_schema(&conn).unwrap();
        conn.execute_batch("PRAGMA user_version = 5;").unwrap();

        initialize(&mut conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_is_rejected() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA user_version = 99;").unwrap();

        let result = initialize(&mut conn);
        assert!(matches!(
            result,
            Err(Error::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn test_failed_migration_step_rolls_back() {
        let mut conn = Connection::open_in_memory().unwrap();
        // Legacy table missing the carrier column cannot be copied
        conn.execute_batch(
            "CREATE TABLE Base (time INT PRIMARY KEY, accuracy REAL, cdmaDbm INT);
             INSERT INTO Base VALUES (1, 2.0, 3);
             PRAGMA user_version = 2;",
        )
        .unwrap();

        assert!(initialize(&mut conn).is_err());

        let columns = column_names(&conn, TABLE).unwrap();
        assert!(columns.contains(&"cdmaDbm".to_string()));
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
    }
}
