//! Main store implementation.

use std::io;
use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OptionalExtension};
use time::OffsetDateTime;
use time::macros::format_description;
use tracing::{debug, error, info};

use cellmap_types::Sample;

use crate::cursor::{DEFAULT_CHUNK_SIZE, SAMPLE_COLUMNS, SampleCursor, sample_from_row};
use crate::error::{Error, Result};
use crate::schema;

/// Release SQLite's page cache every this many writes.
const SHRINK_EVERY_WRITES: u64 = 100;

/// Width that column labels are padded to in [`Store::latest_row_formatted`].
const LABEL_WIDTH: usize = 16;

/// What an upsert does when a row with the same `time` already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// Replace the existing row entirely (last writer for a second wins).
    #[default]
    Replace,
    /// Keep the existing row and drop the new one.
    Ignore,
}

impl ConflictPolicy {
    fn verb(self) -> &'static str {
        match self {
            ConflictPolicy::Replace => "INSERT OR REPLACE",
            ConflictPolicy::Ignore => "INSERT OR IGNORE",
        }
    }
}

/// Where the database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    File(PathBuf),
    Memory,
}

/// SQLite-based store for joined samples.
///
/// Holds at most one connection, opened lazily on first use. [`close`](Self::close)
/// releases it and the next call reopens it, so the lifecycle can be cycled
/// any number of times. An in-memory store starts empty again after a close.
pub struct Store {
    location: Location,
    conn: Option<Connection>,
    writes: u64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("location", &self.location)
            .field("open", &self.conn.is_some())
            .field("writes", &self.writes)
            .finish()
    }
}

impl Store {
    /// Create a store for `path` without touching the filesystem yet.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            location: Location::File(path.as_ref().to_path_buf()),
            conn: None,
            writes: 0,
        }
    }

    /// Open or create a database at the given path.
    ///
    /// Unlike [`new`](Self::new) this connects immediately, so a bad path or
    /// an unsupported schema is reported up front.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut store = Self::new(path);
        store.connection()?;
        Ok(store)
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self {
            location: Location::Memory,
            conn: None,
            writes: 0,
        };
        store.connection()?;
        Ok(store)
    }

    /// Path of the database file, if it is file-backed.
    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory => None,
        }
    }

    /// Whether a connection is currently open.
    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Close the connection. Closing a closed store is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            info!("Closing database");
            conn.close().map_err(|(_, e)| Error::Database(e))?;
        }
        Ok(())
    }

    /// The open connection, connecting and migrating first if needed.
    fn connection(&mut self) -> Result<&mut Connection> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => self.connect()?,
        };
        Ok(self.conn.insert(conn))
    }

    fn connect(&self) -> Result<Connection> {
        let mut conn = match &self.location {
            Location::File(path) => {
                if let Some(parent) = path.parent()
                    && !parent.as_os_str().is_empty()
                    && !parent.exists()
                {
                    std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                        path: parent.to_path_buf(),
                        source: e,
                    })?;
                }

                info!("Opening database at {}", path.display());
                let conn = Connection::open(path)?;
                // WAL lets readers poll while the sampler writes
                conn.execute_batch(
                    "PRAGMA journal_mode = WAL;
                     PRAGMA synchronous = NORMAL;",
                )?;
                conn
            }
            Location::Memory => Connection::open_in_memory()?,
        };

        schema::initialize(&mut conn)?;
        Ok(conn)
    }
}

// Write operations
impl Store {
    /// Insert a sample, replacing any row with the same `time`.
    pub fn upsert(&mut self, sample: &Sample) -> Result<usize> {
        self.upsert_with(sample, ConflictPolicy::Replace)
    }

    /// Insert a sample with an explicit conflict policy.
    ///
    /// The write runs in its own transaction; on failure nothing is
    /// committed and the store is left unchanged. Returns the number of rows
    /// written (0 when [`ConflictPolicy::Ignore`] kept an existing row).
    pub fn upsert_with(&mut self, sample: &Sample, policy: ConflictPolicy) -> Result<usize> {
        self.writes += 1;
        let shrink = self.writes % SHRINK_EVERY_WRITES == 0;

        let conn = self.connection()?;
        let tx = conn.transaction()?;
        let written = tx.execute(
            &format!(
                "{} INTO Base ({SAMPLE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                policy.verb()
            ),
            rusqlite::params![
                sample.time_sec,
                sample.accuracy,
                sample.altitude,
                sample.satellites,
                sample.latitude,
                sample.longitude,
                sample.speed,
                sample.signal_strength,
                sample.carrier,
                sample.android_release,
                sample.manufacturer,
                sample.model,
                sample.device,
                sample.os_version,
            ],
        )?;
        tx.commit()?;

        debug!(
            "Wrote sample at {} ({:?}, {} row(s))",
            sample.time_sec, policy, written
        );

        if shrink && let Err(e) = conn.execute_batch("PRAGMA shrink_memory;") {
            error!("Failed to release database memory: {}", e);
        }

        Ok(written)
    }
}

// Read operations
impl Store {
    /// Number of stored samples.
    pub fn row_count(&mut self) -> Result<u64> {
        let count: i64 = self
            .connection()?
            .query_row("SELECT COUNT(*) FROM Base", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Time of the most recent sample.
    pub fn latest_timestamp(&mut self) -> Result<Option<OffsetDateTime>> {
        let time: Option<i64> = self
            .connection()?
            .query_row("SELECT MAX(time) FROM Base", [], |row| row.get(0))?;

        time.map(|t| {
            OffsetDateTime::from_unix_timestamp(t)
                .map_err(|e| Error::InvalidTimestamp(format!("{t}: {e}")))
        })
        .transpose()
    }

    /// The most recent sample time rendered as `YYYY-MM-DD HH:MM:SS` (UTC).
    pub fn latest_entry_string(&mut self) -> Result<Option<String>> {
        let Some(ts) = self.latest_timestamp()? else {
            return Ok(None);
        };
        let format = format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");
        ts.format(format)
            .map(Some)
            .map_err(|e| Error::InvalidTimestamp(e.to_string()))
    }

    /// The most recent sample.
    pub fn latest_sample(&mut self) -> Result<Option<Sample>> {
        let sample = self
            .connection()?
            .query_row(
                &format!("SELECT {SAMPLE_COLUMNS} FROM Base ORDER BY time DESC LIMIT 1"),
                [],
                sample_from_row,
            )
            .optional()?;
        Ok(sample)
    }

    /// The most recent row, one `column:` label (padded to 16) and value per line.
    ///
    /// Empty when the store holds no rows.
    pub fn latest_row_formatted(&mut self) -> Result<String> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT * FROM Base ORDER BY time DESC LIMIT 1")?;
        let names: Vec<String> = stmt.column_names().iter().map(|n| n.to_string()).collect();

        let mut rows = stmt.query([])?;
        let mut out = String::with_capacity(64);
        if let Some(row) = rows.next()? {
            for (i, name) in names.iter().enumerate() {
                let label = format!("{name}:");
                let value = render_value(row.get_ref(i)?);
                out.push_str(&format!("{label:<LABEL_WIDTH$}{value}\n"));
            }
        }
        Ok(out)
    }

    /// All samples ordered by time ascending, fetched lazily in chunks.
    pub fn rows_ascending(&mut self) -> Result<SampleCursor<'_>> {
        self.rows_ascending_chunked(DEFAULT_CHUNK_SIZE)
    }

    /// Like [`rows_ascending`](Self::rows_ascending) with a custom page size.
    pub fn rows_ascending_chunked(&mut self, chunk_size: usize) -> Result<SampleCursor<'_>> {
        let conn: &Connection = self.connection()?;
        Ok(SampleCursor::new(conn, chunk_size))
    }

    /// Write every sample as CSV (header plus one line per row, ascending).
    ///
    /// Returns the number of rows written.
    pub fn export_csv<W: io::Write>(&mut self, writer: W) -> Result<usize> {
        let mut csv = csv::Writer::from_writer(writer);
        let mut written = 0;

        for sample in self.rows_ascending()? {
            csv.serialize(sample?)?;
            written += 1;
            if written % 1000 == 0 {
                debug!("Exported {} rows", written);
            }
        }
        csv.flush()?;

        info!("Exported {} rows", written);
        Ok(written)
    }
}

fn render_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}
