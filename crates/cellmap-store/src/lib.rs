//! Local data persistence for joined coverage samples.
//!
//! This crate provides the SQLite-backed `Base` table that every accepted
//! sample ends up in, along with the schema migrations needed to open
//! databases written by older builds.
//!
//! # Features
//!
//! - Idempotent upsert keyed by the sample second
//! - Lazy open with a repeatable close/reopen lifecycle
//! - Forward-only chunked cursor for exports
//! - Latest-row summaries for status displays
//! - CSV export
//!
//! # Example
//!
//! ```no_run
//! use cellmap_store::Store;
//!
//! let mut store = Store::open_default()?;
//! println!("{} samples", store.row_count()?);
//! if let Some(last) = store.latest_entry_string()? {
//!     println!("last sample at {last}");
//! }
//! # Ok::<(), cellmap_store::Error>(())
//! ```

mod cursor;
mod error;
mod schema;
mod store;

pub use cursor::{DEFAULT_CHUNK_SIZE, SampleCursor};
pub use error::{Error, Result};
pub use schema::{SCHEMA_VERSION, TABLE};
pub use store::{ConflictPolicy, Store};

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/cellmap/CellMapper.db`
/// - macOS: `~/Library/Application Support/cellmap/CellMapper.db`
/// - Windows: `C:\Users\<user>\AppData\Local\cellmap\CellMapper.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("cellmap")
        .join("CellMapper.db")
}
