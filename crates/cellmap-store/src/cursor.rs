//! Forward-only cursor over stored samples.
//!
//! The cursor pages through the `Base` table by primary key instead of
//! holding one statement open for the whole export, so memory stays bounded
//! by the chunk size and the borrow on the store ends with the cursor.
//!
//! # Example
//!
//! ```
//! use cellmap_store::Store;
//!
//! let mut store = Store::open_in_memory()?;
//! for sample in store.rows_ascending()? {
//!     let sample = sample?;
//!     println!("{} {}", sample.time_sec, sample.signal_strength);
//! }
//! # Ok::<(), cellmap_store::Error>(())
//! ```

use std::collections::VecDeque;

use rusqlite::{Connection, Row};
use tracing::debug;

use cellmap_types::Sample;

use crate::error::Result;

/// Default number of rows fetched per page.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Column list shared by every sample query, in [`sample_from_row`] order.
pub(crate) const SAMPLE_COLUMNS: &str = "time, accuracy, altitude, satellites, latitude, \
     longitude, speed, signalStrength, carrier, androidRelease, manufacturer, model, device, \
     osVersion";

/// Map a row selected with [`SAMPLE_COLUMNS`] to a [`Sample`].
///
/// Columns that older schema versions never filled read back as defaults.
pub(crate) fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<Sample> {
    Ok(Sample {
        time_sec: row.get(0)?,
        accuracy: row.get::<_, Option<f32>>(1)?.unwrap_or_default(),
        altitude: row.get::<_, Option<f64>>(2)?.unwrap_or_default(),
        satellites: row.get::<_, Option<u32>>(3)?.unwrap_or_default(),
        latitude: row.get::<_, Option<f64>>(4)?.unwrap_or_default(),
        longitude: row.get::<_, Option<f64>>(5)?.unwrap_or_default(),
        speed: row.get::<_, Option<f32>>(6)?.unwrap_or_default(),
        signal_strength: row.get::<_, Option<i32>>(7)?.unwrap_or_default(),
        carrier: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        android_release: row.get(9)?,
        manufacturer: row.get(10)?,
        model: row.get(11)?,
        device: row.get(12)?,
        os_version: row.get(13)?,
    })
}

/// Lazy, finite, one-shot iterator over all samples ordered by time ascending.
///
/// Obtained from [`Store::rows_ascending`](crate::Store::rows_ascending).
/// Rows written behind the cursor position while it is alive are not seen;
/// rows written ahead of it are.
pub struct SampleCursor<'a> {
    conn: &'a Connection,
    after: Option<i64>,
    chunk: VecDeque<Sample>,
    chunk_size: usize,
    exhausted: bool,
}

impl<'a> SampleCursor<'a> {
    pub(crate) fn new(conn: &'a Connection, chunk_size: usize) -> Self {
        Self {
            conn,
            after: None,
            chunk: VecDeque::new(),
            chunk_size: chunk_size.max(1),
            exhausted: false,
        }
    }

    fn fetch_chunk(&mut self) -> Result<()> {
        let sql = format!(
            "SELECT {SAMPLE_COLUMNS} FROM Base WHERE time > ?1 ORDER BY time ASC LIMIT ?2"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let after = self.after.unwrap_or(i64::MIN);
        let rows = stmt
            .query_map(rusqlite::params![after, self.chunk_size as i64], sample_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        debug!("Fetched {} rows after {:?}", rows.len(), self.after);

        if rows.len() < self.chunk_size {
            self.exhausted = true;
        }
        if let Some(last) = rows.last() {
            self.after = Some(last.time_sec);
        }
        self.chunk.extend(rows);
        Ok(())
    }
}

impl Iterator for SampleCursor<'_> {
    type Item = Result<Sample>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.chunk.is_empty() && !self.exhausted
            && let Err(e) = self.fetch_chunk()
        {
            self.exhausted = true;
            return Some(Err(e));
        }
        self.chunk.pop_front().map(Ok)
    }
}
