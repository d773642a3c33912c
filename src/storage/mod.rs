//! Source-of-truth collaborator interface.
//!
//! The engine never owns fact or dimension rows; it reads them through
//! [`FactSource`], which hands back fact rows with their dimension
//! foreign keys already resolved (LEFT JOIN semantics). A built-in
//! in-memory implementation lives in [`memory`]; anything that can
//! answer the same query shape — an embedded table store, a remote
//! warehouse client — can stand in for it.

mod memory;

pub use memory::MemorySource;

use std::collections::HashMap;

use crate::error::Result;
use crate::types::Datum;

/// Marker identifying data changed since the last refresh. Facts are
/// append-only, so a sequence number is sufficient.
pub type Watermark = u64;

/// One fact row with its dimension attributes resolved.
///
/// Columns are keyed by qualified name: bare fact columns (`amount`)
/// and `dimension.attribute` paths (`customer.country`). A fact whose
/// foreign key matched no dimension row simply has no entries for that
/// dimension — the engine surfaces those as the distinct "unknown"
/// grouping value rather than dropping the fact.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRow {
    /// Sequence number assigned when the fact was appended
    pub seq: Watermark,
    /// Qualified column name → value
    pub columns: HashMap<String, Datum>,
}

impl JoinedRow {
    /// Look up a column; absent columns read as None.
    pub fn get(&self, qualified_name: &str) -> Option<&Datum> {
        self.columns.get(qualified_name)
    }
}

/// A transactionally consistent view of the joined fact data.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    /// Joined rows, optionally restricted to facts past a watermark
    pub rows: Vec<JoinedRow>,
    /// Highest fact sequence number visible in this snapshot
    pub high_watermark: Watermark,
    /// Counter advanced by every dimension write. Facts are append-only
    /// and covered by the watermark, but dimension rows are overwritten
    /// in place — a delta scan cannot see that historical facts now
    /// join differently, so the epoch lets callers detect it.
    pub dimension_epoch: u64,
}

/// Read interface the aggregation engine consumes.
pub trait FactSource: Send + Sync {
    /// Scan joined fact rows. `since` restricts the scan to facts
    /// appended after the given watermark; `None` scans everything.
    /// A single call sees one consistent snapshot.
    fn scan_joined(&self, since: Option<Watermark>) -> Result<SourceSnapshot>;

    /// Whether this source can answer watermark-restricted scans.
    /// Sources that cannot force the coordinator into full refreshes.
    fn supports_watermark(&self) -> bool {
        false
    }
}
