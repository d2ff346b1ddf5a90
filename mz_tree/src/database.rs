//! Structured metadata of a tree file: node table, traces and envelopes
//!
//! Backed by sqlite. Writes accumulate in one open transaction that `flush` commits, so a
//! build or a batch of label edits reaches disk in a handful of commits.

use rusqlite::{params, Connection, OptionalExtension, Row};
use log::info;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::data::{Envelope, EnvelopeId, Parser, PointId, TraceId, TraceRecord, TraceStats, NO_ENVELOPE};
use crate::error::{Error, Result};
use crate::layout;
use crate::node::{Bounds, LeafBlock};

const SCHEMA: [&str; 5] = [
    "CREATE TABLE IF NOT EXISTS Node (nodeId INTEGER PRIMARY KEY, fileIndex INTEGER, numPoints INTEGER, mzMin DOUBLE NOT NULL, mzMax DOUBLE NOT NULL, rtMin FLOAT NOT NULL, rtMax FLOAT NOT NULL, intMin DOUBLE, intMax DOUBLE, parentId INTEGER, points BLOB, FOREIGN KEY(parentId) REFERENCES Node(nodeId));",
    "CREATE INDEX IF NOT EXISTS Node_parentId ON Node (parentId);",
    "CREATE TABLE IF NOT EXISTS Trace (traceId INTEGER PRIMARY KEY, envelopeID INTEGER, centroidMZ DOUBLE, minRT FLOAT, maxRT FLOAT, intensitySum DOUBLE, FOREIGN KEY(envelopeID) REFERENCES Envelope(envelopeId));",
    "CREATE INDEX IF NOT EXISTS Trace_envelopeID ON Trace(envelopeID);",
    "CREATE TABLE IF NOT EXISTS Envelope (envelopeId INTEGER PRIMARY KEY, chargeState INTEGER, monoisotopicMZ DOUBLE, intensitySum DOUBLE, relativeIntensities TEXT);",
];

const NODE_COLUMNS: &str = "nodeId, fileIndex, numPoints, mzMin, mzMax, rtMin, rtMax, intMin, intMax, parentId";

/// One step of the format migration chain, upgrading a file from `from` to `from + 1`
struct Migration {
    from: i32,
    apply: fn(&Connection) -> rusqlite::Result<()>,
}

//version 4 files predate contiguous leaf blocks, their leaves are read through point ids
fn add_leaf_block_columns(conn: &Connection) -> rusqlite::Result<()> {

    conn.execute_batch("ALTER TABLE Node ADD COLUMN fileIndex INTEGER; ALTER TABLE Node ADD COLUMN numPoints INTEGER;")
}

const MIGRATIONS: [Migration; 1] = [
    Migration { from: 4, apply: add_leaf_block_columns },
];

/// A node row without its point id blob, which is loaded lazily
#[derive(Debug, PartialEq, Clone)]
pub struct NodeRow {
    pub node_id: i64,
    pub parent_id: Option<i64>,
    pub block: Option<LeafBlock>,
    pub bounds: Bounds,
}

impl NodeRow {

    fn from_row(row: &Row) -> rusqlite::Result<Self> {

        let file_index: Option<i64> = row.get(1)?;
        let num_points: Option<i64> = row.get(2)?;

        let block = match (file_index, num_points) {
            (Some(file_offset), Some(count)) => Some(LeafBlock { file_offset: file_offset as u64, count: count as u32 }),
            _ => None,
        };

        let bounds = Bounds {
            mz_min: row.get(3)?,
            mz_max: row.get(4)?,
            rt_min: row.get::<_, f64>(5)? as f32,
            rt_max: row.get::<_, f64>(6)? as f32,
            int_min: row.get::<_, Option<f64>>(7)?.unwrap_or(f64::MAX),
            int_max: row.get::<_, Option<f64>>(8)?.unwrap_or(f64::MIN),
        };

        return Ok(Self {
            node_id: row.get(0)?,
            parent_id: row.get(9)?,
            block,
            bounds,
        });
    }
}

fn trace_from_row(row: &Row) -> rusqlite::Result<TraceRecord> {

    return Ok(TraceRecord {
        trace_id: row.get(0)?,
        envelope_id: row.get::<_, Option<i32>>(1)?.unwrap_or(NO_ENVELOPE),
        centroid_mz: row.get(2)?,
        min_rt: row.get::<_, Option<f64>>(3)?.map(|x| x as f32),
        max_rt: row.get::<_, Option<f64>>(4)?.map(|x| x as f32),
        intensity_sum: row.get(5)?,
    });
}

fn envelope_param(envelope_id: EnvelopeId) -> Option<EnvelopeId> {

    return match envelope_id {
        NO_ENVELOPE => None,
        x => Some(x),
    };
}

#[derive(Debug)]
pub struct MetadataStore {
    path: PathBuf,
    conn: Connection,
}

impl MetadataStore {

    /// Opens or creates the metadata file at `path`
    ///
    /// Fails with `NotThisFormat` for foreign sqlite files and `UnsupportedVersion` for versions
    /// outside the migration chain.
    pub fn open(path: &Path) -> Result<Self> {

        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA foreign_keys=ON;")?;

        Self::check_header(&conn)?;

        let store = Self {
            path: path.to_path_buf(),
            conn,
        };

        store.create_schema()?;

        store.conn.execute_batch("BEGIN;")?;

        return Ok(store);
    }

    fn check_header(conn: &Connection) -> Result<()> {

        let application_id: i32 = conn.query_row("PRAGMA application_id;", [], |row| row.get(0))?;

        if application_id == 0 {

            let num_tables: i64 = conn.query_row("SELECT count(*) FROM sqlite_master;", [], |row| row.get(0))?;

            if num_tables != 0 {
                return Err(Error::NotThisFormat);
            }

            info!("Creating a new mzTree file, version {}", layout::USER_VERSION);

            conn.execute_batch(&format!("PRAGMA application_id = {}; PRAGMA user_version = {};", layout::APPLICATION_ID, layout::USER_VERSION))?;

            return Ok(());
        }

        if application_id != layout::APPLICATION_ID {
            return Err(Error::NotThisFormat);
        }

        let user_version: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;

        if user_version != layout::USER_VERSION {
            Self::migrate(conn, user_version)?;
        }

        Ok(())
    }

    /// Runs every migration from `from_version` up to the current version, in order
    fn migrate(conn: &Connection, from_version: i32) -> Result<()> {

        if from_version > layout::USER_VERSION {
            return Err(Error::UnsupportedVersion(from_version));
        }

        info!("Converting mzTree file from version {}", from_version);

        let mut version = from_version;
        while version < layout::USER_VERSION {

            let step = match MIGRATIONS.iter().find(|m| m.from == version) {
                Some(step) => step,
                None => return Err(Error::UnsupportedVersion(from_version)),
            };

            (step.apply)(conn)?;
            version += 1;
        }

        conn.execute_batch(&format!("PRAGMA user_version = {};", layout::USER_VERSION))?;

        info!("mzTree file converted to version {}", layout::USER_VERSION);

        Ok(())
    }

    /// Creates any missing table or index
    pub fn create_schema(&self) -> Result<()> {

        for statement in SCHEMA.iter() {
            self.conn.execute_batch(statement)?;
        }

        Ok(())
    }

    pub fn path(&self) -> &Path {
        return &self.path;
    }

    /// Commits the open batch and starts the next one
    pub fn flush(&self) -> Result<()> {

        self.conn.execute_batch("COMMIT; BEGIN;")?;

        Ok(())
    }

    /// Commits outstanding writes and closes the connection
    pub fn close(self) -> Result<()> {

        if !self.conn.is_autocommit() {
            self.conn.execute_batch("COMMIT;")?;
        }

        self.conn.close().map_err(|(_, e)| Error::Sqlite(e))?;

        Ok(())
    }

    //**** nodes ****

    /// Inserts a node row, `None` parent marks the root. Returns the new node id.
    pub fn insert_node(&self, bounds: &Bounds, block: Option<LeafBlock>, parent_id: Option<i64>) -> Result<i64> {

        let mut statement = self.conn.prepare_cached(
            "INSERT INTO Node (fileIndex, numPoints, mzMin, mzMax, rtMin, rtMax, intMin, intMax, parentId, points) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL);")?;

        statement.execute(params![
            block.map(|b| b.file_offset as i64),
            block.map(|b| b.count as i64),
            bounds.mz_min,
            bounds.mz_max,
            bounds.rt_min as f64,
            bounds.rt_max as f64,
            bounds.int_min,
            bounds.int_max,
            parent_id,
        ])?;

        return Ok(self.conn.last_insert_rowid());
    }

    /// Stores a node's point ids as a packed big endian blob
    pub fn update_node_point_ids(&self, node_id: i64, point_ids: &[PointId]) -> Result<()> {

        let blob = Parser::point_ids_to_blob(point_ids);

        let mut statement = self.conn.prepare_cached("UPDATE Node SET points = ?1 WHERE nodeId = ?2;")?;
        statement.execute(params![blob, node_id])?;

        Ok(())
    }

    pub fn load_root(&self) -> Result<Option<NodeRow>> {

        let query = format!("SELECT {} FROM Node WHERE parentId IS NULL ORDER BY nodeId LIMIT 1;", NODE_COLUMNS);

        let row = self.conn.query_row(&query, [], NodeRow::from_row).optional()?;

        return Ok(row);
    }

    pub fn load_children(&self, parent_id: i64) -> Result<Vec<NodeRow>> {

        let query = format!("SELECT {} FROM Node WHERE parentId = ?1 ORDER BY nodeId;", NODE_COLUMNS);

        let mut statement = self.conn.prepare_cached(&query)?;
        let rows: Vec<NodeRow> = statement.query_map([parent_id], NodeRow::from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;

        return Ok(rows);
    }

    pub fn load_node_point_ids(&self, node_id: i64) -> Result<Vec<PointId>> {

        let blob: Option<Vec<u8>> = self.conn.query_row("SELECT points FROM Node WHERE nodeId = ?1;", [node_id], |row| row.get(0)).optional()?.flatten();

        return Ok(match blob {
            Some(bytes) => Parser::get_point_ids_from_blob(&bytes),
            None => Vec::new(),
        });
    }

    //**** traces ****

    /// Creates a trace row, envelope 0 means no envelope
    pub fn insert_trace(&self, trace_id: TraceId, envelope_id: EnvelopeId) -> Result<()> {

        let envelope = envelope_param(envelope_id);
        if let Some(id) = envelope {
            self.insert_or_ignore_envelope(&Envelope::empty(id))?;
        }

        let mut statement = self.conn.prepare_cached(
            "INSERT INTO Trace (traceId, envelopeID, centroidMZ, minRT, maxRT, intensitySum) VALUES (?1, ?2, NULL, NULL, NULL, NULL);")?;
        statement.execute(params![trace_id, envelope])?;

        Ok(())
    }

    pub fn delete_trace(&self, trace_id: TraceId) -> Result<()> {

        let mut statement = self.conn.prepare_cached("DELETE FROM Trace WHERE traceId = ?1;")?;
        statement.execute([trace_id])?;

        Ok(())
    }

    pub fn delete_traces(&self) -> Result<()> {

        self.conn.execute_batch("DELETE FROM Trace;")?;

        Ok(())
    }

    /// Moves the given traces into `envelope_id`
    pub fn update_envelopes(&self, envelope_id: EnvelopeId, trace_ids: &[TraceId]) -> Result<()> {

        let envelope = envelope_param(envelope_id);
        if let Some(id) = envelope {
            self.insert_or_ignore_envelope(&Envelope::empty(id))?;
        }

        let mut statement = self.conn.prepare_cached("UPDATE Trace SET envelopeID = ?1 WHERE traceId = ?2;")?;
        for trace_id in trace_ids.iter() {
            statement.execute(params![envelope, trace_id])?;
        }

        Ok(())
    }

    pub fn update_trace_stats(&self, trace_id: TraceId, stats: &TraceStats) -> Result<()> {

        let mut statement = self.conn.prepare_cached(
            "UPDATE Trace SET centroidMZ = ?1, minRT = ?2, maxRT = ?3, intensitySum = ?4 WHERE traceId = ?5;")?;
        statement.execute(params![stats.centroid_mz, stats.min_rt as f64, stats.max_rt as f64, stats.intensity_sum, trace_id])?;

        Ok(())
    }

    /// Trace id to envelope id, 0 for traces without an envelope
    pub fn load_trace_map(&self) -> Result<HashMap<TraceId, EnvelopeId>> {

        let mut statement = self.conn.prepare_cached("SELECT traceId, envelopeID FROM Trace;")?;

        let map = statement
            .query_map([], |row| Ok((row.get::<_, TraceId>(0)?, row.get::<_, Option<EnvelopeId>>(1)?.unwrap_or(NO_ENVELOPE))))?
            .collect::<rusqlite::Result<HashMap<_, _>>>()?;

        return Ok(map);
    }

    /// Loads one trace (to probe the table) or all of them
    pub fn load_traces(&self, single: bool) -> Result<Vec<TraceRecord>> {

        let query = match single {
            true => "SELECT traceId, envelopeID, centroidMZ, minRT, maxRT, intensitySum FROM Trace LIMIT 1;",
            false => "SELECT traceId, envelopeID, centroidMZ, minRT, maxRT, intensitySum FROM Trace ORDER BY traceId;",
        };

        let mut statement = self.conn.prepare_cached(query)?;
        let traces = statement.query_map([], trace_from_row)?.collect::<rusqlite::Result<Vec<_>>>()?;

        return Ok(traces);
    }

    /// Whether the compiled statistics of the traces have been filled in
    pub fn traces_have_been_compiled(&self) -> Result<bool> {

        let probe = self.load_traces(true)?;

        return Ok(match probe.first() {
            Some(trace) => trace.centroid_mz.is_some(),
            None => false,
        });
    }

    //**** envelopes ****

    fn insert_or_ignore_envelope(&self, envelope: &Envelope) -> Result<()> {

        let relative_intensities = envelope.relative_intensities.as_ref()
            .map(|values| values.iter().map(|x| x.to_string()).collect::<Vec<_>>().join(","));

        let mut statement = self.conn.prepare_cached(
            "INSERT OR IGNORE INTO Envelope (envelopeId, chargeState, monoisotopicMZ, intensitySum, relativeIntensities) VALUES (?1, ?2, ?3, ?4, ?5);")?;
        statement.execute(params![
            envelope.envelope_id,
            envelope.charge_state,
            envelope.monoisotopic_mz,
            envelope.intensity_sum,
            relative_intensities,
        ])?;

        Ok(())
    }

    pub fn insert_envelope(&self, envelope: &Envelope) -> Result<()> {

        return self.insert_or_ignore_envelope(envelope);
    }

    pub fn load_envelopes(&self) -> Result<Vec<Envelope>> {

        let mut statement = self.conn.prepare_cached(
            "SELECT envelopeId, chargeState, monoisotopicMZ, intensitySum, relativeIntensities FROM Envelope ORDER BY envelopeId;")?;

        let envelopes = statement.query_map([], |row| {
            let relative: Option<String> = row.get(4)?;
            Ok(Envelope {
                envelope_id: row.get(0)?,
                charge_state: row.get(1)?,
                monoisotopic_mz: row.get(2)?,
                intensity_sum: row.get(3)?,
                relative_intensities: relative.map(|s| s.split(',').filter_map(|x| x.parse::<f64>().ok()).collect()),
            })
        })?.collect::<rusqlite::Result<Vec<_>>>()?;

        return Ok(envelopes);
    }

    /// Deletes the given envelopes, or every envelope for `None`, detaching their traces first
    pub fn delete_envelopes(&self, envelope_ids: Option<&[EnvelopeId]>) -> Result<()> {

        match envelope_ids {
            None => {
                self.conn.execute_batch("UPDATE Trace SET envelopeID = NULL; DELETE FROM Envelope;")?;
            },
            Some(ids) => {
                let mut nullify = self.conn.prepare_cached("UPDATE Trace SET envelopeID = NULL WHERE envelopeID = ?1;")?;
                let mut delete = self.conn.prepare_cached("DELETE FROM Envelope WHERE envelopeId = ?1;")?;
                for id in ids.iter() {
                    nullify.execute([id])?;
                    delete.execute([id])?;
                }
            },
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds(mz: f64, rt: f32) -> Bounds {

        return Bounds { mz_min: mz, mz_max: mz + 1.0, rt_min: rt, rt_max: rt + 1.0, int_min: 1.0, int_max: 2.0 };
    }

    #[test]
    fn quick_nodes_to_file_and_back_works() {

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.mzTree");

        {
            let store = MetadataStore::open(&path).unwrap();
            let root = store.insert_node(&bounds(1.0, 1.0), None, None).unwrap();
            let leaf_block = LeafBlock { file_offset: 48, count: 2 };
            let child = store.insert_node(&bounds(1.0, 1.5), Some(leaf_block), Some(root)).unwrap();
            store.update_node_point_ids(root, &[2, 3]).unwrap();
            store.update_node_point_ids(child, &[2, 3]).unwrap();
            store.close().unwrap();
        }

        let store = MetadataStore::open(&path).unwrap();
        let root = store.load_root().unwrap().unwrap();
        assert_eq!(root.parent_id, None);
        assert_eq!(root.block, None);

        let children = store.load_children(root.node_id).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].block, Some(LeafBlock { file_offset: 48, count: 2 }));
        assert_eq!(children[0].bounds.rt_min, 1.5);
        assert_eq!(store.load_node_point_ids(children[0].node_id).unwrap(), vec![2, 3]);
    }

    #[test]
    fn quick_unflushed_writes_are_dropped() {

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.mzTree");

        {
            let store = MetadataStore::open(&path).unwrap();
            store.insert_trace(1, 0).unwrap();
            store.flush().unwrap();
            store.insert_trace(2, 0).unwrap();
        }

        let store = MetadataStore::open(&path).unwrap();
        let map = store.load_trace_map().unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&1), Some(&0));
    }

    #[test]
    fn quick_foreign_sqlite_file_is_rejected() {

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.db");

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("CREATE TABLE stuff (x INTEGER);").unwrap();
        }
        assert!(matches!(MetadataStore::open(&path), Err(Error::NotThisFormat)));

        let path = dir.path().join("tagged.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA application_id = 42;").unwrap();
        }
        assert!(matches!(MetadataStore::open(&path), Err(Error::NotThisFormat)));
    }

    #[test]
    fn quick_versions_outside_the_chain_are_rejected() {

        let dir = tempfile::tempdir().unwrap();

        for version in [3, 9] {
            let path = dir.path().join(format!("v{}.mzTree", version));
            {
                let conn = Connection::open(&path).unwrap();
                conn.execute_batch(&format!("PRAGMA application_id = {}; PRAGMA user_version = {};", layout::APPLICATION_ID, version)).unwrap();
            }
            assert!(matches!(MetadataStore::open(&path), Err(Error::UnsupportedVersion(v)) if v == version));
        }
    }

    #[test]
    fn quick_version_4_file_is_migrated() {

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.mzTree");

        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(&format!("PRAGMA application_id = {}; PRAGMA user_version = 4;", layout::APPLICATION_ID)).unwrap();
            conn.execute_batch("CREATE TABLE Node (nodeId INTEGER PRIMARY KEY, mzMin DOUBLE NOT NULL, mzMax DOUBLE NOT NULL, rtMin FLOAT NOT NULL, rtMax FLOAT NOT NULL, intMin DOUBLE, intMax DOUBLE, parentId INTEGER, points BLOB);").unwrap();
            conn.execute_batch("INSERT INTO Node (mzMin, mzMax, rtMin, rtMax, intMin, intMax, parentId, points) VALUES (1.0, 2.0, 1.0, 2.0, 5.0, 6.0, NULL, NULL);").unwrap();
        }

        let store = MetadataStore::open(&path).unwrap();
        let root = store.load_root().unwrap().unwrap();
        assert_eq!(root.block, None);
        assert_eq!(root.bounds.mz_max, 2.0);
        store.close().unwrap();

        let conn = Connection::open(&path).unwrap();
        let version: i32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0)).unwrap();
        assert_eq!(version, layout::USER_VERSION);
    }

    #[test]
    fn quick_traces_and_envelopes() {

        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::open(&dir.path().join("data.mzTree")).unwrap();

        store.insert_trace(1, 0).unwrap();
        store.insert_trace(2, 7).unwrap();
        store.insert_trace(3, 0).unwrap();

        store.update_envelopes(7, &[1, 3]).unwrap();
        let map = store.load_trace_map().unwrap();
        assert_eq!(map.get(&1), Some(&7));
        assert_eq!(map.get(&3), Some(&7));

        store.update_envelopes(0, &[3]).unwrap();
        assert_eq!(store.load_trace_map().unwrap().get(&3), Some(&0));

        assert!(!store.traces_have_been_compiled().unwrap());
        let stats = TraceStats { centroid_mz: 500.5, min_rt: 1.0, max_rt: 2.0, intensity_sum: 40.0 };
        for trace in 1..=3 {
            store.update_trace_stats(trace, &stats).unwrap();
        }
        assert!(store.traces_have_been_compiled().unwrap());
        assert_eq!(store.load_traces(false).unwrap()[1].centroid_mz, Some(500.5));

        let mut envelope = Envelope::empty(8);
        envelope.charge_state = Some(2);
        envelope.relative_intensities = Some(vec![1.0, 0.5]);
        store.insert_envelope(&envelope).unwrap();
        assert_eq!(store.load_envelopes().unwrap().len(), 2);
        assert_eq!(store.load_envelopes().unwrap()[1], envelope);

        store.delete_envelopes(Some(&[7][..])).unwrap();
        assert_eq!(store.load_trace_map().unwrap().get(&2), Some(&0));
        assert_eq!(store.load_envelopes().unwrap().len(), 1);

        store.delete_trace(2).unwrap();
        assert!(!store.load_trace_map().unwrap().contains_key(&2));

        store.delete_envelopes(None).unwrap();
        store.delete_traces().unwrap();
        assert!(store.load_trace_map().unwrap().is_empty());
        assert!(store.load_envelopes().unwrap().is_empty());
    }
}
