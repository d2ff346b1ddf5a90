//! Handles read and write of point records in the flat point file
//!
//! Points are stored as fixed 24 byte records addressed by sequential id, so a point lives at
//! `id * 24` and a leaf's points form one contiguous block that loads with a single seek.

use crate::error::{Error, Result};
use crate::data::{Point, PointId, TraceId, NO_TRACE, Parser};
use crate::layout;
use byteorder::{ByteOrder, BigEndian};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

//records rewritten per read when scanning the whole file
const SCAN_CHUNK_POINTS: usize = 8192;

#[derive(Debug)]
pub struct PointStore {
    path: PathBuf,
    file: File,
    count: u32,
}

impl PointStore {

    /// Opens the point file at `path`, truncating it first when `create` is set
    pub fn new(path: &Path, create: bool) -> Result<Self> {

        let file = match create {
            true => {
                OpenOptions::new()
                    .create(true)
                    .read(true)
                    .write(true)
                    .truncate(true)
                    .open(path)?
            },
            false => {
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(path)?
            },
        };

        let count = (file.metadata()?.len() / layout::POINT_SIZE as u64) as u32;

        return Ok(Self {
            path: path.to_path_buf(),
            file,
            count,
        });
    }

    pub fn path(&self) -> &Path {
        return &self.path;
    }

    pub fn len(&self) -> usize {
        return self.count as usize;
    }

    pub fn is_empty(&self) -> bool {
        return self.count == 0;
    }

    /// Pre-extends the file for `n` more points ahead of a bulk load
    pub fn reserve(&mut self, n: usize) -> Result<()> {

        let wanted = layout::point_offset(self.count) + (n * layout::POINT_SIZE) as u64;

        if self.file.metadata()?.len() < wanted {
            self.file.set_len(wanted)?;
        }

        Ok(())
    }

    /// Appends one point, assigning and returning its id
    pub fn append(&mut self, point: &mut Point) -> Result<PointId> {

        let id = self.count;
        point.id = id;

        self.file.seek(SeekFrom::Start(layout::point_offset(id)))?;
        self.file.write_all(&point.to_arr())?;

        self.count += 1;

        return Ok(id);
    }

    /// Appends `points` as one contiguous block, assigning sequential ids
    ///
    /// Returns the byte offset of the block. Ids are only assigned once the write succeeded.
    pub fn append_block(&mut self, points: &mut [Point]) -> Result<u64> {

        let start = layout::point_offset(self.count);

        let mut data: Vec<u8> = Vec::with_capacity(points.len() * layout::POINT_SIZE);
        for (i, point) in points.iter().enumerate() {
            let mut record = *point;
            record.id = self.count + i as u32;
            data.extend_from_slice(&record.to_arr());
        }

        self.file.seek(SeekFrom::Start(start))?;
        self.file.write_all(&data)?;

        for point in points.iter_mut() {
            point.id = self.count;
            self.count += 1;
        }

        return Ok(start);
    }

    fn check_range(&self, id: PointId, n: usize) -> Result<()> {

        if id as u64 + n as u64 > self.count as u64 {
            return Err(Error::OutOfRange { id: id as u64 + n.saturating_sub(1) as u64, count: self.count as u64 });
        }

        Ok(())
    }

    pub fn read(&mut self, id: PointId) -> Result<Point> {

        self.check_range(id, 1)?;

        let mut record = [0u8; layout::POINT_SIZE];
        self.file.seek(SeekFrom::Start(layout::point_offset(id)))?;
        self.file.read_exact(&mut record)?;

        return Point::from_slice(id, &record);
    }

    /// Reads `count` consecutive points starting at byte offset `start_offset`
    pub fn read_block(&mut self, start_offset: u64, count: usize) -> Result<Vec<Point>> {

        if start_offset % layout::POINT_SIZE as u64 != 0 {
            return Err(Error::OutOfRange { id: start_offset / layout::POINT_SIZE as u64, count: self.count as u64 });
        }

        let first_id = layout::point_id_at(start_offset);
        self.check_range(first_id, count)?;

        let mut data: Vec<u8> = vec![0; count * layout::POINT_SIZE];
        self.file.seek(SeekFrom::Start(start_offset))?;
        self.file.read_exact(&mut data)?;

        let mut points: Vec<Point> = Vec::with_capacity(count);
        for (i, record) in data.chunks_exact(layout::POINT_SIZE).enumerate() {
            points.push(Point::from_slice(first_id + i as u32, record)?);
        }

        return Ok(points);
    }

    /// Reads arbitrary points, coalescing consecutive ids into block reads
    ///
    /// The result follows the order of `ids`.
    pub fn read_many(&mut self, ids: &[PointId]) -> Result<Vec<Point>> {

        let mut sorted: Vec<PointId> = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut loaded: HashMap<PointId, Point> = HashMap::with_capacity(sorted.len());

        let mut i = 0;
        while i < sorted.len() {
            let mut j = i + 1;
            while j < sorted.len() && sorted[j] == sorted[j - 1] + 1 {
                j += 1;
            }

            let block = self.read_block(layout::point_offset(sorted[i]), j - i)?;
            for point in block {
                loaded.insert(point.id, point);
            }

            i = j;
        }

        let mut points: Vec<Point> = Vec::with_capacity(ids.len());
        for id in ids.iter() {
            match loaded.get(id) {
                Some(point) => points.push(*point),
                None => return Err(Error::OutOfRange { id: *id as u64, count: self.count as u64 }),
            }
        }

        return Ok(points);
    }

    /// Overwrites the trace field of one record, the only mutable part of a point
    pub fn write_trace(&mut self, id: PointId, trace_id: TraceId) -> Result<()> {

        self.check_range(id, 1)?;

        let mut arr = [0u8; layout::TRACE_SIZE];
        BigEndian::write_i32(&mut arr, trace_id);

        self.file.seek(SeekFrom::Start(layout::point_offset(id) + layout::TRACE_START as u64))?;
        self.file.write_all(&arr)?;

        Ok(())
    }

    /// Rewrites trace fields chunk by chunk, `f` returns the new trace for an old one
    fn rewrite_traces<F>(&mut self, f: F) -> Result<usize>
    where F: Fn(TraceId) -> Option<TraceId> {

        let mut changed = 0;
        let mut first: u32 = 0;

        while (first as usize) < self.len() {

            let n = SCAN_CHUNK_POINTS.min(self.len() - first as usize);
            let start = layout::point_offset(first);

            let mut data: Vec<u8> = vec![0; n * layout::POINT_SIZE];
            self.file.seek(SeekFrom::Start(start))?;
            self.file.read_exact(&mut data)?;

            let mut dirty = false;
            for record in data.chunks_exact_mut(layout::POINT_SIZE) {
                let old = Parser::get_i32_from_array(record, layout::TRACE_START);
                if let Some(new) = f(old) {
                    BigEndian::write_i32(&mut record[layout::TRACE_START..layout::TRACE_START + layout::TRACE_SIZE], new);
                    dirty = true;
                    changed += 1;
                }
            }

            if dirty {
                self.file.seek(SeekFrom::Start(start))?;
                self.file.write_all(&data)?;
            }

            first += n as u32;
        }

        return Ok(changed);
    }

    /// Resets every reference to `trace_id` back to no trace, returns how many were reset
    pub fn clear_trace(&mut self, trace_id: TraceId) -> Result<usize> {

        return self.rewrite_traces(|old| if old == trace_id { Some(NO_TRACE) } else { None });
    }

    pub fn clear_traces(&mut self) -> Result<usize> {

        return self.rewrite_traces(|old| if old != NO_TRACE { Some(NO_TRACE) } else { None });
    }

    /// Syncs the file, dropping any reserved space past the last written record
    pub fn flush(&mut self) -> Result<()> {

        let written = layout::point_offset(self.count);
        if self.file.metadata()?.len() > written {
            self.file.set_len(written)?;
        }

        self.file.flush()?;
        self.file.sync_all()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};
    use rand::rngs::StdRng;

    fn random_points(n: usize, seed: u64) -> Vec<Point> {

        let mut rng = StdRng::seed_from_u64(seed);
        return (0..n).map(|_| Point::new(rng.gen_range(100.0..2000.0), rng.gen_range(0.0..60.0), rng.gen_range(1.0..1e6))).collect();
    }

    #[test]
    fn quick_block_round_trip() {

        let dir = tempfile::tempdir().unwrap();
        let mut store = PointStore::new(&dir.path().join("points"), true).unwrap();

        let mut points = random_points(1000, 1);
        points[17].trace_id = 4;
        store.reserve(points.len()).unwrap();
        let offset = store.append_block(&mut points).unwrap();

        assert_eq!(offset, 0);
        assert_eq!(store.len(), 1000);

        store.write_trace(17, 9).unwrap();

        let back = store.read_block(0, 1000).unwrap();
        for (i, (a, b)) in points.iter().zip(back.iter()).enumerate() {
            assert_eq!(b.id, i as u32);
            assert_eq!(a.mz.to_bits(), b.mz.to_bits());
            assert_eq!(a.rt.to_bits(), b.rt.to_bits());
            assert_eq!(a.intensity.to_bits(), b.intensity.to_bits());
        }
        assert_eq!(back[17].trace_id, 9);
        assert_eq!(back[18].trace_id, 0);
    }

    #[test]
    fn quick_second_block_continues_ids() {

        let dir = tempfile::tempdir().unwrap();
        let mut store = PointStore::new(&dir.path().join("points"), true).unwrap();

        let mut first = random_points(5, 2);
        let mut second = random_points(3, 3);
        store.append_block(&mut first).unwrap();
        let offset = store.append_block(&mut second).unwrap();

        assert_eq!(offset, 5 * 24);
        assert_eq!(second.iter().map(|p| p.id).collect::<Vec<_>>(), vec![5, 6, 7]);

        let block = store.read_block(offset, 3).unwrap();
        assert_eq!(block, second);
    }

    #[test]
    fn quick_out_of_range_reads_fail() {

        let dir = tempfile::tempdir().unwrap();
        let mut store = PointStore::new(&dir.path().join("points"), true).unwrap();

        let mut points = random_points(4, 4);
        store.append_block(&mut points).unwrap();

        assert!(store.read(3).is_ok());
        assert!(matches!(store.read(4), Err(Error::OutOfRange { .. })));
        assert!(matches!(store.read_block(48, 3), Err(Error::OutOfRange { .. })));
        assert!(matches!(store.read_block(5, 1), Err(Error::OutOfRange { .. })));
        assert!(store.write_trace(10, 1).is_err());
    }

    #[test]
    fn quick_read_many_keeps_request_order() {

        let dir = tempfile::tempdir().unwrap();
        let mut store = PointStore::new(&dir.path().join("points"), true).unwrap();

        let mut points = random_points(50, 5);
        store.append_block(&mut points).unwrap();

        let ids = vec![40, 2, 3, 4, 41, 2];
        let read = store.read_many(&ids).unwrap();

        assert_eq!(read.iter().map(|p| p.id).collect::<Vec<_>>(), ids);
        assert_eq!(read[0], points[40]);
    }

    #[test]
    fn quick_clear_trace_only_touches_matching_records() {

        let dir = tempfile::tempdir().unwrap();
        let mut store = PointStore::new(&dir.path().join("points"), true).unwrap();

        let mut points = random_points(20_000, 6);
        for (i, point) in points.iter_mut().enumerate() {
            point.trace_id = (i % 3) as i32;
        }
        store.append_block(&mut points).unwrap();

        let cleared = store.clear_trace(2).unwrap();
        assert_eq!(cleared, points.iter().filter(|p| p.trace_id == 2).count());

        let back = store.read_block(0, points.len()).unwrap();
        assert!(back.iter().all(|p| p.trace_id != 2));
        assert_eq!(back[1].trace_id, 1);

        store.clear_traces().unwrap();
        let back = store.read_block(0, points.len()).unwrap();
        assert!(back.iter().all(|p| p.trace_id == 0));
    }

    #[test]
    fn quick_reopen_counts_points() {

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points");

        {
            let mut store = PointStore::new(&path, true).unwrap();
            let mut point = Point::new(500.0, 1.0, 10.0);
            store.append(&mut point).unwrap();
            store.append(&mut point).unwrap();
            assert_eq!(point.id, 1);
            store.flush().unwrap();
        }

        let mut store = PointStore::new(&path, false).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.read(1).unwrap().mz, 500.0);
    }

    #[test]
    fn quick_flush_drops_unused_reservation() {

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("points");

        {
            let mut store = PointStore::new(&path, true).unwrap();
            store.reserve(10).unwrap();

            let mut points = random_points(4, 7);
            store.append_block(&mut points).unwrap();
            store.flush().unwrap();
        }

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 * 24);

        let store = PointStore::new(&path, false).unwrap();
        assert_eq!(store.len(), 4);
    }
}
