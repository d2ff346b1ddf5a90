//! Side file that hands out untraced points in descending intensity order
//!
//! The file holds one run of point ids per construction partition, each run sorted by
//! descending intensity. Layout: run count (u32), run start offsets (u64 each), then the
//! concatenated runs of big endian u32 ids. A run ends where the next one starts, the last run
//! ends at the end of the file.

use byteorder::{ByteOrder, BigEndian};
use log::{info, warn};

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::cache::PointCache;
use crate::data::{Parser, Point, PointId, UNSAVED_POINT};
use crate::error::{Error, Result};
use crate::io::PointStore;
use crate::layout;

//ids fetched per seek while advancing a cursor
const CURSOR_READ_AHEAD: usize = 1024;

fn header_size(run_count: usize) -> u64 {

    return (layout::RUN_OFFSETS_START + run_count * layout::RUN_OFFSET_SIZE) as u64;
}

#[derive(Debug)]
pub struct IntensityIndex {
    path: PathBuf,
    file: File,
    run_starts: Vec<u64>,
    run_lengths: Vec<usize>,
    /// Position of the first possibly untraced id of each run, `None` once the run is used up
    cursors: Vec<Option<usize>>,
}

impl IntensityIndex {

    /// Opens an existing intensity file, cursors start at the top of every run
    pub fn open(path: &Path) -> Result<Self> {

        let mut file = OpenOptions::new()
            .read(true)
            .open(path)?;

        let file_len = file.metadata()?.len();

        let mut header = [0u8; layout::RUN_COUNT_SIZE];
        file.seek(SeekFrom::Start(layout::RUN_COUNT_START as u64))?;
        file.read_exact(&mut header)?;
        let run_count = BigEndian::read_u32(&header) as usize;

        if header_size(run_count) > file_len {
            return Err(Error::OutOfRange { id: run_count as u64, count: file_len });
        }

        let mut offsets = vec![0u8; run_count * layout::RUN_OFFSET_SIZE];
        file.read_exact(&mut offsets)?;

        let run_starts: Vec<u64> = offsets.chunks_exact(layout::RUN_OFFSET_SIZE).map(BigEndian::read_u64).collect();
        let run_lengths = Self::run_lengths(&run_starts, file_len);

        info!("Opened intensity index with {} runs", run_count);

        return Ok(Self {
            path: path.to_path_buf(),
            file,
            cursors: vec![Some(0); run_count],
            run_starts,
            run_lengths,
        });
    }

    fn run_lengths(run_starts: &[u64], file_len: u64) -> Vec<usize> {

        let mut lengths: Vec<usize> = Vec::with_capacity(run_starts.len());

        for (i, start) in run_starts.iter().enumerate() {
            let end = match run_starts.get(i + 1) {
                Some(next) => *next,
                None => file_len,
            };
            lengths.push((end.saturating_sub(*start) / layout::POINT_ID_SIZE as u64) as usize);
        }

        return lengths;
    }

    pub fn path(&self) -> &Path {
        return &self.path;
    }

    pub fn run_count(&self) -> usize {
        return self.run_starts.len();
    }

    /// Number of ids over all runs
    pub fn len(&self) -> usize {
        return self.run_lengths.iter().sum();
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    //reads up to `n` ids of `run` starting at position `index`
    fn read_ids(&mut self, run: usize, index: usize, n: usize) -> Result<Vec<PointId>> {

        let run_length = self.run_lengths[run];
        if index >= run_length {
            return Err(Error::OutOfRange { id: index as u64, count: run_length as u64 });
        }

        let n = n.min(run_length - index);
        let mut data = vec![0u8; n * layout::POINT_ID_SIZE];

        self.file.seek(SeekFrom::Start(self.run_starts[run] + (index * layout::POINT_ID_SIZE) as u64))?;
        self.file.read_exact(&mut data)?;

        return Ok(Parser::get_point_ids_from_blob(&data));
    }

    //moves the cursor of `run` forward to its first untraced point
    fn find_untraced(&mut self, run: usize, cache: &PointCache, store: &mut PointStore) -> Result<()> {

        let mut index = match self.cursors[run] {
            Some(index) => index,
            None => return Ok(()),
        };

        while index < self.run_lengths[run] {

            let ids = self.read_ids(run, index, CURSOR_READ_AHEAD)?;

            for id in ids.iter() {
                if !cache.get(*id, store)?.is_traced() {
                    self.cursors[run] = Some(index);
                    return Ok(());
                }
                index += 1;
            }
        }

        self.cursors[run] = None;

        Ok(())
    }

    fn find_all_untraced(&mut self, cache: &PointCache, store: &mut PointStore) -> Result<()> {

        for run in 0..self.run_count() {
            self.find_untraced(run, cache, store)?;
        }

        Ok(())
    }

    /// Resets every cursor to the top of its run and re-derives it
    ///
    /// Needed whenever points become untraced again, cursors only ever move forward.
    pub fn init_candidate_indexes(&mut self, cache: &PointCache, store: &mut PointStore) -> Result<()> {

        self.cursors = vec![Some(0); self.run_count()];

        return self.find_all_untraced(cache, store);
    }

    /// The most intense point without a trace, `None` once every point is traced
    pub fn get_highest_untraced(&mut self, cache: &PointCache, store: &mut PointStore) -> Result<Option<Point>> {

        self.find_all_untraced(cache, store)?;

        let mut best: Option<Point> = None;

        for run in 0..self.run_count() {

            let index = match self.cursors[run] {
                Some(index) => index,
                None => continue,
            };

            let id = match self.read_ids(run, index, 1)?.first() {
                Some(id) => *id,
                None => continue,
            };

            let candidate = cache.get(id, store)?;

            best = match best {
                Some(current) if current.intensity >= candidate.intensity => Some(current),
                _ => Some(candidate),
            };
        }

        return Ok(best);
    }

    /// Fraction of indexed points the cursors have moved past, 1.0 when nothing is indexed
    pub fn get_progress(&mut self, cache: &PointCache, store: &mut PointStore) -> Result<f64> {

        self.find_all_untraced(cache, store)?;

        let mut done = 0;
        let mut total = 0;

        for (cursor, run_length) in self.cursors.iter().zip(self.run_lengths.iter()) {
            total += run_length;
            done += match cursor {
                Some(index) => *index,
                None => *run_length,
            };
        }

        if total == 0 {
            return Ok(1.0);
        }

        return Ok(done as f64 / total as f64);
    }
}

/// Writes a fresh intensity file run by run
#[derive(Debug)]
pub struct IntensityIndexWriter {
    path: PathBuf,
    file: File,
    run_starts: Vec<u64>,
    run_count: usize,
    position: u64,
}

impl IntensityIndexWriter {

    /// Truncates `path` and reserves the header for `run_count` runs
    pub fn create(path: &Path, run_count: usize) -> Result<Self> {

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;

        let mut header = vec![0u8; header_size(run_count) as usize];
        BigEndian::write_u32(&mut header[layout::RUN_COUNT_START..layout::RUN_COUNT_START + layout::RUN_COUNT_SIZE], run_count as u32);

        file.write_all(&header)?;

        return Ok(Self {
            path: path.to_path_buf(),
            file,
            run_starts: Vec::with_capacity(run_count),
            run_count,
            position: header_size(run_count),
        });
    }

    /// Appends one run, ids must already be in descending intensity order
    pub fn add_run(&mut self, point_ids: &[PointId]) -> Result<()> {

        if self.run_starts.len() >= self.run_count {
            return Err(Error::OutOfRange { id: self.run_starts.len() as u64, count: self.run_count as u64 });
        }

        self.run_starts.push(self.position);

        self.file.seek(SeekFrom::Start(self.position))?;
        self.file.write_all(&Parser::point_ids_to_blob(point_ids))?;

        self.position += (point_ids.len() * layout::POINT_ID_SIZE) as u64;

        Ok(())
    }

    /// Writes the run offsets and reopens the file for reading
    pub fn finish(mut self) -> Result<IntensityIndex> {

        if self.run_starts.len() != self.run_count {
            warn!("Intensity index declared {} runs but {} were written", self.run_count, self.run_starts.len());
            while self.run_starts.len() < self.run_count {
                self.run_starts.push(self.position);
            }
        }

        let mut offsets = vec![0u8; self.run_count * layout::RUN_OFFSET_SIZE];
        BigEndian::write_u64_into(&self.run_starts, &mut offsets);

        self.file.seek(SeekFrom::Start(layout::RUN_OFFSETS_START as u64))?;
        self.file.write_all(&offsets)?;
        self.file.sync_all()?;

        return IntensityIndex::open(&self.path);
    }
}

/// Sorts points by descending intensity and returns their ids, ready for `add_run`
///
/// Points that never made it into the point file are left out.
pub fn intensity_run(points: &[Point]) -> Vec<PointId> {

    let mut sorted: Vec<&Point> = points.iter().filter(|p| p.id != UNSAVED_POINT).collect();
    sorted.sort_by(|a, b| b.intensity.total_cmp(&a.intensity));

    return sorted.into_iter().map(|p| p.id).collect();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;
    use kdam::tqdm;

    fn build(dir: &tempfile::TempDir, n: usize, runs: usize) -> (PointStore, IntensityIndex) {

        let mut store = PointStore::new(&dir.path().join("t-points"), true).unwrap();
        let mut rng = StdRng::seed_from_u64(21);

        let mut points: Vec<Point> = (0..n).map(|_| Point::new(rng.gen_range(100.0..2000.0), rng.gen_range(0.0..60.0), rng.gen_range(1.0..1e6))).collect();
        store.append_block(&mut points).unwrap();

        let mut writer = IntensityIndexWriter::create(&dir.path().join("t-intensity"), runs).unwrap();
        for chunk in points.chunks((n + runs - 1) / runs) {
            writer.add_run(&intensity_run(chunk)).unwrap();
        }

        return (store, writer.finish().unwrap());
    }

    #[test]
    fn quick_header_round_trip() {

        let dir = tempfile::tempdir().unwrap();
        let (_, index) = build(&dir, 1000, 3);

        assert_eq!(index.run_count(), 3);
        assert_eq!(index.len(), 1000);
        assert_eq!(index.run_lengths, vec![334, 334, 332]);
        assert_eq!(index.run_starts[0], header_size(3));

        let reopened = IntensityIndex::open(index.path()).unwrap();
        assert_eq!(reopened.run_starts, index.run_starts);
    }

    #[test]
    fn quick_consumption_is_monotonic() {

        let dir = tempfile::tempdir().unwrap();
        let (mut store, mut index) = build(&dir, 3000, 4);
        let cache = PointCache::new(10_000);

        let mut last = f64::MAX;
        let mut seen = 0;

        for _ in tqdm!(0..3000) {
            let point = index.get_highest_untraced(&cache, &mut store).unwrap().unwrap();
            assert!(point.intensity <= last);
            last = point.intensity;

            store.write_trace(point.id, 1).unwrap();
            cache.shallow_update_trace(point.id, 1);
            seen += 1;
        }

        assert_eq!(seen, 3000);
        assert!(index.get_highest_untraced(&cache, &mut store).unwrap().is_none());
        assert_eq!(index.get_progress(&cache, &mut store).unwrap(), 1.0);
    }

    #[test]
    fn quick_reset_finds_untraced_points_again() {

        let dir = tempfile::tempdir().unwrap();
        let (mut store, mut index) = build(&dir, 50, 2);
        let cache = PointCache::new(1000);

        let top = index.get_highest_untraced(&cache, &mut store).unwrap().unwrap();
        assert_eq!(index.get_progress(&cache, &mut store).unwrap(), 0.0);

        store.write_trace(top.id, 4).unwrap();
        cache.shallow_update_trace(top.id, 4);
        assert_ne!(index.get_highest_untraced(&cache, &mut store).unwrap().unwrap().id, top.id);
        assert_eq!(index.get_progress(&cache, &mut store).unwrap(), 1.0 / 50.0);

        //legacy unassigned marker counts as untraced
        store.write_trace(top.id, -1).unwrap();
        cache.shallow_update_trace(top.id, -1);
        index.init_candidate_indexes(&cache, &mut store).unwrap();
        assert_eq!(index.get_highest_untraced(&cache, &mut store).unwrap().unwrap().id, top.id);
    }

    #[test]
    fn quick_empty_index() {

        let dir = tempfile::tempdir().unwrap();
        let mut store = PointStore::new(&dir.path().join("e-points"), true).unwrap();
        let cache = PointCache::new(10);

        let writer = IntensityIndexWriter::create(&dir.path().join("e-intensity"), 0).unwrap();
        let mut index = writer.finish().unwrap();

        assert!(index.is_empty());
        assert!(index.get_highest_untraced(&cache, &mut store).unwrap().is_none());
        assert_eq!(index.get_progress(&cache, &mut store).unwrap(), 1.0);
    }

    #[test]
    fn quick_run_skips_unsaved_points() {

        let mut points = vec![
            Point::new(100.0, 1.0, 5.0),
            Point::new(101.0, 1.0, 50.0),
            Point::new(102.0, 1.0, 20.0),
        ];
        points[0].id = 7;
        points[1].id = UNSAVED_POINT;
        points[2].id = 9;

        assert_eq!(intensity_run(&points), vec![9, 7]);
    }
}
