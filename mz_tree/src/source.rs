//! Upstream point sources a tree is built from
//!
//! A source hands out its points either all at once or in bounded chunks, so that a
//! partitioned build never holds more than one partition in memory.

use log::{debug, warn};

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};

use crate::data::{EnvelopeId, Point, TraceId, is_unassigned, NO_ENVELOPE};
use crate::error::{Error, Result};

pub trait PointSource {

    /// Total number of points the source will produce
    fn count_points(&mut self) -> Result<usize>;

    /// Every point, from the start of the source
    fn read_all(&mut self) -> Result<Vec<Point>>;

    /// The next `n` points, fewer at the end of the source
    fn read_partition(&mut self, n: usize) -> Result<Vec<Point>>;

    /// Whether points arrive in non-decreasing retention time order
    fn is_rt_ordered(&self) -> bool;

    /// Trace to envelope pairs found while reading, drained by the caller
    fn take_traces(&mut self) -> HashMap<TraceId, EnvelopeId>;
}

fn is_rt_sorted(points: &[Point]) -> bool {

    return points.windows(2).all(|w| w[0].rt <= w[1].rt);
}

/// Points already held in memory
#[derive(Debug, Default)]
pub struct MemorySource {
    points: Vec<Point>,
    position: usize,
    rt_ordered: bool,
    traces: HashMap<TraceId, EnvelopeId>,
}

impl MemorySource {

    pub fn new(points: Vec<Point>) -> Self {

        let mut traces = HashMap::new();
        for point in points.iter() {
            if !is_unassigned(point.trace_id) {
                traces.insert(point.trace_id, NO_ENVELOPE);
            }
        }

        return Self {
            rt_ordered: is_rt_sorted(&points),
            points,
            position: 0,
            traces,
        };
    }
}

impl PointSource for MemorySource {

    fn count_points(&mut self) -> Result<usize> {
        return Ok(self.points.len());
    }

    fn read_all(&mut self) -> Result<Vec<Point>> {

        self.position = self.points.len();
        return Ok(self.points.clone());
    }

    fn read_partition(&mut self, n: usize) -> Result<Vec<Point>> {

        let end = (self.position + n).min(self.points.len());
        let partition = self.points[self.position..end].to_vec();
        self.position = end;

        return Ok(partition);
    }

    fn is_rt_ordered(&self) -> bool {
        return self.rt_ordered;
    }

    fn take_traces(&mut self) -> HashMap<TraceId, EnvelopeId> {
        return std::mem::take(&mut self.traces);
    }
}

fn read_lines<P>(filename: P) -> io::Result<io::Lines<io::BufReader<File>>>
where P: AsRef<Path>, {
    let file = File::open(filename)?;
    Ok(io::BufReader::new(file).lines())
}

/// Rows of `mz,rt,intensity[,traceID[,envelopeID]]`
///
/// A leading header row is skipped, missing trailing columns default to 0.
#[derive(Debug)]
pub struct CsvSource {
    path: PathBuf,
    lines: Option<io::Lines<io::BufReader<File>>>,
    line_number: usize,
    count: Option<usize>,
    rt_ordered: bool,
    traces: HashMap<TraceId, EnvelopeId>,
}

impl CsvSource {

    pub fn new(path: &Path) -> Result<Self> {

        return Ok(Self {
            path: path.to_path_buf(),
            lines: Some(read_lines(path)?),
            line_number: 0,
            count: None,
            rt_ordered: false,
            traces: HashMap::new(),
        });
    }

    fn rewind(&mut self) -> Result<()> {

        self.lines = Some(read_lines(&self.path)?);
        self.line_number = 0;

        Ok(())
    }

    /// Parses one row into a point and its envelope id, `None` for blank lines and the header
    fn parse_line(line: &str, line_number: usize) -> Result<Option<(Point, EnvelopeId)>> {

        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let fields: Vec<&str> = line.split(',').map(|f| f.trim()).collect();

        let mz = match fields[0].parse::<f64>() {
            Ok(mz) => mz,
            Err(_) if line_number == 1 => return Ok(None),
            Err(e) => return Err(Error::Parse { line: line_number, message: format!("bad m/z '{}': {}", fields[0], e) }),
        };

        if fields.len() < 3 {
            return Err(Error::Parse { line: line_number, message: format!("expected at least 3 fields, found {}", fields.len()) });
        }

        let rt = fields[1].parse::<f32>()
            .map_err(|e| Error::Parse { line: line_number, message: format!("bad RT '{}': {}", fields[1], e) })?;
        let intensity = fields[2].parse::<f64>()
            .map_err(|e| Error::Parse { line: line_number, message: format!("bad intensity '{}': {}", fields[2], e) })?;

        let optional_i32 = |i: usize| -> Result<i32> {
            return match fields.get(i) {
                Some(field) if !field.is_empty() => field.parse::<i32>()
                    .map_err(|e| Error::Parse { line: line_number, message: format!("bad id '{}': {}", field, e) }),
                _ => Ok(0),
            };
        };

        let trace_id = optional_i32(3)?;
        let envelope_id = optional_i32(4)?;

        return Ok(Some((Point::new(mz, rt, intensity).with_trace(trace_id), envelope_id)));
    }

    fn next_point(&mut self) -> Result<Option<Point>> {

        loop {
            let line = match self.lines.as_mut().and_then(|lines| lines.next()) {
                Some(line) => line?,
                None => return Ok(None),
            };
            self.line_number += 1;

            if let Some((point, envelope_id)) = Self::parse_line(&line, self.line_number)? {

                if !is_unassigned(point.trace_id) {
                    self.traces.insert(point.trace_id, envelope_id);
                }

                return Ok(Some(point));
            }
        }
    }
}

impl PointSource for CsvSource {

    /// Scans the whole file once, also deciding whether rows are in RT order
    fn count_points(&mut self) -> Result<usize> {

        if let Some(count) = self.count {
            return Ok(count);
        }

        self.rewind()?;

        let mut count = 0;
        let mut last_rt = f32::MIN;
        let mut rt_ordered = true;

        while let Some(point) = self.next_point()? {
            count += 1;
            if point.rt < last_rt {
                rt_ordered = false;
            }
            last_rt = point.rt;
        }

        debug!("Counted {} points in {:?}, rt ordered: {}", count, self.path, rt_ordered);

        self.rewind()?;
        self.count = Some(count);
        self.rt_ordered = rt_ordered;

        return Ok(count);
    }

    fn read_all(&mut self) -> Result<Vec<Point>> {

        self.rewind()?;

        let mut points: Vec<Point> = Vec::with_capacity(self.count.unwrap_or(0));
        while let Some(point) = self.next_point()? {
            points.push(point);
        }

        if self.count.is_none() {
            self.rt_ordered = is_rt_sorted(&points);
            self.count = Some(points.len());
        }

        return Ok(points);
    }

    fn read_partition(&mut self, n: usize) -> Result<Vec<Point>> {

        let mut points: Vec<Point> = Vec::with_capacity(n);

        while points.len() < n {
            match self.next_point()? {
                Some(point) => points.push(point),
                None => break,
            }
        }

        if points.len() < n {
            warn!("Point source ended early, wanted {} points and read {}", n, points.len());
        }

        return Ok(points);
    }

    fn is_rt_ordered(&self) -> bool {
        return self.rt_ordered;
    }

    fn take_traces(&mut self) -> HashMap<TraceId, EnvelopeId> {
        return std::mem::take(&mut self.traces);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_csv(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {

        let path = dir.path().join(name);
        let mut file = File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        return path;
    }

    #[test]
    fn quick_csv_rows_with_header_and_defaults() {

        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(&dir, "a.csv", "mz,rt,intensity,trace,envelope\n100.5,1.0,20\n101.5,2.0,30,4,9\n\n102.5,2.5,40,5\n");

        let mut source = CsvSource::new(&path).unwrap();
        assert_eq!(source.count_points().unwrap(), 3);
        assert!(source.is_rt_ordered());

        let points = source.read_all().unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].trace_id, 0);
        assert_eq!(points[1].trace_id, 4);
        assert_eq!(points[1].id, 0);
        assert_eq!(points[2].intensity, 40.0);

        let traces = source.take_traces();
        assert_eq!(traces.get(&4), Some(&9));
        assert_eq!(traces.get(&5), Some(&0));
        assert!(source.take_traces().is_empty());
    }

    #[test]
    fn quick_csv_partitions_and_order() {

        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(&dir, "b.csv", "1,5,1\n2,4,1\n3,3,1\n4,2,1\n5,1,1\n");

        let mut source = CsvSource::new(&path).unwrap();
        assert_eq!(source.count_points().unwrap(), 5);
        assert!(!source.is_rt_ordered());

        assert_eq!(source.read_partition(2).unwrap().len(), 2);
        assert_eq!(source.read_partition(2).unwrap()[0].mz, 3.0);
        assert_eq!(source.read_partition(2).unwrap().len(), 1);
        assert!(source.read_partition(2).unwrap().is_empty());
    }

    #[test]
    fn quick_csv_bad_row_is_reported() {

        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(&dir, "c.csv", "1,1,1\n2,oops,1\n");

        let mut source = CsvSource::new(&path).unwrap();
        assert!(matches!(source.read_all(), Err(Error::Parse { line: 2, .. })));
    }

    #[test]
    fn quick_memory_source() {

        let points = vec![
            Point::new(1.0, 1.0, 1.0),
            Point::new(2.0, 2.0, 1.0).with_trace(3),
            Point::new(3.0, 2.0, 1.0).with_trace(-1),
        ];

        let mut source = MemorySource::new(points);
        assert!(source.is_rt_ordered());
        assert_eq!(source.count_points().unwrap(), 3);
        assert_eq!(source.read_partition(2).unwrap().len(), 2);
        assert_eq!(source.read_partition(2).unwrap().len(), 1);
        assert_eq!(source.take_traces().len(), 1);
    }
}
