//! Writes selections of a tree to CSV
//!
//! Ranges are walked in retention time slices of `PARTITION_LENGTH` so that a large selection
//! never has to be held in memory at once.

use log::info;

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::data::{DataRange, NO_ENVELOPE};
use crate::error::Result;
use crate::tree::Tree;

/// RT width of one export slice
pub const PARTITION_LENGTH: f32 = 5.0;

pub const POINTS_HEADER: &str = "m/z,RT,intensity,traceID,envelopeID";
pub const TRACES_HEADER: &str = "traceID,envelopeID,centroidMZ,minRT,maxRT,intensitySum";

fn optional<T: ToString>(value: Option<T>) -> String {

    return value.map(|v| v.to_string()).unwrap_or_default();
}

#[derive(Debug)]
pub struct CsvExporter {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl CsvExporter {

    /// Creates the output file, appending a `.csv` extension when missing
    pub fn create(path: &Path) -> Result<Self> {

        let path = match path.extension().map(|e| e.eq_ignore_ascii_case("csv")) {
            Some(true) => path.to_path_buf(),
            _ => {
                let mut name = path.as_os_str().to_os_string();
                name.push(".csv");
                PathBuf::from(name)
            },
        };

        let file = File::create(&path)?;

        return Ok(Self {
            path,
            writer: BufWriter::new(file),
        });
    }

    pub fn path(&self) -> &Path {
        return &self.path;
    }

    /// Writes every point of `ranges`, optionally only points that belong to a trace
    ///
    /// Returns the number of points written.
    pub fn export(&mut self, tree: &mut Tree, ranges: &[DataRange], only_traced: bool) -> Result<usize> {

        writeln!(self.writer, "{}", POINTS_HEADER)?;

        let mut num_points = 0;
        for range in ranges.iter() {
            num_points += self.export_range(tree, range, only_traced)?;
        }

        self.writer.flush()?;

        info!("Exported {} points to {:?}", num_points, self.path);

        return Ok(num_points);
    }

    fn export_range(&mut self, tree: &mut Tree, range: &DataRange, only_traced: bool) -> Result<usize> {

        let range = match tree.data_bounds() {
            Some(bounds) => range.or_bounds_of(&bounds),
            None => return Ok(0),
        };

        let mut num_points = 0;
        let mut slice_start = range.rt_min;

        loop {

            //slices are half open except the last one
            let slice_end = slice_start + PARTITION_LENGTH;
            let last = slice_end >= range.rt_max;

            let slice = DataRange::new(range.mz_min, range.mz_max, slice_start, match last {
                true => range.rt_max,
                false => slice_end,
            });

            let points = tree.query_range(&slice)?;

            for point in points.iter() {

                if !last && point.rt >= slice_end {
                    continue;
                }
                if only_traced && !point.is_traced() {
                    continue;
                }

                let envelope_id = tree.trace_map().get(&point.trace_id).copied().unwrap_or(NO_ENVELOPE);
                writeln!(self.writer, "{},{},{},{},{}", point.mz, point.rt, point.intensity, point.trace_id, envelope_id)?;
                num_points += 1;
            }

            if last {
                break;
            }
            slice_start = slice_end;
        }

        return Ok(num_points);
    }

    /// Writes one row per trace, compiling the trace statistics first when needed
    pub fn export_traces(&mut self, tree: &mut Tree) -> Result<usize> {

        if !tree.traces_have_been_compiled()? {
            tree.compile_traces()?;
        }

        writeln!(self.writer, "{}", TRACES_HEADER)?;

        let traces = tree.traces()?;
        for trace in traces.iter() {
            writeln!(self.writer, "{},{},{},{},{},{}",
                trace.trace_id,
                trace.envelope_id,
                optional(trace.centroid_mz),
                optional(trace.min_rt),
                optional(trace.max_rt),
                optional(trace.intensity_sum))?;
        }

        self.writer.flush()?;

        info!("Exported {} traces to {:?}", traces.len(), self.path);

        return Ok(traces.len());
    }

    pub fn close(mut self) -> Result<()> {

        self.writer.flush()?;

        Ok(())
    }
}
