use byteorder::{ByteOrder, BigEndian};
use serde::{Serialize, Deserialize};
use crate::layout;
use crate::error::{Error, Result};

pub type PointId = u32;
pub type TraceId = i32;
pub type EnvelopeId = i32;

/// Trace id of a point nobody has classified yet
pub const NO_TRACE: TraceId = 0;

/// Legacy "explicitly unassigned" trace id, treated exactly like `NO_TRACE`
pub const LEGACY_NO_TRACE: TraceId = -1;

/// Envelope id of a trace that belongs to no envelope
pub const NO_ENVELOPE: EnvelopeId = 0;

/// Id carried by a point whose record could not be written to the point file
pub const UNSAVED_POINT: PointId = PointId::MAX;

/// One centroided sample of the instrument output
///
/// Only `trace_id` ever changes after the point is first persisted. The `id` is assigned by the
/// point store when the point is written and is the point's record index in the point file.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct Point {
    pub id: PointId,
    pub mz: f64,
    pub rt: f32,
    pub intensity: f64,
    pub trace_id: TraceId,
}

impl Point {

    pub fn new(mz: f64, rt: f32, intensity: f64) -> Self {

        return Self {
            id: 0,
            mz,
            rt,
            intensity,
            trace_id: NO_TRACE,
        };
    }

    pub fn with_trace(mut self, trace_id: TraceId) -> Self {

        self.trace_id = trace_id;
        return self;
    }

    /// Whether the point belongs to a trace, -1 counts as untraced
    pub fn is_traced(&self) -> bool {

        return !is_unassigned(self.trace_id);
    }

    pub fn in_range(&self, range: &DataRange) -> bool {

        return range.contains(self.mz, self.rt);
    }

    pub fn to_arr(&self) -> [u8; layout::POINT_SIZE] {

        let mut arr = [0u8; layout::POINT_SIZE];

        BigEndian::write_f64(&mut arr[layout::MZ_START..layout::MZ_START + layout::MZ_SIZE], self.mz);
        BigEndian::write_f32(&mut arr[layout::RT_START..layout::RT_START + layout::RT_SIZE], self.rt);
        BigEndian::write_f64(&mut arr[layout::INTENSITY_START..layout::INTENSITY_START + layout::INTENSITY_SIZE], self.intensity);
        BigEndian::write_i32(&mut arr[layout::TRACE_START..layout::TRACE_START + layout::TRACE_SIZE], self.trace_id);

        return arr;
    }

    /// Decodes one 24 byte record, the id is not part of the record and comes from its offset
    pub fn from_slice(id: PointId, record_slice: &[u8]) -> Result<Self> {

        if record_slice.len() < layout::POINT_SIZE {
            return Err(Error::OutOfRange { id: id as u64, count: (record_slice.len() / layout::POINT_SIZE) as u64 });
        }

        return Ok(Self {
            id,
            mz: Parser::get_f64_from_array(record_slice, layout::MZ_START),
            rt: Parser::get_f32_from_array(record_slice, layout::RT_START),
            intensity: Parser::get_f64_from_array(record_slice, layout::INTENSITY_START),
            trace_id: Parser::get_i32_from_array(record_slice, layout::TRACE_START),
        });
    }
}

/// True for both spellings of "no trace"
pub fn is_unassigned(trace_id: TraceId) -> bool {

    return trace_id == NO_TRACE || trace_id == LEGACY_NO_TRACE;
}

/// An inclusive m/z by RT box
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct DataRange {
    pub mz_min: f64,
    pub mz_max: f64,
    pub rt_min: f32,
    pub rt_max: f32,
}

impl DataRange {

    pub fn new(mz_min: f64, mz_max: f64, rt_min: f32, rt_max: f32) -> Self {

        return Self { mz_min, mz_max, rt_min, rt_max };
    }

    pub fn contains(&self, mz: f64, rt: f32) -> bool {

        return mz >= self.mz_min && mz <= self.mz_max && rt >= self.rt_min && rt <= self.rt_max;
    }

    /// Replaces every bound equal to zero with the matching bound of `outer`
    pub fn or_bounds_of(&self, outer: &DataRange) -> Self {

        let pick_f64 = |v: f64, fallback: f64| if v == 0.0 { fallback } else { v };
        let pick_f32 = |v: f32, fallback: f32| if v == 0.0 { fallback } else { v };

        return Self {
            mz_min: pick_f64(self.mz_min, outer.mz_min),
            mz_max: pick_f64(self.mz_max, outer.mz_max),
            rt_min: pick_f32(self.rt_min, outer.rt_min),
            rt_max: pick_f32(self.rt_max, outer.rt_max),
        };
    }
}

/// A trace row of the metadata store
///
/// The compiled statistics stay `None` until the trace has been compiled.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct TraceRecord {
    pub trace_id: TraceId,
    pub envelope_id: EnvelopeId,
    pub centroid_mz: Option<f64>,
    pub min_rt: Option<f32>,
    pub max_rt: Option<f32>,
    pub intensity_sum: Option<f64>,
}

/// Compiled statistics of one trace
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct TraceStats {
    pub centroid_mz: f64,
    pub min_rt: f32,
    pub max_rt: f32,
    pub intensity_sum: f64,
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub envelope_id: EnvelopeId,
    pub charge_state: Option<i32>,
    pub monoisotopic_mz: Option<f64>,
    pub intensity_sum: Option<f64>,
    pub relative_intensities: Option<Vec<f64>>,
}

impl Envelope {

    pub fn empty(envelope_id: EnvelopeId) -> Self {

        return Self {
            envelope_id,
            charge_state: None,
            monoisotopic_mz: None,
            intensity_sum: None,
            relative_intensities: None,
        };
    }
}

pub struct Parser {}

impl Parser {

    pub fn get_f64_from_array(data: &[u8], offset: usize) -> f64 {
        return BigEndian::read_f64(&data[offset..offset + 8]);
    }

    pub fn get_f32_from_array(data: &[u8], offset: usize) -> f32 {
        return BigEndian::read_f32(&data[offset..offset + 4]);
    }

    pub fn get_i32_from_array(data: &[u8], offset: usize) -> i32 {
        return BigEndian::read_i32(&data[offset..offset + 4]);
    }

    /// Unpacks a node's point id blob
    pub fn get_point_ids_from_blob(blob: &[u8]) -> Vec<PointId> {

        return blob.chunks_exact(layout::POINT_ID_SIZE).map(BigEndian::read_u32).collect();
    }

    /// Packs point ids as fixed width big endian integers
    pub fn point_ids_to_blob(ids: &[PointId]) -> Vec<u8> {

        let mut blob = vec![0u8; ids.len() * layout::POINT_ID_SIZE];
        BigEndian::write_u32_into(ids, &mut blob);
        return blob;
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn quick_point_record_layout_is_big_endian() {

        let point = Point::new(1.5, 2.25, 1000.0).with_trace(-7);
        let arr = point.to_arr();

        assert_eq!(&arr[0..8], &1.5f64.to_be_bytes());
        assert_eq!(&arr[8..12], &2.25f32.to_be_bytes());
        assert_eq!(&arr[12..20], &1000.0f64.to_be_bytes());
        assert_eq!(&arr[20..24], &(-7i32).to_be_bytes());

        let back = Point::from_slice(42, &arr).unwrap();
        assert_eq!(back.id, 42);
        assert_eq!(back.trace_id, -7);
        assert_eq!(back.mz, 1.5);
    }

    #[test]
    fn quick_short_record_is_rejected() {

        let arr = [0u8; 10];
        assert!(matches!(Point::from_slice(0, &arr), Err(Error::OutOfRange { .. })));
    }

    #[test]
    fn quick_legacy_trace_counts_as_unassigned() {

        assert!(!Point::new(1.0, 1.0, 1.0).is_traced());
        assert!(!Point::new(1.0, 1.0, 1.0).with_trace(-1).is_traced());
        assert!(Point::new(1.0, 1.0, 1.0).with_trace(3).is_traced());
    }

    #[test]
    fn quick_zero_bounds_fall_back() {

        let outer = DataRange::new(100.0, 2000.0, 0.5, 60.0);
        let query = DataRange::new(0.0, 500.0, 0.0, 0.0);

        let resolved = query.or_bounds_of(&outer);
        assert_eq!(resolved, DataRange::new(100.0, 500.0, 0.5, 60.0));
        assert!(resolved.contains(100.0, 60.0));
        assert!(!resolved.contains(500.1, 30.0));
    }

    #[test]
    fn quick_point_id_blob() {

        let ids = vec![0, 1, 65536, u32::MAX];
        let blob = Parser::point_ids_to_blob(&ids);
        assert_eq!(blob.len(), 16);
        assert_eq!(&blob[8..12], &[0, 1, 0, 0]);
        assert_eq!(Parser::get_point_ids_from_blob(&blob), ids);
    }
}
