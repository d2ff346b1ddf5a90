//! Sets constants for the disk layout
//!
//! All multi-byte values on disk are big endian.

//for a point record in the point file
pub const MZ_START: usize = 0;
pub const MZ_SIZE: usize = 8;

pub const RT_START: usize = MZ_START + MZ_SIZE;
pub const RT_SIZE: usize = 4;

pub const INTENSITY_START: usize = RT_START + RT_SIZE;
pub const INTENSITY_SIZE: usize = 8;

pub const TRACE_START: usize = INTENSITY_START + INTENSITY_SIZE;
pub const TRACE_SIZE: usize = 4;

pub const POINT_SIZE: usize = TRACE_START + TRACE_SIZE;

//for the packed point id blob of a node row
pub const POINT_ID_SIZE: usize = 4;

//for the intensity index side file
pub const RUN_COUNT_START: usize = 0;
pub const RUN_COUNT_SIZE: usize = 4;

pub const RUN_OFFSETS_START: usize = RUN_COUNT_START + RUN_COUNT_SIZE;
pub const RUN_OFFSET_SIZE: usize = 8;

//sqlite header pragmas
pub const APPLICATION_ID: i32 = 223764262;
pub const USER_VERSION: i32 = 5;

//side file suffixes, appended to the metadata path
pub const POINTS_SUFFIX: &str = "-points";
pub const INTENSITY_SUFFIX: &str = "-intensity";

/// Byte offset of a point record in the point file
pub fn point_offset(id: u32) -> u64 {

    return id as u64 * POINT_SIZE as u64;
}

/// Point id of the record starting at a byte offset
pub fn point_id_at(offset: u64) -> u32 {

    return (offset / POINT_SIZE as u64) as u32;
}
