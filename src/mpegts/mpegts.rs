// SPDX-License-Identifier: GPL-2.0-or-later

mod crc32;
mod demux;
mod mux;
mod pes;
mod psi;

pub use crc32::mpeg2_crc32;
pub use demux::{parse_segment, DemuxError, DemuxedSegment, EsInfo, PesPacket};
pub use mux::Muxer;
pub use pes::{PesError, PesHeader};
pub use psi::{Pat, Pmt};

pub const PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;

pub const PID_PAT: u16 = 0;
pub const PID_NULL: u16 = 0x1fff;

// Table 2-34, ISO/IEC 13818-1.
pub const STREAM_TYPE_ADTS_AAC: u8 = 0x0f;
pub const STREAM_TYPE_H264: u8 = 0x1b;
pub const STREAM_TYPE_H265: u8 = 0x24;

// 33-bit timestamp wrap.
pub const TIMESTAMP_MASK: u64 = (1 << 33) - 1;

pub const STREAM_ID_VIDEO: u8 = 0xe0;
pub const STREAM_ID_AUDIO: u8 = 0xc0;
