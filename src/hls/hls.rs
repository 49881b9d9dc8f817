// SPDX-License-Identifier: GPL-2.0-or-later

mod error;
mod init;
mod muxer;
mod part;
mod playlist;
mod segment;
mod segment_ts;
mod segmenter;
mod types;

pub use error::{CreateMuxerError, ParseQueryError, SegmenterWriteError};
pub use init::generate_init;
pub use muxer::{
    HlsQuery, Muxer, MuxerConfig, MuxerFileResponse, MUXER_FILE_RESPONSE_BAD_REQUEST,
    MUXER_FILE_RESPONSE_NOT_FOUND,
};
pub use types::MuxerVariant;

use common::time::{DurationH264, H264_MILLISECOND};

pub const DEFAULT_SEGMENT_COUNT: usize = 7;
pub const DEFAULT_SEGMENT_DURATION: DurationH264 = DurationH264::new(900 * H264_MILLISECOND);
pub const DEFAULT_PART_DURATION: DurationH264 = DurationH264::new(300 * H264_MILLISECOND);

const MB: u64 = 1_000_000;
pub const DEFAULT_SEGMENT_MAX_SIZE: u64 = 50 * MB;
