// SPDX-License-Identifier: GPL-2.0-or-later

#![allow(clippy::module_name_repetitions)]

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseQueryError {
    #[error("both or neither msn and part must be present")]
    BothOrNeitherMsnAndPart,

    #[error("invalid number: {0}")]
    InvalidNumber(#[from] std::num::ParseIntError),
}

#[derive(Debug, Error)]
pub enum CreateMuxerError {
    #[error("no tracks configured")]
    NoTracks,

    #[error("codec not supported by the mpeg-ts variant")]
    UnsupportedMpegtsCodec,
}

#[derive(Debug, Error)]
pub enum GenerateInitError {
    #[error("{0}")]
    TryFromInt(#[from] std::num::TryFromIntError),

    #[error("{0}")]
    Mp4(#[from] mp4::Mp4Error),

    #[error("parse sequence parameter set: {0}")]
    ParseSps(#[from] codecs::h264::H264Error),

    #[error("parse sequence parameter set: {0}")]
    ParseSpsH265(#[from] codecs::h265::H265Error),
}

#[derive(Debug, Error)]
pub enum GeneratePartError {
    #[error("from int: {0}")]
    TryFromInt(#[from] std::num::TryFromIntError),

    #[error("mp4: {0}")]
    Mp4(#[from] mp4::Mp4Error),

    #[error("dts greater than pts")]
    DtsGreaterThanPts,
}

#[derive(Debug, Error)]
pub enum PartFinalizeError {
    #[error("generate part: {0}")]
    GeneratePart(#[from] GeneratePartError),

    #[error("get part duration")]
    Duration,
}

#[derive(Debug, Error)]
pub enum FullPlaylistError {
    #[error("{0}")]
    TryFromInt(#[from] std::num::TryFromIntError),

    #[error("duration overflowing")]
    DurationOverflowing,
}

#[derive(Debug, Error)]
pub enum SegmentFinalizeError {
    #[error("part finalize: {0}")]
    PartFinalize(#[from] PartFinalizeError),

    #[error("calculate duration")]
    CalculateDuration,
}

#[derive(Debug, Error)]
pub enum SegmentWriteError {
    #[error("reached maximum segment size")]
    MaximumSegmentSize,

    #[error("{0}")]
    TryFrom(#[from] std::num::TryFromIntError),

    #[error("part finalize: {0}")]
    PartFinalize(#[from] PartFinalizeError),

    #[error("get duration")]
    Duration,

    #[error("decode access unit: {0}")]
    DecodeAccessUnit(#[from] codecs::h264::H264Error),
}

#[derive(Debug, Error)]
pub enum SegmenterWriteError {
    #[error("write sample: {0}")]
    WriteSample(#[from] SegmentWriteError),

    #[error("finalize segment: {0}")]
    SegmentFinalize(#[from] SegmentFinalizeError),

    #[error("adjust part duration")]
    AdjustPartDuration,

    #[error("calculate sample duration")]
    ComputeSampleDuration,

    #[error("switch segment")]
    SwitchSegment,

    #[error("no audio track configured")]
    NoAudioTrack,

    #[error("no video track configured")]
    NoVideoTrack,
}
