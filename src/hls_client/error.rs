// SPDX-License-Identifier: GPL-2.0-or-later

#![allow(clippy::module_name_repetitions)]

use crate::fetch::FetchError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CreateClientError {
    #[error("build tls configuration: {0}")]
    Tls(String),

    #[error("build http client: {0}")]
    Http(String),

    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(#[from] hex::FromHexError),
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("fetch: {0}")]
    Fetch(#[from] FetchError),

    #[error("decode playlist: {0}")]
    DecodePlaylist(String),

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("no supported variant found")]
    NoSupportedVariant,

    #[error("audio group not found: {0}")]
    AudioGroupNotFound(String),

    #[error("no tracks found")]
    NoTracks,

    #[error("not enough segments")]
    NotEnoughSegments,

    #[error("following segment not found or not ready yet")]
    FollowingSegmentNotFound,

    #[error("playback is too late")]
    PlaybackTooLate,

    #[error("stream has ended")]
    StreamEnded,

    #[error("DTS/RTC drift too big")]
    DtsRtcDriftTooBig,

    #[error("PTS is missing")]
    MissingPts,

    #[error("demux segment: {0}")]
    Demux(#[from] mpegts::DemuxError),

    #[error("parse mp4: {0}")]
    ParseMp4(#[from] mp4::ParseError),

    #[error("unknown track id: {0}")]
    UnknownTrackId(u32),

    #[error("unsupported track codec")]
    UnsupportedTrackCodec,

    #[error("decode access unit: {0}")]
    DecodeH264(#[from] codecs::h264::H264Error),

    #[error("decode parameter sets: {0}")]
    DecodeH265(#[from] codecs::h265::H265Error),

    #[error("decode audio: {0}")]
    DecodeAac(#[from] codecs::aac::AacError),

    #[error("leading stream uses a different segment format")]
    LeadingTimeSyncTypeMismatch,

    #[error("tracks rejected: {0}")]
    TracksRejected(String),

    #[error("terminated")]
    Terminated,
}

impl From<common::Cancelled> for ClientError {
    fn from(_: common::Cancelled) -> Self {
        ClientError::Terminated
    }
}
