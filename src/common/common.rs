// SPDX-License-Identifier: GPL-2.0-or-later

mod routine_pool;
pub mod time;

pub use routine_pool::RoutinePool;

use bytes::Bytes;
use std::{fmt, io::Cursor, sync::Arc, task::Poll};
use thiserror::Error;
use time::{DurationH264, DtsOffset, UnixNano};
use tokio::io::AsyncRead;

// Returned by blocking operations that were interrupted by a shutdown.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("cancelled")]
pub struct Cancelled;

/// Severity of a log message.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
}

pub type ArcMsgLogger = Arc<dyn MsgLogger + Send + Sync>;

pub trait MsgLogger {
    fn log(&self, level: LogLevel, msg: &str);
}

pub struct DummyMsgLogger;

impl MsgLogger for DummyMsgLogger {
    fn log(&self, _: LogLevel, _: &str) {}
}

#[must_use]
pub fn new_dummy_msg_logger() -> ArcMsgLogger {
    Arc::new(DummyMsgLogger {})
}

// 14496-12_2015 8.3.2.3
// Track IDs are never re-used and cannot be zero.
pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;

/// Video track parameters. Immutable after first population; a parameter
/// change on the muxer side forces a new segment and a new init blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VideoTrack {
    H264 {
        sps: Vec<u8>,
        pps: Vec<u8>,
    },
    H265 {
        vps: Vec<u8>,
        sps: Vec<u8>,
        pps: Vec<u8>,
    },
}

impl VideoTrack {
    #[must_use]
    pub fn sps(&self) -> &[u8] {
        match self {
            VideoTrack::H264 { sps, .. } | VideoTrack::H265 { sps, .. } => sps,
        }
    }
}

/// Audio track parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AudioTrack {
    Mpeg4Audio {
        // Raw AudioSpecificConfig.
        config: Vec<u8>,
        object_type: u8,
        sample_rate: u32,
        channel_count: u16,
    },
    Opus {
        channel_count: u16,
    },
}

impl AudioTrack {
    // Timescale of the track's timestamps.
    #[must_use]
    pub fn clock_rate(&self) -> u32 {
        match self {
            AudioTrack::Mpeg4Audio { sample_rate, .. } => *sample_rate,
            AudioTrack::Opus { .. } => 48000,
        }
    }

    #[must_use]
    pub fn channel_count(&self) -> u16 {
        match self {
            AudioTrack::Mpeg4Audio { channel_count, .. } | AudioTrack::Opus { channel_count } => {
                *channel_count
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TrackCodec {
    Video(VideoTrack),
    Audio(AudioTrack),
}

/// A media track announced by the client before streaming starts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Track {
    pub id: u32,
    pub codec: TrackCodec,
}

#[derive(Clone, Debug, Default)]
pub struct VideoSample {
    pub ntp: UnixNano,

    // Timestamps are relative to the muxer start time.
    pub pts: DurationH264,
    pub dts: DurationH264,

    pub avcc: Bytes,
    pub random_access_present: bool,
    pub duration: DurationH264,
}

impl VideoSample {
    #[must_use]
    pub fn dts_offset(&self) -> Option<DtsOffset> {
        i32::try_from(*self.pts.checked_sub(self.dts)?)
            .ok()
            .map(DtsOffset::new)
    }
}

impl fmt::Display for VideoSample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pts: {:?}, dts: {:?}, IDR: {}",
            self.pts, self.dts, self.random_access_present
        )
    }
}

#[derive(Clone, Debug, Default)]
pub struct AudioSample {
    pub ntp: UnixNano,
    pub pts: DurationH264,
    pub au: Bytes,
    pub duration: DurationH264,
}

#[derive(Clone, Debug, Default)]
pub struct PartFinalized {
    pub id: u64,

    pub is_independent: bool,
    pub rendered_content: Option<Bytes>,
    pub rendered_duration: DurationH264,
}

impl PartFinalized {
    #[must_use]
    pub fn name(&self) -> String {
        part_name(self.id)
    }

    #[must_use]
    pub fn reader(&self) -> Box<dyn AsyncRead + Send + Unpin> {
        let Some(rendered_content) = &self.rendered_content else {
            return Box::new(Cursor::new(Vec::new()));
        };
        Box::new(Cursor::new(rendered_content.clone()))
    }
}

#[must_use]
pub fn part_name(id: u64) -> String {
    ["part", &id.to_string()].join("")
}

/// Rendered bytes of a finalized segment.
#[derive(Debug)]
pub enum SegmentContent {
    // Fmp4 parts, possibly a single one.
    Parts(Vec<Arc<PartFinalized>>),

    // Monolithic MPEG-TS buffer.
    Bytes(Bytes),
}

#[derive(Debug)]
pub struct SegmentFinalized {
    id: u64,
    start_time: UnixNano,
    name: String,
    content: SegmentContent,
    duration: DurationH264,
}

impl SegmentFinalized {
    #[must_use]
    pub fn new(
        id: u64,
        start_time: UnixNano,
        name: String,
        content: SegmentContent,
        duration: DurationH264,
    ) -> Self {
        Self {
            id,
            start_time,
            name,
            content,
            duration,
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn start_time(&self) -> UnixNano {
        self.start_time
    }

    #[must_use]
    pub fn parts(&self) -> &[Arc<PartFinalized>] {
        match &self.content {
            SegmentContent::Parts(parts) => parts,
            SegmentContent::Bytes(_) => &[],
        }
    }

    #[must_use]
    pub fn duration(&self) -> DurationH264 {
        self.duration
    }

    #[must_use]
    pub fn reader(&self) -> Box<dyn AsyncRead + Send + Unpin> {
        match &self.content {
            SegmentContent::Parts(parts) => Box::new(PartsReader::new(parts.clone())),
            SegmentContent::Bytes(bytes) => Box::new(Cursor::new(bytes.clone())),
        }
    }
}

pub struct PartsReader {
    parts: Vec<Arc<PartFinalized>>,
    cur_part: usize,
    cur_pos: usize,
}

impl PartsReader {
    #[must_use]
    pub fn new(parts: Vec<Arc<PartFinalized>>) -> Self {
        Self {
            parts,
            cur_part: 0,
            cur_pos: 0,
        }
    }
}

impl AsyncRead for PartsReader {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        _cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut n = 0;
        let buf_len = buf.remaining();

        loop {
            if self.cur_part >= self.parts.len() {
                // EOF.
                return Poll::Ready(Ok(()));
            }

            let Some(part) = &self.parts[self.cur_part].rendered_content else {
                self.cur_part += 1;
                self.cur_pos = 0;
                continue;
            };

            let part_len = part.len();

            let start = self.cur_pos;
            let amt = std::cmp::min(part_len - start, buf.remaining());
            let end = start + amt;

            buf.put_slice(&part[start..end]);

            self.cur_pos += amt;
            n += amt;

            if self.cur_pos == part_len {
                self.cur_part += 1;
                self.cur_pos = 0;
            }

            // If buffer is full.
            if n == buf_len {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn new_test_part(content: Vec<u8>) -> Arc<PartFinalized> {
        Arc::new(PartFinalized {
            id: 0,
            is_independent: false,
            rendered_content: Some(Bytes::from(content)),
            rendered_duration: DurationH264::new(0),
        })
    }

    async fn read_n(reader: &mut PartsReader, n: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(n);
        reader.read_buf(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_parts_reader() {
        let parts = vec![
            new_test_part(vec![0, 1, 2, 3]),
            new_test_part(vec![4, 5, 6]),
            new_test_part(vec![7, 8]),
            new_test_part(vec![9]),
        ];
        let mut reader = PartsReader::new(parts);

        assert_eq!(vec![0, 1, 2], read_n(&mut reader, 3).await);
        assert_eq!(vec![3, 4, 5, 6], read_n(&mut reader, 4).await);
        assert_eq!(vec![7, 8, 9], read_n(&mut reader, 99).await);
    }

    #[test]
    fn test_part_name() {
        assert_eq!("part7", part_name(7));
    }
}
