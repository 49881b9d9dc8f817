// SPDX-License-Identifier: GPL-2.0-or-later

use common::{AudioTrack, VideoTrack};

pub struct IdCounter(u64);

impl IdCounter {
    pub fn new(initial: u64) -> Self {
        Self(initial)
    }

    pub fn next_id(&mut self) -> u64 {
        let id = self.0;
        self.0 += 1;
        id
    }
}

/// How the muxer renders segments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MuxerVariant {
    Mpegts,
    Fmp4,
    LowLatency,
}

impl MuxerVariant {
    // EXT-X-VERSION of the generated playlists.
    #[must_use]
    pub fn playlist_version(self) -> u8 {
        match self {
            MuxerVariant::Mpegts => 3,
            MuxerVariant::Fmp4 | MuxerVariant::LowLatency => 9,
        }
    }

    #[must_use]
    pub fn segment_extension(self) -> &'static str {
        match self {
            MuxerVariant::Mpegts => ".ts",
            MuxerVariant::Fmp4 | MuxerVariant::LowLatency => ".mp4",
        }
    }

    #[must_use]
    pub fn is_low_latency(self) -> bool {
        self == MuxerVariant::LowLatency
    }
}

// Tracks are populated at muxer creation. The video parameter sets may
// be replaced in-band, which the init generator observes.
#[derive(Clone, Debug)]
pub struct TrackState {
    pub video: Option<VideoTrack>,
    pub audio: Option<AudioTrack>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_counter() {
        let mut counter = IdCounter::new(0);
        assert_eq!(0, counter.next_id());
        assert_eq!(1, counter.next_id());
        assert_eq!(2, counter.next_id());
    }

    #[test]
    fn test_variant() {
        assert_eq!(3, MuxerVariant::Mpegts.playlist_version());
        assert_eq!(9, MuxerVariant::LowLatency.playlist_version());
        assert_eq!(".ts", MuxerVariant::Mpegts.segment_extension());
        assert_eq!(".mp4", MuxerVariant::Fmp4.segment_extension());
        assert!(MuxerVariant::LowLatency.is_low_latency());
        assert!(!MuxerVariant::Fmp4.is_low_latency());
    }
}
