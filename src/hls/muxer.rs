// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    error::{CreateMuxerError, ParseQueryError, SegmenterWriteError},
    init::generate_init,
    playlist::{primary_playlist, Playlist},
    segmenter::Segmenter,
    types::{MuxerVariant, TrackState},
};
use bytes::Bytes;
use codecs::{aac, h264, h265, opus};
use common::{
    time::{DurationH264, UnixNano},
    ArcMsgLogger, AudioTrack, LogLevel, VideoTrack,
};
use http::{HeaderName, HeaderValue, StatusCode};
use serde::Deserialize;
use std::{
    collections::HashMap,
    fmt::Formatter,
    io::Cursor,
    sync::{Arc, Mutex as StdMutex},
};
use tokio::{io::AsyncRead, sync::Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HlsQuery {
    pub(crate) msn_and_part: Option<(u64, u64)>,
    pub(crate) is_delta_update: bool,
}

impl HlsQuery {
    /// Parses the LL-HLS delivery directives. Empty strings mean the
    /// directive was absent.
    pub fn parse(msn: &str, part: &str, skip: &str) -> Result<Self, ParseQueryError> {
        let msn_and_part = match (msn.is_empty(), part.is_empty()) {
            (false, false) => Some((msn.parse()?, part.parse()?)),
            (true, true) => None,
            _ => return Err(ParseQueryError::BothOrNeitherMsnAndPart),
        };

        let is_delta_update = skip == "YES" || skip == "v2";

        Ok(Self {
            msn_and_part,
            is_delta_update,
        })
    }
}

impl<'de> Deserialize<'de> for HlsQuery {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        #[derive(Deserialize)]
        struct Temp {
            #[serde(rename = "_HLS_msn", default)]
            msn: Option<String>,

            #[serde(rename = "_HLS_part", default)]
            part: Option<String>,

            #[serde(rename = "_HLS_skip", default)]
            skip: Option<String>,
        }
        let temp = Temp::deserialize(deserializer)?;

        HlsQuery::parse(
            temp.msn.as_deref().unwrap_or(""),
            temp.part.as_deref().unwrap_or(""),
            temp.skip.as_deref().unwrap_or(""),
        )
        .map_err(Error::custom)
    }
}

// Response of the muxer's file fn.
pub struct MuxerFileResponse {
    pub status: StatusCode,
    pub headers: Option<HashMap<HeaderName, HeaderValue>>,
    pub body: Option<Box<dyn AsyncRead + Send + Unpin>>,
}

impl std::fmt::Debug for MuxerFileResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {:?}", self.status, self.headers)
    }
}

impl MuxerFileResponse {
    #[cfg(test)]
    #[allow(clippy::unwrap_used)]
    pub async fn body_string(mut self) -> String {
        use tokio::io::AsyncReadExt;
        let mut buf = String::new();
        self.body
            .as_mut()
            .unwrap()
            .read_to_string(&mut buf)
            .await
            .unwrap();
        buf
    }

    #[cfg(test)]
    #[allow(clippy::unwrap_used)]
    pub async fn body_bytes(mut self) -> Vec<u8> {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        self.body
            .as_mut()
            .unwrap()
            .read_to_end(&mut buf)
            .await
            .unwrap();
        buf
    }
}

pub const MUXER_FILE_RESPONSE_CANCELLED: MuxerFileResponse = MuxerFileResponse {
    status: StatusCode::INTERNAL_SERVER_ERROR,
    headers: None,
    body: None,
};

pub const MUXER_FILE_RESPONSE_ERROR: MuxerFileResponse = MuxerFileResponse {
    status: StatusCode::INTERNAL_SERVER_ERROR,
    headers: None,
    body: None,
};

pub const MUXER_FILE_RESPONSE_BAD_REQUEST: MuxerFileResponse = MuxerFileResponse {
    status: StatusCode::BAD_REQUEST,
    headers: None,
    body: None,
};

pub const MUXER_FILE_RESPONSE_NOT_FOUND: MuxerFileResponse = MuxerFileResponse {
    status: StatusCode::NOT_FOUND,
    headers: None,
    body: None,
};

pub struct MuxerConfig {
    pub variant: MuxerVariant,
    pub segment_count: usize,
    pub segment_duration: DurationH264,
    pub part_duration: DurationH264,
    pub segment_max_size: u64,
    pub video_track: Option<VideoTrack>,
    pub audio_track: Option<AudioTrack>,
}

struct InitCache {
    video: Option<VideoTrack>,
    audio: Option<AudioTrack>,
    content: Bytes,
}

pub struct Muxer {
    token: CancellationToken,
    logger: ArcMsgLogger,
    variant: MuxerVariant,
    playlist: Arc<Playlist>,
    tracks: Arc<StdMutex<TrackState>>,
    segmenter: Mutex<Segmenter>,
    init_cache: Mutex<Option<InitCache>>,
}

impl Muxer {
    pub fn new(
        parent_token: &CancellationToken,
        logger: ArcMsgLogger,
        config: MuxerConfig,
    ) -> Result<Self, CreateMuxerError> {
        if config.video_track.is_none() && config.audio_track.is_none() {
            return Err(CreateMuxerError::NoTracks);
        }
        if config.variant == MuxerVariant::Mpegts {
            if let Some(VideoTrack::H265 { .. }) = &config.video_track {
                return Err(CreateMuxerError::UnsupportedMpegtsCodec);
            }
            if let Some(AudioTrack::Opus { .. }) = &config.audio_track {
                return Err(CreateMuxerError::UnsupportedMpegtsCodec);
            }
        }

        let token = parent_token.child_token();

        // Gap placeholders occupy the first media sequence numbers.
        let first_segment_id = if config.variant.is_low_latency() {
            u64::try_from(config.segment_count).expect("usize to fit u64")
        } else {
            0
        };

        let playlist = Arc::new(Playlist::new(
            token.clone(),
            logger.clone(),
            config.variant,
            config.segment_count,
            first_segment_id,
        ));

        let tracks = Arc::new(StdMutex::new(TrackState {
            video: config.video_track,
            audio: config.audio_track,
        }));

        let segmenter = Segmenter::new(
            config.variant,
            config.segment_duration,
            config.part_duration,
            config.segment_max_size,
            first_segment_id,
            tracks.clone(),
            playlist.clone(),
        );

        Ok(Self {
            token,
            logger,
            variant: config.variant,
            playlist,
            tracks,
            segmenter: Mutex::new(segmenter),
            init_cache: Mutex::new(None),
        })
    }

    /// Writes one video access unit. The decode timestamp is derived
    /// from the presentation timestamp and the parameter sets.
    pub async fn write_h26x(
        &self,
        ntp: UnixNano,
        pts: DurationH264,
        au: &[Vec<u8>],
    ) -> Result<(), SegmenterWriteError> {
        self.segmenter.lock().await.write_h26x(ntp, pts, au).await
    }

    /// Writes one audio access unit.
    pub async fn write_audio(
        &self,
        ntp: UnixNano,
        pts: DurationH264,
        au: Bytes,
    ) -> Result<(), SegmenterWriteError> {
        self.segmenter.lock().await.write_audio(ntp, pts, au).await
    }

    /// Cancels the muxer. Blocked file requests are released.
    pub fn close(&self) {
        self.token.cancel();
    }

    fn codec_strings(&self) -> Vec<String> {
        let tracks = self.tracks.lock().expect("mutex poisoned");
        let mut out = Vec::new();

        match &tracks.video {
            Some(VideoTrack::H264 { sps, .. }) => {
                if let Some(codec) = h264::rfc6381_codec(sps) {
                    out.push(codec);
                }
            }
            Some(VideoTrack::H265 { sps, .. }) => {
                if let Ok(info) = h265::SpsInfo::parse(sps) {
                    out.push(h265::rfc6381_codec(&info));
                }
            }
            None => {}
        }

        match &tracks.audio {
            Some(AudioTrack::Mpeg4Audio { object_type, .. }) => {
                out.push(aac::rfc6381_codec(*object_type));
            }
            Some(AudioTrack::Opus { .. }) => out.push(opus::RFC6381_CODEC.to_owned()),
            None => {}
        }

        out
    }

    async fn init_file(&self) -> MuxerFileResponse {
        let (video, audio) = {
            let tracks = self.tracks.lock().expect("mutex poisoned");
            (tracks.video.clone(), tracks.audio.clone())
        };

        let mut cache = self.init_cache.lock().await;

        // Regenerated when the video parameters changed.
        let stale = match &*cache {
            Some(c) => c.video != video || c.audio != audio,
            None => true,
        };
        if stale {
            let content = match generate_init(video.as_ref(), audio.as_ref()) {
                Ok(v) => v,
                Err(e) => {
                    self.logger.log(LogLevel::Error, &format!("generate init: {e}"));
                    return MUXER_FILE_RESPONSE_ERROR;
                }
            };
            *cache = Some(InitCache {
                video,
                audio,
                content,
            });
        }

        let content = cache.as_ref().expect("set above").content.clone();
        MuxerFileResponse {
            status: StatusCode::OK,
            headers: Some(HashMap::from([(
                #[allow(clippy::unwrap_used)]
                HeaderName::from_bytes(b"Content-Type").unwrap(),
                #[allow(clippy::unwrap_used)]
                HeaderValue::from_str("video/mp4").unwrap(),
            )])),
            body: Some(Box::new(Cursor::new(content))),
        }
    }

    /// Serves one muxer file. The delivery directives arrive as raw
    /// query values, empty when absent.
    pub async fn file(&self, name: &str, msn: &str, part: &str, skip: &str) -> MuxerFileResponse {
        let Ok(query) = HlsQuery::parse(msn, part, skip) else {
            return MUXER_FILE_RESPONSE_BAD_REQUEST;
        };

        if name == "index.m3u8" {
            return primary_playlist(self.variant.playlist_version(), &self.codec_strings());
        }

        if name == "init.mp4" {
            if self.variant == MuxerVariant::Mpegts {
                return MUXER_FILE_RESPONSE_NOT_FOUND;
            }
            return self.init_file().await;
        }

        self.playlist.file(name, &query).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use common::{new_dummy_msg_logger, time::H264_SECOND};
    use pretty_assertions::assert_eq;
    use std::time::Duration as StdDuration;

    const TEST_SPS: [u8; 28] = [
        0x67, 0x64, 0x00, 0x28, 0xac, 0xd9, 0x40, 0x78, 0x02, 0x27, 0xe5, 0x84, 0x00, 0x00, 0x03,
        0x00, 0x04, 0x00, 0x00, 0x03, 0x00, 0xf0, 0x3c, 0x60, 0xc6, 0x58, 0x80, 0x00,
    ];
    const TEST_PPS: [u8; 6] = [0x68, 0xeb, 0xe3, 0xcb, 0x22, 0xc0];

    fn test_video_track() -> VideoTrack {
        VideoTrack::H264 {
            sps: TEST_SPS.to_vec(),
            pps: TEST_PPS.to_vec(),
        }
    }

    fn new_test_muxer(variant: MuxerVariant, segment_duration: DurationH264) -> Muxer {
        Muxer::new(
            &CancellationToken::new(),
            new_dummy_msg_logger(),
            MuxerConfig {
                variant,
                segment_count: 7,
                segment_duration,
                part_duration: DurationH264::new(50 * 90),
                segment_max_size: 50_000_000,
                video_track: Some(test_video_track()),
                audio_track: None,
            },
        )
        .unwrap()
    }

    fn idr_access_unit() -> Vec<Vec<u8>> {
        vec![TEST_SPS.to_vec(), TEST_PPS.to_vec(), vec![0x65, 1, 2, 3]]
    }

    fn seconds(s: i64) -> DurationH264 {
        DurationH264::new(s * H264_SECOND)
    }

    #[tokio::test]
    async fn test_mpegts_segment_durations() {
        let muxer = new_test_muxer(MuxerVariant::Mpegts, seconds(1));

        muxer
            .write_h26x(UnixNano::new(0), seconds(2), &idr_access_unit())
            .await
            .unwrap();
        muxer
            .write_h26x(UnixNano::new(0), seconds(6), &[vec![0x65, 9]])
            .await
            .unwrap();
        muxer
            .write_h26x(UnixNano::new(0), seconds(7), &[vec![0x65, 10]])
            .await
            .unwrap();

        let res = muxer.file("stream.m3u8", "", "", "").await;
        assert_eq!(StatusCode::OK, res.status);
        let body = res.body_string().await;

        assert!(body.contains("#EXT-X-VERSION:3\n"), "{body}");
        assert!(body.contains("#EXT-X-TARGETDURATION:4\n"), "{body}");
        assert!(body.contains("#EXTINF:4.00000,\nseg0.ts\n"), "{body}");
        assert!(body.contains("#EXTINF:1.00000,\nseg1.ts\n"), "{body}");
        assert!(!body.contains("#EXT-X-MAP"), "{body}");
    }

    #[tokio::test]
    async fn test_segment_double_read() {
        let muxer = new_test_muxer(MuxerVariant::Mpegts, seconds(1));

        muxer
            .write_h26x(UnixNano::new(0), seconds(0), &idr_access_unit())
            .await
            .unwrap();
        muxer
            .write_h26x(UnixNano::new(0), seconds(2), &[vec![0x65, 9]])
            .await
            .unwrap();

        let first = muxer.file("seg0.ts", "", "", "").await;
        assert_eq!(StatusCode::OK, first.status);
        let second = muxer.file("seg0.ts", "", "", "").await;

        assert_eq!(first.body_bytes().await, second.body_bytes().await);
    }

    #[tokio::test]
    async fn test_maximum_segment_size() {
        let muxer = Muxer::new(
            &CancellationToken::new(),
            new_dummy_msg_logger(),
            MuxerConfig {
                variant: MuxerVariant::Fmp4,
                segment_count: 7,
                segment_duration: seconds(1),
                part_duration: DurationH264::new(50 * 90),
                segment_max_size: 10,
                video_track: Some(test_video_track()),
                audio_track: None,
            },
        )
        .unwrap();

        muxer
            .write_h26x(UnixNano::new(0), seconds(0), &[vec![0x65; 100]])
            .await
            .unwrap();
        let got = muxer
            .write_h26x(UnixNano::new(0), seconds(1), &[vec![0x65, 1]])
            .await;

        let err = got.unwrap_err();
        assert_eq!(
            "write sample: reached maximum segment size",
            format!("{err}")
        );

        // Nothing was finalized.
        let res = muxer.file("stream.m3u8", "", "", "").await;
        assert_eq!(StatusCode::NOT_FOUND, res.status);
    }

    #[tokio::test]
    async fn test_blocking_playlist_bad_request() {
        let muxer = new_test_muxer(MuxerVariant::LowLatency, seconds(1));

        // First segment id is 7, so msn 9 exceeds the advance limit.
        let res = muxer.file("stream.m3u8", "9", "0", "").await;
        assert_eq!(StatusCode::BAD_REQUEST, res.status);

        let res = muxer.file("stream.m3u8", "abc", "0", "").await;
        assert_eq!(StatusCode::BAD_REQUEST, res.status);

        let res = muxer.file("stream.m3u8", "1", "", "").await;
        assert_eq!(StatusCode::BAD_REQUEST, res.status);
    }

    async fn write_samples(muxer: &Muxer, start: u64, count: u64) {
        // Alternating IDR and non-IDR samples at 30fps.
        for i in start..start + count {
            let au = if i % 2 == 0 {
                idr_access_unit()
            } else {
                vec![vec![0x41, 1]]
            };
            muxer
                .write_h26x(
                    UnixNano::new(0),
                    DurationH264::new(i64::try_from(i).unwrap() * 3000),
                    &au,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_low_latency_preload_hint() {
        let muxer = Arc::new(new_test_muxer(
            MuxerVariant::LowLatency,
            DurationH264::new(200 * 90),
        ));

        write_samples(&muxer, 0, 30).await;

        let res = muxer.file("stream.m3u8", "", "", "").await;
        assert_eq!(StatusCode::OK, res.status);
        let body = res.body_string().await;

        let last_line = body.lines().last().unwrap();
        assert!(
            last_line.starts_with("#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"part"),
            "{body}"
        );

        // The hinted part blocks until it materializes.
        let hinted = last_line
            .strip_prefix("#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"")
            .unwrap()
            .strip_suffix('"')
            .unwrap()
            .to_owned();

        let muxer2 = muxer.clone();
        let hinted2 = hinted.clone();
        let pending =
            tokio::spawn(async move { muxer2.file(&hinted2, "", "", "").await });

        // Still blocked after a short wait.
        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!pending.is_finished());

        write_samples(&muxer, 30, 30).await;

        let res = tokio::time::timeout(StdDuration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(StatusCode::OK, res.status);
    }

    #[tokio::test]
    async fn test_blocking_playlist_reload() {
        let muxer = Arc::new(new_test_muxer(
            MuxerVariant::LowLatency,
            DurationH264::new(200 * 90),
        ));

        // The first segment is number seven, none of it produced yet.
        let muxer2 = muxer.clone();
        let pending = tokio::spawn(async move { muxer2.file("stream.m3u8", "7", "0", "").await });

        tokio::time::sleep(StdDuration::from_millis(50)).await;
        assert!(!pending.is_finished());

        write_samples(&muxer, 0, 30).await;

        let res = tokio::time::timeout(StdDuration::from_secs(5), pending)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(StatusCode::OK, res.status);
        let body = res.body_string().await;
        assert!(body.contains("#EXT-X-PART:"), "{body}");
    }

    #[tokio::test]
    async fn test_low_latency_gap_backfill() {
        let muxer = new_test_muxer(MuxerVariant::LowLatency, DurationH264::new(200 * 90));
        write_samples(&muxer, 0, 30).await;

        let res = muxer.file("stream.m3u8", "", "", "").await;
        let body = res.body_string().await;
        assert!(body.contains("#EXT-X-GAP\n"), "{body}");
        assert!(body.contains("gap.mp4\n"), "{body}");
        // First real segment occupies media sequence number 7.
        assert!(body.contains("seg7.mp4\n"), "{body}");
    }

    #[tokio::test]
    async fn test_segments_start_on_idr() {
        let muxer = new_test_muxer(MuxerVariant::Fmp4, seconds(1));

        // Non-IDR samples before the first IDR are dropped.
        muxer
            .write_h26x(UnixNano::new(0), seconds(0), &[vec![0x41, 1]])
            .await
            .unwrap();
        write_samples(&muxer, 0, 90).await;

        let res = muxer.file("seg0.mp4", "", "", "").await;
        assert_eq!(StatusCode::OK, res.status);
        let content = Bytes::from(res.body_bytes().await);

        let fragments = mp4::parse_fragments(&content).unwrap();
        let first_sample = &fragments[0].tracks[0].samples[0];
        assert_eq!(0, first_sample.flags & mp4::SAMPLE_IS_NON_SYNC_SAMPLE);
    }

    #[tokio::test]
    async fn test_audio_only_mpegts() {
        let muxer = Muxer::new(
            &CancellationToken::new(),
            new_dummy_msg_logger(),
            MuxerConfig {
                variant: MuxerVariant::Mpegts,
                segment_count: 7,
                segment_duration: seconds(1),
                part_duration: DurationH264::new(50 * 90),
                segment_max_size: 50_000_000,
                video_track: None,
                audio_track: Some(common::AudioTrack::Mpeg4Audio {
                    config: vec![0x11, 0x90],
                    object_type: 2,
                    sample_rate: 48000,
                    channel_count: 2,
                }),
            },
        )
        .unwrap();

        for i in 0..3 {
            muxer
                .write_audio(UnixNano::new(0), seconds(i), Bytes::from_static(&[1, 2, 3]))
                .await
                .unwrap();
        }

        let res = muxer.file("seg0.ts", "", "", "").await;
        assert_eq!(StatusCode::OK, res.status);
        let content = res.body_bytes().await;

        let demuxed = mpegts::parse_segment(&content).unwrap();
        assert_eq!(1, demuxed.packets.len());
        // ADTS framed with the program clock offset applied.
        assert_eq!(Some(36_000), demuxed.packets[0].pts);
        let frames = codecs::aac::parse_adts(&demuxed.packets[0].payload).unwrap();
        assert_eq!(Bytes::from_static(&[1, 2, 3]), frames[0].au);
    }

    #[tokio::test]
    async fn test_index_playlist() {
        let muxer = new_test_muxer(MuxerVariant::Fmp4, seconds(1));
        let res = muxer.file("index.m3u8", "", "", "").await;
        assert_eq!(StatusCode::OK, res.status);
        let body = res.body_string().await;
        assert!(body.contains("CODECS=\"avc1.640028\""), "{body}");
    }

    #[tokio::test]
    async fn test_init_file() {
        let muxer = new_test_muxer(MuxerVariant::Fmp4, seconds(1));
        let res = muxer.file("init.mp4", "", "", "").await;
        assert_eq!(StatusCode::OK, res.status);

        let content = Bytes::from(res.body_bytes().await);
        let parsed = mp4::parse_init(&content).unwrap();
        assert_eq!(1, parsed.tracks.len());
        assert_eq!(common::VIDEO_TRACK_ID, parsed.tracks[0].id);
    }

    #[tokio::test]
    async fn test_cancelled_muxer_returns_error() {
        let muxer = new_test_muxer(MuxerVariant::Fmp4, seconds(1));
        muxer.close();
        // Give the cleanup task a chance to run.
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let res = muxer.file("stream.m3u8", "", "", "").await;
        assert_eq!(StatusCode::INTERNAL_SERVER_ERROR, res.status);
    }
}
