// SPDX-License-Identifier: GPL-2.0-or-later

mod downloader_primary;
mod downloader_stream;
mod error;
mod fetch;
mod processor_fmp4;
mod processor_mpegts;
mod segment_queue;
mod timesync;

pub use error::{ClientError, CreateClientError};
pub use fetch::{ArcHttpClient, FetchError, HttpClient, HttpResponse, ReqwestClient};
pub use segment_queue::SegmentQueue;
pub use timesync::{Fmp4TimeSync, MpegtsTimeSync, TimeDecoder};

use bytes::Bytes;
use common::{time::Duration, ArcMsgLogger, RoutinePool, Track};
use downloader_primary::PrimaryDownloader;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use url::Url;

pub type OnTracksFunc = Box<dyn Fn(&[Track]) -> Result<(), String> + Send + Sync>;
pub type OnVideoFunc = Box<dyn Fn(Duration, Vec<Bytes>) + Send + Sync>;
pub type OnAudioFunc = Box<dyn Fn(Duration, Bytes) + Send + Sync>;

pub(crate) struct Callbacks {
    pub on_video: OnVideoFunc,
    pub on_audio: OnAudioFunc,
}

pub struct ClientConfig {
    pub playlist_url: Url,

    // Optional SHA-256 pin of the server certificate.
    pub fingerprint: Option<String>,

    pub logger: ArcMsgLogger,
}

/// HLS client. Fetches playlists and segments, synchronizes timestamps
/// to the wall clock and delivers access units to the callbacks.
pub struct Client {
    pool: Arc<RoutinePool<ClientError>>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        on_tracks: OnTracksFunc,
        on_video: OnVideoFunc,
        on_audio: OnAudioFunc,
    ) -> Result<Self, CreateClientError> {
        let http: ArcHttpClient = Arc::new(ReqwestClient::new(config.fingerprint.as_deref())?);
        Ok(Self::with_http_client(
            http, config, on_tracks, on_video, on_audio,
        ))
    }

    /// Runs against a caller-provided transport.
    pub fn with_http_client(
        http: ArcHttpClient,
        config: ClientConfig,
        on_tracks: OnTracksFunc,
        on_video: OnVideoFunc,
        on_audio: OnAudioFunc,
    ) -> Self {
        let pool = Arc::new(RoutinePool::new(CancellationToken::new()));

        let primary = PrimaryDownloader {
            http,
            url: config.playlist_url,
            logger: config.logger,
            callbacks: Arc::new(Callbacks { on_video, on_audio }),
            on_tracks,
            pool: pool.clone(),
        };
        pool.add(|token| primary.run(token));

        Self { pool }
    }

    /// Waits for the first error raised by any part of the session.
    pub async fn wait(&self) -> Option<ClientError> {
        self.pool.first_error().await
    }

    /// Cancels the session and waits for every task to exit.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use codecs::h264;
    use common::{new_dummy_msg_logger, time::{DurationH264, UnixNano}};
    use hls::{Muxer, MuxerConfig, MuxerVariant};
    use mpegts::{EsInfo, STREAM_TYPE_H264};
    use pretty_assertions::assert_eq;
    use std::{
        collections::{HashMap, VecDeque},
        sync::Mutex as StdMutex,
        time::Duration as StdDuration,
    };
    use tokio::sync::mpsc;

    struct MockHttpClient {
        responses: StdMutex<HashMap<String, VecDeque<Bytes>>>,
        requests: StdMutex<Vec<String>>,
    }

    impl MockHttpClient {
        fn new() -> Self {
            Self {
                responses: StdMutex::new(HashMap::new()),
                requests: StdMutex::new(Vec::new()),
            }
        }

        fn serve(&self, path: &str, body: impl Into<Bytes>) {
            self.responses
                .lock()
                .unwrap()
                .entry(path.to_owned())
                .or_default()
                .push_back(body.into());
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn get(
            &self,
            url: &Url,
            _headers: &[(String, String)],
            _token: &CancellationToken,
        ) -> Result<HttpResponse, FetchError> {
            self.requests.lock().unwrap().push(url.path().to_owned());

            let mut responses = self.responses.lock().unwrap();
            let Some(queue) = responses.get_mut(url.path()) else {
                return Ok(HttpResponse {
                    status: 404,
                    body: Bytes::new(),
                });
            };

            // The last response repeats on every later request.
            let body = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().unwrap().clone()
            };
            Ok(HttpResponse { status: 200, body })
        }
    }

    enum Event {
        Tracks(Vec<Track>),
        Video(Duration, Vec<Bytes>),
        #[allow(dead_code)]
        Audio(Duration, Bytes),
    }

    fn new_test_client(
        http: Arc<MockHttpClient>,
        url: &str,
    ) -> (Client, mpsc::UnboundedReceiver<Event>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let tracks_tx = event_tx.clone();
        let video_tx = event_tx.clone();
        let audio_tx = event_tx;

        let client = Client::with_http_client(
            http,
            ClientConfig {
                playlist_url: Url::parse(url).unwrap(),
                fingerprint: None,
                logger: new_dummy_msg_logger(),
            },
            Box::new(move |tracks| {
                _ = tracks_tx.send(Event::Tracks(tracks.to_vec()));
                Ok(())
            }),
            Box::new(move |pts, nalus| {
                _ = video_tx.send(Event::Video(pts, nalus));
            }),
            Box::new(move |pts, au| {
                _ = audio_tx.send(Event::Audio(pts, au));
            }),
        );
        (client, event_rx)
    }

    async fn read_body(mut res: hls::MuxerFileResponse) -> Vec<u8> {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        res.body
            .as_mut()
            .unwrap()
            .read_to_end(&mut buf)
            .await
            .unwrap();
        buf
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(StdDuration::from_secs(5), rx.recv())
            .await
            .expect("event timeout")
            .expect("channel closed")
    }

    // One H264 track, two access units 100ms apart.
    fn test_ts_segment() -> Vec<u8> {
        let mut muxer = mpegts::Muxer::new(
            vec![EsInfo {
                pid: 256,
                stream_type: STREAM_TYPE_H264,
            }],
            256,
        );
        muxer.write_tables();

        let au1 = h264::annexb_marshal(&[vec![7, 1, 2, 3], vec![8], vec![5]]);
        muxer.write_pes(256, 0xe0, 90_000, Some(90_000), true, Some(90_000), &au1);

        let au2 = h264::annexb_marshal(&[vec![0x41, 9]]);
        muxer.write_pes(256, 0xe0, 99_000, Some(99_000), false, None, &au2);

        muxer.take()
    }

    #[tokio::test]
    async fn test_mpegts_round_trip() {
        let http = Arc::new(MockHttpClient::new());
        http.serve(
            "/stream.m3u8",
            "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-TARGETDURATION:1\n\
             #EXT-X-MEDIA-SEQUENCE:0\n\
             #EXTINF:1,\n\
             seg0.ts\n\
             #EXT-X-ENDLIST\n",
        );
        http.serve("/seg0.ts", test_ts_segment());

        let (client, mut events) = new_test_client(http, "http://localhost/stream.m3u8");

        let Event::Tracks(tracks) = next_event(&mut events).await else {
            panic!("expected tracks");
        };
        assert_eq!(1, tracks.len());
        assert_eq!(256, tracks[0].id);

        let Event::Video(pts, nalus) = next_event(&mut events).await else {
            panic!("expected video");
        };
        assert_eq!(Duration::from_nanos(0), pts);
        let want: Vec<Vec<u8>> = vec![vec![7, 1, 2, 3], vec![8], vec![5]];
        assert_eq!(
            want,
            nalus.iter().map(|n| n.to_vec()).collect::<Vec<Vec<u8>>>()
        );

        let Event::Video(pts, nalus) = next_event(&mut events).await else {
            panic!("expected video");
        };
        assert_eq!(Duration::from_millis(100), pts);
        assert_eq!(1, nalus.len());

        client.close().await;
    }

    const TEST_SPS: [u8; 28] = [
        0x67, 0x64, 0x00, 0x28, 0xac, 0xd9, 0x40, 0x78, 0x02, 0x27, 0xe5, 0x84, 0x00, 0x00, 0x03,
        0x00, 0x04, 0x00, 0x00, 0x03, 0x00, 0xf0, 0x3c, 0x60, 0xc6, 0x58, 0x80, 0x00,
    ];
    const TEST_PPS: [u8; 6] = [0x68, 0xeb, 0xe3, 0xcb, 0x22, 0xc0];

    async fn test_fmp4_files() -> (Vec<u8>, Vec<u8>) {
        let muxer = Muxer::new(
            &CancellationToken::new(),
            new_dummy_msg_logger(),
            MuxerConfig {
                variant: MuxerVariant::Fmp4,
                segment_count: 7,
                segment_duration: DurationH264::new(9000),
                part_duration: DurationH264::new(4500),
                segment_max_size: 50_000_000,
                video_track: Some(common::VideoTrack::H264 {
                    sps: TEST_SPS.to_vec(),
                    pps: TEST_PPS.to_vec(),
                }),
                audio_track: None,
            },
        )
        .unwrap();

        let au1 = vec![TEST_SPS.to_vec(), TEST_PPS.to_vec(), vec![0x65, 1, 2]];
        muxer
            .write_h26x(UnixNano::new(0), DurationH264::new(0), &au1)
            .await
            .unwrap();
        // A second IDR rolls the first segment.
        muxer
            .write_h26x(UnixNano::new(0), DurationH264::new(9000), &[vec![0x65, 3]])
            .await
            .unwrap();
        muxer
            .write_h26x(UnixNano::new(0), DurationH264::new(18_000), &[vec![0x65, 4]])
            .await
            .unwrap();

        let init = read_body(muxer.file("init.mp4", "", "", "").await).await;
        let segment = read_body(muxer.file("seg0.mp4", "", "", "").await).await;
        (init, segment)
    }

    #[tokio::test]
    async fn test_fmp4_round_trip() {
        let (init, segment) = test_fmp4_files().await;

        let http = Arc::new(MockHttpClient::new());
        http.serve(
            "/stream.m3u8",
            "#EXTM3U\n\
             #EXT-X-VERSION:9\n\
             #EXT-X-TARGETDURATION:1\n\
             #EXT-X-MEDIA-SEQUENCE:0\n\
             #EXT-X-MAP:URI=\"init.mp4\"\n\
             #EXTINF:0.1,\n\
             seg0.mp4\n\
             #EXT-X-ENDLIST\n",
        );
        http.serve("/init.mp4", init);
        http.serve("/seg0.mp4", segment);

        let (client, mut events) = new_test_client(http, "http://localhost/stream.m3u8");

        let Event::Tracks(tracks) = next_event(&mut events).await else {
            panic!("expected tracks");
        };
        assert_eq!(1, tracks.len());
        assert_eq!(common::VIDEO_TRACK_ID, tracks[0].id);

        let Event::Video(pts, nalus) = next_event(&mut events).await else {
            panic!("expected video");
        };
        assert_eq!(Duration::from_nanos(0), pts);
        assert_eq!(3, nalus.len());
        assert_eq!(TEST_SPS.to_vec(), nalus[0].to_vec());
        assert_eq!(vec![0x65, 1, 2], nalus[2].to_vec());

        client.close().await;
    }

    fn live_playlist(segment_count: usize) -> String {
        let mut playlist = "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-TARGETDURATION:1\n\
             #EXT-X-MEDIA-SEQUENCE:0\n"
            .to_owned();
        for i in 0..segment_count {
            playlist += &format!("#EXTINF:1,\nseg{i}.ts\n");
        }
        playlist
    }

    #[tokio::test]
    async fn test_live_start_position() {
        let http = Arc::new(MockHttpClient::new());
        http.serve("/stream.m3u8", live_playlist(4));
        for i in 0..4 {
            http.serve(&format!("/seg{i}.ts"), test_ts_segment());
        }

        let (client, mut events) = new_test_client(http.clone(), "http://localhost/stream.m3u8");

        let Event::Tracks(_) = next_event(&mut events).await else {
            panic!("expected tracks");
        };

        // The first downloaded segment sits at inverse index three.
        let first_segment = http
            .requests()
            .into_iter()
            .find(|path| path.ends_with(".ts"))
            .unwrap();
        assert_eq!("/seg1.ts", first_segment);

        client.close().await;
    }

    #[tokio::test]
    async fn test_live_not_enough_segments() {
        let http = Arc::new(MockHttpClient::new());
        http.serve("/stream.m3u8", live_playlist(2));

        let (client, _events) = new_test_client(http, "http://localhost/stream.m3u8");

        let err = client.wait().await.unwrap();
        assert_eq!("not enough segments", format!("{err}"));
        client.close().await;
    }

    #[tokio::test]
    async fn test_sequence_jump() {
        let jumped = "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-TARGETDURATION:1\n\
             #EXT-X-MEDIA-SEQUENCE:4\n\
             #EXTINF:1,\n\
             seg4.ts\n\
             #EXTINF:1,\n\
             seg5.ts\n\
             #EXTINF:1,\n\
             seg6.ts\n";

        let http = Arc::new(MockHttpClient::new());
        // Media sequence starts at two and jumps to four.
        http.serve(
            "/stream.m3u8",
            "#EXTM3U\n\
             #EXT-X-VERSION:3\n\
             #EXT-X-TARGETDURATION:1\n\
             #EXT-X-MEDIA-SEQUENCE:2\n\
             #EXTINF:1,\n\
             seg2.ts\n\
             #EXTINF:1,\n\
             seg3.ts\n\
             #EXTINF:1,\n\
             seg4.ts\n",
        );
        http.serve("/stream.m3u8", jumped);
        for i in 2..7 {
            http.serve(&format!("/seg{i}.ts"), test_ts_segment());
        }

        let (client, _events) = new_test_client(http, "http://localhost/stream.m3u8");

        let err = client.wait().await.unwrap();
        assert_eq!(
            "following segment not found or not ready yet",
            format!("{err}")
        );
        client.close().await;
    }
}
