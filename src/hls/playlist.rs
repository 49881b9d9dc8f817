// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    error::FullPlaylistError,
    muxer::{
        HlsQuery, MuxerFileResponse, MUXER_FILE_RESPONSE_BAD_REQUEST, MUXER_FILE_RESPONSE_CANCELLED,
        MUXER_FILE_RESPONSE_ERROR, MUXER_FILE_RESPONSE_NOT_FOUND,
    },
    types::MuxerVariant,
};
use common::{
    part_name, time::{DurationH264, SECOND}, ArcMsgLogger, LogLevel, PartFinalized,
    SegmentFinalized,
};
use http::{HeaderName, HeaderValue, StatusCode};
use std::{
    collections::{HashMap, VecDeque},
    io::Cursor,
    sync::Arc,
};
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

struct Gap(DurationH264);

enum SegmentOrGap {
    Segment(Arc<SegmentFinalized>),
    Gap(Gap),
}

impl SegmentOrGap {
    fn duration(&self) -> DurationH264 {
        match self {
            SegmentOrGap::Segment(seg) => seg.duration(),
            SegmentOrGap::Gap(gap) => gap.0,
        }
    }
}

fn target_duration(segments: &VecDeque<SegmentOrGap>) -> i64 {
    let mut ret: i64 = 0;

    // EXTINF, when rounded to the nearest integer, must be <= EXT-X-TARGETDURATION.
    for sog in segments {
        let v = div_up(sog.duration().as_nanos(), SECOND);
        if v > ret {
            ret = v;
        }
    }

    ret
}

fn div_up(a: i64, b: i64) -> i64 {
    (a + (b - 1)) / b
}

fn part_target_duration(
    segments: &VecDeque<SegmentOrGap>,
    next_segment_parts: &[Arc<PartFinalized>],
) -> DurationH264 {
    let mut ret = DurationH264::new(0);

    for sog in segments {
        let SegmentOrGap::Segment(seg) = sog else {
            continue;
        };

        for part in seg.parts() {
            if part.rendered_duration > ret {
                ret = part.rendered_duration;
            }
        }
    }

    for part in next_segment_parts {
        if part.rendered_duration > ret {
            ret = part.rendered_duration;
        }
    }

    ret
}

pub struct Playlist {
    state: Arc<Mutex<PlaylistState>>,
}

impl Playlist {
    pub fn new(
        token: CancellationToken,
        logger: ArcMsgLogger,
        variant: MuxerVariant,
        segment_count: usize,
        first_segment_id: u64,
    ) -> Self {
        let state = Arc::new(Mutex::new(PlaylistState {
            is_cancelled: false,
            logger,
            variant,
            segment_count,
            segments: VecDeque::new(),
            segment_delete_count: 0,
            parts_by_name: HashMap::new(),
            next_segment_id: first_segment_id,
            next_segment_parts: Vec::new(),
            next_part_id: 0,

            playlists_on_hold: Vec::new(),
            parts_on_hold: Vec::new(),
        }));

        // Cancellation and cleanup.
        let state2 = state.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            let mut state = state2.lock().await;

            state.is_cancelled = true;

            // Drop pending request channels.
            state.playlists_on_hold.clear();
            state.parts_on_hold.clear();
        });

        Self { state }
    }

    async fn get_state_lock(&self) -> Option<MutexGuard<PlaylistState>> {
        let state = self.state.lock().await;
        // State cannot be used after being cancelled.
        if state.is_cancelled {
            return None;
        }
        Some(state)
    }

    pub async fn on_segment_finalized(&self, segment: SegmentFinalized) {
        let Some(mut state) = self.get_state_lock().await else {
            // Cancelled.
            return;
        };
        state.segment_finalized(&Arc::new(segment));
    }

    pub async fn part_finalized(&self, part: Arc<PartFinalized>) {
        let Some(mut state) = self.get_state_lock().await else {
            // Cancelled.
            return;
        };

        state.next_part_id = part.id + 1;
        state.parts_by_name.insert(part.name(), part.clone());
        state.next_segment_parts.push(part);

        state.check_pending();
    }

    #[allow(clippy::case_sensitive_file_extension_comparisons)]
    pub async fn file(&self, name: &str, query: &HlsQuery) -> MuxerFileResponse {
        if name == "stream.m3u8" {
            return self.playlist_reader(query).await;
        }

        if name.ends_with(".mp4") || name.ends_with(".ts") {
            return self.segment_reader(name).await;
        }

        // Apple bug?
        if name.ends_with(".mp") {
            return self.segment_reader(&[name, "4"].join("")).await;
        }

        MUXER_FILE_RESPONSE_NOT_FOUND
    }

    async fn blocking_playlist(
        &self,
        is_delta_update: bool,
        msn: u64,
        part: u64,
    ) -> MuxerFileResponse {
        let res_rx: oneshot::Receiver<MuxerFileResponse>;
        {
            let Some(mut state) = self.get_state_lock().await else {
                // Cancelled.
                return MUXER_FILE_RESPONSE_CANCELLED;
            };

            // If the _HLS_msn is greater than the Media Sequence Number of the
            // last Media Segment in the current Playlist plus two, or if the
            // _HLS_part exceeds the last Partial Segment in the current
            // Playlist by the Advance Part Limit, then the server SHOULD
            // immediately return Bad Request, such as HTTP 400.
            if msn > (state.next_segment_id + 1) {
                return MUXER_FILE_RESPONSE_BAD_REQUEST;
            }

            if state.has_content() && state.has_part(msn, part) {
                return state.playlist_response(is_delta_update);
            }

            let res_tx: oneshot::Sender<MuxerFileResponse>;
            (res_tx, res_rx) = oneshot::channel();
            state.playlists_on_hold.push(BlockingPlaylistRequest {
                is_delta_update,
                msn,
                part,
                res_tx,
            });
        }

        // Mutex must be released at this point.
        let Ok(res) = res_rx.await else {
            return MUXER_FILE_RESPONSE_CANCELLED;
        };
        res
    }

    async fn playlist_reader(&self, query: &HlsQuery) -> MuxerFileResponse {
        if let Some((msn, part)) = query.msn_and_part {
            return self
                .blocking_playlist(query.is_delta_update, msn, part)
                .await;
        }

        let Some(state) = self.get_state_lock().await else {
            // Cancelled.
            return MUXER_FILE_RESPONSE_CANCELLED;
        };
        if !state.has_content() {
            return MUXER_FILE_RESPONSE_NOT_FOUND;
        }

        state.playlist_response(query.is_delta_update)
    }

    async fn blocking_part(&self, file_name: &str) -> MuxerFileResponse {
        let res_rx: oneshot::Receiver<MuxerFileResponse>;
        {
            let Some(mut state) = self.get_state_lock().await else {
                // Cancelled.
                return MUXER_FILE_RESPONSE_CANCELLED;
            };

            let Some(base) = file_name.strip_suffix(".mp4") else {
                return MUXER_FILE_RESPONSE_NOT_FOUND;
            };
            if let Some(part) = state.parts_by_name.get(base) {
                return part_response(part);
            }

            // The next advertised part is served once it materializes.
            if file_name != format!("{}.mp4", part_name(state.next_part_id)) {
                return MUXER_FILE_RESPONSE_NOT_FOUND;
            }

            let res_tx: oneshot::Sender<MuxerFileResponse>;
            (res_tx, res_rx) = oneshot::channel();
            let req = BlockingPartRequest {
                part_name: base.to_owned(),
                part_id: state.next_part_id,
                res_tx,
            };
            state.parts_on_hold.push(req);
        }

        // Lock must be released at this point.
        let Ok(res) = res_rx.await else {
            return MUXER_FILE_RESPONSE_CANCELLED;
        };
        res
    }

    async fn segment_reader(&self, file_name: &str) -> MuxerFileResponse {
        if file_name.starts_with("seg") {
            let Some(state) = self.get_state_lock().await else {
                // Cancelled.
                return MUXER_FILE_RESPONSE_CANCELLED;
            };

            let Some(base) = file_name.strip_suffix(state.variant.segment_extension()) else {
                return MUXER_FILE_RESPONSE_NOT_FOUND;
            };

            let Some(segment) = state.segment_by_name(base) else {
                return MUXER_FILE_RESPONSE_NOT_FOUND;
            };

            let content_type = match state.variant {
                MuxerVariant::Mpegts => "video/MP2T",
                MuxerVariant::Fmp4 | MuxerVariant::LowLatency => "video/mp4",
            };

            return MuxerFileResponse {
                status: StatusCode::OK,
                headers: Some(HashMap::from([(
                    #[allow(clippy::unwrap_used)]
                    HeaderName::from_bytes(b"Content-Type").unwrap(),
                    #[allow(clippy::unwrap_used)]
                    HeaderValue::from_str(content_type).unwrap(),
                )])),
                body: Some(segment.reader()),
            };
        }

        if file_name.starts_with("part") {
            let low_latency = {
                let Some(state) = self.get_state_lock().await else {
                    return MUXER_FILE_RESPONSE_CANCELLED;
                };
                state.variant.is_low_latency()
            };
            if !low_latency {
                return MUXER_FILE_RESPONSE_NOT_FOUND;
            }
            return self.blocking_part(file_name).await;
        }

        MUXER_FILE_RESPONSE_NOT_FOUND
    }
}

fn part_response(part: &Arc<PartFinalized>) -> MuxerFileResponse {
    MuxerFileResponse {
        status: StatusCode::OK,
        headers: Some(HashMap::from([(
            #[allow(clippy::unwrap_used)]
            HeaderName::from_bytes(b"Content-Type").unwrap(),
            #[allow(clippy::unwrap_used)]
            HeaderValue::from_str("video/mp4").unwrap(),
        )])),
        body: Some(part.reader()),
    }
}

#[derive(Debug)]
struct BlockingPlaylistRequest {
    is_delta_update: bool,
    msn: u64,
    part: u64,
    res_tx: oneshot::Sender<MuxerFileResponse>,
}

#[derive(Debug)]
struct BlockingPartRequest {
    part_name: String,
    part_id: u64,
    res_tx: oneshot::Sender<MuxerFileResponse>,
}

struct PlaylistState {
    is_cancelled: bool,
    logger: ArcMsgLogger,
    variant: MuxerVariant,
    segment_count: usize,
    segments: VecDeque<SegmentOrGap>,
    segment_delete_count: usize,
    parts_by_name: HashMap<String, Arc<PartFinalized>>,
    next_segment_id: u64,
    next_segment_parts: Vec<Arc<PartFinalized>>,
    next_part_id: u64,

    playlists_on_hold: Vec<BlockingPlaylistRequest>,
    parts_on_hold: Vec<BlockingPartRequest>,
}

impl PlaylistState {
    fn log(&self, level: LogLevel, msg: &str) {
        self.logger.log(level, &format!("playlist: {msg}"));
    }

    fn playlist_response(&self, is_delta_update: bool) -> MuxerFileResponse {
        let body = match self.full_playlist(is_delta_update) {
            Ok(v) => v,
            Err(e) => {
                self.log(LogLevel::Error, &format!("full playlist: {e}"));
                return MUXER_FILE_RESPONSE_ERROR;
            }
        };
        MuxerFileResponse {
            status: StatusCode::OK,
            headers: Some(HashMap::from([(
                #[allow(clippy::unwrap_used)]
                HeaderName::from_bytes(b"Content-Type").unwrap(),
                #[allow(clippy::unwrap_used)]
                HeaderValue::from_str("application/x-mpegURL").unwrap(),
            )])),
            body: Some(Box::new(Cursor::new(body))),
        }
    }

    fn check_pending(&mut self) {
        if self.has_content() {
            let mut i = 0;
            while i < self.playlists_on_hold.len() {
                if self.has_part(
                    self.playlists_on_hold[i].msn,
                    self.playlists_on_hold[i].part,
                ) {
                    let req = self.playlists_on_hold.swap_remove(i);
                    _ = req.res_tx.send(self.playlist_response(req.is_delta_update));
                } else {
                    i += 1;
                }
            }
        }

        let mut i = 0;
        while i < self.parts_on_hold.len() {
            if self.next_part_id <= self.parts_on_hold[i].part_id {
                i += 1;
            } else {
                let req = self.parts_on_hold.swap_remove(i);
                let Some(part) = self.parts_by_name.get(&req.part_name) else {
                    self.log(LogLevel::Error, "pending part vanished");
                    _ = req.res_tx.send(MUXER_FILE_RESPONSE_ERROR);
                    continue;
                };
                _ = req.res_tx.send(part_response(part));
            }
        }
    }

    fn num_segments(&self) -> usize {
        self.segments
            .iter()
            .filter(|sog| matches!(sog, SegmentOrGap::Segment(_)))
            .count()
    }

    fn has_content(&self) -> bool {
        if self.variant.is_low_latency() {
            self.num_segments() >= 1
        } else {
            self.num_segments() >= 2
        }
    }

    fn has_part(&self, mut segment_id: u64, mut part_id: u64) -> bool {
        if !self.has_content() {
            return false;
        }

        for sog in &self.segments {
            let SegmentOrGap::Segment(seg) = sog else {
                continue;
            };

            if segment_id != seg.id() {
                continue;
            }

            // If the Client requests a Part Index greater than that of the
            // final Partial Segment of the Parent Segment, the Server MUST
            // treat the request as one for Part Index 0 of the following
            // Parent Segment.
            if part_id >= u64::try_from(seg.parts().len()).expect("usize to fit u64") {
                segment_id += 1;
                part_id = 0;
                continue;
            }

            return true;
        }

        if segment_id != self.next_segment_id {
            return false;
        }

        if part_id >= u64::try_from(self.next_segment_parts.len()).expect("usize to fit u64") {
            return false;
        }

        true
    }

    fn segment_by_name(&self, name: &str) -> Option<&SegmentFinalized> {
        for sog in &self.segments {
            if let SegmentOrGap::Segment(seg) = sog {
                if seg.name() == name {
                    return Some(seg);
                }
            }
        }
        None
    }

    fn segment_finalized(&mut self, segment: &Arc<SegmentFinalized>) {
        // Initial gaps stabilize the media sequence window of clients
        // that start before the first segment finishes.
        if self.variant.is_low_latency() && self.segments.is_empty() {
            for _ in 0..self.segment_count {
                self.segments
                    .push_back(SegmentOrGap::Gap(Gap(segment.duration())));
            }
        }

        self.segments
            .push_back(SegmentOrGap::Segment(segment.clone()));

        self.next_segment_id = segment.id() + 1;

        self.next_segment_parts.clear();

        if self.segments.len() > self.segment_count {
            let to_delete = self.segments.pop_front().expect("len > 0");

            if let SegmentOrGap::Segment(to_delete_seg) = to_delete {
                for part in to_delete_seg.parts() {
                    self.parts_by_name.remove(&part.name());
                }
            }

            self.segment_delete_count += 1;
        }

        self.check_pending();
    }

    #[allow(clippy::too_many_lines)]
    fn full_playlist(&self, is_delta_update: bool) -> Result<Vec<u8>, FullPlaylistError> {
        let low_latency = self.variant.is_low_latency();
        let is_delta_update = is_delta_update && low_latency;

        let mut cnt = "#EXTM3U\n".to_owned();
        cnt += &format!("#EXT-X-VERSION:{}\n", self.variant.playlist_version());

        let target_duration = target_duration(&self.segments);
        cnt += &format!("#EXT-X-TARGETDURATION:{target_duration}\n");

        let skip_boundary = f64::from(u32::try_from(target_duration)?) * 6.0;

        if low_latency {
            let part_target_duration =
                part_target_duration(&self.segments, &self.next_segment_parts);

            // The value is an enumerated-string whose value is YES if the
            // server supports Blocking Playlist Reload.
            cnt += "#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES";

            // The value is a decimal-floating-point number of seconds that
            // indicates the server-recommended minimum distance from the end
            // of the Playlist at which clients should begin to play or to
            // which they should seek when playing in Low-Latency Mode. Its
            // value MUST be at least twice the Part Target Duration.
            cnt += &format!(
                ",PART-HOLD-BACK={:.5}",
                part_target_duration.as_secs_f64() * 2.5
            );

            // Indicates that the Server can produce Playlist Delta Updates in
            // response to the _HLS_skip Delivery Directive. Its value is the
            // Skip Boundary, a decimal-floating-point number of seconds. The
            // Skip Boundary MUST be at least six times the Target Duration.
            cnt += &format!(",CAN-SKIP-UNTIL={skip_boundary}");

            cnt += "\n";

            cnt += &format!(
                "#EXT-X-PART-INF:PART-TARGET={}\n",
                part_target_duration.as_secs_f64(),
            );
        }

        cnt += &format!("#EXT-X-MEDIA-SEQUENCE:{}\n", self.segment_delete_count);

        let mut skipped = 0;
        if is_delta_update {
            let mut cur_duration = DurationH264::new(0);
            let mut shown = 0;
            for sog in &self.segments {
                cur_duration = cur_duration
                    .checked_add(sog.duration())
                    .ok_or(FullPlaylistError::DurationOverflowing)?;
                if cur_duration.as_secs_f64() >= skip_boundary {
                    break;
                }
                shown += 1;
            }
            skipped = self.segments.len() - shown;
            cnt += &format!("#EXT-X-SKIP:SKIPPED-SEGMENTS={skipped}\n");
        } else if self.variant != MuxerVariant::Mpegts {
            cnt += "#EXT-X-MAP:URI=\"init.mp4\"\n";
        }

        let extension = self.variant.segment_extension();

        for (i, sog) in self.segments.iter().enumerate() {
            if i < skipped {
                continue;
            }

            match sog {
                SegmentOrGap::Segment(seg) => {
                    if (self.segments.len() - i) <= 2 {
                        if let Some(start_time) = seg.start_time().as_chrono() {
                            cnt += &format!(
                                "#EXT-X-PROGRAM-DATE-TIME:{}\n",
                                start_time.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                            );
                        }

                        if low_latency {
                            for part in seg.parts() {
                                cnt += &format!(
                                    "#EXT-X-PART:DURATION={0:.5},URI=\"{1}.mp4\"",
                                    part.rendered_duration.as_secs_f64(),
                                    part.name(),
                                );
                                if part.is_independent {
                                    cnt += ",INDEPENDENT=YES";
                                }
                                cnt += "\n";
                            }
                        }
                    }

                    cnt += &format!("#EXTINF:{0:.5},\n", seg.duration().as_secs_f64());
                    cnt += &format!("{}{extension}\n", seg.name());
                }
                SegmentOrGap::Gap(gap) => {
                    cnt += "#EXT-X-GAP\n";
                    cnt += &format!("#EXTINF:{0:.5},\n", gap.0.as_secs_f64());
                    cnt += &format!("gap{extension}\n");
                }
            }
        }

        if low_latency {
            for part in &self.next_segment_parts {
                cnt += &format!(
                    "#EXT-X-PART:DURATION={0:.5},URI=\"{1}.mp4\"",
                    part.rendered_duration.as_secs_f64(),
                    part.name(),
                );
                if part.is_independent {
                    cnt += ",INDEPENDENT=YES";
                }
                cnt += "\n";
            }

            // The preload hint must always be present,
            // otherwise hls.js goes into a loop.
            cnt += &format!(
                "#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"{}.mp4\"\n",
                &part_name(self.next_part_id),
            );
        }

        Ok(cnt.into())
    }
}

pub fn primary_playlist(version: u8, codecs: &[String]) -> MuxerFileResponse {
    let body = [
        "#EXTM3U\n",
        &format!("#EXT-X-VERSION:{version}\n"),
        "#EXT-X-INDEPENDENT-SEGMENTS\n",
        "\n",
        &format!(
            "#EXT-X-STREAM-INF:BANDWIDTH=200000,CODECS=\"{}\"\n",
            codecs.join(",")
        ),
        "stream.m3u8\n",
    ]
    .join("")
    .into_bytes();

    MuxerFileResponse {
        status: StatusCode::OK,
        headers: Some(HashMap::from([(
            #[allow(clippy::unwrap_used)]
            HeaderName::from_bytes(b"Content-Type").unwrap(),
            #[allow(clippy::unwrap_used)]
            HeaderValue::from_str("application/x-mpegURL").unwrap(),
        )])),
        body: Some(Box::new(Cursor::new(body))),
    }
}
