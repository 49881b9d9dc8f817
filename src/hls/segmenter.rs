// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    error::SegmenterWriteError,
    playlist::Playlist,
    segment::Fmp4Segment,
    segment_ts::TsSegment,
    types::{IdCounter, MuxerVariant, TrackState},
};
use bytes::Bytes;
use codecs::{h264, h265};
use common::{
    time::{DurationH264, UnixNano, H264_MILLISECOND, H264_SECOND},
    AudioSample, VideoSample, VideoTrack,
};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex as StdMutex},
};

enum SegmentBuilder {
    Mpegts(TsSegment),
    Fmp4(Fmp4Segment),
}

impl SegmentBuilder {
    fn start_dts(&self) -> DurationH264 {
        match self {
            SegmentBuilder::Mpegts(seg) => seg.start_dts(),
            SegmentBuilder::Fmp4(seg) => seg.start_dts(),
        }
    }
}

// Scan result of one access unit.
struct AccessUnit {
    nalus: Vec<Bytes>,
    idr_present: bool,
    non_idr_present: bool,
    sps: Option<Vec<u8>>,
    pps: Option<Vec<u8>>,
    vps: Option<Vec<u8>>,
}

/// Partitions inbound samples into segments and parts.
pub struct Segmenter {
    variant: MuxerVariant,
    segment_duration: DurationH264,
    part_duration: DurationH264,
    segment_max_size: u64,
    tracks: Arc<StdMutex<TrackState>>,
    playlist: Arc<Playlist>,

    start_dts: Option<DurationH264>,
    dts_extractor: Option<h264::DtsExtractor>,
    last_sps: Vec<u8>,
    last_pps: Vec<u8>,
    params_changed: bool,

    current_segment: Option<SegmentBuilder>,
    segment_id_counter: IdCounter,
    part_id_counter: IdCounter,

    // One sample of lookahead so that durations can be computed
    // without a trailer flush.
    queued_video_sample: Option<VideoSample>,
    queued_audio_sample: Option<AudioSample>,

    first_segment_finalized: bool,
    sample_durations: HashSet<DurationH264>,
    adjusted_part_duration: DurationH264,
}

impl Segmenter {
    pub fn new(
        variant: MuxerVariant,
        segment_duration: DurationH264,
        part_duration: DurationH264,
        segment_max_size: u64,
        first_segment_id: u64,
        tracks: Arc<StdMutex<TrackState>>,
        playlist: Arc<Playlist>,
    ) -> Self {
        Self {
            variant,
            segment_duration,
            part_duration,
            segment_max_size,
            tracks,
            playlist,
            start_dts: None,
            dts_extractor: None,
            last_sps: Vec::new(),
            last_pps: Vec::new(),
            params_changed: false,
            current_segment: None,
            segment_id_counter: IdCounter::new(first_segment_id),
            part_id_counter: IdCounter::new(0),
            queued_video_sample: None,
            queued_audio_sample: None,
            first_segment_finalized: false,
            sample_durations: HashSet::new(),
            adjusted_part_duration: DurationH264::new(0),
        }
    }

    // iPhone iOS fails if part durations are less than 85% of the
    // advertised part target. Find a duration compatible with every
    // observed sample duration.
    fn adjust_part_duration(&mut self, du: DurationH264) -> Result<(), SegmenterWriteError> {
        if !self.variant.is_low_latency() || self.first_segment_finalized {
            return Ok(());
        }

        // Skip invalid durations.
        if du.is_zero() {
            return Ok(());
        }

        if !self.sample_durations.contains(&du) {
            self.sample_durations.insert(du);
            self.adjusted_part_duration =
                find_compatible_part_duration(self.part_duration, &self.sample_durations)
                    .ok_or(SegmenterWriteError::AdjustPartDuration)?;
        }
        Ok(())
    }

    fn scan_access_unit(&self, au: &[Vec<u8>], video: &VideoTrack) -> AccessUnit {
        let mut out = AccessUnit {
            nalus: Vec::with_capacity(au.len()),
            idr_present: false,
            non_idr_present: false,
            sps: None,
            pps: None,
            vps: None,
        };

        for nalu in au {
            match video {
                VideoTrack::H264 { .. } => match h264::nalu_type(nalu) {
                    h264::NALU_TYPE_IDR => out.idr_present = true,
                    h264::NALU_TYPE_NON_IDR => out.non_idr_present = true,
                    h264::NALU_TYPE_SPS => out.sps = Some(nalu.clone()),
                    h264::NALU_TYPE_PPS => out.pps = Some(nalu.clone()),
                    h264::NALU_TYPE_AUD => continue,
                    _ => {}
                },
                VideoTrack::H265 { .. } => {
                    let typ = h265::nalu_type(nalu);
                    if h265::is_random_access(typ) {
                        out.idr_present = true;
                    } else if typ <= 9 {
                        out.non_idr_present = true;
                    } else {
                        match typ {
                            h265::NALU_TYPE_VPS => out.vps = Some(nalu.clone()),
                            h265::NALU_TYPE_SPS => out.sps = Some(nalu.clone()),
                            h265::NALU_TYPE_PPS => out.pps = Some(nalu.clone()),
                            h265::NALU_TYPE_AUD => continue,
                            _ => {}
                        }
                    }
                }
            }
            out.nalus.push(Bytes::copy_from_slice(nalu));
        }

        out
    }

    // Applies in-band parameter set updates. A change forces a new
    // segment and a new init blob.
    fn update_video_params(&mut self, scan: &AccessUnit) {
        let Some(sps) = &scan.sps else {
            return;
        };
        let pps = scan.pps.clone().unwrap_or_else(|| self.last_pps.clone());

        if self.last_sps.is_empty() {
            self.last_sps = sps.clone();
            self.last_pps = pps;
            return;
        }
        if *sps == self.last_sps && pps == self.last_pps {
            return;
        }

        self.last_sps = sps.clone();
        self.last_pps = pps.clone();
        self.params_changed = true;

        let mut tracks = self.tracks.lock().expect("mutex poisoned");
        match &mut tracks.video {
            Some(VideoTrack::H264 {
                sps: track_sps,
                pps: track_pps,
            }) => {
                *track_sps = sps.clone();
                *track_pps = pps;
            }
            Some(VideoTrack::H265 {
                vps: track_vps,
                sps: track_sps,
                pps: track_pps,
            }) => {
                if let Some(vps) = &scan.vps {
                    *track_vps = vps.clone();
                }
                *track_sps = sps.clone();
                *track_pps = pps;
            }
            None => {}
        }
    }

    pub async fn write_h26x(
        &mut self,
        ntp: UnixNano,
        pts: DurationH264,
        au: &[Vec<u8>],
    ) -> Result<(), SegmenterWriteError> {
        let (video, has_audio) = {
            let tracks = self.tracks.lock().expect("mutex poisoned");
            (tracks.video.clone(), tracks.audio.is_some())
        };
        let Some(video) = video else {
            return Err(SegmenterWriteError::NoVideoTrack);
        };

        let scan = self.scan_access_unit(au, &video);
        if !scan.idr_present && !scan.non_idr_present {
            return Ok(());
        }
        self.update_video_params(&scan);

        let avcc = Bytes::from(h264::avcc_marshal(&scan.nalus));

        if self.start_dts.is_none() {
            // No segment exists yet, wait for the first IDR.
            if !scan.idr_present {
                return Ok(());
            }

            let sps_info = match &video {
                VideoTrack::H264 { sps, .. } => h264::SpsInfo::parse(sps).ok(),
                VideoTrack::H265 { .. } => None,
            };
            let mut extractor = h264::DtsExtractor::new(sps_info.as_ref());
            let dts = DurationH264::new(extractor.extract(*pts, true));
            self.dts_extractor = Some(extractor);
            self.start_dts = Some(dts);
        }

        let start_dts = self.start_dts.expect("set above");
        let dts = DurationH264::new(
            self.dts_extractor
                .as_mut()
                .expect("set with start_dts")
                .extract(*pts, scan.idr_present),
        );

        // Shift so that the session starts at zero.
        let rel_pts = pts
            .checked_sub(start_dts)
            .ok_or(SegmenterWriteError::ComputeSampleDuration)?;
        let rel_dts = dts
            .checked_sub(start_dts)
            .ok_or(SegmenterWriteError::ComputeSampleDuration)?;

        let sample = VideoSample {
            ntp,
            pts: rel_pts,
            dts: rel_dts,
            avcc,
            random_access_present: scan.idr_present,
            duration: DurationH264::new(0),
        };

        let Some(mut prev) = self.queued_video_sample.replace(sample) else {
            // First sample, nothing to release yet.
            return Ok(());
        };

        prev.duration = rel_dts
            .checked_sub(prev.dts)
            .ok_or(SegmenterWriteError::ComputeSampleDuration)?;
        if *prev.duration < 0 {
            prev.duration = DurationH264::new(0);
        }

        self.adjust_part_duration(prev.duration)?;

        self.ensure_segment(prev.ntp, prev.dts, true, has_audio);

        let next_is_sync = scan.idr_present;
        match self.current_segment.as_mut().expect("ensured above") {
            SegmentBuilder::Mpegts(seg) => seg.write_video(&prev)?,
            SegmentBuilder::Fmp4(seg) => {
                seg.write_video(
                    prev,
                    self.adjusted_part_duration,
                    next_is_sync,
                    &mut self.part_id_counter,
                )
                .await?;
            }
        }

        // Segments roll on IDR boundaries only.
        if scan.idr_present {
            let roll = {
                let segment = self.current_segment.as_ref().expect("ensured above");
                rel_dts
                    .checked_sub(segment.start_dts())
                    .ok_or(SegmenterWriteError::SwitchSegment)?
                    >= self.segment_duration
                    || self.params_changed
            };
            if roll {
                self.finalize_current_segment(rel_dts).await?;
            }
        }

        Ok(())
    }

    pub async fn write_audio(
        &mut self,
        ntp: UnixNano,
        pts: DurationH264,
        au: Bytes,
    ) -> Result<(), SegmenterWriteError> {
        let has_video = {
            let tracks = self.tracks.lock().expect("mutex poisoned");
            if tracks.audio.is_none() {
                return Err(SegmenterWriteError::NoAudioTrack);
            }
            tracks.video.is_some()
        };

        if self.start_dts.is_none() {
            if has_video {
                // Waiting for the first IDR.
                return Ok(());
            }
            self.start_dts = Some(pts);
        }
        let start_dts = self.start_dts.expect("set above");

        let rel_pts = pts
            .checked_sub(start_dts)
            .ok_or(SegmenterWriteError::ComputeSampleDuration)?;

        let sample = AudioSample {
            ntp,
            pts: rel_pts,
            au,
            duration: DurationH264::new(0),
        };

        let Some(mut prev) = self.queued_audio_sample.replace(sample) else {
            return Ok(());
        };

        prev.duration = rel_pts
            .checked_sub(prev.pts)
            .ok_or(SegmenterWriteError::ComputeSampleDuration)?;
        if *prev.duration < 0 {
            prev.duration = DurationH264::new(0);
        }

        if has_video {
            // Rolls are driven by the video track.
            if self.current_segment.is_none() {
                return Ok(());
            }
        } else {
            self.ensure_segment(prev.ntp, prev.pts, false, true);
            self.adjust_part_duration(prev.duration)?;
        }

        match self.current_segment.as_mut().expect("present") {
            SegmentBuilder::Mpegts(seg) => seg.write_audio(&prev)?,
            SegmentBuilder::Fmp4(seg) => {
                seg.write_audio(
                    prev,
                    self.adjusted_part_duration,
                    !has_video,
                    &mut self.part_id_counter,
                )
                .await?;
            }
        }

        if !has_video {
            let roll = {
                let segment = self.current_segment.as_ref().expect("present");
                rel_pts
                    .checked_sub(segment.start_dts())
                    .ok_or(SegmenterWriteError::SwitchSegment)?
                    >= self.segment_duration
            };
            if roll {
                self.finalize_current_segment(rel_pts).await?;
            }
        }

        Ok(())
    }

    fn ensure_segment(
        &mut self,
        start_time: UnixNano,
        start_dts: DurationH264,
        has_video: bool,
        has_audio: bool,
    ) {
        if self.current_segment.is_some() {
            return;
        }

        let audio_track = if has_audio {
            self.tracks.lock().expect("mutex poisoned").audio.clone()
        } else {
            None
        };

        let id = self.segment_id_counter.next_id();
        let builder = match self.variant {
            MuxerVariant::Mpegts => SegmentBuilder::Mpegts(TsSegment::new(
                id,
                start_time,
                start_dts,
                self.segment_max_size,
                has_video,
                audio_track.as_ref(),
            )),
            MuxerVariant::Fmp4 | MuxerVariant::LowLatency => {
                SegmentBuilder::Fmp4(Fmp4Segment::new(
                    id,
                    start_time,
                    start_dts,
                    self.segment_max_size,
                    self.variant.is_low_latency(),
                    audio_track.as_ref(),
                    self.playlist.clone(),
                    &mut self.part_id_counter,
                ))
            }
        };
        self.current_segment = Some(builder);
    }

    async fn finalize_current_segment(
        &mut self,
        next_dts: DurationH264,
    ) -> Result<(), SegmenterWriteError> {
        let Some(segment) = self.current_segment.take() else {
            return Ok(());
        };

        let finalized = match segment {
            SegmentBuilder::Mpegts(seg) => seg.finalize(next_dts)?,
            SegmentBuilder::Fmp4(seg) => seg.finalize(next_dts).await?,
        };
        self.playlist.on_segment_finalized(finalized).await;

        self.first_segment_finalized = true;

        if self.params_changed {
            self.params_changed = false;
            self.first_segment_finalized = false;

            // Restart the part duration learning for the new parameters.
            self.sample_durations.clear();
            self.adjusted_part_duration = DurationH264::new(0);
        }

        Ok(())
    }
}

fn part_duration_is_compatible(
    part_duration: DurationH264,
    sample_duration: DurationH264,
) -> Option<bool> {
    if sample_duration > part_duration {
        return Some(false);
    }

    let mut f = part_duration.checked_div(sample_duration)?;
    if !(part_duration.checked_rem(sample_duration)?).is_zero() {
        f = f.checked_add(DurationH264::new(1))?;
    }
    f = f.checked_mul(sample_duration)?;

    Some(
        part_duration
            > f.checked_mul(DurationH264::new(85))?
                .checked_div(DurationH264::new(100))?,
    )
}

fn part_duration_is_compatible_with_all(
    part_duration: DurationH264,
    sample_durations: &HashSet<DurationH264>,
) -> Option<bool> {
    for sd in sample_durations {
        if !part_duration_is_compatible(part_duration, *sd)? {
            return Some(false);
        }
    }
    Some(true)
}

fn find_compatible_part_duration(
    min_part_duration: DurationH264,
    sample_durations: &HashSet<DurationH264>,
) -> Option<DurationH264> {
    let mut i = min_part_duration;
    while *i < 5 * H264_SECOND {
        if part_duration_is_compatible_with_all(i, sample_durations)? {
            break;
        }
        i = i.checked_add(DurationH264::new(5 * H264_MILLISECOND))?;
    }
    Some(i)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_part_duration_is_compatible() {
        // A 100ms sample duration divides a 300ms part evenly.
        let part = DurationH264::new(300 * H264_MILLISECOND);
        let sample = DurationH264::new(100 * H264_MILLISECOND);
        assert_eq!(Some(true), part_duration_is_compatible(part, sample));

        // Samples longer than the part are incompatible.
        let long = DurationH264::new(400 * H264_MILLISECOND);
        assert_eq!(Some(false), part_duration_is_compatible(part, long));
    }

    #[test]
    fn test_find_compatible_part_duration() {
        let mut durations = HashSet::new();
        durations.insert(DurationH264::new(100 * H264_MILLISECOND));

        let got =
            find_compatible_part_duration(DurationH264::new(300 * H264_MILLISECOND), &durations)
                .unwrap();
        assert_eq!(DurationH264::new(300 * H264_MILLISECOND), got);
    }
}
