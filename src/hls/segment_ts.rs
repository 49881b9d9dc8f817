// SPDX-License-Identifier: GPL-2.0-or-later

use crate::error::{SegmentFinalizeError, SegmentWriteError};
use bytes::Bytes;
use codecs::{aac, h264};
use common::{
    time::{DurationH264, UnixNano, H264_MILLISECOND},
    AudioSample, AudioTrack, SegmentContent, SegmentFinalized, VideoSample,
};
use mpegts::{EsInfo, STREAM_ID_AUDIO, STREAM_ID_VIDEO, STREAM_TYPE_ADTS_AAC, STREAM_TYPE_H264};

pub const VIDEO_PID: u16 = 256;
pub const AUDIO_PID: u16 = 257;

// Timestamps are offset from the program clock so that decoders have
// time to buffer before the first access unit is due.
const PCR_OFFSET: DurationH264 = DurationH264::new(400 * H264_MILLISECOND);

// One PCR every third PES packet.
const PCR_PERIOD: u64 = 3;

struct AdtsParams {
    object_type: u8,
    sample_rate_index: u8,
    channel_count: u16,
}

// MPEG-TS segment under construction, a monolithic packet buffer.
pub struct TsSegment {
    id: u64,
    start_time: UnixNano,
    start_dts: DurationH264,
    segment_max_size: u64,

    muxer: mpegts::Muxer,
    pes_counter: u64,
    audio_only: bool,
    adts_params: Option<AdtsParams>,
    name: String,
}

impl TsSegment {
    pub fn new(
        id: u64,
        start_time: UnixNano,
        start_dts: DurationH264,
        segment_max_size: u64,
        has_video: bool,
        audio_track: Option<&AudioTrack>,
    ) -> Self {
        let mut streams = Vec::new();
        if has_video {
            streams.push(EsInfo {
                pid: VIDEO_PID,
                stream_type: STREAM_TYPE_H264,
            });
        }

        let adts_params = audio_track.and_then(|track| {
            let AudioTrack::Mpeg4Audio {
                object_type,
                sample_rate,
                channel_count,
                ..
            } = track
            else {
                return None;
            };
            streams.push(EsInfo {
                pid: AUDIO_PID,
                stream_type: STREAM_TYPE_ADTS_AAC,
            });
            Some(AdtsParams {
                object_type: *object_type,
                sample_rate_index: aac::sample_rate_index(*sample_rate).unwrap_or(4),
                channel_count: *channel_count,
            })
        });

        // The program clock rides on the video pid unless the segment
        // is audio-only.
        let pcr_pid = if has_video { VIDEO_PID } else { AUDIO_PID };

        let mut muxer = mpegts::Muxer::new(streams, pcr_pid);
        muxer.write_tables();

        Self {
            id,
            start_time,
            start_dts,
            segment_max_size,
            muxer,
            pes_counter: 0,
            audio_only: !has_video,
            adts_params,
            name: format!("seg{id}"),
        }
    }

    pub fn start_dts(&self) -> DurationH264 {
        self.start_dts
    }

    pub fn start_time(&self) -> UnixNano {
        self.start_time
    }

    fn next_pcr(&mut self, on_pcr_pid: bool, dts: DurationH264) -> Option<u64> {
        if !on_pcr_pid {
            return None;
        }
        let due = self.pes_counter % PCR_PERIOD == 0;
        self.pes_counter += 1;
        if due {
            u64::try_from(*dts).ok()
        } else {
            None
        }
    }

    pub fn write_video(&mut self, sample: &VideoSample) -> Result<(), SegmentWriteError> {
        let size = u64::try_from(sample.avcc.len())?;
        if u64::try_from(self.muxer.len())? + size > self.segment_max_size {
            return Err(SegmentWriteError::MaximumSegmentSize);
        }

        // Mobile players require an access unit delimiter before
        // every access unit.
        let mut nalus = vec![Bytes::from_static(&h264::AUD_NALU)];
        nalus.extend(
            h264::avcc_unmarshal(&sample.avcc, 4)?
                .into_iter()
                .filter(|n| h264::nalu_type(n) != h264::NALU_TYPE_AUD),
        );
        let payload = h264::annexb_marshal(&nalus);

        let pts = u64::try_from(*sample.pts.checked_add(PCR_OFFSET).ok_or(SegmentWriteError::Duration)?)?;
        let dts = u64::try_from(*sample.dts.checked_add(PCR_OFFSET).ok_or(SegmentWriteError::Duration)?)?;
        let pcr = self.next_pcr(true, sample.dts);

        self.muxer.write_pes(
            VIDEO_PID,
            STREAM_ID_VIDEO,
            pts,
            Some(dts),
            sample.random_access_present,
            pcr,
            &payload,
        );
        Ok(())
    }

    pub fn write_audio(&mut self, sample: &AudioSample) -> Result<(), SegmentWriteError> {
        let size = u64::try_from(sample.au.len())?;
        if u64::try_from(self.muxer.len())? + size > self.segment_max_size {
            return Err(SegmentWriteError::MaximumSegmentSize);
        }

        let Some(params) = &self.adts_params else {
            return Ok(());
        };
        let payload = aac::marshal_adts(
            params.object_type,
            params.sample_rate_index,
            params.channel_count,
            &sample.au,
        );

        let pts = u64::try_from(*sample.pts.checked_add(PCR_OFFSET).ok_or(SegmentWriteError::Duration)?)?;
        let pcr = self.next_pcr(self.audio_only, sample.pts);

        self.muxer.write_pes(
            AUDIO_PID,
            STREAM_ID_AUDIO,
            pts,
            None,
            true,
            pcr,
            &payload,
        );
        Ok(())
    }

    pub fn finalize(
        mut self,
        next_dts: DurationH264,
    ) -> Result<SegmentFinalized, SegmentFinalizeError> {
        Ok(SegmentFinalized::new(
            self.id,
            self.start_time,
            self.name,
            SegmentContent::Bytes(Bytes::from(self.muxer.take())),
            next_dts
                .checked_sub(self.start_dts)
                .ok_or(SegmentFinalizeError::CalculateDuration)?,
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_video_sample(avcc: Vec<u8>, pts: i64) -> VideoSample {
        VideoSample {
            pts: DurationH264::new(pts),
            dts: DurationH264::new(pts),
            avcc: Bytes::from(avcc),
            random_access_present: true,
            duration: DurationH264::new(3000),
            ..VideoSample::default()
        }
    }

    #[tokio::test]
    async fn test_write_video_round_trip() {
        let mut segment =
            TsSegment::new(0, UnixNano::new(0), DurationH264::new(0), 50_000_000, true, None);
        let avcc = h264::avcc_marshal(&[vec![0x65, 1, 2, 3]]);
        segment.write_video(&test_video_sample(avcc, 90_000)).unwrap();

        let finalized = segment.finalize(DurationH264::new(93_000)).unwrap();
        assert_eq!(DurationH264::new(93_000), finalized.duration());

        let mut content = Vec::new();
        let mut reader = finalized.reader();
        use tokio::io::AsyncReadExt;
        reader.read_to_end(&mut content).await.unwrap();

        let demuxed = mpegts::parse_segment(&content).unwrap();
        assert_eq!(1, demuxed.packets.len());
        let packet = &demuxed.packets[0];
        // 400ms program clock offset.
        assert_eq!(Some(126_000), packet.pts);
        assert_eq!(Some(126_000), packet.dts);

        let nalus = h264::annexb_unmarshal(&packet.payload).unwrap();
        assert_eq!(h264::NALU_TYPE_AUD, h264::nalu_type(&nalus[0]));
        assert_eq!(&[0x65, 1, 2, 3][..], &nalus[1]);
    }

    #[test]
    fn test_maximum_segment_size() {
        let mut segment = TsSegment::new(0, UnixNano::new(0), DurationH264::new(0), 10, true, None);
        let avcc = h264::avcc_marshal(&[vec![0x65; 100]]);
        assert!(matches!(
            segment.write_video(&test_video_sample(avcc, 0)),
            Err(SegmentWriteError::MaximumSegmentSize)
        ));
    }
}
