// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    error::{SegmentFinalizeError, SegmentWriteError},
    part::MuxerPart,
    playlist::Playlist,
    types::IdCounter,
};
use common::{
    time::{DurationH264, UnixNano},
    AudioSample, AudioTrack, PartFinalized, SegmentContent, SegmentFinalized, VideoSample,
};
use std::{mem, sync::Arc};

// fmp4 segment under construction, a sequence of parts.
pub struct Fmp4Segment {
    id: u64,
    start_time: UnixNano,
    start_dts: DurationH264,
    segment_max_size: u64,
    low_latency: bool,
    audio_track: Option<AudioTrack>,
    playlist: Arc<Playlist>,

    name: String,
    size: u64,
    parts: Vec<Arc<PartFinalized>>,
    current_part: MuxerPart,
}

impl Fmp4Segment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        start_time: UnixNano,
        start_dts: DurationH264,
        segment_max_size: u64,
        low_latency: bool,
        audio_track: Option<&AudioTrack>,
        playlist: Arc<Playlist>,
        part_id_counter: &mut IdCounter,
    ) -> Self {
        let first_part_id = part_id_counter.next_id();
        Self {
            id,
            start_time,
            start_dts,
            segment_max_size,
            low_latency,
            audio_track: audio_track.cloned(),
            playlist,
            name: format!("seg{id}"),
            size: 0,
            parts: Vec::new(),
            current_part: MuxerPart::new(first_part_id, audio_track),
        }
    }

    pub fn start_dts(&self) -> DurationH264 {
        self.start_dts
    }

    pub fn start_time(&self) -> UnixNano {
        self.start_time
    }

    pub async fn write_video(
        &mut self,
        sample: VideoSample,
        adjusted_part_duration: DurationH264,
        next_sample_is_sync: bool,
        part_id_counter: &mut IdCounter,
    ) -> Result<(), SegmentWriteError> {
        let size = u64::try_from(sample.avcc.len())?;
        if (self.size + size) > self.segment_max_size {
            return Err(SegmentWriteError::MaximumSegmentSize);
        }

        self.current_part.write_video(sample);
        self.size += size;

        // Part boundaries land on sync samples so that most parts can
        // advertise INDEPENDENT=YES.
        if self.low_latency
            && next_sample_is_sync
            && self.current_part.duration().ok_or(SegmentWriteError::Duration)?
                >= adjusted_part_duration
        {
            self.switch_part(part_id_counter).await?;
        }

        Ok(())
    }

    pub async fn write_audio(
        &mut self,
        sample: AudioSample,
        adjusted_part_duration: DurationH264,
        audio_only: bool,
        part_id_counter: &mut IdCounter,
    ) -> Result<(), SegmentWriteError> {
        let size = u64::try_from(sample.au.len())?;
        if (self.size + size) > self.segment_max_size {
            return Err(SegmentWriteError::MaximumSegmentSize);
        }

        self.current_part.write_audio(sample);
        self.size += size;

        if self.low_latency
            && audio_only
            && self.current_part.duration().ok_or(SegmentWriteError::Duration)?
                >= adjusted_part_duration
        {
            self.switch_part(part_id_counter).await?;
        }

        Ok(())
    }

    async fn switch_part(&mut self, part_id_counter: &mut IdCounter) -> Result<(), SegmentWriteError> {
        let next_part = MuxerPart::new(part_id_counter.next_id(), self.audio_track.as_ref());
        let current_part = mem::replace(&mut self.current_part, next_part);
        let finalized_part = Arc::new(current_part.finalize()?);

        self.parts.push(finalized_part.clone());
        self.playlist.part_finalized(finalized_part).await;
        Ok(())
    }

    pub async fn finalize(
        mut self,
        next_dts: DurationH264,
    ) -> Result<SegmentFinalized, SegmentFinalizeError> {
        let finalized_part = Arc::new(self.current_part.finalize()?);

        if finalized_part.rendered_content.is_some() {
            if self.low_latency {
                self.playlist.part_finalized(finalized_part.clone()).await;
            }
            self.parts.push(finalized_part);
        }

        Ok(SegmentFinalized::new(
            self.id,
            self.start_time,
            self.name,
            SegmentContent::Parts(self.parts),
            next_dts
                .checked_sub(self.start_dts)
                .ok_or(SegmentFinalizeError::CalculateDuration)?,
        ))
    }
}
