// SPDX-License-Identifier: GPL-2.0-or-later

use crate::error::{GeneratePartError, PartFinalizeError};
use bytes::Bytes;
use common::{
    time::DurationH264, AudioSample, AudioTrack, PartFinalized, VideoSample, AUDIO_TRACK_ID,
    VIDEO_TRACK_ID,
};
use std::sync::Arc;

fn generate_part(
    video_samples: &[VideoSample],
    audio_samples: &[AudioSample],
    audio_timescale: u32,
) -> Result<Bytes, GeneratePartError> {
    /*
       moof
       - mfhd
       - traf (video)
         - tfhd
         - tfdt
         - trun
       - traf (audio)
         - tfhd
         - tfdt
         - trun
       mdat
    */

    let video_size: usize = video_samples.iter().map(|s| s.avcc.len()).sum();

    // The data offsets depend on the moof size, so the tree is built
    // once to measure it and again with the final values.
    let measure = generate_moof(video_samples, audio_samples, audio_timescale, 0, 0)?;
    let mdat_payload_offset = measure.size() + 8;

    let video_data_offset = i32::try_from(mdat_payload_offset)?;
    let audio_data_offset = i32::try_from(mdat_payload_offset + video_size)?;
    let moof = generate_moof(
        video_samples,
        audio_samples,
        audio_timescale,
        video_data_offset,
        audio_data_offset,
    )?;

    let mdat = mp4::Boxes::new(PartMdat {
        video_samples: video_samples.to_vec(),
        audio_samples: audio_samples.to_vec(),
    });

    let mut buf = Vec::with_capacity(moof.size() + mdat.size());
    moof.marshal(&mut buf)?;
    mdat.marshal(&mut buf)?;

    Ok(Bytes::from(buf))
}

fn generate_moof(
    video_samples: &[VideoSample],
    audio_samples: &[AudioSample],
    audio_timescale: u32,
    video_data_offset: i32,
    audio_data_offset: i32,
) -> Result<mp4::Boxes, GeneratePartError> {
    let mut moof = mp4::Boxes::new(mp4::Moof).with_child(mp4::Boxes::new(mp4::Mfhd {
        full_box: mp4::FullBox::default(),
        sequence_number: 0,
    }));

    if !video_samples.is_empty() {
        moof.children
            .push(generate_video_traf(video_samples, video_data_offset)?);
    }
    if !audio_samples.is_empty() {
        moof.children.push(generate_audio_traf(
            audio_samples,
            audio_timescale,
            audio_data_offset,
        )?);
    }

    Ok(moof)
}

fn generate_video_traf(
    samples: &[VideoSample],
    data_offset: i32,
) -> Result<mp4::Boxes, GeneratePartError> {
    let mut entries = Vec::with_capacity(samples.len());
    for sample in samples {
        let flags = if sample.random_access_present {
            0
        } else {
            mp4::SAMPLE_IS_NON_SYNC_SAMPLE
        };

        let pts_offset = sample
            .pts
            .checked_sub(sample.dts)
            .ok_or(GeneratePartError::DtsGreaterThanPts)?;
        if *pts_offset < 0 {
            return Err(GeneratePartError::DtsGreaterThanPts);
        }

        entries.push(mp4::TrunEntryV1 {
            sample_duration: u32::try_from(*sample.duration)?,
            sample_size: u32::try_from(sample.avcc.len())?,
            sample_flags: flags,
            sample_composition_time_offset: i32::try_from(*pts_offset)?,
        });
    }

    let base_media_decode_time = u64::try_from(*samples[0].dts)?;

    Ok(mp4::Boxes::new(mp4::Traf).with_children3(
        mp4::Boxes::new(mp4::Tfhd {
            full_box: mp4::FullBox {
                version: 0,
                flags: [2, 0, 0],
            },
            track_id: VIDEO_TRACK_ID,
            ..mp4::Tfhd::default()
        }),
        mp4::Boxes::new(mp4::Tfdt {
            flags: [0, 0, 0],
            // Sum of the decode durations of all earlier samples.
            base_media_decode_time: mp4::TfdtBaseMediaDecodeTime::V1(base_media_decode_time),
        }),
        mp4::Boxes::new(mp4::Trun {
            flags: mp4::u32_to_flags(
                mp4::TRUN_DATA_OFFSET_PRESENT
                    | mp4::TRUN_SAMPLE_DURATION_PRESENT
                    | mp4::TRUN_SAMPLE_SIZE_PRESENT
                    | mp4::TRUN_SAMPLE_FLAGS_PRESENT
                    | mp4::TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT,
            ),
            data_offset,
            first_sample_flags: 0,
            entries: mp4::TrunEntries::V1(entries),
        }),
    ))
}

fn generate_audio_traf(
    samples: &[AudioSample],
    timescale: u32,
    data_offset: i32,
) -> Result<mp4::Boxes, GeneratePartError> {
    let mut entries = Vec::with_capacity(samples.len());
    for sample in samples {
        entries.push(mp4::TrunEntryV1 {
            sample_duration: u32::try_from(sample.duration.in_timescale(timescale))?,
            sample_size: u32::try_from(sample.au.len())?,
            sample_flags: 0,
            sample_composition_time_offset: 0,
        });
    }

    let base_media_decode_time = u64::try_from(samples[0].pts.in_timescale(timescale))?;

    Ok(mp4::Boxes::new(mp4::Traf).with_children3(
        mp4::Boxes::new(mp4::Tfhd {
            full_box: mp4::FullBox {
                version: 0,
                flags: [2, 0, 0],
            },
            track_id: AUDIO_TRACK_ID,
            ..mp4::Tfhd::default()
        }),
        mp4::Boxes::new(mp4::Tfdt {
            flags: [0, 0, 0],
            base_media_decode_time: mp4::TfdtBaseMediaDecodeTime::V1(base_media_decode_time),
        }),
        mp4::Boxes::new(mp4::Trun {
            flags: mp4::u32_to_flags(
                mp4::TRUN_DATA_OFFSET_PRESENT
                    | mp4::TRUN_SAMPLE_DURATION_PRESENT
                    | mp4::TRUN_SAMPLE_SIZE_PRESENT,
            ),
            data_offset,
            first_sample_flags: 0,
            entries: mp4::TrunEntries::V1(entries),
        }),
    ))
}

struct PartMdat {
    video_samples: Vec<VideoSample>,
    audio_samples: Vec<AudioSample>,
}

impl mp4::ImmutableBox for PartMdat {
    fn box_type(&self) -> mp4::BoxType {
        mp4::TYPE_MDAT
    }

    fn size(&self) -> usize {
        self.video_samples
            .iter()
            .map(|sample| sample.avcc.len())
            .sum::<usize>()
            + self
                .audio_samples
                .iter()
                .map(|sample| sample.au.len())
                .sum::<usize>()
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), mp4::Mp4Error> {
        for sample in &self.video_samples {
            w.write_all(&sample.avcc)?;
        }
        for sample in &self.audio_samples {
            w.write_all(&sample.au)?;
        }
        Ok(())
    }
}

impl From<PartMdat> for Box<dyn mp4::ImmutableBox> {
    fn from(value: PartMdat) -> Self {
        Box::new(value)
    }
}

// fmp4 part under construction.
pub struct MuxerPart {
    pub id: u64,
    pub is_independent: bool,
    pub video_samples: Vec<VideoSample>,
    pub audio_samples: Vec<AudioSample>,
    audio_timescale: u32,
}

impl std::fmt::Debug for MuxerPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.id,
            self.is_independent,
            self.video_samples.len(),
            self.audio_samples.len()
        )
    }
}

impl MuxerPart {
    pub fn new(id: u64, audio_track: Option<&AudioTrack>) -> Self {
        Self {
            id,
            is_independent: false,
            video_samples: Vec::new(),
            audio_samples: Vec::new(),
            audio_timescale: audio_track.map_or(48000, AudioTrack::clock_rate),
        }
    }

    // Video duration if the part has video, audio duration otherwise.
    pub fn duration(&self) -> Option<DurationH264> {
        let mut total = DurationH264::new(0);
        if self.video_samples.is_empty() {
            for sample in &self.audio_samples {
                total = total.checked_add(sample.duration)?;
            }
        } else {
            for sample in &self.video_samples {
                total = total.checked_add(sample.duration)?;
            }
        }
        Some(total)
    }

    pub fn write_video(&mut self, sample: VideoSample) {
        if sample.random_access_present {
            self.is_independent = true;
        }
        self.video_samples.push(sample);
    }

    pub fn write_audio(&mut self, sample: AudioSample) {
        // Audio-only parts are always independent.
        if self.video_samples.is_empty() && self.audio_samples.is_empty() && !self.is_independent {
            self.is_independent = true;
        }
        self.audio_samples.push(sample);
    }

    pub fn finalize(self) -> Result<PartFinalized, PartFinalizeError> {
        let rendered_duration = self.duration().ok_or(PartFinalizeError::Duration)?;
        let rendered_content = if self.video_samples.is_empty() && self.audio_samples.is_empty() {
            None
        } else {
            Some(generate_part(
                &self.video_samples,
                &self.audio_samples,
                self.audio_timescale,
            )?)
        };

        Ok(PartFinalized {
            id: self.id,
            is_independent: self.is_independent,
            rendered_duration,
            rendered_content,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use pretty_hex::pretty_hex;

    #[test]
    fn test_generate_part_video_samples() {
        let samples = vec![
            VideoSample {
                pts: DurationH264::new(54000),
                dts: DurationH264::new(60000),
                avcc: Bytes::from_static(b"abcd"),
                random_access_present: true,
                duration: DurationH264::new(11999),
                ..VideoSample::default()
            },
            VideoSample {
                pts: DurationH264::new(63000),
                dts: DurationH264::new(72000),
                avcc: Bytes::from_static(b"efgh"),
                random_access_present: false,
                duration: DurationH264::new(9000),
                ..VideoSample::default()
            },
        ];
        // Samples with dts greater than pts are rejected.
        assert!(generate_part(&samples, &[], 48000).is_err());

        let samples = vec![
            VideoSample {
                pts: DurationH264::new(60000),
                dts: DurationH264::new(60000),
                avcc: Bytes::from_static(b"abcd"),
                random_access_present: true,
                duration: DurationH264::new(11999),
                ..VideoSample::default()
            },
            VideoSample {
                pts: DurationH264::new(81000),
                dts: DurationH264::new(71999),
                avcc: Bytes::from_static(b"efgh"),
                random_access_present: false,
                duration: DurationH264::new(9000),
                ..VideoSample::default()
            },
        ];

        let got = generate_part(&samples, &[], 48000).unwrap();

        let want = vec![
            0, 0, 0, 0x78, b'm', b'o', b'o', b'f', //
            0, 0, 0, 0x10, b'm', b'f', b'h', b'd', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Sequence number.
            0, 0, 0, 0x60, b't', b'r', b'a', b'f', // Video traf.
            0, 0, 0, 0x10, b't', b'f', b'h', b'd', // Video tfhd.
            0, 2, 0, 0, // FullBox, default-base-is-moof.
            0, 0, 0, 1, // Track id.
            0, 0, 0, 0x14, b't', b'f', b'd', b't', // Video tfdt.
            1, 0, 0, 0, // FullBox v1.
            0, 0, 0, 0, 0, 0, 0xea, 0x60, // BaseMediaDecodeTime.
            0, 0, 0, 0x34, b't', b'r', b'u', b'n', // Video trun.
            1, 0, 0xf, 1, // FullBox.
            0, 0, 0, 2, // Sample count.
            0, 0, 0, 0x80, // Data offset.
            0, 0, 0x2e, 0xdf, // Entry1 sample duration.
            0, 0, 0, 4, // Entry1 sample size.
            0, 0, 0, 0, // Entry1 sample flags.
            0, 0, 0, 0, // Entry1 composition time offset.
            0, 0, 0x23, 0x28, // Entry2 sample duration.
            0, 0, 0, 4, // Entry2 sample size.
            0, 1, 0, 0, // Entry2 sample flags.
            0, 0, 0x23, 0x29, // Entry2 composition time offset.
            0, 0, 0, 0x10, b'm', b'd', b'a', b't', //
            b'a', b'b', b'c', b'd', b'e', b'f', b'g', b'h', // Samples.
        ];
        assert_eq!(pretty_hex(&want), pretty_hex(&got.to_vec()));
    }

    #[test]
    fn test_part_duration_prefers_video() {
        let mut part = MuxerPart::new(0, None);
        part.write_audio(AudioSample {
            pts: DurationH264::new(0),
            au: Bytes::from_static(b"a"),
            duration: DurationH264::new(1024),
            ..AudioSample::default()
        });
        part.write_video(VideoSample {
            pts: DurationH264::new(0),
            dts: DurationH264::new(0),
            avcc: Bytes::from_static(b"v"),
            random_access_present: true,
            duration: DurationH264::new(3000),
            ..VideoSample::default()
        });
        assert_eq!(Some(DurationH264::new(3000)), part.duration());
    }

    #[test]
    fn test_empty_part_has_no_content() {
        let part = MuxerPart::new(3, None);
        let got = part.finalize().unwrap();
        assert_eq!(None, got.rendered_content);
        assert_eq!("part3", got.name());
    }
}
