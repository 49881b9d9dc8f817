// SPDX-License-Identifier: GPL-2.0-or-later

use crate::error::GenerateInitError;
use bytes::Bytes;
use codecs::{h264, h265, opus};
use common::{AudioTrack, VideoTrack, AUDIO_TRACK_ID, VIDEO_TRACK_ID};
use common::time::H264_TIMESCALE;

pub fn generate_init(
    video: Option<&VideoTrack>,
    audio: Option<&AudioTrack>,
) -> Result<Bytes, GenerateInitError> {
    /*
       - ftyp
       - moov
         - mvhd
         - trak (video)
         - trak (audio)
         - mvex
           - trex (video)
           - trex (audio)
    */

    let ftyp = mp4::Boxes::new(mp4::Ftyp {
        major_brand: *b"mp42",
        minor_version: 1,
        compatible_brands: vec![
            mp4::CompatibleBrandElem(*b"mp41"),
            mp4::CompatibleBrandElem(*b"mp42"),
            mp4::CompatibleBrandElem(*b"isom"),
            mp4::CompatibleBrandElem(*b"hlsf"),
        ],
    });

    let mut moov = mp4::Boxes::new(mp4::Moov).with_child(mp4::Boxes::new(mp4::Mvhd {
        timescale: 1000,
        rate: 65536,
        volume: 256,
        matrix: [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000],
        next_track_id: AUDIO_TRACK_ID + 1,
        ..mp4::Mvhd::default()
    }));

    let mut mvex = mp4::Boxes::new(mp4::Mvex);

    if let Some(video) = video {
        moov.children.push(generate_video_trak(video)?);
        mvex.children.push(mp4::Boxes::new(mp4::Trex {
            track_id: VIDEO_TRACK_ID,
            default_sample_description_index: 1,
            ..mp4::Trex::default()
        }));
    }
    if let Some(audio) = audio {
        moov.children.push(generate_audio_trak(audio));
        mvex.children.push(mp4::Boxes::new(mp4::Trex {
            track_id: AUDIO_TRACK_ID,
            default_sample_description_index: 1,
            ..mp4::Trex::default()
        }));
    }

    moov.children.push(mvex);

    let size = ftyp.size() + moov.size();
    let mut buf = Vec::with_capacity(size);

    ftyp.marshal(&mut buf)?;
    moov.marshal(&mut buf)?;

    Ok(Bytes::from(buf))
}

fn generate_video_trak(video: &VideoTrack) -> Result<mp4::Boxes, GenerateInitError> {
    /*
       trak
       - tkhd
       - mdia
         - mdhd
         - hdlr
         - minf
           - vmhd
           - dinf
             - dref
               - url
           - stbl
             - stsd
               - avc1 | hvc1
                 - avcC | hvcC
                 - btrt
             - stts
             - stsc
             - stsz
             - stco
    */

    let (width, height, sample_description) = match video {
        VideoTrack::H264 { sps, pps } => {
            let info = h264::SpsInfo::parse(sps)?;
            let config = h264::AvcConfig {
                sps: sps.clone(),
                pps: pps.clone(),
                length_size: 4,
            };
            let entry = mp4::Boxes::new(mp4::Avc1 {
                sample_entry: mp4::SampleEntry {
                    reserved: [0, 0, 0, 0, 0, 0],
                    data_reference_index: 1,
                },
                width: info.width,
                height: info.height,
                horiz_resolution: 4_718_592,
                vert_resolution: 4_718_592,
                frame_count: 1,
                depth: 24,
                pre_defined3: -1,
                ..mp4::Avc1::default()
            })
            .with_children2(
                mp4::Boxes::new(RawPayloadBox {
                    typ: *b"avcC",
                    payload: config.marshal(),
                }),
                mp4::Boxes::new(mp4::Btrt {
                    buffer_size_db: 0,
                    max_bitrate: 1_000_000,
                    avg_bitrate: 1_000_000,
                }),
            );
            (info.width, info.height, entry)
        }
        VideoTrack::H265 { vps, sps, pps } => {
            let info = h265::SpsInfo::parse(sps)?;
            let entry = mp4::Boxes::new(mp4::Hvc1(mp4::Avc1 {
                sample_entry: mp4::SampleEntry {
                    reserved: [0, 0, 0, 0, 0, 0],
                    data_reference_index: 1,
                },
                width: info.width,
                height: info.height,
                horiz_resolution: 4_718_592,
                vert_resolution: 4_718_592,
                frame_count: 1,
                depth: 24,
                pre_defined3: -1,
                ..mp4::Avc1::default()
            }))
            .with_children2(
                mp4::Boxes::new(RawPayloadBox {
                    typ: *b"hvcC",
                    payload: h265::hvcc_marshal(vps, sps, pps, &info),
                }),
                mp4::Boxes::new(mp4::Btrt {
                    buffer_size_db: 0,
                    max_bitrate: 1_000_000,
                    avg_bitrate: 1_000_000,
                }),
            );
            (info.width, info.height, entry)
        }
    };

    let stbl = mp4::Boxes::new(mp4::Stbl).with_children5(
        mp4::Boxes::new(mp4::Stsd {
            full_box: mp4::FullBox::default(),
            entry_count: 1,
        })
        .with_child(sample_description),
        mp4::Boxes::new(mp4::Stts::default()),
        mp4::Boxes::new(mp4::Stsc::default()),
        mp4::Boxes::new(mp4::Stsz::default()),
        mp4::Boxes::new(mp4::Stco::default()),
    );

    let minf = mp4::Boxes::new(mp4::Minf).with_children3(
        mp4::Boxes::new(mp4::Vmhd {
            full_box: mp4::FullBox {
                version: 0,
                flags: [0, 0, 1],
            },
            graphics_mode: 0,
            opcolor: [0, 0, 0],
        }),
        generate_dinf(),
        stbl,
    );

    Ok(mp4::Boxes::new(mp4::Trak).with_children2(
        mp4::Boxes::new(mp4::Tkhd {
            full_box: mp4::FullBox {
                version: 0,
                flags: [0, 0, 3],
            },
            track_id: VIDEO_TRACK_ID,
            width: u32::from(width) * 65536,
            height: u32::from(height) * 65536,
            matrix: [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000],
            ..mp4::Tkhd::default()
        }),
        mp4::Boxes::new(mp4::Mdia).with_children3(
            mp4::Boxes::new(mp4::Mdhd {
                timescale: H264_TIMESCALE,
                language: *b"und",
                ..mp4::Mdhd::default()
            }),
            mp4::Boxes::new(mp4::Hdlr {
                handler_type: *b"vide",
                name: "VideoHandler".to_owned(),
                ..mp4::Hdlr::default()
            }),
            minf,
        ),
    ))
}

fn generate_audio_trak(audio: &AudioTrack) -> mp4::Boxes {
    let clock_rate = audio.clock_rate();
    let channel_count = audio.channel_count();

    let sample_description = match audio {
        AudioTrack::Mpeg4Audio { config, .. } => mp4::Boxes::new(mp4::Mp4a {
            sample_entry: mp4::SampleEntry {
                reserved: [0, 0, 0, 0, 0, 0],
                data_reference_index: 1,
            },
            channel_count,
            sample_size: 16,
            sample_rate: clock_rate.min(65535) << 16,
            ..mp4::Mp4a::default()
        })
        .with_child(mp4::Boxes::new(RawPayloadBox {
            typ: *b"esds",
            payload: esds_payload(AUDIO_TRACK_ID, config),
        })),
        AudioTrack::Opus { channel_count } => mp4::Boxes::new(mp4::Opus(mp4::Mp4a {
            sample_entry: mp4::SampleEntry {
                reserved: [0, 0, 0, 0, 0, 0],
                data_reference_index: 1,
            },
            channel_count: *channel_count,
            sample_size: 16,
            sample_rate: clock_rate.min(65535) << 16,
            ..mp4::Mp4a::default()
        }))
        .with_child(mp4::Boxes::new(RawPayloadBox {
            typ: *b"dOps",
            payload: opus::dops_payload(*channel_count),
        })),
    };

    let stbl = mp4::Boxes::new(mp4::Stbl).with_children5(
        mp4::Boxes::new(mp4::Stsd {
            full_box: mp4::FullBox::default(),
            entry_count: 1,
        })
        .with_child(sample_description),
        mp4::Boxes::new(mp4::Stts::default()),
        mp4::Boxes::new(mp4::Stsc::default()),
        mp4::Boxes::new(mp4::Stsz::default()),
        mp4::Boxes::new(mp4::Stco::default()),
    );

    let minf = mp4::Boxes::new(mp4::Minf).with_children3(
        mp4::Boxes::new(mp4::Smhd::default()),
        generate_dinf(),
        stbl,
    );

    mp4::Boxes::new(mp4::Trak).with_children2(
        mp4::Boxes::new(mp4::Tkhd {
            full_box: mp4::FullBox {
                version: 0,
                flags: [0, 0, 3],
            },
            track_id: AUDIO_TRACK_ID,
            volume: 256,
            matrix: [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000],
            ..mp4::Tkhd::default()
        }),
        mp4::Boxes::new(mp4::Mdia).with_children3(
            mp4::Boxes::new(mp4::Mdhd {
                timescale: clock_rate,
                language: *b"und",
                ..mp4::Mdhd::default()
            }),
            mp4::Boxes::new(mp4::Hdlr {
                handler_type: *b"soun",
                name: "SoundHandler".to_owned(),
                ..mp4::Hdlr::default()
            }),
            minf,
        ),
    )
}

fn generate_dinf() -> mp4::Boxes {
    mp4::Boxes::new(mp4::Dinf).with_child(
        mp4::Boxes::new(mp4::Dref {
            full_box: mp4::FullBox::default(),
            entry_count: 1,
        })
        .with_child(mp4::Boxes::new(mp4::Url {
            full_box: mp4::FullBox {
                version: 0,
                flags: [0, 0, 1],
            },
            location: String::new(),
        })),
    )
}

// MPEG-4 elementary stream descriptor with a single-byte size encoding,
// which fits every AudioSpecificConfig this muxer accepts.
fn esds_payload(track_id: u32, config: &[u8]) -> Vec<u8> {
    let decoder_specific_len = u8::try_from(config.len()).unwrap_or(5);
    let decoder_config_len = 13 + 2 + decoder_specific_len;
    let es_descriptor_len = 3 + 2 + decoder_config_len + 3;

    let mut out = Vec::with_capacity(4 + 2 + usize::from(es_descriptor_len));
    out.extend_from_slice(&[0, 0, 0, 0]); // FullBox.

    out.push(0x03); // ES descriptor tag.
    out.push(es_descriptor_len);
    #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
    out.extend_from_slice(&(track_id as u16).to_be_bytes());
    out.push(0); // Flags.

    out.push(0x04); // Decoder config descriptor tag.
    out.push(decoder_config_len);
    out.push(0x40); // Object type indication: MPEG-4 audio.
    out.push(0x15); // Stream type: audio, upstream flag, reserved.
    out.extend_from_slice(&[0, 0, 0]); // Buffer size.
    out.extend_from_slice(&128_000_u32.to_be_bytes()); // Max bitrate.
    out.extend_from_slice(&128_000_u32.to_be_bytes()); // Average bitrate.

    out.push(0x05); // Decoder specific info tag.
    out.push(decoder_specific_len);
    out.extend_from_slice(config);

    out.push(0x06); // SL config descriptor tag.
    out.push(1);
    out.push(0x02);

    out
}

struct RawPayloadBox {
    typ: mp4::BoxType,
    payload: Vec<u8>,
}

impl mp4::ImmutableBox for RawPayloadBox {
    fn box_type(&self) -> mp4::BoxType {
        self.typ
    }

    fn size(&self) -> usize {
        self.payload.len()
    }

    fn marshal(&self, w: &mut dyn std::io::Write) -> Result<(), mp4::Mp4Error> {
        w.write_all(&self.payload)?;
        Ok(())
    }
}

impl From<RawPayloadBox> for Box<dyn mp4::ImmutableBox> {
    fn from(value: RawPayloadBox) -> Self {
        Box::new(value)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const TEST_SPS: [u8; 28] = [
        0x67, 0x64, 0x00, 0x28, 0xac, 0xd9, 0x40, 0x78, 0x02, 0x27, 0xe5, 0x84, 0x00, 0x00, 0x03,
        0x00, 0x04, 0x00, 0x00, 0x03, 0x00, 0xf0, 0x3c, 0x60, 0xc6, 0x58, 0x80, 0x00,
    ];

    #[test]
    fn test_generate_init_parses_back() {
        let video = VideoTrack::H264 {
            sps: TEST_SPS.to_vec(),
            pps: vec![0x68, 0xeb, 0xe3, 0xcb, 0x22, 0xc0],
        };
        let audio = AudioTrack::Mpeg4Audio {
            config: vec![0x11, 0x90],
            object_type: 2,
            sample_rate: 48000,
            channel_count: 2,
        };

        let init = generate_init(Some(&video), Some(&audio)).unwrap();

        let parsed = mp4::parse_init(&init).unwrap();
        assert_eq!(2, parsed.tracks.len());

        assert_eq!(VIDEO_TRACK_ID, parsed.tracks[0].id);
        assert_eq!(90000, parsed.tracks[0].timescale);
        assert_eq!(*b"vide", parsed.tracks[0].handler_type);
        let mp4::SampleEntryInfo::Avc1 { avcc } = &parsed.tracks[0].sample_entry else {
            panic!("expected avc1 entry");
        };
        let config = codecs::h264::AvcConfig::parse(avcc).unwrap();
        assert_eq!(TEST_SPS.to_vec(), config.sps);

        assert_eq!(AUDIO_TRACK_ID, parsed.tracks[1].id);
        assert_eq!(48000, parsed.tracks[1].timescale);
        assert_eq!(*b"soun", parsed.tracks[1].handler_type);
    }

    #[test]
    fn test_generate_init_video_only_starts_with_ftyp() {
        let video = VideoTrack::H264 {
            sps: TEST_SPS.to_vec(),
            pps: vec![0x68, 0xee, 0x38, 0x80],
        };
        let init = generate_init(Some(&video), None).unwrap();
        assert_eq!(b"ftyp", &init[4..8]);
        assert_eq!(b"moov", &init[36..40]);
    }

    #[test]
    fn test_generate_init_invalid_sps() {
        let video = VideoTrack::H264 {
            sps: vec![0x67],
            pps: vec![0x68],
        };
        assert!(generate_init(Some(&video), None).is_err());
    }
}
