// SPDX-License-Identifier: GPL-2.0-or-later

use crate::BoxType;
use bytes::{Buf, Bytes};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("unexpected end of data")]
    UnexpectedEof,

    #[error("invalid box size: {0}")]
    InvalidBoxSize(u64),

    #[error("missing {0} box")]
    MissingBox(&'static str),

    #[error("unsupported sample entry: {0:?}")]
    UnsupportedSampleEntry([u8; 4]),

    #[error("unsupported tfdt version: {0}")]
    UnsupportedTfdtVersion(u8),

    #[error("trun data offset not present")]
    TrunDataOffsetMissing,

    #[error("sample data out of bounds")]
    SampleOutOfBounds,
}

struct RawBox {
    typ: BoxType,
    // Offset of the box header from the start of the parsed buffer.
    offset: usize,
    payload: Bytes,
}

fn iter_boxes(data: &Bytes, base: usize) -> Result<Vec<RawBox>, ParseError> {
    let mut boxes = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        if data.len() - pos < 8 {
            return Err(ParseError::UnexpectedEof);
        }
        let size = u64::from(u32::from_be_bytes([
            data[pos],
            data[pos + 1],
            data[pos + 2],
            data[pos + 3],
        ]));
        let typ: BoxType = [data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]];

        let (header_size, size) = if size == 1 {
            // Largesize.
            if data.len() - pos < 16 {
                return Err(ParseError::UnexpectedEof);
            }
            let mut buf = &data[pos + 8..pos + 16];
            (16, buf.get_u64())
        } else if size == 0 {
            // Box extends to the end of the buffer.
            (8, u64::try_from(data.len() - pos).expect("usize to fit u64"))
        } else {
            (8, size)
        };

        if size < header_size {
            return Err(ParseError::InvalidBoxSize(size));
        }
        let size = usize::try_from(size).map_err(|_| ParseError::InvalidBoxSize(u64::MAX))?;
        if pos + size > data.len() {
            return Err(ParseError::UnexpectedEof);
        }

        #[allow(clippy::as_conversions)]
        let header_size = header_size as usize;
        boxes.push(RawBox {
            typ,
            offset: base + pos,
            payload: data.slice(pos + header_size..pos + size),
        });
        pos += size;
    }
    Ok(boxes)
}

fn find_box<'a>(boxes: &'a [RawBox], typ: BoxType, name: &'static str) -> Result<&'a RawBox, ParseError> {
    boxes
        .iter()
        .find(|b| b.typ == typ)
        .ok_or(ParseError::MissingBox(name))
}

fn need(buf: &Bytes, n: usize) -> Result<(), ParseError> {
    if buf.remaining() < n {
        return Err(ParseError::UnexpectedEof);
    }
    Ok(())
}

/************************ init ************************/

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SampleEntryInfo {
    Avc1 { avcc: Bytes },
    Hvc1 { hvcc: Bytes },
    Mp4a { esds: Bytes },
    Opus { dops: Bytes, channel_count: u16 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitTrack {
    pub id: u32,
    pub timescale: u32,
    pub handler_type: [u8; 4],
    pub sample_entry: SampleEntryInfo,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitInfo {
    pub tracks: Vec<InitTrack>,
}

// Parses a `ftyp`/`moov` initialization blob.
pub fn parse_init(data: &Bytes) -> Result<InitInfo, ParseError> {
    let top = iter_boxes(data, 0)?;
    let moov = find_box(&top, *b"moov", "moov")?;
    let moov_children = iter_boxes(&moov.payload, 0)?;

    let mut tracks = Vec::new();
    for trak in moov_children.iter().filter(|b| b.typ == *b"trak") {
        tracks.push(parse_trak(&trak.payload)?);
    }
    if tracks.is_empty() {
        return Err(ParseError::MissingBox("trak"));
    }
    Ok(InitInfo { tracks })
}

fn parse_trak(payload: &Bytes) -> Result<InitTrack, ParseError> {
    let children = iter_boxes(payload, 0)?;

    let tkhd = find_box(&children, *b"tkhd", "tkhd")?;
    let id = parse_tkhd_track_id(&tkhd.payload)?;

    let mdia = find_box(&children, *b"mdia", "mdia")?;
    let mdia_children = iter_boxes(&mdia.payload, 0)?;

    let mdhd = find_box(&mdia_children, *b"mdhd", "mdhd")?;
    let timescale = parse_mdhd_timescale(&mdhd.payload)?;

    let hdlr = find_box(&mdia_children, *b"hdlr", "hdlr")?;
    let mut hdlr_buf = hdlr.payload.clone();
    need(&hdlr_buf, 12)?;
    hdlr_buf.advance(8);
    let mut handler_type = [0; 4];
    hdlr_buf.copy_to_slice(&mut handler_type);

    let minf = find_box(&mdia_children, *b"minf", "minf")?;
    let minf_children = iter_boxes(&minf.payload, 0)?;
    let stbl = find_box(&minf_children, *b"stbl", "stbl")?;
    let stbl_children = iter_boxes(&stbl.payload, 0)?;
    let stsd = find_box(&stbl_children, *b"stsd", "stsd")?;

    // Skip fullbox and entry count.
    need(&stsd.payload, 8)?;
    let entries = stsd.payload.slice(8..);
    let entry = iter_boxes(&entries, 0)?;
    let entry = entry.first().ok_or(ParseError::MissingBox("sample entry"))?;

    let sample_entry = parse_sample_entry(entry)?;

    Ok(InitTrack {
        id,
        timescale,
        handler_type,
        sample_entry,
    })
}

fn parse_tkhd_track_id(payload: &Bytes) -> Result<u32, ParseError> {
    let mut buf = payload.clone();
    need(&buf, 4)?;
    let version = buf.get_u8();
    buf.advance(3);
    match version {
        0 => {
            need(&buf, 12)?;
            buf.advance(8);
            Ok(buf.get_u32())
        }
        1 => {
            need(&buf, 20)?;
            buf.advance(16);
            Ok(buf.get_u32())
        }
        v => Err(ParseError::InvalidBoxSize(u64::from(v))),
    }
}

fn parse_mdhd_timescale(payload: &Bytes) -> Result<u32, ParseError> {
    let mut buf = payload.clone();
    need(&buf, 4)?;
    let version = buf.get_u8();
    buf.advance(3);
    match version {
        0 => {
            need(&buf, 12)?;
            buf.advance(8);
            Ok(buf.get_u32())
        }
        1 => {
            need(&buf, 20)?;
            buf.advance(16);
            Ok(buf.get_u32())
        }
        v => Err(ParseError::InvalidBoxSize(u64::from(v))),
    }
}

fn parse_sample_entry(entry: &RawBox) -> Result<SampleEntryInfo, ParseError> {
    match &entry.typ {
        b"avc1" => {
            // 78 byte visual sample entry followed by child boxes.
            need(&entry.payload, 78)?;
            let children = iter_boxes(&entry.payload.slice(78..), 0)?;
            let avcc = find_box(&children, *b"avcC", "avcC")?;
            Ok(SampleEntryInfo::Avc1 {
                avcc: avcc.payload.clone(),
            })
        }
        b"hvc1" | b"hev1" => {
            need(&entry.payload, 78)?;
            let children = iter_boxes(&entry.payload.slice(78..), 0)?;
            let hvcc = find_box(&children, *b"hvcC", "hvcC")?;
            Ok(SampleEntryInfo::Hvc1 {
                hvcc: hvcc.payload.clone(),
            })
        }
        b"mp4a" => {
            // 28 byte audio sample entry followed by child boxes.
            need(&entry.payload, 28)?;
            let children = iter_boxes(&entry.payload.slice(28..), 0)?;
            let esds = find_box(&children, *b"esds", "esds")?;
            Ok(SampleEntryInfo::Mp4a {
                esds: esds.payload.clone(),
            })
        }
        b"Opus" => {
            need(&entry.payload, 28)?;
            let mut buf = entry.payload.slice(16..18);
            let channel_count = buf.get_u16();
            let children = iter_boxes(&entry.payload.slice(28..), 0)?;
            let dops = find_box(&children, *b"dOps", "dOps")?;
            Ok(SampleEntryInfo::Opus {
                dops: dops.payload.clone(),
                channel_count,
            })
        }
        typ => Err(ParseError::UnsupportedSampleEntry(*typ)),
    }
}

/************************ fragments ************************/

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentSample {
    pub duration: u32,
    pub flags: u32,
    pub pts_offset: i32,
    pub payload: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FragmentTrack {
    pub id: u32,
    pub base_time: u64,
    pub samples: Vec<FragmentSample>,
}

// One moof/mdat pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub tracks: Vec<FragmentTrack>,
}

struct TfhdInfo {
    track_id: u32,
    default_sample_duration: u32,
    default_sample_size: u32,
    default_sample_flags: u32,
}

struct TrunInfo {
    data_offset: i32,
    first_sample_flags: Option<u32>,
    entries: Vec<TrunEntryInfo>,
}

struct TrunEntryInfo {
    duration: Option<u32>,
    size: Option<u32>,
    flags: Option<u32>,
    pts_offset: i32,
}

// Parses the `moof`/`mdat` pairs of a media segment. Sample payloads are
// sliced zero-copy out of `data` via the trun data offsets.
pub fn parse_fragments(data: &Bytes) -> Result<Vec<Fragment>, ParseError> {
    let top = iter_boxes(data, 0)?;

    let mut fragments = Vec::new();
    for raw in &top {
        if raw.typ != *b"moof" {
            continue;
        }
        fragments.push(parse_moof(data, raw)?);
    }
    if fragments.is_empty() {
        return Err(ParseError::MissingBox("moof"));
    }
    Ok(fragments)
}

fn parse_moof(data: &Bytes, moof: &RawBox) -> Result<Fragment, ParseError> {
    let children = iter_boxes(&moof.payload, 0)?;

    let mut tracks = Vec::new();
    for traf in children.iter().filter(|b| b.typ == *b"traf") {
        let traf_children = iter_boxes(&traf.payload, 0)?;

        let tfhd = parse_tfhd(&find_box(&traf_children, *b"tfhd", "tfhd")?.payload)?;
        let base_time = parse_tfdt(&find_box(&traf_children, *b"tfdt", "tfdt")?.payload)?;
        let trun = parse_trun(&find_box(&traf_children, *b"trun", "trun")?.payload)?;

        // Data offsets are relative to the start of the moof box.
        let data_start = moof
            .offset
            .checked_add_signed(isize::try_from(trun.data_offset).expect("i32 to fit isize"))
            .ok_or(ParseError::SampleOutOfBounds)?;

        let mut samples = Vec::with_capacity(trun.entries.len());
        let mut pos = data_start;
        for (i, entry) in trun.entries.iter().enumerate() {
            let size =
                usize::try_from(entry.size.unwrap_or(tfhd.default_sample_size)).expect("u32 size");
            if pos + size > data.len() {
                return Err(ParseError::SampleOutOfBounds);
            }

            let flags = if i == 0 {
                entry
                    .flags
                    .or(trun.first_sample_flags)
                    .unwrap_or(tfhd.default_sample_flags)
            } else {
                entry.flags.unwrap_or(tfhd.default_sample_flags)
            };

            samples.push(FragmentSample {
                duration: entry.duration.unwrap_or(tfhd.default_sample_duration),
                flags,
                pts_offset: entry.pts_offset,
                payload: data.slice(pos..pos + size),
            });
            pos += size;
        }

        tracks.push(FragmentTrack {
            id: tfhd.track_id,
            base_time,
            samples,
        });
    }

    if tracks.is_empty() {
        return Err(ParseError::MissingBox("traf"));
    }
    Ok(Fragment { tracks })
}

fn parse_tfhd(payload: &Bytes) -> Result<TfhdInfo, ParseError> {
    let mut buf = payload.clone();
    need(&buf, 8)?;
    buf.advance(1);
    let mut flags = [0; 3];
    buf.copy_to_slice(&mut flags);
    let flags = u32::from(flags[0]) << 16 | u32::from(flags[1]) << 8 | u32::from(flags[2]);

    let track_id = buf.get_u32();

    if flags & crate::TFHD_BASE_DATA_OFFSET_PRESENT != 0 {
        need(&buf, 8)?;
        buf.advance(8);
    }
    if flags & crate::TFHD_SAMPLE_DESCRIPTION_INDEX_PRESENT != 0 {
        need(&buf, 4)?;
        buf.advance(4);
    }
    let mut default_sample_duration = 0;
    if flags & crate::TFHD_DEFAULT_SAMPLE_DURATION_PRESENT != 0 {
        need(&buf, 4)?;
        default_sample_duration = buf.get_u32();
    }
    let mut default_sample_size = 0;
    if flags & crate::TFHD_DEFAULT_SAMPLE_SIZE_PRESENT != 0 {
        need(&buf, 4)?;
        default_sample_size = buf.get_u32();
    }
    let mut default_sample_flags = 0;
    if flags & crate::TFHD_DEFAULT_SAMPLE_FLAGS_PRESENT != 0 {
        need(&buf, 4)?;
        default_sample_flags = buf.get_u32();
    }

    Ok(TfhdInfo {
        track_id,
        default_sample_duration,
        default_sample_size,
        default_sample_flags,
    })
}

fn parse_tfdt(payload: &Bytes) -> Result<u64, ParseError> {
    let mut buf = payload.clone();
    need(&buf, 4)?;
    let version = buf.get_u8();
    buf.advance(3);
    match version {
        0 => {
            need(&buf, 4)?;
            Ok(u64::from(buf.get_u32()))
        }
        1 => {
            need(&buf, 8)?;
            Ok(buf.get_u64())
        }
        v => Err(ParseError::UnsupportedTfdtVersion(v)),
    }
}

fn parse_trun(payload: &Bytes) -> Result<TrunInfo, ParseError> {
    let mut buf = payload.clone();
    need(&buf, 8)?;
    let version = buf.get_u8();
    let mut flags = [0; 3];
    buf.copy_to_slice(&mut flags);
    let flags = u32::from(flags[0]) << 16 | u32::from(flags[1]) << 8 | u32::from(flags[2]);

    let sample_count = buf.get_u32();

    if flags & crate::TRUN_DATA_OFFSET_PRESENT == 0 {
        return Err(ParseError::TrunDataOffsetMissing);
    }
    need(&buf, 4)?;
    let data_offset = buf.get_i32();

    let mut first_sample_flags = None;
    if flags & crate::TRUN_FIRST_SAMPLE_FLAGS_PRESENT != 0 {
        need(&buf, 4)?;
        first_sample_flags = Some(buf.get_u32());
    }

    let mut entries = Vec::with_capacity(usize::try_from(sample_count).expect("u32 count"));
    for _ in 0..sample_count {
        let mut duration = None;
        if flags & crate::TRUN_SAMPLE_DURATION_PRESENT != 0 {
            need(&buf, 4)?;
            duration = Some(buf.get_u32());
        }
        let mut size = None;
        if flags & crate::TRUN_SAMPLE_SIZE_PRESENT != 0 {
            need(&buf, 4)?;
            size = Some(buf.get_u32());
        }
        let mut sample_flags = None;
        if flags & crate::TRUN_SAMPLE_FLAGS_PRESENT != 0 {
            need(&buf, 4)?;
            sample_flags = Some(buf.get_u32());
        }
        let mut pts_offset = 0;
        if flags & crate::TRUN_SAMPLE_COMPOSITION_TIME_OFFSET_PRESENT != 0 {
            need(&buf, 4)?;
            pts_offset = if version == 0 {
                i32::try_from(buf.get_u32()).unwrap_or(i32::MAX)
            } else {
                buf.get_i32()
            };
        }
        entries.push(TrunEntryInfo {
            duration,
            size,
            flags: sample_flags,
            pts_offset,
        });
    }

    Ok(TrunInfo {
        data_offset,
        first_sample_flags,
        entries,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_fragment() {
        #[rustfmt::skip]
        let data: Vec<u8> = vec![
            0, 0, 0, 0x68, b'm', b'o', b'o', b'f', //
            0, 0, 0, 0x10, b'm', b'f', b'h', b'd', //
            0, 0, 0, 0, // FullBox.
            0, 0, 0, 0, // Sequence number.
            0, 0, 0, 0x50, b't', b'r', b'a', b'f', //
            0, 0, 0, 0x10, b't', b'f', b'h', b'd', //
            0, 2, 0, 0, // FullBox, default-base-is-moof.
            0, 0, 0, 1, // Track id.
            0, 0, 0, 0x14, b't', b'f', b'd', b't', //
            1, 0, 0, 0, // FullBox v1.
            0, 0, 0, 0, 0, 0, 0xea, 0x60, // BaseMediaDecodeTime.
            0, 0, 0, 0x24, b't', b'r', b'u', b'n', //
            1, 0, 0xf, 1, // FullBox v1.
            0, 0, 0, 1, // Sample count.
            0, 0, 0, 0x70, // Data offset.
            0, 0, 0x23, 0x28, // Sample duration.
            0, 0, 0, 4, // Sample size.
            0, 1, 0, 0, // Sample flags.
            0xff, 0xff, 0xff, 0xfd, // Composition time offset.
            0, 0, 0, 0xc, b'm', b'd', b'a', b't', //
            b'a', b'b', b'c', b'd', // Sample payload.
        ];

        let got = parse_fragments(&Bytes::from(data)).unwrap();
        assert_eq!(1, got.len());

        let track = &got[0].tracks[0];
        assert_eq!(1, track.id);
        assert_eq!(60000, track.base_time);
        assert_eq!(
            vec![FragmentSample {
                duration: 9000,
                flags: crate::SAMPLE_IS_NON_SYNC_SAMPLE,
                pts_offset: -3,
                payload: Bytes::from_static(b"abcd"),
            }],
            track.samples
        );
    }

    #[test]
    fn test_parse_trun_requires_data_offset() {
        #[rustfmt::skip]
        let payload = Bytes::from_static(&[
            1, 0, 0xf, 0, // FullBox without data-offset flag.
            0, 0, 0, 0, // Sample count.
        ]);
        assert_eq!(
            Err(ParseError::TrunDataOffsetMissing),
            parse_trun(&payload).map(|_| ())
        );
    }

    #[test]
    fn test_parse_tfdt_unsupported_version() {
        let payload = Bytes::from_static(&[2, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            Err(ParseError::UnsupportedTfdtVersion(2)),
            parse_tfdt(&payload).map(|_| ())
        );
    }
}
