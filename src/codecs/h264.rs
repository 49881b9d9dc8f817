// SPDX-License-Identifier: GPL-2.0-or-later

use crate::bits::{strip_emulation_prevention, BitReader, BitReaderError};
use bytes::Bytes;
use thiserror::Error;

pub const NALU_TYPE_NON_IDR: u8 = 1;
pub const NALU_TYPE_IDR: u8 = 5;
pub const NALU_TYPE_SEI: u8 = 6;
pub const NALU_TYPE_SPS: u8 = 7;
pub const NALU_TYPE_PPS: u8 = 8;
pub const NALU_TYPE_AUD: u8 = 9;

// Access unit delimiter with primary_pic_type "any".
pub const AUD_NALU: [u8; 2] = [NALU_TYPE_AUD, 0xf0];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum H264Error {
    #[error("empty access unit")]
    EmptyAccessUnit,

    #[error("start code not found")]
    StartCodeNotFound,

    #[error("invalid avcc length field")]
    InvalidAvccLength,

    #[error("invalid sequence parameter set: {0}")]
    InvalidSps(#[from] BitReaderError),

    #[error("sequence parameter set too short")]
    SpsTooShort,

    #[error("invalid decoder configuration record")]
    InvalidConfigurationRecord,
}

#[must_use]
pub fn nalu_type(nalu: &[u8]) -> u8 {
    nalu.first().map_or(0, |b| b & 0x1f)
}

/// Splits an Annex-B byte stream into NALUs.
pub fn annexb_unmarshal(data: &[u8]) -> Result<Vec<Bytes>, H264Error> {
    let mut nalus = Vec::new();
    let mut start = None;
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                if code_start > s {
                    nalus.push(Bytes::copy_from_slice(&data[s..code_start]));
                }
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }

    let Some(s) = start else {
        return Err(H264Error::StartCodeNotFound);
    };
    if s < data.len() {
        nalus.push(Bytes::copy_from_slice(&data[s..]));
    }
    if nalus.is_empty() {
        return Err(H264Error::EmptyAccessUnit);
    }
    Ok(nalus)
}

/// Joins NALUs into an Annex-B byte stream with 4-byte start codes.
#[must_use]
pub fn annexb_marshal<T: AsRef<[u8]>>(nalus: &[T]) -> Vec<u8> {
    let total: usize = nalus.iter().map(|n| 4 + n.as_ref().len()).sum();
    let mut out = Vec::with_capacity(total);
    for nalu in nalus {
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(nalu.as_ref());
    }
    out
}

/// Joins NALUs into an AVCC stream with 4-byte length prefixes.
#[must_use]
pub fn avcc_marshal<T: AsRef<[u8]>>(nalus: &[T]) -> Vec<u8> {
    let total: usize = nalus.iter().map(|n| 4 + n.as_ref().len()).sum();
    let mut out = Vec::with_capacity(total);
    for nalu in nalus {
        let len = u32::try_from(nalu.as_ref().len()).unwrap_or(0);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(nalu.as_ref());
    }
    out
}

/// Splits an AVCC stream into NALUs.
pub fn avcc_unmarshal(data: &Bytes, length_size: usize) -> Result<Vec<Bytes>, H264Error> {
    let mut nalus = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        if pos + length_size > data.len() {
            return Err(H264Error::InvalidAvccLength);
        }
        let mut len: usize = 0;
        for i in 0..length_size {
            len = (len << 8) | usize::from(data[pos + i]);
        }
        pos += length_size;
        if pos + len > data.len() {
            return Err(H264Error::InvalidAvccLength);
        }
        nalus.push(data.slice(pos..pos + len));
        pos += len;
    }
    if nalus.is_empty() {
        return Err(H264Error::EmptyAccessUnit);
    }
    Ok(nalus)
}

/// AVCDecoderConfigurationRecord.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AvcConfig {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
    pub length_size: usize,
}

impl AvcConfig {
    pub fn parse(data: &[u8]) -> Result<Self, H264Error> {
        if data.len() < 7 {
            return Err(H264Error::InvalidConfigurationRecord);
        }
        let length_size = usize::from(data[4] & 0x03) + 1;

        let sps_count = usize::from(data[5] & 0x1f);
        if sps_count == 0 {
            return Err(H264Error::InvalidConfigurationRecord);
        }
        let mut pos = 6;
        let read_unit = |pos: &mut usize| -> Result<Vec<u8>, H264Error> {
            if *pos + 2 > data.len() {
                return Err(H264Error::InvalidConfigurationRecord);
            }
            let len = usize::from(u16::from(data[*pos]) << 8 | u16::from(data[*pos + 1]));
            *pos += 2;
            if *pos + len > data.len() {
                return Err(H264Error::InvalidConfigurationRecord);
            }
            let unit = data[*pos..*pos + len].to_vec();
            *pos += len;
            Ok(unit)
        };

        let sps = read_unit(&mut pos)?;
        for _ in 1..sps_count {
            read_unit(&mut pos)?;
        }

        if pos >= data.len() {
            return Err(H264Error::InvalidConfigurationRecord);
        }
        let pps_count = usize::from(data[pos]);
        pos += 1;
        if pps_count == 0 {
            return Err(H264Error::InvalidConfigurationRecord);
        }
        let pps = read_unit(&mut pos)?;

        Ok(Self {
            sps,
            pps,
            length_size,
        })
    }

    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(11 + self.sps.len() + self.pps.len());
        out.push(1); // Configuration version.
        out.push(self.sps.get(1).copied().unwrap_or(0)); // Profile.
        out.push(self.sps.get(2).copied().unwrap_or(0)); // Profile compatibility.
        out.push(self.sps.get(3).copied().unwrap_or(0)); // Level.
        out.push(0xfc | 3); // Reserved, length size minus one.
        out.push(0xe0 | 1); // Reserved, one sequence parameter set.
        let sps_len = u16::try_from(self.sps.len()).unwrap_or(0);
        out.extend_from_slice(&sps_len.to_be_bytes());
        out.extend_from_slice(&self.sps);
        out.push(1); // One picture parameter set.
        let pps_len = u16::try_from(self.pps.len()).unwrap_or(0);
        out.extend_from_slice(&pps_len.to_be_bytes());
        out.extend_from_slice(&self.pps);
        out
    }
}

// "avc1." followed by the hex of profile, compatibility and level.
#[must_use]
pub fn rfc6381_codec(sps: &[u8]) -> Option<String> {
    if sps.len() < 4 {
        return None;
    }
    Some(format!(
        "avc1.{:02X}{:02X}{:02X}",
        sps[1], sps[2], sps[3]
    ))
}

/// Fields parsed out of a sequence parameter set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_idc: u8,
    pub level_idc: u8,
    pub width: u16,
    pub height: u16,
    pub pic_order_cnt_type: u32,
    pub max_num_ref_frames: u32,
    pub max_num_reorder_frames: Option<u32>,
}

impl SpsInfo {
    #[allow(clippy::too_many_lines)]
    pub fn parse(sps: &[u8]) -> Result<Self, H264Error> {
        if sps.len() < 4 {
            return Err(H264Error::SpsTooShort);
        }
        let rbsp = strip_emulation_prevention(&sps[1..]);
        let mut r = BitReader::new(&rbsp);

        let profile_idc = u8::try_from(r.read_bits(8)?).expect("8 bits");
        r.skip(8)?; // Constraint flags and reserved bits.
        let level_idc = u8::try_from(r.read_bits(8)?).expect("8 bits");
        r.read_ue()?; // seq_parameter_set_id

        let mut chroma_format_idc = 1;
        if matches!(
            profile_idc,
            100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134 | 135
        ) {
            chroma_format_idc = r.read_ue()?;
            if chroma_format_idc == 3 {
                r.skip(1)?; // separate_colour_plane_flag
            }
            r.read_ue()?; // bit_depth_luma_minus8
            r.read_ue()?; // bit_depth_chroma_minus8
            r.skip(1)?; // qpprime_y_zero_transform_bypass_flag
            if r.read_bit()? == 1 {
                // seq_scaling_matrix_present_flag
                let count = if chroma_format_idc == 3 { 12 } else { 8 };
                for i in 0..count {
                    if r.read_bit()? == 1 {
                        skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                    }
                }
            }
        }

        r.read_ue()?; // log2_max_frame_num_minus4
        let pic_order_cnt_type = r.read_ue()?;
        if pic_order_cnt_type == 0 {
            r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
        } else if pic_order_cnt_type == 1 {
            r.skip(1)?; // delta_pic_order_always_zero_flag
            r.read_se()?; // offset_for_non_ref_pic
            r.read_se()?; // offset_for_top_to_bottom_field
            let cycle_len = r.read_ue()?;
            for _ in 0..cycle_len {
                r.read_se()?;
            }
        }

        let max_num_ref_frames = r.read_ue()?;
        r.skip(1)?; // gaps_in_frame_num_value_allowed_flag

        let pic_width_in_mbs = r.read_ue()? + 1;
        let pic_height_in_map_units = r.read_ue()? + 1;
        let frame_mbs_only = r.read_bit()?;
        if frame_mbs_only == 0 {
            r.skip(1)?; // mb_adaptive_frame_field_flag
        }
        r.skip(1)?; // direct_8x8_inference_flag

        let mut crop = [0; 4];
        if r.read_bit()? == 1 {
            // frame_cropping_flag
            for v in &mut crop {
                *v = r.read_ue()?;
            }
        }

        let (crop_unit_x, crop_unit_y) = match chroma_format_idc {
            0 => (1, 2 - frame_mbs_only),
            1 => (2, 2 * (2 - frame_mbs_only)),
            2 => (2, 2 - frame_mbs_only),
            _ => (1, 2 - frame_mbs_only),
        };

        let width = pic_width_in_mbs * 16 - (crop[0] + crop[1]) * crop_unit_x;
        let height =
            (2 - frame_mbs_only) * pic_height_in_map_units * 16 - (crop[2] + crop[3]) * crop_unit_y;

        let mut max_num_reorder_frames = None;
        if r.read_bit()? == 1 {
            // vui_parameters_present_flag
            max_num_reorder_frames = parse_vui_reorder_frames(&mut r)?;
        }

        Ok(Self {
            profile_idc,
            level_idc,
            width: u16::try_from(width).map_err(|_| H264Error::SpsTooShort)?,
            height: u16::try_from(height).map_err(|_| H264Error::SpsTooShort)?,
            pic_order_cnt_type,
            max_num_ref_frames,
            max_num_reorder_frames,
        })
    }
}

fn skip_scaling_list(r: &mut BitReader, size: u32) -> Result<(), BitReaderError> {
    let mut last_scale = 8;
    let mut next_scale = 8;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

fn parse_vui_reorder_frames(r: &mut BitReader) -> Result<Option<u32>, BitReaderError> {
    if r.read_bit()? == 1 {
        // aspect_ratio_info_present_flag
        let idc = r.read_bits(8)?;
        if idc == 255 {
            r.skip(32)?; // sar_width, sar_height
        }
    }
    if r.read_bit()? == 1 {
        r.skip(1)?; // overscan_appropriate_flag
    }
    if r.read_bit()? == 1 {
        // video_signal_type_present_flag
        r.skip(4)?;
        if r.read_bit()? == 1 {
            r.skip(24)?; // colour description
        }
    }
    if r.read_bit()? == 1 {
        // chroma_loc_info_present_flag
        r.read_ue()?;
        r.read_ue()?;
    }
    if r.read_bit()? == 1 {
        // timing_info_present_flag
        r.skip(65)?;
    }
    let nal_hrd = r.read_bit()? == 1;
    if nal_hrd {
        skip_hrd_parameters(r)?;
    }
    let vcl_hrd = r.read_bit()? == 1;
    if vcl_hrd {
        skip_hrd_parameters(r)?;
    }
    if nal_hrd || vcl_hrd {
        r.skip(1)?; // low_delay_hrd_flag
    }
    r.skip(1)?; // pic_struct_present_flag
    if r.read_bit()? == 0 {
        // bitstream_restriction_flag
        return Ok(None);
    }
    r.skip(1)?; // motion_vectors_over_pic_boundaries_flag
    r.read_ue()?; // max_bytes_per_pic_denom
    r.read_ue()?; // max_bits_per_mb_denom
    r.read_ue()?; // log2_max_mv_length_horizontal
    r.read_ue()?; // log2_max_mv_length_vertical
    Ok(Some(r.read_ue()?))
}

fn skip_hrd_parameters(r: &mut BitReader) -> Result<(), BitReaderError> {
    let cpb_cnt = r.read_ue()? + 1;
    r.skip(8)?; // bit_rate_scale, cpb_size_scale
    for _ in 0..cpb_cnt {
        r.read_ue()?;
        r.read_ue()?;
        r.skip(1)?;
    }
    r.skip(20)?;
    Ok(())
}

/// Derives decode timestamps from presentation timestamps.
///
/// Streams without frame reordering pass through unchanged. For
/// reordered streams a bounded window of pending timestamps is kept
/// and the smallest one is released once the window is full, which
/// approximates the decode order without tracking picture order
/// counts. Output is monotone and never exceeds the input.
pub struct DtsExtractor {
    reorder_depth: usize,
    pending: Vec<i64>,
    prev_dts: Option<i64>,
}

impl DtsExtractor {
    #[must_use]
    pub fn new(sps: Option<&SpsInfo>) -> Self {
        let reorder_depth = sps.map_or(0, |sps| {
            let depth = sps
                .max_num_reorder_frames
                .unwrap_or(if sps.pic_order_cnt_type == 2 {
                    0
                } else {
                    sps.max_num_ref_frames.min(2)
                });
            usize::try_from(depth).unwrap_or(0)
        });
        Self {
            reorder_depth,
            pending: Vec::new(),
            prev_dts: None,
        }
    }

    pub fn extract(&mut self, pts: i64, random_access: bool) -> i64 {
        let mut dts = if self.reorder_depth == 0 || random_access {
            // A sync sample refreshes the decoder, nothing pending can
            // be referenced across it.
            self.pending.clear();
            pts
        } else {
            let pos = self.pending.partition_point(|&v| v < pts);
            self.pending.insert(pos, pts);
            if self.pending.len() > self.reorder_depth {
                self.pending.remove(0)
            } else {
                // Window still filling, hold the clock.
                self.prev_dts.unwrap_or(pts)
            }
        };

        if let Some(prev) = self.prev_dts {
            dts = dts.max(prev);
        }
        dts = dts.min(pts);
        self.prev_dts = Some(dts);
        dts
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // 1920x1080 high profile SPS.
    const TEST_SPS: [u8; 28] = [
        0x67, 0x64, 0x00, 0x28, 0xac, 0xd9, 0x40, 0x78, 0x02, 0x27, 0xe5, 0x84, 0x00, 0x00, 0x03,
        0x00, 0x04, 0x00, 0x00, 0x03, 0x00, 0xf0, 0x3c, 0x60, 0xc6, 0x58, 0x80, 0x00,
    ];

    #[test]
    fn test_annexb_round_trip() {
        let nalus = vec![vec![0x67, 1, 2], vec![0x68, 3], vec![0x65, 4, 5, 6]];
        let stream = annexb_marshal(&nalus);
        let got = annexb_unmarshal(&stream).unwrap();
        assert_eq!(
            nalus,
            got.iter().map(|n| n.to_vec()).collect::<Vec<Vec<u8>>>()
        );
    }

    #[test]
    fn test_annexb_unmarshal_three_byte_start_codes() {
        let stream = [0, 0, 1, 0x67, 1, 0, 0, 1, 0x68, 2];
        let got = annexb_unmarshal(&stream).unwrap();
        assert_eq!(2, got.len());
        assert_eq!(&[0x67, 1][..], &got[0]);
        assert_eq!(&[0x68, 2][..], &got[1]);
    }

    #[test]
    fn test_avcc_round_trip() {
        let nalus = vec![vec![0x65, 1, 2, 3]];
        let stream = Bytes::from(avcc_marshal(&nalus));
        let got = avcc_unmarshal(&stream, 4).unwrap();
        assert_eq!(&nalus[0][..], &got[0]);
    }

    #[test]
    fn test_avcc_unmarshal_invalid_length() {
        let stream = Bytes::from_static(&[0, 0, 0, 9, 1]);
        assert_eq!(
            Err(H264Error::InvalidAvccLength),
            avcc_unmarshal(&stream, 4).map(|_| ())
        );
    }

    #[test]
    fn test_avc_config_round_trip() {
        let config = AvcConfig {
            sps: TEST_SPS.to_vec(),
            pps: vec![0x68, 0xeb, 0xe3, 0xcb, 0x22, 0xc0],
            length_size: 4,
        };
        assert_eq!(config, AvcConfig::parse(&config.marshal()).unwrap());
    }

    #[test]
    fn test_rfc6381_codec() {
        assert_eq!(
            Some("avc1.640028".to_owned()),
            rfc6381_codec(&TEST_SPS)
        );
    }

    #[test]
    fn test_sps_parse() {
        let got = SpsInfo::parse(&TEST_SPS).unwrap();
        assert_eq!(100, got.profile_idc);
        assert_eq!(0x28, got.level_idc);
        assert_eq!(1920, got.width);
        assert_eq!(1080, got.height);
    }

    #[test]
    fn test_dts_extractor_no_reordering() {
        let mut extractor = DtsExtractor::new(None);
        for (i, pts) in [0, 3000, 6000, 9000].into_iter().enumerate() {
            assert_eq!(pts, extractor.extract(pts, i == 0));
        }
    }

    #[test]
    fn test_dts_extractor_reordered_stream() {
        let sps = SpsInfo {
            profile_idc: 100,
            level_idc: 40,
            width: 1920,
            height: 1080,
            pic_order_cnt_type: 0,
            max_num_ref_frames: 4,
            max_num_reorder_frames: Some(2),
        };
        let mut extractor = DtsExtractor::new(Some(&sps));

        // Decode order I P B B P B B with two frames of reordering.
        let input: [(i64, bool); 7] = [
            (0, true),
            (9000, false),
            (3000, false),
            (6000, false),
            (18_000, false),
            (12_000, false),
            (15_000, false),
        ];

        let mut prev = i64::MIN;
        for (pts, random_access) in input {
            let dts = extractor.extract(pts, random_access);
            assert!(dts <= pts, "dts {dts} exceeds pts {pts}");
            assert!(dts >= prev, "dts {dts} went backwards from {prev}");
            prev = dts;
        }
        assert_eq!(12_000, prev);
    }
}
