// SPDX-License-Identifier: GPL-2.0-or-later

use crate::bits::{strip_emulation_prevention, BitReader, BitReaderError};
use thiserror::Error;

pub const NALU_TYPE_BLA_W_LP: u8 = 16;
pub const NALU_TYPE_IDR_W_RADL: u8 = 19;
pub const NALU_TYPE_IDR_N_LP: u8 = 20;
pub const NALU_TYPE_CRA: u8 = 21;
pub const NALU_TYPE_VPS: u8 = 32;
pub const NALU_TYPE_SPS: u8 = 33;
pub const NALU_TYPE_PPS: u8 = 34;
pub const NALU_TYPE_AUD: u8 = 35;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum H265Error {
    #[error("sequence parameter set too short")]
    SpsTooShort,

    #[error("invalid sequence parameter set: {0}")]
    InvalidSps(#[from] BitReaderError),

    #[error("invalid decoder configuration record")]
    InvalidConfigurationRecord,
}

#[must_use]
pub fn nalu_type(nalu: &[u8]) -> u8 {
    nalu.first().map_or(0, |b| (b >> 1) & 0x3f)
}

// Random access pictures: BLA, IDR and CRA.
#[must_use]
pub fn is_random_access(nalu_type: u8) -> bool {
    (NALU_TYPE_BLA_W_LP..=NALU_TYPE_CRA).contains(&nalu_type)
}

/// Fields parsed out of a sequence parameter set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpsInfo {
    pub profile_space: u8,
    pub tier_flag: u8,
    pub profile_idc: u8,
    pub compatibility_flags: u32,
    pub constraint_flags: [u8; 6],
    pub level_idc: u8,
    pub chroma_format_idc: u8,
    pub bit_depth_luma_minus8: u8,
    pub bit_depth_chroma_minus8: u8,
    pub width: u16,
    pub height: u16,
}

impl SpsInfo {
    pub fn parse(sps: &[u8]) -> Result<Self, H265Error> {
        if sps.len() < 6 {
            return Err(H265Error::SpsTooShort);
        }
        // Two byte NAL unit header.
        let rbsp = strip_emulation_prevention(&sps[2..]);
        let mut r = BitReader::new(&rbsp);

        r.skip(4)?; // sps_video_parameter_set_id
        let max_sub_layers = r.read_bits(3)?;
        r.skip(1)?; // sps_temporal_id_nesting_flag

        // profile_tier_level
        let profile_space = u8::try_from(r.read_bits(2)?).expect("2 bits");
        let tier_flag = u8::try_from(r.read_bit()?).expect("1 bit");
        let profile_idc = u8::try_from(r.read_bits(5)?).expect("5 bits");
        let compatibility_flags = r.read_bits(32)?;
        let mut constraint_flags = [0; 6];
        for flag in &mut constraint_flags {
            *flag = u8::try_from(r.read_bits(8)?).expect("8 bits");
        }
        let level_idc = u8::try_from(r.read_bits(8)?).expect("8 bits");

        if max_sub_layers > 0 {
            let mut profile_present = [false; 8];
            let mut level_present = [false; 8];
            for i in 0..usize::try_from(max_sub_layers).expect("3 bits") {
                profile_present[i] = r.read_bit()? == 1;
                level_present[i] = r.read_bit()? == 1;
            }
            r.skip((8 - max_sub_layers) * 2)?;
            for i in 0..usize::try_from(max_sub_layers).expect("3 bits") {
                if profile_present[i] {
                    r.skip(88)?;
                }
                if level_present[i] {
                    r.skip(8)?;
                }
            }
        }

        r.read_ue()?; // sps_seq_parameter_set_id
        let chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.skip(1)?; // separate_colour_plane_flag
        }
        let mut width = r.read_ue()?;
        let mut height = r.read_ue()?;
        if r.read_bit()? == 1 {
            // conformance_window_flag
            let left = r.read_ue()?;
            let right = r.read_ue()?;
            let top = r.read_ue()?;
            let bottom = r.read_ue()?;
            let (sub_width, sub_height) = match chroma_format_idc {
                1 => (2, 2),
                2 => (2, 1),
                _ => (1, 1),
            };
            width = width.saturating_sub((left + right) * sub_width);
            height = height.saturating_sub((top + bottom) * sub_height);
        }
        let bit_depth_luma_minus8 = u8::try_from(r.read_ue()?).map_err(|_| H265Error::SpsTooShort)?;
        let bit_depth_chroma_minus8 =
            u8::try_from(r.read_ue()?).map_err(|_| H265Error::SpsTooShort)?;

        Ok(Self {
            profile_space,
            tier_flag,
            profile_idc,
            compatibility_flags,
            constraint_flags,
            level_idc,
            chroma_format_idc: u8::try_from(chroma_format_idc).map_err(|_| H265Error::SpsTooShort)?,
            bit_depth_luma_minus8,
            bit_depth_chroma_minus8,
            width: u16::try_from(width).map_err(|_| H265Error::SpsTooShort)?,
            height: u16::try_from(height).map_err(|_| H265Error::SpsTooShort)?,
        })
    }
}

// "hvc1.<profile>.4.L<level>.B0".
#[must_use]
pub fn rfc6381_codec(info: &SpsInfo) -> String {
    format!("hvc1.{}.4.L{}.B0", info.profile_idc, info.level_idc)
}

/// Marshals a HEVCDecoderConfigurationRecord.
#[must_use]
pub fn hvcc_marshal(vps: &[u8], sps: &[u8], pps: &[u8], info: &SpsInfo) -> Vec<u8> {
    let mut out = Vec::with_capacity(23 + 5 * 3 + vps.len() + sps.len() + pps.len());
    out.push(1); // Configuration version.
    out.push(info.profile_space << 6 | info.tier_flag << 5 | info.profile_idc);
    out.extend_from_slice(&info.compatibility_flags.to_be_bytes());
    out.extend_from_slice(&info.constraint_flags);
    out.push(info.level_idc);
    out.extend_from_slice(&[0xf0, 0x00]); // min_spatial_segmentation_idc
    out.push(0xfc); // parallelismType
    out.push(0xfc | (info.chroma_format_idc & 0x03));
    out.push(0xf8 | (info.bit_depth_luma_minus8 & 0x07));
    out.push(0xf8 | (info.bit_depth_chroma_minus8 & 0x07));
    out.extend_from_slice(&[0, 0]); // avgFrameRate
                                    // numTemporalLayers=1, temporalIdNested, lengthSizeMinusOne=3.
    out.push(0x0f);
    out.push(3); // numOfArrays

    for (nalu_type, nalu) in [
        (NALU_TYPE_VPS, vps),
        (NALU_TYPE_SPS, sps),
        (NALU_TYPE_PPS, pps),
    ] {
        out.push(0x80 | nalu_type); // array_completeness
        out.extend_from_slice(&1_u16.to_be_bytes());
        let len = u16::try_from(nalu.len()).unwrap_or(0);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(nalu);
    }
    out
}

/// HEVCDecoderConfigurationRecord.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HvcConfig {
    pub vps: Vec<u8>,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
    pub length_size: usize,
}

impl HvcConfig {
    pub fn parse(data: &[u8]) -> Result<Self, H265Error> {
        if data.len() < 23 {
            return Err(H265Error::InvalidConfigurationRecord);
        }
        let length_size = usize::from(data[21] & 0x03) + 1;
        let num_arrays = usize::from(data[22]);

        let mut vps = None;
        let mut sps = None;
        let mut pps = None;

        let mut pos = 23;
        for _ in 0..num_arrays {
            if pos + 3 > data.len() {
                return Err(H265Error::InvalidConfigurationRecord);
            }
            let array_type = data[pos] & 0x3f;
            let num_nalus = usize::from(u16::from(data[pos + 1]) << 8 | u16::from(data[pos + 2]));
            pos += 3;

            for _ in 0..num_nalus {
                if pos + 2 > data.len() {
                    return Err(H265Error::InvalidConfigurationRecord);
                }
                let len = usize::from(u16::from(data[pos]) << 8 | u16::from(data[pos + 1]));
                pos += 2;
                if pos + len > data.len() {
                    return Err(H265Error::InvalidConfigurationRecord);
                }
                let nalu = data[pos..pos + len].to_vec();
                pos += len;

                match array_type {
                    NALU_TYPE_VPS if vps.is_none() => vps = Some(nalu),
                    NALU_TYPE_SPS if sps.is_none() => sps = Some(nalu),
                    NALU_TYPE_PPS if pps.is_none() => pps = Some(nalu),
                    _ => {}
                }
            }
        }

        Ok(Self {
            vps: vps.ok_or(H265Error::InvalidConfigurationRecord)?,
            sps: sps.ok_or(H265Error::InvalidConfigurationRecord)?,
            pps: pps.ok_or(H265Error::InvalidConfigurationRecord)?,
            length_size,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // 1280x720 main profile SPS.
    const TEST_SPS: [u8; 35] = [
        0x42, 0x01, 0x01, 0x01, 0x60, 0x00, 0x00, 0x03, 0x00, 0x90, 0x00, 0x00, 0x03, 0x00, 0x00,
        0x03, 0x00, 0x5d, 0xa0, 0x02, 0x80, 0x80, 0x2d, 0x16, 0x59, 0x59, 0xa4, 0x93, 0x2b, 0xc0,
        0x5a, 0x70, 0x80, 0x00, 0x00,
    ];

    #[test]
    fn test_nalu_type() {
        assert_eq!(NALU_TYPE_SPS, nalu_type(&TEST_SPS));
        assert_eq!(NALU_TYPE_IDR_W_RADL, nalu_type(&[19 << 1, 0]));
    }

    #[test]
    fn test_is_random_access() {
        assert!(is_random_access(NALU_TYPE_IDR_W_RADL));
        assert!(is_random_access(NALU_TYPE_CRA));
        assert!(!is_random_access(NALU_TYPE_SPS));
        assert!(!is_random_access(1));
    }

    #[test]
    fn test_sps_parse() {
        let got = SpsInfo::parse(&TEST_SPS).unwrap();
        assert_eq!(1, got.profile_idc);
        assert_eq!(93, got.level_idc);
        assert_eq!(1280, got.width);
        assert_eq!(720, got.height);
    }

    #[test]
    fn test_rfc6381_codec() {
        let info = SpsInfo::parse(&TEST_SPS).unwrap();
        assert_eq!("hvc1.1.4.L93.B0", rfc6381_codec(&info));
    }

    #[test]
    fn test_hvcc_round_trip() {
        let info = SpsInfo::parse(&TEST_SPS).unwrap();
        let vps = vec![0x40, 0x01, 0x0c];
        let pps = vec![0x44, 0x01, 0xc1];
        let record = hvcc_marshal(&vps, &TEST_SPS, &pps, &info);

        let got = HvcConfig::parse(&record).unwrap();
        assert_eq!(vps, got.vps);
        assert_eq!(TEST_SPS.to_vec(), got.sps);
        assert_eq!(pps, got.pps);
        assert_eq!(4, got.length_size);
    }
}
