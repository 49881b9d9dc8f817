// SPDX-License-Identifier: GPL-2.0-or-later

use bytes::Bytes;
use thiserror::Error;

// Samples per access unit for AAC-LC.
pub const SAMPLES_PER_ACCESS_UNIT: u32 = 1024;

pub const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AacError {
    #[error("invalid adts sync word")]
    InvalidSyncWord,

    #[error("truncated adts frame")]
    TruncatedFrame,

    #[error("invalid sampling frequency index: {0}")]
    InvalidSampleRateIndex(u8),

    #[error("invalid channel configuration: {0}")]
    InvalidChannelConfiguration(u8),

    #[error("audio specific config too short")]
    ConfigTooShort,
}

/// One decoded ADTS frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdtsFrame {
    pub object_type: u8,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub au: Bytes,
}

/// Splits an ADTS stream into frames, one access unit each.
pub fn parse_adts(data: &Bytes) -> Result<Vec<AdtsFrame>, AacError> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < data.len() {
        if data.len() - pos < 7 {
            return Err(AacError::TruncatedFrame);
        }
        let b = &data[pos..];
        if b[0] != 0xff || b[1] & 0xf0 != 0xf0 {
            return Err(AacError::InvalidSyncWord);
        }

        let protection_absent = b[1] & 1 != 0;
        let object_type = ((b[2] >> 6) & 0x03) + 1;
        let sample_rate_index = (b[2] >> 2) & 0x0f;
        let sample_rate = *SAMPLE_RATES
            .get(usize::from(sample_rate_index))
            .ok_or(AacError::InvalidSampleRateIndex(sample_rate_index))?;
        let channel_count = u16::from((b[2] & 1) << 2 | b[3] >> 6);
        if channel_count == 0 {
            return Err(AacError::InvalidChannelConfiguration(0));
        }

        let frame_length =
            usize::from(b[3] & 0x03) << 11 | usize::from(b[4]) << 3 | usize::from(b[5] >> 5);
        let header_length = if protection_absent { 7 } else { 9 };
        if frame_length < header_length || pos + frame_length > data.len() {
            return Err(AacError::TruncatedFrame);
        }

        frames.push(AdtsFrame {
            object_type,
            sample_rate,
            channel_count,
            au: data.slice(pos + header_length..pos + frame_length),
        });
        pos += frame_length;
    }

    if frames.is_empty() {
        return Err(AacError::TruncatedFrame);
    }
    Ok(frames)
}

/// Marshals one access unit into an ADTS frame.
#[must_use]
pub fn marshal_adts(object_type: u8, sample_rate_index: u8, channel_count: u16, au: &[u8]) -> Vec<u8> {
    let frame_length = 7 + au.len();
    let mut out = Vec::with_capacity(frame_length);
    #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
    {
        out.push(0xff);
        out.push(0xf1); // MPEG-4, no CRC.
        out.push(((object_type - 1) & 0x03) << 6
            | (sample_rate_index & 0x0f) << 2
            | (channel_count as u8 >> 2) & 1);
        out.push(((channel_count as u8) & 0x03) << 6 | ((frame_length >> 11) as u8 & 0x03));
        out.push((frame_length >> 3) as u8);
        out.push((((frame_length & 0x07) as u8) << 5) | 0x1f);
        out.push(0xfc);
    }
    out.extend_from_slice(au);
    out
}

/// MPEG-4 AudioSpecificConfig.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sample_rate: u32,
    pub channel_count: u16,
}

impl AudioSpecificConfig {
    pub fn parse(data: &[u8]) -> Result<Self, AacError> {
        if data.len() < 2 {
            return Err(AacError::ConfigTooShort);
        }
        let object_type = data[0] >> 3;
        let sample_rate_index = (data[0] & 0x07) << 1 | data[1] >> 7;
        let sample_rate = *SAMPLE_RATES
            .get(usize::from(sample_rate_index))
            .ok_or(AacError::InvalidSampleRateIndex(sample_rate_index))?;
        let channel_count = u16::from((data[1] >> 3) & 0x0f);
        if channel_count == 0 {
            return Err(AacError::InvalidChannelConfiguration(0));
        }
        Ok(Self {
            object_type,
            sample_rate,
            channel_count,
        })
    }

    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let index = sample_rate_index(self.sample_rate).unwrap_or(4);
        #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
        vec![
            self.object_type << 3 | index >> 1,
            (index & 1) << 7 | (self.channel_count as u8) << 3,
        ]
    }
}

#[must_use]
pub fn sample_rate_index(sample_rate: u32) -> Option<u8> {
    SAMPLE_RATES
        .iter()
        .position(|&v| v == sample_rate)
        .and_then(|v| u8::try_from(v).ok())
}

#[must_use]
pub fn rfc6381_codec(object_type: u8) -> String {
    format!("mp4a.40.{object_type}")
}

/// Extracts the DecoderSpecificInfo from an esds box payload.
pub fn parse_esds_config(esds: &[u8]) -> Result<Vec<u8>, AacError> {
    // Skip the FullBox header and walk the descriptor tree. Sizes use
    // the expandable encoding with 7 bits per byte.
    let mut pos = 4;

    let read_descriptor = |pos: &mut usize| -> Result<(u8, usize), AacError> {
        if *pos >= esds.len() {
            return Err(AacError::ConfigTooShort);
        }
        let tag = esds[*pos];
        *pos += 1;
        let mut size: usize = 0;
        loop {
            if *pos >= esds.len() {
                return Err(AacError::ConfigTooShort);
            }
            let b = esds[*pos];
            *pos += 1;
            size = (size << 7) | usize::from(b & 0x7f);
            if b & 0x80 == 0 {
                break;
            }
        }
        Ok((tag, size))
    };

    // ES descriptor.
    let (tag, _) = read_descriptor(&mut pos)?;
    if tag != 0x03 {
        return Err(AacError::ConfigTooShort);
    }
    // ES id and flags. Extended fields are not expected from the
    // muxers this client consumes from.
    pos += 3;

    // Decoder config descriptor.
    let (tag, _) = read_descriptor(&mut pos)?;
    if tag != 0x04 {
        return Err(AacError::ConfigTooShort);
    }
    pos += 13;

    // Decoder specific info.
    let (tag, size) = read_descriptor(&mut pos)?;
    if tag != 0x05 || pos + size > esds.len() {
        return Err(AacError::ConfigTooShort);
    }
    Ok(esds[pos..pos + size].to_vec())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_adts_round_trip() {
        let au = vec![1, 2, 3, 4, 5];
        let mut stream = marshal_adts(2, 3, 2, &au);
        stream.extend(marshal_adts(2, 3, 2, &[9, 8]));

        let got = parse_adts(&Bytes::from(stream)).unwrap();
        assert_eq!(2, got.len());
        assert_eq!(
            AdtsFrame {
                object_type: 2,
                sample_rate: 48000,
                channel_count: 2,
                au: Bytes::from(au),
            },
            got[0]
        );
        assert_eq!(Bytes::from_static(&[9, 8]), got[1].au);
    }

    #[test]
    fn test_adts_invalid_sync() {
        assert_eq!(
            Err(AacError::InvalidSyncWord),
            parse_adts(&Bytes::from_static(&[0, 0, 0, 0, 0, 0, 0])).map(|_| ())
        );
    }

    #[test]
    fn test_audio_specific_config_round_trip() {
        let config = AudioSpecificConfig {
            object_type: 2,
            sample_rate: 44100,
            channel_count: 2,
        };
        assert_eq!(
            config,
            AudioSpecificConfig::parse(&config.marshal()).unwrap()
        );
    }

    #[test]
    fn test_rfc6381_codec() {
        assert_eq!("mp4a.40.2", rfc6381_codec(2));
    }

    #[test]
    fn test_parse_esds_config() {
        let mut esds = vec![0, 0, 0, 0]; // FullBox.
        esds.extend_from_slice(&[0x03, 22, 0, 2, 0]); // ES descriptor.
        esds.extend_from_slice(&[0x04, 17, 0x40, 0x15]); // Decoder config.
        esds.extend_from_slice(&[0, 0, 0]); // Buffer size.
        esds.extend_from_slice(&[0, 1, 0xf4, 0]); // Max bitrate.
        esds.extend_from_slice(&[0, 1, 0xf4, 0]); // Average bitrate.
        esds.extend_from_slice(&[0x05, 2, 0x11, 0x90]); // Specific info.
        esds.extend_from_slice(&[0x06, 1, 0x02]); // SL config.

        assert_eq!(vec![0x11, 0x90], parse_esds_config(&esds).unwrap());
    }
}
