// SPDX-License-Identifier: GPL-2.0-or-later

use crate::TIMESTAMP_MASK;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PesError {
    #[error("insufficient data: expected {expected}, got {actual}")]
    InsufficientData { expected: usize, actual: usize },

    #[error("invalid start code prefix")]
    InvalidStartCode,

    #[error("invalid pts/dts flags: {0}")]
    InvalidPtsDtsFlags(u8),
}

/// Parse a 33-bit PTS or DTS timestamp from 5 bytes.
///
/// Layout: `[marker(4) | ts32..30 | 1 | ts29..15 | 1 | ts14..0 | 1]`
fn parse_timestamp(data: &[u8]) -> u64 {
    ((u64::from(data[0]) >> 1) & 0x07) << 30
        | u64::from(data[1]) << 22
        | ((u64::from(data[2]) >> 1) & 0x7f) << 15
        | u64::from(data[3]) << 7
        | (u64::from(data[4]) >> 1) & 0x7f
}

// Marshals a 33-bit timestamp with the given 4-bit prefix.
fn write_timestamp(w: &mut Vec<u8>, prefix: u8, ts: u64) {
    let ts = ts & TIMESTAMP_MASK;
    #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
    {
        w.push((prefix << 4) | (((ts >> 30) as u8) << 1) | 1);
        w.push((ts >> 22) as u8);
        w.push((((ts >> 15) as u8) << 1) | 1);
        w.push((ts >> 7) as u8);
        w.push(((ts as u8) << 1) | 1);
    }
}

/// Parsed PES packet header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PesHeader {
    pub stream_id: u8,
    pub pts: Option<u64>,
    pub dts: Option<u64>,

    // Offset to elementary stream data, past the PES header.
    pub payload_offset: usize,
}

impl PesHeader {
    /// Parses a PES header from a buffer starting with the
    /// packet start code prefix `0x000001`.
    pub fn parse(data: &[u8]) -> Result<Self, PesError> {
        if data.len() < 6 {
            return Err(PesError::InsufficientData {
                expected: 6,
                actual: data.len(),
            });
        }
        if data[0] != 0 || data[1] != 0 || data[2] != 1 {
            return Err(PesError::InvalidStartCode);
        }

        let stream_id = data[3];

        if data.len() < 9 {
            return Err(PesError::InsufficientData {
                expected: 9,
                actual: data.len(),
            });
        }

        let pts_dts_flags = (data[7] >> 6) & 0x03;
        let pes_header_data_length = usize::from(data[8]);
        let payload_offset = 9 + pes_header_data_length;

        let (pts, dts) = match pts_dts_flags {
            0b00 => (None, None),
            0b10 => {
                if data.len() < 14 {
                    return Err(PesError::InsufficientData {
                        expected: 14,
                        actual: data.len(),
                    });
                }
                (Some(parse_timestamp(&data[9..14])), None)
            }
            0b11 => {
                if data.len() < 19 {
                    return Err(PesError::InsufficientData {
                        expected: 19,
                        actual: data.len(),
                    });
                }
                (
                    Some(parse_timestamp(&data[9..14])),
                    Some(parse_timestamp(&data[14..19])),
                )
            }
            flags => return Err(PesError::InvalidPtsDtsFlags(flags)),
        };

        if data.len() < payload_offset {
            return Err(PesError::InsufficientData {
                expected: payload_offset,
                actual: data.len(),
            });
        }

        Ok(Self {
            stream_id,
            pts,
            dts,
            payload_offset,
        })
    }

    /// Marshals a PES header for the given payload length.
    ///
    /// The packet length field is left zero for video streams larger
    /// than the 16-bit limit, which the standard permits.
    #[must_use]
    pub fn marshal(stream_id: u8, pts: u64, dts: Option<u64>, payload_len: usize) -> Vec<u8> {
        let header_data_length: u8 = if dts.is_some() { 10 } else { 5 };
        let mut out = Vec::with_capacity(9 + usize::from(header_data_length) + payload_len);

        out.extend_from_slice(&[0, 0, 1, stream_id]);

        let packet_length = 3 + usize::from(header_data_length) + payload_len;
        let packet_length = u16::try_from(packet_length).unwrap_or(0);
        out.extend_from_slice(&packet_length.to_be_bytes());

        // Marker bits and data alignment indicator.
        out.push(0x84);

        match dts {
            Some(dts) => {
                out.push(0xc0);
                out.push(header_data_length);
                write_timestamp(&mut out, 0b0011, pts);
                write_timestamp(&mut out, 0b0001, dts);
            }
            None => {
                out.push(0x80);
                out.push(header_data_length);
                write_timestamp(&mut out, 0b0010, pts);
            }
        }

        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_timestamp_round_trip() {
        for ts in [0, 1, 90_000, TIMESTAMP_MASK, TIMESTAMP_MASK - 20] {
            let mut buf = Vec::new();
            write_timestamp(&mut buf, 0b0010, ts);
            assert_eq!(ts & TIMESTAMP_MASK, parse_timestamp(&buf));
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header = PesHeader::marshal(0xe0, 180_000, Some(177_000), 4);
        let got = PesHeader::parse(&header).unwrap();
        assert_eq!(
            PesHeader {
                stream_id: 0xe0,
                pts: Some(180_000),
                dts: Some(177_000),
                payload_offset: 19,
            },
            got
        );
    }

    #[test]
    fn test_header_no_dts() {
        let header = PesHeader::marshal(0xc0, 90_000, None, 7);
        let got = PesHeader::parse(&header).unwrap();
        assert_eq!(Some(90_000), got.pts);
        assert_eq!(None, got.dts);
        assert_eq!(14, got.payload_offset);
    }

    #[test]
    fn test_invalid_start_code() {
        assert_eq!(
            Err(PesError::InvalidStartCode),
            PesHeader::parse(&[0, 0, 2, 0xe0, 0, 0, 0, 0, 0]).map(|_| ())
        );
    }
}
