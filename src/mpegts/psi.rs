// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{crc32::mpeg2_crc32, demux::DemuxError, EsInfo};

/// Program association section. A single program is assumed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pat {
    pub program_number: u16,
    pub program_map_pid: u16,
}

impl Pat {
    pub fn parse(section: &[u8]) -> Result<Self, DemuxError> {
        if section.len() < 16 {
            return Err(DemuxError::ShortSection);
        }
        if section[0] != 0 {
            return Err(DemuxError::InvalidTableId(section[0]));
        }

        // First program loop entry, after the 8-byte section header.
        let program_number = u16::from(section[8]) << 8 | u16::from(section[9]);
        let program_map_pid = (u16::from(section[10]) & 0x1f) << 8 | u16::from(section[11]);

        Ok(Self {
            program_number,
            program_map_pid,
        })
    }

    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let mut section = vec![
            0x00, // Table id.
            0xb0, // Section syntax indicator, reserved bits.
            0x0d, // Section length.
            0x00,
            0x01, // Transport stream id.
            0xc1, // Version, current/next indicator.
            0x00, // Section number.
            0x00, // Last section number.
        ];
        section.extend_from_slice(&self.program_number.to_be_bytes());
        section.push(0xe0 | u8::try_from(self.program_map_pid >> 8).expect("5 bit pid high"));
        #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
        section.push(self.program_map_pid as u8);
        section.extend_from_slice(&mpeg2_crc32(&section).to_be_bytes());
        section
    }
}

/// Program map section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pmt {
    pub pcr_pid: u16,
    pub streams: Vec<EsInfo>,
}

impl Pmt {
    pub fn parse(section: &[u8]) -> Result<Self, DemuxError> {
        if section.len() < 16 {
            return Err(DemuxError::ShortSection);
        }
        if section[0] != 2 {
            return Err(DemuxError::InvalidTableId(section[0]));
        }

        let section_length = usize::from(u16::from(section[1] & 0x0f) << 8 | u16::from(section[2]));
        let end = 3 + section_length;
        if section.len() < end {
            return Err(DemuxError::ShortSection);
        }

        let pcr_pid = (u16::from(section[8]) & 0x1f) << 8 | u16::from(section[9]);
        let program_info_length =
            usize::from(u16::from(section[10] & 0x0f) << 8 | u16::from(section[11]));

        let mut streams = Vec::new();
        let mut pos = 12 + program_info_length;
        // Stream loop runs until the CRC.
        while pos + 5 <= end - 4 {
            let stream_type = section[pos];
            let pid = (u16::from(section[pos + 1]) & 0x1f) << 8 | u16::from(section[pos + 2]);
            let es_info_length =
                usize::from(u16::from(section[pos + 3] & 0x0f) << 8 | u16::from(section[pos + 4]));
            streams.push(EsInfo { pid, stream_type });
            pos += 5 + es_info_length;
        }

        if streams.is_empty() {
            return Err(DemuxError::NoStreams);
        }

        Ok(Self { pcr_pid, streams })
    }

    #[must_use]
    pub fn marshal(&self) -> Vec<u8> {
        let section_length = 13 + self.streams.len() * 5;
        let mut section = vec![
            0x02, // Table id.
            0xb0 | u8::try_from(section_length >> 8).expect("4 bit length high"),
        ];
        #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
        section.push(section_length as u8);
        section.extend_from_slice(&[
            0x00, 0x01, // Program number.
            0xc1, // Version, current/next indicator.
            0x00, // Section number.
            0x00, // Last section number.
        ]);
        section.push(0xe0 | u8::try_from(self.pcr_pid >> 8).expect("5 bit pid high"));
        #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
        section.push(self.pcr_pid as u8);
        // Program info length.
        section.extend_from_slice(&[0xf0, 0x00]);

        for stream in &self.streams {
            section.push(stream.stream_type);
            section.push(0xe0 | u8::try_from(stream.pid >> 8).expect("5 bit pid high"));
            #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
            section.push(stream.pid as u8);
            // ES info length.
            section.extend_from_slice(&[0xf0, 0x00]);
        }

        section.extend_from_slice(&mpeg2_crc32(&section).to_be_bytes());
        section
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{STREAM_TYPE_ADTS_AAC, STREAM_TYPE_H264};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_pat_round_trip() {
        let pat = Pat {
            program_number: 1,
            program_map_pid: 0x1000,
        };
        assert_eq!(pat, Pat::parse(&pat.marshal()).unwrap());
    }

    #[test]
    fn test_pmt_round_trip() {
        let pmt = Pmt {
            pcr_pid: 256,
            streams: vec![
                EsInfo {
                    pid: 256,
                    stream_type: STREAM_TYPE_H264,
                },
                EsInfo {
                    pid: 257,
                    stream_type: STREAM_TYPE_ADTS_AAC,
                },
            ],
        };
        assert_eq!(pmt, Pmt::parse(&pmt.marshal()).unwrap());
    }
}
