// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    pes::{PesError, PesHeader},
    psi::{Pat, Pmt},
    PACKET_SIZE, PID_PAT, SYNC_BYTE,
};
use bytes::Bytes;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DemuxError {
    #[error("invalid sync byte")]
    InvalidSyncByte,

    #[error("truncated packet")]
    TruncatedPacket,

    #[error("short section")]
    ShortSection,

    #[error("invalid table id: {0}")]
    InvalidTableId(u8),

    #[error("program map table contains no streams")]
    NoStreams,

    #[error("program map table not found")]
    PmtNotFound,
}

/// One elementary stream from the program map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EsInfo {
    pub pid: u16,
    pub stream_type: u8,
}

/// A fully assembled PES packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PesPacket {
    pub pid: u16,
    pub stream_type: u8,
    pub pts: Option<u64>,
    pub dts: Option<u64>,
    pub payload: Bytes,
}

#[derive(Debug)]
pub struct DemuxedSegment {
    pub streams: Vec<EsInfo>,
    pub packets: Vec<PesPacket>,

    // PES packets the demuxer failed to parse. The caller decides
    // whether skipping them is acceptable.
    pub skipped: Vec<PesError>,
}

/// Parses one MPEG-TS segment into its PES packets.
///
/// The program tables are expected to precede the media packets,
/// which the muxers this client consumes from all guarantee.
pub fn parse_segment(data: &[u8]) -> Result<DemuxedSegment, DemuxError> {
    let mut pat: Option<Pat> = None;
    let mut pmt: Option<Pmt> = None;

    // PES assembly buffers by pid, flushed on payload unit start.
    let mut assembly: HashMap<u16, Vec<u8>> = HashMap::new();
    let mut completed: Vec<(u16, Vec<u8>)> = Vec::new();
    // Remember pid order of first appearance for the trailing flush.
    let mut pid_order: Vec<u16> = Vec::new();

    for packet in data.chunks(PACKET_SIZE) {
        if packet.len() != PACKET_SIZE {
            return Err(DemuxError::TruncatedPacket);
        }
        if packet[0] != SYNC_BYTE {
            return Err(DemuxError::InvalidSyncByte);
        }

        let payload_unit_start = packet[1] & 0x40 != 0;
        let pid = (u16::from(packet[1]) & 0x1f) << 8 | u16::from(packet[2]);
        let adaptation_field_control = (packet[3] >> 4) & 0x03;

        let mut payload_start = 4;
        if adaptation_field_control == 2 {
            // Adaptation field only.
            continue;
        }
        if adaptation_field_control == 3 {
            payload_start += 1 + usize::from(packet[4]);
            if payload_start >= PACKET_SIZE {
                continue;
            }
        }
        let payload = &packet[payload_start..];

        if pid == PID_PAT {
            if pat.is_none() && payload_unit_start {
                let pointer = usize::from(payload[0]);
                if payload.len() <= 1 + pointer {
                    return Err(DemuxError::ShortSection);
                }
                pat = Some(Pat::parse(&payload[1 + pointer..])?);
            }
            continue;
        }

        if let Some(parsed_pat) = &pat {
            if pid == parsed_pat.program_map_pid {
                if pmt.is_none() && payload_unit_start {
                    let pointer = usize::from(payload[0]);
                    if payload.len() <= 1 + pointer {
                        return Err(DemuxError::ShortSection);
                    }
                    pmt = Some(Pmt::parse(&payload[1 + pointer..])?);
                }
                continue;
            }
        }

        let Some(parsed_pmt) = &pmt else {
            continue;
        };
        if !parsed_pmt.streams.iter().any(|s| s.pid == pid) {
            continue;
        }

        if payload_unit_start {
            if let Some(buf) = assembly.remove(&pid) {
                completed.push((pid, buf));
            }
            if !pid_order.contains(&pid) {
                pid_order.push(pid);
            }
            assembly.insert(pid, payload.to_vec());
        } else if let Some(buf) = assembly.get_mut(&pid) {
            buf.extend_from_slice(payload);
        }
    }

    let pmt = pmt.ok_or(DemuxError::PmtNotFound)?;

    for pid in &pid_order {
        if let Some(buf) = assembly.remove(pid) {
            completed.push((*pid, buf));
        }
    }

    let stream_type_by_pid: HashMap<u16, u8> =
        pmt.streams.iter().map(|s| (s.pid, s.stream_type)).collect();

    let mut packets = Vec::with_capacity(completed.len());
    let mut skipped = Vec::new();
    for (pid, buf) in completed {
        match PesHeader::parse(&buf) {
            Ok(header) => packets.push(PesPacket {
                pid,
                stream_type: stream_type_by_pid[&pid],
                pts: header.pts,
                dts: header.dts,
                payload: Bytes::from(buf).slice(header.payload_offset..),
            }),
            Err(e) => skipped.push(e),
        }
    }

    Ok(DemuxedSegment {
        streams: pmt.streams,
        packets,
        skipped,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::{Muxer, STREAM_TYPE_ADTS_AAC, STREAM_TYPE_H264, STREAM_ID_AUDIO, STREAM_ID_VIDEO};
    use pretty_assertions::assert_eq;

    #[test]
    fn test_round_trip_single_video_pes() {
        let streams = vec![EsInfo {
            pid: 256,
            stream_type: STREAM_TYPE_H264,
        }];
        let mut muxer = Muxer::new(streams.clone(), 256);
        muxer.write_tables();
        muxer.write_pes(
            256,
            STREAM_ID_VIDEO,
            180_000,
            Some(177_000),
            true,
            Some(90_000),
            b"hello world",
        );

        let got = parse_segment(&muxer.take()).unwrap();
        assert_eq!(streams, got.streams);
        assert_eq!(1, got.packets.len());
        assert!(got.skipped.is_empty());

        let packet = &got.packets[0];
        assert_eq!(256, packet.pid);
        assert_eq!(STREAM_TYPE_H264, packet.stream_type);
        assert_eq!(Some(180_000), packet.pts);
        assert_eq!(Some(177_000), packet.dts);
        assert_eq!(Bytes::from_static(b"hello world"), packet.payload);
    }

    #[test]
    fn test_round_trip_two_streams() {
        let streams = vec![
            EsInfo {
                pid: 256,
                stream_type: STREAM_TYPE_H264,
            },
            EsInfo {
                pid: 257,
                stream_type: STREAM_TYPE_ADTS_AAC,
            },
        ];
        let mut muxer = Muxer::new(streams.clone(), 256);
        muxer.write_tables();
        let video: Vec<u8> = (0..=255).cycle().take(1000).collect();
        muxer.write_pes(256, STREAM_ID_VIDEO, 90_000, Some(87_000), true, None, &video);
        muxer.write_pes(257, STREAM_ID_AUDIO, 90_000, None, false, None, b"audio au");

        let got = parse_segment(&muxer.take()).unwrap();
        assert_eq!(streams, got.streams);
        assert_eq!(2, got.packets.len());
        assert_eq!(Bytes::from(video), got.packets[0].payload);
        assert_eq!(Some(90_000), got.packets[1].pts);
        assert_eq!(None, got.packets[1].dts);
    }

    #[test]
    fn test_missing_pmt() {
        assert_eq!(
            Err(DemuxError::PmtNotFound),
            parse_segment(&[]).map(|_| ())
        );
    }
}
