// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    pes::PesHeader,
    psi::{Pat, Pmt},
    EsInfo, PACKET_SIZE, PID_PAT, SYNC_BYTE, TIMESTAMP_MASK,
};
use std::collections::HashMap;

const PID_PMT: u16 = 0x1000;

// Payload bytes per packet after the 4-byte header.
const PACKET_PAYLOAD_SIZE: usize = PACKET_SIZE - 4;

/// Transport stream packetizer writing into an in-memory buffer.
pub struct Muxer {
    buf: Vec<u8>,
    continuity: HashMap<u16, u8>,
    streams: Vec<EsInfo>,
    pcr_pid: u16,
}

impl Muxer {
    #[must_use]
    pub fn new(streams: Vec<EsInfo>, pcr_pid: u16) -> Self {
        Self {
            buf: Vec::new(),
            continuity: HashMap::new(),
            streams,
            pcr_pid,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    /// Writes the PAT and PMT packets. Must precede any media packet.
    pub fn write_tables(&mut self) {
        let pat = Pat {
            program_number: 1,
            program_map_pid: PID_PMT,
        }
        .marshal();
        self.write_section(PID_PAT, &pat);

        let pmt = Pmt {
            pcr_pid: self.pcr_pid,
            streams: self.streams.clone(),
        }
        .marshal();
        self.write_section(PID_PMT, &pmt);
    }

    fn next_continuity(&mut self, pid: u16) -> u8 {
        let counter = self.continuity.entry(pid).or_insert(0);
        let current = *counter;
        *counter = (current + 1) & 0x0f;
        current
    }

    fn write_section(&mut self, pid: u16, section: &[u8]) {
        let continuity = self.next_continuity(pid);
        self.buf.push(SYNC_BYTE);
        self.buf
            .push(0x40 | u8::try_from(pid >> 8).expect("5 bit pid high"));
        #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
        self.buf.push(pid as u8);
        self.buf.push(0x10 | continuity);

        // Pointer field.
        self.buf.push(0);
        self.buf.extend_from_slice(section);

        let used = 1 + section.len();
        self.buf
            .extend(std::iter::repeat(0xff).take(PACKET_PAYLOAD_SIZE - used));
    }

    /// Packetizes one PES packet. The PCR and the random access
    /// indicator are carried in the first packet's adaptation field.
    pub fn write_pes(
        &mut self,
        pid: u16,
        stream_id: u8,
        pts: u64,
        dts: Option<u64>,
        random_access: bool,
        pcr: Option<u64>,
        payload: &[u8],
    ) {
        let mut data = PesHeader::marshal(stream_id, pts, dts, payload.len());
        data.extend_from_slice(payload);

        let mut pos = 0;
        let mut first = true;
        while pos < data.len() {
            let remaining = data.len() - pos;

            // Adaptation field content, excluding the length byte.
            let mut af = Vec::new();
            if first {
                let mut flags: u8 = 0;
                if random_access {
                    flags |= 0x40;
                }
                if pcr.is_some() {
                    flags |= 0x10;
                }
                if flags != 0 {
                    af.push(flags);
                    if let Some(pcr) = pcr {
                        write_pcr(&mut af, pcr);
                    }
                }
            }

            let af_total = if af.is_empty() { 0 } else { 1 + af.len() };
            let mut payload_space = PACKET_PAYLOAD_SIZE - af_total;

            let af_total = if remaining < payload_space {
                // Grow the adaptation field with stuffing so the
                // remaining payload exactly fills the packet.
                payload_space = remaining;
                PACKET_PAYLOAD_SIZE - remaining
            } else {
                af_total
            };

            let continuity = self.next_continuity(pid);
            self.buf.push(SYNC_BYTE);
            let mut flags_high = u8::try_from(pid >> 8).expect("5 bit pid high");
            if first {
                flags_high |= 0x40;
            }
            self.buf.push(flags_high);
            #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
            self.buf.push(pid as u8);

            if af_total == 0 {
                self.buf.push(0x10 | continuity);
            } else {
                self.buf.push(0x30 | continuity);
                self.buf
                    .push(u8::try_from(af_total - 1).expect("af fits packet"));
                if af_total > 1 {
                    if af.is_empty() {
                        // Stuffing-only field still carries flags.
                        af.push(0);
                    }
                    let stuffing = af_total - 1 - af.len();
                    af.extend(std::iter::repeat(0xff).take(stuffing));
                    self.buf.extend_from_slice(&af);
                }
            }

            self.buf.extend_from_slice(&data[pos..pos + payload_space]);
            pos += payload_space;
            first = false;
        }
    }
}

fn write_pcr(w: &mut Vec<u8>, pcr: u64) {
    let base = pcr & TIMESTAMP_MASK;
    #[allow(clippy::as_conversions, clippy::cast_possible_truncation)]
    {
        w.push((base >> 25) as u8);
        w.push((base >> 17) as u8);
        w.push((base >> 9) as u8);
        w.push((base >> 1) as u8);
        // Reserved bits and a zero 9-bit extension.
        w.push((((base & 1) as u8) << 7) | 0x7e);
        w.push(0);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::STREAM_TYPE_H264;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_packets_are_aligned() {
        let mut muxer = Muxer::new(
            vec![EsInfo {
                pid: 256,
                stream_type: STREAM_TYPE_H264,
            }],
            256,
        );
        muxer.write_tables();
        muxer.write_pes(256, 0xe0, 0, None, false, None, &[0; 500]);

        assert_eq!(0, muxer.len() % PACKET_SIZE);
        for packet in muxer.buf.chunks(PACKET_SIZE) {
            assert_eq!(SYNC_BYTE, packet[0]);
        }
    }

    #[test]
    fn test_first_packet_adaptation_field() {
        let mut muxer = Muxer::new(
            vec![EsInfo {
                pid: 256,
                stream_type: STREAM_TYPE_H264,
            }],
            256,
        );
        muxer.write_pes(256, 0xe0, 0, None, true, Some(90_000), &[0; 400]);

        let packet = &muxer.buf[..PACKET_SIZE];
        // Payload unit start on the first packet.
        assert_eq!(0x41, packet[1]);
        // Adaptation field and payload present.
        assert_eq!(0x30, packet[3] & 0xf0);
        // Random access indicator and PCR flag.
        assert_eq!(0x50, packet[5]);
    }

    #[test]
    fn test_continuity_counter_wraps() {
        let mut muxer = Muxer::new(Vec::new(), 256);
        for want in (0..16).chain(0..2) {
            assert_eq!(want, muxer.next_continuity(256));
        }
    }
}
