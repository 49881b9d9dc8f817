// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    error::ClientError,
    segment_queue::SegmentQueue,
    timesync::{LeadingSyncSlot, LeadingTimeSync, MpegtsTimeSync},
    Callbacks,
};
use bytes::Bytes;
use codecs::{aac, h264};
use common::{
    time::SECOND, ArcMsgLogger, AudioTrack, LogLevel, RoutinePool, Track, TrackCodec, VideoTrack,
};
use mpegts::{DemuxedSegment, PesPacket, STREAM_TYPE_ADTS_AAC, STREAM_TYPE_H264};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

// Queue depth between the demuxer loop and each track processor.
const TRACK_QUEUE_SIZE: usize = 100;

/// Parses MPEG-TS segments and distributes access units to per-track
/// processors. Only H.264 video and AAC audio are accepted.
pub(crate) struct MpegtsProcessor {
    pub queue: Arc<SegmentQueue>,
    pub is_leading: bool,
    pub track_tx: mpsc::Sender<Vec<Track>>,
    pub start_streaming: watch::Receiver<bool>,
    pub time_sync: Arc<LeadingSyncSlot>,
    pub callbacks: Arc<Callbacks>,
    pub logger: ArcMsgLogger,
    pub pool: Arc<RoutinePool<ClientError>>,
}

// Finds the parameter sets of a video pid in the first segment.
fn find_video_params(segment: &DemuxedSegment, pid: u16) -> (Vec<u8>, Vec<u8>) {
    let mut sps = Vec::new();
    let mut pps = Vec::new();
    for packet in segment.packets.iter().filter(|p| p.pid == pid) {
        let Ok(nalus) = h264::annexb_unmarshal(&packet.payload) else {
            continue;
        };
        for nalu in nalus {
            match h264::nalu_type(&nalu) {
                h264::NALU_TYPE_SPS if sps.is_empty() => sps = nalu.to_vec(),
                h264::NALU_TYPE_PPS if pps.is_empty() => pps = nalu.to_vec(),
                _ => {}
            }
        }
        if !sps.is_empty() && !pps.is_empty() {
            break;
        }
    }
    (sps, pps)
}

// Discovers the AAC configuration from the first ADTS packet.
fn find_audio_params(segment: &DemuxedSegment, pid: u16) -> Result<AudioTrack, ClientError> {
    let packet = segment
        .packets
        .iter()
        .find(|p| p.pid == pid)
        .ok_or(ClientError::NoTracks)?;
    let frames = aac::parse_adts(&packet.payload)?;
    let first = &frames[0];

    Ok(AudioTrack::Mpeg4Audio {
        config: aac::AudioSpecificConfig {
            object_type: first.object_type,
            sample_rate: first.sample_rate,
            channel_count: first.channel_count,
        }
        .marshal(),
        object_type: first.object_type,
        sample_rate: first.sample_rate,
        channel_count: first.channel_count,
    })
}

impl MpegtsProcessor {
    #[allow(clippy::too_many_lines)]
    pub async fn run(mut self, token: CancellationToken) -> Result<(), ClientError> {
        let first_segment = self.queue.pull(&token).await?;
        let mut segment = mpegts::parse_segment(&first_segment)?;

        // Build the track list from the program map, then re-scan the
        // same buffer for samples.
        let mut tracks = Vec::new();
        for stream in &segment.streams {
            match stream.stream_type {
                STREAM_TYPE_H264 => {
                    let (sps, pps) = find_video_params(&segment, stream.pid);
                    tracks.push(Track {
                        id: u32::from(stream.pid),
                        codec: TrackCodec::Video(VideoTrack::H264 { sps, pps }),
                    });
                }
                STREAM_TYPE_ADTS_AAC => {
                    tracks.push(Track {
                        id: u32::from(stream.pid),
                        codec: TrackCodec::Audio(find_audio_params(&segment, stream.pid)?),
                    });
                }
                _ => {}
            }
        }
        if tracks.is_empty() {
            return Err(ClientError::NoTracks);
        }

        let accepted: Vec<(u16, TrackCodec)> = tracks
            .iter()
            .map(|t| {
                (
                    u16::try_from(t.id).expect("pid fits u16"),
                    t.codec.clone(),
                )
            })
            .collect();

        tokio::select! {
            res = self.track_tx.send(tracks) => {
                if res.is_err() {
                    return Err(ClientError::Terminated);
                }
            }
            () = token.cancelled() => return Err(ClientError::Terminated),
        }

        tokio::select! {
            res = self.start_streaming.wait_for(|v| *v) => {
                if res.is_err() {
                    return Err(ClientError::Terminated);
                }
            }
            () = token.cancelled() => return Err(ClientError::Terminated),
        }

        // The first video pid leads, or the first pid of any kind.
        let leading_pid = accepted
            .iter()
            .find(|(_, codec)| matches!(codec, TrackCodec::Video(_)))
            .map_or(accepted[0].0, |(pid, _)| *pid);

        let sync = if self.is_leading {
            let first_pes = segment
                .packets
                .iter()
                .find(|p| p.pid == leading_pid)
                .ok_or(ClientError::MissingPts)?;
            let raw_dts = first_pes
                .dts
                .or(first_pes.pts)
                .ok_or(ClientError::MissingPts)?;

            let sync = Arc::new(MpegtsTimeSync::new(Instant::now(), raw_dts));
            self.time_sync
                .set(LeadingTimeSync::Mpegts(sync.clone()));
            sync
        } else {
            match self.time_sync.get(&token).await? {
                LeadingTimeSync::Mpegts(sync) => sync,
                LeadingTimeSync::Fmp4(_) => return Err(ClientError::LeadingTimeSyncTypeMismatch),
            }
        };

        // One processor per pid.
        let mut senders: HashMap<u16, mpsc::Sender<PesPacket>> = HashMap::new();
        for (pid, codec) in accepted {
            let (tx, rx) = mpsc::channel(TRACK_QUEUE_SIZE);
            senders.insert(pid, tx);

            let sync = sync.clone();
            let callbacks = self.callbacks.clone();
            match codec {
                TrackCodec::Video(_) => self.pool.add(move |token| async move {
                    video_track_processor(token, rx, sync, callbacks).await
                }),
                TrackCodec::Audio(_) => self.pool.add(move |token| async move {
                    audio_track_processor(token, rx, sync, callbacks).await
                }),
            }
        }

        loop {
            for skipped in &segment.skipped {
                // Parse failures from the demuxer are not fatal.
                self.logger
                    .log(LogLevel::Debug, &format!("skipping pes packet: {skipped}"));
            }

            for packet in segment.packets {
                let Some(tx) = senders.get(&packet.pid) else {
                    continue;
                };
                tokio::select! {
                    res = tx.send(packet) => {
                        if res.is_err() {
                            return Err(ClientError::Terminated);
                        }
                    }
                    () = token.cancelled() => return Err(ClientError::Terminated),
                }
            }

            let bytes = self.queue.pull(&token).await?;
            segment = mpegts::parse_segment(&bytes)?;
        }
    }
}

async fn video_track_processor(
    token: CancellationToken,
    mut rx: mpsc::Receiver<PesPacket>,
    sync: Arc<MpegtsTimeSync>,
    callbacks: Arc<Callbacks>,
) -> Result<(), ClientError> {
    loop {
        let packet = tokio::select! {
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => return Ok(()),
            },
            () = token.cancelled() => return Ok(()),
        };

        let raw_pts = packet.pts.ok_or(ClientError::MissingPts)?;
        let raw_dts = packet.dts.unwrap_or(raw_pts);

        let pts = sync.convert_and_sync(&token, raw_dts, raw_pts).await?;
        if *pts < 0 {
            // The sample predates the leading stream's origin.
            continue;
        }

        let nalus: Vec<Bytes> = h264::annexb_unmarshal(&packet.payload)?
            .into_iter()
            .filter(|n| h264::nalu_type(n) != h264::NALU_TYPE_AUD)
            .collect();
        if nalus.is_empty() {
            continue;
        }

        (callbacks.on_video)(pts, nalus);
    }
}

async fn audio_track_processor(
    token: CancellationToken,
    mut rx: mpsc::Receiver<PesPacket>,
    sync: Arc<MpegtsTimeSync>,
    callbacks: Arc<Callbacks>,
) -> Result<(), ClientError> {
    loop {
        let packet = tokio::select! {
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => return Ok(()),
            },
            () = token.cancelled() => return Ok(()),
        };

        let raw_pts = packet.pts.ok_or(ClientError::MissingPts)?;

        let pts = sync.convert_and_sync(&token, raw_pts, raw_pts).await?;
        if *pts < 0 {
            continue;
        }

        // One access unit per ADTS frame, each offset by its position.
        for (i, frame) in aac::parse_adts(&packet.payload)?.iter().enumerate() {
            let offset = i64::try_from(i).expect("frame index")
                * i64::from(aac::SAMPLES_PER_ACCESS_UNIT)
                * SECOND
                / i64::from(frame.sample_rate);
            let au_pts = pts
                .checked_add(common::time::Duration::from_nanos(offset))
                .ok_or(ClientError::MissingPts)?;

            (callbacks.on_audio)(au_pts, frame.au.clone());
        }
    }
}
