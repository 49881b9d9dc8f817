// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    error::ClientError,
    segment_queue::SegmentQueue,
    timesync::{Fmp4TimeSync, LeadingSyncSlot, LeadingTimeSync},
    Callbacks,
};
use bytes::Bytes;
use codecs::{aac, h264, h265};
use common::{ArcMsgLogger, AudioTrack, RoutinePool, Track, TrackCodec, VideoTrack};
use mp4::{FragmentTrack, InitInfo, SampleEntryInfo};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

// Queue depth between the segment loop and each track processor.
const TRACK_QUEUE_SIZE: usize = 200;

#[derive(Clone)]
struct TrackInfo {
    timescale: u32,
    codec: TrackCodec,
    // AVCC length field size for video payloads.
    length_size: usize,
}

/// Parses fmp4 segments and distributes samples to per-track
/// processors. Parts are processed in lockstep so that one slow track
/// cannot run ahead of the others by more than a queue's worth.
pub(crate) struct Fmp4Processor {
    queue: Arc<SegmentQueue>,
    is_leading: bool,
    track_tx: mpsc::Sender<Vec<Track>>,
    start_streaming: watch::Receiver<bool>,
    time_sync: Arc<LeadingSyncSlot>,
    callbacks: Arc<Callbacks>,
    logger: ArcMsgLogger,
    pool: Arc<RoutinePool<ClientError>>,

    track_info: HashMap<u32, TrackInfo>,
    tracks: Vec<Track>,
}

fn track_from_sample_entry(init_track: &mp4::InitTrack) -> Result<(TrackCodec, usize), ClientError> {
    match &init_track.sample_entry {
        SampleEntryInfo::Avc1 { avcc } => {
            let config = h264::AvcConfig::parse(avcc)?;
            Ok((
                TrackCodec::Video(VideoTrack::H264 {
                    sps: config.sps,
                    pps: config.pps,
                }),
                config.length_size,
            ))
        }
        SampleEntryInfo::Hvc1 { hvcc } => {
            let config = h265::HvcConfig::parse(hvcc)?;
            Ok((
                TrackCodec::Video(VideoTrack::H265 {
                    vps: config.vps,
                    sps: config.sps,
                    pps: config.pps,
                }),
                config.length_size,
            ))
        }
        SampleEntryInfo::Mp4a { esds } => {
            let config = aac::parse_esds_config(esds)?;
            let parsed = aac::AudioSpecificConfig::parse(&config)?;
            Ok((
                TrackCodec::Audio(AudioTrack::Mpeg4Audio {
                    config,
                    object_type: parsed.object_type,
                    sample_rate: parsed.sample_rate,
                    channel_count: parsed.channel_count,
                }),
                0,
            ))
        }
        SampleEntryInfo::Opus { channel_count, .. } => Ok((
            TrackCodec::Audio(AudioTrack::Opus {
                channel_count: *channel_count,
            }),
            0,
        )),
    }
}

impl Fmp4Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        init_bytes: &Bytes,
        queue: Arc<SegmentQueue>,
        is_leading: bool,
        track_tx: mpsc::Sender<Vec<Track>>,
        start_streaming: watch::Receiver<bool>,
        time_sync: Arc<LeadingSyncSlot>,
        callbacks: Arc<Callbacks>,
        logger: ArcMsgLogger,
        pool: Arc<RoutinePool<ClientError>>,
    ) -> Result<Self, ClientError> {
        let init: InitInfo = mp4::parse_init(init_bytes)?;

        let mut track_info = HashMap::new();
        let mut tracks = Vec::new();
        for init_track in &init.tracks {
            let (codec, length_size) = track_from_sample_entry(init_track)?;
            track_info.insert(
                init_track.id,
                TrackInfo {
                    timescale: init_track.timescale,
                    codec: codec.clone(),
                    length_size,
                },
            );
            tracks.push(Track {
                id: init_track.id,
                codec,
            });
        }
        if tracks.is_empty() {
            return Err(ClientError::NoTracks);
        }

        Ok(Self {
            queue,
            is_leading,
            track_tx,
            start_streaming,
            time_sync,
            callbacks,
            logger,
            pool,
            track_info,
            tracks,
        })
    }

    pub async fn run(mut self, token: CancellationToken) -> Result<(), ClientError> {
        self.logger.log(
            common::LogLevel::Debug,
            &format!("announcing {} tracks", self.tracks.len()),
        );

        tokio::select! {
            res = self.track_tx.send(self.tracks.clone()) => {
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

        let sync = if self.is_leading {
            let sync = Arc::new(Fmp4TimeSync::new(Instant::now()));
            self.time_sync.set(LeadingTimeSync::Fmp4(sync.clone()));
            sync
        } else {
            match self.time_sync.get(&token).await? {
                LeadingTimeSync::Fmp4(sync) => sync,
                LeadingTimeSync::Mpegts(_) => {
                    return Err(ClientError::LeadingTimeSyncTypeMismatch)
                }
            }
        };

        // Per-part serialization: each dispatched part track is
        // acknowledged before the next segment is pulled.
        let (ack_tx, mut ack_rx) = mpsc::channel::<()>(TRACK_QUEUE_SIZE);

        let mut senders: HashMap<u32, mpsc::Sender<FragmentTrack>> = HashMap::new();
        for (id, info) in &self.track_info {
            let (tx, rx) = mpsc::channel(TRACK_QUEUE_SIZE);
            senders.insert(*id, tx);

            let info = info.clone();
            let sync = sync.clone();
            let callbacks = self.callbacks.clone();
            let ack_tx = ack_tx.clone();
            self.pool.add(move |token| async move {
                track_processor(token, rx, info, sync, callbacks, ack_tx).await
            });
        }

        // The first base time anchors the session at zero.
        let mut start_base_time: Option<(u64, u32)> = None;

        loop {
            let bytes = self.queue.pull(&token).await?;
            let fragments = mp4::parse_fragments(&bytes)?;

            for fragment in fragments {
                let mut dispatched = 0;
                for mut track in fragment.tracks {
                    let info = self
                        .track_info
                        .get(&track.id)
                        .ok_or(ClientError::UnknownTrackId(track.id))?;

                    if start_base_time.is_none() {
                        start_base_time = Some((track.base_time, info.timescale));
                    }
                    let (base, base_timescale) = start_base_time.expect("set above");
                    let base = if info.timescale == base_timescale {
                        base
                    } else {
                        // Rescale the anchor into this track's timescale.
                        u64::try_from(
                            u128::from(base) * u128::from(info.timescale)
                                / u128::from(base_timescale),
                        )
                        .unwrap_or(0)
                    };
                    track.base_time = track.base_time.saturating_sub(base);

                    let tx = &senders[&track.id];
                    tokio::select! {
                        res = tx.send(track) => {
                            if res.is_err() {
                                return Err(ClientError::Terminated);
                            }
                        }
                        () = token.cancelled() => return Err(ClientError::Terminated),
                    }
                    dispatched += 1;
                }

                for _ in 0..dispatched {
                    tokio::select! {
                        res = ack_rx.recv() => {
                            if res.is_none() {
                                return Err(ClientError::Terminated);
                            }
                        }
                        () = token.cancelled() => return Err(ClientError::Terminated),
                    }
                }
            }
        }
    }
}

async fn track_processor(
    token: CancellationToken,
    mut rx: mpsc::Receiver<FragmentTrack>,
    info: TrackInfo,
    sync: Arc<Fmp4TimeSync>,
    callbacks: Arc<Callbacks>,
    ack_tx: mpsc::Sender<()>,
) -> Result<(), ClientError> {
    loop {
        let track = tokio::select! {
            track = rx.recv() => match track {
                Some(track) => track,
                None => return Ok(()),
            },
            () = token.cancelled() => return Ok(()),
        };

        let mut raw_dts = track.base_time;
        for sample in &track.samples {
            let pts = sync
                .convert_and_sync(&token, info.timescale, raw_dts, sample.pts_offset)
                .await?;

            match &info.codec {
                TrackCodec::Video(_) => {
                    let nalus = h264::avcc_unmarshal(&sample.payload, info.length_size)?;
                    (callbacks.on_video)(pts, nalus);
                }
                TrackCodec::Audio(_) => {
                    (callbacks.on_audio)(pts, sample.payload.clone());
                }
            }

            raw_dts += u64::from(sample.duration);
        }

        if ack_tx.send(()).await.is_err() {
            return Ok(());
        }
    }
}
