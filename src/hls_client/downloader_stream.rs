// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    error::ClientError,
    fetch::{fetch_bytes, ArcHttpClient},
    processor_fmp4::Fmp4Processor,
    processor_mpegts::MpegtsProcessor,
    segment_queue::SegmentQueue,
    timesync::LeadingSyncSlot,
    Callbacks,
};
use common::{ArcMsgLogger, LogLevel, RoutinePool, Track};
use m3u8_rs::{MediaPlaylist, Playlist};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

pub(crate) async fn fetch_media_playlist(
    http: &ArcHttpClient,
    url: &Url,
    token: &CancellationToken,
) -> Result<MediaPlaylist, ClientError> {
    let bytes = fetch_bytes(http, url, None, token).await?;
    match m3u8_rs::parse_playlist_res(&bytes) {
        Ok(Playlist::MediaPlaylist(playlist)) => Ok(playlist),
        Ok(Playlist::MasterPlaylist(_)) => Err(ClientError::DecodePlaylist(
            "expected a media playlist".to_owned(),
        )),
        Err(e) => Err(ClientError::DecodePlaylist(format!("{e:?}"))),
    }
}

fn byte_range(range: Option<&m3u8_rs::ByteRange>) -> Option<(u64, u64)> {
    range.map(|r| (r.offset.unwrap_or(0), r.length))
}

/// Polls one media playlist and feeds segment bytes to a processor.
pub(crate) struct StreamDownloader {
    pub http: ArcHttpClient,
    pub logger: ArcMsgLogger,
    pub url: Url,
    pub is_leading: bool,

    // Handed down when the primary playlist was already a media
    // playlist.
    pub initial_playlist: Option<MediaPlaylist>,

    pub track_tx: mpsc::Sender<Vec<Track>>,
    pub start_streaming: watch::Receiver<bool>,
    pub time_sync: Arc<LeadingSyncSlot>,
    pub callbacks: Arc<Callbacks>,
    pub pool: Arc<RoutinePool<ClientError>>,

    pub cur_seq: Option<u64>,
}

impl StreamDownloader {
    pub async fn run(mut self, token: CancellationToken) -> Result<(), ClientError> {
        let first_playlist = match self.initial_playlist.take() {
            Some(playlist) => playlist,
            None => fetch_media_playlist(&self.http, &self.url, &token).await?,
        };

        let queue = Arc::new(SegmentQueue::new());

        // EXT-X-MAP decides the segment format.
        let map = first_playlist.segments.first().and_then(|s| s.map.clone());
        if let Some(map) = map {
            let map_url = self.url.join(&map.uri)?;
            let init_bytes =
                fetch_bytes(&self.http, &map_url, byte_range(map.byte_range.as_ref()), &token)
                    .await?;

            let processor = Fmp4Processor::new(
                &init_bytes,
                queue.clone(),
                self.is_leading,
                self.track_tx.clone(),
                self.start_streaming.clone(),
                self.time_sync.clone(),
                self.callbacks.clone(),
                self.logger.clone(),
                self.pool.clone(),
            )?;
            self.pool.add(|token| processor.run(token));
        } else {
            let processor = MpegtsProcessor {
                queue: queue.clone(),
                is_leading: self.is_leading,
                track_tx: self.track_tx.clone(),
                start_streaming: self.start_streaming.clone(),
                time_sync: self.time_sync.clone(),
                callbacks: self.callbacks.clone(),
                logger: self.logger.clone(),
                pool: self.pool.clone(),
            };
            self.pool.add(|token| processor.run(token));
        }

        let mut first_playlist = Some(first_playlist);
        loop {
            queue.wait_until_size_below(1, &token).await?;

            // The playlist is refreshed on every iteration.
            let playlist = match first_playlist.take() {
                Some(playlist) => playlist,
                None => fetch_media_playlist(&self.http, &self.url, &token).await?,
            };
            self.fill_segment_queue(&playlist, &queue, &token).await?;
        }
    }

    async fn fill_segment_queue(
        &mut self,
        playlist: &MediaPlaylist,
        queue: &SegmentQueue,
        token: &CancellationToken,
    ) -> Result<(), ClientError> {
        let segments = &playlist.segments;
        let live = !playlist.end_list;

        let index = match self.cur_seq {
            None => {
                if live {
                    // Start a few segments behind the live edge.
                    if segments.len() < 3 {
                        return Err(ClientError::NotEnoughSegments);
                    }
                    segments.len() - 3
                } else {
                    if segments.is_empty() {
                        return Err(ClientError::NotEnoughSegments);
                    }
                    0
                }
            }
            Some(cur_seq) => {
                let next_seq = cur_seq + 1;
                if next_seq < playlist.media_sequence {
                    return Err(ClientError::FollowingSegmentNotFound);
                }
                let index = usize::try_from(next_seq - playlist.media_sequence)
                    .map_err(|_| ClientError::FollowingSegmentNotFound)?;
                if index >= segments.len() {
                    return Err(ClientError::FollowingSegmentNotFound);
                }

                let inverse_index = segments.len() - index;
                if live && inverse_index > 5 {
                    return Err(ClientError::PlaybackTooLate);
                }
                index
            }
        };

        self.cur_seq =
            Some(playlist.media_sequence + u64::try_from(index).expect("usize to fit u64"));

        let segment = &segments[index];
        let segment_url = self.url.join(&segment.uri)?;
        self.logger
            .log(LogLevel::Debug, &format!("downloading {}", segment.uri));

        let bytes = fetch_bytes(
            &self.http,
            &segment_url,
            byte_range(segment.byte_range.as_ref()),
            token,
        )
        .await?;
        queue.push(bytes);

        if !live && index == segments.len() - 1 {
            // All of the content was consumed.
            token.cancelled().await;
            return Err(ClientError::StreamEnded);
        }

        Ok(())
    }
}
