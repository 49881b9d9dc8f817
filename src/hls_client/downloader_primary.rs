// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    downloader_stream::StreamDownloader,
    error::ClientError,
    fetch::{fetch_bytes, ArcHttpClient},
    timesync::LeadingSyncSlot,
    Callbacks, OnTracksFunc,
};
use common::{ArcMsgLogger, LogLevel, RoutinePool, Track};
use m3u8_rs::{AlternativeMedia, AlternativeMediaType, MasterPlaylist, Playlist, VariantStream};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

// Codec strings the processors can decode.
fn codec_supported(codec: &str) -> bool {
    let codec = codec.trim();
    codec.starts_with("avc1.")
        || codec.starts_with("hvc1.")
        || codec.starts_with("hev1.")
        || codec.starts_with("mp4a.")
        || codec.eq_ignore_ascii_case("opus")
}

fn variant_supported(variant: &VariantStream) -> bool {
    let Some(codecs) = &variant.codecs else {
        // No codec information, assume playable.
        return true;
    };
    codecs.split(',').all(codec_supported)
}

fn pick_variant(master: &MasterPlaylist) -> Result<&VariantStream, ClientError> {
    master
        .variants
        .iter()
        .filter(|v| variant_supported(v))
        .max_by_key(|v| v.bandwidth)
        .ok_or(ClientError::NoSupportedVariant)
}

fn pick_audio_alternative<'a>(
    master: &'a MasterPlaylist,
    group_id: &str,
) -> Result<&'a AlternativeMedia, ClientError> {
    let mut group = master
        .alternatives
        .iter()
        .filter(|a| a.media_type == AlternativeMediaType::Audio && a.group_id == group_id)
        .peekable();

    if group.peek().is_none() {
        return Err(ClientError::AudioGroupNotFound(group_id.to_owned()));
    }

    let mut group: Vec<&AlternativeMedia> = group.collect();
    let default = group.iter().position(|a| a.default).unwrap_or(0);
    Ok(group.swap_remove(default))
}

/// Resolves the primary playlist, fans out one stream downloader per
/// substream and brokers the track rendezvous.
pub(crate) struct PrimaryDownloader {
    pub http: ArcHttpClient,
    pub url: Url,
    pub logger: ArcMsgLogger,
    pub callbacks: Arc<Callbacks>,
    pub on_tracks: OnTracksFunc,
    pub pool: Arc<RoutinePool<ClientError>>,
}

impl PrimaryDownloader {
    pub async fn run(self, token: CancellationToken) -> Result<(), ClientError> {
        let bytes = fetch_bytes(&self.http, &self.url, None, &token).await?;
        let playlist = m3u8_rs::parse_playlist_res(&bytes)
            .map_err(|e| ClientError::DecodePlaylist(format!("{e:?}")))?;

        let (track_tx, mut track_rx) = mpsc::channel::<Vec<Track>>(2);
        let (start_tx, start_rx) = watch::channel(false);
        let time_sync = Arc::new(LeadingSyncSlot::new());

        let spawn = |url: Url, is_leading: bool, initial| {
            let downloader = StreamDownloader {
                http: self.http.clone(),
                logger: self.logger.clone(),
                url,
                is_leading,
                initial_playlist: initial,
                track_tx: track_tx.clone(),
                start_streaming: start_rx.clone(),
                time_sync: time_sync.clone(),
                callbacks: self.callbacks.clone(),
                pool: self.pool.clone(),
                cur_seq: None,
            };
            self.pool.add(|token| downloader.run(token));
        };

        let stream_count = match playlist {
            Playlist::MediaPlaylist(media) => {
                spawn(self.url.clone(), true, Some(media));
                1
            }
            Playlist::MasterPlaylist(master) => {
                let variant = pick_variant(&master)?;
                self.logger.log(
                    LogLevel::Debug,
                    &format!("selected variant with bandwidth {}", variant.bandwidth),
                );

                let variant_url = self.url.join(&variant.uri)?;
                spawn(variant_url, true, None);
                let mut count = 1;

                if let Some(group_id) = &variant.audio {
                    let alternative = pick_audio_alternative(&master, group_id)?;
                    // Alternatives without a URI are muxed into the
                    // variant stream itself.
                    if let Some(alt_uri) = &alternative.uri {
                        let alt_url = self.url.join(alt_uri)?;
                        spawn(alt_url, false, None);
                        count += 1;
                    }
                }
                count
            }
        };

        // Rendezvous: every substream announces its tracks before the
        // application is notified.
        let mut tracks = Vec::new();
        for _ in 0..stream_count {
            let stream_tracks = tokio::select! {
                v = track_rx.recv() => v.ok_or(ClientError::Terminated)?,
                () = token.cancelled() => return Err(ClientError::Terminated),
            };
            tracks.extend(stream_tracks);
        }

        if tracks.is_empty() {
            return Err(ClientError::NoTracks);
        }

        (self.on_tracks)(&tracks).map_err(ClientError::TracksRejected)?;

        // Unblock all substream processors.
        _ = start_tx.send(true);

        // Keep the sender alive for the session, otherwise late
        // waiters observe a closed channel.
        token.cancelled().await;
        drop(start_tx);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn test_variant(bandwidth: u64, codecs: Option<&str>) -> VariantStream {
        VariantStream {
            bandwidth,
            codecs: codecs.map(str::to_owned),
            ..VariantStream::default()
        }
    }

    #[test]
    fn test_pick_variant_highest_bandwidth() {
        let master = MasterPlaylist {
            variants: vec![
                test_variant(100, Some("avc1.640028,mp4a.40.2")),
                test_variant(300, Some("avc1.640032")),
                // Unknown codec filters the variant, not the session.
                test_variant(900, Some("av01.0.05M.08")),
            ],
            ..MasterPlaylist::default()
        };
        assert_eq!(300, pick_variant(&master).unwrap().bandwidth);
    }

    #[test]
    fn test_pick_variant_none_supported() {
        let master = MasterPlaylist {
            variants: vec![test_variant(100, Some("av01.0.05M.08"))],
            ..MasterPlaylist::default()
        };
        assert!(matches!(
            pick_variant(&master),
            Err(ClientError::NoSupportedVariant)
        ));
    }

    #[test]
    fn test_pick_audio_alternative_prefers_default() {
        let alt = |group: &str, name: &str, default| AlternativeMedia {
            media_type: AlternativeMediaType::Audio,
            group_id: group.to_owned(),
            name: name.to_owned(),
            default,
            ..AlternativeMedia::default()
        };

        let master = MasterPlaylist {
            alternatives: vec![
                alt("aac", "english", false),
                alt("aac", "german", true),
                alt("opus", "english", true),
            ],
            ..MasterPlaylist::default()
        };

        assert_eq!("german", pick_audio_alternative(&master, "aac").unwrap().name);
        assert!(matches!(
            pick_audio_alternative(&master, "mp3"),
            Err(ClientError::AudioGroupNotFound(_))
        ));
    }
}
