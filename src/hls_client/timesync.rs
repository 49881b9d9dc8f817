// SPDX-License-Identifier: GPL-2.0-or-later

use crate::error::ClientError;
use common::time::Duration;
use mpegts::TIMESTAMP_MASK;
use std::sync::Arc;
use tokio::{sync::Mutex, time::Instant};
use tokio_util::sync::CancellationToken;

// Sessions with more than this much buffered media are rejected
// instead of slowly draining it in real time.
const MAX_DTS_RTC_DRIFT: Duration = Duration::from_secs(10);

/// Extends 33-bit 90khz rotating timestamps into a monotone signed
/// duration anchored at zero for the first value seen.
pub struct TimeDecoder {
    prev: u64,
    // Cumulative 90khz ticks.
    cumulative: i64,
}

impl TimeDecoder {
    #[must_use]
    pub fn new(initial: u64) -> Self {
        Self {
            prev: initial & TIMESTAMP_MASK,
            cumulative: 0,
        }
    }

    pub fn decode(&mut self, ts: u64) -> Duration {
        let ts = ts & TIMESTAMP_MASK;
        let diff = ts.wrapping_sub(self.prev) & TIMESTAMP_MASK;

        if diff > (1 << 32) - 1 {
            // Negative difference.
            let diff = self.prev.wrapping_sub(ts) & TIMESTAMP_MASK;
            self.cumulative -= i64::try_from(diff).expect("33 bits");
        } else {
            self.cumulative += i64::try_from(diff).expect("33 bits");
        }
        self.prev = ts;

        // Split seconds and residual to avoid overflow.
        Duration::from_timescale(self.cumulative, 90_000)
    }
}

async fn sync_to_wall_clock(
    token: &CancellationToken,
    start_rtc: Instant,
    dts: Duration,
) -> Result<(), ClientError> {
    let elapsed = i64::try_from(start_rtc.elapsed().as_nanos()).unwrap_or(i64::MAX);
    let ahead = dts.checked_sub(Duration::from_nanos(elapsed)).ok_or(ClientError::DtsRtcDriftTooBig)?;

    if ahead > MAX_DTS_RTC_DRIFT {
        return Err(ClientError::DtsRtcDriftTooBig);
    }

    if let Some(sleep) = ahead.as_std() {
        if !sleep.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(sleep) => {}
                () = token.cancelled() => return Err(ClientError::Terminated),
            }
        }
    }
    Ok(())
}

/// Translates MPEG-TS timestamps into wall-clock deltas and paces
/// delivery. The decoder is shared across stream processors, hence
/// the lock.
pub struct MpegtsTimeSync {
    start_rtc: Instant,
    decoder: Mutex<TimeDecoder>,
}

impl MpegtsTimeSync {
    #[must_use]
    pub fn new(start_rtc: Instant, first_dts: u64) -> Self {
        Self {
            start_rtc,
            decoder: Mutex::new(TimeDecoder::new(first_dts)),
        }
    }

    /// Converts raw timestamps and waits until the decode timestamp is
    /// due, returning the presentation timestamp.
    pub async fn convert_and_sync(
        &self,
        token: &CancellationToken,
        raw_dts: u64,
        raw_pts: u64,
    ) -> Result<Duration, ClientError> {
        let (dts, pts) = {
            let mut decoder = self.decoder.lock().await;
            let dts = decoder.decode(raw_dts);
            let pts = decoder.decode(raw_pts);
            (dts, pts)
        };

        sync_to_wall_clock(token, self.start_rtc, dts).await?;
        Ok(pts)
    }
}

/// fmp4 variant, parameterized per call since every track carries its
/// own timescale.
pub struct Fmp4TimeSync {
    start_rtc: Instant,
}

impl Fmp4TimeSync {
    #[must_use]
    pub fn new(start_rtc: Instant) -> Self {
        Self { start_rtc }
    }

    pub async fn convert_and_sync(
        &self,
        token: &CancellationToken,
        timescale: u32,
        raw_dts: u64,
        pts_offset: i32,
    ) -> Result<Duration, ClientError> {
        let timescale = i64::from(timescale);
        let raw_dts = i64::try_from(raw_dts).unwrap_or(i64::MAX);

        let dts = Duration::from_timescale(raw_dts, timescale);
        let pts = Duration::from_timescale(raw_dts + i64::from(pts_offset), timescale);

        sync_to_wall_clock(token, self.start_rtc, dts).await?;
        Ok(pts)
    }
}

/// Published once by the leading stream, inherited by followers.
#[derive(Clone)]
pub enum LeadingTimeSync {
    Mpegts(Arc<MpegtsTimeSync>),
    Fmp4(Arc<Fmp4TimeSync>),
}

/// Single-shot hand-off of the leading time sync. Followers block
/// until the leading stream publishes.
pub struct LeadingSyncSlot {
    slot: std::sync::Mutex<Option<LeadingTimeSync>>,
    notify: tokio::sync::Notify,
}

impl LeadingSyncSlot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: std::sync::Mutex::new(None),
            notify: tokio::sync::Notify::new(),
        }
    }

    pub fn set(&self, sync: LeadingTimeSync) {
        *self.slot.lock().expect("mutex poisoned") = Some(sync);
        self.notify.notify_waiters();
    }

    pub async fn get(&self, token: &CancellationToken) -> Result<LeadingTimeSync, ClientError> {
        loop {
            let notified = self.notify.notified();
            if let Some(sync) = self.slot.lock().expect("mutex poisoned").clone() {
                return Ok(sync);
            }
            tokio::select! {
                () = notified => {}
                () = token.cancelled() => return Err(ClientError::Terminated),
            }
        }
    }
}

impl Default for LeadingSyncSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_time_decoder_anchors_at_zero() {
        let mut decoder = TimeDecoder::new(90_000);
        assert_eq!(Duration::from_secs(0), decoder.decode(90_000));
        assert_eq!(Duration::from_secs(1), decoder.decode(180_000));
        // Negative jumps decode as well.
        assert_eq!(Duration::from_secs(0), decoder.decode(90_000));
    }

    #[test]
    fn test_time_decoder_overflow_walk() {
        let start: u64 = (1 << 33) - 20;
        let step: u64 = 150 * 90_000;

        let mut decoder = TimeDecoder::new(start);
        let mut ts = start;
        for i in 0..100 {
            let got = decoder.decode(ts & TIMESTAMP_MASK);
            let want_ticks = i * i64::try_from(step).unwrap();
            assert_eq!(Duration::from_timescale(want_ticks, 90_000), got);
            ts = ts.wrapping_add(step);
        }
    }

    #[tokio::test]
    async fn test_pacing_waits_for_wall_clock() {
        let token = CancellationToken::new();
        let start = Instant::now();
        let sync = MpegtsTimeSync::new(start, 0);

        // 50ms ahead of the wall clock.
        let pts = sync.convert_and_sync(&token, 4500, 4500).await.unwrap();
        assert_eq!(Duration::from_millis(50), pts);
        assert!(start.elapsed() >= std::time::Duration::from_millis(49));
    }

    #[tokio::test]
    async fn test_drift_too_big() {
        let token = CancellationToken::new();
        let sync = MpegtsTimeSync::new(Instant::now(), 0);

        // Eleven seconds ahead of the wall clock.
        let got = sync.convert_and_sync(&token, 11 * 90_000, 11 * 90_000).await;
        assert!(matches!(got, Err(ClientError::DtsRtcDriftTooBig)));
    }

    #[tokio::test]
    async fn test_fmp4_pts_offset() {
        let token = CancellationToken::new();
        let sync = Fmp4TimeSync::new(Instant::now());

        let pts = sync.convert_and_sync(&token, 48_000, 0, 4800).await.unwrap();
        assert_eq!(Duration::from_millis(100), pts);
    }
}
