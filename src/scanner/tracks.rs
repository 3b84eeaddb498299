// =============================================================================
// Scan tracks — the (market, timeframe) schedule table
// =============================================================================
//
// Each track is an independent schedule:
//
//   spot-5m      every 5 min           all active USDT spot       200 candles
//   spot-1h      hourly at :05         all active USDT spot       200
//   futures-5m   every 5 min (opt-in)  all USDT perpetuals        300
//   futures-15m  every 15 min          all USDT perpetuals        200
//   futures-1h   hourly at :15         all USDT perpetuals        200
//   futures-4h   every 4 h at :15      all USDT perpetuals        150
//   futures-1d   daily at 00:15 UTC    all USDT perpetuals        100
//
// Ticks align to UTC wall-clock boundaries plus the track's offset.
// =============================================================================

use chrono::{DateTime, Timelike, Utc};

use crate::types::{MarketKind, Timeframe};

/// One periodic scan schedule.
#[derive(Debug, Clone)]
pub struct ScanTrack {
    pub name: &'static str,
    pub market: MarketKind,
    pub timeframe: Timeframe,
    /// Candles fetched per symbol per tick.
    pub kline_limit: u32,
    /// Tick cadence in seconds. Doubles as the tick deadline.
    pub cadence_secs: u64,
    /// Offset in minutes past the cadence boundary (":05", ":15").
    pub offset_minutes: u64,
}

impl ScanTrack {
    /// Wall-clock delay from `now` until this track's next aligned tick.
    pub fn next_tick_delay(&self, now: DateTime<Utc>) -> std::time::Duration {
        let cadence = self.cadence_secs as i64;
        let offset = (self.offset_minutes * 60) as i64;

        let since_midnight = (now.hour() as i64) * 3600
            + (now.minute() as i64) * 60
            + now.second() as i64;

        // Next slot boundary at (k * cadence + offset) past midnight UTC.
        let k = (since_midnight - offset).div_euclid(cadence) + 1;
        let mut next = k * cadence + offset;
        if next <= since_midnight {
            next += cadence;
        }

        std::time::Duration::from_secs((next - since_midnight) as u64)
    }

    pub fn cadence(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cadence_secs)
    }
}

/// The built-in track table. `enable_futures_5m` gates the heaviest track.
pub fn default_tracks(enable_futures_5m: bool) -> Vec<ScanTrack> {
    let mut tracks = vec![
        ScanTrack {
            name: "spot-5m",
            market: MarketKind::Spot,
            timeframe: Timeframe::M5,
            kline_limit: 200,
            cadence_secs: 5 * 60,
            offset_minutes: 0,
        },
        ScanTrack {
            name: "spot-1h",
            market: MarketKind::Spot,
            timeframe: Timeframe::H1,
            kline_limit: 200,
            cadence_secs: 3600,
            offset_minutes: 5,
        },
        ScanTrack {
            name: "futures-15m",
            market: MarketKind::Futures,
            timeframe: Timeframe::M15,
            kline_limit: 200,
            cadence_secs: 15 * 60,
            offset_minutes: 0,
        },
        ScanTrack {
            name: "futures-1h",
            market: MarketKind::Futures,
            timeframe: Timeframe::H1,
            kline_limit: 200,
            cadence_secs: 3600,
            offset_minutes: 15,
        },
        ScanTrack {
            name: "futures-4h",
            market: MarketKind::Futures,
            timeframe: Timeframe::H4,
            kline_limit: 150,
            cadence_secs: 4 * 3600,
            offset_minutes: 15,
        },
        ScanTrack {
            name: "futures-1d",
            market: MarketKind::Futures,
            timeframe: Timeframe::D1,
            kline_limit: 100,
            cadence_secs: 24 * 3600,
            offset_minutes: 15,
        },
    ];

    if enable_futures_5m {
        tracks.push(ScanTrack {
            name: "futures-5m",
            market: MarketKind::Futures,
            timeframe: Timeframe::M5,
            kline_limit: 300,
            cadence_secs: 5 * 60,
            offset_minutes: 0,
        });
    }

    tracks
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, h, m, s).unwrap()
    }

    fn track(cadence_secs: u64, offset_minutes: u64) -> ScanTrack {
        ScanTrack {
            name: "test",
            market: MarketKind::Spot,
            timeframe: Timeframe::M5,
            kline_limit: 200,
            cadence_secs,
            offset_minutes,
        }
    }

    #[test]
    fn five_minute_track_aligns_to_boundaries() {
        let t = track(300, 0);
        // 12:03:00 -> next tick 12:05:00.
        assert_eq!(t.next_tick_delay(at(12, 3, 0)).as_secs(), 120);
        // Exactly on a boundary schedules the following one.
        assert_eq!(t.next_tick_delay(at(12, 5, 0)).as_secs(), 300);
    }

    #[test]
    fn hourly_track_with_offset() {
        let t = track(3600, 5);
        // 12:00:00 -> 12:05:00.
        assert_eq!(t.next_tick_delay(at(12, 0, 0)).as_secs(), 300);
        // 12:06:00 -> 13:05:00.
        assert_eq!(t.next_tick_delay(at(12, 6, 0)).as_secs(), 59 * 60);
    }

    #[test]
    fn four_hour_track_at_fifteen() {
        let t = track(4 * 3600, 15);
        // 13:00 -> next 4h slot at 16:15.
        assert_eq!(t.next_tick_delay(at(13, 0, 0)).as_secs(), 3 * 3600 + 15 * 60);
    }

    #[test]
    fn daily_track_wraps_past_midnight() {
        let t = track(24 * 3600, 15);
        // 23:50 -> 00:15 next day.
        assert_eq!(t.next_tick_delay(at(23, 50, 0)).as_secs(), 25 * 60);
        // 00:10 -> 00:15 same day.
        assert_eq!(t.next_tick_delay(at(0, 10, 0)).as_secs(), 5 * 60);
    }

    #[test]
    fn default_table_shape() {
        let tracks = default_tracks(false);
        assert_eq!(tracks.len(), 6);
        assert!(tracks.iter().all(|t| t.name != "futures-5m"));

        let tracks = default_tracks(true);
        assert_eq!(tracks.len(), 7);
        let f5 = tracks.iter().find(|t| t.name == "futures-5m").unwrap();
        assert_eq!(f5.kline_limit, 300);
        assert_eq!(f5.market, MarketKind::Futures);

        let d1 = tracks.iter().find(|t| t.name == "futures-1d").unwrap();
        assert_eq!(d1.kline_limit, 100);
        assert_eq!(d1.offset_minutes, 15);
    }
}
