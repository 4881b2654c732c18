use std::{collections::HashSet, time::Duration};

use chrono::{DateTime, Utc};

use crate::types::AiSignal;

pub const DEFAULT_SIGNAL_WINDOW: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_SIGNAL_CAP: usize = 8;

/// Keeps at most one fresh signal per symbol, newest first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SignalDeduplicator {
    pub window: Duration,
    pub cap: usize,
}

impl Default for SignalDeduplicator {
    fn default() -> Self {
        Self {
            window: DEFAULT_SIGNAL_WINDOW,
            cap: DEFAULT_SIGNAL_CAP,
        }
    }
}

impl SignalDeduplicator {
    pub fn new(window: Duration, cap: usize) -> Self {
        Self { window, cap }
    }

    pub fn reduce(&self, existing: &[AiSignal], incoming: &[AiSignal]) -> Vec<AiSignal> {
        self.reduce_at(existing, incoming, Utc::now())
    }

    /// Merges both sets, sorts newest first, keeps the first signal seen per
    /// symbol, drops anything at least `window` old and truncates to `cap`.
    pub fn reduce_at(
        &self,
        existing: &[AiSignal],
        incoming: &[AiSignal],
        now: DateTime<Utc>,
    ) -> Vec<AiSignal> {
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::MAX);

        let mut merged: Vec<&AiSignal> = incoming.iter().chain(existing.iter()).collect();
        // stable: on equal timestamps the incoming copy wins
        merged.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut seen = HashSet::new();
        merged
            .into_iter()
            .filter(|signal| now.signed_duration_since(signal.timestamp) < window)
            .filter(|signal| seen.insert(signal.symbol.clone()))
            .take(self.cap)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SignalDirection, Symbol};
    use chrono::TimeZone;

    fn signal(id: &str, symbol: &str, at: DateTime<Utc>) -> AiSignal {
        AiSignal {
            id: id.to_string(),
            symbol: Symbol::from(symbol),
            signal: SignalDirection::Buy,
            confidence: 0.7,
            reasoning: String::new(),
            timestamp: at,
            market_analysis: None,
            risk_assessment: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_keeps_newest_per_symbol() {
        let dedup = SignalDeduplicator::default();
        let now = now();
        let incoming = vec![
            signal("a", "BTCUSDT", now - chrono::Duration::minutes(10)),
            signal("b", "BTCUSDT", now - chrono::Duration::minutes(2)),
            signal("c", "BTCUSDT", now - chrono::Duration::minutes(5)),
        ];

        let reduced = dedup.reduce_at(&[], &incoming, now);
        assert_eq!(reduced.len(), 1);
        assert_eq!(reduced[0].id, "b");
    }

    #[test]
    fn test_drops_signals_past_window() {
        let dedup = SignalDeduplicator::default();
        let now = now();
        let incoming = vec![
            signal("old", "ETHUSDT", now - chrono::Duration::minutes(30)),
            signal("fresh", "SOLUSDT", now - chrono::Duration::minutes(29)),
        ];

        let reduced = dedup.reduce_at(&[], &incoming, now);
        assert_eq!(reduced.len(), 1);
        assert_eq!(reduced[0].id, "fresh");
    }

    #[test]
    fn test_stale_newest_does_not_resurrect_older() {
        let dedup = SignalDeduplicator::default();
        let now = now();
        let incoming = vec![signal("x", "ETHUSDT", now - chrono::Duration::minutes(45))];

        assert!(dedup.reduce_at(&[], &incoming, now).is_empty());
    }

    #[test]
    fn test_caps_at_eight_most_recent() {
        let dedup = SignalDeduplicator::default();
        let now = now();
        let incoming: Vec<AiSignal> = (0..12)
            .map(|i| {
                signal(
                    &format!("s{i}"),
                    &format!("SYM{i}"),
                    now - chrono::Duration::minutes(i),
                )
            })
            .collect();

        let reduced = dedup.reduce_at(&[], &incoming, now);
        assert_eq!(reduced.len(), 8);
        let ids: Vec<&str> = reduced.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7"]);
    }

    #[test]
    fn test_incoming_replaces_existing_for_same_symbol() {
        let dedup = SignalDeduplicator::default();
        let now = now();
        let existing = vec![
            signal("old-btc", "BTCUSDT", now - chrono::Duration::minutes(8)),
            signal("eth", "ETHUSDT", now - chrono::Duration::minutes(6)),
        ];
        let incoming = vec![signal("new-btc", "BTCUSDT", now - chrono::Duration::minutes(1))];

        let reduced = dedup.reduce_at(&existing, &incoming, now);
        let ids: Vec<&str> = reduced.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["new-btc", "eth"]);
    }
}
