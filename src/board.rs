//! Scoreboard presentation.
//!
//! The server only ships raw millisecond fields; ranking and display
//! strings are derived here on the client side.

use crate::race::{CompetitorId, ScoreEntry};
use std::fmt::Write;

/// One ranked scoreboard row ready for display
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Standing {
    pub position: usize,
    pub competitor_id: CompetitorId,
    pub best_lap: String,
    pub average_lap: String,
    /// Empty for the leader
    pub gap: String,
}

/// Sort entries ascending by best lap, ties broken by competitor id
pub fn rank(mut entries: Vec<ScoreEntry>) -> Vec<ScoreEntry> {
    entries.sort_by_key(|e| (e.best_lap_millis, e.competitor_id));
    entries
}

/// Format a lap duration as `mm:ss.zzz`
pub fn format_lap(millis: i64) -> String {
    let sign = if millis < 0 { "-" } else { "" };
    let millis = millis.unsigned_abs();
    format!(
        "{}{:02}:{:02}.{:03}",
        sign,
        millis / 60_000,
        millis / 1000 % 60,
        millis % 1000
    )
}

/// Seconds between the leader's best lap and this one, e.g. `+2.0 s`
pub fn gap_to_leader(leader_best_millis: i64, best_millis: i64) -> String {
    let delta = (best_millis - leader_best_millis) as f64 / 1000.0;
    format!("+{:.1} s", delta)
}

/// Rank entries and derive display strings
pub fn standings(entries: Vec<ScoreEntry>) -> Vec<Standing> {
    let ranked = rank(entries);
    let Some(leader_best) = ranked.first().map(|e| e.best_lap_millis) else {
        return Vec::new();
    };

    ranked
        .iter()
        .enumerate()
        .map(|(index, entry)| Standing {
            position: index + 1,
            competitor_id: entry.competitor_id,
            best_lap: format_lap(entry.best_lap_millis),
            average_lap: format_lap(entry.average_lap_millis),
            gap: if index == 0 {
                String::new()
            } else {
                gap_to_leader(leader_best, entry.best_lap_millis)
            },
        })
        .collect()
}

/// Render standings as a plain-text table
pub fn render(standings: &[Standing]) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:>3}  {:>6}  {:>10}  {:>10}  {:>8}",
        "pos", "kart", "best", "average", "gap"
    );
    for s in standings {
        let _ = writeln!(
            out,
            "{:>3}  {:>6}  {:>10}  {:>10}  {:>8}",
            s.position, s.competitor_id, s.best_lap, s.average_lap, s.gap
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(competitor_id: CompetitorId, best: i64, average: i64) -> ScoreEntry {
        ScoreEntry {
            competitor_id,
            best_lap_millis: best,
            average_lap_millis: average,
        }
    }

    #[test]
    fn test_format_lap() {
        assert_eq!(format_lap(58_000), "00:58.000");
        assert_eq!(format_lap(66_666), "01:06.666");
        assert_eq!(format_lap(0), "00:00.000");
        assert_eq!(format_lap(-1_500), "-00:01.500");
    }

    #[test]
    fn test_rank_by_best_lap() {
        let ranked = rank(vec![
            entry(3, 61_000, 62_000),
            entry(1, 58_000, 70_000),
            entry(2, 61_000, 61_500),
        ]);
        let ids: Vec<_> = ranked.iter().map(|e| e.competitor_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_gap_to_leader() {
        let rows = standings(vec![entry(5, 60_000, 60_000), entry(7, 58_000, 66_666)]);

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].competitor_id, 7);
        assert_eq!(rows[0].gap, "");
        assert_eq!(rows[1].competitor_id, 5);
        assert_eq!(rows[1].gap, "+2.0 s");
        assert_eq!(rows[1].position, 2);
    }

    #[test]
    fn test_gap_rounding() {
        assert_eq!(gap_to_leader(58_000, 58_349), "+0.3 s");
        assert_eq!(gap_to_leader(58_000, 58_000), "+0.0 s");
    }

    #[test]
    fn test_empty_standings() {
        assert!(standings(Vec::new()).is_empty());
        assert_eq!(render(&[]).lines().count(), 1);
    }

    #[test]
    fn test_render() {
        let table = render(&standings(vec![entry(7, 58_000, 66_666)]));
        let row = table.lines().nth(1).unwrap();
        assert!(row.contains("00:58.000"));
        assert!(row.contains("01:06.666"));
    }
}
