//! In-memory lap register.
//!
//! Keeps one record per competitor and turns consecutive crossings into
//! lap durations:
//! - The first crossing only stores the timestamp
//! - Every later crossing closes a lap and updates best and average
//! - Snapshots only include competitors with at least one completed lap
//!
//! All access goes through a single mutex around the whole map.

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, trace, warn};

/// Competitor identifier as carried on the wire
pub type CompetitorId = i32;

/// How to treat a crossing earlier than the competitor's previous one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OrderingPolicy {
    /// Count it as a (negative) lap; the competitor stays on the
    /// scoreboard with that best lap
    #[default]
    Accept,
    /// Drop it and leave the record untouched
    Reject,
}

/// Per-competitor aggregate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompetitorRecord {
    /// Timestamp of the most recent crossing (epoch milliseconds)
    pub last_crossing_millis: i64,
    /// Shortest completed lap, `None` until the second crossing
    pub best_lap_millis: Option<i64>,
    /// Sum of all completed laps
    pub total_lap_millis: i64,
    /// Number of completed laps
    pub completed_laps: i64,
    /// `total_lap_millis / completed_laps` once a lap is completed
    pub average_lap_millis: i64,
}

impl CompetitorRecord {
    fn new(timestamp_millis: i64) -> Self {
        Self {
            last_crossing_millis: timestamp_millis,
            best_lap_millis: None,
            total_lap_millis: 0,
            completed_laps: 0,
            average_lap_millis: 0,
        }
    }

    /// Close a lap ending at `timestamp_millis` and return its duration.
    /// Returns `None` and leaves the record untouched if the lap or the
    /// running total does not fit in an `i64`.
    fn complete_lap(&mut self, timestamp_millis: i64) -> Option<i64> {
        let duration = timestamp_millis.checked_sub(self.last_crossing_millis)?;
        let total = self.total_lap_millis.checked_add(duration)?;

        self.total_lap_millis = total;
        self.completed_laps += 1;
        self.average_lap_millis = self.total_lap_millis / self.completed_laps;
        self.best_lap_millis = Some(match self.best_lap_millis {
            Some(best) if best <= duration => best,
            _ => duration,
        });
        self.last_crossing_millis = timestamp_millis;

        Some(duration)
    }

    /// A record is active once it has completed a lap
    pub fn is_active(&self) -> bool {
        self.best_lap_millis.is_some()
    }
}

/// One scoreboard row, built fresh for every snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoreEntry {
    pub competitor_id: CompetitorId,
    pub best_lap_millis: i64,
    pub average_lap_millis: i64,
}

/// What a registration did to the race state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingOutcome {
    /// First crossing for this competitor, no lap yet
    FirstCrossing,
    /// A lap was completed
    Lap { duration_millis: i64 },
    /// Out-of-order crossing dropped under [`OrderingPolicy::Reject`]
    Rejected { previous_millis: i64 },
    /// Lap duration or running total would overflow; crossing dropped
    Overflow { previous_millis: i64 },
}

/// Register statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaceStats {
    pub competitors: usize,
    pub active_competitors: usize,
    pub crossings: u64,
}

#[derive(Debug, Default)]
struct RaceState {
    records: HashMap<CompetitorId, CompetitorRecord>,
    crossings: u64,
}

/// Thread-safe lap register shared by all sessions
#[derive(Debug)]
pub struct LapRegister {
    state: Mutex<RaceState>,
    policy: OrderingPolicy,
}

impl LapRegister {
    /// Create an empty register
    pub fn new(policy: OrderingPolicy) -> Arc<Self> {
        info!(?policy, "Initializing lap register");
        Arc::new(Self {
            state: Mutex::new(RaceState::default()),
            policy,
        })
    }

    /// Lock the race state, ignoring poisoning
    fn lock(&self) -> MutexGuard<'_, RaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that `competitor_id` crossed the line at `timestamp_millis`
    pub fn register_crossing(
        &self,
        competitor_id: CompetitorId,
        timestamp_millis: i64,
    ) -> CrossingOutcome {
        let mut state = self.lock();

        let outcome = match state.records.get_mut(&competitor_id) {
            None => {
                state
                    .records
                    .insert(competitor_id, CompetitorRecord::new(timestamp_millis));
                CrossingOutcome::FirstCrossing
            }
            Some(record) => {
                let previous_millis = record.last_crossing_millis;
                if timestamp_millis < previous_millis {
                    match self.policy {
                        OrderingPolicy::Accept => {
                            warn!(
                                competitor_id,
                                timestamp_millis, previous_millis, "Accepting out-of-order crossing"
                            );
                        }
                        OrderingPolicy::Reject => {
                            warn!(
                                competitor_id,
                                timestamp_millis, previous_millis, "Rejecting out-of-order crossing"
                            );
                            return CrossingOutcome::Rejected { previous_millis };
                        }
                    }
                }

                match record.complete_lap(timestamp_millis) {
                    Some(duration_millis) => CrossingOutcome::Lap { duration_millis },
                    None => {
                        warn!(
                            competitor_id,
                            timestamp_millis, previous_millis, "Rejecting crossing: lap time overflows"
                        );
                        return CrossingOutcome::Overflow { previous_millis };
                    }
                }
            }
        };

        state.crossings += 1;
        trace!(competitor_id, timestamp_millis, ?outcome, "Registered crossing");
        outcome
    }

    /// Every competitor with at least one completed lap, unordered
    pub fn snapshot_scoreboard(&self) -> Vec<ScoreEntry> {
        let state = self.lock();
        state
            .records
            .iter()
            .filter_map(|(&competitor_id, record)| {
                record.best_lap_millis.map(|best_lap_millis| ScoreEntry {
                    competitor_id,
                    best_lap_millis,
                    average_lap_millis: record.average_lap_millis,
                })
            })
            .collect()
    }

    /// Copy of a single competitor's record
    #[cfg(test)]
    pub fn record(&self, competitor_id: CompetitorId) -> Option<CompetitorRecord> {
        self.lock().records.get(&competitor_id).cloned()
    }

    /// Get statistics about the register
    pub fn stats(&self) -> RaceStats {
        let state = self.lock();
        RaceStats {
            competitors: state.records.len(),
            active_competitors: state.records.values().filter(|r| r.is_active()).count(),
            crossings: state.crossings,
        }
    }
}
