//! Round-indexed value histories.
//!
//! Every piece of versioned particle state is a [`ValueHistory`]: an
//! append-only step function over rounds with a navigation marker. Values
//! persist until overwritten, so only changes are stored.
//!
//! # Marker states
//!
//! - **Tracking**: the marker follows the last recorded round.
//! - **Paused**: the marker sits at an explicit round, entered through
//!   [`ValueHistory::set_marker`], [`ValueHistory::step_back`] or
//!   [`ValueHistory::step_forward`] and left only through
//!   [`ValueHistory::continue_tracking`].
//!
//! Recording while paused is not prevented here; the engine refuses to run
//! rounds while it is replaying.

use serde::{Deserialize, Serialize};

use crate::sim::Round;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Contract violations of history operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("round {round} precedes the last recorded round {last}")]
    RoundBeforeLast { round: Round, last: Round },
    #[error("round {round} precedes the first recorded round {first}")]
    RoundBeforeFirst { round: Round, first: Round },
    #[error("round {round} follows the last recorded round {last}")]
    RoundAfterLast { round: Round, last: Round },
    #[error("cannot step back from the first recorded round {first}")]
    StepBeforeFirst { first: Round },
    #[error("shifting by {delta} would move round {round} below zero")]
    TimescaleUnderflow { round: Round, delta: i64 },
}

// ---------------------------------------------------------------------------
// ValueHistory
// ---------------------------------------------------------------------------

/// Explicit marker position while paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Marker {
    round: Round,
    index: usize,
}

/// An append-only, round-indexed step function.
///
/// Invariants:
/// - `entries` is never empty and its rounds strictly increase.
/// - No two consecutive entries hold equal values.
/// - `last_round >= entries.last().0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueHistory<T> {
    entries: Vec<(Round, T)>,
    last_round: Round,
    /// `None` while tracking.
    #[serde(skip)]
    marker: Option<Marker>,
}

impl<T: Clone + PartialEq> ValueHistory<T> {
    /// Create a history holding `value` from `round` on.
    pub fn new(value: T, round: Round) -> Self {
        Self {
            entries: vec![(round, value)],
            last_round: round,
            marker: None,
        }
    }

    /// The first round with a recorded value.
    pub fn first_round(&self) -> Round {
        self.entries[0].0
    }

    /// The last round passed to [`record_at`](Self::record_at).
    pub fn last_round(&self) -> Round {
        self.last_round
    }

    /// The most recently recorded value.
    pub fn latest(&self) -> &T {
        &self.entries[self.entries.len() - 1].1
    }

    /// Number of stored (compacted) entries.
    pub fn stored_len(&self) -> usize {
        self.entries.len()
    }

    /// Stored entries in round order.
    pub fn entries(&self) -> impl Iterator<Item = (Round, &T)> {
        self.entries.iter().map(|(r, v)| (*r, v))
    }

    /// Whether a deserialized history satisfies the structural invariants.
    pub fn is_well_formed(&self) -> bool {
        !self.entries.is_empty()
            && self.entries.windows(2).all(|w| w[0].0 < w[1].0 && w[0].1 != w[1].1)
            && self.last_round >= self.entries[self.entries.len() - 1].0
    }

    // -----------------------------------------------------------------------
    // Recording and lookup
    // -----------------------------------------------------------------------

    /// Record `value` as the value held from `round` on.
    ///
    /// `round` must not precede the last recorded round. Recording at the
    /// last round overwrites that round's value; recording at a later round
    /// only stores an entry if the value changed.
    pub fn record_at(&mut self, value: T, round: Round) -> Result<(), HistoryError> {
        if round < self.last_round {
            return Err(HistoryError::RoundBeforeLast {
                round,
                last: self.last_round,
            });
        }
        let last = self.entries.len() - 1;
        if self.entries[last].0 == round {
            self.entries[last].1 = value;
            if last > 0 && self.entries[last - 1].1 == self.entries[last].1 {
                self.entries.pop();
            }
        } else if self.entries[last].1 != value {
            self.entries.push((round, value));
        }
        self.last_round = round;
        self.refresh_marker();
        Ok(())
    }

    /// The value held in `round`.
    pub fn value_at(&self, round: Round) -> Result<&T, HistoryError> {
        self.check_not_before_first(round)?;
        Ok(&self.entries[self.index_at(round)].1)
    }

    /// Index of the latest entry at or before `round`. Requires
    /// `round >= first_round()`.
    fn index_at(&self, round: Round) -> usize {
        // Entries before the partition point are <= round, entries after it
        // are > round.
        self.entries.partition_point(|(r, _)| *r <= round) - 1
    }

    fn check_not_before_first(&self, round: Round) -> Result<(), HistoryError> {
        let first = self.first_round();
        if round < first {
            return Err(HistoryError::RoundBeforeFirst { round, first });
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Marker
    // -----------------------------------------------------------------------

    /// Pause and move the marker to `round`.
    pub fn set_marker(&mut self, round: Round) -> Result<(), HistoryError> {
        self.check_not_before_first(round)?;
        self.marker = Some(Marker {
            round,
            index: self.index_at(round),
        });
        Ok(())
    }

    /// Pause and move the marker one round back.
    pub fn step_back(&mut self) -> Result<(), HistoryError> {
        let marked = self.marked_round();
        if marked <= self.first_round() {
            return Err(HistoryError::StepBeforeFirst {
                first: self.first_round(),
            });
        }
        self.set_marker(marked - 1)
    }

    /// Pause and move the marker one round forward.
    pub fn step_forward(&mut self) -> Result<(), HistoryError> {
        self.set_marker(self.marked_round() + 1)
    }

    /// Resume following the last recorded round.
    pub fn continue_tracking(&mut self) {
        self.marker = None;
    }

    pub fn is_tracking(&self) -> bool {
        self.marker.is_none()
    }

    /// The round the marker points at.
    pub fn marked_round(&self) -> Round {
        match self.marker {
            Some(m) => m.round,
            None => self.last_round,
        }
    }

    /// The value held in the marked round.
    pub fn marked_value(&self) -> &T {
        match self.marker {
            Some(m) => &self.entries[m.index].1,
            None => self.latest(),
        }
    }

    fn refresh_marker(&mut self) {
        if let Some(m) = self.marker {
            let round = m.round.max(self.first_round());
            self.marker = Some(Marker {
                round,
                index: self.index_at(round),
            });
        }
    }

    // -----------------------------------------------------------------------
    // Truncation and shifting
    // -----------------------------------------------------------------------

    /// Discard everything recorded after the marked round.
    pub fn truncate_after_marker(&mut self) {
        let round = self.marked_round();
        self.truncate_unchecked(round);
    }

    /// Discard everything recorded after `round`.
    pub fn truncate_after_round(&mut self, round: Round) -> Result<(), HistoryError> {
        self.check_not_before_first(round)?;
        self.truncate_unchecked(round);
        Ok(())
    }

    fn truncate_unchecked(&mut self, round: Round) {
        let keep = self.index_at(round) + 1;
        self.entries.truncate(keep);
        if round < self.last_round {
            self.last_round = round;
        }
        self.refresh_marker();
    }

    /// Add `delta` to every recorded round, the watermark and the marker.
    pub fn shift_timescale(&mut self, delta: i64) -> Result<(), HistoryError> {
        let first = self.first_round();
        if (first as i128) + (delta as i128) < 0 {
            return Err(HistoryError::TimescaleUnderflow {
                round: first,
                delta,
            });
        }
        let shift = |r: Round| (r as i128 + delta as i128) as Round;
        for entry in &mut self.entries {
            entry.0 = shift(entry.0);
        }
        self.last_round = shift(self.last_round);
        if let Some(m) = self.marker.as_mut() {
            m.round = shift(m.round);
        }
        Ok(())
    }

    /// Forget everything before `round`. The value held in `round` becomes
    /// the first entry, recorded at `round`.
    pub fn trim_before(&mut self, round: Round) -> Result<(), HistoryError> {
        if round <= self.first_round() {
            return Ok(());
        }
        if round > self.last_round {
            return Err(HistoryError::RoundAfterLast {
                round,
                last: self.last_round,
            });
        }
        let idx = self.index_at(round);
        self.entries.drain(..idx);
        self.entries[0].0 = round;
        self.refresh_marker();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Timeline
// ---------------------------------------------------------------------------

/// Type-erased navigation over a [`ValueHistory`], so histories of different
/// value types can be seeked and cut together.
pub trait Timeline {
    fn set_marker(&mut self, round: Round) -> Result<(), HistoryError>;
    fn continue_tracking(&mut self);
    fn truncate_after_marker(&mut self);
    fn truncate_after_round(&mut self, round: Round) -> Result<(), HistoryError>;
    fn shift_timescale(&mut self, delta: i64) -> Result<(), HistoryError>;
    fn trim_before(&mut self, round: Round) -> Result<(), HistoryError>;
}

impl<T: Clone + PartialEq> Timeline for ValueHistory<T> {
    fn set_marker(&mut self, round: Round) -> Result<(), HistoryError> {
        ValueHistory::set_marker(self, round)
    }

    fn continue_tracking(&mut self) {
        ValueHistory::continue_tracking(self)
    }

    fn truncate_after_marker(&mut self) {
        ValueHistory::truncate_after_marker(self)
    }

    fn truncate_after_round(&mut self, round: Round) -> Result<(), HistoryError> {
        ValueHistory::truncate_after_round(self, round)
    }

    fn shift_timescale(&mut self, delta: i64) -> Result<(), HistoryError> {
        ValueHistory::shift_timescale(self, delta)
    }

    fn trim_before(&mut self, round: Round) -> Result<(), HistoryError> {
        ValueHistory::trim_before(self, round)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
