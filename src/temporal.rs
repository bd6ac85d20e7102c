// Temporal Model - validity windows for registered entity versions
//
// A version is valid from `valid_from` until `valid_to` (None = still current).
// Point-in-time visibility is inclusive at both ends, matching the compiled
// store predicate `valid_from <= T AND (valid_to IS NULL OR valid_to >= T)`.
// History invariants are evaluated on half-open windows [from, to).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Fixed-width RFC 3339 rendering so stored instants compare lexically.
pub fn format_instant(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_instant(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// VALIDITY WINDOW
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidityWindow {
    pub valid_from: DateTime<Utc>,

    /// None = open-ended (the current version)
    pub valid_to: Option<DateTime<Utc>>,
}

impl ValidityWindow {
    pub fn open(valid_from: DateTime<Utc>) -> Self {
        ValidityWindow {
            valid_from,
            valid_to: None,
        }
    }

    pub fn is_current(&self) -> bool {
        self.valid_to.is_none()
    }

    pub fn is_visible_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_from <= at && self.valid_to.map_or(true, |to| to >= at)
    }

    /// Collapsed windows are never persisted
    pub fn is_zero_length(&self) -> bool {
        self.valid_to == Some(self.valid_from)
    }

    pub fn close(&mut self, at: DateTime<Utc>) {
        self.valid_to = Some(at);
    }

    /// Overlap on half-open windows: a window ending at T does not overlap
    /// one starting at T.
    pub fn overlaps(&self, other: &ValidityWindow) -> bool {
        let self_ends_after = self.valid_to.map_or(true, |to| to > other.valid_from);
        let other_ends_after = other.valid_to.map_or(true, |to| to > self.valid_from);
        self_ends_after && other_ends_after
    }
}

/// Check the lineage invariants over a set of windows: no overlap, at most one
/// open window, no inverted or zero-length window. Returns every violation.
pub fn validate_history(windows: &[ValidityWindow]) -> Vec<String> {
    let mut problems = Vec::new();

    let open = windows.iter().filter(|w| w.is_current()).count();
    if open > 1 {
        problems.push(format!("{} open windows, expected at most one", open));
    }

    for w in windows {
        if let Some(to) = w.valid_to {
            if to < w.valid_from {
                problems.push(format!("window ends before it starts: {:?}", w));
            } else if to == w.valid_from {
                problems.push(format!("zero-length window at {}", format_instant(to)));
            }
        }
    }

    for (i, a) in windows.iter().enumerate() {
        for b in &windows[i + 1..] {
            if a.overlaps(b) {
                problems.push(format!("overlapping windows {:?} and {:?}", a, b));
            }
        }
    }

    problems
}

// ============================================================================
// TESTS
// ============================================================================
