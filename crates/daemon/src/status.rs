//! Severity color derivation for dashboards.
//!
//! Each job state maps to one of four colors; the fleet color is the most
//! severe color across all jobs. Severity order: red > yellow > blue > green.

use serde::{Deserialize, Serialize};

use crate::state::{JobState, StopCause};

/// Dashboard severity color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusColor {
    Green,
    Yellow,
    Red,
    Blue,
}

impl StatusColor {
    /// Rank in the severity order; higher is worse.
    fn rank(&self) -> u8 {
        match self {
            StatusColor::Green => 0,
            StatusColor::Blue => 1,
            StatusColor::Yellow => 2,
            StatusColor::Red => 3,
        }
    }

    /// The more severe of two colors.
    pub fn worst(self, other: StatusColor) -> StatusColor {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for StatusColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusColor::Green => write!(f, "green"),
            StatusColor::Yellow => write!(f, "yellow"),
            StatusColor::Red => write!(f, "red"),
            StatusColor::Blue => write!(f, "blue"),
        }
    }
}

/// Color for a single job given its state and, for Stopped, the cause.
///
/// A clean operator stop is informational (blue); a stop forced by a fatal
/// condition or an exhausted restart budget is an alarm (red).
pub fn job_color(state: JobState, stop_cause: Option<StopCause>) -> StatusColor {
    match state {
        JobState::Running => StatusColor::Green,
        JobState::Starting | JobState::Degraded | JobState::Restarting => StatusColor::Yellow,
        JobState::Error => StatusColor::Red,
        JobState::Idle | JobState::Stopping => StatusColor::Blue,
        JobState::Stopped => match stop_cause {
            Some(StopCause::Fatal) | Some(StopCause::RetriesExhausted) => StatusColor::Red,
            Some(StopCause::Clean) | None => StatusColor::Blue,
        },
    }
}

/// Worst color across the fleet; an empty fleet is green.
pub fn fleet_color<I>(colors: I) -> StatusColor
where
    I: IntoIterator<Item = StatusColor>,
{
    colors
        .into_iter()
        .fold(StatusColor::Green, StatusColor::worst)
}
