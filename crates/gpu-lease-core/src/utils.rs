//! Small helpers shared across the core, providers, and CLI: session cost
//! accounting (design §4.6, the Stopper's "computes final session cost and
//! duration from State") and human-readable duration formatting.

use chrono::{DateTime, Utc};

/// Hours elapsed between `created_at` and `now`, used to derive session
/// cost as `hours_elapsed * hourly_rate`.
pub fn hours_elapsed(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let seconds = (now - created_at).num_milliseconds().max(0) as f64 / 1000.0;
    seconds / 3600.0
}

/// Session cost in the instance's currency: `hours_elapsed * hourly_rate`.
pub fn session_cost(created_at: DateTime<Utc>, now: DateTime<Utc>, hourly_rate: f64) -> f64 {
    hours_elapsed(created_at, now) * hourly_rate
}

/// Render an elapsed duration as `"2h 14m"`-style text for the Stop
/// summary and text-mode progress output.
pub fn format_duration(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        let secs = seconds % 60;
        format!("{minutes}m {secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn computes_hours_elapsed() {
        let start = Utc::now();
        let end = start + Duration::seconds(3600 * 2);
        assert!((hours_elapsed(start, end) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn computes_session_cost() {
        let start = Utc::now();
        let end = start + Duration::seconds(3600 * 3);
        assert!((session_cost(start, end, 0.5) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn formats_sub_hour_durations_with_minutes_and_seconds() {
        assert_eq!(format_duration(125), "2m 5s");
    }

    #[test]
    fn formats_hour_scale_durations_with_hours_and_minutes() {
        assert_eq!(format_duration(3600 * 2 + 60 * 14), "2h 14m");
    }
}
