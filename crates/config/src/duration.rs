//! ISO-8601 duration handling, restricted to the `PTnHnMnS` subset.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::error;

static ISO_DURATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^PT(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?$").expect("duration pattern is valid")
});

/// Parse a `PTnHnMnS` duration into whole seconds.
///
/// Returns `None` for anything outside the subset, and for values that sum to
/// zero seconds; callers substitute their documented defaults.
#[must_use]
pub fn parse_iso8601(value: &str) -> Option<Duration> {
    let Some(captures) = ISO_DURATION.captures(value.trim()) else {
        error!(
            value,
            "value is not matching with expected ISO 8601 duration format [PTnHnMnS]"
        );
        return None;
    };

    let component = |index: usize| {
        captures
            .get(index)
            .map_or(Some(0), |m| m.as_str().parse::<u64>().ok())
    };

    let hours = component(1)?;
    let minutes = component(2)?;
    let seconds = component(3)?;

    let total = hours
        .checked_mul(60 * 60)?
        .checked_add(minutes.checked_mul(60)?)?
        .checked_add(seconds)?;

    (total > 0).then(|| Duration::from_secs(total))
}

/// Render whole seconds back into the `PTnHnMnS` subset.
#[must_use]
pub fn format_iso8601(duration: Duration) -> String {
    let total = duration.as_secs();
    if total == 0 {
        return "PT0S".to_owned();
    }

    let hours = total / (60 * 60);
    let minutes = (total % (60 * 60)) / 60;
    let seconds = total % 60;

    let mut out = String::from("PT");
    if hours > 0 {
        out.push_str(&format!("{hours}H"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}M"));
    }
    if seconds > 0 {
        out.push_str(&format!("{seconds}S"));
    }
    out
}
