//! Human-friendly value parsing for configuration.
//!
//! Durations use a number followed by a unit:
//! - `ms`: milliseconds
//! - `s`: seconds
//! - `m`: minutes
//! - `h`: hours
//! - `d`: days
//! - `w`: weeks
//!
//! A bare number is read as seconds.

use std::time::Duration;

/// Parse duration string (e.g., "250ms", "30s", "1h", "1d").
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let amount: u64 = digits.parse().ok()?;

    let duration = match unit.trim() {
        "ms" => Duration::from_millis(amount),
        "" | "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount.checked_mul(60)?),
        "h" => Duration::from_secs(amount.checked_mul(3600)?),
        "d" => Duration::from_secs(amount.checked_mul(86400)?),
        "w" => Duration::from_secs(amount.checked_mul(604800)?),
        _ => return None,
    };

    Some(duration)
}

/// Format a duration in the most compact unit that represents it exactly.
pub fn format_duration(duration: Duration) -> String {
    let millis = duration.as_millis();
    if millis == 0 {
        return "0s".to_string();
    }
    if millis % 1000 != 0 {
        return format!("{}ms", millis);
    }

    let secs = duration.as_secs();
    if secs % 86400 == 0 {
        format!("{}d", secs / 86400)
    } else if secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{}s", secs)
    }
}

/// Parse a boolean flag the way environment files usually spell them.
pub fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
