use std::time::Duration;

use crate::error::ConfigError;

/// Parse durations written as `250ms`, `1.5s`, `2m` or `1h`. A bare number
/// is read as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
  let text = raw.trim();
  let split = text
    .find(|c: char| !(c.is_ascii_digit() || c == '.'))
    .unwrap_or(text.len());
  let (number, unit) = text.split_at(split);

  let value: f64 = number
    .parse()
    .map_err(|_| ConfigError::InvalidDuration(raw.to_string()))?;
  let seconds = match unit.trim() {
    "ms" => value / 1000.0,
    "" | "s" => value,
    "m" => value * 60.0,
    "h" => value * 3600.0,
    _ => return Err(ConfigError::InvalidDuration(raw.to_string())),
  };

  Duration::try_from_secs_f64(seconds).map_err(|_| ConfigError::InvalidDuration(raw.to_string()))
}
