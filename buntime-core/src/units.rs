use serde_json::Value;

/// Parse a manifest duration into milliseconds.
///
/// Accepts a bare non-negative integer (seconds) or a string with an
/// `ms|s|m|h|d` suffix. `"0"` and `0` are valid and mean "disabled" for the
/// fields that treat zero specially (ttl).
pub fn parse_duration_ms(value: &Value) -> Result<u64, String> {
    match value {
        Value::Number(n) => {
            let secs = n
                .as_u64()
                .ok_or_else(|| format!("duration must be a non-negative integer: {n}"))?;
            secs.checked_mul(1000)
                .ok_or_else(|| format!("duration overflows: {n}"))
        }
        Value::String(s) => parse_duration_str_ms(s),
        _ => Err(format!("invalid duration: {value}")),
    }
}

pub fn parse_duration_str_ms(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return secs
            .checked_mul(1000)
            .ok_or_else(|| format!("duration overflows: {s}"));
    }
    let (num, unit_ms): (&str, u64) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, 1)
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, 1000)
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, 60 * 1000)
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, 3600 * 1000)
    } else if let Some(stripped) = s.strip_suffix('d') {
        (stripped, 86_400 * 1000)
    } else {
        return Err(format!("unknown duration unit: {s}"));
    };
    let n: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {num}"))?;
    n.checked_mul(unit_ms)
        .ok_or_else(|| format!("duration overflows: {s}"))
}

/// Resolve a rate-limit window string (`"30s"`, `"5m"`, `"1h"`, `"1d"`) to
/// whole seconds. Bare integers are seconds.
pub fn window_seconds(s: &str) -> Result<u64, String> {
    let ms = parse_duration_str_ms(s)?;
    if ms == 0 || ms % 1000 != 0 {
        return Err(format!("window must be a whole number of seconds: {s}"));
    }
    Ok(ms / 1000)
}

/// Largest size we accept, chosen so every byte count survives a round-trip
/// through an f64 (the manifest allows decimal multipliers).
const MAX_SAFE_BYTES: u64 = (1u64 << 53) - 1;

/// Parse a manifest size into bytes.
///
/// Accepts a bare non-negative integer (bytes) or a string with a
/// `b|kb|mb|gb` suffix. Decimal multipliers are allowed (`"1.5mb"`); the
/// result must land on a safe non-negative integer.
pub fn parse_size_bytes(value: &Value) -> Result<u64, String> {
    match value {
        Value::Number(n) => {
            let bytes = n
                .as_u64()
                .ok_or_else(|| format!("size must be a non-negative integer: {n}"))?;
            if bytes > MAX_SAFE_BYTES {
                return Err(format!("size is not a safe integer: {n}"));
            }
            Ok(bytes)
        }
        Value::String(s) => parse_size_str_bytes(s),
        _ => Err(format!("invalid size: {value}")),
    }
}

pub fn parse_size_str_bytes(s: &str) -> Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty size string".to_string());
    }
    if let Ok(bytes) = s.parse::<u64>() {
        if bytes > MAX_SAFE_BYTES {
            return Err(format!("size is not a safe integer: {s}"));
        }
        return Ok(bytes);
    }
    let lower = s.to_ascii_lowercase();
    let (num, mult): (&str, u64) = if let Some(stripped) = lower.strip_suffix("kb") {
        (stripped, 1024)
    } else if let Some(stripped) = lower.strip_suffix("mb") {
        (stripped, 1024 * 1024)
    } else if let Some(stripped) = lower.strip_suffix("gb") {
        (stripped, 1024 * 1024 * 1024)
    } else if let Some(stripped) = lower.strip_suffix('b') {
        (stripped, 1)
    } else {
        return Err(format!("unknown size unit: {s}"));
    };
    let n: f64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {num}"))?;
    if !n.is_finite() || n < 0.0 {
        return Err(format!("size must be non-negative: {s}"));
    }
    let bytes = n * mult as f64;
    if bytes > MAX_SAFE_BYTES as f64 {
        return Err(format!("size is not a safe integer: {s}"));
    }
    let rounded = bytes.round();
    if (bytes - rounded).abs() > f64::EPSILON * bytes.max(1.0) {
        return Err(format!("size does not resolve to whole bytes: {s}"));
    }
    Ok(rounded as u64)
}
