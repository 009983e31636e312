//! Kubernetes resource quantity parsing and formatting.
//!
//! Supports the subset of the quantity grammar that pod manifests use in
//! practice: plain decimals, the `m` milli suffix for CPU, and the SI /
//! binary-SI suffixes for memory. Formatting produces the canonical forms the
//! parser round-trips (`200m`, `128Mi`, plain byte counts).

use crate::error::{Result, StackError};

const KIB: i64 = 1024;

/// Parse a CPU quantity into millicores (`100m` -> 100, `1.5` -> 1500).
pub fn parse_cpu_milli(raw: &str) -> Result<i64> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(invalid(raw, "empty quantity"));
    }

    if let Some(milli) = s.strip_suffix('m') {
        let value: f64 = milli.parse().map_err(|_| invalid(raw, "not a number"))?;
        return to_i64(value.ceil(), raw);
    }

    let cores: f64 = s.parse().map_err(|_| invalid(raw, "not a number"))?;
    to_i64((cores * 1000.0).ceil(), raw)
}

/// Parse a memory quantity into bytes (`64Mi` -> 67108864, `1G` -> 1e9).
pub fn parse_memory_bytes(raw: &str) -> Result<i64> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(invalid(raw, "empty quantity"));
    }

    let (number, multiplier) = split_suffix(s)?;
    let value: f64 = number.parse().map_err(|_| invalid(raw, "not a number"))?;
    to_i64((value * multiplier as f64).ceil(), raw)
}

/// Format millicores in the canonical `<n>m` form.
pub fn format_cpu_milli(milli: i64) -> String {
    format!("{milli}m")
}

/// Format bytes using the largest binary suffix that divides evenly,
/// falling back to a plain byte count.
pub fn format_memory_bytes(bytes: i64) -> String {
    const SUFFIXES: [(&str, i64); 6] = [
        ("Ei", KIB * KIB * KIB * KIB * KIB * KIB),
        ("Pi", KIB * KIB * KIB * KIB * KIB),
        ("Ti", KIB * KIB * KIB * KIB),
        ("Gi", KIB * KIB * KIB),
        ("Mi", KIB * KIB),
        ("Ki", KIB),
    ];

    if bytes > 0 {
        for (suffix, unit) in SUFFIXES {
            if bytes % unit == 0 {
                return format!("{}{suffix}", bytes / unit);
            }
        }
    }

    bytes.to_string()
}

fn split_suffix(s: &str) -> Result<(&str, i64)> {
    const TABLE: [(&str, i64); 13] = [
        ("Ki", KIB),
        ("Mi", KIB * KIB),
        ("Gi", KIB * KIB * KIB),
        ("Ti", KIB * KIB * KIB * KIB),
        ("Pi", KIB * KIB * KIB * KIB * KIB),
        ("Ei", KIB * KIB * KIB * KIB * KIB * KIB),
        ("k", 1_000),
        ("K", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
        ("P", 1_000_000_000_000_000),
        ("E", 1_000_000_000_000_000_000),
    ];

    for (suffix, unit) in TABLE {
        if let Some(number) = s.strip_suffix(suffix) {
            return Ok((number, unit));
        }
    }

    Ok((s, 1))
}

fn to_i64(value: f64, raw: &str) -> Result<i64> {
    if !value.is_finite() || value < 0.0 || value > i64::MAX as f64 {
        return Err(invalid(raw, "out of range"));
    }

    Ok(value as i64)
}

fn invalid(raw: &str, reason: &str) -> StackError {
    StackError::pod_spec_invalid(format!("invalid quantity {raw:?}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_milli() {
        assert_eq!(parse_cpu_milli("100m").unwrap(), 100);
        assert_eq!(parse_cpu_milli("1500m").unwrap(), 1500);
        assert_eq!(parse_cpu_milli("1").unwrap(), 1000);
        assert_eq!(parse_cpu_milli("0.5").unwrap(), 500);
        assert_eq!(parse_cpu_milli("2.5").unwrap(), 2500);
    }

    #[test]
    fn test_parse_cpu_rejects_garbage() {
        assert!(parse_cpu_milli("").is_err());
        assert!(parse_cpu_milli("abc").is_err());
        assert!(parse_cpu_milli("-1").is_err());
    }

    #[test]
    fn test_parse_memory_bytes() {
        assert_eq!(parse_memory_bytes("64Mi").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("256Mi").unwrap(), 256 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_bytes("1G").unwrap(), 1_000_000_000);
        assert_eq!(parse_memory_bytes("128974848").unwrap(), 128974848);
        assert_eq!(parse_memory_bytes("1k").unwrap(), 1000);
    }

    #[test]
    fn test_parse_memory_rejects_garbage() {
        assert!(parse_memory_bytes("").is_err());
        assert!(parse_memory_bytes("Mi").is_err());
        assert!(parse_memory_bytes("-64Mi").is_err());
    }

    #[test]
    fn test_format_round_trip() {
        for (bytes, text) in [
            (128 * 1024 * 1024, "128Mi"),
            (1024 * 1024 * 1024, "1Gi"),
            (1024, "1Ki"),
            (1_000_000, "1000000"),
            (0, "0"),
        ] {
            assert_eq!(format_memory_bytes(bytes), text);
            assert_eq!(parse_memory_bytes(text).unwrap(), bytes);
        }

        assert_eq!(format_cpu_milli(200), "200m");
        assert_eq!(parse_cpu_milli(&format_cpu_milli(200)).unwrap(), 200);
    }
}
