//! Parsing of Kubernetes-style resource quantities into pool sizing numbers.

use once_cell::sync::Lazy;
use regex::Regex;

static QUANTITY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([+-]?[0-9.]+)([eEinumkKMGTP]*[-+]?[0-9]*)$").expect("static quantity regex")
});

const QUANTITY_GRAMMAR: &str =
    "quantities must match the regular expression '^([+-]?[0-9.]+)([eEinumkKMGTP]*[-+]?[0-9]*)$'";

fn split(s: &str) -> Result<(f64, String), String> {
    let caps = QUANTITY_RE.captures(s).ok_or(QUANTITY_GRAMMAR)?;
    let num: f64 = caps[1]
        .parse()
        .map_err(|_| format!("{:?} is not a valid number", &caps[1]))?;
    Ok((num, caps[2].to_string()))
}

/// Applies a decimal-exponent suffix ("e3", "E-2") to `num`.
fn apply_exponent(num: f64, suffix: &str) -> Option<f64> {
    let exponent: i32 = suffix[1..].parse().ok()?;
    Some(num * 10f64.powi(exponent))
}

/// Parses a CPU quantity ("0.1", "100m", "2", "1e-1") into a fractional
/// core count.
pub fn parse_cpus(s: &str) -> Result<f64, String> {
    let (num, suffix) = split(s)?;
    match suffix.as_str() {
        "" => Ok(num),
        "m" => Ok(num / 1000.0),
        exp if exp.starts_with('e') || exp.starts_with('E') => apply_exponent(num, exp)
            .ok_or_else(|| format!("unsupported cpu quantity suffix {:?}", exp)),
        other => Err(format!("unsupported cpu quantity suffix {:?}", other)),
    }
}

/// Parses a memory quantity ("128Mi", "1Gi", "64M", "128e6") into whole
/// mebibytes.
pub fn parse_mem_mb(s: &str) -> Result<i64, String> {
    let (num, suffix) = split(s)?;
    let bytes = match suffix.as_str() {
        "" => num,
        "k" | "K" => num * 1e3,
        "M" => num * 1e6,
        "G" => num * 1e9,
        "T" => num * 1e12,
        "Ki" => num * 1024.0,
        "Mi" => num * 1024.0 * 1024.0,
        "Gi" => num * 1024.0 * 1024.0 * 1024.0,
        "Ti" => num * 1024.0 * 1024.0 * 1024.0 * 1024.0,
        exp if exp.starts_with('e') || exp.starts_with('E') => apply_exponent(num, exp)
            .ok_or_else(|| format!("unsupported memory quantity suffix {:?}", exp))?,
        other => Err(format!("unsupported memory quantity suffix {:?}", other))?,
    };
    Ok((bytes / (1024.0 * 1024.0)).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_cpu_forms() {
        assert_eq!(parse_cpus("0.1").unwrap(), 0.1);
        assert_eq!(parse_cpus("100m").unwrap(), 0.1);
        assert_eq!(parse_cpus("2").unwrap(), 2.0);
    }

    #[test]
    fn parses_memory_forms() {
        assert_eq!(parse_mem_mb("128Mi").unwrap(), 128);
        assert_eq!(parse_mem_mb("1Gi").unwrap(), 1024);
        assert_eq!(parse_mem_mb("64M").unwrap(), 61);
    }

    #[test]
    fn parses_exponent_forms() {
        // Decimal exponents are part of the quantity grammar too.
        assert_eq!(parse_cpus("1e3").unwrap(), 1000.0);
        assert_eq!(parse_cpus("2E0").unwrap(), 2.0);
        assert_eq!(parse_mem_mb("128e6").unwrap(), 122);
        assert_eq!(parse_mem_mb("1e9").unwrap(), 954);
    }

    #[test]
    fn rejects_garbage_with_the_grammar_message() {
        let err = parse_cpus("foo").unwrap_err();
        assert!(err.contains("quantities must match"), "err={}", err);
        let err = parse_mem_mb("12Zi").unwrap_err();
        assert!(err.contains("quantities must match") || err.contains("unsupported"), "err={}", err);
    }
}
