//! Parsing for Kubernetes-style resource quantities (`"500m"`, `"2"`,
//! `"4Gi"`) into normalized `i64` base units so the scheduler can do
//! exact integer arithmetic instead of juggling `Quantity` strings.
//!
//! cpu is normalized to millicores, everything else to raw bytes/units.

use crate::util::Error;

const BINARY_SUFFIXES: &[(&str, i64)] = &[
    ("Ki", 1i64 << 10),
    ("Mi", 1i64 << 20),
    ("Gi", 1i64 << 30),
    ("Ti", 1i64 << 40),
    ("Pi", 1i64 << 50),
];

const DECIMAL_SUFFIXES: &[(&str, i64)] = &[
    ("n", 1),
    ("u", 1_000),
    ("m", 1), // handled specially for cpu below; 1 for non-cpu decimal milli
    ("k", 1_000),
    ("M", 1_000_000),
    ("G", 1_000_000_000),
    ("T", 1_000_000_000_000),
];

/// Parses a cpu quantity into millicores: `"2"` -> 2000, `"500m"` -> 500.
pub fn parse_cpu_millicores(raw: &str) -> Result<i64, Error> {
    let raw = raw.trim();
    if let Some(stripped) = raw.strip_suffix('m') {
        return stripped
            .parse::<i64>()
            .map_err(|_| Error::ValidationError(format!("invalid cpu quantity '{raw}'")));
    }
    let cores: f64 = raw
        .parse()
        .map_err(|_| Error::ValidationError(format!("invalid cpu quantity '{raw}'")))?;
    Ok((cores * 1000.0).round() as i64)
}

/// Parses a memory/generic quantity into raw base units (bytes for
/// memory-style quantities).
pub fn parse_quantity(raw: &str) -> Result<i64, Error> {
    let raw = raw.trim();
    for (suffix, multiplier) in BINARY_SUFFIXES {
        if let Some(stripped) = raw.strip_suffix(suffix) {
            let n: i64 = stripped
                .parse()
                .map_err(|_| Error::ValidationError(format!("invalid quantity '{raw}'")))?;
            return Ok(n * multiplier);
        }
    }
    for (suffix, multiplier) in DECIMAL_SUFFIXES {
        if let Some(stripped) = raw.strip_suffix(suffix) {
            let n: i64 = stripped
                .parse()
                .map_err(|_| Error::ValidationError(format!("invalid quantity '{raw}'")))?;
            return Ok(n * multiplier);
        }
    }
    raw.parse()
        .map_err(|_| Error::ValidationError(format!("invalid quantity '{raw}'")))
}

/// Parses a `{cpu, mem, ...}`-shaped resource map from string quantities
/// into a normalized `vc_types::ResourceList`.
pub fn parse_resource_list(
    raw: &std::collections::BTreeMap<String, String>,
) -> Result<vc_types::ResourceList, Error> {
    let mut out = vc_types::ResourceList::new();
    for (k, v) in raw {
        let normalized = if k == "cpu" {
            parse_cpu_millicores(v)?
        } else {
            parse_quantity(v)?
        };
        out.insert(k.clone(), normalized);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_cpu_cores() {
        assert_eq!(parse_cpu_millicores("2").unwrap(), 2000);
        assert_eq!(parse_cpu_millicores("0.5").unwrap(), 500);
    }

    #[test]
    fn parses_millicore_suffix() {
        assert_eq!(parse_cpu_millicores("500m").unwrap(), 500);
    }

    #[test]
    fn parses_binary_memory_suffixes() {
        assert_eq!(parse_quantity("4Gi").unwrap(), 4 * (1i64 << 30));
        assert_eq!(parse_quantity("512Mi").unwrap(), 512 * (1i64 << 20));
    }

    #[test]
    fn parses_decimal_suffixes() {
        assert_eq!(parse_quantity("2k").unwrap(), 2000);
        assert_eq!(parse_quantity("3G").unwrap(), 3_000_000_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_quantity("not-a-number").is_err());
    }
}
