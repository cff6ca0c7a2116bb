use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::{ScanError, ScanResult};

/// Parse a port specification into a deduplicated list of TCP ports (1..=65535).
///
/// Entries are separated by commas or newlines:
/// - single port number: `80`
/// - inclusive range: `8000-8010`
/// - comments: everything after `#` on a line is ignored
/// - whitespace and blank entries are ignored
///
/// Order of first appearance is preserved.
pub fn parse_port_spec(s: &str) -> ScanResult<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = HashSet::new();

    for (idx, raw_line) in s.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw_line.split('#').next().unwrap_or("");
        for item in line.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            if let Some((a, b)) = item.split_once('-') {
                let start = parse_port_str(a.trim()).map_err(|e| {
                    ScanError::InvalidPortSpec(format!("line {line_no}: invalid start in range {item}: {e}"))
                })?;
                let end = parse_port_str(b.trim()).map_err(|e| {
                    ScanError::InvalidPortSpec(format!("line {line_no}: invalid end in range {item}: {e}"))
                })?;
                if start > end {
                    return Err(ScanError::InvalidPortSpec(format!(
                        "line {line_no}: invalid range {start}-{end} (start > end)"
                    )));
                }
                for p in start..=end {
                    if seen.insert(p) {
                        out.push(p);
                    }
                }
                continue;
            }

            let p = parse_port_str(item).map_err(|e| {
                ScanError::InvalidPortSpec(format!("line {line_no}: invalid port value {item}: {e}"))
            })?;
            if seen.insert(p) {
                out.push(p);
            }
        }
    }

    Ok(out)
}

/// Load a port specification from a file path.
pub fn load_ports_from_path(path: impl AsRef<Path>) -> Result<Vec<u16>> {
    let content = fs::read_to_string(path.as_ref())
        .with_context(|| format!("failed to read ports file: {}", path.as_ref().display()))?;
    parse_port_spec(&content)
        .with_context(|| format!("failed to parse ports file: {}", path.as_ref().display()))
}

/// A conservative default list of commonly used TCP ports.
pub fn default_ports() -> Vec<u16> {
    const DEFAULT: &[u16] = &[
        21, 22, 23, 25, 53, 80, 110, 135, 139, 143, 389, 443, 445, 465, 587, 631, 993, 995, 1433,
        1521, 1723, 1883, 2049, 2375, 3000, 3128, 3306, 3389, 5000, 5432, 5672, 5900, 5985, 6379,
        8000, 8008, 8080, 8081, 8443, 8888, 9000, 9092, 9200, 11211, 27017,
    ];
    DEFAULT.to_vec()
}

/// Comma-joined form of a port list, suitable for `parse_port_spec`.
pub fn format_port_list(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_port_str(s: &str) -> std::result::Result<u16, String> {
    let val: u32 = s.parse::<u32>().map_err(|e| e.to_string())?;
    if val == 0 || val > 65535 {
        return Err(format!("port out of range: {val}"));
    }
    Ok(val as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_comma_list() {
        let ports = parse_port_spec("22, 80,443").unwrap();
        assert_eq!(ports, vec![22, 80, 443]);
    }

    #[test]
    fn parse_ranges_and_dedup() {
        let ports = parse_port_spec("8000-8002,80\n8001").unwrap();
        assert_eq!(ports, vec![8000, 8001, 8002, 80]);
    }

    #[test]
    fn parse_with_comments_and_whitespace() {
        let input = r#"
            # common web ports
            80  # http
            443 # https
            8000-8002   # dev servers
        "#;
        let ports = parse_port_spec(input).unwrap();
        assert_eq!(ports, vec![80, 443, 8000, 8001, 8002]);
    }

    #[test]
    fn reversed_range_rejected() {
        let err = parse_port_spec("100-10").unwrap_err();
        assert!(matches!(err, ScanError::InvalidPortSpec(_)));
    }

    #[test]
    fn out_of_range_rejected() {
        assert!(parse_port_spec("70000").is_err());
        assert!(parse_port_spec("0").is_err());
        assert!(parse_port_spec("http").is_err());
    }

    #[test]
    fn format_round_trips_through_parser() {
        let d = default_ports();
        assert_eq!(parse_port_spec(&format_port_list(&d)).unwrap(), d);
    }
}
