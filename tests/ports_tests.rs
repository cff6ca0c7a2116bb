use eternal_scan::error::ScanError;
use eternal_scan::ports::{format_port_list, load_ports_from_path, parse_port_spec};

#[test]
fn parse_single_and_ranges_and_comments() {
    let input = r#"
        # common ports
        22
        80  # http
        443 # https
        8000-8002
        8001  # duplicate
        # blank line follows

    "#;

    let ports = parse_port_spec(input).expect("parse ok");
    // Dedup, preserve order of first appearance
    assert_eq!(ports, vec![22, 80, 443, 8000, 8001, 8002]);
}

#[test]
fn comma_separated_form_used_by_the_api() {
    let ports = parse_port_spec("22, 80,443,8000-8001").unwrap();
    assert_eq!(ports, vec![22, 80, 443, 8000, 8001]);
    assert_eq!(format_port_list(&ports), "22,80,443,8000,8001");
}

#[test]
fn invalid_port_rejected() {
    assert!(matches!(parse_port_spec("0\n"), Err(ScanError::InvalidPortSpec(_))));
    assert!(matches!(parse_port_spec("65536"), Err(ScanError::InvalidPortSpec(_))));
    assert!(matches!(parse_port_spec("100-90"), Err(ScanError::InvalidPortSpec(_))));
    assert!(matches!(parse_port_spec("http"), Err(ScanError::InvalidPortSpec(_))));
}

#[test]
fn ports_file_is_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ports.txt");
    std::fs::write(&path, "22\n80-81 # web\n").unwrap();
    assert_eq!(load_ports_from_path(&path).unwrap(), vec![22, 80, 81]);
    assert!(load_ports_from_path(dir.path().join("missing.txt")).is_err());
}
