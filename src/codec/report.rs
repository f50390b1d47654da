//! Parsing of rsbx's human-readable reports

use crate::config::CompiledLayout;
use crate::integrity::Digest;

use super::RepairReport;

/// Extract the embedded digest from `rsbx show` output
pub fn parse_show(layout: &CompiledLayout, output: &str) -> Result<Digest, String> {
    let caps = layout
        .hash
        .captures(output)
        .ok_or_else(|| "no hash field in show output".to_string())?;
    let hex = caps
        .get(1)
        .map(|m| m.as_str())
        .ok_or_else(|| "hash field is empty".to_string())?;
    Digest::from_hex(hex).ok_or_else(|| format!("hash '{}' is not a SHA-256 digest", hex))
}

/// Extract block counts from `rsbx repair` output
pub fn parse_repair(layout: &CompiledLayout, output: &str) -> Result<RepairReport, String> {
    let failed_to_process = capture_count(&layout.failed_to_process, output, "failed to process")?;
    let failed_to_repair = capture_count(&layout.failed_to_repair, output, "failed to repair")?;

    if failed_to_repair > failed_to_process {
        return Err(format!(
            "{} blocks failed to repair but only {} failed to process",
            failed_to_repair, failed_to_process
        ));
    }

    Ok(RepairReport {
        failed_to_process,
        failed_to_repair,
    })
}

fn capture_count(re: &regex::Regex, output: &str, label: &str) -> Result<u64, String> {
    let caps = re
        .captures(output)
        .ok_or_else(|| format!("no '{}' field in repair output", label))?;
    let raw = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    raw.parse::<u64>()
        .map_err(|e| format!("'{}' count '{}' is not a number: {}", label, raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReportLayout;

    const SHOW_OUTPUT: &str = "\
SBX container general info
========================================
File name                 : notes.txt
SBX container version     : 17 (0x11)
Container UID             : 5A3C0F6E8D21
File size                 : 11 bytes
Hash                      : SHA256 - b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9
";

    const REPAIR_OUTPUT: &str = "\
Number of blocks processed                  : 40
Number of blocks passed check               : 37
Number of blocks failed to process          : 3
Number of blocks repaired                   : 3
Number of blocks failed to repair           : 0
Time elapsed                                : 00:00:00
";

    fn layout() -> CompiledLayout {
        ReportLayout::default().compile().unwrap()
    }

    #[test]
    fn test_parse_show() {
        let digest = parse_show(&layout(), SHOW_OUTPUT).unwrap();
        assert_eq!(digest, Digest::of(b"hello world"));
    }

    #[test]
    fn test_parse_show_rejects_malformed() {
        assert!(parse_show(&layout(), "File name : x\n").is_err());
        assert!(parse_show(&layout(), "Hash : SHA256 - abcdef\n").is_err());
        assert!(parse_show(&layout(), "").is_err());
    }

    #[test]
    fn test_parse_repair() {
        let report = parse_repair(&layout(), REPAIR_OUTPUT).unwrap();
        assert_eq!(
            report,
            RepairReport {
                failed_to_process: 3,
                failed_to_repair: 0
            }
        );
        assert!(report.is_recoverable());
    }

    #[test]
    fn test_parse_repair_rejects_malformed() {
        let missing = "Number of blocks failed to process : 2\n";
        assert!(parse_repair(&layout(), missing).is_err());

        let inverted = "Number of blocks failed to process : 1\n\
                        Number of blocks failed to repair : 2\n";
        assert!(parse_repair(&layout(), inverted).is_err());
    }
}
