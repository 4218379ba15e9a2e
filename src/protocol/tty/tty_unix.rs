use std::{fs, path::Path};

use super::{node_suffix, sort_and_dedup};
use crate::{protocol::transport::Candidate, GpibError, GpibResult};

/// Kernel table of identified USB-serial chips; readable by root only.
const USBSERIAL_REGISTRY: &str = "/proc/tty/driver/usbserial";
const DEV_DIR: &str = "/dev";
const NODE_PREFIX: &str = "ttyUSB";
/// Prologix adapters are built on FTDI USB-serial chips.
const ADAPTER_CHIP: &str = "FTDI";

/// Serial nodes that may have an adapter behind them.
///
/// Uses the kernel's usbserial table when readable and falls back to scanning
/// `/dev` for `ttyUSB<N>` nodes otherwise.
pub fn adapter_candidates() -> GpibResult<Vec<Candidate>> {
    match fs::read_to_string(USBSERIAL_REGISTRY) {
        Ok(table) => Ok(sort_and_dedup(parse_usbserial_registry(&table))),
        Err(err) => {
            log::debug!("{USBSERIAL_REGISTRY} unreadable ({err}), scanning {DEV_DIR}");
            scan_dev_dir(Path::new(DEV_DIR))
        }
    }
}

pub(crate) fn parse_usbserial_registry(table: &str) -> Vec<Candidate> {
    table
        .lines()
        .filter(|line| line.contains(ADAPTER_CHIP))
        .filter_map(|line| {
            let (index, _) = line.split_once(':')?;
            let node: u32 = index.trim().parse().ok()?;
            Some(Candidate::new(format!("{DEV_DIR}/{NODE_PREFIX}{node}"), node))
        })
        .collect()
}

pub(crate) fn scan_dev_dir(dir: &Path) -> GpibResult<Vec<Candidate>> {
    let entries = fs::read_dir(dir)
        .map_err(|err| GpibError::ScanFailed(format!("cannot list {}: {err}", dir.display())))?;
    let mut found = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(rest) = name.strip_prefix(NODE_PREFIX) else {
            continue;
        };
        if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if let Some(node) = node_suffix(name) {
            found.push(Candidate::new(entry.path().to_string_lossy(), node));
        }
    }
    Ok(sort_and_dedup(found))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_keeps_only_ftdi_lines() {
        let table = "usbserinfo:1.0 driver:2.0\n\
            0: module:ftdi_sio name:\"FTDI USB Serial Device\" vendor:0403 product:6001 num_ports:1 port:0 path:usb-0000:00:14.0-2\n\
            1: module:pl2303 name:\"pl2303\" vendor:067b product:2303 num_ports:1 port:0 path:usb-0000:00:14.0-3\n\
            3: module:ftdi_sio name:\"FTDI USB Serial Device\" vendor:0403 product:6001 num_ports:1 port:0 path:usb-0000:00:14.0-4\n";
        let found = parse_usbserial_registry(table);
        assert_eq!(
            found,
            vec![
                Candidate::new("/dev/ttyUSB0", 0),
                Candidate::new("/dev/ttyUSB3", 3)
            ]
        );
    }

    #[test]
    fn dev_scan_matches_numbered_nodes() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["ttyUSB1", "ttyUSB0", "ttyUSB", "ttyS0", "ttyUSBfoo"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let found = scan_dev_dir(dir.path()).unwrap();
        let nodes: Vec<u32> = found.iter().map(|c| c.node).collect();
        assert_eq!(nodes, vec![0, 1]);
        assert!(found[0].path.ends_with("ttyUSB0"));
    }

    #[test]
    fn dev_scan_reports_missing_dir() {
        let err = scan_dev_dir(Path::new("/nonexistent/gpibmux-dev")).unwrap_err();
        assert!(matches!(err, GpibError::ScanFailed(_)));
    }
}
