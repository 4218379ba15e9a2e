// Platform-dispatched adapter enumeration

#[cfg(unix)]
mod tty_unix;
#[cfg(unix)]
pub use tty_unix::adapter_candidates;

use super::transport::Candidate;

// Fallback for other platforms: every port whose name ends in a number
#[cfg(not(unix))]
pub fn adapter_candidates() -> crate::GpibResult<Vec<Candidate>> {
    let ports = serialport::available_ports()
        .map_err(|err| crate::GpibError::ScanFailed(err.to_string()))?;
    Ok(sort_and_dedup(
        ports
            .into_iter()
            .filter_map(|p| node_suffix(&p.port_name).map(|n| Candidate::new(p.port_name, n)))
            .collect(),
    ))
}

/// Trailing decimal number of a device name (`ttyUSB12` → 12).
pub fn node_suffix(name: &str) -> Option<u32> {
    let base = name.rsplit('/').next().unwrap_or(name);
    let digits_at = base
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    base[digits_at..].parse().ok()
}

/// Order candidates by node number and keep one entry per node.
pub(crate) fn sort_and_dedup(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| a.node.cmp(&b.node).then_with(|| a.path.cmp(&b.path)));
    candidates.dedup_by_key(|c| c.node);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_suffix_parsing() {
        assert_eq!(node_suffix("/dev/ttyUSB0"), Some(0));
        assert_eq!(node_suffix("/dev/ttyUSB12"), Some(12));
        assert_eq!(node_suffix("COM3"), Some(3));
        assert_eq!(node_suffix("/dev/ttyUSB"), None);
    }

    #[test]
    fn dedup_by_node() {
        let out = sort_and_dedup(vec![
            Candidate::new("/dev/ttyUSB2", 2),
            Candidate::new("/dev/ttyUSB0", 0),
            Candidate::new("/dev/ttyUSB2", 2),
        ]);
        let nodes: Vec<u32> = out.iter().map(|c| c.node).collect();
        assert_eq!(nodes, vec![0, 2]);
    }
}
