//! Serial port discovery.

use tracing::debug;

/// Device name fragments that identify microcontroller boards.
const KNOWN_PATTERNS: &[&str] = &["cu.usbmodem", "tty.usbmodem", "ttyUSB", "ttyACM", "COM"];

/// Fallback port when nothing matching is attached.
pub fn default_port() -> &'static str {
    if cfg!(target_os = "macos") {
        "/dev/cu.usbmodem11201"
    } else if cfg!(windows) {
        "COM10"
    } else {
        "/dev/ttyUSB0"
    }
}

/// Check whether a port name looks like a sensor board.
pub fn matches_known_pattern(name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    KNOWN_PATTERNS.iter().any(|p| base.starts_with(p))
}

/// Names of all ports reported by the OS.
pub fn list_ports() -> Vec<String> {
    match tokio_serial::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            debug!(error = %e, "port enumeration failed");
            Vec::new()
        }
    }
}

/// Pick the first board-like port, preferring macOS call-out devices.
pub fn select_port(candidates: &[String]) -> Option<String> {
    let mut matching: Vec<&String> = candidates
        .iter()
        .filter(|p| matches_known_pattern(p))
        .collect();
    matching.sort_by_key(|p| KNOWN_PATTERNS.iter().position(|k| p.contains(k)));
    matching.first().map(|p| p.to_string())
}

/// Resolve the port to use: explicit setting first, then discovery, then
/// the platform default.
pub fn resolve_port(explicit: Option<&str>) -> String {
    if let Some(port) = explicit {
        return port.to_string();
    }
    select_port(&list_ports()).unwrap_or_else(|| default_port().to_string())
}
