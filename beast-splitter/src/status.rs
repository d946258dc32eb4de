//! Periodic JSON status snapshot.
//!
//! Written atomically (`PATH.new`, then rename) every refresh tick and on
//! every upstream status message. The radio section reflects receiver
//! connectivity; the gps section decodes the Radarcape's GPS health bits.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::time::{self, Instant};
use tracing::warn;

use beast_core::{Filter, FilterDistributor, Message};

use crate::receiver::{ReceiverType, SharedReceiverState};

/// Refresh cadence; the file is also rewritten whenever a status message
/// arrives.
const TIMEOUT_INTERVAL: Duration = Duration::from_millis(2500);

#[derive(Serialize)]
struct Section {
    status: &'static str,
    message: String,
}

#[derive(Serialize)]
struct Snapshot {
    radio: Section,
    #[serde(skip_serializing_if = "Option::is_none")]
    gps: Option<Section>,
    time: u64,
    expiry: u64,
    interval: u64,
}

pub struct StatusWriter {
    path: PathBuf,
    temp_path: PathBuf,
    receiver: SharedReceiverState,
    deadline: Cell<Instant>,
}

impl StatusWriter {
    /// Register with the distributor (status messages only) and start the
    /// refresh task.
    pub fn start(
        path: PathBuf,
        distributor: &Rc<RefCell<FilterDistributor>>,
        receiver: SharedReceiverState,
    ) {
        let mut temp_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        temp_name.push(".new");
        let temp_path = path.with_file_name(temp_name);

        let writer = Rc::new(StatusWriter {
            path,
            temp_path,
            receiver,
            deadline: Cell::new(Instant::now() + TIMEOUT_INTERVAL),
        });

        let filter = Filter {
            receive_status: true,
            ..Filter::default()
        };
        let sink = {
            let writer = writer.clone();
            move |message: &Message| {
                writer.deadline.set(Instant::now() + TIMEOUT_INTERVAL);
                writer.write_file(Some(gps_status(message.payload())));
                true
            }
        };
        distributor.borrow_mut().add_client(sink, filter);

        tokio::task::spawn_local(writer.run());
    }

    async fn run(self: Rc<Self>) {
        loop {
            let deadline = self.deadline.get();
            time::sleep_until(deadline).await;
            if self.deadline.get() != deadline {
                // A status message pushed the deadline out; wait again.
                continue;
            }
            self.deadline.set(Instant::now() + TIMEOUT_INTERVAL);

            if self.receiver.connected() && self.receiver.receiver_type() == ReceiverType::Radarcape
            {
                // We should be getting status messages, but we are not.
                self.write_file(Some((
                    "red",
                    "No recent GPS status message received".to_string(),
                )));
            } else {
                // Not connected, or a plain Beast with no GPS to report.
                self.write_file(None);
            }
        }
    }

    fn write_file(&self, gps: Option<(&'static str, String)>) {
        let connected = self.receiver.connected();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let interval = TIMEOUT_INTERVAL.as_millis() as u64;

        let snapshot = Snapshot {
            radio: Section {
                status: if connected { "green" } else { "red" },
                message: if connected {
                    "Connected to receiver".to_string()
                } else {
                    "Not connected to receiver".to_string()
                },
            },
            gps: gps.map(|(status, message)| Section { status, message }),
            time: now,
            expiry: now + 2 * interval,
            interval,
        };

        let json = match serde_json::to_vec_pretty(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!("status file: serialization failed: {e}");
                return;
            }
        };

        // Write to a sibling temp file first; an interrupted write leaves
        // the previous snapshot intact and the next tick retries.
        if let Err(e) = std::fs::write(&self.temp_path, &json) {
            warn!("status file: writing {} failed: {e}", self.temp_path.display());
            return;
        }
        if let Err(e) = std::fs::rename(&self.temp_path, &self.path) {
            warn!("status file: renaming to {} failed: {e}", self.path.display());
        }
    }
}

/// Decode the GPS health bits of a Radarcape status payload.
///
/// Byte 0 is the dipswitch byte (bit 0x10: GPS timestamps). Byte 1 is the
/// signed timestamp offset at the last PPS edge in 15 ns units. Byte 2 is
/// the GPS status: 0x80 new-format flag, 0x20 timestamp from FPGA rather
/// than GPS, 0x10 degradation under 45 ms, 0x08 UTC offset known, 0x04
/// enough good satellites, 0x02 tracking satellites, 0x01 antenna OK.
fn gps_status(payload: &[u8]) -> (&'static str, String) {
    if payload[0] & 0x10 == 0 {
        return ("red", "Not in GPS timestamp mode".to_string());
    }

    if payload[2] & 0x80 == 0 {
        // Old style message: judge the PPS offset only.
        return if payload[1] <= 3 || payload[1] >= 253 {
            ("green", "Receiver synchronized to GPS time".to_string())
        } else {
            ("amber", "Receiver more than 45ns from GPS time".to_string())
        };
    }

    if payload[2] & 0x20 == 0 {
        // FPGA is using GPS time.
        return if payload[2] & 0x10 != 0 {
            ("green", "Receiver synchronized to GPS time".to_string())
        } else {
            ("amber", "Receiver more than 45ns from GPS time".to_string())
        };
    }

    // FPGA is not using GPS time; work out why.
    let mut faults: Vec<&str> = Vec::new();
    if payload[2] & 0x08 == 0 {
        faults.push("GPS/UTC time offset not known");
    }
    if payload[2] & 0x02 == 0 {
        faults.push("Not tracking any satellites");
    } else if payload[2] & 0x04 == 0 {
        faults.push("Not tracking sufficient satellites");
    }
    if payload[2] & 0x01 == 0 {
        faults.push("Antenna fault");
    }
    if faults.is_empty() {
        faults.push("Unrecognized GPS fault");
    }

    ("red", faults.join("; "))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(dipswitch: u8, pps: u8, gps: u8) -> [u8; 14] {
        let mut p = [0u8; 14];
        p[0] = dipswitch;
        p[1] = pps;
        p[2] = gps;
        p
    }

    #[test]
    fn test_not_in_gps_mode() {
        let (color, message) = gps_status(&payload(0x00, 0, 0));
        assert_eq!(color, "red");
        assert!(message.contains("Not in GPS timestamp mode"));
    }

    #[test]
    fn test_old_style_synchronized() {
        // Small PPS offset either side of zero is green.
        assert_eq!(gps_status(&payload(0x10, 0, 0x00)).0, "green");
        assert_eq!(gps_status(&payload(0x10, 3, 0x00)).0, "green");
        assert_eq!(gps_status(&payload(0x10, 253, 0x00)).0, "green");
    }

    #[test]
    fn test_old_style_degraded() {
        assert_eq!(gps_status(&payload(0x10, 50, 0x00)).0, "amber");
    }

    #[test]
    fn test_new_style_gps_time_good() {
        // New format, FPGA on GPS time, degradation small.
        assert_eq!(gps_status(&payload(0x10, 0, 0x80 | 0x10)).0, "green");
    }

    #[test]
    fn test_new_style_gps_time_degraded() {
        assert_eq!(gps_status(&payload(0x10, 0, 0x80)).0, "amber");
    }

    #[test]
    fn test_new_style_no_satellites() {
        let (color, message) = gps_status(&payload(0x10, 0, 0x80 | 0x20 | 0x08 | 0x01));
        assert_eq!(color, "red");
        assert!(message.contains("Not tracking any satellites"));
    }

    #[test]
    fn test_new_style_insufficient_satellites() {
        let (color, message) = gps_status(&payload(0x10, 0, 0x80 | 0x20 | 0x08 | 0x02 | 0x01));
        assert_eq!(color, "red");
        assert!(message.contains("Not tracking sufficient satellites"));
    }

    #[test]
    fn test_new_style_antenna_fault() {
        let (_, message) = gps_status(&payload(0x10, 0, 0x80 | 0x20 | 0x08 | 0x02 | 0x04));
        assert!(message.contains("Antenna fault"));
    }

    #[test]
    fn test_new_style_multiple_faults_joined() {
        let (_, message) = gps_status(&payload(0x10, 0, 0x80 | 0x20));
        assert!(message.contains("; "));
    }

    #[test]
    fn test_new_style_unrecognized_fault() {
        let (color, message) = gps_status(&payload(0x10, 0, 0x80 | 0x20 | 0x08 | 0x02 | 0x04 | 0x01));
        assert_eq!(color, "red");
        assert_eq!(message, "Unrecognized GPS fault");
    }
}
