use std::time::{Duration, Instant};

use tracing::debug;

use crate::app::adb::runner::CommandRunner;
use crate::app::error::AppError;

/// Timeout for a single status query; the poll loop bounds the overall wait.
const PROBE_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded-retry readiness poll.
///
/// Queries `getprop sys.boot_completed` through the runner at
/// `poll_interval` until the device answers `1`; a query that fails counts
/// as "not yet ready", since the device is usually mid-reboot when this is
/// called. Fails with `ERR_DEVICE_NOT_READY` once `max_wait` is exhausted.
pub fn wait_for_device_ready(
    runner: &dyn CommandRunner,
    adb_program: &str,
    serial: &str,
    poll_interval: Duration,
    max_wait: Duration,
    trace_id: &str,
) -> Result<(), AppError> {
    let args = vec![
        "-s".to_string(),
        serial.to_string(),
        "shell".to_string(),
        "getprop".to_string(),
        "sys.boot_completed".to_string(),
    ];

    let start = Instant::now();
    while start.elapsed() < max_wait {
        match runner.run(adb_program, &args, PROBE_COMMAND_TIMEOUT, trace_id) {
            Ok(output) if output.stdout.trim() == "1" => {
                debug!(trace_id = %trace_id, serial = %serial, "device is ready");
                return Ok(());
            }
            Ok(_) => {
                debug!(trace_id = %trace_id, serial = %serial, "device not booted yet");
            }
            Err(err) => {
                debug!(
                    trace_id = %trace_id,
                    serial = %serial,
                    error = %err,
                    "device unreachable, still waiting"
                );
            }
        }
        std::thread::sleep(poll_interval);
    }

    Err(AppError::device_not_ready(
        format!(
            "Device {} did not become ready within {}ms",
            serial,
            max_wait.as_millis()
        ),
        trace_id,
    ))
}
