use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::app::adb::probe::wait_for_device_ready;
use crate::app::adb::runner::CommandRunner;
use crate::app::config::{AppConfig, StimulationSettings, TimingSettings};
use crate::app::device::backup::BackupSource;
use crate::app::device::{DeviceHandle, DeviceKind, DeviceState};
use crate::app::error::AppError;

/// Staging directory owned by the agent on device external storage.
pub const DEVICE_WORK_DIR: &str = "/sdcard/droidlab";
/// Fixed path the on-device agent reads its configuration from.
pub const AGENT_CONFIG_PATH: &str = "/sdcard/droidlab/experiment.conf";

const DEVICE_BACKUP_DIR: &str = "/sdcard/droidlab/backup";
const RECOVERY_SCRIPT_STAGING: &str = "/sdcard/droidlab/openrecoveryscript";
const RECOVERY_SCRIPT_TARGET: &str = "/cache/recovery/openrecoveryscript";
const RECOVERY_RESTORE_LINE: &str = "restore /sdcard/droidlab/backup/";
const SDCARD_ROOT: &str = "/sdcard/";

/// Sequences every operation that changes a device's observable state.
///
/// One controller drives one handle; operations are strictly sequential and
/// blocking, so handles for different devices can be driven from independent
/// controllers without shared state.
pub struct DeviceController {
    runner: Arc<dyn CommandRunner>,
    adb_program: String,
    timings: TimingSettings,
    stimulation: StimulationSettings,
    command_timeout: Duration,
    transfer_timeout: Duration,
    agent_package: String,
    results_dir: PathBuf,
    trace_id: String,
}

impl std::fmt::Debug for DeviceController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceController")
            .field("adb_program", &self.adb_program)
            .field("timings", &self.timings)
            .field("stimulation", &self.stimulation)
            .field("command_timeout", &self.command_timeout)
            .field("transfer_timeout", &self.transfer_timeout)
            .field("agent_package", &self.agent_package)
            .field("results_dir", &self.results_dir)
            .field("trace_id", &self.trace_id)
            .finish_non_exhaustive()
    }
}

impl DeviceController {
    /// Fails up front when the configured adb path does not point at an
    /// executable, before any handle exists to issue commands through.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        config: &AppConfig,
        trace_id: &str,
    ) -> Result<Self, AppError> {
        let adb_program = crate::app::adb::locator::resolve_adb_program(&config.adb.command_path);
        crate::app::adb::locator::validate_adb_program(&adb_program)
            .map_err(|message| AppError::invalid_argument(message, trace_id))?;
        let results_dir = if config.results_dir.trim().is_empty() {
            PathBuf::from("results")
        } else {
            PathBuf::from(&config.results_dir)
        };
        Ok(Self {
            runner,
            adb_program,
            timings: config.timings.clone(),
            stimulation: config.stimulation.clone(),
            command_timeout: Duration::from_secs(config.adb.command_timeout_secs),
            transfer_timeout: Duration::from_secs(config.adb.transfer_timeout_secs),
            agent_package: config.agent_package.clone(),
            results_dir,
            trace_id: trace_id.to_string(),
        })
    }

    /// Validates the arguments, opens the backup source when one is required,
    /// and provisions the device. No device command is issued before every
    /// validation has passed.
    pub fn create(
        &self,
        kind: DeviceKind,
        identifier: i64,
        name: &str,
        backup_dir: Option<&Path>,
    ) -> Result<DeviceHandle, AppError> {
        if identifier < 0 {
            return Err(AppError::invalid_argument(
                format!("Cannot create a device with identifier {identifier}; it must be >= 0"),
                &self.trace_id,
            ));
        }
        if name.trim().is_empty() {
            return Err(AppError::invalid_argument(
                "Cannot create a device without a name",
                &self.trace_id,
            ));
        }

        let backup = match (kind, backup_dir) {
            (DeviceKind::Physical, Some(dir)) => Some(BackupSource::open(dir, &self.trace_id)?),
            (DeviceKind::Physical, None) => {
                return Err(AppError::backup_source(
                    format!("Physical device {name} requires a backup source"),
                    &self.trace_id,
                ));
            }
            (DeviceKind::Emulated, Some(dir)) => Some(BackupSource::open(dir, &self.trace_id)?),
            (DeviceKind::Emulated, None) => None,
        };

        debug!(trace_id = %self.trace_id, name = %name, kind = %kind, "creating device handle");
        let mut handle = DeviceHandle::new(identifier, name.to_string(), kind, backup);

        match kind {
            DeviceKind::Physical => {
                // Already booted; there is no filesystem preparation to wait on.
                handle.advance(DeviceState::Started, &self.trace_id)?;
            }
            DeviceKind::Emulated => {
                handle.advance(DeviceState::Starting, &self.trace_id)?;
                self.wait_ready(&handle)?;
                handle.advance(DeviceState::Started, &self.trace_id)?;
            }
        }

        self.check_agent_installed(&handle)?;
        Ok(handle)
    }

    /// Pushes the rendered agent configuration to its fixed path on external
    /// storage. A corrupt or missing configuration invalidates the whole
    /// experiment, so a failed push is surfaced rather than retried.
    pub fn deploy_configuration(
        &self,
        handle: &DeviceHandle,
        content: &str,
    ) -> Result<(), AppError> {
        self.require_state(handle, DeviceState::Started, "deploy_configuration")?;
        debug!(
            trace_id = %self.trace_id,
            device = %handle.name,
            "deploying agent configuration:\n{content}"
        );

        let staged = tempfile::NamedTempFile::new().map_err(|err| {
            AppError::system(format!("Failed to stage configuration: {err}"), &self.trace_id)
        })?;
        std::fs::write(staged.path(), content).map_err(|err| {
            AppError::system(format!("Failed to stage configuration: {err}"), &self.trace_id)
        })?;

        let args = self.adb_args(
            handle,
            &[
                "push",
                &staged.path().to_string_lossy(),
                AGENT_CONFIG_PATH,
            ],
        );
        self.runner
            .run(&self.adb_program, &args, self.transfer_timeout, &self.trace_id)
            .map_err(|err| {
                AppError::config_deploy(
                    format!("Failed to deploy agent configuration: {}", err.error),
                    &self.trace_id,
                )
            })?;
        Ok(())
    }

    /// Drives the package with the monkey fuzzer. Blocks until the generator
    /// process exits; the events it provokes are reported out-of-band by the
    /// on-device agent.
    pub fn stimulate(&self, handle: &DeviceHandle, package_name: &str) -> Result<(), AppError> {
        if package_name.trim().is_empty() {
            return Err(AppError::invalid_argument(
                "Cannot stimulate a package without a name",
                &self.trace_id,
            ));
        }
        self.require_state(handle, DeviceState::Started, "stimulate")?;

        info!(
            trace_id = %self.trace_id,
            device = %handle.name,
            package = %package_name,
            "stimulating package with monkey"
        );
        let event_count = self.stimulation.event_count.to_string();
        let throttle = self.stimulation.throttle_ms.to_string();
        let args = self.adb_args(
            handle,
            &[
                "shell",
                "monkey",
                "-p",
                package_name,
                "-v",
                &event_count,
                "--throttle",
                &throttle,
                "--ignore-timeouts",
            ],
        );
        let generator = self
            .runner
            .run_async(&self.adb_program, &args, &self.trace_id)?;
        let output = generator.communicate()?;
        debug!(trace_id = %self.trace_id, device = %handle.name, "monkey output: {}", output.stdout);
        Ok(())
    }

    /// Reboots the device and waits for it to come back. The handle re-enters
    /// `Starting` for the duration and only returns to `Started` once the
    /// readiness probe succeeds.
    pub fn reboot(&self, handle: &mut DeviceHandle) -> Result<(), AppError> {
        self.require_state(handle, DeviceState::Started, "reboot")?;
        info!(trace_id = %self.trace_id, device = %handle.name, "rebooting device");

        let args = self.adb_args(handle, &["reboot"]);
        self.runner
            .run(&self.adb_program, &args, self.command_timeout, &self.trace_id)?;
        handle.advance(DeviceState::Starting, &self.trace_id)?;

        let settle = match handle.kind {
            DeviceKind::Physical => self.timings.reboot_settle_ms,
            DeviceKind::Emulated => self.timings.emulator_settle_ms,
        };
        std::thread::sleep(Duration::from_millis(settle));

        self.wait_ready(handle)?;
        handle.advance(DeviceState::Started, &self.trace_id)?;
        Ok(())
    }

    /// Tears the session down. Pulls result artifacts (best-effort), then
    /// either leaves the device dirty (`clean == false`, operator opt-out) or
    /// runs the recovery-flash restore choreography. Steps are strictly
    /// ordered; no step begins before the previous command returns.
    pub fn stop(&self, handle: &mut DeviceHandle, clean: bool) -> Result<(), AppError> {
        self.require_state(handle, DeviceState::Started, "stop")?;
        info!(trace_id = %self.trace_id, device = %handle.name, clean = clean, "stopping device");
        handle.advance(DeviceState::Stopping, &self.trace_id)?;

        // Losing telemetry must never cost us the ability to clean the
        // device, so a failed pull is only a warning.
        if let Err(err) = self.pull_results(handle) {
            warn!(
                trace_id = %self.trace_id,
                device = %handle.name,
                error = %err,
                "failed to pull result artifacts, continuing teardown"
            );
        }

        if !clean {
            info!(trace_id = %self.trace_id, device = %handle.name, "leaving device dirty by operator choice");
            handle.advance(DeviceState::Stopped, &self.trace_id)?;
            return Ok(());
        }

        if handle.kind == DeviceKind::Emulated {
            // Emulated images are restored from snapshots outside this
            // controller; the clean request degrades to the dirty path.
            debug!(trace_id = %self.trace_id, device = %handle.name, "emulated device, skipping restore");
            handle.advance(DeviceState::Stopped, &self.trace_id)?;
            return Ok(());
        }

        self.push_backup(handle)?;
        self.push_recovery_script(handle)?;

        let args = self.adb_args(handle, &["reboot", "recovery"]);
        self.runner
            .run(&self.adb_program, &args, self.command_timeout, &self.trace_id)?;
        std::thread::sleep(Duration::from_millis(self.timings.recovery_settle_ms));
        self.wait_ready(handle)?;

        // The sdcard takes a moment to mount after the recovery flash.
        std::thread::sleep(Duration::from_millis(self.timings.sdcard_mount_settle_ms));
        self.restore_sdcard(handle)?;

        handle.advance(DeviceState::Stopped, &self.trace_id)?;
        Ok(())
    }

    /// Blocks until the operator signals completion through the cancellation
    /// token. Used when the teardown decision is a manual action.
    pub fn wait_until_operator_done(&self, handle: &DeviceHandle, cancel: &AtomicBool) {
        if handle.kind != DeviceKind::Physical {
            debug!(trace_id = %self.trace_id, device = %handle.name, "operator wait only applies to physical devices");
            return;
        }
        while !cancel.load(Ordering::Relaxed) {
            debug!(
                trace_id = %self.trace_id,
                device = %handle.name,
                "waiting for the operator to finish with the device"
            );
            std::thread::sleep(self.timings.operator_poll());
        }
        debug!(trace_id = %self.trace_id, device = %handle.name, "operator is done");
    }

    fn wait_ready(&self, handle: &DeviceHandle) -> Result<(), AppError> {
        wait_for_device_ready(
            self.runner.as_ref(),
            &self.adb_program,
            &handle.serial(),
            self.timings.boot_poll_interval(),
            self.timings.boot_max_wait(),
            &self.trace_id,
        )
    }

    /// The agent is what forwards captured events; a session without it would
    /// silently record nothing, so its absence fails the handle construction.
    fn check_agent_installed(&self, handle: &DeviceHandle) -> Result<(), AppError> {
        let args = self.adb_args(handle, &["shell", "pm", "path", &self.agent_package]);
        // Some shells propagate pm's nonzero exit for an unknown package, so
        // a failed query means the same thing as an empty listing.
        let installed = match self
            .runner
            .run(&self.adb_program, &args, self.command_timeout, &self.trace_id)
        {
            Ok(output) => !output.stdout.trim().is_empty(),
            Err(_) => false,
        };
        if !installed {
            return Err(AppError::agent_missing(
                format!(
                    "Instrumentation agent {} is not installed on {}",
                    self.agent_package, handle.name
                ),
                &self.trace_id,
            ));
        }
        Ok(())
    }

    fn pull_results(&self, handle: &DeviceHandle) -> Result<(), AppError> {
        let destination = self.results_dir.join(&handle.name);
        std::fs::create_dir_all(&destination).map_err(|err| {
            AppError::system(
                format!("Failed to create results dir {}: {err}", destination.display()),
                &self.trace_id,
            )
        })?;
        let args = self.adb_args(
            handle,
            &["pull", DEVICE_WORK_DIR, &destination.to_string_lossy()],
        );
        self.runner
            .run(&self.adb_program, &args, self.transfer_timeout, &self.trace_id)?;
        Ok(())
    }

    fn push_backup(&self, handle: &DeviceHandle) -> Result<(), AppError> {
        let backup = self.require_backup(handle)?;
        info!(trace_id = %self.trace_id, device = %handle.name, "pushing partitions backup to staging");
        let args = self.adb_args(
            handle,
            &[
                "push",
                &backup.partitions_dir().to_string_lossy(),
                DEVICE_BACKUP_DIR,
            ],
        );
        self.runner
            .run(&self.adb_program, &args, self.transfer_timeout, &self.trace_id)?;
        Ok(())
    }

    /// Stages the single-line recovery script on the sdcard, then copies it
    /// into the recovery-controlled path with elevated privileges. The
    /// privileged shell does not propagate exit codes reliably, so ANY output
    /// from the copy is treated as failure.
    fn push_recovery_script(&self, handle: &DeviceHandle) -> Result<(), AppError> {
        let touch = self.adb_args(handle, &["shell", "touch", RECOVERY_SCRIPT_STAGING]);
        self.runner
            .run(&self.adb_program, &touch, self.command_timeout, &self.trace_id)?;

        let write = self.adb_args(
            handle,
            &[
                "shell",
                &format!("echo '{RECOVERY_RESTORE_LINE}' > {RECOVERY_SCRIPT_STAGING}"),
            ],
        );
        self.runner
            .run(&self.adb_program, &write, self.command_timeout, &self.trace_id)?;

        let copy = self.adb_args(
            handle,
            &[
                "shell",
                "su",
                "-c",
                &format!("busybox cp {RECOVERY_SCRIPT_STAGING} {RECOVERY_SCRIPT_TARGET}"),
            ],
        );
        let output = self
            .runner
            .run(&self.adb_program, &copy, self.command_timeout, &self.trace_id)?;
        if !output.stdout.trim().is_empty() {
            return Err(AppError::recovery_script(
                format!(
                    "Privileged copy of the recovery script produced output: {}",
                    output.stdout.trim()
                ),
                &self.trace_id,
            ));
        }
        Ok(())
    }

    /// Restores external storage from the backup. Top-level entries are
    /// cleared selectively: only entries whose own listing reports content
    /// are deleted, which spares inaccessible system entries, then the full
    /// pristine tree is pushed over the cleared destination.
    fn restore_sdcard(&self, handle: &DeviceHandle) -> Result<(), AppError> {
        let backup = self.require_backup(handle)?;
        info!(trace_id = %self.trace_id, device = %handle.name, "restoring sdcard");

        let ls_root = self.adb_args(handle, &["shell", "ls", SDCARD_ROOT]);
        let listing = self
            .runner
            .run(&self.adb_program, &ls_root, self.command_timeout, &self.trace_id)?;

        for entry in listing.stdout.lines() {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let path = format!("{SDCARD_ROOT}{entry}");
            let ls_entry = self.adb_args(handle, &["shell", "ls", &path]);
            let contents = self
                .runner
                .run(&self.adb_program, &ls_entry, self.command_timeout, &self.trace_id)?;
            if contents.stdout.trim().is_empty() {
                continue;
            }
            info!(trace_id = %self.trace_id, device = %handle.name, path = %path, "deleting sdcard entry");
            let rm = self.adb_args(handle, &["shell", "rm", "-r", &path]);
            self.runner
                .run(&self.adb_program, &rm, self.command_timeout, &self.trace_id)?;
        }

        let push = self.adb_args(
            handle,
            &[
                "push",
                &backup.sdcard_dir().to_string_lossy(),
                SDCARD_ROOT,
            ],
        );
        self.runner
            .run(&self.adb_program, &push, self.transfer_timeout, &self.trace_id)?;
        info!(trace_id = %self.trace_id, device = %handle.name, "sdcard has been restored");
        Ok(())
    }

    fn require_backup<'a>(&self, handle: &'a DeviceHandle) -> Result<&'a BackupSource, AppError> {
        handle.backup().ok_or_else(|| {
            AppError::backup_source(
                format!("Device {} has no backup source", handle.name),
                &self.trace_id,
            )
        })
    }

    fn require_state(
        &self,
        handle: &DeviceHandle,
        expected: DeviceState,
        operation: &str,
    ) -> Result<(), AppError> {
        if handle.state() != expected {
            return Err(AppError::state(
                format!(
                    "{operation} requires a {expected} device, but {} is {}",
                    handle.name,
                    handle.state()
                ),
                &self.trace_id,
            ));
        }
        Ok(())
    }

    fn adb_args(&self, handle: &DeviceHandle, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["-s".to_string(), handle.serial()];
        args.extend(rest.iter().map(|arg| arg.to_string()));
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::adb::runner::{render_argv, CommandOutput, CommandWait};
    use crate::app::config::AppConfig;
    use std::collections::HashMap;
    use std::fs;
    use std::fs::File;
    use std::sync::Mutex;

    /// Scripted runner double. Records every rendered argv and replies from
    /// a per-argv queue; the last reply of a queue is sticky so poll loops
    /// keep seeing it. Unknown argvs succeed with empty output, unless they
    /// contain a substring registered with `fail_containing`.
    struct FakeRunner {
        calls: Mutex<Vec<String>>,
        replies: Mutex<HashMap<String, (usize, Vec<CommandOutput>)>>,
        failures: Mutex<Vec<String>>,
    }

    struct FakeWait {
        output: CommandOutput,
    }

    impl CommandWait for FakeWait {
        fn communicate(self: Box<Self>) -> Result<CommandOutput, AppError> {
            Ok(self.output)
        }
    }

    impl FakeRunner {
        fn new() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                replies: Mutex::new(HashMap::new()),
                failures: Mutex::new(Vec::new()),
            }
        }

        fn reply(&self, argv: &str, stdout: &str) {
            let mut replies = self.replies.lock().expect("replies lock");
            replies
                .entry(argv.to_string())
                .or_insert_with(|| (0, Vec::new()))
                .1
                .push(CommandOutput {
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                    exit_code: Some(0),
                });
        }

        fn fail_containing(&self, needle: &str) {
            self.failures
                .lock()
                .expect("failures lock")
                .push(needle.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }

        fn next_output(&self, rendered: &str) -> CommandOutput {
            let mut replies = self.replies.lock().expect("replies lock");
            match replies.get_mut(rendered) {
                Some((cursor, queue)) => {
                    let output = queue[(*cursor).min(queue.len() - 1)].clone();
                    *cursor += 1;
                    output
                }
                None => CommandOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: Some(0),
                },
            }
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(
            &self,
            program: &str,
            args: &[String],
            _timeout: Duration,
            trace_id: &str,
        ) -> Result<CommandOutput, AppError> {
            let rendered = render_argv(program, args);
            self.calls.lock().expect("calls lock").push(rendered.clone());
            let failing = self
                .failures
                .lock()
                .expect("failures lock")
                .iter()
                .any(|needle| rendered.contains(needle));
            if failing {
                return Err(AppError::command(
                    format!("Command failed: `{rendered}`"),
                    trace_id,
                ));
            }
            Ok(self.next_output(&rendered))
        }

        fn run_async(
            &self,
            program: &str,
            args: &[String],
            _trace_id: &str,
        ) -> Result<Box<dyn CommandWait>, AppError> {
            let rendered = render_argv(program, args);
            self.calls.lock().expect("calls lock").push(rendered.clone());
            Ok(Box::new(FakeWait {
                output: self.next_output(&rendered),
            }))
        }
    }

    fn fast_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.timings.boot_poll_interval_ms = 1;
        config.timings.boot_max_wait_ms = 50;
        config.timings.reboot_settle_ms = 1;
        config.timings.emulator_settle_ms = 1;
        config.timings.recovery_settle_ms = 1;
        config.timings.sdcard_mount_settle_ms = 1;
        config.timings.operator_poll_ms = 1;
        config
    }

    fn controller_with(runner: &Arc<FakeRunner>, config: &mut AppConfig) -> DeviceController {
        config.results_dir = std::env::temp_dir()
            .join(format!("droidlab-test-{}", uuid::Uuid::new_v4()))
            .to_string_lossy()
            .to_string();
        DeviceController::new(
            Arc::clone(runner) as Arc<dyn CommandRunner>,
            config,
            "trace-test",
        )
        .expect("controller")
    }

    fn backup_fixture() -> tempfile::TempDir {
        let dir = tempfile::TempDir::new().expect("backup dir");
        fs::create_dir(dir.path().join("sdcard")).expect("sdcard");
        fs::create_dir(dir.path().join("partitions")).expect("partitions");
        File::create(dir.path().join("sdcard/a.txt")).expect("a.txt");
        File::create(dir.path().join("partitions/system.img")).expect("system.img");
        dir
    }

    fn agent_reply(runner: &FakeRunner, serial: &str) {
        runner.reply(
            &format!("adb -s {serial} shell pm path com.droidlab.agent"),
            "package:/data/app/com.droidlab.agent/base.apk\n",
        );
    }

    fn started_physical(
        runner: &Arc<FakeRunner>,
        controller: &DeviceController,
        backup: &tempfile::TempDir,
    ) -> DeviceHandle {
        agent_reply(runner, "dev1");
        controller
            .create(DeviceKind::Physical, 5001, "dev1", Some(backup.path()))
            .expect("physical handle")
    }

    #[test]
    fn controller_rejects_nonexistent_adb_path() {
        let runner = Arc::new(FakeRunner::new());
        let mut config = fast_config();
        config.adb.command_path = "/this/path/should/not/exist/adb".to_string();
        let err = DeviceController::new(
            Arc::clone(&runner) as Arc<dyn CommandRunner>,
            &config,
            "trace-test",
        )
        .expect_err("bad adb path");
        assert_eq!(err.code, "ERR_INVALID_ARGUMENT");
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn failed_agent_query_reports_agent_missing() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        runner.fail_containing("pm path");
        let err = controller
            .create(DeviceKind::Physical, 5001, "dev1", Some(backup.path()))
            .expect_err("query failed");
        assert_eq!(err.code, "ERR_AGENT_MISSING");
    }

    #[test]
    fn create_rejects_negative_identifier_without_commands() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let err = controller
            .create(DeviceKind::Physical, -1, "dev1", None)
            .expect_err("negative identifier");
        assert_eq!(err.code, "ERR_INVALID_ARGUMENT");
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn create_rejects_empty_name() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let err = controller
            .create(DeviceKind::Emulated, 5554, "  ", None)
            .expect_err("empty name");
        assert_eq!(err.code, "ERR_INVALID_ARGUMENT");
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn create_physical_requires_backup_source() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let err = controller
            .create(DeviceKind::Physical, 5001, "dev1", None)
            .expect_err("no backup");
        assert_eq!(err.code, "ERR_BACKUP_SOURCE");
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn create_physical_enters_started() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        let handle = started_physical(&runner, &controller, &backup);
        assert_eq!(handle.state(), DeviceState::Started);
        assert_eq!(handle.serial(), "dev1");
        assert_eq!(handle.identifier, 5001);
    }

    #[test]
    fn create_fails_when_agent_is_missing() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        // Default empty reply for `pm path` means the package is absent.
        let err = controller
            .create(DeviceKind::Physical, 5001, "dev1", Some(backup.path()))
            .expect_err("agent missing");
        assert_eq!(err.code, "ERR_AGENT_MISSING");
    }

    #[test]
    fn create_emulated_waits_for_boot() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        runner.reply("adb -s emulator-5554 shell getprop sys.boot_completed", "0\n");
        runner.reply("adb -s emulator-5554 shell getprop sys.boot_completed", "1\n");
        agent_reply(&runner, "emulator-5554");
        let handle = controller
            .create(DeviceKind::Emulated, 5554, "avd-test", None)
            .expect("emulated handle");
        assert_eq!(handle.state(), DeviceState::Started);
        assert_eq!(handle.serial(), "emulator-5554");
    }

    #[test]
    fn create_emulated_times_out_when_never_ready() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        runner.reply("adb -s emulator-5554 shell getprop sys.boot_completed", "0\n");
        let err = controller
            .create(DeviceKind::Emulated, 5554, "avd-test", None)
            .expect_err("never ready");
        assert_eq!(err.code, "ERR_DEVICE_NOT_READY");
    }

    #[test]
    fn deploy_configuration_pushes_to_fixed_path() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        let handle = started_physical(&runner, &controller, &backup);
        controller
            .deploy_configuration(&handle, "[analysis]\nidXP=demo\n")
            .expect("deploy");
        let push = runner
            .calls()
            .into_iter()
            .find(|call| call.contains(" push "))
            .expect("a push was issued");
        assert!(push.ends_with(AGENT_CONFIG_PATH));
    }

    #[test]
    fn deploy_configuration_surfaces_push_failure() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        let handle = started_physical(&runner, &controller, &backup);
        runner.fail_containing(AGENT_CONFIG_PATH);
        let err = controller
            .deploy_configuration(&handle, "content")
            .expect_err("push failed");
        assert_eq!(err.code, "ERR_CONFIG_DEPLOY");
    }

    #[test]
    fn deploy_configuration_refused_off_started() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        let mut handle = started_physical(&runner, &controller, &backup);
        controller.stop(&mut handle, false).expect("stop");
        let err = controller
            .deploy_configuration(&handle, "content")
            .expect_err("wrong state");
        assert_eq!(err.code, "ERR_STATE");
    }

    #[test]
    fn stimulate_rejects_empty_package() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        let handle = started_physical(&runner, &controller, &backup);
        let err = controller
            .stimulate(&handle, "")
            .expect_err("empty package");
        assert_eq!(err.code, "ERR_INVALID_ARGUMENT");
    }

    #[test]
    fn stimulate_runs_monkey_with_budget_and_throttle() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        let handle = started_physical(&runner, &controller, &backup);
        controller
            .stimulate(&handle, "com.example.victim")
            .expect("stimulate");
        let monkey = runner
            .calls()
            .into_iter()
            .find(|call| call.contains("monkey"))
            .expect("monkey invoked");
        assert_eq!(
            monkey,
            "adb -s dev1 shell monkey -p com.example.victim -v 500 --throttle 6000 --ignore-timeouts"
        );
        assert_eq!(handle.state(), DeviceState::Started);
    }

    #[test]
    fn stimulate_refused_on_stopped_handle() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        let mut handle = started_physical(&runner, &controller, &backup);
        controller.stop(&mut handle, false).expect("stop");
        let err = controller
            .stimulate(&handle, "com.example.victim")
            .expect_err("stopped handle");
        assert_eq!(err.code, "ERR_STATE");
    }

    #[test]
    fn reboot_settles_and_returns_to_started() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        let mut handle = started_physical(&runner, &controller, &backup);
        runner.reply("adb -s dev1 shell getprop sys.boot_completed", "1\n");
        controller.reboot(&mut handle).expect("reboot");
        assert_eq!(handle.state(), DeviceState::Started);
        let calls = runner.calls();
        let reboot_at = calls
            .iter()
            .position(|call| call == "adb -s dev1 reboot")
            .expect("reboot issued");
        let probe_at = calls
            .iter()
            .position(|call| call.contains("sys.boot_completed"))
            .expect("probe issued");
        assert!(reboot_at < probe_at);
    }

    #[test]
    fn reboot_timeout_leaves_handle_starting() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        let mut handle = started_physical(&runner, &controller, &backup);
        runner.reply("adb -s dev1 shell getprop sys.boot_completed", "0\n");
        let err = controller.reboot(&mut handle).expect_err("never ready");
        assert_eq!(err.code, "ERR_DEVICE_NOT_READY");
        assert_eq!(handle.state(), DeviceState::Starting);
    }

    #[test]
    fn stop_dirty_never_touches_restore_machinery() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        let mut handle = started_physical(&runner, &controller, &backup);
        controller.stop(&mut handle, false).expect("dirty stop");
        assert_eq!(handle.state(), DeviceState::Stopped);
        let calls = runner.calls();
        assert!(calls.iter().any(|call| call.contains(" pull ")));
        assert!(!calls.iter().any(|call| call.contains(" push ")));
        assert!(!calls.iter().any(|call| call.contains("reboot recovery")));
    }

    #[test]
    fn stop_survives_a_failed_result_pull() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        let mut handle = started_physical(&runner, &controller, &backup);
        runner.fail_containing(" pull ");
        controller.stop(&mut handle, false).expect("stop proceeds");
        assert_eq!(handle.state(), DeviceState::Stopped);
    }

    #[test]
    fn stop_clean_runs_the_full_restore_choreography_in_order() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        let mut handle = started_physical(&runner, &controller, &backup);

        runner.reply("adb -s dev1 shell getprop sys.boot_completed", "1\n");
        runner.reply("adb -s dev1 shell ls /sdcard/", "old1\nold2\n");
        runner.reply("adb -s dev1 shell ls /sdcard/old1", "junk.db\n");
        runner.reply("adb -s dev1 shell ls /sdcard/old2", "");

        controller.stop(&mut handle, true).expect("clean stop");
        assert_eq!(handle.state(), DeviceState::Stopped);

        let calls = runner.calls();
        let position = |needle: &str| {
            calls
                .iter()
                .position(|call| call.contains(needle))
                .unwrap_or_else(|| panic!("expected a call containing `{needle}`"))
        };

        let push_backup = position(&format!("push {} {DEVICE_BACKUP_DIR}", backup.path().join("partitions").display()));
        let touch = position("shell touch /sdcard/droidlab/openrecoveryscript");
        let write_script = position("echo 'restore /sdcard/droidlab/backup/'");
        let privileged_copy = position("su -c busybox cp");
        let reboot_recovery = position("reboot recovery");
        let probe = position("sys.boot_completed");
        let ls_root = position("shell ls /sdcard/");
        let rm_old1 = position("rm -r /sdcard/old1");
        let push_sdcard = position(&format!("push {} {SDCARD_ROOT}", backup.path().join("sdcard").display()));

        assert!(push_backup < touch);
        assert!(touch < write_script);
        assert!(write_script < privileged_copy);
        assert!(privileged_copy < reboot_recovery);
        assert!(reboot_recovery < probe);
        assert!(probe < ls_root);
        assert!(ls_root < rm_old1);
        assert!(rm_old1 < push_sdcard);

        // Only the non-empty entry is deleted.
        assert!(!calls.iter().any(|call| call.contains("rm -r /sdcard/old2")));
    }

    #[test]
    fn restore_is_idempotent_at_the_command_level() {
        // A second clean stop over an already-pristine sdcard deletes the
        // restored entries and pushes the identical backup tree again, so
        // the resulting tree is the same.
        let backup = backup_fixture();
        let mut final_pushes = Vec::new();
        for listing in ["old1\n", "a.txt\n"] {
            let runner = Arc::new(FakeRunner::new());
            let controller = controller_with(&runner, &mut fast_config());
            let mut handle = started_physical(&runner, &controller, &backup);
            runner.reply("adb -s dev1 shell getprop sys.boot_completed", "1\n");
            runner.reply("adb -s dev1 shell ls /sdcard/", listing);
            let entry = listing.trim();
            runner.reply(
                &format!("adb -s dev1 shell ls /sdcard/{entry}"),
                &format!("{entry}\n"),
            );
            controller.stop(&mut handle, true).expect("clean stop");
            final_pushes.push(
                runner
                    .calls()
                    .into_iter()
                    .filter(|call| call.ends_with(&format!("push {} {SDCARD_ROOT}", backup.path().join("sdcard").display())))
                    .collect::<Vec<_>>(),
            );
        }
        assert_eq!(final_pushes[0], final_pushes[1]);
        assert_eq!(final_pushes[0].len(), 1);
    }

    #[test]
    fn nonempty_output_from_privileged_copy_fails_teardown() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        let mut handle = started_physical(&runner, &controller, &backup);
        runner.reply(
            "adb -s dev1 shell su -c busybox cp /sdcard/droidlab/openrecoveryscript /cache/recovery/openrecoveryscript",
            "su: permission denied\n",
        );
        let err = controller.stop(&mut handle, true).expect_err("copy failed");
        assert_eq!(err.code, "ERR_RECOVERY_SCRIPT");
        assert!(err.error.contains("permission denied"));
        // The restore never reached the recovery reboot.
        assert!(!runner.calls().iter().any(|call| call.contains("reboot recovery")));
    }

    #[test]
    fn stop_clean_on_emulated_degrades_to_dirty() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        runner.reply("adb -s emulator-5554 shell getprop sys.boot_completed", "1\n");
        agent_reply(&runner, "emulator-5554");
        let mut handle = controller
            .create(DeviceKind::Emulated, 5554, "avd-test", None)
            .expect("emulated handle");
        controller.stop(&mut handle, true).expect("stop");
        assert_eq!(handle.state(), DeviceState::Stopped);
        assert!(!runner.calls().iter().any(|call| call.contains("reboot recovery")));
    }

    #[test]
    fn operator_wait_returns_once_cancelled() {
        let runner = Arc::new(FakeRunner::new());
        let controller = controller_with(&runner, &mut fast_config());
        let backup = backup_fixture();
        let handle = started_physical(&runner, &controller, &backup);
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        let setter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            flag.store(true, Ordering::Relaxed);
        });
        controller.wait_until_operator_done(&handle, &cancel);
        setter.join().expect("join");
        assert!(cancel.load(Ordering::Relaxed));
    }
}
