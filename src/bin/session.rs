use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use droidlab::app::adb::runner::{CommandRunner, ProcessRunner};
use droidlab::app::config::load_config;
use droidlab::app::device::lifecycle::DeviceController;
use droidlab::app::device::DeviceKind;
use droidlab::app::logging::init_logging;
use droidlab::app::report::{FileReporter, SessionReporter};
use droidlab::app::session::{AnalysisSession, AnalysisType};

#[derive(Debug, Clone)]
struct Args {
    name: String,
    identifier: i64,
    apk_path: PathBuf,
    package: String,
    backup_dir: Option<PathBuf>,
    emulated: bool,
    analysis_type: AnalysisType,
    clean: bool,
    wait_operator: bool,
    report_path: PathBuf,
    description: String,
}

fn usage() -> &'static str {
    "Usage: session --name <serial-or-avd> --id <port-or-index> --apk <path> --package <pkg>\n\
     \x20       [--backup <dir>] [--emulated] [--type manual|automatic]\n\
     \x20       [--no-clean] [--wait-operator] [--report <file>] [--description <text>]"
}

fn parse_args() -> Result<Args, String> {
    let mut name: Option<String> = None;
    let mut identifier: Option<i64> = None;
    let mut apk_path: Option<PathBuf> = None;
    let mut package: Option<String> = None;
    let mut backup_dir: Option<PathBuf> = None;
    let mut emulated = false;
    let mut analysis_type = AnalysisType::Automatic;
    let mut clean = true;
    let mut wait_operator = false;
    let mut report_path = PathBuf::from("report.jsonl");
    let mut description = String::new();

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--name" => {
                name = it
                    .next()
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty());
                if name.is_none() {
                    return Err("--name requires a value".to_string());
                }
            }
            "--id" => {
                let value = it.next().ok_or_else(|| "--id requires a value".to_string())?;
                identifier = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| format!("--id must be an integer, got `{value}`"))?,
                );
            }
            "--apk" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--apk requires a value".to_string())?;
                apk_path = Some(PathBuf::from(value));
            }
            "--package" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--package requires a value".to_string())?;
                package = Some(value);
            }
            "--backup" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--backup requires a value".to_string())?;
                backup_dir = Some(PathBuf::from(value));
            }
            "--emulated" => {
                emulated = true;
            }
            "--type" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--type requires a value".to_string())?;
                analysis_type = value.parse::<AnalysisType>().map_err(|err| err.error)?;
            }
            "--no-clean" => {
                clean = false;
            }
            "--wait-operator" => {
                wait_operator = true;
            }
            "--report" => {
                let value = it
                    .next()
                    .ok_or_else(|| "--report requires a value".to_string())?;
                report_path = PathBuf::from(value);
            }
            "--description" => {
                description = it
                    .next()
                    .ok_or_else(|| "--description requires a value".to_string())?;
            }
            "--help" | "-h" => {
                return Err(usage().to_string());
            }
            other => {
                return Err(format!("Unknown argument `{other}`\n{}", usage()));
            }
        }
    }

    Ok(Args {
        name: name.ok_or_else(|| format!("--name is required\n{}", usage()))?,
        identifier: identifier.ok_or_else(|| format!("--id is required\n{}", usage()))?,
        apk_path: apk_path.ok_or_else(|| format!("--apk is required\n{}", usage()))?,
        package: package.ok_or_else(|| format!("--package is required\n{}", usage()))?,
        backup_dir,
        emulated,
        analysis_type,
        clean,
        wait_operator,
        report_path,
        description,
    })
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config()?;
    let trace_id = Uuid::new_v4().to_string();
    let kind = if args.emulated {
        DeviceKind::Emulated
    } else {
        DeviceKind::Physical
    };

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let controller = DeviceController::new(runner, &config, &trace_id)?;
    let reporter: Arc<dyn SessionReporter> = Arc::new(FileReporter::new(&args.report_path));
    let session = AnalysisSession::new(
        reporter,
        config.reporting.clone(),
        args.analysis_type,
        &trace_id,
    );

    let mut handle = controller.create(
        kind,
        args.identifier,
        &args.name,
        args.backup_dir.as_deref(),
    )?;
    info!(trace_id = %trace_id, device = %handle.name, "device ready");

    let start = session.begin(
        &args.apk_path,
        &args.package,
        &handle.name,
        &args.description,
    )?;
    controller.deploy_configuration(&handle, &start.agent_config)?;

    if args.analysis_type == AnalysisType::Automatic {
        controller.stimulate(&handle, &args.package)?;
    }

    if args.wait_operator {
        // Pressing Enter releases the wait; the reader thread flips the
        // cancellation token the controller polls.
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);
        std::thread::spawn(move || {
            eprintln!("Press Enter when you are done with the device.");
            let mut line = String::new();
            let _ = std::io::stdin().read_line(&mut line);
            flag.store(true, Ordering::Relaxed);
        });
        controller.wait_until_operator_done(&handle, &cancel);
    }

    if !args.clean {
        warn!(trace_id = %trace_id, device = %handle.name, "restore skipped, device will stay dirty");
    }
    controller.stop(&mut handle, args.clean)?;
    info!(
        trace_id = %trace_id,
        experiment_id = %start.experiment_id,
        "session finished, report at {}",
        args.report_path.display()
    );
    Ok(())
}

fn main() {
    init_logging();
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };
    if let Err(err) = run(args) {
        eprintln!("session failed: {err}");
        std::process::exit(1);
    }
}
