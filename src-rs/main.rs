mod automation;
mod classifier;
mod config;
mod device;
mod ocr;
mod recovery;
mod session;
mod signals;
mod surface;
#[cfg(test)]
mod testing;
mod util;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;
use std::future::Future;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::thread;

use automation::Automation;
use classifier::{crop, mean_rgb, preprocess, RegionClassifier};
use config::{LoopConfig, Region, RegionRole, ResetFailurePolicy, DEFAULT_CONFIG_FILE};
use device::{connect, Backend, ConnectOptions};
use ocr::{TesseractCli, TextRecognizer};
use session::{Control, ControlHandle, Session};
use signals::{parse_amount, parse_timer_seconds, MarkerSet};
use surface::Surface;
use util::{
    abs_path, default_sidecar_for, ensure_parent_dir, out_root, round_to, timestamp_compact,
    timestamp_iso, write_json_pretty,
};

#[derive(Parser, Debug)]
#[command(
    name = "tap-loop",
    version,
    about = "Screenshot-driven tap automation for Android screens"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print supported commands in JSON
    Commands,
    /// Run the capture/classify/tap loop until completion or stop
    Run(RunArgs),
    /// Capture one screenshot from the device and emit a metadata sidecar
    Capture(CaptureArgs),
    /// Run the color and OCR classifiers on a region of an image file
    Classify(ClassifyArgs),
    /// Inject a single tap (coordinate testing)
    Tap(TapArgs),
    /// Print the effective configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct DeviceArgs {
    /// Device backend
    #[arg(long, value_enum, default_value_t = Backend::Adb)]
    backend: Backend,
    /// adb device serial (adb backend)
    #[arg(long)]
    serial: Option<String>,
    /// adb executable (adb backend)
    #[arg(long)]
    adb_bin: Option<String>,
    /// Temporary screenshot file on the device (shell backend)
    #[arg(long)]
    screenshot_path: Option<PathBuf>,
}

impl DeviceArgs {
    fn options(&self) -> ConnectOptions {
        ConnectOptions {
            serial: self.serial.clone(),
            adb_binary: self.adb_bin.clone(),
            screenshot_path: self.screenshot_path.clone(),
        }
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    device: DeviceArgs,
    /// JSON configuration file (missing keys use defaults)
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// App package to bring to the foreground before starting
    #[arg(long)]
    package: Option<String>,
    /// Seconds to wait for a manual app switch when no package is set
    #[arg(long)]
    grace_secs: Option<u64>,
    /// What a failed mid-run reset does
    #[arg(long, value_enum)]
    mid_run_reset_failure: Option<ResetFailurePolicy>,
    /// Upper bound on reset cycles per reset
    #[arg(long)]
    max_reset_attempts: Option<u32>,
    /// Run without text recognition
    #[arg(long, action = ArgAction::SetTrue)]
    no_ocr: bool,
    /// Tesseract executable
    #[arg(long, default_value = "tesseract")]
    tesseract: String,
    /// Run report path (default: <out>/reports/run-<ts>.json)
    #[arg(long)]
    report: Option<PathBuf>,
    /// Save every captured screenshot into this directory
    #[arg(long)]
    keep_screenshots: Option<PathBuf>,
    /// Do not read pause/stop commands from stdin
    #[arg(long, action = ArgAction::SetTrue)]
    no_stdin_control: bool,
    /// Print the run report JSON to stdout
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct CaptureArgs {
    #[command(flatten)]
    device: DeviceArgs,
    /// Output PNG path
    #[arg(long)]
    out: Option<PathBuf>,
    /// Custom metadata sidecar path (default: <out>.json)
    #[arg(long)]
    sidecar: Option<PathBuf>,
    /// Disable metadata sidecar generation
    #[arg(long, action = ArgAction::SetTrue)]
    no_sidecar: bool,
    /// Print capture metadata JSON to stdout
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
}

#[derive(Args, Debug)]
struct ClassifyArgs {
    /// Screenshot to analyze
    image: PathBuf,
    /// Configured region to read
    #[arg(long, value_enum, default_value_t = RegionRole::Button)]
    region: RegionRole,
    /// Explicit rectangle x,y,w,h (overrides --region)
    #[arg(long)]
    rect: Option<String>,
    /// JSON configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Skip text recognition
    #[arg(long, action = ArgAction::SetTrue)]
    no_ocr: bool,
    /// Tesseract executable
    #[arg(long, default_value = "tesseract")]
    tesseract: String,
    /// Write the preprocessed (binarized) crop here
    #[arg(long)]
    save_crop: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct TapArgs {
    #[command(flatten)]
    device: DeviceArgs,
    x: i32,
    y: i32,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// JSON configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Write a complete default configuration to this path and exit
    #[arg(long)]
    write_defaults: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Commands => print_commands(),
        Commands::Run(args) => command_run(args),
        Commands::Capture(args) => command_capture(args),
        Commands::Classify(args) => command_classify(args),
        Commands::Tap(args) => command_tap(args),
        Commands::Config(args) => command_config(args),
    }
}

fn print_commands() -> Result<()> {
    let rows = vec![
        json!({
            "name": "run",
            "description": "Run the screenshot/classify/tap loop with reset recovery and pause/stop control."
        }),
        json!({
            "name": "capture",
            "description": "Capture one device screenshot and emit a metadata sidecar."
        }),
        json!({
            "name": "classify",
            "description": "Run color + OCR classification on a region of an image file."
        }),
        json!({
            "name": "tap",
            "description": "Inject one tap at the given coordinates."
        }),
        json!({
            "name": "config",
            "description": "Print the effective configuration or write the defaults."
        }),
    ];

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({ "commands": rows }))?
    );
    Ok(())
}

fn recognizer(disabled: bool, binary: &str) -> Option<Box<dyn TextRecognizer>> {
    if disabled {
        return None;
    }
    TesseractCli::detect(binary).map(|engine| Box::new(engine) as Box<dyn TextRecognizer>)
}

fn command_run(args: RunArgs) -> Result<()> {
    let mut config = LoopConfig::load(&args.config)?;
    if let Some(package) = args.package.clone() {
        config.package = Some(package);
    }
    if let Some(secs) = args.grace_secs {
        config.timings.grace_ms = secs.saturating_mul(1000);
    }
    if let Some(policy) = args.mid_run_reset_failure {
        config.mid_run_reset_failure = policy;
    }
    if let Some(max) = args.max_reset_attempts {
        config.max_reset_attempts = max;
    }
    config.validate().context("invalid run configuration")?;

    let device = connect(args.device.backend, args.device.options())?;
    let classifier =
        RegionClassifier::new(config.color, recognizer(args.no_ocr, &args.tesseract));
    if !classifier.has_recognizer() {
        log::warn!("running without OCR; resets cannot be verified");
    }

    let (session, handle) = Session::channel(config.timings.pause_poll());
    spawn_interrupt_handler(handle.clone())?;
    if !args.no_stdin_control {
        spawn_stdin_control(handle);
    }
    let surface =
        Surface::new(device, classifier, session).with_archive(args.keep_screenshots.clone());
    let mut automation = Automation::new(surface, config);
    let report = automation.run();

    let report_path = args.report.clone().unwrap_or_else(|| {
        out_root()
            .join("reports")
            .join(format!("run-{}.json", timestamp_compact()))
    });
    let value = serde_json::to_value(&report)?;
    write_json_pretty(&report_path, &value)?;
    log::info!("report written to {}", abs_path(&report_path).display());

    if args.json {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Total time: {}", report.elapsed_human);
    }

    if report.outcome.is_fatal() {
        bail!("automation ended: {}", report.outcome);
    }
    Ok(())
}

/// First Ctrl+C stops the session so the report is still written; a second
/// one aborts the process.
fn spawn_interrupt_handler(handle: ControlHandle) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start the interrupt listener")?;
    thread::Builder::new()
        .name("interrupt".to_string())
        .spawn(move || {
            if runtime.block_on(forward_interrupts(handle, tokio::signal::ctrl_c)) {
                eprintln!("interrupted again; aborting");
                std::process::exit(130);
            }
        })
        .context("failed to spawn the interrupt listener")?;
    Ok(())
}

/// Returns true when a second interrupt arrives after the stop was sent.
async fn forward_interrupts<F, Fut>(handle: ControlHandle, mut interrupted: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    if let Err(err) = interrupted().await {
        log::warn!("cannot listen for Ctrl+C: {err}");
        return false;
    }
    log::warn!("interrupt received; stopping (Ctrl+C again to abort)");
    handle.stop();
    interrupted().await.is_ok()
}

/// Forwards `p`/`q` lines from stdin to the session until stdin closes.
fn spawn_stdin_control(handle: ControlHandle) {
    log::info!("type `p` + Enter to pause/resume, `q` + Enter (or Ctrl+C) to stop");
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            match Control::parse(&line) {
                Some(control) => {
                    if !handle.send(control) {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => log::warn!("unknown control {:?} (use p, pause, resume or q)", line.trim()),
            }
        }
    });
}

fn command_capture(args: CaptureArgs) -> Result<()> {
    let mut device = connect(args.device.backend, args.device.options())?;
    let out_path = args.out.clone().unwrap_or_else(|| {
        out_root()
            .join("captures")
            .join(format!("capture-{}.png", timestamp_compact()))
    });
    ensure_parent_dir(&out_path)?;

    let image = device
        .capture_screenshot()?
        .context("device returned no screenshot")?;
    image
        .save(&out_path)
        .with_context(|| format!("failed to write capture: {}", out_path.display()))?;

    let payload = json!({
        "image": abs_path(&out_path).display().to_string(),
        "width": image.width(),
        "height": image.height(),
        "backend": device.name(),
        "captured_at": timestamp_iso(),
    });

    if !args.no_sidecar {
        let sidecar = args
            .sidecar
            .clone()
            .unwrap_or_else(|| default_sidecar_for(&out_path));
        write_json_pretty(&sidecar, &payload)?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        println!("{}", abs_path(&out_path).display());
    }
    Ok(())
}

fn command_classify(args: ClassifyArgs) -> Result<()> {
    let config = LoopConfig::load(&args.config)?;
    let region = match args.rect.as_deref() {
        Some(raw) => Region::parse(raw)?,
        None => config.region(args.region),
    };
    let image = image::open(&args.image)
        .with_context(|| format!("failed to open image: {}", args.image.display()))?;

    let rgb = crop(&image, region)?;
    let mean = mean_rgb(&rgb);
    let rule = config.color;

    let classifier = RegionClassifier::new(rule, recognizer(args.no_ocr, &args.tesseract));
    let active = classifier.classify_color(Some(&image), region);
    let read = classifier.recognize_text(Some(&image), region);
    let markers = MarkerSet::new(
        config.final_step_target.clone(),
        config.checkpoint_marker.clone(),
        config.amount_marker.clone(),
    );

    if let Some(path) = &args.save_crop {
        ensure_parent_dir(path)?;
        preprocess(&rgb)
            .save(path)
            .with_context(|| format!("failed to write crop: {}", path.display()))?;
    }

    let role = args.rect.is_none().then_some(args.region);
    let payload = json!({
        "image": abs_path(&args.image).display().to_string(),
        "region": region,
        "role": role,
        "mean_rgb": mean.map(|v| round_to(v, 2)),
        "rule": rule,
        "active": active,
        "ocr_engine": classifier.recognizer_name(),
        "text": read.text,
        "confidence": read.confidence,
        "amount": parse_amount(&read.text),
        "timer_seconds": parse_timer_seconds(&read.text),
        "marker": markers.classify(&read.text),
    });
    println!("{}", serde_json::to_string_pretty(&payload)?);
    Ok(())
}

fn command_tap(args: TapArgs) -> Result<()> {
    let mut device = connect(args.device.backend, args.device.options())?;
    let accepted = device.tap(args.x, args.y)?;
    println!(
        "{}",
        serde_json::to_string(&json!({
            "x": args.x,
            "y": args.y,
            "accepted": accepted,
            "backend": device.name(),
        }))?
    );
    if !accepted {
        bail!("tap at ({}, {}) was rejected", args.x, args.y);
    }
    Ok(())
}

fn command_config(args: ConfigArgs) -> Result<()> {
    if let Some(path) = &args.write_defaults {
        let value = serde_json::to_value(LoopConfig::default())?;
        write_json_pretty(path, &value)?;
        println!("{}", abs_path(path).display());
        return Ok(());
    }
    let config = LoopConfig::load(&args.config)?;
    let mut value = serde_json::to_value(&config)?;
    value["resolved_timer_ocr"] = serde_json::to_value(config.region(RegionRole::TimerOcr))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::RunOutcome;
    use crate::testing::{scenario_config, FakeDevice, ScriptedRecognizer};
    use std::time::Duration;

    fn block_on<F: Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    fn signals(script: Vec<io::Result<()>>) -> impl FnMut() -> std::future::Ready<io::Result<()>> {
        let mut script = script.into_iter();
        move || {
            std::future::ready(
                script
                    .next()
                    .unwrap_or_else(|| Err(io::Error::other("listener closed"))),
            )
        }
    }

    #[test]
    fn interrupt_stops_the_running_session() {
        let (mut session, handle) = Session::channel(Duration::from_millis(1));
        let aborted = block_on(forward_interrupts(handle, signals(vec![Ok(())])));

        assert!(!aborted);
        assert!(session.checkpoint().is_err());
    }

    #[test]
    fn second_interrupt_requests_abort() {
        let (mut session, handle) = Session::channel(Duration::from_millis(1));
        let aborted = block_on(forward_interrupts(handle, signals(vec![Ok(()), Ok(())])));

        assert!(aborted);
        assert!(session.checkpoint().is_err());
    }

    #[test]
    fn interrupted_run_still_reports_stopped() {
        let cfg = scenario_config();
        let ocr = ScriptedRecognizer::default()
            .on(cfg.button, ["$8"])
            .on(cfg.ocr_above, ["5/20"]);
        let device = FakeDevice::new();
        let (session, handle) = Session::channel(Duration::from_millis(1));
        let classifier = RegionClassifier::new(cfg.color, Some(Box::new(ocr)));
        let surface = Surface::new(device.clone(), classifier, session);
        let mut automation = Automation::new(surface, cfg);

        let watched = device.clone();
        let interrupter = thread::spawn(move || {
            while watched.taps().len() < 8 {
                thread::sleep(Duration::from_millis(1));
            }
            block_on(forward_interrupts(handle, signals(vec![Ok(())])))
        });
        let report = automation.run();

        assert!(!interrupter.join().unwrap());
        assert_eq!(report.outcome, RunOutcome::Stopped);
        assert!(report.taps >= 8);
        assert!(!report.elapsed_human.is_empty());
    }

    #[test]
    fn listener_failure_leaves_session_running() {
        let (mut session, handle) = Session::channel(Duration::from_millis(1));
        let aborted = block_on(forward_interrupts(
            handle,
            signals(vec![Err(io::Error::other("no signal support"))]),
        ));

        assert!(!aborted);
        assert!(session.checkpoint().is_ok());
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "tap-loop",
            "run",
            "--backend",
            "shell",
            "--package",
            "com.example.game",
            "--mid-run-reset-failure",
            "stop",
            "--max-reset-attempts",
            "7",
            "--no-ocr",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.device.backend, Backend::Shell);
        assert_eq!(args.package.as_deref(), Some("com.example.game"));
        assert_eq!(args.mid_run_reset_failure, Some(ResetFailurePolicy::Stop));
        assert_eq!(args.max_reset_attempts, Some(7));
        assert!(args.no_ocr);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn cli_parses_classify_region() {
        let cli = Cli::try_parse_from([
            "tap-loop",
            "classify",
            "shot.png",
            "--region",
            "timer-ocr",
            "--rect",
            "1,2,3,4",
        ])
        .unwrap();
        let Commands::Classify(args) = cli.command else {
            panic!("expected classify");
        };
        assert_eq!(args.region, RegionRole::TimerOcr);
        assert_eq!(args.rect.as_deref(), Some("1,2,3,4"));
    }

    #[test]
    fn cli_parses_tap() {
        let cli = Cli::try_parse_from(["tap-loop", "tap", "150", "375"]).unwrap();
        let Commands::Tap(args) = cli.command else {
            panic!("expected tap");
        };
        assert_eq!((args.x, args.y), (150, 375));
        assert_eq!(args.device.backend, Backend::Adb);
    }

    #[test]
    fn cli_rejects_unknown_backend() {
        assert!(Cli::try_parse_from(["tap-loop", "run", "--backend", "usb"]).is_err());
    }
}
