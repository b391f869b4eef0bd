use crate::util::{command_exists, run_command, CommandOutput};
use anyhow::{bail, Context, Result};
use image::DynamicImage;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

static SIZE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+)x(\d+)").unwrap());
static FOCUS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:mCurrentFocus|mFocusedApp)=.*?\s([A-Za-z0-9_.]+)/").unwrap());

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything the loop needs from the target screen.
///
/// Implementations report hard failures (spawn errors, timeouts) as `Err`;
/// the loop logs them and treats the call as a no-op.
pub trait DeviceAdapter {
    fn name(&self) -> &str;

    /// `Ok(None)` when the backend produced no image.
    fn capture_screenshot(&mut self) -> Result<Option<DynamicImage>>;

    fn tap(&mut self, x: i32, y: i32) -> Result<bool>;

    /// Launches `app_id`; returns whether the launch command was accepted.
    fn bring_to_foreground(&mut self, app_id: &str) -> Result<bool>;

    /// Package currently holding focus, when the backend can tell.
    fn current_app(&mut self) -> Result<Option<String>>;

    fn screen_size(&mut self) -> Result<Option<(u32, u32)>>;
}

impl<T: DeviceAdapter + ?Sized> DeviceAdapter for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn capture_screenshot(&mut self) -> Result<Option<DynamicImage>> {
        (**self).capture_screenshot()
    }

    fn tap(&mut self, x: i32, y: i32) -> Result<bool> {
        (**self).tap(x, y)
    }

    fn bring_to_foreground(&mut self, app_id: &str) -> Result<bool> {
        (**self).bring_to_foreground(app_id)
    }

    fn current_app(&mut self) -> Result<Option<String>> {
        (**self).current_app()
    }

    fn screen_size(&mut self) -> Result<Option<(u32, u32)>> {
        (**self).screen_size()
    }
}

/// Closed set of device backends, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// Drive a device from the host through `adb`.
    Adb,
    /// Run `input`/`screencap` directly on the device (e.g. inside Termux).
    Shell,
}

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub serial: Option<String>,
    pub adb_binary: Option<String>,
    pub screenshot_path: Option<PathBuf>,
}

pub fn connect(backend: Backend, opts: ConnectOptions) -> Result<Box<dyn DeviceAdapter>> {
    match backend {
        Backend::Adb => {
            let device = AdbDevice::new(opts.adb_binary.as_deref().unwrap_or("adb"), opts.serial);
            device.ensure_ready()?;
            log::info!("device backend: adb ({})", device.describe());
            Ok(Box::new(device))
        }
        Backend::Shell => {
            if !command_exists("input") {
                log::warn!("`input` not on PATH; taps will fail outside an Android shell");
            }
            let device = ShellDevice::new(opts.screenshot_path);
            log::info!("device backend: shell ({})", device.screenshot_path.display());
            Ok(Box::new(device))
        }
    }
}

/// Host-side backend speaking to one device through `adb`.
#[derive(Debug, Clone)]
pub struct AdbDevice {
    binary: String,
    serial: Option<String>,
}

impl AdbDevice {
    pub fn new(binary: &str, serial: Option<String>) -> Self {
        Self {
            binary: binary.to_string(),
            serial,
        }
    }

    fn describe(&self) -> String {
        self.serial
            .clone()
            .unwrap_or_else(|| "default device".to_string())
    }

    fn adb(&self, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let mut full: Vec<String> = Vec::new();
        if let Some(serial) = &self.serial {
            full.push("-s".to_string());
            full.push(serial.clone());
        }
        full.extend(args.iter().map(|a| a.to_string()));
        run_command(&self.binary, &full, None, timeout)
    }

    fn ensure_ready(&self) -> Result<()> {
        if !command_exists(&self.binary) {
            bail!("{} not found on PATH", self.binary);
        }
        let state = self.adb(&["get-state"], COMMAND_TIMEOUT)?;
        if !state.success || state.stdout_text() != "device" {
            bail!(
                "adb device {} not ready: {}",
                self.describe(),
                if state.stderr.is_empty() {
                    state.stdout_text()
                } else {
                    state.stderr
                }
            );
        }
        Ok(())
    }
}

impl DeviceAdapter for AdbDevice {
    fn name(&self) -> &str {
        "adb"
    }

    fn capture_screenshot(&mut self) -> Result<Option<DynamicImage>> {
        let output = self.adb(&["exec-out", "screencap", "-p"], CAPTURE_TIMEOUT)?;
        if !output.success {
            bail!("screencap failed: {}", output.stderr);
        }
        decode_png(&output.stdout)
    }

    fn tap(&mut self, x: i32, y: i32) -> Result<bool> {
        let (xs, ys) = (x.to_string(), y.to_string());
        let output = self.adb(&["shell", "input", "tap", &xs, &ys], COMMAND_TIMEOUT)?;
        Ok(output.success)
    }

    fn bring_to_foreground(&mut self, app_id: &str) -> Result<bool> {
        validate_package(app_id)?;
        let output = self.adb(
            &[
                "shell",
                "monkey",
                "-p",
                app_id,
                "-c",
                "android.intent.category.LAUNCHER",
                "1",
            ],
            COMMAND_TIMEOUT,
        )?;
        Ok(output.success)
    }

    fn current_app(&mut self) -> Result<Option<String>> {
        let output = self.adb(&["shell", "dumpsys", "window"], COMMAND_TIMEOUT)?;
        Ok(parse_focused_package(&output.stdout_text()))
    }

    fn screen_size(&mut self) -> Result<Option<(u32, u32)>> {
        let output = self.adb(&["shell", "wm", "size"], COMMAND_TIMEOUT)?;
        if !output.success {
            return Ok(None);
        }
        Ok(parse_wm_size(&output.stdout_text()))
    }
}

/// On-device backend issuing plain shell commands.
#[derive(Debug, Clone)]
pub struct ShellDevice {
    screenshot_path: PathBuf,
}

impl ShellDevice {
    pub fn new(screenshot_path: Option<PathBuf>) -> Self {
        Self {
            screenshot_path: screenshot_path
                .unwrap_or_else(|| PathBuf::from("/sdcard/screenshot_temp.png")),
        }
    }

    fn sh(&self, script: &str, timeout: Duration) -> Result<CommandOutput> {
        self.sh_with(script, &[], timeout)
    }

    /// Runs `script` with `params` bound to `$1..`, so they are never re-parsed by the shell.
    fn sh_with(&self, script: &str, params: &[&str], timeout: Duration) -> Result<CommandOutput> {
        run_command("sh", &shell_args(script, params), None, timeout)
    }
}

impl DeviceAdapter for ShellDevice {
    fn name(&self) -> &str {
        "shell"
    }

    fn capture_screenshot(&mut self) -> Result<Option<DynamicImage>> {
        let path = self.screenshot_path.display().to_string();
        let output = self.sh_with(r#"screencap -p "$1""#, &[&path], CAPTURE_TIMEOUT)?;
        if !output.success {
            bail!("screencap failed: {}", output.stderr);
        }
        if !self.screenshot_path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&self.screenshot_path)
            .with_context(|| format!("failed to read screenshot: {path}"))?;
        decode_png(&raw)
    }

    fn tap(&mut self, x: i32, y: i32) -> Result<bool> {
        let output = self.sh(&format!("input tap {x} {y}"), COMMAND_TIMEOUT)?;
        Ok(output.success)
    }

    fn bring_to_foreground(&mut self, app_id: &str) -> Result<bool> {
        validate_package(app_id)?;
        let output = self.sh(
            &format!("monkey -p {app_id} -c android.intent.category.LAUNCHER 1"),
            COMMAND_TIMEOUT,
        )?;
        Ok(output.success)
    }

    fn current_app(&mut self) -> Result<Option<String>> {
        let output = self.sh("dumpsys window", COMMAND_TIMEOUT)?;
        Ok(parse_focused_package(&output.stdout_text()))
    }

    fn screen_size(&mut self) -> Result<Option<(u32, u32)>> {
        let output = self.sh("wm size", COMMAND_TIMEOUT)?;
        if !output.success {
            return Ok(None);
        }
        Ok(parse_wm_size(&output.stdout_text()))
    }
}

fn shell_args(script: &str, params: &[&str]) -> Vec<String> {
    let mut args = vec!["-c".to_string(), script.to_string(), "tap-loop".to_string()];
    args.extend(params.iter().map(|p| p.to_string()));
    args
}

fn decode_png(raw: &[u8]) -> Result<Option<DynamicImage>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let image = image::load_from_memory(raw).context("failed to decode screenshot")?;
    Ok(Some(image))
}

/// Package names go into shell command lines; only `[A-Za-z0-9_.]` is allowed.
pub fn validate_package(app_id: &str) -> Result<()> {
    if app_id.is_empty()
        || !app_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_'))
    {
        bail!("invalid package name: {app_id:?}");
    }
    Ok(())
}

/// `wm size` prints a physical and optionally an override size; the last one wins.
pub fn parse_wm_size(raw: &str) -> Option<(u32, u32)> {
    SIZE_RE.captures_iter(raw).last().and_then(|caps| {
        let w = caps.get(1)?.as_str().parse().ok()?;
        let h = caps.get(2)?.as_str().parse().ok()?;
        Some((w, h))
    })
}

pub fn parse_focused_package(raw: &str) -> Option<String> {
    FOCUS_RE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
