use crate::classifier::ColorRule;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "automation_config.json";

/// A tap target in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Axis-aligned screen rectangle in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> Point {
        let clamp = |v: u32| i32::try_from(v).unwrap_or(i32::MAX);
        Point::new(
            clamp(self.x.saturating_add(self.width / 2)),
            clamp(self.y.saturating_add(self.height / 2)),
        )
    }

    pub fn right(&self) -> u64 {
        u64::from(self.x) + u64::from(self.width)
    }

    pub fn bottom(&self) -> u64 {
        u64::from(self.y) + u64::from(self.height)
    }

    /// Parses `x,y,w,h`.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            bail!("region must be x,y,w,h (got {raw:?})");
        }
        let mut nums = [0u32; 4];
        for (slot, part) in nums.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .with_context(|| format!("invalid region component {part:?} in {raw:?}"))?;
        }
        Ok(Self::new(nums[0], nums[1], nums[2], nums[3]))
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

/// Semantic role of a configured region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum RegionRole {
    /// Action button whose color says whether it is active.
    Button,
    /// Progress readout above the button.
    OcrAbove,
    /// Secondary amount readout.
    OcrSecond,
    /// Countdown readout checked at the checkpoint.
    TimerOcr,
}

/// What to do when a reset triggered mid-run exhausts its attempts.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum ResetFailurePolicy {
    /// Log it and return to polling as if the reset had succeeded.
    #[default]
    Continue,
    /// Terminate the run with a fatal outcome.
    Stop,
}

/// Delays in milliseconds; all waits in the loop come from here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    pub click_delay_ms: u64,
    pub reset_click_delay_ms: u64,
    pub reset_retry_delay_ms: u64,
    pub timer_settle_ms: u64,
    pub post_timer_settle_ms: u64,
    pub pause_poll_ms: u64,
    pub grace_ms: u64,
    pub launch_wait_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            click_delay_ms: 1_000,
            reset_click_delay_ms: 50,
            reset_retry_delay_ms: 500,
            timer_settle_ms: 10_000,
            post_timer_settle_ms: 10_000,
            pause_poll_ms: 100,
            grace_ms: 5_000,
            launch_wait_ms: 3_000,
        }
    }
}

impl Timings {
    /// Every wait is zero; used by tests that script the device.
    #[cfg(test)]
    pub fn instant() -> Self {
        Self {
            click_delay_ms: 0,
            reset_click_delay_ms: 0,
            reset_retry_delay_ms: 0,
            timer_settle_ms: 0,
            post_timer_settle_ms: 0,
            pause_poll_ms: 1,
            grace_ms: 0,
            launch_wait_ms: 0,
        }
    }

    pub fn click_delay(&self) -> Duration {
        Duration::from_millis(self.click_delay_ms)
    }

    pub fn reset_click_delay(&self) -> Duration {
        Duration::from_millis(self.reset_click_delay_ms)
    }

    pub fn reset_retry_delay(&self) -> Duration {
        Duration::from_millis(self.reset_retry_delay_ms)
    }

    pub fn timer_settle(&self) -> Duration {
        Duration::from_millis(self.timer_settle_ms)
    }

    pub fn post_timer_settle(&self) -> Duration {
        Duration::from_millis(self.post_timer_settle_ms)
    }

    pub fn pause_poll(&self) -> Duration {
        Duration::from_millis(self.pause_poll_ms.max(1))
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn launch_wait(&self) -> Duration {
        Duration::from_millis(self.launch_wait_ms)
    }
}

/// Full loop configuration. Every key is optional in the JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// App to bring to the foreground; `None` waits `grace_ms` for a manual switch.
    pub package: Option<String>,

    pub start_click: Point,
    pub reset_click_1: Point,
    pub reset_click_2: Point,
    pub reset_click_3: Point,
    pub post_timer_click_1: Point,
    pub post_timer_click_2: Point,

    pub button: Region,
    pub ocr_above: Region,
    pub ocr_second: Region,
    pub timer_ocr: Option<Region>,

    pub reset_target_amount: u32,
    pub timer_threshold: u32,
    pub amount_threshold: u32,
    pub final_step_target: String,
    pub checkpoint_marker: String,
    pub amount_marker: String,

    /// Hue test deciding whether `button` is active.
    pub color: ColorRule,

    pub max_reset_attempts: u32,
    pub mid_run_reset_failure: ResetFailurePolicy,
    pub timings: Timings,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            package: None,
            start_click: Point::new(150, 375),
            reset_click_1: Point::new(260, 945),
            reset_click_2: Point::new(585, 1013),
            reset_click_3: Point::new(260, 845),
            post_timer_click_1: Point::new(260, 885),
            post_timer_click_2: Point::new(220, 390),
            button: Region::new(220, 370, 120, 25),
            ocr_above: Region::new(220, 340, 120, 25),
            ocr_second: Region::new(110, 400, 60, 25),
            timer_ocr: None,
            reset_target_amount: 10,
            timer_threshold: 5,
            amount_threshold: 20,
            final_step_target: "20/30".to_string(),
            checkpoint_marker: "10/20".to_string(),
            amount_marker: "2/10".to_string(),
            color: ColorRule::default(),
            max_reset_attempts: 50,
            mid_run_reset_failure: ResetFailurePolicy::Continue,
            timings: Timings::default(),
        }
    }
}

const MAX_DELAY_MS: u64 = 60_000;

impl LoopConfig {
    /// Loads `path`; a missing file yields the built-in defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!(
                "config {} not found; using built-in defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config JSON: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config values: {}", path.display()))?;
        log::info!("configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for role in [
            RegionRole::Button,
            RegionRole::OcrAbove,
            RegionRole::OcrSecond,
            RegionRole::TimerOcr,
        ] {
            let region = self.region(role);
            if region.width == 0 || region.height == 0 {
                bail!("region {role:?} has zero area: {region}");
            }
            let limit = i32::MAX as u64;
            if region.right() > limit || region.bottom() > limit {
                bail!("region {role:?} lies beyond any screen: {region}");
            }
        }
        if !self.color.floor.is_finite() || !(0.0..=255.0).contains(&self.color.floor) {
            bail!("color.floor must be within 0..=255");
        }
        if !self.color.margin.is_finite() || self.color.margin <= 0.0 {
            bail!("color.margin must be a positive number");
        }
        if self.max_reset_attempts == 0 {
            bail!("max_reset_attempts must be at least 1");
        }
        if self.final_step_target.trim().is_empty() {
            bail!("final_step_target must not be empty");
        }
        let t = &self.timings;
        for (name, value) in [
            ("click_delay_ms", t.click_delay_ms),
            ("reset_click_delay_ms", t.reset_click_delay_ms),
            ("reset_retry_delay_ms", t.reset_retry_delay_ms),
            ("pause_poll_ms", t.pause_poll_ms),
        ] {
            if value > MAX_DELAY_MS {
                bail!("timings.{name} = {value} exceeds {MAX_DELAY_MS}ms");
            }
        }
        Ok(())
    }

    /// Resolved rectangle for `role`. Without an explicit `timer_ocr` the
    /// timer sits inside the button, offset by 30px and narrowed by 30px.
    pub fn region(&self, role: RegionRole) -> Region {
        match role {
            RegionRole::Button => self.button,
            RegionRole::OcrAbove => self.ocr_above,
            RegionRole::OcrSecond => self.ocr_second,
            RegionRole::TimerOcr => self.timer_ocr.unwrap_or_else(|| {
                Region::new(
                    self.button.x.saturating_add(30),
                    self.button.y.saturating_add(30),
                    self.button.width.saturating_sub(30).max(1),
                    self.button.height,
                )
            }),
        }
    }

    pub fn reset_clicks(&self) -> [Point; 3] {
        [self.reset_click_1, self.reset_click_2, self.reset_click_3]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Channel;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = LoopConfig::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(config, LoopConfig::default());
    }

    #[test]
    fn present_keys_override_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("automation_config.json");
        fs::write(
            &path,
            r#"{
                "start_click": {"x": 1, "y": 2},
                "button": {"x": 10, "y": 20, "width": 30, "height": 40},
                "timer_ocr": {"x": 5, "y": 6, "width": 7, "height": 8},
                "timer_threshold": 9,
                "final_step_target": "30/30",
                "mid_run_reset_failure": "stop",
                "timings": {"click_delay_ms": 250}
            }"#,
        )
        .unwrap();
        let config = LoopConfig::load(&path).unwrap();
        assert_eq!(config.start_click, Point::new(1, 2));
        assert_eq!(config.button, Region::new(10, 20, 30, 40));
        assert_eq!(config.region(RegionRole::TimerOcr), Region::new(5, 6, 7, 8));
        assert_eq!(config.timer_threshold, 9);
        assert_eq!(config.final_step_target, "30/30");
        assert_eq!(config.mid_run_reset_failure, ResetFailurePolicy::Stop);
        assert_eq!(config.timings.click_delay_ms, 250);
        assert_eq!(config.timings.reset_click_delay_ms, 50);
        assert_eq!(config.reset_target_amount, 10);
        assert_eq!(config.reset_click_2, Point::new(585, 1013));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, "{ not json").unwrap();
        let err = LoopConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("invalid config JSON"));
    }

    #[test]
    fn zero_area_region_is_rejected() {
        let config = LoopConfig {
            ocr_second: Region::new(0, 0, 0, 10),
            ..LoopConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn timer_region_defaults_to_button_offset() {
        let config = LoopConfig::default();
        assert_eq!(
            config.region(RegionRole::TimerOcr),
            Region::new(250, 400, 90, 25)
        );
    }

    #[test]
    fn oversized_region_is_rejected_without_panicking() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("huge.json");
        fs::write(
            &path,
            r#"{"button": {"x": 4294967290, "y": 10, "width": 100, "height": 20}}"#,
        )
        .unwrap();
        let err = LoopConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("beyond any screen"));

        let config = LoopConfig {
            button: Region::new(u32::MAX - 5, u32::MAX - 5, 100, 20),
            ..LoopConfig::default()
        };
        assert_eq!(
            config.region(RegionRole::TimerOcr),
            Region::new(u32::MAX, u32::MAX, 70, 20)
        );
        assert_eq!(config.button.center(), Point::new(i32::MAX, i32::MAX));
    }

    #[test]
    fn color_rule_is_read_from_config() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("red.json");
        fs::write(&path, r#"{"color": {"channel": "red", "floor": 150.0}}"#).unwrap();
        let config = LoopConfig::load(&path).unwrap();
        assert_eq!(config.color.channel, Channel::Red);
        assert_eq!(config.color.floor, 150.0);
        assert_eq!(config.color.margin, 1.2);
        assert!(config.color.matches([200.0, 40.0, 40.0]));
        assert!(!config.color.matches([30.0, 80.0, 220.0]));
    }

    #[test]
    fn invalid_color_rule_is_rejected() {
        let config = LoopConfig {
            color: ColorRule {
                margin: 0.0,
                ..ColorRule::default()
            },
            ..LoopConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn region_center_and_parse() {
        let region = Region::parse("220, 370,120,25").unwrap();
        assert_eq!(region, Region::new(220, 370, 120, 25));
        assert_eq!(region.center(), Point::new(280, 382));
        assert!(Region::parse("1,2,3").is_err());
        assert!(Region::parse("1,2,x,4").is_err());
    }
}
