//! Scripted stand-ins for the device and the OCR engine.

use crate::config::{LoopConfig, Point, Region, Timings};
use crate::device::DeviceAdapter;
use crate::ocr::TextRecognizer;
use crate::session::{Control, ControlHandle};
use anyhow::{anyhow, bail, Result};
use image::{DynamicImage, GrayImage, Rgb, RgbImage};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const SCREEN: (u32, u32) = (720, 1280);

/// Config whose OCR regions all have distinct sizes, so a recognizer keyed
/// by crop size knows which readout it is looking at.
pub fn scenario_config() -> LoopConfig {
    LoopConfig {
        package: Some("com.example.game".to_string()),
        button: Region::new(220, 370, 100, 20),
        ocr_above: Region::new(220, 340, 120, 25),
        ocr_second: Region::new(110, 400, 60, 24),
        timer_ocr: Some(Region::new(250, 400, 90, 30)),
        timings: Timings::instant(),
        ..LoopConfig::default()
    }
}

struct Trigger {
    after_taps: usize,
    control: Control,
    handle: ControlHandle,
}

struct FakeState {
    size: Option<(u32, u32)>,
    button: Region,
    active: bool,
    taps: Vec<Point>,
    captures: usize,
    foreground: Option<String>,
    launch_accepted: bool,
    fail_captures: bool,
    triggers: Vec<Trigger>,
}

/// Records taps and serves synthetic screenshots with the button painted
/// blue (active) or gray.
#[derive(Clone)]
pub struct FakeDevice {
    state: Arc<Mutex<FakeState>>,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                size: Some(SCREEN),
                button: scenario_config().button,
                active: true,
                taps: Vec::new(),
                captures: 0,
                foreground: None,
                launch_accepted: true,
                fail_captures: false,
                triggers: Vec::new(),
            })),
        }
    }

    pub fn set_active(&self, active: bool) {
        self.state.lock().unwrap().active = active;
    }

    pub fn set_screen_size(&self, size: Option<(u32, u32)>) {
        self.state.lock().unwrap().size = size;
    }

    pub fn set_launch_accepted(&self, accepted: bool) {
        self.state.lock().unwrap().launch_accepted = accepted;
    }

    pub fn fail_captures(&self) {
        self.state.lock().unwrap().fail_captures = true;
    }

    /// Sends `control` through `handle` right after the `n`th tap.
    pub fn after_taps(&self, n: usize, control: Control, handle: ControlHandle) {
        self.state.lock().unwrap().triggers.push(Trigger {
            after_taps: n,
            control,
            handle,
        });
    }

    pub fn taps(&self) -> Vec<Point> {
        self.state.lock().unwrap().taps.clone()
    }

    pub fn captures(&self) -> usize {
        self.state.lock().unwrap().captures
    }

    pub fn foreground(&self) -> Option<String> {
        self.state.lock().unwrap().foreground.clone()
    }
}

impl DeviceAdapter for FakeDevice {
    fn name(&self) -> &str {
        "fake"
    }

    fn capture_screenshot(&mut self) -> Result<Option<DynamicImage>> {
        let mut state = self.state.lock().unwrap();
        state.captures += 1;
        if state.fail_captures {
            bail!("capture disabled");
        }
        let (w, h) = state.size.unwrap_or(SCREEN);
        let mut img = RgbImage::from_pixel(w, h, Rgb([90, 90, 90]));
        let fill = if state.active {
            Rgb([30, 80, 220])
        } else {
            Rgb([120, 120, 120])
        };
        let b = state.button;
        for y in b.y..(b.y + b.height).min(h) {
            for x in b.x..(b.x + b.width).min(w) {
                img.put_pixel(x, y, fill);
            }
        }
        Ok(Some(DynamicImage::ImageRgb8(img)))
    }

    fn tap(&mut self, x: i32, y: i32) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        state.taps.push(Point::new(x, y));
        let count = state.taps.len();
        for trigger in state.triggers.iter().filter(|t| t.after_taps == count) {
            trigger.handle.send(trigger.control);
        }
        Ok(true)
    }

    fn bring_to_foreground(&mut self, app_id: &str) -> Result<bool> {
        let mut state = self.state.lock().unwrap();
        if state.launch_accepted {
            state.foreground = Some(app_id.to_string());
        }
        Ok(state.launch_accepted)
    }

    fn current_app(&mut self) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().foreground.clone())
    }

    fn screen_size(&mut self) -> Result<Option<(u32, u32)>> {
        Ok(self.state.lock().unwrap().size)
    }
}

#[derive(Default)]
struct Script {
    by_size: HashMap<(u32, u32), VecDeque<String>>,
    fallback: VecDeque<String>,
    fail: bool,
    calls: usize,
    whitelists: Vec<String>,
    reads: Vec<((u32, u32), String)>,
}

/// Replays canned OCR text. Scripts are keyed by crop size; the last entry
/// of each script repeats forever.
#[derive(Clone, Default)]
pub struct ScriptedRecognizer {
    script: Arc<Mutex<Script>>,
}

fn next_text(queue: &mut VecDeque<String>) -> String {
    if queue.len() > 1 {
        queue.pop_front().unwrap_or_default()
    } else {
        queue.front().cloned().unwrap_or_default()
    }
}

impl ScriptedRecognizer {
    pub fn new<const N: usize>(texts: [&str; N]) -> Self {
        let this = Self::default();
        this.script.lock().unwrap().fallback = texts.iter().map(|t| t.to_string()).collect();
        this
    }

    pub fn failing() -> Self {
        let this = Self::default();
        this.script.lock().unwrap().fail = true;
        this
    }

    /// Script for crops the size of `region`.
    pub fn on<const N: usize>(self, region: Region, texts: [&str; N]) -> Self {
        self.script.lock().unwrap().by_size.insert(
            (region.width, region.height),
            texts.iter().map(|t| t.to_string()).collect(),
        );
        self
    }

    pub fn calls(&self) -> usize {
        self.script.lock().unwrap().calls
    }

    pub fn whitelists(&self) -> Vec<String> {
        self.script.lock().unwrap().whitelists.clone()
    }

    /// Texts served so far for crops the size of `region`.
    pub fn reads_for(&self, region: Region) -> Vec<String> {
        self.script
            .lock()
            .unwrap()
            .reads
            .iter()
            .filter(|(size, _)| *size == (region.width, region.height))
            .map(|(_, text)| text.clone())
            .collect()
    }
}

impl TextRecognizer for ScriptedRecognizer {
    fn name(&self) -> &str {
        "scripted"
    }

    fn recognize(&self, image: &GrayImage, whitelist: &str) -> Result<String> {
        let mut script = self.script.lock().unwrap();
        script.calls += 1;
        script.whitelists.push(whitelist.to_string());
        if script.fail {
            return Err(anyhow!("engine crashed"));
        }
        let size = image.dimensions();
        let script = &mut *script;
        let text = match script.by_size.get_mut(&size) {
            Some(queue) => next_text(queue),
            None => next_text(&mut script.fallback),
        };
        script.reads.push((size, text.clone()));
        Ok(text)
    }
}
