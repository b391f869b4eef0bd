//! The perception-action loop: screenshot, classify, decide, tap, repeat.

use crate::config::{LoopConfig, Region, RegionRole, ResetFailurePolicy, Timings};
use crate::device::DeviceAdapter;
use crate::recovery::{RecoveryController, RecoveryOutcome, RecoveryState, ResetPlan};
use crate::session::{Flow, Stopped};
use crate::signals::{format_elapsed, parse_amount, parse_timer_seconds, Marker, MarkerSet};
use crate::surface::Surface;
use crate::util::{round_to, timestamp_iso};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Bootstrapping,
    Resetting,
    Verifying,
    Polling,
    TimerCheck,
    AmountCheck,
    PostTimerPolling,
    Completed,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RunOutcome {
    Completed,
    Stopped,
    BootstrapFailed { reason: String },
    ResetExhausted { attempts: u32 },
    VerificationFailed { amount: Option<u32> },
}

impl RunOutcome {
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RunOutcome::Completed | RunOutcome::Stopped)
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::Stopped => write!(f, "stopped"),
            RunOutcome::BootstrapFailed { reason } => write!(f, "bootstrap failed: {reason}"),
            RunOutcome::ResetExhausted { attempts } => {
                write!(f, "reset failed after {attempts} attempts")
            }
            RunOutcome::VerificationFailed { amount: Some(amount) } => {
                write!(f, "post-reset amount {amount} above target")
            }
            RunOutcome::VerificationFailed { amount: None } => {
                write!(f, "post-reset amount unreadable")
            }
        }
    }
}

/// Summary emitted on every exit path.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: RunOutcome,
    pub elapsed_secs: f64,
    pub elapsed_human: String,
    pub paused_secs: f64,
    pub timer_check_elapsed_secs: Option<f64>,
    pub ticks: u64,
    pub taps: u64,
    pub captures: u64,
    pub resets: u32,
    pub reset_failures: u32,
    pub last_reset: RecoveryState,
    pub states: Vec<LoopState>,
    pub screen: Option<[u32; 2]>,
    pub backend: String,
    pub ocr_engine: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: String,
}

enum TimerVerdict {
    Passed,
    Reset,
    NoSignal,
}

/// Owns the session, the device surface and the recovery controller for one run.
pub struct Automation<D: DeviceAdapter> {
    surface: Surface<D>,
    config: LoopConfig,
    markers: MarkerSet,
    recovery: RecoveryController,
    state: LoopState,
    states: Vec<LoopState>,
    screen: Option<(u32, u32)>,
    ticks: u64,
    resets: u32,
    reset_failures: u32,
    timer_check_elapsed: Option<Duration>,
}

impl<D: DeviceAdapter> Automation<D> {
    pub fn new(surface: Surface<D>, config: LoopConfig) -> Self {
        let markers = MarkerSet::new(
            config.final_step_target.clone(),
            config.checkpoint_marker.clone(),
            config.amount_marker.clone(),
        );
        let recovery = RecoveryController::new(ResetPlan::from_config(&config));
        Self {
            surface,
            config,
            markers,
            recovery,
            state: LoopState::Bootstrapping,
            states: Vec::new(),
            screen: None,
            ticks: 0,
            resets: 0,
            reset_failures: 0,
            timer_check_elapsed: None,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> LoopState {
        self.state
    }

    #[cfg(test)]
    pub fn surface(&self) -> &Surface<D> {
        &self.surface
    }

    /// Runs to completion, a fatal condition, or an external stop.
    pub fn run(&mut self) -> RunReport {
        self.surface.session.start_clock();
        let outcome = match self.drive() {
            Ok(outcome) => outcome,
            Err(Stopped) => RunOutcome::Stopped,
        };
        let last = match outcome {
            RunOutcome::Completed => LoopState::Completed,
            RunOutcome::Stopped => LoopState::Stopped,
            _ => LoopState::Failed,
        };
        self.mark(last);
        if outcome.is_fatal() {
            log::error!("automation ended: {outcome}");
        } else {
            log::info!("automation ended: {outcome}");
        }
        self.report(outcome)
    }

    fn mark(&mut self, next: LoopState) {
        if self.states.last() != Some(&next) {
            if let Some(prev) = self.states.last() {
                log::info!("state {prev:?} -> {next:?}");
            }
            self.states.push(next);
        }
        self.state = next;
    }

    /// State change; every transition is also a stop/pause suspend point.
    fn enter(&mut self, next: LoopState) -> Flow {
        self.mark(next);
        self.surface.checkpoint()
    }

    fn region(&self, role: RegionRole) -> Region {
        self.config.region(role)
    }

    fn drive(&mut self) -> Flow<RunOutcome> {
        self.enter(LoopState::Bootstrapping)?;
        if let Err(reason) = self.bootstrap()? {
            return Ok(RunOutcome::BootstrapFailed { reason });
        }

        self.enter(LoopState::Resetting)?;
        match self.reset()? {
            RecoveryOutcome::Succeeded { .. } => {}
            RecoveryOutcome::Exhausted { attempts } => {
                log::error!("initial reset failed; cannot continue");
                return Ok(RunOutcome::ResetExhausted { attempts });
            }
            RecoveryOutcome::Aborted { .. } => return Err(Stopped),
        }

        self.enter(LoopState::Verifying)?;
        let button = self.region(RegionRole::Button);
        let read = self.surface.read(button)?;
        match parse_amount(&read.text) {
            Some(amount) if amount <= self.config.reset_target_amount => {
                log::info!("amount verified: {amount}; starting automation");
            }
            amount => {
                log::error!(
                    "amount after reset is {amount:?}, expected <= {}",
                    self.config.reset_target_amount
                );
                return Ok(RunOutcome::VerificationFailed { amount });
            }
        }

        self.poll()
    }

    fn bootstrap(&mut self) -> Flow<Result<(), String>> {
        let timings = self.config.timings.clone();
        match self.config.package.clone() {
            Some(package) => self.bring_up(&package, &timings)?,
            None => {
                log::info!(
                    "no package configured; switch to the target app now ({}s)",
                    timings.grace().as_secs()
                );
                self.surface.wait(timings.grace())?;
            }
        }

        let size = match self.surface.device_mut().screen_size() {
            Ok(Some(size)) => Some(size),
            Ok(None) => None,
            Err(err) => {
                log::warn!("screen size query failed: {err:#}");
                None
            }
        };
        let size = match size {
            Some(size) => size,
            None => match self.surface.capture()? {
                Some(image) => (image.width(), image.height()),
                None => return Ok(Err("could not determine screen size".to_string())),
            },
        };
        log::info!("screen size: {}x{}", size.0, size.1);
        self.screen = Some(size);

        for role in [
            RegionRole::Button,
            RegionRole::OcrAbove,
            RegionRole::OcrSecond,
            RegionRole::TimerOcr,
        ] {
            let region = self.region(role);
            if region.right() > u64::from(size.0) || region.bottom() > u64::from(size.1) {
                log::warn!("{role:?} region {region} extends past the screen; its reads will be empty");
            }
        }
        Ok(Ok(()))
    }

    fn bring_up(&mut self, package: &str, timings: &Timings) -> Flow {
        log::info!("switching to {package}");
        for attempt in 1..=2 {
            self.surface.checkpoint()?;
            match self.surface.device_mut().bring_to_foreground(package) {
                Ok(true) => {}
                Ok(false) => {
                    log::warn!("launch of {package} was rejected");
                    break;
                }
                Err(err) => {
                    log::warn!("launch of {package} failed: {err:#}");
                    break;
                }
            }
            self.surface.wait(timings.launch_wait())?;
            match self.surface.device_mut().current_app() {
                Ok(Some(current)) if current == package => {
                    log::info!("{package} is in the foreground");
                    return Ok(());
                }
                Ok(current) => log::warn!(
                    "attempt {attempt}: foreground app is {}",
                    current.as_deref().unwrap_or("unknown")
                ),
                Err(err) => log::warn!("foreground check failed: {err:#}"),
            }
        }
        log::warn!(
            "could not confirm {package} in the foreground; open it manually ({}s)",
            timings.grace().as_secs()
        );
        self.surface.wait(timings.grace())
    }

    fn reset(&mut self) -> Flow<RecoveryOutcome> {
        self.resets += 1;
        match self.recovery.reset(&mut self.surface) {
            RecoveryOutcome::Aborted { .. } => Err(Stopped),
            outcome => Ok(outcome),
        }
    }

    /// Reset triggered from the timer or amount check. `Some` ends the run.
    fn mid_run_reset(&mut self) -> Flow<Option<RunOutcome>> {
        self.enter(LoopState::Resetting)?;
        match self.reset()? {
            RecoveryOutcome::Exhausted { attempts } => {
                self.reset_failures += 1;
                match self.config.mid_run_reset_failure {
                    ResetFailurePolicy::Continue => {
                        log::warn!("mid-run reset failed; continuing to poll");
                        Ok(None)
                    }
                    ResetFailurePolicy::Stop => Ok(Some(RunOutcome::ResetExhausted { attempts })),
                }
            }
            _ => Ok(None),
        }
    }

    fn poll(&mut self) -> Flow<RunOutcome> {
        let button = self.region(RegionRole::Button);
        let above = self.region(RegionRole::OcrAbove);
        let click_delay = self.config.timings.click_delay();

        loop {
            self.enter(LoopState::Polling)?;
            self.ticks += 1;
            self.surface.tap(self.config.start_click, click_delay)?;

            if self.surface.is_active(button)? {
                log::info!("button is active");
                self.surface.tap(button.center(), click_delay)?;
                let read = self.surface.read(above)?;
                log::info!("progress: {:?}", read.text);

                match self.markers.classify(&read.text) {
                    Marker::Completion => {
                        log::info!("reached {}", self.config.final_step_target);
                        return Ok(RunOutcome::Completed);
                    }
                    Marker::Checkpoint => match self.timer_check()? {
                        TimerVerdict::Passed => return self.post_timer_poll(),
                        TimerVerdict::Reset => {
                            if let Some(outcome) = self.mid_run_reset()? {
                                return Ok(outcome);
                            }
                            continue;
                        }
                        TimerVerdict::NoSignal => {}
                    },
                    Marker::AmountCheck => {
                        if self.amount_check()? {
                            if let Some(outcome) = self.mid_run_reset()? {
                                return Ok(outcome);
                            }
                            continue;
                        }
                    }
                    Marker::None => {}
                }
            }

            self.surface.wait(click_delay)?;
        }
    }

    fn timer_check(&mut self) -> Flow<TimerVerdict> {
        self.enter(LoopState::TimerCheck)?;
        let timings = self.config.timings.clone();
        self.surface.wait(timings.timer_settle())?;

        let timer = self.region(RegionRole::TimerOcr);
        let read = self.surface.read(timer)?;
        let Some(seconds) = parse_timer_seconds(&read.text) else {
            log::info!("timer unreadable ({:?}); back to polling", read.text);
            return Ok(TimerVerdict::NoSignal);
        };
        if seconds > self.config.timer_threshold {
            log::warn!(
                "timer at {seconds}s (> {}), resetting",
                self.config.timer_threshold
            );
            return Ok(TimerVerdict::Reset);
        }

        let elapsed = self.surface.session.elapsed();
        self.timer_check_elapsed = Some(elapsed);
        log::info!(
            "timer at {seconds}s (<= {}); passed after {}",
            self.config.timer_threshold,
            format_elapsed(elapsed)
        );

        let click = timings.click_delay();
        self.surface.tap(self.config.start_click, click)?;
        self.surface.wait(timings.post_timer_settle())?;
        self.surface.tap(self.config.post_timer_click_1, click)?;
        self.surface.wait(click)?;
        self.surface.tap(self.config.post_timer_click_2, click)?;
        self.surface.wait(click)?;
        Ok(TimerVerdict::Passed)
    }

    /// Returns true when the secondary amount is under the threshold.
    fn amount_check(&mut self) -> Flow<bool> {
        self.enter(LoopState::AmountCheck)?;
        let second = self.region(RegionRole::OcrSecond);
        let read = self.surface.read(second)?;
        match parse_amount(&read.text) {
            Some(amount) if amount < self.config.amount_threshold => {
                log::warn!(
                    "amount {amount} < {}, resetting",
                    self.config.amount_threshold
                );
                Ok(true)
            }
            Some(amount) => {
                log::info!("amount {amount} ok");
                Ok(false)
            }
            None => {
                log::info!("amount unreadable ({:?})", read.text);
                Ok(false)
            }
        }
    }

    /// After the timer checkpoint only the button and the completion marker matter.
    fn post_timer_poll(&mut self) -> Flow<RunOutcome> {
        self.enter(LoopState::PostTimerPolling)?;
        let button = self.region(RegionRole::Button);
        let above = self.region(RegionRole::OcrAbove);
        let click_delay = self.config.timings.click_delay();
        log::info!("post-timer taps done; only tapping the active button now");
        self.surface.wait(click_delay * 2)?;

        loop {
            self.surface.checkpoint()?;
            self.ticks += 1;
            if self.surface.is_active(button)? {
                log::info!("button is active");
                self.surface.tap(button.center(), click_delay)?;
                let read = self.surface.read(above)?;
                if self.markers.is_completion(&read.text) {
                    log::info!("reached {}", self.config.final_step_target);
                    return Ok(RunOutcome::Completed);
                }
            }
            self.surface.wait(click_delay * 2)?;
        }
    }

    fn report(&self, outcome: RunOutcome) -> RunReport {
        let session = &self.surface.session;
        let elapsed = session.elapsed();
        log::info!("Total time: {}", format_elapsed(elapsed));
        RunReport {
            outcome,
            elapsed_secs: round_to(elapsed.as_secs_f64(), 3),
            elapsed_human: format_elapsed(elapsed),
            paused_secs: round_to(session.total_paused().as_secs_f64(), 3),
            timer_check_elapsed_secs: self
                .timer_check_elapsed
                .map(|d| round_to(d.as_secs_f64(), 3)),
            ticks: self.ticks,
            taps: self.surface.taps(),
            captures: self.surface.captures(),
            resets: self.resets,
            reset_failures: self.reset_failures,
            last_reset: self.recovery.state(),
            states: self.states.clone(),
            screen: self.screen.map(|(w, h)| [w, h]),
            backend: self.surface.device().name().to_string(),
            ocr_engine: self
                .surface
                .classifier()
                .recognizer_name()
                .map(str::to_string),
            started_at: session.started_at().map(|t| t.to_rfc3339()),
            finished_at: timestamp_iso(),
        }
    }
}
