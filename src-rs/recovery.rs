use crate::config::{LoopConfig, Point, Region};
use crate::device::DeviceAdapter;
use crate::session::{Flow, Stopped};
use crate::signals::parse_amount;
use crate::surface::Surface;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum RecoveryState {
    Idle,
    Attempting { attempt: u32 },
    Succeeded { attempts: u32, amount: u32 },
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Succeeded { attempts: u32, amount: u32 },
    Exhausted { attempts: u32 },
    /// The session was stopped mid-reset.
    Aborted { attempts: u32 },
}

/// Tap sequence and success check for one reset cycle.
#[derive(Debug, Clone)]
pub struct ResetPlan {
    /// Confirm, back, confirm.
    pub gesture: [Point; 3],
    pub start: Point,
    pub verify_region: Region,
    pub target_amount: u32,
    pub max_attempts: u32,
    pub gesture_delay: Duration,
    pub click_delay: Duration,
    pub retry_delay: Duration,
}

impl ResetPlan {
    pub fn from_config(config: &LoopConfig) -> Self {
        Self {
            gesture: config.reset_clicks(),
            start: config.start_click,
            verify_region: config.button,
            target_amount: config.reset_target_amount,
            max_attempts: config.max_reset_attempts.max(1),
            gesture_delay: config.timings.reset_click_delay(),
            click_delay: config.timings.click_delay(),
            retry_delay: config.timings.reset_retry_delay(),
        }
    }
}

/// Bounded-retry reset back to a known baseline.
pub struct RecoveryController {
    plan: ResetPlan,
    state: RecoveryState,
}

impl RecoveryController {
    pub fn new(plan: ResetPlan) -> Self {
        Self {
            plan,
            state: RecoveryState::Idle,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    /// Runs reset cycles until the verification amount is at or under the
    /// target, or `max_attempts` cycles have been spent.
    pub fn reset<D: DeviceAdapter>(&mut self, surface: &mut Surface<D>) -> RecoveryOutcome {
        log::info!("reset: starting (up to {} attempts)", self.plan.max_attempts);
        let mut attempt = 0;
        let result = self.attempts(surface, &mut attempt);
        let outcome = match result {
            Ok(Some(amount)) => RecoveryOutcome::Succeeded {
                attempts: attempt,
                amount,
            },
            Ok(None) => RecoveryOutcome::Exhausted { attempts: attempt },
            Err(Stopped) => RecoveryOutcome::Aborted { attempts: attempt },
        };
        self.state = match outcome {
            RecoveryOutcome::Succeeded { attempts, amount } => {
                log::info!("reset: succeeded after {attempts} attempt(s), amount {amount}");
                RecoveryState::Succeeded { attempts, amount }
            }
            RecoveryOutcome::Exhausted { attempts } => {
                log::warn!("reset: failed after {attempts} attempts");
                RecoveryState::Exhausted { attempts }
            }
            RecoveryOutcome::Aborted { attempts } => {
                log::info!("reset: aborted by stop during attempt {attempts}");
                RecoveryState::Idle
            }
        };
        outcome
    }

    fn attempts<D: DeviceAdapter>(
        &mut self,
        surface: &mut Surface<D>,
        attempt: &mut u32,
    ) -> Flow<Option<u32>> {
        let plan = self.plan.clone();
        for n in 1..=plan.max_attempts {
            surface.checkpoint()?;
            *attempt = n;
            self.state = RecoveryState::Attempting { attempt: n };
            log::info!("reset attempt {n}/{}", plan.max_attempts);

            surface.tap(plan.gesture[0], plan.gesture_delay)?;
            surface.tap(plan.gesture[1], plan.gesture_delay)?;
            surface.tap(plan.gesture[2], plan.click_delay)?;
            surface.tap(plan.start, plan.click_delay)?;

            let read = surface.read(plan.verify_region)?;
            match parse_amount(&read.text) {
                Some(amount) if amount <= plan.target_amount => return Ok(Some(amount)),
                Some(amount) => log::info!(
                    "reset attempt {n}: amount {amount} above target {}",
                    plan.target_amount
                ),
                None => log::info!("reset attempt {n}: no amount in {:?}", read.text),
            }
            surface.wait(plan.retry_delay)?;
        }
        Ok(None)
    }
}
