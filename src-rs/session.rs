use chrono::{DateTime, Utc};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

/// Out-of-band command from whatever front-end hosts the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    TogglePause,
    Pause,
    Resume,
    Stop,
}

impl Control {
    /// Parses one line typed on the control console.
    pub fn parse(line: &str) -> Option<Self> {
        match line.trim().to_ascii_lowercase().as_str() {
            "p" | "toggle" => Some(Control::TogglePause),
            "pause" => Some(Control::Pause),
            "resume" => Some(Control::Resume),
            "q" | "quit" | "stop" | "exit" => Some(Control::Stop),
            _ => None,
        }
    }
}

/// Sending half of the session's control channel.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: Sender<Control>,
}

impl ControlHandle {
    /// Returns false once the session is gone.
    pub fn send(&self, control: Control) -> bool {
        self.tx.send(control).is_ok()
    }

    pub fn stop(&self) -> bool {
        self.send(Control::Stop)
    }
}

/// Returned by every suspend point once the session has been stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

pub type Flow<T = ()> = Result<T, Stopped>;

/// Run/pause state and pause-excluded wall clock of one automation run.
///
/// Only the loop owns a `Session`; other threads talk to it through a
/// [`ControlHandle`], and queued commands are applied at suspend points.
#[derive(Debug)]
pub struct Session {
    running: bool,
    paused: bool,
    /// Shifted forward by each completed pause so `now - start` excludes pauses.
    start: Option<Instant>,
    started_at: Option<DateTime<Utc>>,
    pause_started: Option<Instant>,
    total_paused: Duration,
    poll: Duration,
    controls: Option<Receiver<Control>>,
}

impl Session {
    pub fn new(poll: Duration) -> Self {
        Self {
            running: true,
            paused: false,
            start: None,
            started_at: None,
            pause_started: None,
            total_paused: Duration::ZERO,
            poll: poll.max(Duration::from_millis(1)),
            controls: None,
        }
    }

    /// Session plus the handle used to pause/stop it from another thread.
    pub fn channel(poll: Duration) -> (Self, ControlHandle) {
        let (tx, rx) = mpsc::channel();
        let mut session = Self::new(poll);
        session.controls = Some(rx);
        (session, ControlHandle { tx })
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[cfg(test)]
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Starts the clock. Time spent before this call is not counted.
    pub fn start_clock(&mut self) {
        self.start_clock_at(Instant::now());
    }

    pub fn start_clock_at(&mut self, now: Instant) {
        self.start = Some(now);
        self.started_at = Some(Utc::now());
        if self.paused {
            self.pause_started = Some(now);
        }
    }

    pub fn pause_at(&mut self, now: Instant) {
        if !self.running || self.paused {
            return;
        }
        self.paused = true;
        self.pause_started = Some(now);
        log::info!("paused; send pause again to resume");
    }

    pub fn resume_at(&mut self, now: Instant) {
        if !self.paused {
            return;
        }
        self.paused = false;
        self.close_pause(now);
        log::info!("resumed");
    }

    pub fn toggle_pause_at(&mut self, now: Instant) {
        if self.paused {
            self.resume_at(now);
        } else {
            self.pause_at(now);
        }
    }

    pub fn stop_at(&mut self, now: Instant) {
        if !self.running {
            return;
        }
        if self.paused {
            self.paused = false;
            self.close_pause(now);
        }
        self.running = false;
        log::info!("stop requested");
    }

    #[cfg(test)]
    pub fn stop(&mut self) {
        self.stop_at(Instant::now());
    }

    fn close_pause(&mut self, now: Instant) {
        if let Some(began) = self.pause_started.take() {
            let paused_for = now.saturating_duration_since(began);
            self.total_paused += paused_for;
            if let Some(start) = self.start.as_mut() {
                *start += paused_for;
            }
        }
    }

    /// Accumulated pause time of completed pauses; never decreases.
    pub fn total_paused(&self) -> Duration {
        self.total_paused
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed_at(Instant::now())
    }

    /// Pause-excluded run time; an ongoing pause is not counted either.
    pub fn elapsed_at(&self, now: Instant) -> Duration {
        let Some(start) = self.start else {
            return Duration::ZERO;
        };
        let until = match (self.paused, self.pause_started) {
            (true, Some(began)) => began,
            _ => now,
        };
        until.saturating_duration_since(start)
    }

    pub fn apply(&mut self, control: Control) {
        let now = Instant::now();
        match control {
            Control::TogglePause => self.toggle_pause_at(now),
            Control::Pause => self.pause_at(now),
            Control::Resume => self.resume_at(now),
            Control::Stop => self.stop_at(now),
        }
    }

    /// Applies every queued control command.
    pub fn poll_controls(&mut self) {
        let mut pending = Vec::new();
        if let Some(rx) = self.controls.as_ref() {
            loop {
                match rx.try_recv() {
                    Ok(control) => pending.push(control),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.controls = None;
                        break;
                    }
                }
            }
        }
        for control in pending {
            self.apply(control);
        }
    }

    /// Suspend point: blocks while paused, fails once stopped.
    pub fn checkpoint(&mut self) -> Flow {
        self.poll_controls();
        while self.paused && self.running {
            thread::sleep(self.poll);
            self.poll_controls();
        }
        if self.running {
            Ok(())
        } else {
            Err(Stopped)
        }
    }

    /// Sleeps `duration` in poll-sized slices, honoring pause and stop between slices.
    pub fn wait(&mut self, duration: Duration) -> Flow {
        let mut left = duration;
        loop {
            self.checkpoint()?;
            if left.is_zero() {
                return Ok(());
            }
            let slice = left.min(self.poll);
            thread::sleep(slice);
            left -= slice;
        }
    }
}
