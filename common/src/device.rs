//! Narrow interfaces to the board-level glue the station depends on.

use std::{thread, time::Duration};

pub trait NetworkLink {
    fn is_connected(&self) -> bool;
    fn local_address(&self) -> Option<String>;
}

/// Periodic "still alive" signal for a supervising watchdog.
pub trait LivenessSignal {
    fn notify_activity(&self);
}

pub trait DeviceReset {
    /// Restarts the device. Hardware implementations do not return.
    fn trigger_reset(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndicatorEvent {
    Startup,
    WifiStatus { connected: bool },
    ReadingSensors,
    GeneralError,
}

/// Best-effort lifecycle signalling. Implementations swallow their own errors.
pub trait IndicatorLight {
    fn signal(&self, event: IndicatorEvent);
}

/// One on/off step of a blink pattern, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blink {
    pub on_ms: u64,
    pub off_ms: u64,
}

impl IndicatorEvent {
    pub fn pattern(self) -> Vec<Blink> {
        const fn blink(on_ms: u64, off_ms: u64) -> Blink {
            Blink { on_ms, off_ms }
        }

        match self {
            Self::Startup => vec![blink(50, 50); 3],
            Self::WifiStatus { connected: true } => vec![blink(100, 100); 2],
            Self::WifiStatus { connected: false } => vec![blink(500, 100)],
            Self::ReadingSensors => vec![blink(50, 0)],
            Self::GeneralError => {
                // S-O-S, three times.
                let mut steps = Vec::with_capacity(27);
                for _ in 0..3 {
                    steps.extend([blink(50, 50); 3]);
                    steps.extend([blink(150, 50); 3]);
                    steps.extend([blink(50, 50); 3]);
                }
                steps
            }
        }
    }
}

/// Blocking wait between samples. Injected so tests can observe the cadence.
pub trait Delay {
    fn delay(&mut self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadDelay;

impl Delay for ThreadDelay {
    fn delay(&mut self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}
