//! The doorbell's GPIO panel: three status lights, the bell button and the
//! door switch.
//!
//! Outputs are written synchronously by the access controller. Inputs are
//! watched on one thread per pin; each level change is translated into an
//! [`EdgeEvent`] and handed to a callback, which normally enqueues it for
//! the access-control loop.

use crate::gpio::{GpioError, InputPin, OutputPin};
use doorbell_core::{EdgeEvent, Indicator, Indicators, PanelError};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How often watcher threads wake to check the stop flag.
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Contacts bounce for a few milliseconds; the level is re-read this long
/// after an edge before it counts.
const SETTLE_DELAY: Duration = Duration::from_millis(30);

/// BCM pin numbers, offset by `base` for kernels that number GPIOs from a
/// non-zero chip base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinMap {
    pub base: u32,
    pub led_red: u32,
    pub led_yellow: u32,
    pub led_green: u32,
    pub bell_button: u32,
    pub door_switch: u32,
}

impl Default for PinMap {
    fn default() -> Self {
        Self {
            base: 0,
            led_red: 4,
            led_yellow: 5,
            led_green: 6,
            bell_button: 27,
            door_switch: 26,
        }
    }
}

impl PinMap {
    fn sysfs(&self, bcm: u32) -> u32 {
        self.base + bcm
    }
}

/// The three status lights.
pub struct GpioPanel {
    red: OutputPin,
    yellow: OutputPin,
    green: OutputPin,
}

impl GpioPanel {
    pub fn open(root: &Path, pins: &PinMap) -> Result<Self, GpioError> {
        let panel = Self {
            red: OutputPin::open(root, pins.sysfs(pins.led_red))?,
            yellow: OutputPin::open(root, pins.sysfs(pins.led_yellow))?,
            green: OutputPin::open(root, pins.sysfs(pins.led_green))?,
        };
        tracing::info!(
            red = panel.red.number(),
            yellow = panel.yellow.number(),
            green = panel.green.number(),
            "indicator pins ready"
        );
        Ok(panel)
    }
}

impl Indicators for GpioPanel {
    fn set_indicator(&mut self, indicator: Indicator, on: bool) -> Result<(), PanelError> {
        let pin = match indicator {
            Indicator::Red => &mut self.red,
            Indicator::Yellow => &mut self.yellow,
            Indicator::Green => &mut self.green,
        };
        pin.set(on)
            .map_err(|source| PanelError::Write { indicator, source })
    }
}

/// Which physical input a watcher is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PanelInput {
    BellButton,
    DoorSwitch,
}

/// Translate a level change into an edge event.
///
/// The bell fires on release; the door switch reports open on press and
/// closed on release.
fn classify(input: PanelInput, pressed: bool) -> Option<EdgeEvent> {
    match (input, pressed) {
        (PanelInput::BellButton, false) => Some(EdgeEvent::BellReleased),
        (PanelInput::BellButton, true) => None,
        (PanelInput::DoorSwitch, true) => Some(EdgeEvent::DoorOpened),
        (PanelInput::DoorSwitch, false) => Some(EdgeEvent::DoorClosed),
    }
}

/// Last accepted level of one input.
#[derive(Debug)]
struct Debounce {
    level: bool,
}

impl Debounce {
    fn new(level: bool) -> Self {
        Self { level }
    }

    /// Feed the level read after the settle delay. Returns the new level
    /// when it differs from the last accepted one.
    fn settle(&mut self, settled: bool) -> Option<bool> {
        if settled == self.level {
            return None;
        }
        self.level = settled;
        Some(settled)
    }
}

/// Background threads turning input edges into [`EdgeEvent`]s.
pub struct EdgeWatcher {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl EdgeWatcher {
    pub fn spawn<F>(root: &Path, pins: &PinMap, on_edge: F) -> Result<Self, GpioError>
    where
        F: Fn(EdgeEvent) + Send + Sync + 'static,
    {
        let bell = InputPin::open(root, pins.sysfs(pins.bell_button))?;
        let door = InputPin::open(root, pins.sysfs(pins.door_switch))?;

        let stop = Arc::new(AtomicBool::new(false));
        let on_edge = Arc::new(on_edge);
        let mut threads = Vec::with_capacity(2);

        for (input, pin) in [(PanelInput::BellButton, bell), (PanelInput::DoorSwitch, door)] {
            let stop = Arc::clone(&stop);
            let on_edge = Arc::clone(&on_edge);
            let number = pin.number();
            let handle = std::thread::Builder::new()
                .name(format!("doorbell-gpio{number}"))
                .spawn(move || watch_pin(input, pin, &stop, &*on_edge))
                .map_err(|source| GpioError::Spawn { pin: number, source })?;
            threads.push(handle);
        }

        Ok(Self { stop, threads })
    }

    /// Signal the watcher threads and wait for them to exit.
    pub fn stop(self) {
        self.stop.store(true, Ordering::Release);
        for handle in self.threads {
            if handle.join().is_err() {
                tracing::warn!("gpio watcher thread panicked");
            }
        }
    }
}

fn watch_pin(input: PanelInput, mut pin: InputPin, stop: &AtomicBool, on_edge: &dyn Fn(EdgeEvent)) {
    let initial = match pin.is_active() {
        Ok(level) => level,
        Err(e) => {
            tracing::warn!(error = %e, ?input, "initial gpio read failed; assuming released");
            false
        }
    };
    tracing::debug!(?input, pin = pin.number(), pressed = initial, "gpio watcher started");
    let mut debounce = Debounce::new(initial);

    while !stop.load(Ordering::Acquire) {
        match pin.wait_edge(WATCH_POLL_INTERVAL) {
            Ok(Some(seen)) => {
                std::thread::sleep(SETTLE_DELAY);
                let settled = pin.is_active().unwrap_or(seen);
                if let Some(edge) = debounce.settle(settled).and_then(|level| classify(input, level)) {
                    on_edge(edge);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, ?input, "gpio wait failed");
                std::thread::sleep(WATCH_POLL_INTERVAL);
            }
        }
    }
    tracing::debug!(?input, "gpio watcher stopped");
}

/// Default sysfs root, overridable for tests and unusual mounts.
pub fn sysfs_root() -> PathBuf {
    PathBuf::from(crate::gpio::SYSFS_GPIO_ROOT)
}
