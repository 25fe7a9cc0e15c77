//! Door and bell access-control state machine.
//!
//! The door axis has three states (`Locked`, `UnlockedClosed`,
//! `UnlockedOpen`) and the bell axis two (`Idle`, `Ringing`). Hardware
//! edges, recognition results, admin commands and the periodic timer sweep
//! are all applied through `&mut self`, so the owner serializes them.
//!
//! Indicator pattern:
//!
//! | State          | Red | Yellow        | Green |
//! |----------------|-----|---------------|-------|
//! | Locked         | on  | off           | off   |
//! | Bell ringing   | -   | on            | -     |
//! | Unlocked       | off | off           | on    |
//!
//! Indicators are written on transitions only. A failed write is logged
//! and the state machine carries on.

use crate::types::UNKNOWN;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Door open longer than this raises the open-too-long warning.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(15);
/// Unlocked-but-closed door re-locks itself after this long.
pub const RELOCK_TIMEOUT: Duration = Duration::from_secs(30);
/// A ringing bell silences itself after this long.
pub const BELL_TIMEOUT: Duration = Duration::from_secs(30);

/// Name recorded for unlocks issued from the admin surface.
pub const ADMIN_NAME: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DoorState {
    Locked,
    UnlockedClosed,
    UnlockedOpen,
}

impl DoorState {
    pub fn is_unlocked(self) -> bool {
        !matches!(self, DoorState::Locked)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BellState {
    Idle,
    Ringing,
}

/// Status lights on the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Indicator {
    Red,
    Yellow,
    Green,
}

#[derive(Error, Debug)]
pub enum PanelError {
    #[error("{indicator:?} indicator write failed: {source}")]
    Write {
        indicator: Indicator,
        source: std::io::Error,
    },
}

/// Output side of the actuator panel.
pub trait Indicators {
    fn set_indicator(&mut self, indicator: Indicator, on: bool) -> Result<(), PanelError>;
}

/// Edge notifications from the bell button and the door switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeEvent {
    /// Door switch pressed: the door swung open.
    DoorOpened,
    /// Door switch released: the door shut.
    DoorClosed,
    /// Bell button released after a press.
    BellReleased,
}

/// Who caused a transition, for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    Bell,
    Sensor,
    Recognition,
    Admin,
    Timeout,
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Actor::Bell => "bell",
            Actor::Sensor => "sensor",
            Actor::Recognition => "recognition",
            Actor::Admin => "admin",
            Actor::Timeout => "timeout",
            Actor::System => "system",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessEventKind {
    BellRang,
    BellSilenced,
    Unlocked,
    Locked,
    DoorOpened,
    DoorClosed,
    OpenedWhileLocked,
}

/// One entry of the access history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessEvent {
    pub at: DateTime<Utc>,
    pub kind: AccessEventKind,
    pub actor: Actor,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Owns door state, bell state and every policy timer.
pub struct AccessController<P: Indicators> {
    panel: P,
    door: DoorState,
    bell: BellState,
    last_bell: Option<Instant>,
    last_unlock: Option<Instant>,
    last_open: Option<Instant>,
    current_identity: String,
    events: Vec<AccessEvent>,
}

impl<P: Indicators> AccessController<P> {
    /// Take ownership of the panel and drive it to the locked, idle pattern.
    pub fn new(panel: P) -> Self {
        let mut controller = Self {
            panel,
            door: DoorState::Locked,
            bell: BellState::Idle,
            last_bell: None,
            last_unlock: None,
            last_open: None,
            current_identity: UNKNOWN.to_string(),
            events: Vec::new(),
        };
        controller.reset();
        controller
    }

    /// Return to locked, idle, all timers cleared.
    ///
    /// The last recognized identity is kept, so a person still standing in
    /// frame does not re-trigger an unlock after a reset.
    pub fn reset(&mut self) {
        self.lock(Actor::System);
        self.bell_off(Actor::System);
        self.last_bell = None;
        self.last_open = None;
    }

    pub fn door(&self) -> DoorState {
        self.door
    }

    pub fn bell(&self) -> BellState {
        self.bell
    }

    pub fn is_ringing(&self) -> bool {
        self.bell == BellState::Ringing
    }

    pub fn current_identity(&self) -> &str {
        &self.current_identity
    }

    pub fn last_bell(&self) -> Option<Instant> {
        self.last_bell
    }

    pub fn last_unlock(&self) -> Option<Instant> {
        self.last_unlock
    }

    pub fn last_open(&self) -> Option<Instant> {
        self.last_open
    }

    pub fn panel(&self) -> &P {
        &self.panel
    }

    pub fn panel_mut(&mut self) -> &mut P {
        &mut self.panel
    }

    /// Take the access events recorded since the last drain.
    pub fn drain_events(&mut self) -> Vec<AccessEvent> {
        std::mem::take(&mut self.events)
    }

    /// Apply one hardware edge.
    pub fn apply_edge(&mut self, edge: EdgeEvent, now: Instant) {
        match edge {
            EdgeEvent::DoorClosed => self.door_closed(),
            EdgeEvent::DoorOpened => self.door_opened(now),
            EdgeEvent::BellReleased => self.ring_bell(now),
        }
    }

    fn door_closed(&mut self) {
        if !self.door.is_unlocked() {
            return;
        }
        self.last_open = None;
        tracing::info!(actor = %Actor::Sensor, "door closed");
        self.record(AccessEventKind::DoorClosed, Actor::Sensor, None);
        self.lock(Actor::Sensor);
    }

    fn door_opened(&mut self, now: Instant) {
        if !self.door.is_unlocked() {
            tracing::warn!(actor = %Actor::Sensor, "door open edge while locked; cannot open locked door");
            self.record(AccessEventKind::OpenedWhileLocked, Actor::Sensor, None);
            return;
        }
        self.last_open = Some(now);
        self.door = DoorState::UnlockedOpen;
        tracing::info!(actor = %Actor::Sensor, "door opened");
        self.record(AccessEventKind::DoorOpened, Actor::Sensor, None);
    }

    fn ring_bell(&mut self, now: Instant) {
        if self.is_ringing() {
            return;
        }
        self.drive(Indicator::Yellow, true);
        self.last_bell = Some(now);
        self.bell = BellState::Ringing;
        tracing::info!(actor = %Actor::Bell, "bell ringing");
        self.record(AccessEventKind::BellRang, Actor::Bell, None);
    }

    fn bell_off(&mut self, actor: Actor) {
        self.drive(Indicator::Yellow, false);
        if self.bell == BellState::Ringing {
            tracing::info!(actor = %actor, "bell silenced");
            self.record(AccessEventKind::BellSilenced, actor, None);
        }
        self.bell = BellState::Idle;
    }

    /// Silence a ringing bell. Returns `false` (and changes nothing) if idle.
    pub fn silence_bell(&mut self, actor: Actor) -> bool {
        if !self.is_ringing() {
            return false;
        }
        self.bell_off(actor);
        true
    }

    /// Drive the panel to the locked pattern and clear the re-lock timer.
    pub fn lock(&mut self, actor: Actor) {
        self.drive(Indicator::Red, true);
        self.drive(Indicator::Yellow, false);
        self.drive(Indicator::Green, false);
        self.door = DoorState::Locked;
        self.last_unlock = None;
        tracing::info!(actor = %actor, "door locked");
        self.record(AccessEventKind::Locked, actor, None);
    }

    /// Unlock for `name`, but only in answer to a ringing bell.
    ///
    /// Returns whether the door was unlocked. An open door stays
    /// `UnlockedOpen`; the switch, not the unlock, reports it closed.
    pub fn unlock(&mut self, name: &str, actor: Actor, now: Instant) -> bool {
        if !self.is_ringing() {
            tracing::debug!(name, actor = %actor, "unlock ignored; bell is idle");
            return false;
        }
        self.drive(Indicator::Red, false);
        self.drive(Indicator::Yellow, false);
        self.drive(Indicator::Green, true);
        self.bell_off(actor);
        if self.door != DoorState::UnlockedOpen {
            self.door = DoorState::UnlockedClosed;
        }
        self.last_unlock = Some(now);
        tracing::info!(name, actor = %actor, "door unlocked");
        self.record(AccessEventKind::Unlocked, actor, Some(name.to_string()));
        true
    }

    /// Admin unlock, subject to the same bell gating as recognition.
    pub fn force_unlock(&mut self, now: Instant) -> bool {
        self.unlock(ADMIN_NAME, Actor::Admin, now)
    }

    /// Feed the identity recognized in the current frame.
    ///
    /// Unlocks only when the identity is a known name that differs from the
    /// previous frame's; the same face seen again does not re-trigger.
    /// Returns whether an unlock happened.
    pub fn observe_identity(&mut self, identity: &str, now: Instant) -> bool {
        let changed = identity != self.current_identity;
        let mut unlocked = false;
        if changed && identity != UNKNOWN && self.is_ringing() {
            unlocked = self.unlock(identity, Actor::Recognition, now);
        }
        if changed {
            tracing::debug!(from = %self.current_identity, to = identity, "identity changed");
            self.current_identity = identity.to_string();
        }
        unlocked
    }

    /// Run the time-based policies. Returns the open-too-long warning.
    pub fn sweep(&mut self, now: Instant) -> bool {
        let open_too_long = self
            .last_open
            .is_some_and(|t| now.duration_since(t) >= OPEN_TIMEOUT);

        if self.door == DoorState::UnlockedClosed
            && self
                .last_unlock
                .is_some_and(|t| now.duration_since(t) >= RELOCK_TIMEOUT)
        {
            tracing::info!(actor = %Actor::Timeout, "unlocked door left closed; re-locking");
            self.lock(Actor::Timeout);
        }

        if self.is_ringing()
            && self
                .last_bell
                .is_some_and(|t| now.duration_since(t) >= BELL_TIMEOUT)
        {
            self.bell_off(Actor::Timeout);
        }

        open_too_long
    }

    fn drive(&mut self, indicator: Indicator, on: bool) {
        if let Err(e) = self.panel.set_indicator(indicator, on) {
            tracing::warn!(error = %e, ?indicator, on, "indicator write failed");
        }
    }

    fn record(&mut self, kind: AccessEventKind, actor: Actor, name: Option<String>) {
        self.events.push(AccessEvent {
            at: Utc::now(),
            kind,
            actor,
            name,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPanel;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    fn controller() -> AccessController<RecordingPanel> {
        AccessController::new(RecordingPanel::default())
    }

    fn assert_locked_pattern(c: &AccessController<RecordingPanel>) {
        let p = c.panel();
        assert!(p.is_on(Indicator::Red));
        assert!(!p.is_on(Indicator::Yellow));
        assert!(!p.is_on(Indicator::Green));
    }

    /// Ring the bell and unlock for "bob" at `t0`.
    fn unlocked_at(t0: Instant) -> AccessController<RecordingPanel> {
        let mut c = controller();
        c.apply_edge(EdgeEvent::BellReleased, t0);
        assert!(c.unlock("bob", Actor::Recognition, t0));
        c
    }

    #[test]
    fn test_initial_state() {
        let c = controller();
        assert_eq!(c.door(), DoorState::Locked);
        assert_eq!(c.bell(), BellState::Idle);
        assert!(c.last_bell().is_none());
        assert!(c.last_unlock().is_none());
        assert!(c.last_open().is_none());
        assert_eq!(c.current_identity(), UNKNOWN);
        assert_locked_pattern(&c);
    }

    #[test]
    fn test_bell_release_starts_ringing() {
        let t0 = Instant::now();
        let mut c = controller();
        c.apply_edge(EdgeEvent::BellReleased, t0);
        assert_eq!(c.bell(), BellState::Ringing);
        assert_eq!(c.last_bell(), Some(t0));
        assert!(c.panel().is_on(Indicator::Yellow));
    }

    #[test]
    fn test_bell_release_while_ringing_keeps_first_timestamp() {
        let t0 = Instant::now();
        let mut c = controller();
        c.apply_edge(EdgeEvent::BellReleased, t0);
        c.apply_edge(EdgeEvent::BellReleased, t0 + secs(10));
        assert_eq!(c.last_bell(), Some(t0));
    }

    #[test]
    fn test_bell_times_out() {
        let t0 = Instant::now();
        let mut c = controller();
        c.apply_edge(EdgeEvent::BellReleased, t0);

        c.sweep(t0 + secs(29));
        assert_eq!(c.bell(), BellState::Ringing);

        c.sweep(t0 + secs(30));
        assert_eq!(c.bell(), BellState::Idle);
        assert!(!c.panel().is_on(Indicator::Yellow));

        let silenced = c
            .drain_events()
            .into_iter()
            .find(|e| e.kind == AccessEventKind::BellSilenced)
            .unwrap();
        assert_eq!(silenced.actor, Actor::Timeout);
    }

    #[test]
    fn test_unlock_ignored_while_idle() {
        let t0 = Instant::now();
        let mut c = controller();
        let writes_before = c.panel().writes.len();

        assert!(!c.unlock("bob", Actor::Recognition, t0));
        assert!(!c.force_unlock(t0));

        assert_eq!(c.door(), DoorState::Locked);
        assert!(c.last_unlock().is_none());
        assert_eq!(c.panel().writes.len(), writes_before, "no indicator may change");
    }

    #[test]
    fn test_unlock_effects() {
        let t0 = Instant::now();
        let c = unlocked_at(t0);
        assert_eq!(c.door(), DoorState::UnlockedClosed);
        assert_eq!(c.bell(), BellState::Idle);
        assert_eq!(c.last_unlock(), Some(t0));
        let p = c.panel();
        assert!(!p.is_on(Indicator::Red));
        assert!(!p.is_on(Indicator::Yellow));
        assert!(p.is_on(Indicator::Green));
    }

    #[test]
    fn test_force_unlock_while_ringing() {
        let t0 = Instant::now();
        let mut c = controller();
        c.apply_edge(EdgeEvent::BellReleased, t0);
        assert!(c.force_unlock(t0));
        let events = c.drain_events();
        let unlock = events.iter().find(|e| e.kind == AccessEventKind::Unlocked).unwrap();
        assert_eq!(unlock.actor, Actor::Admin);
        assert_eq!(unlock.name.as_deref(), Some(ADMIN_NAME));
    }

    #[test]
    fn test_relock_after_timeout_when_closed() {
        let t0 = Instant::now();
        let mut c = unlocked_at(t0);

        c.sweep(t0 + secs(29));
        assert_eq!(c.door(), DoorState::UnlockedClosed);

        c.sweep(t0 + secs(30));
        assert_eq!(c.door(), DoorState::Locked);
        assert!(c.last_unlock().is_none());
        assert_locked_pattern(&c);
    }

    #[test]
    fn test_no_relock_while_open() {
        let t0 = Instant::now();
        let mut c = unlocked_at(t0);
        c.apply_edge(EdgeEvent::DoorOpened, t0 + secs(1));

        c.sweep(t0 + secs(35));
        assert_eq!(c.door(), DoorState::UnlockedOpen);
        assert!(c.panel().is_on(Indicator::Green));
    }

    #[test]
    fn test_open_too_long_warning_clears_on_close() {
        let t0 = Instant::now();
        let mut c = unlocked_at(t0);
        c.apply_edge(EdgeEvent::DoorOpened, t0);

        assert!(!c.sweep(t0 + secs(14)));
        assert!(c.sweep(t0 + secs(15)));
        assert!(c.sweep(t0 + secs(40)));

        c.apply_edge(EdgeEvent::DoorClosed, t0 + secs(41));
        assert!(!c.sweep(t0 + secs(41)));
        assert!(c.last_open().is_none());
    }

    #[test]
    fn test_door_close_locks() {
        let t0 = Instant::now();
        let mut c = unlocked_at(t0);
        c.apply_edge(EdgeEvent::DoorOpened, t0 + secs(2));
        c.apply_edge(EdgeEvent::DoorClosed, t0 + secs(5));
        assert_eq!(c.door(), DoorState::Locked);
        assert!(c.last_unlock().is_none());
        assert_locked_pattern(&c);
    }

    #[test]
    fn test_door_close_while_locked_is_ignored() {
        let t0 = Instant::now();
        let mut c = controller();
        c.drain_events();
        c.apply_edge(EdgeEvent::DoorClosed, t0);
        assert_eq!(c.door(), DoorState::Locked);
        assert!(c.drain_events().is_empty());
    }

    #[test]
    fn test_door_open_while_locked_is_anomaly() {
        let t0 = Instant::now();
        let mut c = controller();
        c.drain_events();
        c.apply_edge(EdgeEvent::DoorOpened, t0);
        assert_eq!(c.door(), DoorState::Locked);
        assert!(c.last_open().is_none());
        let events = c.drain_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, AccessEventKind::OpenedWhileLocked);
    }

    #[test]
    fn test_door_state_reachability_over_edge_sequences() {
        let edges = [EdgeEvent::DoorOpened, EdgeEvent::DoorClosed, EdgeEvent::BellReleased];
        let t0 = Instant::now();
        // Every sequence of four edges, with an unlock attempt after each.
        for seq in 0..(edges.len().pow(4)) {
            let mut c = controller();
            let mut n = seq;
            for step in 0..4u64 {
                let before = c.door();
                let edge = edges[n % edges.len()];
                n /= edges.len();
                let now = t0 + secs(step);
                c.apply_edge(edge, now);
                if c.door() == DoorState::UnlockedOpen && before != DoorState::UnlockedOpen {
                    assert_eq!(before, DoorState::UnlockedClosed);
                    assert_eq!(edge, EdgeEvent::DoorOpened);
                }
                c.unlock("bob", Actor::Recognition, now);
            }
        }
    }

    #[test]
    fn test_silence_bell_is_idempotent() {
        let t0 = Instant::now();
        let mut c = controller();
        assert!(!c.silence_bell(Actor::Admin));
        assert_eq!(c.bell(), BellState::Idle);

        c.apply_edge(EdgeEvent::BellReleased, t0);
        assert!(c.silence_bell(Actor::Admin));
        assert!(!c.silence_bell(Actor::Admin));
        assert_eq!(c.bell(), BellState::Idle);
        assert!(!c.panel().is_on(Indicator::Yellow));
    }

    #[test]
    fn test_identity_change_unlocks_once() {
        let t0 = Instant::now();
        let t1 = t0 + secs(3);
        let mut c = controller();
        c.apply_edge(EdgeEvent::BellReleased, t0);

        assert!(!c.observe_identity(UNKNOWN, t0 + secs(1)));
        assert!(c.observe_identity("Bob", t1));
        assert_eq!(c.door(), DoorState::UnlockedClosed);
        assert_eq!(c.last_unlock(), Some(t1));

        c.apply_edge(EdgeEvent::BellReleased, t1 + secs(1));
        assert!(!c.observe_identity("Bob", t1 + secs(2)), "same face must not re-trigger");
        assert_eq!(c.last_unlock(), Some(t1));
        assert_eq!(c.current_identity(), "Bob");
    }

    #[test]
    fn test_identity_change_needs_ringing_bell() {
        let t0 = Instant::now();
        let mut c = controller();
        assert!(!c.observe_identity("Bob", t0));
        assert_eq!(c.door(), DoorState::Locked);
        assert_eq!(c.current_identity(), "Bob");

        // Bob lingers after the bell rings: no change, no unlock.
        c.apply_edge(EdgeEvent::BellReleased, t0 + secs(1));
        assert!(!c.observe_identity("Bob", t0 + secs(2)));

        // A transient unknown frame and back re-arms the trigger.
        assert!(!c.observe_identity(UNKNOWN, t0 + secs(3)));
        assert!(c.observe_identity("Bob", t0 + secs(4)));
    }

    #[test]
    fn test_unknown_never_unlocks() {
        let t0 = Instant::now();
        let mut c = controller();
        c.observe_identity("Bob", t0);
        c.apply_edge(EdgeEvent::BellReleased, t0);
        assert!(!c.observe_identity(UNKNOWN, t0 + secs(1)));
        assert_eq!(c.door(), DoorState::Locked);
        assert_eq!(c.bell(), BellState::Ringing);
    }

    #[test]
    fn test_unlock_while_open_stays_open() {
        let t0 = Instant::now();
        let mut c = unlocked_at(t0);
        c.apply_edge(EdgeEvent::DoorOpened, t0 + secs(1));
        c.apply_edge(EdgeEvent::BellReleased, t0 + secs(2));
        assert!(c.force_unlock(t0 + secs(3)));
        assert_eq!(c.door(), DoorState::UnlockedOpen);
    }

    #[test]
    fn test_indicator_failure_does_not_abort_transition() {
        let t0 = Instant::now();
        let mut c = controller();
        c.panel_mut().fail_writes = true;
        c.apply_edge(EdgeEvent::BellReleased, t0);
        assert!(c.force_unlock(t0));
        assert_eq!(c.door(), DoorState::UnlockedClosed);
        assert_eq!(c.bell(), BellState::Idle);
    }

    #[test]
    fn test_reset_clears_everything() {
        let t0 = Instant::now();
        let mut c = unlocked_at(t0);
        c.apply_edge(EdgeEvent::DoorOpened, t0);
        c.apply_edge(EdgeEvent::BellReleased, t0);
        c.reset();
        assert_eq!(c.door(), DoorState::Locked);
        assert_eq!(c.bell(), BellState::Idle);
        assert!(c.last_bell().is_none());
        assert!(c.last_unlock().is_none());
        assert!(c.last_open().is_none());
        assert_locked_pattern(&c);
    }

    #[test]
    fn test_event_serialization() {
        let t0 = Instant::now();
        let mut c = unlocked_at(t0);
        let events = c.drain_events();
        let json = serde_json::to_value(events.last().unwrap()).unwrap();
        assert_eq!(json["kind"], "unlocked");
        assert_eq!(json["actor"], "recognition");
        assert_eq!(json["name"], "bob");
    }
}
