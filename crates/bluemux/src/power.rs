//! Power and discoverability arbiter
//!
//! Clients only ever express wishes. The arbiter OR-reduces them (plus a
//! global override) into one controller-wide decision and owns the idle
//! power-off timer. It never talks to the controller itself; callers apply
//! the returned [`PowerAction`] / [`IdleOutcome`].

use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info};

/// Delay before an unneeded controller is powered off
pub const DEFAULT_IDLE_POWER_OFF: Duration = Duration::from_secs(10);

/// Controller state as reported by the HCI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Off = 0,
    Initializing = 1,
    Working = 2,
    Halting = 3,
    Sleeping = 4,
    FallingAsleep = 5,
}

impl ControllerState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ControllerState::Off),
            1 => Some(ControllerState::Initializing),
            2 => Some(ControllerState::Working),
            3 => Some(ControllerState::Halting),
            4 => Some(ControllerState::Sleeping),
            5 => Some(ControllerState::FallingAsleep),
            _ => None,
        }
    }
}

/// Coarse status reported to the status callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BluetoothStatus {
    Off,
    On,
    Active,
}

impl fmt::Display for BluetoothStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BluetoothStatus::Off => write!(f, "off"),
            BluetoothStatus::On => write!(f, "on"),
            BluetoothStatus::Active => write!(f, "active"),
        }
    }
}

/// What the caller has to do after a re-evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    /// Nothing to do
    None,
    /// Power is no longer needed; the idle timer was (re)armed
    ArmedIdleTimer,
    /// Power the controller on
    PowerOn,
}

/// Result of an idle timer check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// Timer not armed or deadline not reached
    NotDue,
    /// Someone wants power again
    FalseAlarm,
    /// Power the controller off
    PowerOff,
}

/// Single-shot deadline
#[derive(Debug, Clone, Copy, Default)]
pub struct IdleTimer {
    deadline: Option<Instant>,
}

impl IdleTimer {
    /// Arm the timer, replacing any pending deadline
    pub fn arm(&mut self, deadline: Instant) {
        self.deadline = Some(deadline);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_due(&self, now: Instant) -> bool {
        matches!(self.deadline, Some(deadline) if now >= deadline)
    }
}

/// Controller-wide power decisions
#[derive(Debug)]
pub struct PowerArbiter {
    global_enable: bool,
    system_sleep: bool,
    idle_timeout: Duration,
    timer: IdleTimer,
    controller_state: ControllerState,
    connection_count: u16,
    discoverable: bool,
}

impl Default for PowerArbiter {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_POWER_OFF)
    }
}

impl PowerArbiter {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            global_enable: false,
            system_sleep: false,
            idle_timeout,
            timer: IdleTimer::default(),
            controller_state: ControllerState::Off,
            connection_count: 0,
            discoverable: false,
        }
    }

    /// Whether the controller must be on
    pub fn requires_power_on(&self, any_session_on: bool) -> bool {
        self.global_enable || any_session_on
    }

    /// Re-evaluate after any change to the clients' power requests
    pub fn evaluate(&mut self, any_session_on: bool, now: Instant) -> PowerAction {
        if !self.requires_power_on(any_session_on) {
            self.timer.arm(now + self.idle_timeout);
            debug!("Power not required, idle timer armed for {:?}", self.idle_timeout);
            return PowerAction::ArmedIdleTimer;
        }

        self.timer.disarm();
        if self.system_sleep {
            debug!("Power required but system is asleep");
            return PowerAction::None;
        }
        PowerAction::PowerOn
    }

    /// Check the idle timer
    pub fn on_timer(&mut self, any_session_on: bool, now: Instant) -> IdleOutcome {
        if !self.timer.is_due(now) {
            return IdleOutcome::NotDue;
        }
        self.timer.disarm();
        if self.requires_power_on(any_session_on) {
            debug!("Idle timer fired: false alarm");
            return IdleOutcome::FalseAlarm;
        }
        info!(
            "No active client for {} seconds, powering off",
            self.idle_timeout.as_secs()
        );
        IdleOutcome::PowerOff
    }

    pub fn global_enable(&self) -> bool {
        self.global_enable
    }

    pub fn set_global_enable(&mut self, enabled: bool) {
        self.global_enable = enabled;
        if enabled {
            self.timer.disarm();
        }
    }

    pub fn system_sleep(&self) -> bool {
        self.system_sleep
    }

    /// The host is about to sleep
    pub fn system_will_sleep(&mut self) {
        self.system_sleep = true;
    }

    /// The host woke up, returns true if the controller must be powered on
    pub fn system_did_wake(&mut self, any_session_on: bool) -> bool {
        self.system_sleep = false;
        self.requires_power_on(any_session_on)
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn timer(&self) -> &IdleTimer {
        &self.timer
    }

    pub fn idle_deadline(&self) -> Option<Instant> {
        self.timer.deadline()
    }

    /// Remember the discoverability last pushed to the controller
    pub fn set_discoverable(&mut self, discoverable: bool) {
        self.discoverable = discoverable;
    }

    pub fn discoverable(&self) -> bool {
        self.discoverable
    }

    pub fn controller_state(&self) -> ControllerState {
        self.controller_state
    }

    pub fn connection_count(&self) -> u16 {
        self.connection_count
    }

    pub fn update_controller_state(&mut self, state: ControllerState) -> BluetoothStatus {
        self.controller_state = state;
        self.status()
    }

    pub fn update_connection_count(&mut self, count: u16) -> BluetoothStatus {
        self.connection_count = count;
        self.status()
    }

    /// Coarse status from the cached controller state and connection count
    pub fn status(&self) -> BluetoothStatus {
        if self.controller_state != ControllerState::Working {
            BluetoothStatus::Off
        } else if self.connection_count > 0 {
            BluetoothStatus::Active
        } else {
            BluetoothStatus::On
        }
    }
}
