//! Class A receive windows.
//!
//! After every uplink the device opens RX1 after `rx1_delay` and RX2 one
//! second later. Each window keeps the radio in STANDBY for a few symbols;
//! if a preamble is caught the radio stays in RX past the window's end.

use std::time::Duration;

use super::end_device_phy::{EndDevicePhy, RadioState};
use super::events::{SimContext, SimEvent};
use super::scheduler::EventId;

/// Default delay between the end of an uplink and RX1.
pub const DEFAULT_RX1_DELAY: Duration = Duration::from_secs(1);
/// RX2 opens this long after RX1.
pub const RX2_AFTER_RX1: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveWindow {
    First,
    Second,
}

/// Radio settings while a window is open.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSettings {
    pub frequency: u32,
    pub spreading_factor: u8,
    pub duration: Duration,
}

pub struct ReceiveWindowManager {
    device: usize,
    rx1_delay: Duration,
    first: WindowSettings,
    second: WindowSettings,
    close_event: Option<EventId>,
    second_event: Option<EventId>,
}

impl ReceiveWindowManager {
    pub fn new(device: usize, first: WindowSettings, second: WindowSettings) -> Self {
        ReceiveWindowManager {
            device,
            rx1_delay: DEFAULT_RX1_DELAY,
            first,
            second,
            close_event: None,
            second_event: None,
        }
    }

    pub fn rx1_delay(&self) -> Duration {
        self.rx1_delay
    }

    pub fn set_rx1_delay(&mut self, delay: Duration) {
        self.rx1_delay = delay;
    }

    pub fn set_first_window(&mut self, settings: WindowSettings) {
        self.first = settings;
    }

    pub fn set_second_window(&mut self, settings: WindowSettings) {
        self.second = settings;
    }

    pub fn second_window(&self) -> WindowSettings {
        self.second
    }

    /// Schedule both windows relative to the end of the uplink (now).
    pub fn start(&mut self, ctx: &mut SimContext) {
        ctx.schedule(self.rx1_delay, SimEvent::OpenWindow { device: self.device, window: ReceiveWindow::First });
        self.second_event = Some(ctx.schedule(
            self.rx1_delay + RX2_AFTER_RX1,
            SimEvent::OpenWindow { device: self.device, window: ReceiveWindow::Second },
        ));
    }

    pub fn open(&mut self, ctx: &mut SimContext, phy: &mut EndDevicePhy, window: ReceiveWindow) {
        let settings = match window {
            ReceiveWindow::First => self.first,
            ReceiveWindow::Second => self.second,
        };
        if phy.state() != RadioState::Sleep && phy.state() != RadioState::Standby {
            log::debug!("Device {} radio busy ({:?}), skipping {:?}", self.device, phy.state(), window);
            return;
        }
        phy.set_rx_frequency(settings.frequency);
        phy.set_rx_spreading_factor(settings.spreading_factor);
        phy.switch_to_standby();
        self.close_event = Some(ctx.schedule(settings.duration, SimEvent::CloseWindow { device: self.device, window }));
    }

    /// Close `window`. Returns `true` when the last window closed empty.
    pub fn close(&mut self, phy: &mut EndDevicePhy, window: ReceiveWindow) -> bool {
        self.close_event = None;
        match phy.state() {
            RadioState::Rx => false,
            RadioState::Standby => {
                phy.switch_to_sleep();
                window == ReceiveWindow::Second
            }
            _ => false,
        }
    }

    /// Cancel the pending close and put an idle radio to sleep.
    pub fn force_sleep(&mut self, ctx: &mut SimContext, phy: &mut EndDevicePhy) {
        if let Some(id) = self.close_event.take() {
            ctx.queue.cancel(id);
        }
        if phy.state() == RadioState::Standby {
            phy.switch_to_sleep();
        }
    }

    /// Abandon the remaining windows.
    pub fn stop(&mut self, ctx: &mut SimContext, phy: &mut EndDevicePhy) {
        self.force_sleep(ctx, phy);
        if let Some(id) = self.second_event.take() {
            ctx.queue.cancel(id);
        }
    }

    pub fn no_more_windows(&self, ctx: &SimContext) -> bool {
        !self.second_event.is_some_and(|id| ctx.queue.is_pending(id))
    }
}
