//! Per-receiver interference bookkeeping.
//!
//! Every signal that starts arriving at a radio is recorded as an
//! [`InterferenceEvent`], whether or not the radio tries to demodulate it.
//! When a reception ends, the energy that other same-frequency signals
//! deposited during its lifetime is integrated per interfering spreading
//! factor and compared against an isolation matrix.

use std::time::Duration;

use serde::Deserialize;

use super::signal_calculations::dbm_to_w;

/// Default number of events kept before old ones are pruned.
pub const DEFAULT_PRUNE_THRESHOLD: usize = 100;
/// Default time an event is kept after it ended.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(2);

/// Rounding slack on the SIR comparison. A ratio exactly at the threshold survives.
const SIR_TOLERANCE_DB: f64 = 1e-9;

/// Minimum signal-to-interference ratio (dB) per (signal SF, interferer SF) pair.
///
/// Rows are the SF of the wanted signal, columns the SF of the interferer,
/// both indexed by `SF - 7`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IsolationMatrix {
    /// Measured on SX1272 hardware (Goursaud and Gorce, 2015).
    #[default]
    Goursaud,
    /// Measured by Croce et al., 2018.
    Croce,
    /// Any same-SF overlap destroys, cross-SF never interferes.
    Aloha,
}

const GOURSAUD: [[f64; 6]; 6] = [
    [6.0, -16.0, -18.0, -19.0, -19.0, -20.0],
    [-24.0, 6.0, -20.0, -22.0, -22.0, -22.0],
    [-27.0, -27.0, 6.0, -23.0, -25.0, -25.0],
    [-30.0, -30.0, -30.0, 6.0, -26.0, -28.0],
    [-33.0, -33.0, -33.0, -33.0, 6.0, -29.0],
    [-36.0, -36.0, -36.0, -36.0, -36.0, 6.0],
];

const CROCE: [[f64; 6]; 6] = [
    [1.0, -8.0, -9.0, -9.0, -9.0, -9.0],
    [-11.0, 1.0, -11.0, -12.0, -13.0, -13.0],
    [-15.0, -13.0, 1.0, -13.0, -14.0, -15.0],
    [-19.0, -18.0, -17.0, 1.0, -17.0, -18.0],
    [-22.0, -22.0, -21.0, -20.0, 1.0, -20.0],
    [-25.0, -25.0, -25.0, -24.0, -23.0, 1.0],
];

impl IsolationMatrix {
    /// Required SIR in dB for a `signal_sf` packet to survive `interferer_sf` energy.
    ///
    /// Both SFs must be within 7..=12.
    pub fn threshold(self, signal_sf: u8, interferer_sf: u8) -> f64 {
        let row = (signal_sf - 7) as usize;
        let col = (interferer_sf - 7) as usize;
        match self {
            IsolationMatrix::Goursaud => GOURSAUD[row][col],
            IsolationMatrix::Croce => CROCE[row][col],
            IsolationMatrix::Aloha => {
                if row == col {
                    f64::MAX
                } else {
                    -f64::MAX
                }
            }
        }
    }
}

/// Handle to an event recorded by an [`InterferenceTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalId(u64);

/// One incoming signal as seen by a single receiver. Immutable once recorded.
#[derive(Debug, Clone)]
pub struct InterferenceEvent {
    pub id: SignalId,
    pub start: Duration,
    pub end: Duration,
    pub rx_power_dbm: f64,
    pub spreading_factor: u8,
    pub frequency: u32,
    pub packet_id: u64,
}

impl InterferenceEvent {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Length of the intersection of the two `[start, end)` intervals.
    pub fn overlap(&self, other: &InterferenceEvent) -> Duration {
        overlap_time(self.start, self.end, other.start, other.end)
    }
}

/// Intersection length of `[a_start, a_end)` and `[b_start, b_end)`, zero when disjoint.
pub fn overlap_time(a_start: Duration, a_end: Duration, b_start: Duration, b_end: Duration) -> Duration {
    let start = a_start.max(b_start);
    let end = a_end.min(b_end);
    end.saturating_sub(start)
}

pub struct InterferenceTracker {
    events: Vec<InterferenceEvent>,
    next_id: u64,
    matrix: IsolationMatrix,
    retention: Duration,
    prune_threshold: usize,
}

impl InterferenceTracker {
    pub fn new(matrix: IsolationMatrix) -> Self {
        Self::with_retention(matrix, DEFAULT_RETENTION, DEFAULT_PRUNE_THRESHOLD)
    }

    pub fn with_retention(matrix: IsolationMatrix, retention: Duration, prune_threshold: usize) -> Self {
        InterferenceTracker {
            events: Vec::new(),
            next_id: 0,
            matrix,
            retention,
            prune_threshold,
        }
    }

    /// Record a signal that starts arriving at `now`.
    pub fn add(&mut self, now: Duration, duration: Duration, rx_power_dbm: f64, spreading_factor: u8, packet_id: u64, frequency: u32) -> SignalId {
        let id = SignalId(self.next_id);
        self.next_id += 1;
        self.events.push(InterferenceEvent {
            id,
            start: now,
            end: now + duration,
            rx_power_dbm,
            spreading_factor,
            frequency,
            packet_id,
        });

        if self.events.len() > self.prune_threshold {
            self.clean_old_events(now);
        }
        id
    }

    pub fn event(&self, id: SignalId) -> Option<&InterferenceEvent> {
        self.events.iter().find(|e| e.id == id)
    }

    pub fn events(&self) -> &[InterferenceEvent] {
        &self.events
    }

    /// Drop events that ended more than the retention time before `now`.
    pub fn clean_old_events(&mut self, now: Duration) {
        let retention = self.retention;
        let before = self.events.len();
        self.events.retain(|e| e.end + retention >= now);
        log::trace!("Pruned {} interference events", before - self.events.len());
    }

    pub fn clear_all_events(&mut self) {
        self.events.clear();
    }

    /// Decide whether the signal survived the interference it overlapped with.
    ///
    /// # Returns
    ///
    /// `None` if the signal survived, otherwise the first interfering SF
    /// (scanned from 7 to 12) whose cumulative energy pushed the SIR below the
    /// isolation threshold.
    ///
    /// # Notes
    ///
    /// - Only events on exactly the same frequency contribute
    /// - Energy is `overlap × power` in joules, accumulated per interferer SF
    /// - The wanted signal's energy covers its whole duration
    pub fn is_destroyed_by_interference(&self, id: SignalId) -> Option<u8> {
        let Some(signal) = self.event(id) else {
            log::warn!("Interference check for unknown signal {:?}", id);
            return None;
        };
        if !(7..=12).contains(&signal.spreading_factor) {
            log::warn!("Interference check for signal with unsupported SF{}", signal.spreading_factor);
            return None;
        }

        let mut interference_energy = [0.0_f64; 6];
        for other in &self.events {
            if other.id == id || other.frequency != signal.frequency {
                continue;
            }
            if !(7..=12).contains(&other.spreading_factor) {
                continue;
            }
            let overlap = signal.overlap(other);
            if overlap.is_zero() {
                continue;
            }
            interference_energy[(other.spreading_factor - 7) as usize] += overlap.as_secs_f64() * dbm_to_w(other.rx_power_dbm);
        }

        let signal_energy = signal.duration().as_secs_f64() * dbm_to_w(signal.rx_power_dbm);

        for (index, energy) in interference_energy.iter().enumerate() {
            let interferer_sf = 7 + index as u8;
            // Zero interference energy gives +inf, which always survives.
            let sir = 10.0 * (signal_energy / energy).log10();
            if sir < self.matrix.threshold(signal.spreading_factor, interferer_sf) - SIR_TOLERANCE_DB {
                log::debug!("Signal {:?} (SF{}) destroyed by SF{} energy, SIR {:.2} dB", id, signal.spreading_factor, interferer_sf, sir);
                return Some(interferer_sf);
            }
        }
        None
    }
}
