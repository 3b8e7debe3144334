//! Simulated host for development and demos.
//!
//! Produces the variables the battery and radio panels display: battery
//! potentials drifting slowly around their nominal value, battery currents,
//! and a radio with active/standby frequencies that swap when the transfer
//! button variable is written. Reads take a random amount of time and may fail
//! at a configurable rate, so the poll loop sees realistic host behavior.

use super::{ExternalStateSource, ReadError, Value};
use crate::config::SimulationConfig;
use crate::registry::{Key, Unit};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Variable names understood by the simulated host.
pub mod vars {
    pub const BAT_1_POTENTIAL: &str = "L:A32NX_ELEC_BAT_1_POTENTIAL";
    pub const BAT_2_POTENTIAL: &str = "L:A32NX_ELEC_BAT_2_POTENTIAL";
    pub const BAT_1_POTENTIAL_NORMAL: &str = "L:A32NX_ELEC_BAT_1_POTENTIAL_NORMAL";
    pub const BAT_2_POTENTIAL_NORMAL: &str = "L:A32NX_ELEC_BAT_2_POTENTIAL_NORMAL";
    pub const BAT_1_CURRENT: &str = "L:A32NX_ELEC_BAT_1_CURRENT";
    pub const BAT_2_CURRENT: &str = "L:A32NX_ELEC_BAT_2_CURRENT";
    pub const COM_ACTIVE: &str = "COM ACTIVE FREQUENCY:1";
    pub const COM_STANDBY: &str = "COM STANDBY FREQUENCY:1";
    pub const COM_TRANSMIT: &str = "COM TRANSMIT:1";
    pub const RMP_TRANSFER: &str = "L:A32NX_RMP_L_TRANSFER_PRESSED";
}

const NOMINAL_BATTERY_VOLTS: f64 = 25.5;
const NORMAL_BATTERY_THRESHOLD: f64 = 25.0;

struct SimState {
    com_active_mhz: f64,
    com_standby_mhz: f64,
    transmit: bool,
    /// Slow random walk added to each battery's potential.
    battery_drift: [f64; 2],
    /// Variables written by clients that the model does not own.
    written: HashMap<Key, Value>,
}

pub struct SimulatedPanelSource {
    config: SimulationConfig,
    started: Instant,
    state: Mutex<SimState>,
    rng: Mutex<StdRng>,
}

impl SimulatedPanelSource {
    pub fn new(config: SimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        info!(
            "[Sim] Simulated host ready (failure rate {:.2}, latency up to {}ms)",
            config.failure_rate, config.max_latency_ms
        );
        Self {
            config,
            started: Instant::now(),
            state: Mutex::new(SimState {
                com_active_mhz: 122.800,
                com_standby_mhz: 118.700,
                transmit: false,
                battery_drift: [0.0; 2],
                written: HashMap::new(),
            }),
            rng: Mutex::new(rng),
        }
    }

    /// Advance the battery's random walk and return the new potential.
    fn step_battery_potential(&self, index: usize) -> f64 {
        let step = self.rng.lock().gen_range(-0.02..0.02);
        {
            let mut state = self.state.lock();
            let drift = &mut state.battery_drift[index];
            *drift = (*drift + step).clamp(-0.6, 0.6);
        }
        self.battery_potential(index)
    }

    /// Current potential, without moving the random walk.
    fn battery_potential(&self, index: usize) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        let drift = self.state.lock().battery_drift[index];
        let wave = (elapsed / 20.0 + index as f64).sin() * 0.3;
        round_to(NOMINAL_BATTERY_VOLTS + wave + drift, 1)
    }

    fn battery_current(&self, index: usize) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        round_to((elapsed / 7.0 + index as f64 * 2.0).cos() * 3.0, 0)
    }

    fn frequency_in(unit: Unit, mhz: f64) -> Value {
        match unit {
            Unit::Hertz => Value::Number((mhz * 1_000_000.0).round()),
            Unit::Kilohertz => Value::Number((mhz * 1_000.0).round()),
            _ => Value::Number(round_to(mhz, 3)),
        }
    }

    fn model_value(&self, key: &Key) -> Option<Value> {
        let value = match key.name() {
            vars::BAT_1_POTENTIAL => Value::Number(self.step_battery_potential(0)),
            vars::BAT_2_POTENTIAL => Value::Number(self.step_battery_potential(1)),
            vars::BAT_1_POTENTIAL_NORMAL => {
                Value::Bool(self.battery_potential(0) > NORMAL_BATTERY_THRESHOLD)
            }
            vars::BAT_2_POTENTIAL_NORMAL => {
                Value::Bool(self.battery_potential(1) > NORMAL_BATTERY_THRESHOLD)
            }
            vars::BAT_1_CURRENT => Value::Number(self.battery_current(0)),
            vars::BAT_2_CURRENT => Value::Number(self.battery_current(1)),
            vars::COM_ACTIVE => Self::frequency_in(key.unit(), self.state.lock().com_active_mhz),
            vars::COM_STANDBY => Self::frequency_in(key.unit(), self.state.lock().com_standby_mhz),
            vars::COM_TRANSMIT => Value::Bool(self.state.lock().transmit),
            _ => return self.state.lock().written.get(key).copied(),
        };
        Some(value)
    }

    async fn simulate_latency(&self) {
        if self.config.max_latency_ms == 0 {
            return;
        }
        let delay = self.rng.lock().gen_range(0..=self.config.max_latency_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    fn should_fail(&self) -> bool {
        let rate = self.config.failure_rate.clamp(0.0, 1.0);
        rate > 0.0 && self.rng.lock().gen_bool(rate)
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[async_trait]
impl ExternalStateSource for SimulatedPanelSource {
    async fn read(&self, key: &Key) -> Result<Value, ReadError> {
        self.simulate_latency().await;
        if self.should_fail() {
            return Err(ReadError::Busy(format!("simulated miss on {}", key)));
        }
        self.model_value(key)
            .ok_or_else(|| ReadError::Unavailable(key.to_string()))
    }

    async fn write(&self, key: &Key, value: Value) -> Result<(), ReadError> {
        self.simulate_latency().await;
        let mut guard = self.state.lock();
        let state = &mut *guard;
        match key.name() {
            vars::RMP_TRANSFER => {
                if value.as_bool() {
                    std::mem::swap(&mut state.com_active_mhz, &mut state.com_standby_mhz);
                    info!(
                        "[Sim] COM1 transfer: active {:.3}, standby {:.3}",
                        state.com_active_mhz, state.com_standby_mhz
                    );
                }
            }
            vars::COM_STANDBY => {
                let mhz = match key.unit() {
                    Unit::Hertz => value.as_f64() / 1_000_000.0,
                    Unit::Kilohertz => value.as_f64() / 1_000.0,
                    _ => value.as_f64(),
                };
                if !(118.0..137.0).contains(&mhz) {
                    return Err(ReadError::Rejected(format!(
                        "{mhz:.3} MHz outside the VHF COM band"
                    )));
                }
                state.com_standby_mhz = mhz;
            }
            vars::COM_TRANSMIT => state.transmit = value.as_bool(),
            vars::COM_ACTIVE
            | vars::BAT_1_POTENTIAL
            | vars::BAT_2_POTENTIAL
            | vars::BAT_1_POTENTIAL_NORMAL
            | vars::BAT_2_POTENTIAL_NORMAL
            | vars::BAT_1_CURRENT
            | vars::BAT_2_CURRENT => {
                return Err(ReadError::Rejected(format!("{} is read-only", key)));
            }
            _ => {
                state.written.insert(key.clone(), value);
            }
        }
        debug!("[Sim] Wrote {} = {}", key, value);
        Ok(())
    }
}
