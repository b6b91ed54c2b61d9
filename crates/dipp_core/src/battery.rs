//! Orbit-driven battery simulation. One `BatterySim` tracks a single
//! satellite's state of charge; it is read from the scheduler thread on every
//! admission decision and stepped on a fixed cadence by whatever drives the
//! simulated clock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Safety margin subtracted from the observed energy level before it is
/// compared against a module's energy requirement.
pub const BATTERY_SAFETY_MARGIN_WH: f32 = 64.4;

/// Wall-clock cadence at which the simulated clock is advanced.
pub const UPDATE_PERIOD: Duration = Duration::from_millis(10);
/// Simulated time advanced per update.
pub const SIM_STEP_S: f32 = 1.0;
/// How many simulated steps happen per update tick. Cached cost figures are
/// expressed per simulated step and must be scaled by this before being
/// compared against, or subtracted from, the battery.
pub const STEPS_PER_UPDATE: u32 = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrbitalPhase {
    Sunlit,
    Eclipse,
}

#[derive(Clone, Copy, Debug)]
pub struct BatteryParams {
    pub total_capacity_wh: f32,
    pub min_capacity_wh: f32,
    pub max_capacity_wh: f32,
    pub constant_load_w: f32,
    pub power_generation_w: f32,
    pub time_step_s: f32,
    pub orbit_period_s: f32,
    pub sunlit_duration_s: f32,
}

impl Default for BatteryParams {
    fn default() -> Self {
        let total_capacity_wh = 92.0;
        let min_soc = 0.2;
        let max_soc = 1.0;
        Self {
            total_capacity_wh,
            min_capacity_wh: total_capacity_wh * min_soc,
            max_capacity_wh: total_capacity_wh * max_soc,
            constant_load_w: 16.5,
            power_generation_w: 26.0,
            time_step_s: SIM_STEP_S,
            orbit_period_s: 98.0 * 60.0,
            sunlit_duration_s: (98.0 - 33.0) * 60.0,
        }
    }
}

/// A polled orbit-phase energy model. Energy level is stored as the raw bits
/// of an `f32` inside an `AtomicU32` so every read is whole: no reader ever
/// observes a torn value while a step or a load application is in flight.
pub struct BatterySim {
    params: BatteryParams,
    energy_bits: AtomicU32,
    time_in_orbit_s: AtomicU32,
}

impl BatterySim {
    pub fn new(params: BatteryParams, initial_soc: f32) -> Self {
        let initial_energy = params.total_capacity_wh * initial_soc;
        Self {
            params,
            energy_bits: AtomicU32::new(initial_energy.to_bits()),
            time_in_orbit_s: AtomicU32::new(0.0f32.to_bits()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BatteryParams::default(), 0.7)
    }

    pub fn current_energy_wh(&self) -> f32 {
        f32::from_bits(self.energy_bits.load(Ordering::Acquire))
    }

    fn time_in_orbit(&self) -> f32 {
        f32::from_bits(self.time_in_orbit_s.load(Ordering::Acquire))
    }

    pub fn phase(&self) -> OrbitalPhase {
        if self.time_in_orbit() < self.params.sunlit_duration_s {
            OrbitalPhase::Sunlit
        } else {
            OrbitalPhase::Eclipse
        }
    }

    /// Advance the simulated clock by one `time_step_s` and integrate energy
    /// accordingly. `p_in` is the generation power while sunlit, 0 while in
    /// eclipse; `p_out` is the constant load.
    pub fn step(&self) {
        let phase = self.phase();
        let p_in = match phase {
            OrbitalPhase::Sunlit => self.params.power_generation_w,
            OrbitalPhase::Eclipse => 0.0,
        };
        let net_power_w = p_in - self.params.constant_load_w;
        let energy_change_wh = (net_power_w * self.params.time_step_s) / 3600.0;

        let current = self.current_energy_wh();
        let next = (current + energy_change_wh)
            .max(self.params.min_capacity_wh)
            .min(self.params.max_capacity_wh);
        self.energy_bits.store(next.to_bits(), Ordering::Release);

        let mut t = self.time_in_orbit() + self.params.time_step_s;
        if t >= self.params.orbit_period_s {
            t -= self.params.orbit_period_s;
        }
        self.time_in_orbit_s.store(t.to_bits(), Ordering::Release);
    }

    /// Subtract an energy load, floored at zero. `load_uwh` is in
    /// microwatt-hours, matching the cost-model unit used everywhere else.
    pub fn apply_load(&self, load_uwh: f32) {
        let load_wh = load_uwh / 1_000_000.0;
        let current = self.current_energy_wh();
        let next = (current - load_wh).max(0.0);
        self.energy_bits.store(next.to_bits(), Ordering::Release);
    }

    pub fn safety_margin(&self) -> f32 {
        BATTERY_SAFETY_MARGIN_WH
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_start_at_seventy_percent_soc() {
        let sim = BatterySim::with_defaults();
        assert!((sim.current_energy_wh() - 64.4).abs() < 0.01);
    }

    #[test]
    fn sunlit_phase_charges_the_battery() {
        let sim = BatterySim::with_defaults();
        let before = sim.current_energy_wh();
        sim.step();
        assert!(sim.current_energy_wh() > before);
        assert_eq!(sim.phase(), OrbitalPhase::Sunlit);
    }

    #[test]
    fn eclipse_phase_drains_the_battery() {
        let params = BatteryParams::default();
        let sim = BatterySim::new(params, 0.7);
        for _ in 0..(params.sunlit_duration_s as u32 + 1) {
            sim.step();
        }
        assert_eq!(sim.phase(), OrbitalPhase::Eclipse);
        let before = sim.current_energy_wh();
        sim.step();
        assert!(sim.current_energy_wh() < before);
    }

    #[test]
    fn load_never_drives_energy_negative() {
        let sim = BatterySim::new(BatteryParams::default(), 0.0);
        sim.apply_load(1_000_000_000.0);
        assert_eq!(sim.current_energy_wh(), 0.0);
    }
}
