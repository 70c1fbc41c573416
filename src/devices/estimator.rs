// 充电控制与 SoC/SoH 估算
// Charge-current control loops, state-of-charge/health estimation and derating curves

use crate::config::ModuleConfig;
use serde::{Deserialize, Serialize};

/// Discrete PI controller with output clamping and conditional integration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PiController {
    kp: f32,
    ki: f32,
    reference: f32,
    min_y: f32,
    max_y: f32,
    esum: f32,
    /// Calls per second, scales the integral term
    frequency: f32,
}

impl PiController {
    /// 100 ms task
    pub const DEFAULT_FREQUENCY: f32 = 10.0;

    pub fn new(kp: f32, ki: f32) -> Self {
        Self {
            kp,
            ki,
            reference: 0.0,
            min_y: 0.0,
            max_y: 0.0,
            esum: 0.0,
            frequency: Self::DEFAULT_FREQUENCY,
        }
    }

    pub fn set_gains(&mut self, kp: f32, ki: f32) {
        self.kp = kp;
        self.ki = ki;
    }

    pub fn set_reference(&mut self, reference: f32) {
        self.reference = reference;
    }

    pub fn set_min_max(&mut self, min_y: f32, max_y: f32) {
        self.min_y = min_y;
        self.max_y = max_y;
    }

    pub fn reset(&mut self) {
        self.esum = 0.0;
    }

    /// One control step
    ///
    /// The integrator only takes the new error when the output is not clamped.
    pub fn run(&mut self, current_value: f32) -> f32 {
        let err = self.reference - current_value;
        let esum = self.esum + err;
        let y = err * self.kp + (esum / self.frequency) * self.ki;
        let y_lim = y.clamp(self.min_y, self.max_y);

        if y_lim == y {
            self.esum = esum;
        }
        y_lim
    }
}

/// One CC/CV breakpoint and its controller
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargeStage {
    pub target_voltage: f32,
    pub max_current: f32,
    controller: PiController,
}

impl ChargeStage {
    fn new(max_current: f32, target_voltage: f32, kp: f32, ki: f32) -> Self {
        let mut controller = PiController::new(kp, ki);
        controller.set_reference(target_voltage);
        controller.set_min_max(0.0, max_current);
        Self {
            target_voltage,
            max_current,
            controller,
        }
    }
}

/// Forces the charge current to zero once charging has tapered out
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChargeCompleteLatch {
    /// Current below which charging counts as complete, A
    pub cutoff_current: f32,
    /// Drop below the last stage's target voltage that re-arms charging, mV
    pub hysteresis_mv: f32,
}

/// Charge-current limit and SoC/SoH computation for one pack
#[derive(Debug, Clone)]
pub struct ChargeControlEstimator {
    nominal_capacity: f32,
    /// Open-circuit voltage at 0 %, 10 %, ..., 100 %
    soc_table: [f32; 11],
    stages: [ChargeStage; 3],
    kp: f32,
    ki: f32,
    latch: Option<ChargeCompleteLatch>,
    charge_complete: bool,
}

impl ChargeControlEstimator {
    /// Lower bound of the low-temperature ramp, °C
    const LOW_TEMP_CUTOFF: f32 = -20.0;
    /// Factor at 0 °C
    const LOW_TEMP_FREEZING_FACTOR: f32 = 0.3;
    /// Full current from this temperature on, °C
    const LOW_TEMP_FULL: f32 = 25.0;
    /// Factor lost per °C approaching the high temperature limit
    const HIGH_TEMP_SLOPE: f32 = 0.15;
    /// Ramp width below the minimum cell voltage limit, mV
    const MIN_VOLTAGE_MARGIN: f32 = 50.0;
    /// Ramp width below the maximum cell voltage limit, mV
    const MAX_VOLTAGE_MARGIN: f32 = 10.0;
    /// Smallest SoC change that yields a usable SoH
    const SOH_MIN_SOC_DELTA: f32 = 20.0;
    const SOC_MAX: f32 = 102.0;

    pub fn from_config(config: &ModuleConfig) -> Self {
        let kp = config.controller_kp;
        let ki = config.controller_ki;
        let stages = config
            .cccv
            .map(|stage| ChargeStage::new(stage.current_a, stage.voltage_mv, kp, ki));

        Self {
            nominal_capacity: config.nominal_capacity_ah,
            soc_table: config.soc_table_mv,
            stages,
            kp,
            ki,
            latch: config.charge_complete,
            charge_complete: false,
        }
    }

    pub fn nominal_capacity(&self) -> f32 {
        self.nominal_capacity
    }

    pub fn set_nominal_capacity(&mut self, capacity_ah: f32) {
        if capacity_ah > 0.0 {
            self.nominal_capacity = capacity_ah;
        }
    }

    /// Set the voltage of one lookup point
    ///
    /// # Arguments
    /// * `soc` - 0, 10, ..., 100; anything else is ignored
    /// * `voltage` - open-circuit voltage in mV
    pub fn set_soc_lookup_point(&mut self, soc: u8, voltage: f32) {
        if soc <= 100 && soc % 10 == 0 {
            self.soc_table[(soc / 10) as usize] = voltage;
        }
    }

    /// Re-seed one CC/CV stage, resetting its integrator
    ///
    /// # Arguments
    /// * `stage` - 0..=2; anything else is ignored
    pub fn set_cccv_curve(&mut self, stage: usize, current: f32, voltage: f32) {
        if let Some(slot) = self.stages.get_mut(stage) {
            *slot = ChargeStage::new(current, voltage, self.kp, self.ki);
        }
    }

    pub fn set_controller_gains(&mut self, kp: f32, ki: f32) {
        self.kp = kp;
        self.ki = ki;
        for stage in self.stages.iter_mut() {
            stage.controller.set_gains(kp, ki);
        }
    }

    pub fn set_charge_complete_latch(&mut self, latch: Option<ChargeCompleteLatch>) {
        self.latch = latch;
        self.charge_complete = false;
    }

    pub fn stages(&self) -> &[ChargeStage; 3] {
        &self.stages
    }

    pub fn is_charge_complete(&self) -> bool {
        self.charge_complete
    }

    /// SoC from the resting voltage of the weakest cell, linear between lookup points
    pub fn estimate_soc_from_voltage(&self, lowest_voltage: f32) -> f32 {
        match self.soc_table.iter().position(|&v| lowest_voltage < v) {
            None => 100.0,
            Some(0) => 0.0,
            Some(i) => {
                let lut_diff = self.soc_table[i] - self.soc_table[i - 1];
                let val_diff = self.soc_table[i] - lowest_voltage;
                i as f32 * 10.0 - (val_diff / lut_diff) * 10.0
            }
        }
    }

    /// Coulomb counting
    ///
    /// # Arguments
    /// * `last_soc` - SoC at the start of the integration, %
    /// * `as_diff` - charge in minus charge out since then, As
    pub fn soc_from_integration(&self, last_soc: f32, as_diff: f32) -> f32 {
        let soc = last_soc + 100.0 * as_diff / (3600.0 * self.nominal_capacity);
        soc.clamp(0.0, Self::SOC_MAX)
    }

    /// SoH from the charge that moved the SoC between two rest estimates
    ///
    /// # Returns
    /// -1 when the SoC moved 20 points or less
    pub fn calculate_soh(&self, last_soc: f32, new_soc: f32, as_diff: f32) -> f32 {
        let soc_diff = (new_soc - last_soc).abs();

        if soc_diff <= Self::SOH_MIN_SOC_DELTA {
            return -1.0;
        }
        // 36 = 3600 As/Ah / 100 %
        as_diff.abs() / (soc_diff * self.nominal_capacity * 36.0) * 100.0
    }

    /// Charge current limit for the highest cell voltage, called every 100 ms
    ///
    /// Every stage regulates towards its own target; the least restrictive one wins.
    pub fn charge_current(&mut self, max_cell_voltage: f32) -> f32 {
        let current = self
            .stages
            .iter_mut()
            .map(|stage| stage.controller.run(max_cell_voltage))
            .fold(0.0f32, f32::max);

        let Some(latch) = self.latch else {
            return current;
        };
        let release_voltage = self.stages[2].target_voltage - latch.hysteresis_mv;

        if self.charge_complete {
            if max_cell_voltage < release_voltage {
                log::info!("Cell voltage {} mV below {} mV, charging re-enabled", max_cell_voltage, release_voltage);
                self.charge_complete = false;
            } else {
                return 0.0;
            }
        }
        if current < latch.cutoff_current && max_cell_voltage >= release_voltage {
            log::info!("Charge complete at {} mV", max_cell_voltage);
            self.charge_complete = true;
            return 0.0;
        }
        current
    }

    /// Discharge derating near the minimum cell voltage
    ///
    /// # Returns
    /// 0 at or below `limit`, 1 from 50 mV above it
    pub fn limit_minimum_cell_voltage(min_voltage: f32, limit: f32) -> f32 {
        ((min_voltage - limit) / Self::MIN_VOLTAGE_MARGIN).clamp(0.0, 1.0)
    }

    /// Charge derating near the maximum cell voltage
    ///
    /// # Returns
    /// 0 at or above `limit`, 1 from 10 mV below it
    pub fn limit_maximum_cell_voltage(max_voltage: f32, limit: f32) -> f32 {
        ((limit - max_voltage) / Self::MAX_VOLTAGE_MARGIN).clamp(0.0, 1.0)
    }

    /// Charge derating for cold cells
    pub fn low_temperature_derating(temperature: f32) -> f32 {
        if temperature <= Self::LOW_TEMP_CUTOFF {
            0.0
        } else if temperature <= 0.0 {
            Self::LOW_TEMP_FREEZING_FACTOR * (temperature - Self::LOW_TEMP_CUTOFF) / -Self::LOW_TEMP_CUTOFF
        } else if temperature < Self::LOW_TEMP_FULL {
            Self::LOW_TEMP_FREEZING_FACTOR
                + (1.0 - Self::LOW_TEMP_FREEZING_FACTOR) * temperature / Self::LOW_TEMP_FULL
        } else {
            1.0
        }
    }

    /// Derating approaching `max_temperature`
    pub fn high_temperature_derating(temperature: f32, max_temperature: f32) -> f32 {
        ((max_temperature - temperature) * Self::HIGH_TEMP_SLOPE).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> ChargeControlEstimator {
        let mut est = ChargeControlEstimator::from_config(&ModuleConfig::default());
        let table = [3300.0, 3400.0, 3450.0, 3500.0, 3560.0, 3600.0, 3700.0, 3800.0, 4000.0, 4100.0, 4200.0];
        for (i, v) in table.iter().enumerate() {
            est.set_soc_lookup_point(i as u8 * 10, *v);
        }
        est.set_nominal_capacity(100.0);
        est.set_controller_gains(1.0, 1.0);
        est.set_cccv_curve(0, 400.0, 3900.0);
        est.set_cccv_curve(1, 200.0, 4100.0);
        est.set_cccv_curve(2, 100.0, 4200.0);
        est
    }

    #[test]
    fn soc_from_voltage() {
        let est = estimator();
        assert_eq!(est.estimate_soc_from_voltage(3650.0), 55.0);
        assert_eq!(est.estimate_soc_from_voltage(3000.0), 0.0);
        assert_eq!(est.estimate_soc_from_voltage(4300.0), 100.0);
        assert_eq!(est.estimate_soc_from_voltage(4200.0), 100.0);
    }

    #[test]
    fn out_of_range_lookup_point_is_ignored() {
        let mut est = estimator();
        est.set_soc_lookup_point(55, 1000.0);
        est.set_soc_lookup_point(110, 1000.0);
        assert_eq!(est.estimate_soc_from_voltage(3650.0), 55.0);
    }

    #[test]
    fn soc_from_integration() {
        let est = estimator();
        assert_eq!(est.soc_from_integration(50.0, 1.5 * 3600.0), 51.5);
        assert_eq!(est.soc_from_integration(50.0, -10.0 * 3600.0), 40.0);
        assert_eq!(est.soc_from_integration(10.0, -20.0 * 3600.0), 0.0);
        assert_eq!(est.soc_from_integration(90.0, 20.0 * 3600.0), 102.0);
    }

    #[test]
    fn soh() {
        let est = estimator();
        assert!(est.calculate_soh(10.0, 20.0, 3600.0) < 0.0);
        assert!((est.calculate_soh(40.0, 70.0, 30.0 * 3600.0) - 100.0).abs() < 1e-3);
        assert!((est.calculate_soh(40.0, 70.0, 0.9 * 30.0 * 3600.0) - 90.0).abs() < 1e-3);
        assert!((est.calculate_soh(40.0, 70.0, 1.1 * 30.0 * 3600.0) - 110.0).abs() < 1e-3);
    }

    #[test]
    fn charge_current_far_from_cv_point() {
        let mut est = estimator();
        let mut current = 0.0;
        for _ in 0..30 {
            current = est.charge_current(3800.0);
        }
        assert_eq!(current, 400.0);
    }

    #[test]
    fn charge_current_tapers_through_stages() {
        let mut est = estimator();
        let mut current = 0.0;

        // 0.15 mV/A internal resistance
        for _ in 0..500 {
            current = est.charge_current(3850.0 + current * 0.15);
        }
        assert!((current - 333.33).abs() < 1.0, "got {}", current);

        for _ in 0..30 {
            current = est.charge_current(3900.0 + current * 0.15);
        }
        assert_eq!(current, 200.0);

        for _ in 0..150 {
            current = est.charge_current(4205.0 + current * 0.15);
        }
        assert_eq!(current, 0.0);
    }

    #[test]
    fn reseeding_a_stage_resets_its_integrator() {
        let mut est = estimator();
        for _ in 0..50 {
            est.charge_current(4150.0);
        }
        est.set_cccv_curve(2, 100.0, 4200.0);
        est.set_cccv_curve(7, 1.0, 1.0);
        assert_eq!(est.stages()[2].controller.esum, 0.0);
        assert_eq!(est.stages()[2].max_current, 100.0);
    }

    #[test]
    fn charge_complete_latch_holds_until_voltage_drops() {
        let mut est = estimator();
        est.set_charge_complete_latch(Some(ChargeCompleteLatch {
            cutoff_current: 5.0,
            hysteresis_mv: 100.0,
        }));

        let mut current = 0.0;
        for _ in 0..50 {
            current = est.charge_current(4210.0);
        }
        assert_eq!(current, 0.0);
        assert!(est.is_charge_complete());

        // still inside the band
        assert_eq!(est.charge_current(4150.0), 0.0);
        assert!(est.charge_current(4000.0) > 0.0);
        assert!(!est.is_charge_complete());
    }

    #[test]
    fn minimum_cell_voltage_ramp() {
        assert_eq!(ChargeControlEstimator::limit_minimum_cell_voltage(3300.0, 3300.0), 0.0);
        assert_eq!(ChargeControlEstimator::limit_minimum_cell_voltage(3200.0, 3300.0), 0.0);
        assert_eq!(ChargeControlEstimator::limit_minimum_cell_voltage(3325.0, 3300.0), 0.5);
        assert_eq!(ChargeControlEstimator::limit_minimum_cell_voltage(3350.0, 3300.0), 1.0);
        assert_eq!(ChargeControlEstimator::limit_maximum_cell_voltage(4195.0, 4200.0), 0.5);
        assert_eq!(ChargeControlEstimator::limit_maximum_cell_voltage(4200.0, 4200.0), 0.0);
    }

    #[test]
    fn low_temperature() {
        let f = ChargeControlEstimator::low_temperature_derating;
        assert_eq!(f(-20.0), 0.0);
        assert_eq!(f(-100.0), 0.0);
        assert!((f(-10.0) - 0.15).abs() < 0.01);
        assert!((f(0.0) - 0.3).abs() < 0.01);
        assert!((f(10.0) - 0.58).abs() < 0.01);
        assert_eq!(f(25.0), 1.0);
        assert_eq!(f(100.0), 1.0);

        let mut last = 0.0;
        for t in -20..=25 {
            let factor = f(t as f32);
            assert!(factor >= last);
            last = factor;
        }
    }

    #[test]
    fn high_temperature() {
        let f = ChargeControlEstimator::high_temperature_derating;
        assert_eq!(f(0.0, 50.0), 1.0);
        assert_eq!(f(43.3, 50.0), 1.0);
        assert!((f(46.6667, 50.0) - 0.5).abs() < 0.01);
        assert_eq!(f(50.0, 50.0), 0.0);
        assert_eq!(f(80.0, 50.0), 0.0);
    }
}
