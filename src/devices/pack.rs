// 电池包状态
// Pack-level current limits and SoC/SoH bookkeeping, run by the main module every 100 ms

use crate::devices::estimator::ChargeControlEstimator;
use crate::error::Result;
use crate::params::{ParamId, ParameterStore};
use crate::types::{ModuleState, PersistedState};
use std::fs;
use std::io;
use std::path::Path;

/// Owns the estimator and the rest-point references between ticks
#[derive(Debug, Clone)]
pub struct PackMonitor {
    estimator: ChargeControlEstimator,
    /// SoC of the last rest estimate
    estimated_soc: f32,
    /// Charge balance when `estimated_soc` was taken
    as_at_estimate: f32,
    /// SoC of the last rest point a valid SoH was computed against, negative before the first
    soc_at_valid_soh: f32,
}

impl PackMonitor {
    /// Pack at rest below this current, A
    const REST_CURRENT: f32 = 0.8;
    /// IIR filter constant for new SoH values
    const SOH_FILTER: f32 = 10.0;
    /// Temperature limits for charging and discharging, °C
    const CHARGE_MAX_TEMP: f32 = 50.0;
    const DISCHARGE_MAX_TEMP: f32 = 53.0;
    /// Upper bound for stored SoH, a fresh pack may measure above nominal
    const MAX_SOH: f32 = 120.0;

    pub fn new(estimator: ChargeControlEstimator) -> Self {
        Self {
            estimator,
            estimated_soc: 0.0,
            as_at_estimate: 0.0,
            soc_at_valid_soh: -1.0,
        }
    }

    pub fn estimator(&self) -> &ChargeControlEstimator {
        &self.estimator
    }

    pub fn estimator_mut(&mut self) -> &mut ChargeControlEstimator {
        &mut self.estimator
    }

    /// Seed SoC and SoH from a previous run
    pub fn restore(&mut self, state: &PersistedState, params: &mut dyn ParameterStore) {
        let soc = state.soc.clamp(0.0, 102.0);
        self.estimated_soc = soc;
        self.as_at_estimate = Self::charge_balance(params);
        params.set(ParamId::SOC, soc);
        params.set(ParamId::SOH, state.soh.clamp(0.0, Self::MAX_SOH));
    }

    pub fn persisted_state(params: &dyn ParameterStore) -> PersistedState {
        PersistedState {
            soc: params.get(ParamId::SOC),
            soh: params.get(ParamId::SOH),
        }
    }

    fn charge_balance(params: &dyn ParameterStore) -> f32 {
        params.get(ParamId::CHARGEIN) - params.get(ParamId::CHARGEOUT)
    }

    /// Start counting charge afresh from the current rest point
    fn reset_charge_counters(&mut self, params: &mut dyn ParameterStore) {
        self.as_at_estimate = 0.0;
        params.set(ParamId::CHARGEIN, 0.0);
        params.set(ParamId::CHARGEOUT, 0.0);
    }

    /// Charge and discharge limits from the pack-wide voltages and temperatures
    pub fn calculate_current_limits(&mut self, params: &mut dyn ParameterStore) {
        let mut charge = self.estimator.charge_current(params.get(ParamId::UMAX));
        charge *= ChargeControlEstimator::low_temperature_derating(params.get(ParamId::TEMPMIN));
        charge *= ChargeControlEstimator::high_temperature_derating(params.get(ParamId::TEMPMAX), Self::CHARGE_MAX_TEMP);
        params.set(ParamId::CHARGELIM, charge);

        let mut discharge = params.get(ParamId::DISCHARGEMAX);
        discharge *= ChargeControlEstimator::limit_minimum_cell_voltage(
            params.get(ParamId::UMIN),
            params.get(ParamId::UCELLMIN),
        );
        discharge *=
            ChargeControlEstimator::high_temperature_derating(params.get(ParamId::TEMPMAX), Self::DISCHARGE_MAX_TEMP);
        params.set(ParamId::DISCHARGELIM, discharge);
    }

    /// Re-estimate at rest, integrate otherwise
    pub fn calculate_soc_soh(&mut self, state: ModuleState, params: &mut dyn ParameterStore) {
        let as_diff = Self::charge_balance(params);

        if state == ModuleState::Idle && params.get(ParamId::IDC).abs() < Self::REST_CURRENT {
            self.estimated_soc = self.estimator.estimate_soc_from_voltage(params.get(ParamId::UMIN));
            self.as_at_estimate = as_diff;
            params.set(ParamId::SOC, self.estimated_soc);

            if self.soc_at_valid_soh < 0.0 {
                self.soc_at_valid_soh = self.estimated_soc;
                self.reset_charge_counters(params);
                return;
            }

            let soh = self.estimator.calculate_soh(self.soc_at_valid_soh, self.estimated_soc, as_diff);
            if soh > 0.0 {
                let last_soh = params.get(ParamId::SOH);
                let filtered =
                    (last_soh + (soh - last_soh) / Self::SOH_FILTER).clamp(0.0, Self::MAX_SOH);
                log::info!("SoH update {:.1} % -> {:.1} %", last_soh, filtered);
                params.set(ParamId::SOH, filtered);
                self.soc_at_valid_soh = self.estimated_soc;
                self.reset_charge_counters(params);
            }
        } else {
            let soc = self
                .estimator
                .soc_from_integration(self.estimated_soc, as_diff - self.as_at_estimate);
            params.set(ParamId::SOC, soc);
        }
    }
}

/// Read the state file of a previous run
///
/// # Returns
/// `None` when no file exists yet
pub fn load_state<P: AsRef<Path>>(path: P) -> Result<Option<PersistedState>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn save_state<P: AsRef<Path>>(path: P, state: &PersistedState) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(state)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleConfig;
    use crate::params::ParamStore;
    use crate::types::NO_TEMP;

    fn setup() -> (PackMonitor, ParamStore) {
        let config = ModuleConfig::default();
        let mut params = ParamStore::new();
        config.seed(&mut params);
        params.set(ParamId::TEMPMIN, NO_TEMP);
        params.set(ParamId::TEMPMAX, -40.0);
        let mut monitor = PackMonitor::new(ChargeControlEstimator::from_config(&config));
        monitor.restore(&PersistedState { soc: 50.0, soh: 100.0 }, &mut params);
        (monitor, params)
    }

    #[test]
    fn discharge_limit_follows_minimum_cell() {
        let (mut monitor, mut params) = setup();
        params.set(ParamId::UMIN, 3325.0);
        params.set(ParamId::UMAX, 3400.0);
        monitor.calculate_current_limits(&mut params);
        assert_eq!(params.get(ParamId::DISCHARGELIM), 100.0);
        assert!(params.get(ParamId::CHARGELIM) > 0.0);

        params.set(ParamId::TEMPMAX, 60.0);
        monitor.calculate_current_limits(&mut params);
        assert_eq!(params.get(ParamId::CHARGELIM), 0.0);
        assert_eq!(params.get(ParamId::DISCHARGELIM), 0.0);
    }

    #[test]
    fn cold_pack_gets_no_charge_current() {
        let (mut monitor, mut params) = setup();
        params.set(ParamId::UMAX, 3500.0);
        params.set(ParamId::TEMPMIN, -25.0);
        params.set(ParamId::TEMPMAX, -25.0);
        monitor.calculate_current_limits(&mut params);
        assert_eq!(params.get(ParamId::CHARGELIM), 0.0);
    }

    #[test]
    fn soc_integrates_while_running() {
        let (mut monitor, mut params) = setup();
        params.set(ParamId::CHARGEIN, 10.0 * 3600.0);
        monitor.calculate_soc_soh(ModuleState::Run, &mut params);
        assert!((params.get(ParamId::SOC) - 60.0).abs() < 1e-3);
    }

    #[test]
    fn rest_points_produce_filtered_soh() {
        let (mut monitor, mut params) = setup();

        // first rest point at 40 %
        params.set(ParamId::UMIN, 3560.0);
        monitor.calculate_soc_soh(ModuleState::Idle, &mut params);
        assert_eq!(params.get(ParamId::SOC), 40.0);

        // charged 27 Ah into 30 % of a 100 Ah pack
        params.set(ParamId::CHARGEIN, 27.0 * 3600.0);
        monitor.calculate_soc_soh(ModuleState::Run, &mut params);
        assert!((params.get(ParamId::SOC) - 67.0).abs() < 1e-3);

        params.set(ParamId::UMIN, 3800.0);
        monitor.calculate_soc_soh(ModuleState::Idle, &mut params);
        assert_eq!(params.get(ParamId::SOC), 70.0);
        // 90 % filtered into 100 %
        assert!((params.get(ParamId::SOH) - 99.0).abs() < 1e-3);
        assert_eq!(params.get(ParamId::CHARGEIN), 0.0);
    }

    #[test]
    fn soh_ignores_charge_before_first_rest_point() {
        let (mut monitor, mut params) = setup();

        params.set(ParamId::CHARGEOUT, 50.0 * 3600.0);
        monitor.calculate_soc_soh(ModuleState::Run, &mut params);

        params.set(ParamId::UMIN, 3560.0);
        monitor.calculate_soc_soh(ModuleState::Idle, &mut params);
        assert_eq!(params.get(ParamId::SOC), 40.0);
        assert_eq!(params.get(ParamId::CHARGEOUT), 0.0);

        // exactly 30 % of a 100 Ah pack
        params.set(ParamId::CHARGEIN, 30.0 * 3600.0);
        monitor.calculate_soc_soh(ModuleState::Run, &mut params);
        assert!((params.get(ParamId::SOC) - 70.0).abs() < 1e-3);

        params.set(ParamId::UMIN, 3800.0);
        monitor.calculate_soc_soh(ModuleState::Idle, &mut params);
        assert_eq!(params.get(ParamId::SOC), 70.0);
        assert!((params.get(ParamId::SOH) - 100.0).abs() < 1e-3, "soh {}", params.get(ParamId::SOH));
    }

    #[test]
    fn restored_soh_is_clamped() {
        let (mut monitor, mut params) = setup();
        monitor.restore(&PersistedState { soc: 50.0, soh: -20.0 }, &mut params);
        assert_eq!(params.get(ParamId::SOH), 0.0);

        monitor.restore(&PersistedState { soc: 50.0, soh: 400.0 }, &mut params);
        assert_eq!(params.get(ParamId::SOH), PackMonitor::MAX_SOH);
    }

    #[test]
    fn state_file_round_trip() {
        let path = std::env::temp_dir().join(format!("flying-bms-state-{}.json", std::process::id()));
        let _ = fs::remove_file(&path);
        assert_eq!(load_state(&path).unwrap(), None);

        let state = PersistedState { soc: 42.5, soh: 97.0 };
        save_state(&path, &state).unwrap();
        assert_eq!(load_state(&path).unwrap(), Some(state));
        let _ = fs::remove_file(&path);
    }
}
