// 模块配置
// Tunables of one battery module, loaded from JSON and mirrored into the parameter store

use crate::devices::estimator::ChargeCompleteLatch;
use crate::error::{BmsError, Result};
use crate::params::{ParamId, ParameterStore};
use crate::types::{BalanceMode, CurrentSensorMode};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One constant-current/constant-voltage breakpoint
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CcCvStage {
    /// Current ceiling in A
    pub current_a: f32,
    /// Target cell voltage in mV
    pub voltage_mv: f32,
}

/// Configuration for one module
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    // === Cell sensing ===
    /// ADC gain in µV per digit
    pub adc_gain: f32,
    /// Gain corrections in ppm for the channels with extra wiring resistance (0, 1, 15)
    pub correction0_ppm: f32,
    pub correction1_ppm: f32,
    pub correction15_ppm: f32,
    /// Number of cells wired to this module (1-16)
    pub num_channels: u8,
    pub balance_mode: BalanceMode,
    /// Average cell voltage above which balancing is allowed, mV
    pub balance_voltage_mv: f32,
    /// Charge a cell when it is this far below the balancing target, mV
    pub balance_hyst_low_mv: f32,
    /// Discharge a cell when it is this far above the balancing target, mV
    pub balance_hyst_high_mv: f32,

    // === Battery characteristics ===
    /// Seconds of rest current before switching to Idle
    pub idle_wait_s: u32,
    /// Discharge current ceiling in A
    pub discharge_max_a: f32,
    /// Nominal capacity in Ah
    pub nominal_capacity_ah: f32,
    pub cccv: [CcCvStage; 3],
    pub cell_min_mv: f32,
    /// Open-circuit voltage at 0 %, 10 %, ..., 100 % SoC in mV
    pub soc_table_mv: [f32; 11],
    /// SoH assumed when no persisted value exists
    pub soh_preset: f32,
    pub controller_kp: f32,
    pub controller_ki: f32,
    pub charge_complete: Option<ChargeCompleteLatch>,

    // === Sensors ===
    /// Current sensor gain in digits per A
    pub idc_gain: f32,
    /// Current sensor offset in digits
    pub idc_offset: i32,
    pub idc_mode: CurrentSensorMode,
    /// Temperature sensor bitmask: 1 = input 1, 2 = input 2
    pub temp_sensors: u8,
    /// NTC resistance at 25 °C in Ohm
    pub temp_nominal_ohm: f32,
    pub temp_beta: f32,

    // === Communication ===
    pub pdo_base: u16,
    pub sdo_base: u8,
    /// Parameter ids between two modules' telemetry blocks
    pub telemetry_stride: u16,
    pub can_interface: String,

    // === Coordination ===
    /// Enable input level above which this module is the first of the chain
    pub first_threshold: i32,
    /// Enable input level above which the upstream module enables us
    pub enable_threshold: i32,
    /// Absolute pack current below which the pack is considered at rest, A
    pub idle_current_a: f32,
    pub addr_debounce_ticks: u32,
    pub info_settle_ticks: u32,
    pub reboot_hold_ticks: u32,
    /// Idle ticks before the module switches itself off
    pub turnoff_wait_ticks: u32,
    /// Where SoC and SoH are kept between runs
    pub state_file: String,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            adc_gain: 586.0,
            correction0_ppm: -1250.0,
            correction1_ppm: 1500.0,
            correction15_ppm: 1000.0,
            num_channels: 16,
            balance_mode: BalanceMode::Off,
            balance_voltage_mv: 4500.0,
            balance_hyst_low_mv: 3.0,
            balance_hyst_high_mv: 1.0,
            idle_wait_s: 60,
            discharge_max_a: 200.0,
            nominal_capacity_ah: 100.0,
            cccv: [
                CcCvStage { current_a: 50.0, voltage_mv: 3900.0 },
                CcCvStage { current_a: 30.0, voltage_mv: 4000.0 },
                CcCvStage { current_a: 20.0, voltage_mv: 4200.0 },
            ],
            cell_min_mv: 3300.0,
            soc_table_mv: [
                3300.0, 3400.0, 3450.0, 3500.0, 3560.0, 3600.0, 3700.0, 3800.0, 4000.0, 4100.0,
                4200.0,
            ],
            soh_preset: 100.0,
            controller_kp: 1.0,
            controller_ki: 1.0,
            charge_complete: None,
            idc_gain: 10.0,
            idc_offset: 0,
            idc_mode: CurrentSensorMode::Off,
            temp_sensors: 0,
            temp_nominal_ohm: 10_000.0,
            temp_beta: 3900.0,
            pdo_base: 500,
            sdo_base: 10,
            telemetry_stride: ParamId::PER_MODULE_FIELDS,
            can_interface: "can0".to_string(),
            first_threshold: 1800,
            enable_threshold: 500,
            idle_current_a: 0.8,
            addr_debounce_ticks: 5,
            info_settle_ticks: 10,
            reboot_hold_ticks: 10,
            turnoff_wait_ticks: 72_000, // 2 h at 100 ms
            state_file: "flying-bms-state.json".to_string(),
        }
    }
}

impl ModuleConfig {
    /// Load a configuration file and validate it
    ///
    /// # Arguments
    /// * `path` - JSON file, missing fields take their defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: ModuleConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the firmware cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.num_channels == 0 || self.num_channels > 16 {
            return Err(BmsError::Config(format!(
                "num_channels must be 1..=16, got {}",
                self.num_channels
            )));
        }
        if self.telemetry_stride < ParamId::PER_MODULE_FIELDS {
            return Err(BmsError::Config(format!(
                "telemetry_stride must be at least {}",
                ParamId::PER_MODULE_FIELDS
            )));
        }
        if self.soc_table_mv.windows(2).any(|w| w[1] <= w[0]) {
            return Err(BmsError::Config(
                "soc_table_mv must be strictly increasing".to_string(),
            ));
        }
        if self.nominal_capacity_ah <= 0.0 {
            return Err(BmsError::Config("nominal_capacity_ah must be positive".to_string()));
        }
        if self.idc_gain == 0.0 {
            return Err(BmsError::Config("idc_gain must not be zero".to_string()));
        }
        if self.adc_gain <= 0.0 {
            return Err(BmsError::Config("adc_gain must be positive".to_string()));
        }
        if self.enable_threshold >= self.first_threshold {
            return Err(BmsError::Config(
                "enable_threshold must be below first_threshold".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings the operator may change at run time
    const TUNABLE: [ParamId; 24] = [
        ParamId::GAIN,
        ParamId::CORRECTION0,
        ParamId::CORRECTION1,
        ParamId::CORRECTION15,
        ParamId::NUMCHAN,
        ParamId::BALMODE,
        ParamId::UBALANCE,
        ParamId::IDLEWAIT,
        ParamId::DISCHARGEMAX,
        ParamId::NOMCAP,
        ParamId::ICC1,
        ParamId::ICC2,
        ParamId::ICC3,
        ParamId::UCV1,
        ParamId::UCV2,
        ParamId::UCELLMAX,
        ParamId::UCELLMIN,
        ParamId::SOHPRESET,
        ParamId::IDCGAIN,
        ParamId::IDCOFS,
        ParamId::IDCMODE,
        ParamId::TEMPSNS,
        ParamId::TEMPRES,
        ParamId::TEMPBETA,
    ];

    fn tunable_ids() -> impl Iterator<Item = ParamId> {
        Self::TUNABLE
            .into_iter()
            .chain((0..11).map(|i| ParamId::UCELL0SOC.offset(i)))
    }

    /// Store value of a run-time setting, `None` for anything else
    pub fn value_of(&self, id: ParamId) -> Option<f32> {
        let value = match id {
            ParamId::GAIN => self.adc_gain,
            ParamId::CORRECTION0 => self.correction0_ppm,
            ParamId::CORRECTION1 => self.correction1_ppm,
            ParamId::CORRECTION15 => self.correction15_ppm,
            ParamId::NUMCHAN => self.num_channels as f32,
            ParamId::BALMODE => self.balance_mode as u8 as f32,
            ParamId::UBALANCE => self.balance_voltage_mv,
            ParamId::IDLEWAIT => self.idle_wait_s as f32,
            ParamId::DISCHARGEMAX => self.discharge_max_a,
            ParamId::NOMCAP => self.nominal_capacity_ah,
            ParamId::ICC1 => self.cccv[0].current_a,
            ParamId::ICC2 => self.cccv[1].current_a,
            ParamId::ICC3 => self.cccv[2].current_a,
            ParamId::UCV1 => self.cccv[0].voltage_mv,
            ParamId::UCV2 => self.cccv[1].voltage_mv,
            ParamId::UCELLMAX => self.cccv[2].voltage_mv,
            ParamId::UCELLMIN => self.cell_min_mv,
            ParamId(n) if (ParamId::UCELL0SOC.0..=ParamId::UCELL0SOC.0 + 10).contains(&n) => {
                self.soc_table_mv[(n - ParamId::UCELL0SOC.0) as usize]
            }
            ParamId::SOHPRESET => self.soh_preset,
            ParamId::IDCGAIN => self.idc_gain,
            ParamId::IDCOFS => self.idc_offset as f32,
            ParamId::IDCMODE => self.idc_mode as u8 as f32,
            ParamId::TEMPSNS => self.temp_sensors as f32,
            ParamId::TEMPRES => self.temp_nominal_ohm,
            ParamId::TEMPBETA => self.temp_beta,
            _ => return None,
        };
        Some(value)
    }

    /// Mirror all operator-visible settings into the parameter store
    pub fn seed(&self, params: &mut dyn ParameterStore) {
        for id in Self::tunable_ids() {
            if let Some(value) = self.value_of(id) {
                params.set(id, value);
            }
        }
        params.set(ParamId::PDOBASE, self.pdo_base as f32);
        params.set(ParamId::SDOBASE, self.sdo_base as f32);
        params.set(ParamId::ENABLE, 1.0);
        params.set(ParamId::TESTCHAN, -1.0);
    }

    /// Take over a value written to the parameter store from outside
    ///
    /// # Returns
    /// false when `id` is not a configuration parameter or the value is out of range
    pub fn apply_param(&mut self, id: ParamId, value: f32) -> bool {
        match id {
            ParamId::GAIN if value > 0.0 => self.adc_gain = value,
            ParamId::CORRECTION0 => self.correction0_ppm = value,
            ParamId::CORRECTION1 => self.correction1_ppm = value,
            ParamId::CORRECTION15 => self.correction15_ppm = value,
            ParamId::NUMCHAN if (1.0..=16.0).contains(&value) => self.num_channels = value as u8,
            ParamId::BALMODE => match BalanceMode::from_u8(value as u8) {
                Some(mode) => self.balance_mode = mode,
                None => return false,
            },
            ParamId::UBALANCE => self.balance_voltage_mv = value,
            ParamId::IDLEWAIT if value >= 0.0 => self.idle_wait_s = value as u32,
            ParamId::DISCHARGEMAX => self.discharge_max_a = value,
            ParamId::NOMCAP if value > 0.0 => self.nominal_capacity_ah = value,
            ParamId::ICC1 => self.cccv[0].current_a = value,
            ParamId::ICC2 => self.cccv[1].current_a = value,
            ParamId::ICC3 => self.cccv[2].current_a = value,
            ParamId::UCV1 => self.cccv[0].voltage_mv = value,
            ParamId::UCV2 => self.cccv[1].voltage_mv = value,
            ParamId::UCELLMAX => self.cccv[2].voltage_mv = value,
            ParamId::UCELLMIN => self.cell_min_mv = value,
            ParamId(n) if (ParamId::UCELL0SOC.0..=ParamId::UCELL0SOC.0 + 10).contains(&n) => {
                self.soc_table_mv[(n - ParamId::UCELL0SOC.0) as usize] = value
            }
            ParamId::SOHPRESET => self.soh_preset = value,
            ParamId::IDCGAIN if value != 0.0 => self.idc_gain = value,
            ParamId::IDCOFS => self.idc_offset = value as i32,
            ParamId::IDCMODE => match CurrentSensorMode::from_u8(value as u8) {
                Some(mode) => self.idc_mode = mode,
                None => return false,
            },
            ParamId::TEMPSNS if (0.0..=3.0).contains(&value) => self.temp_sensors = value as u8,
            ParamId::TEMPRES if value > 0.0 => self.temp_nominal_ohm = value,
            ParamId::TEMPBETA if value > 0.0 => self.temp_beta = value,
            _ => return false,
        }
        true
    }
}
