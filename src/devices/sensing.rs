// 采样任务
// Cell voltage sweep with balancing, pack current integration and NTC temperatures

use crate::devices::aggregator::{ModuleLayout, TelemetryAggregator};
use crate::drivers::hal::{AnalogPin, CellFrontEnd, ModuleIo};
use crate::params::{ParamId, ParameterStore};
use crate::types::{
    AggregatedStats, BalanceCommand, BalanceMode, CurrentSensorMode, ModuleState, ModuleStats, NO_TEMP,
};

/// Digit-to-mV gain of one channel, including its wiring correction
pub fn channel_gain(params: &dyn ParameterStore, channel: u8) -> f32 {
    let correction = match channel {
        0 => params.get(ParamId::CORRECTION0),
        1 => params.get(ParamId::CORRECTION1),
        15 => params.get(ParamId::CORRECTION15),
        _ => 0.0,
    };
    params.get(ParamId::GAIN) * (1.0 + correction / 1_000_000.0) / 1000.0
}

/// Sweep order: even channels up, then odd channels down
///
/// # Returns
/// `None` once the sweep is complete
pub fn next_channel(channel: u8, num_channels: u8) -> Option<u8> {
    if channel >= num_channels {
        return None;
    }
    let even = channel % 2 == 0;

    if even && channel + 2 < num_channels {
        Some(channel + 2)
    } else if even && channel + 1 < num_channels {
        Some(channel + 1)
    } else if even {
        channel.checked_sub(1)
    } else if channel > 1 {
        Some(channel - 2)
    } else {
        None
    }
}

/// One channel per 25 ms tick, balancing in between while idle
#[derive(Debug, Clone)]
pub struct CellScanner {
    channel: u8,
    balance_cycles: u8,
    sum: f32,
    min: f32,
    max: f32,
    /// A conversion for `channel` is pending
    started: bool,
    hyst_low_mv: f32,
    hyst_high_mv: f32,
}

impl CellScanner {
    /// Ticks spent per channel while balancing
    const BALANCE_CYCLES: u8 = 30;
    const MIN_START: f32 = 8000.0;

    pub fn new(hyst_low_mv: f32, hyst_high_mv: f32) -> Self {
        Self {
            channel: 0,
            balance_cycles: 0,
            sum: 0.0,
            min: Self::MIN_START,
            max: 0.0,
            started: false,
            hyst_low_mv,
            hyst_high_mv,
        }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Disconnect the mux; the next sweep starts from channel 0
    pub fn stop(&mut self, fe: &mut dyn CellFrontEnd) {
        fe.mux_off();
        self.started = false;
        self.channel = 0;
        self.reset_sweep();
    }

    fn reset_sweep(&mut self) {
        self.sum = 0.0;
        self.min = Self::MIN_START;
        self.max = 0.0;
    }

    fn balance_target(params: &dyn ParameterStore, mode: BalanceMode) -> f32 {
        match mode {
            BalanceMode::Additive => params.get(ParamId::UMAX),
            BalanceMode::Dissipative => params.get(ParamId::UMIN),
            BalanceMode::Both => params.get(ParamId::UAVG),
            BalanceMode::Off => 0.0,
        }
    }

    /// Advance the sweep by one tick
    ///
    /// # Returns
    /// The aggregated statistics when this tick completed a sweep
    pub fn tick(
        &mut self,
        state: ModuleState,
        params: &mut dyn ParameterStore,
        fe: &mut dyn CellFrontEnd,
        layout: &dyn ModuleLayout,
    ) -> Option<AggregatedStats> {
        if !self.started {
            fe.select_channel(self.channel);
            fe.start_conversion();
            self.started = true;
            return None;
        }

        let mode = BalanceMode::from_u8(params.get_int(ParamId::BALMODE) as u8).unwrap_or_default();
        let balance = state == ModuleState::Idle
            && params.get(ParamId::UAVG) > params.get(ParamId::UBALANCE)
            && mode != BalanceMode::Off;
        let cmd_id = ParamId::U0CMD.offset(self.channel as u16);

        if balance {
            if self.balance_cycles == 0 {
                self.balance_cycles = Self::BALANCE_CYCLES;
            } else {
                self.balance_cycles -= 1;
            }

            if self.balance_cycles > 0 && self.balance_cycles < Self::BALANCE_CYCLES - 1 {
                let udc = params.get(ParamId::U0.offset(self.channel as u16));
                let target = Self::balance_target(params, mode);

                let cmd = if udc < target - self.hyst_low_mv && mode.adds() {
                    BalanceCommand::Charge
                } else if udc > target + self.hyst_high_mv && mode.dissipates() {
                    BalanceCommand::Discharge
                } else {
                    self.balance_cycles = 0;
                    BalanceCommand::Off
                };
                let status = fe.set_balancing(cmd);
                params.set(cmd_id, status as u8 as f32);
            } else {
                fe.set_balancing(BalanceCommand::Off);
            }
        } else {
            self.balance_cycles = Self::BALANCE_CYCLES;
            let status = fe.set_balancing(BalanceCommand::Off);
            params.set(cmd_id, status as u8 as f32);
        }

        if self.balance_cycles != Self::BALANCE_CYCLES {
            return None;
        }

        let udc = fe.read_result() as f32 * channel_gain(params, self.channel);
        params.set(ParamId::U0.offset(self.channel as u16), udc);
        self.min = self.min.min(udc);
        self.max = self.max.max(udc);
        self.sum += udc;

        let num_channels = params.get_int(ParamId::NUMCHAN).clamp(1, 16) as u8;
        let mut result = None;

        match next_channel(self.channel, num_channels) {
            Some(next) => self.channel = next,
            None => {
                let local = ModuleStats {
                    sum: self.sum,
                    min: self.min,
                    max: self.max,
                    avg: self.sum / num_channels as f32,
                };
                result = Some(TelemetryAggregator::accumulate(params, layout, &local));
                self.channel = 0;
                self.reset_sweep();
            }
        }

        fe.select_channel(self.channel);
        fe.start_conversion();
        result
    }

    /// Measure a single channel over and over
    pub fn test_channel(&mut self, channel: u8, params: &mut dyn ParameterStore, fe: &mut dyn CellFrontEnd) {
        let udc = fe.read_result() as f32 * channel_gain(params, channel);
        fe.select_channel(channel);
        fe.start_conversion();
        params.set(ParamId::U0.offset(channel as u16), udc);
        self.started = false;
    }
}

/// 5 ms current sampling with charge counters
#[derive(Debug, Clone, Default)]
pub struct CurrentMeter {
    samples: u32,
    as_in: f32,
    as_out: f32,
    idc_sum: f32,
}

impl CurrentMeter {
    /// Samples per published average, 1 s at 5 ms
    const SAMPLES: u32 = 200;
    /// Currents inside this band are not counted
    const DEAD_BAND: f32 = 0.8;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn tick(&mut self, params: &mut dyn ParameterStore, io: &dyn ModuleIo) {
        let mode = CurrentSensorMode::from_u8(params.get_int(ParamId::IDCMODE) as u8).unwrap_or_default();
        let raw = match mode {
            CurrentSensorMode::Single => io.analog(AnalogPin::CurrentPos),
            CurrentSensorMode::Differential => io.analog(AnalogPin::CurrentPos) - io.analog(AnalogPin::CurrentNeg),
            // the ISA shunt delivers its values through the CAN map
            CurrentSensorMode::Off | CurrentSensorMode::IsaCan => return,
        };
        let gain = params.get(ParamId::IDCGAIN);
        if gain == 0.0 {
            return;
        }
        let current = (raw - params.get_int(ParamId::IDCOFS)) as f32 / gain;

        if current < -Self::DEAD_BAND {
            self.as_out -= current;
        } else if current > Self::DEAD_BAND {
            self.as_in += current;
        }
        self.idc_sum += current;
        self.samples += 1;

        if self.samples == Self::SAMPLES {
            let n = Self::SAMPLES as f32;
            let idc_avg = self.idc_sum / n;
            let voltage = params.get(ParamId::UTOTAL) / 1000.0;

            params.set(ParamId::CHARGEIN, params.get(ParamId::CHARGEIN) + self.as_in / n);
            params.set(ParamId::CHARGEOUT, params.get(ParamId::CHARGEOUT) + self.as_out / n);
            params.set(ParamId::IDCAVG, idc_avg);
            params.set(ParamId::POWER, voltage * idc_avg);

            *self = Self::default();
        }
        params.set(ParamId::IDC, current);
    }
}

/// NTC inputs of one module
#[derive(Debug, Clone, Copy, Default)]
pub struct TemperatureSensors;

impl TemperatureSensors {
    const ADC_MAX: i32 = 4095;
    const T_NOMINAL_K: f32 = 298.15;
    const KELVIN: f32 = 273.15;

    /// Beta equation for an NTC on the low side of a divider with an equal pull-up
    ///
    /// # Returns
    /// `NO_TEMP` for open or shorted sensors
    pub fn adc_to_temperature(adc: i32, nominal_ohm: f32, beta: f32) -> f32 {
        if adc <= 0 || adc >= Self::ADC_MAX || nominal_ohm <= 0.0 || beta <= 0.0 {
            return NO_TEMP;
        }
        let resistance = nominal_ohm * adc as f32 / (Self::ADC_MAX - adc) as f32;
        let inv_t = 1.0 / Self::T_NOMINAL_K + (resistance / nominal_ohm).ln() / beta;
        1.0 / inv_t - Self::KELVIN
    }

    /// Write `tempmin0`/`tempmax0` from the sensors enabled in `tempsns`
    pub fn read(params: &mut dyn ParameterStore, io: &dyn ModuleIo) {
        let sensors = params.get_int(ParamId::TEMPSNS);
        let nominal = params.get(ParamId::TEMPRES);
        let beta = params.get(ParamId::TEMPBETA);
        let mut readings = Vec::with_capacity(2);

        if sensors & 1 != 0 {
            readings.push(Self::adc_to_temperature(io.analog(AnalogPin::Temp1), nominal, beta));
        }
        if sensors & 2 != 0 {
            readings.push(Self::adc_to_temperature(io.analog(AnalogPin::Temp2), nominal, beta));
        }

        let min = readings.iter().copied().fold(NO_TEMP, f32::min);
        let max = if readings.is_empty() {
            NO_TEMP
        } else {
            readings.iter().copied().fold(f32::MIN, f32::max)
        };
        params.set(ParamId::TEMPMIN0, min);
        params.set(ParamId::TEMPMAX0, max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleConfig;
    use crate::drivers::hal::{SimulatedFrontEnd, SimulatedIo};
    use crate::params::ParamStore;
    use crate::types::BalanceStatus;

    struct Single(u8);

    impl ModuleLayout for Single {
        fn is_first(&self) -> bool {
            true
        }

        fn number_of_modules(&self) -> usize {
            1
        }

        fn cells_of_module(&self, _index: usize) -> u8 {
            self.0
        }

        fn data_item_id(&self, base: ParamId, module_index: Option<u8>) -> ParamId {
            base.offset(module_index.unwrap_or(0) as u16 * ParamId::PER_MODULE_FIELDS)
        }
    }

    fn params(num_channels: u8) -> ParamStore {
        let mut params = ParamStore::new();
        let config = ModuleConfig {
            num_channels,
            correction0_ppm: 0.0,
            correction1_ppm: 0.0,
            correction15_ppm: 0.0,
            ..Default::default()
        };
        config.seed(&mut params);
        params
    }

    #[test]
    fn sweep_order_covers_every_channel_once() {
        let mut order = vec![0u8];
        let mut chan = 0;
        while let Some(next) = next_channel(chan, 7) {
            order.push(next);
            chan = next;
        }
        assert_eq!(order, vec![0, 2, 4, 6, 5, 3, 1]);

        assert_eq!(next_channel(0, 1), None);
        assert_eq!(next_channel(0, 2), Some(1));
        assert_eq!(next_channel(1, 2), None);
    }

    #[test]
    fn full_sweep_publishes_stats() {
        let cells = vec![3700.0, 3650.0, 3720.0, 3690.0];
        let mut fe = SimulatedFrontEnd::new(cells);
        let mut params = params(4);
        let mut scanner = CellScanner::new(3.0, 1.0);

        let mut stats = None;
        for _ in 0..5 {
            if let Some(s) = scanner.tick(ModuleState::Run, &mut params, &mut fe, &Single(4)) {
                stats = Some(s);
            }
        }
        let stats = stats.expect("sweep finished");
        assert!((stats.min - 3650.0).abs() < 1.0);
        assert!((stats.max - 3720.0).abs() < 1.0);
        assert!((params.get(ParamId::U0.offset(2)) - 3720.0).abs() < 1.0);
        assert_eq!(params.get(ParamId::U0CMD), BalanceStatus::Off as u8 as f32);
    }

    #[test]
    fn idle_module_balances_high_cell_down() {
        let mut fe = SimulatedFrontEnd::new(vec![3720.0, 3700.0]);
        let mut params = params(2);
        params.set(ParamId::BALMODE, BalanceMode::Dissipative as u8 as f32);
        params.set(ParamId::UBALANCE, 3600.0);
        params.set(ParamId::UAVG, 3710.0);
        params.set(ParamId::UMIN, 3700.0);
        params.set(ParamId::U0, 3720.0);
        let mut scanner = CellScanner::new(3.0, 1.0);

        scanner.tick(ModuleState::Idle, &mut params, &mut fe, &Single(2)); // prime
        scanner.tick(ModuleState::Idle, &mut params, &mut fe, &Single(2)); // read ch 0, go to ch 1
        assert_eq!(scanner.channel(), 1);
        scanner.tick(ModuleState::Idle, &mut params, &mut fe, &Single(2)); // settle
        params.set(ParamId::U0.offset(1), 3720.0);
        scanner.tick(ModuleState::Idle, &mut params, &mut fe, &Single(2));
        assert_eq!(fe.balancing(), BalanceCommand::Discharge);
        assert_eq!(params.get(ParamId::U0CMD.offset(1)), BalanceStatus::Discharge as u8 as f32);
    }

    #[test]
    fn current_meter_counts_charge() {
        let mut params = ParamStore::new();
        params.set(ParamId::IDCMODE, CurrentSensorMode::Single as u8 as f32);
        params.set(ParamId::IDCGAIN, 10.0);
        params.set(ParamId::UTOTAL, 400_000.0);
        let mut io = SimulatedIo::new(0);
        io.current_pos = 250; // 25 A

        let mut meter = CurrentMeter::new();
        for _ in 0..200 {
            meter.tick(&mut params, &io);
        }
        assert_eq!(params.get(ParamId::IDC), 25.0);
        assert!((params.get(ParamId::IDCAVG) - 25.0).abs() < 1e-3);
        assert!((params.get(ParamId::CHARGEIN) - 25.0).abs() < 1e-3);
        assert_eq!(params.get(ParamId::CHARGEOUT), 0.0);
        assert!((params.get(ParamId::POWER) - 10_000.0).abs() < 1.0);
    }

    #[test]
    fn dead_band_is_not_counted() {
        let mut params = ParamStore::new();
        params.set(ParamId::IDCMODE, CurrentSensorMode::Differential as u8 as f32);
        params.set(ParamId::IDCGAIN, 10.0);
        let mut io = SimulatedIo::new(0);
        io.current_pos = 105;
        io.current_neg = 100;

        let mut meter = CurrentMeter::new();
        for _ in 0..200 {
            meter.tick(&mut params, &io);
        }
        assert_eq!(params.get(ParamId::CHARGEIN), 0.0);
        assert!((params.get(ParamId::IDCAVG) - 0.5).abs() < 1e-3);
    }

    #[test]
    fn ntc_reads_nominal_temperature_at_mid_scale() {
        let t = TemperatureSensors::adc_to_temperature(2048, 10_000.0, 3900.0);
        assert!((t - 25.0).abs() < 0.1, "got {}", t);
        assert!(TemperatureSensors::adc_to_temperature(1000, 10_000.0, 3900.0) > 25.0);
        assert_eq!(TemperatureSensors::adc_to_temperature(0, 10_000.0, 3900.0), NO_TEMP);
    }

    #[test]
    fn missing_sensors_report_sentinel() {
        let mut params = ParamStore::new();
        ModuleConfig::default().seed(&mut params);
        TemperatureSensors::read(&mut params, &SimulatedIo::new(0));
        assert_eq!(params.get(ParamId::TEMPMIN0), NO_TEMP);
        assert_eq!(params.get(ParamId::TEMPMAX0), NO_TEMP);

        params.set(ParamId::TEMPSNS, 3.0);
        let mut io = SimulatedIo::new(0);
        io.temp1 = 2048;
        io.temp2 = 1500;
        TemperatureSensors::read(&mut params, &io);
        assert!(params.get(ParamId::TEMPMIN0) < params.get(ParamId::TEMPMAX0));
    }
}
