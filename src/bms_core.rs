// 核心 BMS 控制逻辑
// Module scheduler: owns the hardware seams and runs the 5/25/100 ms tasks

use crate::config::ModuleConfig;
use crate::devices::coordinator::{ModuleCoordinator, TickContext, ADDRESS_FRAME_ID};
use crate::devices::estimator::ChargeControlEstimator;
use crate::devices::pack::PackMonitor;
use crate::devices::sensing::{CellScanner, CurrentMeter, TemperatureSensors};
use crate::drivers::can::{BusDriver, FrameHandler};
use crate::drivers::hal::{CellFrontEnd, DigitalPin, ModuleIo};
use crate::params::{ParamId, ParamStore, ParameterStore};
use crate::types::{ModuleState, PersistedState};

/// One battery module
#[derive(Debug)]
pub struct BmsController<B: BusDriver, H: ModuleIo, F: CellFrontEnd> {
    /// Working copy of the configuration, follows operator writes
    config: ModuleConfig,
    params: ParamStore,
    bus: B,
    io: H,
    front_end: F,
    coordinator: ModuleCoordinator,
    scanner: CellScanner,
    current_meter: CurrentMeter,
    pack: PackMonitor,
    /// Current operating state, held here and passed through the coordinator
    state: ModuleState,
    counter: u8,
    led_ticks: u8,
}

impl<B: BusDriver, H: ModuleIo, F: CellFrontEnd> BmsController<B, H, F> {
    /// LED toggles every tick, in Error only every 5th
    const LED_DIVIDER_ERROR: u8 = 5;

    /// Create a module controller
    ///
    /// # Arguments
    /// * `config` - validated module configuration
    /// * `bus` - CAN bus the chain shares
    /// * `io` - enable wires, LED and analog inputs
    /// * `front_end` - flying-capacitor cell front end
    pub fn new(config: ModuleConfig, mut bus: B, io: H, front_end: F) -> Self {
        let mut params = ParamStore::new();
        config.seed(&mut params);
        params.set(ParamId::SOH, config.soh_preset);
        params.set(ParamId::OPMODE, ModuleState::Boot.as_u8() as f32);
        bus.register_expected_id(ADDRESS_FRAME_ID);

        Self {
            coordinator: ModuleCoordinator::new(&config),
            scanner: CellScanner::new(config.balance_hyst_low_mv, config.balance_hyst_high_mv),
            current_meter: CurrentMeter::new(),
            pack: PackMonitor::new(ChargeControlEstimator::from_config(&config)),
            config,
            params,
            bus,
            io,
            front_end,
            state: ModuleState::Boot,
            counter: 0,
            led_ticks: 0,
        }
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    pub fn coordinator(&self) -> &ModuleCoordinator {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut ModuleCoordinator {
        &mut self.coordinator
    }

    pub fn pack(&self) -> &PackMonitor {
        &self.pack
    }

    pub fn io(&self) -> &H {
        &self.io
    }

    pub fn io_mut(&mut self) -> &mut H {
        &mut self.io
    }

    pub fn front_end_mut(&mut self) -> &mut F {
        &mut self.front_end
    }

    /// Seed SoC and SoH from the state file, `None` on first start
    pub fn restore(&mut self, state: Option<PersistedState>) {
        match state {
            Some(state) => {
                log::info!("Restored SoC {:.1} %, SoH {:.1} %", state.soc, state.soh);
                self.pack.restore(&state, &mut self.params);
            }
            None => {
                self.params.set(ParamId::SOH, self.config.soh_preset);
            }
        }
    }

    pub fn persisted_state(&self) -> PersistedState {
        PackMonitor::persisted_state(&self.params)
    }

    /// Drain the receive queue
    ///
    /// # Returns
    /// Number of frames handled
    pub fn poll_bus(&mut self) -> usize {
        let mut frames = 0;
        loop {
            match self.bus.receive() {
                Ok(Some((id, data))) => {
                    frames += 1;
                    self.dispatch_frame(id, &data);
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("CAN receive failed: {}", e);
                    break;
                }
            }
        }
        frames
    }

    fn dispatch_frame(&mut self, id: u32, data: &[u8]) {
        self.coordinator.handle_frame(id, data);

        if self.coordinator.serve_sdo(id, data, &mut self.params, &mut self.bus) {
            return;
        }
        self.coordinator.can_map().handle_rx(id, data, &mut self.params);
    }

    /// Current sampling
    pub fn ms5_task(&mut self) {
        self.current_meter.tick(&mut self.params, &self.io);
    }

    /// Cell sensing: test channel, sweep with balancing, or mux off
    pub fn ms25_task(&mut self) {
        // the self test owns the front end
        if self.state == ModuleState::SelfTest {
            return;
        }

        let test_channel = self.params.get_int(ParamId::TESTCHAN);
        let enabled = self.coordinator.is_enabled(&self.params);

        if (0..16).contains(&test_channel) {
            self.scanner.test_channel(test_channel as u8, &mut self.params, &mut self.front_end);
        } else if enabled && matches!(self.state, ModuleState::Run | ModuleState::Idle) {
            if let Some(stats) =
                self.scanner
                    .tick(self.state, &mut self.params, &mut self.front_end, &self.coordinator)
            {
                log::debug!(
                    "Sweep done: min {:.0} mV, max {:.0} mV, avg {:.0} mV",
                    stats.min,
                    stats.max,
                    stats.avg
                );
            }
        } else {
            self.scanner.stop(&mut self.front_end);
        }
    }

    /// Coordination, temperatures, pack bookkeeping and telemetry
    pub fn ms100_task(&mut self) {
        self.apply_parameter_changes();
        self.blink_led();

        let mut ctx = TickContext {
            params: &mut self.params,
            bus: &mut self.bus,
            io: &mut self.io,
            front_end: &mut self.front_end,
        };
        let next = self.coordinator.tick(self.state, &mut ctx);
        if next != self.state {
            log::info!("State {:?} -> {:?}", self.state, next);
            self.state = next;
        }

        TemperatureSensors::read(&mut self.params, &self.io);

        if self.coordinator.is_first() {
            self.pack.calculate_current_limits(&mut self.params);
            self.pack.calculate_soc_soh(self.state, &mut self.params);
        }

        self.params.set(ParamId::OPMODE, self.state.as_u8() as f32);
        self.counter = (self.counter + 1) & 0xF;
        self.params.set(ParamId::COUNTER, self.counter as f32);

        if let Err(e) = self.coordinator.can_map().send_all(&self.params, &mut self.bus) {
            log::warn!("Telemetry send failed: {}", e);
        }
    }

    fn blink_led(&mut self) {
        let divider = if self.state == ModuleState::Error {
            Self::LED_DIVIDER_ERROR
        } else {
            1
        };
        self.led_ticks += 1;

        if self.led_ticks >= divider {
            self.led_ticks = 0;
            self.io.toggle_output(DigitalPin::Led);
        }
    }

    /// Take over configuration parameters written from outside
    fn apply_parameter_changes(&mut self) {
        for id in self.params.take_changes() {
            let value = self.params.get(id);

            if !self.config.apply_param(id, value) {
                if let Some(accepted) = self.config.value_of(id) {
                    log::warn!("Parameter {} = {} rejected, keeping {}", id.0, value, accepted);
                    self.params.set(id, accepted);
                }
                continue;
            }
            log::info!("Parameter {} set to {}", id.0, value);

            let estimator = self.pack.estimator_mut();
            match id {
                ParamId::NOMCAP => estimator.set_nominal_capacity(value),
                ParamId(n) if (ParamId::UCELL0SOC.0..=ParamId::UCELL0SOC.0 + 10).contains(&n) => {
                    estimator.set_soc_lookup_point(((n - ParamId::UCELL0SOC.0) * 10) as u8, value)
                }
                ParamId::ICC1 | ParamId::UCV1 => {
                    estimator.set_cccv_curve(0, self.config.cccv[0].current_a, self.config.cccv[0].voltage_mv)
                }
                ParamId::ICC2 | ParamId::UCV2 => {
                    estimator.set_cccv_curve(1, self.config.cccv[1].current_a, self.config.cccv[1].voltage_mv)
                }
                ParamId::ICC3 | ParamId::UCELLMAX => {
                    estimator.set_cccv_curve(2, self.config.cccv[2].current_a, self.config.cccv[2].voltage_mv)
                }
                ParamId::NUMCHAN => self.coordinator.set_num_channels(self.config.num_channels),
                _ => {}
            }
        }
    }
}
