// 硬件抽象层
// Flying-ADC front end and module I/O seams, with simulated implementations for bench runs

use crate::types::{BalanceCommand, BalanceStatus};

/// Full-scale ADC reading, reached when the balancer drives the input
pub const ADC_SATURATION: i32 = 8191;

/// Multiplexed cell ADC with balancing switches
pub trait CellFrontEnd {
    fn init(&mut self);

    /// Disconnect every cell from the ADC and stop balancing
    fn mux_off(&mut self);

    fn select_channel(&mut self, channel: u8);

    fn start_conversion(&mut self);

    /// Last conversion in digits, polarity corrected for the selected channel
    fn read_result(&mut self) -> i32;

    fn set_balancing(&mut self, cmd: BalanceCommand) -> BalanceStatus;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnalogPin {
    CurrentPos,
    CurrentNeg,
    Temp1,
    Temp2,
    /// Level of the enable wire from the upstream module
    EnableLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigitalPin {
    /// Enable wire to the downstream module
    NextEnable,
    /// Keeps our own supply switched on
    SelfEnable,
    Led,
}

/// Analog inputs and digital outputs of one module
pub trait ModuleIo {
    fn analog(&self, pin: AnalogPin) -> i32;

    fn set_output(&mut self, pin: DigitalPin, on: bool);

    fn output(&self, pin: DigitalPin) -> bool;

    fn toggle_output(&mut self, pin: DigitalPin) {
        let on = self.output(pin);
        self.set_output(pin, !on);
    }
}

/// Front end backed by a table of cell voltages
#[derive(Debug, Clone)]
pub struct SimulatedFrontEnd {
    /// Cell voltages in mV
    pub cells_mv: Vec<f32>,
    /// Channels wired with reversed polarity
    pub reversed: Vec<bool>,
    /// µV per digit
    pub gain: f32,
    /// Leakage reading while the mux is off
    pub mux_off_leakage: i32,
    /// Balancer fails to drive the ADC into saturation
    pub broken_balancer: bool,
    selected: Option<u8>,
    balancing: BalanceCommand,
    result: i32,
    pub conversions: usize,
    pub initialized: bool,
}

impl SimulatedFrontEnd {
    pub fn new(cells_mv: Vec<f32>) -> Self {
        let reversed = vec![false; cells_mv.len()];
        Self {
            cells_mv,
            reversed,
            gain: 586.0,
            mux_off_leakage: 0,
            broken_balancer: false,
            selected: None,
            balancing: BalanceCommand::Off,
            result: 0,
            conversions: 0,
            initialized: false,
        }
    }

    pub fn selected(&self) -> Option<u8> {
        self.selected
    }

    pub fn balancing(&self) -> BalanceCommand {
        self.balancing
    }

    fn digits(&self, channel: u8) -> i32 {
        let mv = self.cells_mv.get(channel as usize).copied().unwrap_or(0.0);
        let digits = (mv * 1000.0 / self.gain).round() as i32;
        let digits = digits.min(ADC_SATURATION);
        if self.reversed.get(channel as usize).copied().unwrap_or(false) {
            -digits
        } else {
            digits
        }
    }
}

impl CellFrontEnd for SimulatedFrontEnd {
    fn init(&mut self) {
        self.initialized = true;
        self.mux_off();
    }

    fn mux_off(&mut self) {
        self.selected = None;
        self.balancing = BalanceCommand::Off;
    }

    fn select_channel(&mut self, channel: u8) {
        self.selected = Some(channel);
    }

    fn start_conversion(&mut self) {
        self.conversions += 1;
        self.result = match (self.selected, self.balancing) {
            (None, BalanceCommand::Charge) if !self.broken_balancer => ADC_SATURATION,
            (None, _) => self.mux_off_leakage,
            (Some(channel), _) => self.digits(channel),
        };
    }

    fn read_result(&mut self) -> i32 {
        self.result
    }

    fn set_balancing(&mut self, cmd: BalanceCommand) -> BalanceStatus {
        self.balancing = cmd;
        match (cmd, self.selected) {
            (BalanceCommand::Off, _) => BalanceStatus::Off,
            (BalanceCommand::Discharge, _) => BalanceStatus::Discharge,
            (BalanceCommand::Charge, Some(channel)) if channel % 2 == 1 => BalanceStatus::ChargeNeg,
            (BalanceCommand::Charge, _) => BalanceStatus::ChargePos,
        }
    }
}

/// Pin levels held in memory
#[derive(Debug, Clone, Default)]
pub struct SimulatedIo {
    pub current_pos: i32,
    pub current_neg: i32,
    pub temp1: i32,
    pub temp2: i32,
    pub enable_level: i32,
    next_enable: bool,
    self_enable: bool,
    led: bool,
}

impl SimulatedIo {
    pub fn new(enable_level: i32) -> Self {
        Self {
            enable_level,
            self_enable: true,
            ..Default::default()
        }
    }
}

impl ModuleIo for SimulatedIo {
    fn analog(&self, pin: AnalogPin) -> i32 {
        match pin {
            AnalogPin::CurrentPos => self.current_pos,
            AnalogPin::CurrentNeg => self.current_neg,
            AnalogPin::Temp1 => self.temp1,
            AnalogPin::Temp2 => self.temp2,
            AnalogPin::EnableLevel => self.enable_level,
        }
    }

    fn set_output(&mut self, pin: DigitalPin, on: bool) {
        match pin {
            DigitalPin::NextEnable => self.next_enable = on,
            DigitalPin::SelfEnable => self.self_enable = on,
            DigitalPin::Led => self.led = on,
        }
    }

    fn output(&self, pin: DigitalPin) -> bool {
        match pin {
            DigitalPin::NextEnable => self.next_enable,
            DigitalPin::SelfEnable => self.self_enable,
            DigitalPin::Led => self.led,
        }
    }
}
