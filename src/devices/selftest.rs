// 硬件自检
// Resumable power-on self test of the mux, balancer and cell wiring

use crate::drivers::hal::CellFrontEnd;
use crate::types::{BalanceCommand, TestResult};

/// Self-test steps in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStep {
    /// Mux disconnected, ADC must read close to zero
    MuxOff,
    /// Charge balancer must drive the ADC into saturation in both directions
    Balancer,
    /// Each channel in turn, a reversed cell fails
    CellPolarity,
    /// Fails when the polarity scan saw an over-voltage cell
    CellOverVoltage,
    Done,
}

impl TestStep {
    const SEQUENCE: [TestStep; 5] = [
        TestStep::MuxOff,
        TestStep::Balancer,
        TestStep::CellPolarity,
        TestStep::CellOverVoltage,
        TestStep::Done,
    ];
}

/// Polls one step per tick and stops for good on the first failure
#[derive(Debug, Clone)]
pub struct SelfTestSequencer {
    step_index: usize,
    cycle_counter: u32,
    last_result: TestResult,
    failing_channel: u8,
    num_channels: u8,
    over_voltage: bool,
    polarity_complete: bool,
}

impl SelfTestSequencer {
    /// Largest leakage reading accepted with the mux off
    const MUX_OFF_MAX_DIGITS: i32 = 5;
    /// Reading that counts as saturated
    const SATURATION_DIGITS: i32 = 8190;
    /// Below this a channel is wired backwards
    const REVERSED_DIGITS: i32 = -1000;
    /// Above this a channel is over-voltage
    const OVER_VOLTAGE_DIGITS: i32 = 7500;

    pub fn new(num_channels: u8) -> Self {
        Self {
            step_index: 0,
            cycle_counter: 0,
            last_result: TestResult::Ongoing,
            failing_channel: 0,
            num_channels: num_channels.max(1),
            over_voltage: false,
            polarity_complete: false,
        }
    }

    /// Start over, used when the module is re-addressed
    pub fn reset(&mut self) {
        *self = Self::new(self.num_channels);
    }

    pub fn set_num_channels(&mut self, num_channels: u8) {
        self.num_channels = num_channels.max(1);
    }

    pub fn last_result(&self) -> TestResult {
        self.last_result
    }

    pub fn current_step(&self) -> TestStep {
        TestStep::SEQUENCE[self.step_index.min(TestStep::SEQUENCE.len() - 1)]
    }

    /// 1-based number of the current step, reported as the error code
    pub fn step_number(&self) -> u8 {
        self.step_index as u8 + 1
    }

    pub fn failing_channel(&self) -> u8 {
        self.failing_channel
    }

    /// Poll the current step once
    ///
    /// After a failure nothing touches the hardware anymore and `Failed` is returned.
    pub fn run_test(&mut self, front_end: &mut dyn CellFrontEnd) -> TestResult {
        if self.last_result == TestResult::Failed {
            return TestResult::Failed;
        }

        self.last_result = match self.current_step() {
            TestStep::MuxOff => self.run_mux_off(front_end),
            TestStep::Balancer => self.run_balancer(front_end),
            TestStep::CellPolarity | TestStep::CellOverVoltage => self.run_cell_connection(front_end),
            TestStep::Done => TestResult::Done,
        };

        match self.last_result {
            TestResult::Success => {
                self.step_index += 1;
                self.cycle_counter = 0;
            }
            TestResult::Ongoing => self.cycle_counter += 1,
            TestResult::Failed => {
                log::warn!(
                    "Self test step {} ({:?}) failed, channel {}",
                    self.step_number(),
                    self.current_step(),
                    self.failing_channel
                );
            }
            TestResult::Done => {}
        }
        self.last_result
    }

    fn run_mux_off(&mut self, fe: &mut dyn CellFrontEnd) -> TestResult {
        match self.cycle_counter {
            0 => {
                fe.mux_off();
                fe.set_balancing(BalanceCommand::Discharge);
                fe.start_conversion();
            }
            1 => {
                return if fe.read_result().abs() < Self::MUX_OFF_MAX_DIGITS {
                    TestResult::Success
                } else {
                    TestResult::Failed
                };
            }
            _ => {}
        }
        TestResult::Ongoing
    }

    fn run_balancer(&mut self, fe: &mut dyn CellFrontEnd) -> TestResult {
        match self.cycle_counter {
            0 => {
                fe.mux_off();
                fe.set_balancing(BalanceCommand::Charge);
                fe.start_conversion();
            }
            2 => {
                if fe.read_result() < Self::SATURATION_DIGITS {
                    return TestResult::Failed;
                }
            }
            3 => {
                // odd channel reverses the charge direction, mux goes off right away
                fe.select_channel(1);
                fe.mux_off();
                fe.set_balancing(BalanceCommand::Charge);
                fe.start_conversion();
            }
            5 => {
                let adc = fe.read_result();
                fe.set_balancing(BalanceCommand::Off);
                return if adc < Self::SATURATION_DIGITS {
                    TestResult::Failed
                } else {
                    TestResult::Success
                };
            }
            _ => {}
        }
        TestResult::Ongoing
    }

    fn run_cell_connection(&mut self, fe: &mut dyn CellFrontEnd) -> TestResult {
        if self.over_voltage {
            return TestResult::Failed;
        }
        if self.polarity_complete {
            return TestResult::Success;
        }

        let channel = (self.cycle_counter / 2) as u8;

        if self.cycle_counter % 2 == 1 {
            let adc = fe.read_result();
            fe.mux_off();

            if adc < Self::REVERSED_DIGITS {
                self.failing_channel = channel;
                return TestResult::Failed;
            }
            if adc > Self::OVER_VOLTAGE_DIGITS {
                self.over_voltage = true;
                self.failing_channel = channel;
                return TestResult::Success;
            }
            if channel + 1 >= self.num_channels {
                self.polarity_complete = true;
                return TestResult::Success;
            }
        } else {
            fe.select_channel(channel);
            fe.start_conversion();
        }
        TestResult::Ongoing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::hal::SimulatedFrontEnd;

    fn run_to_end(seq: &mut SelfTestSequencer, fe: &mut SimulatedFrontEnd) -> TestResult {
        for _ in 0..200 {
            match seq.run_test(fe) {
                TestResult::Done => return TestResult::Done,
                TestResult::Failed => return TestResult::Failed,
                _ => {}
            }
        }
        seq.last_result()
    }

    #[test]
    fn healthy_module_passes() {
        let mut fe = SimulatedFrontEnd::new(vec![3700.0; 4]);
        let mut seq = SelfTestSequencer::new(4);
        assert_eq!(run_to_end(&mut seq, &mut fe), TestResult::Done);
        assert_eq!(seq.current_step(), TestStep::Done);
    }

    #[test]
    fn single_channel_module_passes() {
        let mut fe = SimulatedFrontEnd::new(vec![3700.0]);
        let mut seq = SelfTestSequencer::new(1);
        assert_eq!(run_to_end(&mut seq, &mut fe), TestResult::Done);
    }

    #[test]
    fn mux_leakage_fails_first_step() {
        let mut fe = SimulatedFrontEnd::new(vec![3700.0; 4]);
        fe.mux_off_leakage = 12;
        let mut seq = SelfTestSequencer::new(4);
        assert_eq!(run_to_end(&mut seq, &mut fe), TestResult::Failed);
        assert_eq!(seq.step_number(), 1);
    }

    #[test]
    fn broken_balancer_fails_second_step() {
        let mut fe = SimulatedFrontEnd::new(vec![3700.0; 4]);
        fe.broken_balancer = true;
        let mut seq = SelfTestSequencer::new(4);
        assert_eq!(run_to_end(&mut seq, &mut fe), TestResult::Failed);
        assert_eq!(seq.current_step(), TestStep::Balancer);
    }

    #[test]
    fn reversed_cell_records_channel() {
        let mut fe = SimulatedFrontEnd::new(vec![3700.0; 4]);
        fe.reversed[2] = true;
        let mut seq = SelfTestSequencer::new(4);
        assert_eq!(run_to_end(&mut seq, &mut fe), TestResult::Failed);
        assert_eq!(seq.failing_channel(), 2);
        assert_eq!(seq.step_number(), 3);
    }

    #[test]
    fn over_voltage_fails_on_next_poll() {
        let mut fe = SimulatedFrontEnd::new(vec![3700.0, 4600.0, 3700.0]);
        let mut seq = SelfTestSequencer::new(3);

        let mut results = Vec::new();
        for _ in 0..200 {
            let result = seq.run_test(&mut fe);
            results.push(result);
            if result == TestResult::Failed {
                break;
            }
        }
        let n = results.len();
        assert_eq!(results[n - 1], TestResult::Failed);
        assert_eq!(results[n - 2], TestResult::Success);
        assert_eq!(seq.failing_channel(), 1);
        assert_eq!(seq.step_number(), 4);
    }

    #[test]
    fn failure_is_sticky_and_leaves_hardware_alone() {
        let mut fe = SimulatedFrontEnd::new(vec![3700.0; 4]);
        fe.mux_off_leakage = 100;
        let mut seq = SelfTestSequencer::new(4);
        assert_eq!(run_to_end(&mut seq, &mut fe), TestResult::Failed);

        let conversions = fe.conversions;
        fe.mux_off_leakage = 0;
        for _ in 0..10 {
            assert_eq!(seq.run_test(&mut fe), TestResult::Failed);
        }
        assert_eq!(fe.conversions, conversions);
    }
}
