// 后端类型定义
// Plain data types shared by the coordinator, estimator and sensing tasks

use serde::{Deserialize, Serialize};

/// Maximum number of modules in one chain, main module included
pub const MAX_MODULES: usize = 8;

/// Temperature reported by a module without any configured sensor
pub const NO_TEMP: f32 = 128.0;

/// Module operating state, held by the scheduler and passed through each coordinator tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ModuleState {
    #[default]
    Boot,
    GetAddr,
    SetAddr,
    ReqInfo,
    RecvInfo,
    Init,
    SelfTest,
    Run,
    Idle,
    Error,
    Reboot,
}

impl ModuleState {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        let state = match value {
            0 => ModuleState::Boot,
            1 => ModuleState::GetAddr,
            2 => ModuleState::SetAddr,
            3 => ModuleState::ReqInfo,
            4 => ModuleState::RecvInfo,
            5 => ModuleState::Init,
            6 => ModuleState::SelfTest,
            7 => ModuleState::Run,
            8 => ModuleState::Idle,
            9 => ModuleState::Error,
            10 => ModuleState::Reboot,
            _ => return None,
        };
        Some(state)
    }
}

/// Identity of a module within the chain, assigned during addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleIdentity {
    /// Node id used for SDO access
    pub node_id: u8,
    /// Position in the chain, 0 for the main module
    pub module_index: u8,
    /// Base id of the PDO telemetry frames
    pub pdo_base: u16,
    /// Physically first module of the chain
    pub is_main: bool,
    /// Cell count per module, indexed by module index (main module only fills beyond index 0)
    pub cells_per_module: [u8; MAX_MODULES],
}

impl Default for ModuleIdentity {
    fn default() -> Self {
        Self {
            node_id: 0,
            module_index: 0,
            pdo_base: 0,
            is_main: false,
            cells_per_module: [0; MAX_MODULES],
        }
    }
}

/// Statistics of one complete voltage sweep across the local channels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct ModuleStats {
    pub sum: f32,
    pub min: f32,
    pub max: f32,
    pub avg: f32,
}

/// Reduced voltage and temperature statistics, module-local or pack-wide
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct AggregatedStats {
    pub min: f32,
    pub max: f32,
    pub avg: f32,
    pub delta: f32,
    pub total: f32,
    pub temp_min: f32,
    pub temp_max: f32,
}

/// Command issued to the balancer of the selected channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BalanceCommand {
    #[default]
    Off,
    Discharge,
    Charge,
}

/// Balancer state reported back by the front end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BalanceStatus {
    #[default]
    Off = 0,
    Discharge = 1,
    ChargePos = 2,
    ChargeNeg = 3,
}

/// Balancing strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BalanceMode {
    #[default]
    Off = 0,
    Additive = 1,
    Dissipative = 2,
    Both = 3,
}

impl BalanceMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BalanceMode::Off),
            1 => Some(BalanceMode::Additive),
            2 => Some(BalanceMode::Dissipative),
            3 => Some(BalanceMode::Both),
            _ => None,
        }
    }

    /// Charge low cells from the stack
    pub fn adds(self) -> bool {
        matches!(self, BalanceMode::Additive | BalanceMode::Both)
    }

    /// Bleed high cells through the discharge FETs
    pub fn dissipates(self) -> bool {
        matches!(self, BalanceMode::Dissipative | BalanceMode::Both)
    }
}

/// Current sensor wiring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CurrentSensorMode {
    #[default]
    Off = 0,
    Single = 1,
    Differential = 2,
    IsaCan = 3,
}

impl CurrentSensorMode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CurrentSensorMode::Off),
            1 => Some(CurrentSensorMode::Single),
            2 => Some(CurrentSensorMode::Differential),
            3 => Some(CurrentSensorMode::IsaCan),
            _ => None,
        }
    }
}

/// Outcome of polling one self-test step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TestResult {
    #[default]
    Ongoing,
    Success,
    Failed,
    Done,
}

/// Values that survive a power cycle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// State of charge in %
    pub soc: f32,
    /// State of health in %
    pub soh: f32,
}
