// 飞电容 BMS 模块固件
// Daisy-chained battery module controller: addressing, cell sensing, SoC/SoH and CAN telemetry

pub mod bms_core;
pub mod config;
pub mod devices;
pub mod drivers;
pub mod error;
pub mod params;
pub mod types;

pub use bms_core::BmsController;
pub use config::ModuleConfig;
pub use error::{BmsError, Result};
pub use params::{ParamId, ParamStore, ParameterStore};
pub use types::{ModuleState, PersistedState};
