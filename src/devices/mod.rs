// 设备模块 - 模块固件的各个组件
// Core components of one battery module: coordination, estimation, self test, sensing

pub mod aggregator;
pub mod coordinator;
pub mod estimator;
pub mod pack;
pub mod selftest;
pub mod sensing;

// 重新导出主要类型，方便外部使用
pub use aggregator::{ModuleLayout, TelemetryAggregator};
pub use coordinator::{ModuleCoordinator, TickContext, ADDRESS_FRAME_ID};
pub use estimator::{ChargeCompleteLatch, ChargeControlEstimator, PiController};
pub use pack::{load_state, save_state, PackMonitor};
pub use selftest::{SelfTestSequencer, TestStep};
pub use sensing::{CellScanner, CurrentMeter, TemperatureSensors};
