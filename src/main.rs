// 纯 Rust 模块控制核心 (可独立运行)
// Host runner: one module on SocketCAN with simulated cell hardware

use anyhow::{Context, Result};
use flying_bms::devices::{load_state, save_state};
use flying_bms::drivers::hal::{SimulatedFrontEnd, SimulatedIo};
use flying_bms::drivers::CanDriver;
use flying_bms::{BmsController, ModuleConfig};
use std::time::Duration;
use tokio::time::{self, MissedTickBehavior};

/// Enable input level of the first module in the chain
const FIRST_MODULE_LEVEL: i32 = 3300;
/// Open-circuit voltage the simulated cells start at, mV
const SIMULATED_CELL_MV: f32 = 3700.0;

fn load_config() -> Result<ModuleConfig> {
    match std::env::args().nth(1) {
        Some(path) => {
            ModuleConfig::load(&path).with_context(|| format!("Failed to load config from {}", path))
        }
        None => {
            log::info!("No config file given, using defaults");
            Ok(ModuleConfig::default())
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("Flying BMS module starting...");

    let config = load_config()?;
    let state_file = config.state_file.clone();

    let mut bus = CanDriver::new(&config.can_interface);
    bus.connect()
        .with_context(|| format!("Failed to open CAN interface {}", config.can_interface))?;

    let cells = vec![SIMULATED_CELL_MV; config.num_channels as usize];
    let mut controller = BmsController::new(
        config,
        bus,
        SimulatedIo::new(FIRST_MODULE_LEVEL),
        SimulatedFrontEnd::new(cells),
    );
    controller.restore(load_state(&state_file).context("Failed to read state file")?);

    let mut ms5 = time::interval(Duration::from_millis(5));
    let mut ms25 = time::interval(Duration::from_millis(25));
    let mut ms100 = time::interval(Duration::from_millis(100));
    // tick counts are the timebase, catch up instead of skipping
    for interval in [&mut ms5, &mut ms25, &mut ms100] {
        interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
    }

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ms5.tick() => {
                controller.poll_bus();
                controller.ms5_task();
            }
            _ = ms25.tick() => controller.ms25_task(),
            _ = ms100.tick() => controller.ms100_task(),
            result = &mut shutdown => {
                result.context("Failed to listen for shutdown signal")?;
                break;
            }
        }
    }

    let state = controller.persisted_state();
    save_state(&state_file, &state).context("Failed to write state file")?;
    log::info!("Saved SoC {:.1} %, SoH {:.1} %", state.soc, state.soh);
    Ok(())
}
