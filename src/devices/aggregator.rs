// 遥测汇总
// Reduces one module's sweep statistics into module-local or pack-wide values

use crate::params::{ParamId, ParameterStore};
use crate::types::{AggregatedStats, ModuleStats, NO_TEMP};

/// What the aggregator needs to know about the chain
pub trait ModuleLayout {
    /// Main module of the chain
    fn is_first(&self) -> bool;

    /// Modules known to the main module, itself included
    fn number_of_modules(&self) -> usize;

    fn cells_of_module(&self, index: usize) -> u8;

    /// Parameter id of a per-module field, `None` selects our own block
    fn data_item_id(&self, base: ParamId, module_index: Option<u8>) -> ParamId;
}

/// Two-level voltage/temperature reduction
#[derive(Debug, Clone, Copy, Default)]
pub struct TelemetryAggregator;

impl TelemetryAggregator {
    /// Lowest temperature the pack maximum starts from
    const TEMP_FLOOR: f32 = -40.0;

    /// Publish a finished sweep
    ///
    /// Submodules write their own values for the main module to pick up; the
    /// main module combines them with what it received from the submodules.
    pub fn accumulate(
        params: &mut dyn ParameterStore,
        layout: &dyn ModuleLayout,
        local: &ModuleStats,
    ) -> AggregatedStats {
        if layout.is_first() {
            Self::accumulate_pack(params, layout, local)
        } else {
            let stats = AggregatedStats {
                min: local.min,
                max: local.max,
                avg: local.avg,
                delta: local.max - local.min,
                total: local.sum,
                temp_min: params.get(ParamId::TEMPMIN0),
                temp_max: params.get(ParamId::TEMPMAX0),
            };
            params.set(ParamId::UTOTAL, stats.total);
            params.set(ParamId::UAVG0, stats.avg);
            params.set(ParamId::UMIN0, stats.min);
            params.set(ParamId::UMAX0, stats.max);
            params.set(ParamId::UDELTA, stats.delta);
            stats
        }
    }

    fn accumulate_pack(
        params: &mut dyn ParameterStore,
        layout: &dyn ModuleLayout,
        local: &ModuleStats,
    ) -> AggregatedStats {
        params.set(ParamId::UAVG0, local.avg);
        params.set(ParamId::UMIN0, local.min);
        params.set(ParamId::UMAX0, local.max);

        let modules = layout.number_of_modules();
        let mut total = local.sum;
        let mut min = local.min;
        let mut max = local.max;

        for i in 1..modules {
            let index = Some(i as u8);
            // only averages travel over the bus, undo them with the known cell count
            total += params.get(layout.data_item_id(ParamId::UAVG0, index)) * layout.cells_of_module(i) as f32;
            min = min.min(params.get(layout.data_item_id(ParamId::UMIN0, index)));
            max = max.max(params.get(layout.data_item_id(ParamId::UMAX0, index)));
        }

        let mut temp_min = NO_TEMP;
        let mut temp_max = Self::TEMP_FLOOR;

        for i in 0..modules {
            let index = Some(i as u8);
            let module_min = params.get(layout.data_item_id(ParamId::TEMPMIN0, index));
            let module_max = params.get(layout.data_item_id(ParamId::TEMPMAX0, index));

            if module_min < NO_TEMP {
                temp_min = temp_min.min(module_min);
                temp_max = temp_max.max(module_max);
            }
        }

        let total_cells: u32 = (0..modules).map(|i| layout.cells_of_module(i) as u32).sum();
        let avg = if total_cells > 0 { total / total_cells as f32 } else { 0.0 };

        let stats = AggregatedStats {
            min,
            max,
            avg,
            delta: max - min,
            total,
            temp_min,
            temp_max,
        };
        params.set(ParamId::UMIN, stats.min);
        params.set(ParamId::UMAX, stats.max);
        params.set(ParamId::UAVG, stats.avg);
        params.set(ParamId::UDELTA, stats.delta);
        params.set(ParamId::UTOTAL, stats.total);
        params.set(ParamId::TEMPMIN, stats.temp_min);
        params.set(ParamId::TEMPMAX, stats.temp_max);
        stats
    }
}
