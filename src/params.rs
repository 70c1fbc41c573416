// 参数表
// Parameter registry keyed by stable numeric id, the shared channel between all tasks

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stable numeric parameter id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParamId(pub u16);

impl ParamId {
    // === Configuration parameters (SDO addressable, id < 256) ===
    pub const GAIN: ParamId = ParamId(3);
    pub const NUMCHAN: ParamId = ParamId(4);
    pub const BALMODE: ParamId = ParamId(5);
    pub const IDCGAIN: ParamId = ParamId(6);
    pub const IDCOFS: ParamId = ParamId(7);
    pub const IDCMODE: ParamId = ParamId(8);
    pub const NOMCAP: ParamId = ParamId(9);
    pub const PDOBASE: ParamId = ParamId(10);
    pub const SDOBASE: ParamId = ParamId(11);
    pub const IDLEWAIT: ParamId = ParamId(12);
    pub const CORRECTION0: ParamId = ParamId(14);
    pub const CORRECTION1: ParamId = ParamId(15);
    pub const CORRECTION15: ParamId = ParamId(16);
    pub const UCELL0SOC: ParamId = ParamId(17); // ..=27 in 10 % steps
    pub const UCELLMIN: ParamId = ParamId(28);
    pub const UCELLMAX: ParamId = ParamId(29);
    pub const UBALANCE: ParamId = ParamId(30);
    pub const DISCHARGEMAX: ParamId = ParamId(32);
    pub const ICC1: ParamId = ParamId(43);
    pub const ICC2: ParamId = ParamId(44);
    pub const ICC3: ParamId = ParamId(45);
    pub const UCV1: ParamId = ParamId(46);
    pub const UCV2: ParamId = ParamId(47);
    pub const ENABLE: ParamId = ParamId(48);
    pub const TESTCHAN: ParamId = ParamId(49);
    pub const TEMPRES: ParamId = ParamId(50);
    pub const TEMPBETA: ParamId = ParamId(51);
    pub const TEMPSNS: ParamId = ParamId(52);
    pub const SOHPRESET: ParamId = ParamId(53);

    // === Values ===
    pub const OPMODE: ParamId = ParamId(2000);
    pub const VERSION: ParamId = ParamId(2001);
    pub const UAVG: ParamId = ParamId(2002);
    pub const UMIN: ParamId = ParamId(2003);
    pub const UMAX: ParamId = ParamId(2004);
    pub const UDELTA: ParamId = ParamId(2005);
    pub const U0: ParamId = ParamId(2006); // ..=2021
    pub const U0CMD: ParamId = ParamId(2022); // ..=2037
    pub const UTOTAL: ParamId = ParamId(2039);
    pub const CHARGEIN: ParamId = ParamId(2040);
    pub const CHARGEOUT: ParamId = ParamId(2041);
    pub const IDC: ParamId = ParamId(2042);
    pub const IDCAVG: ParamId = ParamId(2043);
    pub const TEMPMIN: ParamId = ParamId(2044);
    pub const MODADDR: ParamId = ParamId(2045);
    pub const MODNUM: ParamId = ParamId(2046);
    pub const SOC: ParamId = ParamId(2071);
    pub const CHARGELIM: ParamId = ParamId(2072);
    pub const DISCHARGELIM: ParamId = ParamId(2073);
    pub const TOTALCELLS: ParamId = ParamId(2074);
    pub const POWER: ParamId = ParamId(2075);
    pub const COUNTER: ParamId = ParamId(2076);
    pub const TEMPMAX: ParamId = ParamId(2077);
    pub const SOH: ParamId = ParamId(2086);
    pub const LASTERR: ParamId = ParamId(2101);
    pub const ERRCHAN: ParamId = ParamId(2102);

    // === Per-module telemetry block, repeated every `telemetry_stride` ids ===
    pub const UAVG0: ParamId = ParamId(2200);
    pub const UMIN0: ParamId = ParamId(2201);
    pub const UMAX0: ParamId = ParamId(2202);
    pub const TEMPMIN0: ParamId = ParamId(2203);
    pub const TEMPMAX0: ParamId = ParamId(2204);

    /// Number of fields in one per-module telemetry block
    pub const PER_MODULE_FIELDS: u16 = 5;

    /// Id `n` places after this one, used for the cell and lookup-table arrays
    pub fn offset(self, n: u16) -> ParamId {
        ParamId(self.0 + n)
    }
}

/// Capability-shaped parameter store injected into every task
pub trait ParameterStore {
    /// Current value, 0 for ids that were never written
    fn get(&self, id: ParamId) -> f32;

    /// Internal write, does not raise a change notification
    fn set(&mut self, id: ParamId, value: f32);

    /// Signals that `id` was changed from outside (SDO download, operator)
    fn on_change(&mut self, id: ParamId);

    /// Drains the ids reported through `on_change` since the last call
    fn take_changes(&mut self) -> Vec<ParamId>;

    fn get_int(&self, id: ParamId) -> i32 {
        self.get(id).round() as i32
    }

    fn get_bool(&self, id: ParamId) -> bool {
        self.get(id) != 0.0
    }

    fn set_int(&mut self, id: ParamId, value: i32) {
        self.set(id, value as f32);
    }
}

/// In-memory parameter store
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    values: HashMap<ParamId, f32>,
    changed: Vec<ParamId>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// External write: stores the value and queues a change notification
    pub fn update(&mut self, id: ParamId, value: f32) {
        self.set(id, value);
        self.on_change(id);
    }
}

impl ParameterStore for ParamStore {
    fn get(&self, id: ParamId) -> f32 {
        self.values.get(&id).copied().unwrap_or(0.0)
    }

    fn set(&mut self, id: ParamId, value: f32) {
        self.values.insert(id, value);
    }

    fn on_change(&mut self, id: ParamId) {
        if !self.changed.contains(&id) {
            self.changed.push(id);
        }
    }

    fn take_changes(&mut self) -> Vec<ParamId> {
        std::mem::take(&mut self.changed)
    }
}
