// SDO 访问
// Expedited SDO upload/download used for the cell-count query between modules

use crate::drivers::can::{BusDriver, CanError};
use crate::params::{ParamId, ParameterStore};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const SDO_REQUEST_BASE: u32 = 0x600;
pub const SDO_REPLY_BASE: u32 = 0x580;
/// Object index of the parameter table, the sub-index is the parameter id
pub const SDO_INDEX_PARAMS: u16 = 0x2000;

const CMD_UPLOAD_REQUEST: u8 = 0x40;
const CMD_UPLOAD_REPLY: u8 = 0x43;
const CMD_DOWNLOAD_REQUEST: u8 = 0x23;
const CMD_DOWNLOAD_REPLY: u8 = 0x60;
const CMD_ABORT: u8 = 0x80;
const ABORT_NO_OBJECT: u32 = 0x0602_0000;

/// Parameter values travel as fixed point with 5 fractional bits
pub const FRAC_BITS: u32 = 5;

pub fn to_fixed(value: f32) -> u32 {
    (value * (1 << FRAC_BITS) as f32).round() as i32 as u32
}

pub fn fixed_to_int(raw: u32) -> i32 {
    (raw as i32) >> FRAC_BITS
}

fn request(cmd: u8, index: u16, sub: u8, value: u32) -> [u8; 8] {
    let idx = index.to_le_bytes();
    let val = value.to_le_bytes();
    [cmd, idx[0], idx[1], sub, val[0], val[1], val[2], val[3]]
}

const REPLY_VALID: u64 = 1 << 32;

/// Client side: one outstanding upload at a time, reply parked in an atomic slot
#[derive(Debug, Default)]
pub struct SdoClient {
    /// Reply frame id we are waiting for, 0 when idle
    awaited_id: AtomicU32,
    /// Reply value in the low 32 bits, `REPLY_VALID` when filled
    reply: AtomicU64,
}

impl SdoClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask `node` for the value at (`index`, `sub`)
    pub fn request_read(&self, bus: &mut dyn BusDriver, node: u8, index: u16, sub: u8) -> Result<(), CanError> {
        let reply_id = SDO_REPLY_BASE + node as u32;
        self.reply.store(0, Ordering::Release);
        self.awaited_id.store(reply_id, Ordering::Release);
        bus.register_expected_id(reply_id);
        bus.send(SDO_REQUEST_BASE + node as u32, &request(CMD_UPLOAD_REQUEST, index, sub, 0))
    }

    /// Take the reply to the last request, if it has arrived
    pub fn take_reply(&self) -> Option<u32> {
        let slot = self.reply.swap(0, Ordering::AcqRel);
        if slot & REPLY_VALID != 0 {
            self.awaited_id.store(0, Ordering::Release);
            Some(slot as u32)
        } else {
            None
        }
    }

    /// Receive path, only fills the reply slot
    pub fn handle_frame(&self, id: u32, data: &[u8]) -> bool {
        let awaited = self.awaited_id.load(Ordering::Acquire);
        if awaited == 0 || id != awaited {
            return false;
        }
        if data.len() < 8 || data[0] != CMD_UPLOAD_REPLY {
            log::debug!("SDO reply on {:#x} without value: {:02x?}", id, data);
            return true;
        }
        let value = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        self.reply.store(REPLY_VALID | value as u64, Ordering::Release);
        true
    }
}

/// Server side: answers parameter reads and writes addressed to our node id
#[derive(Debug, Clone, Copy, Default)]
pub struct SdoServer {
    node_id: u8,
}

impl SdoServer {
    pub fn new(node_id: u8) -> Self {
        Self { node_id }
    }

    pub fn set_node_id(&mut self, node_id: u8) {
        self.node_id = node_id;
    }

    pub fn request_id(&self) -> u32 {
        SDO_REQUEST_BASE + self.node_id as u32
    }

    /// Serve one request frame
    ///
    /// # Returns
    /// Ok(true) if the frame was addressed to us
    pub fn handle_request(
        &self,
        id: u32,
        data: &[u8],
        params: &mut dyn ParameterStore,
        bus: &mut dyn BusDriver,
    ) -> Result<bool, CanError> {
        if id != self.request_id() || data.len() < 8 {
            return Ok(false);
        }
        let index = u16::from_le_bytes([data[1], data[2]]);
        let sub = data[3];
        let reply_id = SDO_REPLY_BASE + self.node_id as u32;

        if index != SDO_INDEX_PARAMS {
            bus.send(reply_id, &request(CMD_ABORT, index, sub, ABORT_NO_OBJECT))?;
            return Ok(true);
        }
        let param = ParamId(sub as u16);

        match data[0] {
            CMD_UPLOAD_REQUEST => {
                let value = to_fixed(params.get(param));
                bus.send(reply_id, &request(CMD_UPLOAD_REPLY, index, sub, value))?;
            }
            CMD_DOWNLOAD_REQUEST => {
                let raw = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
                params.set(param, raw as i32 as f32 / (1 << FRAC_BITS) as f32);
                params.on_change(param);
                bus.send(reply_id, &request(CMD_DOWNLOAD_REPLY, index, sub, 0))?;
            }
            other => {
                log::warn!("Unsupported SDO command {:#04x} from {:#x}", other, id);
                bus.send(reply_id, &request(CMD_ABORT, index, sub, ABORT_NO_OBJECT))?;
            }
        }
        Ok(true)
    }
}
