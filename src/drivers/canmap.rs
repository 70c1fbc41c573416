// PDO 映射表
// Bit-packed telemetry frames: parameters mapped to (frame id, bit offset, length, gain, offset)

use crate::drivers::can::{BusDriver, CanError};
use crate::params::{ParamId, ParameterStore};

/// One parameter placed inside a frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanMapping {
    pub param: ParamId,
    pub can_id: u32,
    /// First bit, counted from bit 0 of byte 0 (little endian)
    pub offset: u8,
    pub length: u8,
    pub gain: f32,
    pub value_offset: f32,
    /// Sign-extend on receive
    pub signed: bool,
}

impl CanMapping {
    fn mask(&self) -> u64 {
        if self.length >= 64 {
            u64::MAX
        } else {
            (1u64 << self.length) - 1
        }
    }

    /// Send side: raw = value * gain + offset, truncated to `length` bits
    fn pack(&self, value: f32, frame: &mut u64) {
        let raw = (value * self.gain + self.value_offset).round() as i64 as u64 & self.mask();
        *frame &= !(self.mask() << self.offset);
        *frame |= raw << self.offset;
    }

    /// Receive side: value = raw * gain + offset
    fn unpack(&self, frame: u64) -> f32 {
        let raw = (frame >> self.offset) & self.mask();
        let sign_bit = 1u64 << (self.length - 1);
        let raw = if self.signed && raw & sign_bit != 0 {
            (raw | !self.mask()) as i64
        } else {
            raw as i64
        };
        raw as f32 * self.gain + self.value_offset
    }
}

/// Telemetry map of one module
#[derive(Debug, Clone, Default)]
pub struct CanMap {
    send: Vec<CanMapping>,
    recv: Vec<CanMapping>,
}

impl CanMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.send.clear();
        self.recv.clear();
    }

    pub fn add_send(&mut self, param: ParamId, can_id: u32, offset: u8, length: u8, gain: f32, value_offset: f32) {
        self.send.push(CanMapping {
            param,
            can_id,
            offset,
            length,
            gain,
            value_offset,
            signed: false,
        });
    }

    pub fn add_recv(&mut self, param: ParamId, can_id: u32, offset: u8, length: u8, gain: f32, value_offset: f32) {
        self.recv.push(CanMapping {
            param,
            can_id,
            offset,
            length,
            gain,
            value_offset,
            signed: false,
        });
    }

    pub fn add_recv_signed(&mut self, param: ParamId, can_id: u32, offset: u8, length: u8, gain: f32) {
        self.recv.push(CanMapping {
            param,
            can_id,
            offset,
            length,
            gain,
            value_offset: 0.0,
            signed: true,
        });
    }

    pub fn send_mappings(&self) -> &[CanMapping] {
        &self.send
    }

    /// Frame ids this map wants to receive, without duplicates
    pub fn recv_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.recv.iter().map(|m| m.can_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Build the payload of one outgoing frame from the parameter store
    pub fn pack_frame(&self, can_id: u32, params: &dyn ParameterStore) -> [u8; 8] {
        let mut frame = 0u64;
        for mapping in self.send.iter().filter(|m| m.can_id == can_id) {
            mapping.pack(params.get(mapping.param), &mut frame);
        }
        frame.to_le_bytes()
    }

    /// Send every mapped frame once
    pub fn send_all(&self, params: &dyn ParameterStore, bus: &mut dyn BusDriver) -> Result<(), CanError> {
        let mut ids: Vec<u32> = self.send.iter().map(|m| m.can_id).collect();
        ids.sort_unstable();
        ids.dedup();

        for id in ids {
            bus.send(id, &self.pack_frame(id, params))?;
        }
        Ok(())
    }

    /// Store the mapped fields of a received frame
    ///
    /// # Returns
    /// true if the frame id belongs to this map
    pub fn handle_rx(&self, can_id: u32, data: &[u8], params: &mut dyn ParameterStore) -> bool {
        let mut bytes = [0u8; 8];
        let len = data.len().min(8);
        bytes[..len].copy_from_slice(&data[..len]);
        let frame = u64::from_le_bytes(bytes);

        let mut matched = false;
        for mapping in self.recv.iter().filter(|m| m.can_id == can_id) {
            params.set(mapping.param, mapping.unpack(frame));
            matched = true;
        }
        matched
    }
}
