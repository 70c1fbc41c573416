// 虚拟总线
// In-process broadcast bus for bench runs and multi-module tests

use crate::drivers::can::{BusDriver, CanError, MAX_CAN_DATA_SIZE};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

type Queue = Arc<Mutex<VecDeque<(u32, Vec<u8>)>>>;

/// Shared medium; every port sees the frames sent by all other ports
#[derive(Debug, Clone, Default)]
pub struct VirtualBus {
    queues: Arc<Mutex<Vec<Queue>>>,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a new node
    pub fn attach(&self) -> VirtualPort {
        let queue: Queue = Arc::new(Mutex::new(VecDeque::new()));
        if let Ok(mut queues) = self.queues.lock() {
            queues.push(queue.clone());
        }
        VirtualPort {
            bus: self.clone(),
            rx: queue,
            expected_ids: HashSet::new(),
            sent: 0,
        }
    }
}

/// One node's connection to a `VirtualBus`
#[derive(Debug)]
pub struct VirtualPort {
    bus: VirtualBus,
    rx: Queue,
    expected_ids: HashSet<u32>,
    sent: usize,
}

impl VirtualPort {
    /// Frames sent through this port so far
    pub fn sent_count(&self) -> usize {
        self.sent
    }
}

impl BusDriver for VirtualPort {
    fn send(&mut self, id: u32, data: &[u8]) -> Result<(), CanError> {
        if data.len() > MAX_CAN_DATA_SIZE {
            return Err(CanError::InvalidData(format!("{} bytes exceed a CAN frame", data.len())));
        }
        let queues = self
            .bus
            .queues
            .lock()
            .map_err(|_| CanError::ProtocolError("Bus mutex poisoned".to_string()))?;
        for queue in queues.iter().filter(|q| !Arc::ptr_eq(q, &self.rx)) {
            if let Ok(mut queue) = queue.lock() {
                queue.push_back((id, data.to_vec()));
            }
        }
        self.sent += 1;
        Ok(())
    }

    fn register_expected_id(&mut self, id: u32) {
        self.expected_ids.insert(id);
    }

    fn receive(&mut self) -> Result<Option<(u32, Vec<u8>)>, CanError> {
        let mut queue = self
            .rx
            .lock()
            .map_err(|_| CanError::ProtocolError("Bus mutex poisoned".to_string()))?;
        while let Some((id, data)) = queue.pop_front() {
            if self.expected_ids.contains(&id) {
                return Ok(Some((id, data)));
            }
        }
        Ok(None)
    }
}
