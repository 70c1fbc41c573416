// 模块协调器
// Chain addressing and role state machine, telemetry map setup and self-test supervision

use crate::config::ModuleConfig;
use crate::devices::aggregator::ModuleLayout;
use crate::devices::selftest::SelfTestSequencer;
use crate::drivers::can::{BusDriver, FrameHandler};
use crate::drivers::canmap::CanMap;
use crate::drivers::hal::{AnalogPin, CellFrontEnd, DigitalPin, ModuleIo};
use crate::drivers::sdo::{self, SdoClient, SdoServer, SDO_INDEX_PARAMS};
use crate::params::{ParamId, ParameterStore};
use crate::types::{ModuleIdentity, ModuleState, TestResult, MAX_MODULES};
use std::sync::atomic::{AtomicU32, Ordering};

/// Broadcast frame carrying the next module's address
pub const ADDRESS_FRAME_ID: u32 = 0x7DD;

/// Address announced by the upstream module, written from the receive path
///
/// Node id, module index and PDO base share one atomic word so the tick
/// never sees a half-written address. Node id 0 means nothing pending.
#[derive(Debug, Default)]
pub struct AddressMailbox {
    slot: AtomicU32,
}

impl AddressMailbox {
    pub fn post(&self, node_id: u8, module_index: u8, pdo_base: u16) {
        let word = node_id as u32 | (module_index as u32) << 8 | (pdo_base as u32) << 16;
        self.slot.store(word, Ordering::Release);
    }

    pub fn clear(&self) {
        self.slot.store(0, Ordering::Release);
    }

    /// Take the pending address, if any
    pub fn take(&self) -> Option<(u8, u8, u16)> {
        let word = self.slot.swap(0, Ordering::AcqRel);
        let node_id = (word & 0xFF) as u8;
        if node_id == 0 {
            return None;
        }
        Some((node_id, (word >> 8 & 0xFF) as u8, (word >> 16) as u16))
    }
}

/// Everything a tick may touch besides the coordinator itself
pub struct TickContext<'a> {
    pub params: &'a mut dyn ParameterStore,
    pub bus: &'a mut dyn BusDriver,
    pub io: &'a mut dyn ModuleIo,
    pub front_end: &'a mut dyn CellFrontEnd,
}

/// Role and address state machine of one module
#[derive(Debug)]
pub struct ModuleCoordinator {
    config: ModuleConfig,
    identity: ModuleIdentity,
    mailbox: AddressMailbox,
    sdo_client: SdoClient,
    sdo_server: SdoServer,
    can_map: CanMap,
    self_test: SelfTestSequencer,
    /// Next submodule to ask for its cell count
    info_index: u8,
    num_modules: u8,
    cycles: u32,
    enable_level: i32,
    /// Enable wire was already high on an earlier GetAddr tick
    enable_seen: bool,
    reboot_requested: bool,
    outputs_cleared: bool,
}

impl ModuleCoordinator {
    pub fn new(config: &ModuleConfig) -> Self {
        Self {
            config: config.clone(),
            identity: ModuleIdentity::default(),
            mailbox: AddressMailbox::default(),
            sdo_client: SdoClient::new(),
            sdo_server: SdoServer::default(),
            can_map: CanMap::new(),
            self_test: SelfTestSequencer::new(config.num_channels),
            info_index: 1,
            num_modules: 1,
            cycles: 0,
            enable_level: 0,
            enable_seen: false,
            reboot_requested: false,
            outputs_cleared: false,
        }
    }

    pub fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    pub fn can_map(&self) -> &CanMap {
        &self.can_map
    }

    pub fn self_test(&self) -> &SelfTestSequencer {
        &self.self_test
    }

    pub fn config_mut(&mut self) -> &mut ModuleConfig {
        &mut self.config
    }

    /// Physically first module of the chain, or already established as main
    pub fn is_first(&self) -> bool {
        self.identity.is_main || self.enable_level > self.config.first_threshold
    }

    /// Upstream enable wire is driven and the operator has not disabled us
    pub fn is_enabled(&self, params: &dyn ParameterStore) -> bool {
        params.get_bool(ParamId::ENABLE) && self.enable_level > self.config.enable_threshold
    }

    /// Per-module parameter id: `base + module_index * stride`
    pub fn data_item_id(&self, base: ParamId, module_index: Option<u8>) -> ParamId {
        let index = module_index.unwrap_or(self.identity.module_index);
        base.offset(index as u16 * self.config.telemetry_stride)
    }

    /// Re-run addressing from Boot; the next tick enters Reboot
    pub fn request_reboot(&mut self) {
        log::info!("Reboot requested");
        self.reboot_requested = true;
    }

    pub fn set_num_channels(&mut self, num_channels: u8) {
        self.identity.cells_per_module[0] = num_channels;
        self.self_test.set_num_channels(num_channels);
    }

    /// Asynchronous receive path for the address broadcast and SDO replies
    pub fn on_address_frame(&self, data: &[u8]) {
        if data.len() < 4 {
            log::warn!("Short address frame: {:02x?}", data);
            return;
        }
        self.mailbox.post(data[0], data[1], u16::from_le_bytes([data[2], data[3]]));
    }

    /// Answer parameter reads and writes addressed to our node id
    pub fn serve_sdo(
        &self,
        id: u32,
        data: &[u8],
        params: &mut dyn ParameterStore,
        bus: &mut dyn BusDriver,
    ) -> bool {
        if self.identity.node_id == 0 {
            return false;
        }
        match self.sdo_server.handle_request(id, data, params, bus) {
            Ok(handled) => handled,
            Err(e) => {
                log::warn!("SDO reply failed: {}", e);
                true
            }
        }
    }

    /// One 100 ms step of the state machine
    pub fn tick(&mut self, state: ModuleState, ctx: &mut TickContext<'_>) -> ModuleState {
        self.enable_level = ctx.io.analog(AnalogPin::EnableLevel);

        if self.reboot_requested && state != ModuleState::Reboot {
            self.reboot_requested = false;
            self.cycles = 0;
            ctx.io.set_output(DigitalPin::NextEnable, false);
            return ModuleState::Reboot;
        }

        match state {
            ModuleState::Boot => self.boot(ctx),
            ModuleState::GetAddr => self.get_addr(ctx),
            ModuleState::SetAddr => self.set_addr(ctx),
            ModuleState::ReqInfo => self.req_info(ctx),
            ModuleState::RecvInfo => self.recv_info(ctx),
            ModuleState::Init => {
                ctx.front_end.init();
                self.self_test.set_num_channels(ctx.params.get_int(ParamId::NUMCHAN).clamp(1, 16) as u8);
                ModuleState::SelfTest
            }
            ModuleState::SelfTest => self.run_self_test(ctx),
            ModuleState::Run => self.run(ctx),
            ModuleState::Idle => self.idle(ctx),
            ModuleState::Error => {
                if self.is_enabled(ctx.params) {
                    log::info!("Re-enabled after error");
                    self.cycles = 0;
                    ModuleState::Run
                } else {
                    ModuleState::Error
                }
            }
            ModuleState::Reboot => self.reboot(ctx),
        }
    }

    fn boot(&mut self, ctx: &mut TickContext<'_>) -> ModuleState {
        if self.is_first() {
            let num_channels = ctx.params.get_int(ParamId::NUMCHAN).clamp(1, 16) as u8;
            self.identity.node_id = ctx.params.get_int(ParamId::SDOBASE) as u8;
            self.identity.module_index = 0;
            self.identity.pdo_base = ctx.params.get_int(ParamId::PDOBASE) as u16;
            self.identity.is_main = true;
            self.identity.cells_per_module[0] = num_channels;
            self.assign_node(ctx);

            self.can_map.clear();
            self.map_main_module();
            self.register_recv_ids(ctx.bus);
            ctx.io.set_output(DigitalPin::NextEnable, true);

            ctx.params.set_int(ParamId::TOTALCELLS, num_channels as i32);
            ctx.params.set_int(ParamId::MODNUM, 1);
            log::info!("Main module, node id {}", self.identity.node_id);
            ModuleState::SetAddr
        } else {
            self.mailbox.clear();
            ModuleState::GetAddr
        }
    }

    fn get_addr(&mut self, ctx: &mut TickContext<'_>) -> ModuleState {
        // a broadcast seen before our enable wire rose was meant for an upstream module
        if !self.is_enabled(ctx.params) || !self.enable_seen {
            self.enable_seen = self.is_enabled(ctx.params);
            self.mailbox.clear();
            return ModuleState::GetAddr;
        }
        let Some((node_id, module_index, pdo_base)) = self.mailbox.take() else {
            return ModuleState::GetAddr;
        };

        self.identity.node_id = node_id;
        self.identity.module_index = module_index;
        self.identity.pdo_base = pdo_base;
        self.identity.cells_per_module[0] = ctx.params.get_int(ParamId::NUMCHAN).clamp(1, 16) as u8;
        self.assign_node(ctx);

        self.can_map.clear();
        self.map_submodule();
        self.register_recv_ids(ctx.bus);
        ctx.io.set_output(DigitalPin::NextEnable, true);
        log::info!("Submodule {} with node id {}", module_index, node_id);
        ModuleState::SetAddr
    }

    fn assign_node(&mut self, ctx: &mut TickContext<'_>) {
        self.sdo_server.set_node_id(self.identity.node_id);
        ctx.bus.register_expected_id(self.sdo_server.request_id());
        ctx.params.set_int(ParamId::MODADDR, self.identity.node_id as i32);
    }

    fn set_addr(&mut self, ctx: &mut TickContext<'_>) -> ModuleState {
        self.cycles += 1;

        if self.cycles < self.config.addr_debounce_ticks {
            return ModuleState::SetAddr;
        }
        self.cycles = 0;

        let pdo = self.identity.pdo_base.to_le_bytes();
        let frame = [
            self.identity.node_id.wrapping_add(1),
            self.identity.module_index.wrapping_add(1),
            pdo[0],
            pdo[1],
        ];
        if let Err(e) = ctx.bus.send(ADDRESS_FRAME_ID, &frame) {
            log::warn!("Address broadcast failed: {}", e);
        }

        if self.identity.is_main {
            ModuleState::ReqInfo
        } else {
            ModuleState::Init
        }
    }

    fn req_info(&mut self, ctx: &mut TickContext<'_>) -> ModuleState {
        self.cycles += 1;

        if self.cycles < self.config.info_settle_ticks {
            return ModuleState::ReqInfo;
        }
        self.cycles = 0;

        let node = self.info_index.wrapping_add(ctx.params.get_int(ParamId::SDOBASE) as u8);
        if let Err(e) = self
            .sdo_client
            .request_read(ctx.bus, node, SDO_INDEX_PARAMS, ParamId::NUMCHAN.0 as u8)
        {
            log::warn!("Info request to node {} failed: {}", node, e);
        }
        ModuleState::RecvInfo
    }

    fn recv_info(&mut self, ctx: &mut TickContext<'_>) -> ModuleState {
        let Some(reply) = self.sdo_client.take_reply() else {
            log::info!("Chain ends with {} module(s)", self.num_modules);
            return ModuleState::Init;
        };

        let cells = sdo::fixed_to_int(reply).clamp(0, 16) as u8;
        self.identity.cells_per_module[self.info_index as usize] = cells;
        self.num_modules += 1;
        self.info_index += 1;

        let total = ctx.params.get_int(ParamId::TOTALCELLS) + cells as i32;
        ctx.params.set_int(ParamId::TOTALCELLS, total);
        ctx.params.set_int(ParamId::MODNUM, self.num_modules as i32);
        log::info!("Module {} reports {} cells, {} in total", self.info_index - 1, cells, total);

        if (self.info_index as usize) < MAX_MODULES {
            ModuleState::ReqInfo
        } else {
            ModuleState::Init
        }
    }

    fn run_self_test(&mut self, ctx: &mut TickContext<'_>) -> ModuleState {
        match self.self_test.run_test(ctx.front_end) {
            TestResult::Done => {
                log::info!("Self test passed");
                self.cycles = 0;
                ModuleState::Run
            }
            TestResult::Failed => {
                ctx.params.set_int(ParamId::ENABLE, 0);
                ctx.params.set_int(ParamId::LASTERR, self.self_test.step_number() as i32);
                ctx.params.set_int(ParamId::ERRCHAN, self.self_test.failing_channel() as i32);
                ModuleState::Error
            }
            TestResult::Ongoing | TestResult::Success => ModuleState::SelfTest,
        }
    }

    fn pack_at_rest(&self, params: &dyn ParameterStore) -> bool {
        params.get(ParamId::IDCAVG).abs() < self.config.idle_current_a
    }

    /// Pass a shutdown down the chain
    fn cascade_disable(&mut self, ctx: &mut TickContext<'_>) {
        if !self.is_enabled(ctx.params) && !self.is_first() {
            self.clear_outputs(ctx.io);
        }
    }

    fn clear_outputs(&mut self, io: &mut dyn ModuleIo) {
        if !self.outputs_cleared {
            log::info!("Switching off module {}", self.identity.module_index);
        }
        io.set_output(DigitalPin::NextEnable, false);
        io.set_output(DigitalPin::SelfEnable, false);
        self.outputs_cleared = true;
    }

    fn run(&mut self, ctx: &mut TickContext<'_>) -> ModuleState {
        self.cascade_disable(ctx);

        if self.pack_at_rest(ctx.params) {
            self.cycles += 1;

            if self.cycles > ctx.params.get_int(ParamId::IDLEWAIT).max(0) as u32 * 10 {
                self.cycles = 0;
                return ModuleState::Idle;
            }
        } else {
            self.cycles = 0;
        }
        ModuleState::Run
    }

    fn idle(&mut self, ctx: &mut TickContext<'_>) -> ModuleState {
        self.cycles += 1;

        if !self.pack_at_rest(ctx.params) {
            self.cycles = 0;
            return ModuleState::Run;
        }

        self.cascade_disable(ctx);
        if self.cycles > self.config.turnoff_wait_ticks {
            self.clear_outputs(ctx.io);
        }
        ModuleState::Idle
    }

    fn reboot(&mut self, ctx: &mut TickContext<'_>) -> ModuleState {
        ctx.io.set_output(DigitalPin::NextEnable, false);
        self.cycles += 1;

        if self.cycles < self.config.reboot_hold_ticks {
            return ModuleState::Reboot;
        }

        self.identity = ModuleIdentity::default();
        self.sdo_server.set_node_id(0);
        self.mailbox.clear();
        self.can_map.clear();
        self.self_test.reset();
        self.info_index = 1;
        self.num_modules = 1;
        self.cycles = 0;
        self.enable_seen = false;
        self.outputs_cleared = false;
        ctx.io.set_output(DigitalPin::SelfEnable, true);
        ModuleState::Boot
    }

    fn register_recv_ids(&self, bus: &mut dyn BusDriver) {
        for id in self.can_map.recv_ids() {
            bus.register_expected_id(id);
        }
    }

    /// Main module: receive every submodule's block, send the pack values
    fn map_main_module(&mut self) {
        let pdo = self.identity.pdo_base as u32;

        for i in 1..MAX_MODULES as u8 {
            let id = pdo + i as u32 + 1;
            let [umin, umax, uavg, tmin, tmax] = [
                ParamId::UMIN0,
                ParamId::UMAX0,
                ParamId::UAVG0,
                ParamId::TEMPMIN0,
                ParamId::TEMPMAX0,
            ]
            .map(|base| self.data_item_id(base, Some(i)));

            self.can_map.add_recv(umin, id, 0, 13, 1.0, 0.0);
            self.can_map.add_recv(umax, id, 16, 13, 1.0, 0.0);
            self.can_map.add_recv(uavg, id, 32, 13, 1.0, 0.0);
            self.can_map.add_recv(tmin, id, 48, 8, 1.0, -40.0);
            self.can_map.add_recv(tmax, id, 56, 8, 1.0, -40.0);
        }

        // pack values, not our local ones
        self.can_map.add_send(ParamId::UMIN, pdo + 1, 0, 13, 1.0, 0.0);
        self.can_map.add_send(ParamId::UMAX, pdo + 1, 16, 13, 1.0, 0.0);
        self.can_map.add_send(ParamId::COUNTER, pdo + 1, 30, 2, 1.0, 0.0);
        self.can_map.add_send(ParamId::UAVG, pdo + 1, 32, 13, 1.0, 0.0);
        self.can_map.add_send(ParamId::TEMPMIN, pdo + 1, 48, 8, 1.0, 40.0);
        self.can_map.add_send(ParamId::TEMPMAX, pdo + 1, 56, 8, 1.0, 40.0);

        self.can_map.add_send(ParamId::CHARGELIM, pdo, 0, 11, 1.0, 0.0);
        self.can_map.add_send(ParamId::DISCHARGELIM, pdo, 11, 11, 1.0, 0.0);
        self.can_map.add_send(ParamId::SOC, pdo, 22, 10, 10.0, 0.0);
        self.can_map.add_send(ParamId::IDCAVG, pdo, 32, 16, 10.0, 0.0);
        self.can_map.add_send(ParamId::UTOTAL, pdo, 48, 10, 0.001, 0.0);
        self.can_map.add_send(ParamId::COUNTER, pdo, 62, 2, 1.0, 0.0);
    }

    /// Submodule: send our local block, receive pack current and voltages
    fn map_submodule(&mut self) {
        let pdo = self.identity.pdo_base as u32;
        // the main module occupies two frames
        let id = pdo + self.identity.module_index as u32 + 1;

        self.can_map.add_send(ParamId::UMIN0, id, 0, 13, 1.0, 0.0);
        self.can_map.add_send(ParamId::UMAX0, id, 16, 13, 1.0, 0.0);
        self.can_map.add_send(ParamId::COUNTER, id, 30, 2, 1.0, 0.0);
        self.can_map.add_send(ParamId::UAVG0, id, 32, 13, 1.0, 0.0);
        self.can_map.add_send(ParamId::TEMPMIN0, id, 48, 8, 1.0, 40.0);
        self.can_map.add_send(ParamId::TEMPMAX0, id, 56, 8, 1.0, 40.0);

        self.can_map.add_recv_signed(ParamId::IDCAVG, pdo, 32, 16, 0.1);
        self.can_map.add_recv(ParamId::UMIN, pdo + 1, 0, 13, 1.0, 0.0);
        self.can_map.add_recv(ParamId::UMAX, pdo + 1, 16, 13, 1.0, 0.0);
        self.can_map.add_recv(ParamId::UAVG, pdo + 1, 32, 13, 1.0, 0.0);
    }
}

impl FrameHandler for ModuleCoordinator {
    fn handle_frame(&self, id: u32, data: &[u8]) {
        if id == ADDRESS_FRAME_ID {
            self.on_address_frame(data);
        } else {
            self.sdo_client.handle_frame(id, data);
        }
    }
}

impl ModuleLayout for ModuleCoordinator {
    fn is_first(&self) -> bool {
        ModuleCoordinator::is_first(self)
    }

    fn number_of_modules(&self) -> usize {
        self.num_modules as usize
    }

    fn cells_of_module(&self, index: usize) -> u8 {
        self.identity.cells_per_module.get(index).copied().unwrap_or(0)
    }

    fn data_item_id(&self, base: ParamId, module_index: Option<u8>) -> ParamId {
        ModuleCoordinator::data_item_id(self, base, module_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::hal::{SimulatedFrontEnd, SimulatedIo};
    use crate::drivers::virtual_bus::{VirtualBus, VirtualPort};
    use crate::params::ParamStore;

    const FIRST_LEVEL: i32 = 3300;

    struct Rig {
        coordinator: ModuleCoordinator,
        params: ParamStore,
        port: VirtualPort,
        io: SimulatedIo,
        fe: SimulatedFrontEnd,
        state: ModuleState,
    }

    impl Rig {
        fn new(bus: &VirtualBus, enable_level: i32) -> Self {
            let config = ModuleConfig { num_channels: 4, ..Default::default() };
            let mut params = ParamStore::new();
            config.seed(&mut params);
            let mut port = bus.attach();
            port.register_expected_id(ADDRESS_FRAME_ID);
            Self {
                coordinator: ModuleCoordinator::new(&config),
                params,
                port,
                io: SimulatedIo::new(enable_level),
                fe: SimulatedFrontEnd::new(vec![3700.0; 4]),
                state: ModuleState::Boot,
            }
        }

        fn tick(&mut self) -> ModuleState {
            while let Ok(Some((id, data))) = self.port.receive() {
                self.coordinator.handle_frame(id, &data);
            }
            let mut ctx = TickContext {
                params: &mut self.params,
                bus: &mut self.port,
                io: &mut self.io,
                front_end: &mut self.fe,
            };
            self.state = self.coordinator.tick(self.state, &mut ctx);
            self.state
        }

        fn tick_until(&mut self, target: ModuleState, limit: usize) {
            for _ in 0..limit {
                if self.tick() == target {
                    return;
                }
            }
            panic!("stuck in {:?}, expected {:?}", self.state, target);
        }
    }

    #[test]
    fn mailbox_delivers_whole_address() {
        let mailbox = AddressMailbox::default();
        assert_eq!(mailbox.take(), None);
        mailbox.post(11, 1, 500);
        mailbox.post(12, 2, 500);
        assert_eq!(mailbox.take(), Some((12, 2, 500)));
        assert_eq!(mailbox.take(), None);
    }

    #[test]
    fn first_module_becomes_main_and_broadcasts() {
        let bus = VirtualBus::new();
        let mut listener = bus.attach();
        listener.register_expected_id(ADDRESS_FRAME_ID);
        let mut rig = Rig::new(&bus, FIRST_LEVEL);

        assert_eq!(rig.tick(), ModuleState::SetAddr);
        assert!(rig.coordinator.identity().is_main);
        assert_eq!(rig.coordinator.identity().node_id, 10);
        assert!(rig.io.output(DigitalPin::NextEnable));

        for _ in 0..4 {
            assert_eq!(rig.tick(), ModuleState::SetAddr);
        }
        assert_eq!(listener.receive().unwrap(), None);
        assert_eq!(rig.tick(), ModuleState::ReqInfo);
        assert_eq!(listener.receive().unwrap(), Some((ADDRESS_FRAME_ID, vec![11, 1, 0xF4, 0x01])));
    }

    #[test]
    fn lone_main_module_ends_chain_without_reply() {
        let bus = VirtualBus::new();
        let mut rig = Rig::new(&bus, FIRST_LEVEL);
        rig.tick_until(ModuleState::RecvInfo, 30);
        assert_eq!(rig.tick(), ModuleState::Init);
        assert_eq!(rig.tick(), ModuleState::SelfTest);
        assert!(rig.fe.initialized);
        rig.tick_until(ModuleState::Run, 50);
        assert_eq!(rig.params.get_int(ParamId::MODNUM), 1);
        assert_eq!(rig.params.get_int(ParamId::TOTALCELLS), 4);
    }

    #[test]
    fn submodule_waits_for_enable_wire() {
        let bus = VirtualBus::new();
        let mut upstream = bus.attach();
        let mut rig = Rig::new(&bus, 0);

        assert_eq!(rig.tick(), ModuleState::GetAddr);
        upstream.send(ADDRESS_FRAME_ID, &[11, 1, 0xF4, 0x01]).unwrap();
        assert_eq!(rig.tick(), ModuleState::GetAddr);

        rig.io.enable_level = 1000;
        assert_eq!(rig.tick(), ModuleState::GetAddr);
        upstream.send(ADDRESS_FRAME_ID, &[11, 1, 0xF4, 0x01]).unwrap();
        assert_eq!(rig.tick(), ModuleState::SetAddr);

        let identity = rig.coordinator.identity();
        assert_eq!((identity.node_id, identity.module_index, identity.pdo_base), (11, 1, 500));
        assert!(!identity.is_main);
        assert_eq!(rig.coordinator.data_item_id(ParamId::UAVG0, None), ParamId(2205));
        assert_eq!(rig.coordinator.can_map().send_mappings()[0].can_id, 502);
    }

    #[test]
    fn info_exchange_stops_at_module_limit() {
        let bus = VirtualBus::new();
        let mut submodules = bus.attach();
        for node in 11..18 {
            submodules.register_expected_id(sdo::SDO_REQUEST_BASE + node);
        }
        let mut sub_params = ParamStore::new();
        sub_params.set(ParamId::NUMCHAN, 3.0);
        let mut rig = Rig::new(&bus, FIRST_LEVEL);

        let mut answered = 0;
        for _ in 0..200 {
            if rig.tick() == ModuleState::Init {
                break;
            }
            while let Ok(Some((id, data))) = submodules.receive() {
                let server = SdoServer::new((id - sdo::SDO_REQUEST_BASE) as u8);
                if server.handle_request(id, &data, &mut sub_params, &mut submodules).unwrap() {
                    answered += 1;
                }
            }
        }

        assert_eq!(rig.state, ModuleState::Init);
        assert_eq!(answered, MAX_MODULES - 1);
        assert_eq!(rig.params.get_int(ParamId::MODNUM), MAX_MODULES as i32);
        assert_eq!(rig.params.get_int(ParamId::TOTALCELLS), 4 + 7 * 3);
        assert_eq!(rig.coordinator.cells_of_module(7), 3);
        // no query beyond the last slot
        assert_eq!(submodules.receive().unwrap(), None);
    }

    #[test]
    fn disabled_submodule_switches_off_downstream() {
        let bus = VirtualBus::new();
        let mut upstream = bus.attach();
        let mut rig = Rig::new(&bus, 1000);

        rig.tick();
        rig.tick();
        upstream.send(ADDRESS_FRAME_ID, &[11, 1, 0xF4, 0x01]).unwrap();
        rig.tick_until(ModuleState::Run, 50);
        assert!(!rig.coordinator.is_first());
        assert!(rig.io.output(DigitalPin::NextEnable));
        assert!(rig.io.output(DigitalPin::SelfEnable));

        rig.params.set_int(ParamId::ENABLE, 0);
        assert_eq!(rig.tick(), ModuleState::Run);
        assert!(!rig.io.output(DigitalPin::NextEnable));
        assert!(!rig.io.output(DigitalPin::SelfEnable));
    }

    #[test]
    fn disabled_main_module_keeps_chain_powered() {
        let bus = VirtualBus::new();
        let mut rig = Rig::new(&bus, FIRST_LEVEL);
        rig.tick_until(ModuleState::Run, 80);

        rig.params.set_int(ParamId::ENABLE, 0);
        for _ in 0..3 {
            assert_eq!(rig.tick(), ModuleState::Run);
        }
        assert!(rig.io.output(DigitalPin::NextEnable));
        assert!(rig.io.output(DigitalPin::SelfEnable));
    }

    #[test]
    fn failed_self_test_latches_error_until_re_enabled() {
        let bus = VirtualBus::new();
        let mut rig = Rig::new(&bus, FIRST_LEVEL);
        rig.fe.reversed[3] = true;

        rig.tick_until(ModuleState::SelfTest, 40);
        rig.tick_until(ModuleState::Error, 50);
        assert_eq!(rig.params.get_int(ParamId::LASTERR), 3);
        assert_eq!(rig.params.get_int(ParamId::ERRCHAN), 3);
        assert!(!rig.params.get_bool(ParamId::ENABLE));

        for _ in 0..5 {
            assert_eq!(rig.tick(), ModuleState::Error);
        }
        rig.params.set_int(ParamId::ENABLE, 1);
        assert_eq!(rig.tick(), ModuleState::Run);
    }

    #[test]
    fn rest_current_leads_to_idle_and_back() {
        let bus = VirtualBus::new();
        let mut rig = Rig::new(&bus, FIRST_LEVEL);
        rig.params.set(ParamId::IDLEWAIT, 1.0);
        rig.tick_until(ModuleState::Run, 80);

        for _ in 0..10 {
            assert_eq!(rig.tick(), ModuleState::Run);
        }
        assert_eq!(rig.tick(), ModuleState::Idle);

        rig.params.set(ParamId::IDCAVG, -12.0);
        assert_eq!(rig.tick(), ModuleState::Run);
    }

    #[test]
    fn idle_module_switches_off_after_turnoff_wait() {
        let bus = VirtualBus::new();
        let mut rig = Rig::new(&bus, FIRST_LEVEL);
        rig.params.set(ParamId::IDLEWAIT, 0.0);
        rig.coordinator.config_mut().turnoff_wait_ticks = 3;
        rig.tick_until(ModuleState::Idle, 80);

        for _ in 0..3 {
            rig.tick();
            assert!(rig.io.output(DigitalPin::SelfEnable));
        }
        rig.tick();
        assert!(!rig.io.output(DigitalPin::SelfEnable));
    }

    #[test]
    fn reboot_holds_enable_low_then_boots() {
        let bus = VirtualBus::new();
        let mut rig = Rig::new(&bus, FIRST_LEVEL);
        rig.tick_until(ModuleState::Run, 80);

        rig.coordinator.request_reboot();
        assert_eq!(rig.tick(), ModuleState::Reboot);
        assert!(!rig.io.output(DigitalPin::NextEnable));
        for _ in 0..9 {
            assert_eq!(rig.tick(), ModuleState::Reboot);
        }
        assert_eq!(rig.tick(), ModuleState::Boot);
        assert_eq!(rig.coordinator.identity().node_id, 0);
        assert_eq!(rig.tick(), ModuleState::SetAddr);
    }
}
