//! Demo device content.
//!
//! Fluid: a pump fills itself on the async clock and feeds tanks through
//! pipes. Energy: solar panels generate on the sync clock and charge
//! adjacent batteries. Moss only reacts to random ticks.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use voxtile_engine::network::pool::Pool;
use voxtile_engine::network::{
    ConnectionType, EnergyHolder, EnergyStore, FluidContainer, FluidHolder, FluidType, NetworkBridge,
    NetworkEndPoint, NetworkManager, NetworkType,
};
use voxtile_engine::world::block::{Block, BlockState, BlockStateRegistry, SimpleBlock};
use voxtile_engine::world::compound::Compound;
use voxtile_engine::world::entity::NativeEntity;
use voxtile_engine::world::position::BlockPos;

use crate::metrics::Metrics;

pub const PUMP_CAPACITY: u64 = 1_000;
/// Fluid a pump draws per async tick.
pub const PUMP_OUTPUT: u64 = 250;
pub const PUMP_RATE: f64 = 4.0;
pub const TANK_CAPACITY: u64 = 16_000;
/// Fluid per network tick a pipe carries.
pub const PIPE_RATE: u64 = 100;
/// Energy a solar panel makes per sync tick.
pub const SOLAR_OUTPUT: u64 = 10;
pub const SOLAR_CAPACITY: u64 = 1_000;
pub const BATTERY_CAPACITY: u64 = 100_000;

/// Handles to every registered demo block.
pub struct Content {
    pub stone: BlockState,
    pub moss: BlockState,
    pub pump: BlockState,
    pub pipe: BlockState,
    pub tank: BlockState,
    pub solar_panel: BlockState,
    pub battery: BlockState,
    pub unknown: BlockState,
}

pub fn register(registry: &mut BlockStateRegistry, network: &Arc<NetworkManager>, metrics: &Arc<Metrics>) -> Content {
    let mut device = |id: &'static str, kind: DeviceKind| {
        registry.register(Arc::new(DeviceBlock {
            id,
            kind,
            network: Arc::clone(network),
        }))
    };
    let pump = device("voxtile:pump", DeviceKind::Pump);
    let pipe = device("voxtile:pipe", DeviceKind::Pipe);
    let tank = device("voxtile:tank", DeviceKind::Tank);
    let solar_panel = device("voxtile:solar_panel", DeviceKind::SolarPanel);
    let battery = device("voxtile:battery", DeviceKind::Battery);

    Content {
        stone: registry.register(Arc::new(SimpleBlock::new("voxtile:stone"))),
        moss: registry.register(Arc::new(MossBlock {
            metrics: Arc::clone(metrics),
        })),
        pump,
        pipe,
        tank,
        solar_panel,
        battery,
        unknown: registry.register(Arc::new(SimpleBlock::unknown("voxtile:unknown"))),
    }
}

// ── Blocks ──────────────────────────────────────────────────────────────────

struct MossBlock {
    metrics: Arc<Metrics>,
}

impl Block for MossBlock {
    fn id(&self) -> &str {
        "voxtile:moss"
    }

    fn handle_random_tick(&self, pos: BlockPos, _state: &BlockState) -> anyhow::Result<()> {
        self.metrics.record_random_tick();
        tracing::trace!("Moss at {:?} grew", pos);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceKind {
    Pump,
    Pipe,
    Tank,
    SolarPanel,
    Battery,
}

struct DeviceBlock {
    id: &'static str,
    kind: DeviceKind,
    network: Arc<NetworkManager>,
}

impl Block for DeviceBlock {
    fn id(&self) -> &str {
        self.id
    }

    fn create_tile_entity(
        &self,
        pos: BlockPos,
        state: &BlockState,
        data: Compound,
    ) -> Option<anyhow::Result<Arc<dyn NativeEntity>>> {
        let base = DeviceBase {
            pos,
            state: Mutex::new(state.clone()),
            network: Arc::clone(&self.network),
        };
        let entity: anyhow::Result<Arc<dyn NativeEntity>> = match self.kind {
            DeviceKind::Pump => FluidDevice::new(base, PUMP_CAPACITY, ConnectionType::Extract, PUMP_OUTPUT, &data)
                .map(|e| e as Arc<dyn NativeEntity>),
            DeviceKind::Tank => FluidDevice::new(base, TANK_CAPACITY, ConnectionType::Buffer, 0, &data)
                .map(|e| e as Arc<dyn NativeEntity>),
            DeviceKind::Pipe => Ok(Pipe::new(base)),
            DeviceKind::SolarPanel => Ok(EnergyDevice::new(base, SOLAR_CAPACITY, ConnectionType::Extract, &data)),
            DeviceKind::Battery => Ok(EnergyDevice::new(base, BATTERY_CAPACITY, ConnectionType::Buffer, &data)),
        };
        Some(entity)
    }

    fn sync_tick_rate(&self) -> u32 {
        match self.kind {
            DeviceKind::SolarPanel => 20,
            _ => 0,
        }
    }

    fn async_tick_rate(&self) -> f64 {
        match self.kind {
            DeviceKind::Pump => PUMP_RATE,
            _ => 0.0,
        }
    }
}

// ── Tile entities ───────────────────────────────────────────────────────────

struct DeviceBase {
    pos: BlockPos,
    state: Mutex<BlockState>,
    network: Arc<NetworkManager>,
}

impl DeviceBase {
    fn block_state(&self) -> BlockState {
        self.state.lock().clone()
    }

    fn set_block_state(&self, state: BlockState) {
        *self.state.lock() = state;
    }
}

/// Pump or tank.
pub struct FluidDevice {
    base: DeviceBase,
    container: Arc<FluidContainer>,
    holder: Arc<FluidHolder>,
    /// Water drawn per async tick.
    output: u64,
    this: Weak<FluidDevice>,
}

impl FluidDevice {
    fn new(
        base: DeviceBase,
        capacity: u64,
        connection: ConnectionType,
        output: u64,
        data: &Compound,
    ) -> anyhow::Result<Arc<Self>> {
        let container = Arc::new(FluidContainer::new(capacity));
        if let Some(name) = data.get_str("fluid") {
            let ty = FluidType::from_name(name).ok_or_else(|| anyhow::anyhow!("unknown fluid {name}"))?;
            let amount = data.get_i64("amount").unwrap_or(0).max(0) as u64;
            container.set(Some(ty), amount);
        }
        let holder = Arc::new(FluidHolder::uniform(&container, connection));
        Ok(Arc::new_cyclic(|this| Self {
            base,
            container,
            holder,
            output,
            this: this.clone(),
        }))
    }

    pub fn container(&self) -> &Arc<FluidContainer> {
        &self.container
    }
}

impl NativeEntity for FluidDevice {
    fn pos(&self) -> BlockPos {
        self.base.pos
    }

    fn block_state(&self) -> BlockState {
        self.base.block_state()
    }

    fn set_block_state(&self, state: BlockState) {
        self.base.set_block_state(state);
    }

    fn save_data(&self) -> Compound {
        let mut data = Compound::new();
        if let Some(ty) = self.container.fluid_type() {
            data.put_str("fluid", ty.name());
            data.put_i64("amount", self.container.amount() as i64);
        }
        data
    }

    fn handle_enable(&self) {
        if let Some(this) = self.this.upgrade() {
            self.base.network.handle_end_point_add(this);
        }
    }

    fn handle_disable(&self, unloading: bool) {
        self.base.network.handle_end_point_remove(self.base.pos, unloading);
    }

    fn handle_async_tick(&self) -> anyhow::Result<()> {
        if self.output > 0 {
            self.container.insert(FluidType::Water, self.output);
        }
        Ok(())
    }
}

impl NetworkEndPoint for FluidDevice {
    fn pos(&self) -> BlockPos {
        self.base.pos
    }

    fn fluid_holder(&self) -> Option<Arc<FluidHolder>> {
        Some(Arc::clone(&self.holder))
    }
}

/// Solar panel or battery.
pub struct EnergyDevice {
    base: DeviceBase,
    store: Arc<EnergyStore>,
    holder: Arc<EnergyHolder>,
    generates: bool,
    this: Weak<EnergyDevice>,
}

impl EnergyDevice {
    fn new(base: DeviceBase, capacity: u64, connection: ConnectionType, data: &Compound) -> Arc<Self> {
        let store = Arc::new(EnergyStore::new(capacity));
        store.set(data.get_i64("energy").unwrap_or(0).max(0) as u64);
        let holder = Arc::new(EnergyHolder::uniform(&store, connection));
        let generates = connection == ConnectionType::Extract;
        Arc::new_cyclic(|this| Self {
            base,
            store,
            holder,
            generates,
            this: this.clone(),
        })
    }

    pub fn store(&self) -> &Arc<EnergyStore> {
        &self.store
    }
}

impl NativeEntity for EnergyDevice {
    fn pos(&self) -> BlockPos {
        self.base.pos
    }

    fn block_state(&self) -> BlockState {
        self.base.block_state()
    }

    fn set_block_state(&self, state: BlockState) {
        self.base.set_block_state(state);
    }

    fn save_data(&self) -> Compound {
        let mut data = Compound::new();
        data.put_i64("energy", self.store.amount() as i64);
        data
    }

    fn handle_enable(&self) {
        if let Some(this) = self.this.upgrade() {
            self.base.network.handle_end_point_add(this);
        }
    }

    fn handle_disable(&self, unloading: bool) {
        self.base.network.handle_end_point_remove(self.base.pos, unloading);
    }

    fn handle_tick(&self) -> anyhow::Result<()> {
        if self.generates {
            self.store.insert((), SOLAR_OUTPUT);
        }
        Ok(())
    }
}

impl NetworkEndPoint for EnergyDevice {
    fn pos(&self) -> BlockPos {
        self.base.pos
    }

    fn energy_holder(&self) -> Option<Arc<EnergyHolder>> {
        Some(Arc::clone(&self.holder))
    }
}

/// Fluid bridge capping its network at [`PIPE_RATE`].
pub struct Pipe {
    base: DeviceBase,
    this: Weak<Pipe>,
}

impl Pipe {
    fn new(base: DeviceBase) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            base,
            this: this.clone(),
        })
    }
}

impl NativeEntity for Pipe {
    fn pos(&self) -> BlockPos {
        self.base.pos
    }

    fn block_state(&self) -> BlockState {
        self.base.block_state()
    }

    fn set_block_state(&self, state: BlockState) {
        self.base.set_block_state(state);
    }

    fn save_data(&self) -> Compound {
        Compound::new()
    }

    fn handle_enable(&self) {
        if let Some(this) = self.this.upgrade() {
            self.base.network.handle_bridge_add(this);
        }
    }

    fn handle_disable(&self, unloading: bool) {
        self.base.network.handle_bridge_remove(self.base.pos, unloading);
    }
}

impl NetworkBridge for Pipe {
    fn pos(&self) -> BlockPos {
        self.base.pos
    }

    fn supports(&self, ty: NetworkType) -> bool {
        ty == NetworkType::Fluid
    }

    fn transfer_rate(&self, _ty: NetworkType) -> u64 {
        PIPE_RATE
    }
}
