//! Graph-based resource distribution between devices.
//!
//! Devices join as [`NetworkNode`]s: endpoints hold a resource, bridges carry
//! it and cap the throughput. The [`NetworkManager`] groups connected nodes
//! into one [`ResourceNetwork`] per resource type and ticks them.

pub mod energy;
pub mod fluid;
pub mod manager;
pub mod pool;
pub mod resource;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Deserialize;

use crate::world::position::{BlockFace, BlockPos};

pub use energy::{EnergyHolder, EnergyNetwork, EnergyStore};
pub use fluid::{FluidContainer, FluidHolder, FluidNetwork, FluidType};
pub use manager::{NetworkManager, NetworkState};
pub use pool::{Holder, Pool};
pub use resource::{Channel, Distributor, NetworkKind, ResourceNetwork};

/// Index of a channel inside a network, `0..channel_amount`.
pub type ChannelId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkType {
    Fluid,
    Energy,
}

impl NetworkType {
    pub const ALL: [NetworkType; 2] = [NetworkType::Fluid, NetworkType::Energy];
}

/// How a holder face takes part in transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionType {
    #[default]
    None,
    Insert,
    Extract,
    /// Both directions, but never to or from another buffer.
    Buffer,
}

impl ConnectionType {
    pub fn can_insert(self) -> bool {
        matches!(self, ConnectionType::Insert | ConnectionType::Buffer)
    }

    pub fn can_extract(self) -> bool {
        matches!(self, ConnectionType::Extract | ConnectionType::Buffer)
    }
}

/// A terminal device that produces, consumes or stores resources.
pub trait NetworkEndPoint: Send + Sync {
    fn pos(&self) -> BlockPos;

    fn fluid_holder(&self) -> Option<Arc<FluidHolder>> {
        None
    }

    fn energy_holder(&self) -> Option<Arc<EnergyHolder>> {
        None
    }
}

/// A pass-through node that caps the whole network's transfer rate.
pub trait NetworkBridge: Send + Sync {
    fn pos(&self) -> BlockPos;

    fn supports(&self, ty: NetworkType) -> bool;

    /// Amount per network tick this bridge can carry.
    fn transfer_rate(&self, ty: NetworkType) -> u64;

    fn connects(&self, _ty: NetworkType, _face: BlockFace) -> bool {
        true
    }
}

#[derive(Clone)]
pub enum NetworkNode {
    EndPoint(Arc<dyn NetworkEndPoint>),
    Bridge(Arc<dyn NetworkBridge>),
}

impl NetworkNode {
    pub fn pos(&self) -> BlockPos {
        match self {
            NetworkNode::EndPoint(e) => e.pos(),
            NetworkNode::Bridge(b) => b.pos(),
        }
    }

    /// Whether this node offers a `ty` connection on `face`.
    pub fn connects(&self, ty: NetworkType, face: BlockFace) -> bool {
        match self {
            NetworkNode::EndPoint(e) => match ty {
                NetworkType::Fluid => e
                    .fluid_holder()
                    .is_some_and(|h| h.connection(face) != ConnectionType::None),
                NetworkType::Energy => e
                    .energy_holder()
                    .is_some_and(|h| h.connection(face) != ConnectionType::None),
            },
            NetworkNode::Bridge(b) => b.supports(ty) && b.connects(ty, face),
        }
    }
}

impl std::fmt::Debug for NetworkNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkNode::EndPoint(e) => write!(f, "EndPoint({:?})", e.pos()),
            NetworkNode::Bridge(b) => write!(f, "Bridge({:?})", b.pos()),
        }
    }
}

/// The nodes of one network with the faces through which each is connected.
pub struct NetworkData {
    pub ty: NetworkType,
    pub nodes: HashMap<BlockPos, (NetworkNode, HashSet<BlockFace>)>,
}

impl NetworkData {
    pub fn new(ty: NetworkType) -> Self {
        Self {
            ty,
            nodes: HashMap::new(),
        }
    }

    pub fn insert(&mut self, node: NetworkNode, faces: impl IntoIterator<Item = BlockFace>) {
        self.nodes.insert(node.pos(), (node, faces.into_iter().collect()));
    }

    pub fn contains(&self, pos: BlockPos) -> bool {
        self.nodes.contains_key(&pos)
    }
}

/// A ticked network, type-erased for the manager.
pub trait Network: Send {
    fn network_type(&self) -> NetworkType;

    /// Network ticks happen every `tick_delay` manager ticks.
    fn tick_delay(&self) -> u32;

    fn data(&self) -> &NetworkData;

    fn handle_tick(&mut self);
}

/// Per-type settings, the `[network.fluid]` / `[network.energy]` tables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkTypeConfig {
    pub tick_delay: u32,
    /// Amount per second when no bridge is slower. Negative is unbounded.
    pub default_transfer_rate: f64,
    pub channel_amount: usize,
}

impl NetworkTypeConfig {
    /// Default amount per network tick.
    pub fn effective_rate(&self) -> u64 {
        let rate = (self.default_transfer_rate * self.tick_delay as f64).round();
        if rate < 0.0 { u64::MAX } else { rate as u64 }
    }
}

impl Default for NetworkTypeConfig {
    fn default() -> Self {
        Self {
            tick_delay: 1,
            default_transfer_rate: 20_000.0,
            channel_amount: 4,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub fluid: NetworkTypeConfig,
    pub energy: NetworkTypeConfig,
}

impl NetworkConfig {
    pub fn get(&self, ty: NetworkType) -> &NetworkTypeConfig {
        match ty {
            NetworkType::Fluid => &self.fluid,
            NetworkType::Energy => &self.energy,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            fluid: NetworkTypeConfig::default(),
            energy: NetworkTypeConfig {
                default_transfer_rate: -1.0,
                ..NetworkTypeConfig::default()
            },
        }
    }
}
