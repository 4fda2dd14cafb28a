//! Owner of every resource network.
//!
//! All structural changes (nodes joining or leaving, arbitrary queued
//! mutations) go through a FIFO queue and are applied at the start of the next
//! [`NetworkManager::tick`], on whatever thread drives it. Networks are only
//! ever touched from inside `tick`, so they never observe a half-applied
//! change.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::energy::EnergyNetwork;
use super::fluid::FluidNetwork;
use super::{Network, NetworkBridge, NetworkConfig, NetworkData, NetworkEndPoint, NetworkNode, NetworkType};
use crate::world::position::{BlockFace, BlockPos};

pub type NetworkMutation = Box<dyn FnOnce(&mut NetworkState) + Send>;

/// Node registry plus the networks built from it. Handed to queued
/// mutations.
pub struct NetworkState {
    config: NetworkConfig,
    nodes: HashMap<BlockPos, NetworkNode>,
    networks: Vec<Box<dyn Network>>,
    dirty: bool,
}

impl NetworkState {
    fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            nodes: HashMap::new(),
            networks: Vec::new(),
            dirty: false,
        }
    }

    /// Add or replace the node at its position.
    pub fn add_node(&mut self, node: NetworkNode) -> Option<NetworkNode> {
        self.dirty = true;
        self.nodes.insert(node.pos(), node)
    }

    pub fn remove_node(&mut self, pos: BlockPos) -> Option<NetworkNode> {
        let removed = self.nodes.remove(&pos);
        self.dirty |= removed.is_some();
        removed
    }

    pub fn node(&self, pos: BlockPos) -> Option<&NetworkNode> {
        self.nodes.get(&pos)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Force a rebuild on this tick, e.g. after a node changed its faces.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn networks(&self) -> &[Box<dyn Network>] {
        &self.networks
    }

    fn rebuild(&mut self) {
        self.networks.clear();
        for ty in NetworkType::ALL {
            for data in connected_components(&self.nodes, ty) {
                let network: Box<dyn Network> = match ty {
                    NetworkType::Fluid => Box::new(FluidNetwork::new(data, &self.config.fluid)),
                    NetworkType::Energy => Box::new(EnergyNetwork::new(data, &self.config.energy)),
                };
                self.networks.push(network);
            }
        }
        self.dirty = false;
        tracing::debug!(
            "Rebuilt {} networks from {} nodes",
            self.networks.len(),
            self.nodes.len()
        );
    }
}

/// Group nodes of `ty` into networks: two nodes are linked when they are
/// adjacent and both offer a `ty` connection on the shared face. Groups of a
/// single node are not networks.
fn connected_components(nodes: &HashMap<BlockPos, NetworkNode>, ty: NetworkType) -> Vec<NetworkData> {
    let mut visited: HashSet<BlockPos> = HashSet::new();
    let mut networks = Vec::new();

    let mut starts: Vec<BlockPos> = nodes.keys().copied().collect();
    starts.sort_unstable();

    for start in starts {
        if visited.contains(&start) {
            continue;
        }
        let links = |pos: BlockPos| -> Vec<(BlockFace, BlockPos)> {
            let node = &nodes[&pos];
            BlockFace::ALL
                .into_iter()
                .filter(|face| node.connects(ty, *face))
                .map(|face| (face, pos.advance(face)))
                .filter(|(face, neighbor)| {
                    nodes
                        .get(neighbor)
                        .is_some_and(|n| n.connects(ty, face.opposite()))
                })
                .collect()
        };

        if links(start).is_empty() {
            visited.insert(start);
            continue;
        }

        let mut data = NetworkData::new(ty);
        let mut queue = VecDeque::from([start]);
        visited.insert(start);
        while let Some(pos) = queue.pop_front() {
            let neighbors = links(pos);
            data.insert(nodes[&pos].clone(), neighbors.iter().map(|(face, _)| *face));
            for (_, neighbor) in neighbors {
                if visited.insert(neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }
        networks.push(data);
    }
    networks
}

struct Inner {
    queue: mpsc::UnboundedReceiver<NetworkMutation>,
    state: NetworkState,
    ticks: u64,
}

pub struct NetworkManager {
    sender: mpsc::UnboundedSender<NetworkMutation>,
    inner: Mutex<Inner>,
}

impl NetworkManager {
    pub fn new(config: NetworkConfig) -> Self {
        let (sender, queue) = mpsc::unbounded_channel();
        Self {
            sender,
            inner: Mutex::new(Inner {
                queue,
                state: NetworkState::new(config),
                ticks: 0,
            }),
        }
    }

    /// Run `mutation` with exclusive access to the network state at the start
    /// of the next tick. Mutations run in the order they were queued.
    pub fn queue_write(&self, mutation: impl FnOnce(&mut NetworkState) + Send + 'static) {
        // The receiver lives as long as `self`.
        let _ = self.sender.send(Box::new(mutation));
    }

    pub fn handle_end_point_add(&self, endpoint: Arc<dyn NetworkEndPoint>) {
        self.queue_write(move |state| {
            state.add_node(NetworkNode::EndPoint(endpoint));
        });
    }

    /// `unloading` is set when the endpoint goes away with its chunk rather
    /// than being broken.
    pub fn handle_end_point_remove(&self, pos: BlockPos, unloading: bool) {
        self.queue_write(move |state| {
            if state.remove_node(pos).is_some() {
                tracing::debug!("Removed end point at {:?} (unloading: {})", pos, unloading);
            }
        });
    }

    pub fn handle_bridge_add(&self, bridge: Arc<dyn NetworkBridge>) {
        self.queue_write(move |state| {
            state.add_node(NetworkNode::Bridge(bridge));
        });
    }

    pub fn handle_bridge_remove(&self, pos: BlockPos, unloading: bool) {
        self.queue_write(move |state| {
            if state.remove_node(pos).is_some() {
                tracing::debug!("Removed bridge at {:?} (unloading: {})", pos, unloading);
            }
        });
    }

    /// Apply queued mutations, rebuild networks if the graph changed, then
    /// tick every network that is due.
    pub fn tick(&self) {
        let mut inner = self.inner.lock();
        let Inner { queue, state, ticks } = &mut *inner;

        while let Ok(mutation) = queue.try_recv() {
            mutation(state);
        }
        if state.dirty {
            state.rebuild();
        }

        *ticks += 1;
        for network in &mut state.networks {
            if *ticks % network.tick_delay() as u64 == 0 {
                network.handle_tick();
            }
        }
    }

    pub fn network_count(&self) -> usize {
        self.inner.lock().state.networks.len()
    }

    /// Types of the networks containing `pos`.
    pub fn networks_at(&self, pos: BlockPos) -> Vec<NetworkType> {
        self.inner
            .lock()
            .state
            .networks
            .iter()
            .filter(|n| n.data().contains(pos))
            .map(|n| n.network_type())
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().state.node_count()
    }
}

impl Default for NetworkManager {
    fn default() -> Self {
        Self::new(NetworkConfig::default())
    }
}
