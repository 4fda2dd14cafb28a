use std::sync::Arc;

use super::{ChannelId, Network, NetworkData, NetworkEndPoint, NetworkNode, NetworkType, NetworkTypeConfig};
use crate::world::position::BlockFace;

/// Splits a channel's flow among its holders. Accepts a budget and returns
/// the part it did not use.
pub trait Distributor: Send {
    fn distribute(&mut self, budget: u64) -> u64;
}

/// The resource-specific half of a [`ResourceNetwork`].
pub trait NetworkKind: Send + 'static {
    const TYPE: NetworkType;

    type Holder: Send + Sync + 'static;

    fn holder(endpoint: &dyn NetworkEndPoint) -> Option<Arc<Self::Holder>>;

    /// Connected faces of `holder` and the channel each is assigned to.
    fn channels(holder: &Self::Holder) -> Vec<(BlockFace, ChannelId)>;

    fn distributor(members: &[(Arc<Self::Holder>, BlockFace)]) -> Box<dyn Distributor>;
}

/// One partition of a network's endpoints with its own distributor.
pub struct Channel<K: NetworkKind> {
    members: Vec<(Arc<K::Holder>, BlockFace)>,
    distributor: Option<Box<dyn Distributor>>,
}

impl<K: NetworkKind> Channel<K> {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            distributor: None,
        }
    }

    pub fn add_holder(&mut self, holder: Arc<K::Holder>, face: BlockFace) {
        self.members.push((holder, face));
    }

    /// Build the distributor from the members added so far.
    pub fn create_distributor(&mut self) {
        self.distributor = Some(K::distributor(&self.members));
    }

    pub fn distribute(&mut self, budget: u64) -> u64 {
        match &mut self.distributor {
            Some(distributor) => distributor.distribute(budget),
            None => budget,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// A connected group of nodes distributing one resource type.
///
/// Each tick the transfer budget is fed to the channels starting at a
/// persistent cursor; whatever a channel leaves over goes to the next one,
/// until the budget is spent or every channel was visited once. The cursor
/// keeps advancing across ticks, so a channel starved in one tick is served
/// earlier in the next.
pub struct ResourceNetwork<K: NetworkKind> {
    data: NetworkData,
    channels: Vec<Option<Channel<K>>>,
    transfer_rate: u64,
    tick_delay: u32,
    next_channel: usize,
}

impl<K: NetworkKind> ResourceNetwork<K> {
    pub fn new(data: NetworkData, config: &NetworkTypeConfig) -> Self {
        let mut channels: Vec<Option<Channel<K>>> = (0..config.channel_amount).map(|_| None).collect();
        let mut transfer_rate = config.effective_rate();

        for (node, faces) in data.nodes.values() {
            match node {
                NetworkNode::EndPoint(endpoint) => {
                    let Some(holder) = K::holder(endpoint.as_ref()) else {
                        continue;
                    };
                    for (face, channel_id) in K::channels(&holder) {
                        if !faces.contains(&face) {
                            continue;
                        }
                        let Some(slot) = channels.get_mut(channel_id) else {
                            tracing::warn!(
                                "Ignoring {:?} channel {} of {:?}, network has {} channels",
                                K::TYPE,
                                channel_id,
                                endpoint.pos(),
                                config.channel_amount
                            );
                            continue;
                        };
                        slot.get_or_insert_with(Channel::new)
                            .add_holder(Arc::clone(&holder), face);
                    }
                }
                NetworkNode::Bridge(bridge) => {
                    transfer_rate = transfer_rate.min(bridge.transfer_rate(K::TYPE));
                }
            }
        }

        for channel in channels.iter_mut().flatten() {
            channel.create_distributor();
        }

        Self {
            data,
            channels,
            transfer_rate,
            tick_delay: config.tick_delay.max(1),
            next_channel: 0,
        }
    }

    pub fn transfer_rate(&self) -> u64 {
        self.transfer_rate
    }

    /// The channel the next tick starts at.
    pub fn next_channel(&self) -> usize {
        self.next_channel
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel<K>> {
        self.channels.get(id).and_then(Option::as_ref)
    }

    pub fn handle_tick(&mut self) {
        if self.channels.is_empty() {
            return;
        }

        let start = self.next_channel;
        let mut left = self.transfer_rate;
        loop {
            if let Some(channel) = &mut self.channels[self.next_channel] {
                left = channel.distribute(left);
            }
            self.next_channel = (self.next_channel + 1) % self.channels.len();
            if left == 0 || self.next_channel == start {
                break;
            }
        }
    }
}

impl<K: NetworkKind> Network for ResourceNetwork<K> {
    fn network_type(&self) -> NetworkType {
        K::TYPE
    }

    fn tick_delay(&self) -> u32 {
        self.tick_delay
    }

    fn data(&self) -> &NetworkData {
        &self.data
    }

    fn handle_tick(&mut self) {
        ResourceNetwork::handle_tick(self);
    }
}
