//! # Configuration Tree
//!
//! The device model the polling runtime works on:
//!
//! ```text
//! Directory ─┬─ Directory ── Connection ─┬─ Channel
//!            │                            └─ Directory ── Channel
//!            └─ Connection ── Channel
//! ```
//!
//! A [`ConfigTree`] is assembled by a loader (programmatically, or from a
//! [`TreeDescriptor`]) and then frozen by [`ModbusConfig::build`], which
//! validates every channel, attaches each channel to its nearest connection
//! and indexes channels by region and by name.

pub mod channel;
pub mod connection;
pub mod descriptor;
pub mod region;
pub mod tree;

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;

use crate::error::{ModbusError, ModbusResult};

pub use channel::{Channel, WriteListener, NO_DIAPASON, VIRTUAL_ADDRESS};
pub use connection::{Connection, ExhaustionPolicy};
pub use descriptor::{ChannelDescriptor, ConnectionDescriptor, DirectoryDescriptor, NodeDescriptor, TreeDescriptor};
pub use region::Region;
pub use tree::{ConfigTree, Node, NodeId, NodeKind};

/// Callback receiving each batch of freshly read channels
pub type ReadChannels = Arc<dyn Fn(&[Arc<Channel>]) + Send + Sync>;

/// Placeholder in channel names substituted by the configured user id
const USER_VARIABLE: &str = "${user}";

/// A validated, indexed configuration tree
pub struct ModbusConfig {
    tree: ConfigTree,
    connections: Vec<Arc<Connection>>,
    channels: Vec<Arc<Channel>>,
    /// channel name -> (index in `channels`, index in `connections`)
    channel_index: HashMap<String, (usize, usize)>,
    user_id: Option<String>,
    read_channels: RwLock<Option<ReadChannels>>,
}

impl ModbusConfig {
    /// Validate and index a tree
    ///
    /// Channels outside any connection are skipped with a warning. Any
    /// inconsistent channel or connection fails the whole build.
    pub fn build(mut tree: ConfigTree) -> ModbusResult<Self> {
        let mut channels = Vec::new();
        let mut channel_index = HashMap::new();
        let mut by_connection: HashMap<NodeId, Vec<Arc<Channel>>> = HashMap::new();

        for (channel_id, connection_id) in tree.channel_nodes() {
            let channel = match tree.node(channel_id).and_then(Node::as_channel) {
                Some(channel) => channel.clone(),
                None => continue,
            };
            let connection_id = match connection_id {
                Some(id) => id,
                None => {
                    warn!("Channel {} has no connection, skipped", tree.path(channel_id));
                    continue;
                }
            };
            validate_channel(&channel)?;
            if channel_index.contains_key(&channel.name) {
                return Err(ModbusError::configuration(format!(
                    "Duplicate channel name '{}'",
                    channel.name
                )));
            }
            channel_index.insert(channel.name.clone(), (channels.len(), usize::MAX));
            channels.push(channel.clone());
            by_connection.entry(connection_id).or_default().push(channel);
        }

        let connection_ids: Vec<NodeId> = tree
            .traverse()
            .into_iter()
            .filter(|id| tree.node(*id).and_then(Node::as_connection).is_some())
            .collect();

        let mut connections = Vec::with_capacity(connection_ids.len());
        for id in connection_ids {
            let node = tree
                .node_mut(id)
                .ok_or_else(|| ModbusError::internal("connection node vanished"))?;
            if let NodeKind::Connection(connection) = &mut node.kind {
                validate_connection(connection)?;
                let connection_mut = Arc::make_mut(connection);
                for channel in by_connection.remove(&id).unwrap_or_default() {
                    if let Some(entry) = channel_index.get_mut(&channel.name) {
                        entry.1 = connections.len();
                    }
                    connection_mut.add_channel(channel);
                }
                connection_mut.sort_channels();
                debug!(
                    "Connection {} ({}) with {} channels",
                    connection.name,
                    connection.endpoint(),
                    connection.channel_count()
                );
                connections.push(connection.clone());
            }
        }

        Ok(Self {
            tree,
            connections,
            channels,
            channel_index,
            user_id: None,
            read_channels: RwLock::new(None),
        })
    }

    pub fn tree(&self) -> &ConfigTree {
        &self.tree
    }

    pub fn connections(&self) -> &[Arc<Connection>] {
        &self.connections
    }

    /// Channels attached to a connection, in tree order
    pub fn channels(&self) -> &[Arc<Channel>] {
        &self.channels
    }

    /// Id substituted for `${user}` in channel lookups
    pub fn set_user_id(&mut self, user_id: impl Into<String>) {
        self.user_id = Some(user_id.into());
    }

    fn resolve_name(&self, name: &str) -> String {
        match &self.user_id {
            Some(user) => name.replace(USER_VARIABLE, user),
            None => name.to_string(),
        }
    }

    pub fn find_channel(&self, name: &str) -> Option<&Arc<Channel>> {
        let resolved = self.resolve_name(name);
        self.channel_index
            .get(&resolved)
            .and_then(|(index, _)| self.channels.get(*index))
    }

    /// The connection a channel is read through
    pub fn connection_of(&self, channel: &Channel) -> Option<&Arc<Connection>> {
        self.channel_index
            .get(&channel.name)
            .and_then(|(_, index)| self.connections.get(*index))
    }

    pub fn set_read_channels(&self, callback: ReadChannels) {
        *self.read_channels.write() = Some(callback);
    }

    pub fn read_channels(&self) -> Option<ReadChannels> {
        self.read_channels.read().clone()
    }

    /// Deliver a batch of channels to the read callback, then mark them valid
    pub(crate) fn notify_read_channels(&self, channels: &[Arc<Channel>]) {
        if channels.is_empty() {
            return;
        }
        if let Some(callback) = self.read_channels() {
            callback(channels);
        }
        for channel in channels {
            channel.mark_read_valid(true);
        }
    }

    /// Inject engineering values given as `name=value,name=value`
    ///
    /// Unknown channels are ignored. The applied channels are delivered to the
    /// read callback as one batch and returned.
    pub fn apply_channel_values(&self, text: &str) -> ModbusResult<Vec<Arc<Channel>>> {
        let mut applied = Vec::new();
        for token in text.split(',') {
            if token.trim().is_empty() {
                continue;
            }
            let (name, value) = token
                .split_once('=')
                .ok_or_else(|| ModbusError::invalid_data(format!("Expected name=value, got '{}'", token)))?;
            let value: f64 = value
                .trim()
                .parse()
                .map_err(|_| ModbusError::invalid_data(format!("Invalid value in '{}'", token)))?;
            if let Some(channel) = self.find_channel(name.trim()) {
                channel.set_read_value(value);
                applied.push(channel.clone());
            }
        }
        self.notify_read_channels(&applied);
        Ok(applied)
    }
}

impl std::fmt::Debug for ModbusConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusConfig")
            .field("connections", &self.connections.len())
            .field("channels", &self.channels.len())
            .finish()
    }
}

fn validate_connection(connection: &Connection) -> ModbusResult<()> {
    if connection.ip.trim().is_empty() {
        return Err(ModbusError::configuration(format!(
            "Connection '{}' has no ip",
            connection.name
        )));
    }
    if connection.port == 0 {
        return Err(ModbusError::configuration(format!(
            "Connection '{}' has port 0",
            connection.name
        )));
    }
    if connection.response_timeout == 0 {
        return Err(ModbusError::configuration(format!(
            "Connection '{}' has a zero response timeout",
            connection.name
        )));
    }
    Ok(())
}

fn validate_channel(channel: &Channel) -> ModbusResult<()> {
    if channel.name.is_empty() {
        return Err(ModbusError::configuration("Channel without a name"));
    }
    if !channel.update_interval.is_finite() || channel.update_interval < 0.0 {
        return Err(ModbusError::configuration(format!(
            "Channel '{}' has an invalid update interval {}",
            channel.name, channel.update_interval
        )));
    }
    if channel.has_diapason() && channel.diapason <= 0 {
        return Err(ModbusError::configuration(format!(
            "Channel '{}' has an invalid diapason {}",
            channel.name, channel.diapason
        )));
    }
    if channel.is_virtual() {
        return Ok(());
    }

    let count = channel.register_count();
    if channel.address < 0 || channel.finish_address() > u16::MAX as i32 {
        return Err(ModbusError::invalid_address(channel.start_address(), count));
    }
    if count > channel.region.max_read_count() as i32 {
        return Err(ModbusError::configuration(format!(
            "Channel '{}' spans {} items, more than one {} read allows",
            channel.name, count, channel.region
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_type::DataType;
    use parking_lot::Mutex;

    fn sample_tree() -> ConfigTree {
        let mut tree = ConfigTree::new("plant");
        let plc = tree
            .add_connection(tree.root(), Connection::new("plc", "127.0.0.1", 5020))
            .unwrap();
        let pumps = tree.add_directory(plc, "pumps").unwrap();
        tree.add_channel(pumps, Channel::new("b", Region::Holdings, DataType::UInt16).with_address(4))
            .unwrap();
        tree.add_channel(plc, Channel::new("a", Region::Holdings, DataType::Float32).with_address(0))
            .unwrap();
        tree.add_channel(plc, Channel::new("v_7", Region::Holdings, DataType::Float32))
            .unwrap();
        tree.add_channel(tree.root(), Channel::new("loose", Region::Holdings, DataType::UInt16))
            .unwrap();
        tree
    }

    #[test]
    fn test_build_indexes_channels() {
        let mut config = ModbusConfig::build(sample_tree()).unwrap();
        assert_eq!(config.connections().len(), 1);
        assert_eq!(config.channels().len(), 3);

        let connection = &config.connections()[0];
        assert_eq!(connection.channel_count(), 3);
        let addresses: Vec<i16> = connection
            .channels_in(Region::Holdings)
            .iter()
            .map(|c| c.address)
            .collect();
        assert_eq!(addresses, vec![-1, 0, 4]);

        let b = config.find_channel("b").unwrap().clone();
        assert_eq!(config.connection_of(&b).unwrap().name, "plc");
        assert!(config.find_channel("loose").is_none());

        assert!(config.find_channel("v_${user}").is_none());
        config.set_user_id("7");
        assert!(config.find_channel("v_${user}").is_some());
    }

    #[test]
    fn test_build_rejects_inconsistent_channels() {
        let mut tree = ConfigTree::new("plant");
        let plc = tree
            .add_connection(tree.root(), Connection::new("plc", "127.0.0.1", 502))
            .unwrap();
        tree.add_channel(plc, Channel::new("x", Region::Holdings, DataType::UInt16).with_address(1).with_diapason(0))
            .unwrap();
        assert!(matches!(ModbusConfig::build(tree), Err(ModbusError::Configuration { .. })));

        let mut tree = ConfigTree::new("plant");
        let plc = tree
            .add_connection(tree.root(), Connection::new("plc", "127.0.0.1", 502))
            .unwrap();
        tree.add_channel(plc, Channel::new("x", Region::Holdings, DataType::UInt16).with_address(1))
            .unwrap();
        tree.add_channel(plc, Channel::new("x", Region::Inputs, DataType::UInt16).with_address(2))
            .unwrap();
        assert!(ModbusConfig::build(tree).is_err());

        let mut tree = ConfigTree::new("plant");
        let plc = tree
            .add_connection(tree.root(), Connection::new("plc", "127.0.0.1", 502))
            .unwrap();
        tree.add_channel(plc, Channel::new("x", Region::Holdings, DataType::UInt16).with_address(-5))
            .unwrap();
        assert!(matches!(ModbusConfig::build(tree), Err(ModbusError::InvalidAddress { .. })));
    }

    #[test]
    fn test_apply_channel_values() {
        let config = ModbusConfig::build(sample_tree()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        config.set_read_channels(Arc::new(move |channels: &[Arc<Channel>]| {
            sink.lock().extend(channels.iter().map(|c| c.name.clone()));
        }));

        let applied = config.apply_channel_values("a=1.5, missing=3,b=2,").unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(config.find_channel("a").unwrap().read_value(), 1.5);
        assert!(config.find_channel("b").unwrap().is_read_value_valid());
        assert_eq!(seen.lock().as_slice(), ["a", "b"]);

        assert!(config.apply_channel_values("a=oops").is_err());
    }
}
