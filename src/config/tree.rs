//! Arena of configuration nodes
//!
//! Nodes are addressed by [`NodeId`]. A child knows its parent only by id, so
//! the tree has a single owner (the arena) and no reference cycles.

use std::sync::Arc;

use super::{Channel, Connection};
use crate::error::{ModbusError, ModbusResult};

/// Handle of a node inside one [`ConfigTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Directory,
    Connection(Arc<Connection>),
    Channel(Arc<Channel>),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
}

impl Node {
    pub fn as_connection(&self) -> Option<&Arc<Connection>> {
        match &self.kind {
            NodeKind::Connection(connection) => Some(connection),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&Arc<Channel>> {
        match &self.kind {
            NodeKind::Channel(channel) => Some(channel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigTree {
    nodes: Vec<Node>,
}

impl ConfigTree {
    /// Create a tree holding only a root directory
    pub fn new(root_name: impl Into<String>) -> Self {
        Self {
            nodes: vec![Node {
                id: NodeId(0),
                name: root_name.into(),
                parent: None,
                children: Vec::new(),
                kind: NodeKind::Directory,
            }],
        }
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id.0)
    }

    fn insert(&mut self, parent: NodeId, name: String, kind: NodeKind) -> ModbusResult<NodeId> {
        let id = NodeId(self.nodes.len());
        let parent_node = self
            .nodes
            .get_mut(parent.0)
            .ok_or_else(|| ModbusError::configuration(format!("Unknown parent node {}", parent.0)))?;
        if matches!(parent_node.kind, NodeKind::Channel(_)) {
            return Err(ModbusError::configuration(format!(
                "Channel '{}' cannot have children",
                parent_node.name
            )));
        }
        parent_node.children.push(id);
        self.nodes.push(Node {
            id,
            name,
            parent: Some(parent),
            children: Vec::new(),
            kind,
        });
        Ok(id)
    }

    pub fn add_directory(&mut self, parent: NodeId, name: impl Into<String>) -> ModbusResult<NodeId> {
        self.insert(parent, name.into(), NodeKind::Directory)
    }

    pub fn add_connection(&mut self, parent: NodeId, connection: Connection) -> ModbusResult<NodeId> {
        let name = connection.name.clone();
        self.insert(parent, name, NodeKind::Connection(Arc::new(connection)))
    }

    pub fn add_channel(&mut self, parent: NodeId, channel: Channel) -> ModbusResult<NodeId> {
        let name = channel.name.clone();
        self.insert(parent, name, NodeKind::Channel(Arc::new(channel)))
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|node| node.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|node| node.children.as_slice()).unwrap_or(&[])
    }

    /// Ids from the root down to `id`
    pub fn ancestry(&self, id: NodeId) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut current = self.node(id).map(|node| node.id);
        while let Some(node_id) = current {
            chain.push(node_id);
            current = self.parent(node_id);
        }
        chain.reverse();
        chain
    }

    /// Slash separated names from the root to `id`
    pub fn path(&self, id: NodeId) -> String {
        self.ancestry(id)
            .into_iter()
            .filter_map(|node_id| self.node(node_id))
            .map(|node| node.name.as_str())
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Nearest `Connection` ancestor of a node
    pub fn connection_of(&self, id: NodeId) -> Option<NodeId> {
        let mut current = self.parent(id);
        while let Some(node_id) = current {
            let node = self.node(node_id)?;
            if node.as_connection().is_some() {
                return Some(node_id);
            }
            current = node.parent;
        }
        None
    }

    /// Depth-first pre-order walk from the root
    pub fn traverse(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.children(id).iter().rev().copied());
        }
        order
    }

    /// Every channel node paired with its nearest connection, in tree order
    pub fn channel_nodes(&self) -> Vec<(NodeId, Option<NodeId>)> {
        self.traverse()
            .into_iter()
            .filter(|id| self.node(*id).and_then(Node::as_channel).is_some())
            .map(|id| (id, self.connection_of(id)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Region;
    use crate::data_type::DataType;

    #[test]
    fn test_paths_and_connection_lookup() {
        let mut tree = ConfigTree::new("plant");
        let hall = tree.add_directory(tree.root(), "hall").unwrap();
        let plc = tree.add_connection(hall, Connection::new("plc", "10.0.0.2", 502)).unwrap();
        let group = tree.add_directory(plc, "pumps").unwrap();
        let pump = tree
            .add_channel(group, Channel::new("pump1", Region::Coils, DataType::UInt16).with_address(0))
            .unwrap();
        let orphan = tree
            .add_channel(hall, Channel::new("note", Region::Holdings, DataType::UInt16))
            .unwrap();

        assert_eq!(tree.path(pump), "plant/hall/plc/pumps/pump1");
        assert_eq!(tree.connection_of(pump), Some(plc));
        assert_eq!(tree.connection_of(orphan), None);
        assert_eq!(tree.traverse(), vec![tree.root(), hall, plc, group, pump, orphan]);
        assert_eq!(tree.channel_nodes(), vec![(pump, Some(plc)), (orphan, None)]);
    }

    #[test]
    fn test_channels_are_leaves() {
        let mut tree = ConfigTree::new("root");
        let channel = tree
            .add_channel(tree.root(), Channel::new("a", Region::Holdings, DataType::UInt16))
            .unwrap();
        assert!(tree.add_directory(channel, "nested").is_err());
    }
}
