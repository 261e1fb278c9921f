//! Serde descriptors for building a configuration tree from JSON or YAML
//!
//! ```yaml
//! name: plant
//! children:
//!   - kind: connection
//!     name: boiler
//!     ip: 192.168.1.10
//!     port: 502
//!     children:
//!       - kind: channel
//!         name: temperature
//!         address: 0
//!         region: Inputs
//!         type: Int16
//!         read_formula: "${value} / 10"
//!         fraction_size: 1
//! ```

use serde::{Deserialize, Serialize};

use super::{Channel, ConfigTree, Connection, ExhaustionPolicy, ModbusConfig, NodeId, Region, NO_DIAPASON, VIRTUAL_ADDRESS};
use crate::data_type::DataType;
use crate::error::ModbusResult;
use crate::formula::Formula;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeDescriptor {
    pub name: String,
    #[serde(default)]
    pub children: Vec<NodeDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeDescriptor {
    Directory(DirectoryDescriptor),
    Connection(ConnectionDescriptor),
    Channel(ChannelDescriptor),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryDescriptor {
    pub name: String,
    #[serde(default)]
    pub children: Vec<NodeDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub name: String,
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_response_timeout")]
    pub response_timeout: u64,
    #[serde(default = "default_retries_count")]
    pub retries_count: u32,
    #[serde(default = "default_retry_timeout")]
    pub retry_timeout: u64,
    #[serde(default)]
    pub batch_register_limit: u16,
    #[serde(default)]
    pub exhaustion_policy: ExhaustionPolicy,
    #[serde(default)]
    pub children: Vec<NodeDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub name: String,
    /// Absent for virtual channels
    #[serde(default)]
    pub address: Option<i16>,
    #[serde(default)]
    pub diapason: Option<i16>,
    #[serde(default = "default_region")]
    pub region: Region,
    #[serde(rename = "type", default = "default_data_type")]
    pub data_type: DataType,
    #[serde(default = "default_update_interval")]
    pub update_interval: f32,
    #[serde(default)]
    pub fraction_size: u32,
    #[serde(default)]
    pub read_formula: Option<Formula>,
    #[serde(default)]
    pub write_formula: Option<Formula>,
    #[serde(default)]
    pub danger_formula: Option<Formula>,
    #[serde(default)]
    pub danger_sound: Option<String>,
    #[serde(default)]
    pub check_danger_period: f64,
    #[serde(default)]
    pub journal_delta: f64,
    #[serde(default)]
    pub journal_timeout: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_port() -> u16 {
    crate::DEFAULT_TCP_PORT
}

fn default_response_timeout() -> u64 {
    crate::DEFAULT_TIMEOUT_MS
}

fn default_retries_count() -> u32 {
    3
}

fn default_retry_timeout() -> u64 {
    1000
}

fn default_region() -> Region {
    Region::Holdings
}

fn default_data_type() -> DataType {
    DataType::UInt16
}

fn default_update_interval() -> f32 {
    1000.0
}

fn default_enabled() -> bool {
    true
}

impl TreeDescriptor {
    pub fn from_json_str(text: &str) -> ModbusResult<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_yaml_str(text: &str) -> ModbusResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Assemble the arena tree
    pub fn to_tree(&self) -> ModbusResult<ConfigTree> {
        let mut tree = ConfigTree::new(self.name.clone());
        let root = tree.root();
        for child in &self.children {
            child.append_to(&mut tree, root)?;
        }
        Ok(tree)
    }

    /// Assemble and build in one step
    pub fn build(&self) -> ModbusResult<ModbusConfig> {
        ModbusConfig::build(self.to_tree()?)
    }
}

impl NodeDescriptor {
    fn append_to(&self, tree: &mut ConfigTree, parent: NodeId) -> ModbusResult<()> {
        let (id, children) = match self {
            NodeDescriptor::Directory(directory) => {
                (tree.add_directory(parent, directory.name.clone())?, directory.children.as_slice())
            }
            NodeDescriptor::Connection(connection) => {
                (tree.add_connection(parent, connection.to_connection())?, connection.children.as_slice())
            }
            NodeDescriptor::Channel(channel) => {
                tree.add_channel(parent, channel.to_channel())?;
                return Ok(());
            }
        };
        for child in children {
            child.append_to(tree, id)?;
        }
        Ok(())
    }
}

impl ConnectionDescriptor {
    pub fn to_connection(&self) -> Connection {
        Connection::new(self.name.clone(), self.ip.clone(), self.port)
            .with_response_timeout(self.response_timeout)
            .with_retries(self.retries_count, self.retry_timeout)
            .with_batch_register_limit(self.batch_register_limit)
            .with_exhaustion_policy(self.exhaustion_policy)
    }
}

impl ChannelDescriptor {
    pub fn to_channel(&self) -> Channel {
        let mut channel = Channel::new(self.name.clone(), self.region, self.data_type)
            .with_address(self.address.unwrap_or(VIRTUAL_ADDRESS))
            .with_diapason(self.diapason.unwrap_or(NO_DIAPASON))
            .with_update_interval(self.update_interval)
            .with_fraction_size(self.fraction_size)
            .with_journal(self.journal_delta, self.journal_timeout)
            .with_enabled(self.enabled);
        channel.read_formula = self.read_formula.clone();
        channel.write_formula = self.write_formula.clone();
        channel.danger_formula = self.danger_formula.clone();
        channel.danger_sound = self.danger_sound.clone();
        channel.check_danger_period = self.check_danger_period;
        channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
name: plant
children:
  - kind: directory
    name: hall
    children:
      - kind: connection
        name: boiler
        ip: 127.0.0.1
        port: 5020
        retries_count: 2
        exhaustion_policy:
          policy: backoff
          interval_ms: 5000
        children:
          - kind: channel
            name: temperature
            address: 3
            region: Inputs
            type: Int16
            read_formula: "${value} / 10"
            fraction_size: 1
          - kind: channel
            name: total
"#;

    #[test]
    fn test_yaml_tree() {
        let config = TreeDescriptor::from_yaml_str(YAML).unwrap().build().unwrap();
        let connection = &config.connections()[0];
        assert_eq!(connection.endpoint(), "127.0.0.1:5020");
        assert_eq!(connection.retries_count, 2);
        assert_eq!(connection.exhaustion_policy, ExhaustionPolicy::Backoff { interval_ms: 5000 });

        let temperature = config.find_channel("temperature").unwrap();
        assert_eq!(temperature.region, Region::Inputs);
        assert_eq!(temperature.apply_read_value(215.0).unwrap(), 21.5);

        let total = config.find_channel("total").unwrap();
        assert!(total.is_virtual());
        assert_eq!(total.data_type, DataType::UInt16);
        assert_eq!(config.tree().path(config.tree().traverse()[3]), "plant/hall/boiler/temperature");
    }

    #[test]
    fn test_json_errors_are_configuration_errors() {
        let json = r#"{"name": "plant", "children": [{"kind": "channel", "name": "x", "read_formula": "1 +"}]}"#;
        assert!(matches!(
            TreeDescriptor::from_json_str(json),
            Err(crate::error::ModbusError::Configuration { .. })
        ));
    }
}
