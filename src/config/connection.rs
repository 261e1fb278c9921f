use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{Channel, Region};

/// What a connection does once its retry budget is spent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Report the failure and stay disconnected
    GiveUp,
    /// Report the failure, wait `interval_ms`, then start a fresh budget
    Backoff { interval_ms: u64 },
}

impl Default for ExhaustionPolicy {
    fn default() -> Self {
        ExhaustionPolicy::GiveUp
    }
}

/// TCP endpoint of one device and the channels read through it
#[derive(Debug, Clone)]
pub struct Connection {
    pub name: String,
    pub ip: String,
    pub port: u16,
    /// Connect and per-transaction response timeout in milliseconds
    pub response_timeout: u64,
    pub retries_count: u32,
    /// Delay between reconnect attempts in milliseconds
    pub retry_timeout: u64,
    /// Coalesce due channels of one region into reads of at most this many
    /// registers; 0 reads every channel on its own
    pub batch_register_limit: u16,
    pub exhaustion_policy: ExhaustionPolicy,
    channels_by_region: Vec<(Region, Vec<Arc<Channel>>)>,
}

impl Connection {
    pub fn new(name: impl Into<String>, ip: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            ip: ip.into(),
            port,
            response_timeout: crate::DEFAULT_TIMEOUT_MS,
            retries_count: 3,
            retry_timeout: 1000,
            batch_register_limit: 0,
            exhaustion_policy: ExhaustionPolicy::default(),
            channels_by_region: Vec::new(),
        }
    }

    pub fn with_response_timeout(mut self, timeout_ms: u64) -> Self {
        self.response_timeout = timeout_ms;
        self
    }

    pub fn with_retries(mut self, retries_count: u32, retry_timeout_ms: u64) -> Self {
        self.retries_count = retries_count;
        self.retry_timeout = retry_timeout_ms;
        self
    }

    pub fn with_batch_register_limit(mut self, limit: u16) -> Self {
        self.batch_register_limit = limit;
        self
    }

    pub fn with_exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.exhaustion_policy = policy;
        self
    }

    /// `ip:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    pub fn response_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.response_timeout)
    }

    pub fn retry_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.retry_timeout)
    }

    /// Add a channel to its region's set; false if it is already there
    pub(crate) fn add_channel(&mut self, channel: Arc<Channel>) -> bool {
        let region = channel.region;
        let index = match self.channels_by_region.iter().position(|(r, _)| *r == region) {
            Some(index) => index,
            None => {
                self.channels_by_region.push((region, Vec::new()));
                self.channels_by_region.len() - 1
            }
        };
        let channels = &mut self.channels_by_region[index].1;
        if channels.iter().any(|existing| Arc::ptr_eq(existing, &channel)) {
            return false;
        }
        channels.push(channel);
        true
    }

    /// Order every region's channels by address (stable)
    pub(crate) fn sort_channels(&mut self) {
        for (_, channels) in &mut self.channels_by_region {
            channels.sort_by_key(|channel| channel.address);
        }
    }

    /// Regions in first-seen order with their channels
    pub fn channels_by_region(&self) -> impl Iterator<Item = (Region, &[Arc<Channel>])> {
        self.channels_by_region
            .iter()
            .map(|(region, channels)| (*region, channels.as_slice()))
    }

    pub fn channels_in(&self, region: Region) -> &[Arc<Channel>] {
        self.channels_by_region
            .iter()
            .find(|(r, _)| *r == region)
            .map(|(_, channels)| channels.as_slice())
            .unwrap_or(&[])
    }

    pub fn channels(&self) -> impl Iterator<Item = &Arc<Channel>> {
        self.channels_by_region.iter().flat_map(|(_, channels)| channels.iter())
    }

    pub fn channel_count(&self) -> usize {
        self.channels_by_region.iter().map(|(_, channels)| channels.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_type::DataType;

    #[test]
    fn test_channels_by_region_are_unique_sets() {
        let mut connection = Connection::new("plc", "127.0.0.1", 502);
        let first = Arc::new(Channel::new("b", Region::Holdings, DataType::UInt16).with_address(5));
        let second = Arc::new(Channel::new("a", Region::Holdings, DataType::UInt16).with_address(1));
        let coil = Arc::new(Channel::new("c", Region::Coils, DataType::UInt16).with_address(0));

        assert!(connection.add_channel(first.clone()));
        assert!(connection.add_channel(second.clone()));
        assert!(connection.add_channel(coil));
        assert!(!connection.add_channel(first));
        assert_eq!(connection.channel_count(), 3);

        connection.sort_channels();
        let names: Vec<&str> = connection
            .channels_in(Region::Holdings)
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(connection.channels_in(Region::Inputs).is_empty());
        assert_eq!(connection.endpoint(), "127.0.0.1:502");
    }
}
