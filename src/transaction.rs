//! # Transactions
//!
//! A transaction is one request/response exchange on a connection. Reads cover
//! one or more channels of a single region; writes target one channel.
//!
//! ```text
//! update loop                         request loop
//!   group_due_channels ──► push_read ─┐
//!   write_channel ───────► push_write ┴► RequestQueue ─► take_next ─► transport
//!                                          ▲
//!   decoded response ─── complete ◄────────┘ (single outstanding transaction)
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::config::{Channel, Connection, Region};
use crate::error::{ModbusError, ModbusResult};
use crate::protocol::{data_utils, ModbusRequest, ModbusResponse, UnitId};

/// Due channels collected in one update tick
#[derive(Debug, Clone)]
pub enum ChannelGroup {
    /// Channels without an address; served from their write value
    Virtual(Vec<Arc<Channel>>),
    /// Channels read together in one request
    Physical { region: Region, channels: Vec<Arc<Channel>> },
}

impl ChannelGroup {
    pub fn channels(&self) -> &[Arc<Channel>] {
        match self {
            ChannelGroup::Virtual(channels) => channels,
            ChannelGroup::Physical { channels, .. } => channels,
        }
    }
}

/// Advance every enabled channel of `connection` and group the due ones
///
/// Progress of all channels is updated before any grouping happens. Virtual
/// channels form a single group placed first. Physical channels are grouped
/// per region in address order: with a zero `batch_register_limit` every
/// channel is its own group, otherwise following channels join the group while
/// their finish address stays below `start + limit`.
pub fn group_due_channels(connection: &Connection, elapsed_ms: f32) -> Vec<ChannelGroup> {
    for channel in connection.channels() {
        if channel.is_enabled() {
            channel.update_progress(elapsed_ms);
        }
    }

    let mut groups = Vec::new();
    let mut virtual_channels = Vec::new();

    for (region, channels) in connection.channels_by_region() {
        let limit = connection.batch_register_limit.min(region.max_read_count()) as i32;
        let mut current: Vec<Arc<Channel>> = Vec::new();

        for channel in channels.iter().filter(|c| c.is_enabled() && c.should_read()) {
            if channel.is_virtual() {
                virtual_channels.push(channel.clone());
                continue;
            }
            let joins = match current.first() {
                Some(first) if limit > 0 => channel.finish_address() < first.start_address() + limit,
                _ => false,
            };
            if !joins && !current.is_empty() {
                groups.push(ChannelGroup::Physical {
                    region,
                    channels: std::mem::take(&mut current),
                });
            }
            current.push(channel.clone());
        }
        if !current.is_empty() {
            groups.push(ChannelGroup::Physical { region, channels: current });
        }
    }

    if !virtual_channels.is_empty() {
        groups.insert(0, ChannelGroup::Virtual(virtual_channels));
    }
    groups
}

/// What a transaction does once answered
#[derive(Debug, Clone)]
pub enum TransactionKind {
    Read { channels: Vec<Arc<Channel>> },
    /// `value` is the raw value sent, after the write formula
    Write { channel: Arc<Channel>, value: f64 },
    WriteText { channel: Arc<Channel>, text: String },
}

/// Result of matching a response to its transaction
#[derive(Debug)]
pub enum Completion {
    Read {
        /// Channels whose value was updated, in request order
        channels: Vec<Arc<Channel>>,
        /// Channels whose read formula failed; their previous value is kept
        failures: Vec<(Arc<Channel>, ModbusError)>,
    },
    Written { channel: Arc<Channel>, value: f64 },
    TextWritten { channel: Arc<Channel>, text: String },
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub region: Region,
    pub request: ModbusRequest,
    pub kind: TransactionKind,
}

impl Transaction {
    /// Read the span covering every channel of a group
    pub fn read(region: Region, channels: Vec<Arc<Channel>>) -> ModbusResult<Self> {
        let start = channels
            .iter()
            .map(|c| c.start_address())
            .min()
            .ok_or_else(|| ModbusError::invalid_data("Read transaction without channels"))?;
        let finish = channels.iter().map(|c| c.finish_address()).max().unwrap_or(start);
        if start < 0 {
            return Err(ModbusError::invalid_address(start, finish - start + 1));
        }

        let request = ModbusRequest::new_read(region.read_function(), start as u16, (finish - start + 1) as u16);
        request.validate()?;
        Ok(Self {
            region,
            request,
            kind: TransactionKind::Read { channels },
        })
    }

    /// Write one raw value to a channel
    ///
    /// Coils are switched on by any non-zero value. Holding channels send a
    /// single register when their type fits in one, a register run otherwise.
    pub fn write(channel: Arc<Channel>, value: f64) -> ModbusResult<Self> {
        let address = writable_address(&channel)?;
        let request = match channel.region {
            Region::Coils if channel.has_diapason() && channel.diapason > 1 => {
                // bit i of the value drives coil address + i
                let bits = value as u64;
                let coils: Vec<bool> = (0..channel.diapason as u32)
                    .map(|i| i < 64 && (bits >> i) & 1 == 1)
                    .collect();
                ModbusRequest::write_multiple_coils(address, &coils)
            }
            Region::Coils => ModbusRequest::write_single_coil(address, value != 0.0),
            Region::Holdings => {
                let registers = channel.data_type.encode(value);
                if registers.len() == 1 {
                    ModbusRequest::write_single_register(address, registers[0])
                } else {
                    ModbusRequest::write_multiple_registers(address, &registers)
                }
            }
            region => {
                return Err(ModbusError::invalid_data(format!(
                    "Channel '{}' is in read-only region {}",
                    channel.name, region
                )))
            }
        };
        request.validate()?;
        Ok(Self {
            region: channel.region,
            request,
            kind: TransactionKind::Write { channel, value },
        })
    }

    /// Write a string packed two bytes per register into a Holdings span
    ///
    /// The span is the channel diapason when set, otherwise just enough
    /// registers for the text.
    pub fn write_text(channel: Arc<Channel>, text: &str) -> ModbusResult<Self> {
        let address = writable_address(&channel)?;
        if channel.region != Region::Holdings {
            return Err(ModbusError::invalid_data(format!(
                "Text can only be written to holding registers, '{}' is in {}",
                channel.name, channel.region
            )));
        }

        let count = if channel.has_diapason() {
            channel.diapason as usize
        } else {
            ((text.len() + 1) / 2).max(1)
        };
        if text.len() > count * 2 {
            return Err(ModbusError::invalid_data(format!(
                "Text of {} bytes does not fit the {} registers of '{}'",
                text.len(),
                count,
                channel.name
            )));
        }
        let registers = data_utils::text_to_registers(text, count);
        let request = ModbusRequest::write_multiple_registers(address, &registers);
        request.validate()?;
        Ok(Self {
            region: channel.region,
            request,
            kind: TransactionKind::WriteText {
                channel,
                text: text.to_string(),
            },
        })
    }

    pub fn is_write(&self) -> bool {
        !matches!(self.kind, TransactionKind::Read { .. })
    }

    pub fn channel_names(&self) -> Vec<String> {
        match &self.kind {
            TransactionKind::Read { channels } => channels.iter().map(|c| c.name.clone()).collect(),
            TransactionKind::Write { channel, .. } | TransactionKind::WriteText { channel, .. } => {
                vec![channel.name.clone()]
            }
        }
    }

    /// Route a response back to the channels of this transaction
    pub fn complete(self, response: &ModbusResponse) -> ModbusResult<Completion> {
        if let Some(error) = response.get_exception() {
            return Err(error);
        }
        if response.function != self.request.function {
            return Err(ModbusError::protocol(format!(
                "Expected response to {}, got {}",
                self.request.function, response.function
            )));
        }

        match self.kind {
            TransactionKind::Read { channels } => {
                let quantity = self.request.quantity as usize;
                let values: Vec<u16> = if self.region.bit_size() == 1 {
                    response
                        .parse_bits(quantity)?
                        .into_iter()
                        .map(u16::from)
                        .collect()
                } else {
                    response.parse_registers()?
                };
                if values.len() < quantity {
                    return Err(ModbusError::frame(format!(
                        "Expected {} values, got {}",
                        quantity,
                        values.len()
                    )));
                }

                let start = self.request.address as i32;
                let mut updated = Vec::with_capacity(channels.len());
                let mut failures = Vec::new();
                for channel in channels {
                    let offset = (channel.start_address() - start) as usize;
                    let slice = &values[offset..offset + channel.register_count() as usize];
                    match decode_channel(&channel, self.region, slice) {
                        Ok(()) => updated.push(channel),
                        Err(error) => failures.push((channel, error)),
                    }
                }
                Ok(Completion::Read {
                    channels: updated,
                    failures,
                })
            }
            TransactionKind::Write { channel, value } => Ok(Completion::Written { channel, value }),
            TransactionKind::WriteText { channel, text } => Ok(Completion::TextWritten { channel, text }),
        }
    }
}

fn writable_address(channel: &Channel) -> ModbusResult<u16> {
    if channel.is_virtual() {
        return Err(ModbusError::invalid_data(format!(
            "Channel '{}' is virtual and has no device address",
            channel.name
        )));
    }
    if channel.address < 0 {
        return Err(ModbusError::invalid_address(channel.start_address(), channel.register_count()));
    }
    Ok(channel.address as u16)
}

/// Store the raw span of a channel and run its value through the read path
fn decode_channel(channel: &Channel, region: Region, registers: &[u16]) -> ModbusResult<()> {
    channel.set_raw_registers(registers);
    let raw = if region.bit_size() == 1 {
        registers.first().copied().unwrap_or(0) as f64
    } else {
        let size = channel.data_type.size() as usize;
        if registers.len() < size {
            return Err(ModbusError::invalid_data(format!(
                "Channel '{}' spans {} registers, {} needs {}",
                channel.name,
                registers.len(),
                channel.data_type,
                size
            )));
        }
        channel.data_type.decode(&registers[..size])?
    };
    channel.apply_read_value(raw).map(|_| ())
}

/// A transaction that went out and waits for its answer
#[derive(Debug)]
struct Outstanding {
    id: u16,
    sent_at: Instant,
    transaction: Transaction,
}

/// Pending and outstanding transactions of one connection
///
/// Writes always leave before reads. Only one transaction is outstanding at a
/// time; the next one is handed out once the previous was answered, expired or
/// the queue was reset.
#[derive(Debug, Default)]
pub struct RequestQueue {
    writes: VecDeque<Transaction>,
    reads: VecDeque<Transaction>,
    outstanding: Option<Outstanding>,
    transaction_id: u16,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a read unless the same span is already waiting
    pub fn push_read(&mut self, transaction: Transaction) -> bool {
        if self.reads.iter().any(|pending| pending.request == transaction.request) {
            return false;
        }
        self.reads.push_back(transaction);
        true
    }

    pub fn push_write(&mut self, transaction: Transaction) {
        self.writes.push_back(transaction);
    }

    pub fn pending(&self) -> usize {
        self.writes.len() + self.reads.len()
    }

    pub fn has_outstanding(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn outstanding_id(&self) -> Option<u16> {
        self.outstanding.as_ref().map(|o| o.id)
    }

    /// Get next transaction ID
    fn next_transaction_id(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        if self.transaction_id == 0 {
            self.transaction_id = 1;
        }
        self.transaction_id
    }

    /// Hand out the next frame to send, if nothing is outstanding
    pub fn take_next(&mut self, unit_id: UnitId) -> Option<(u16, Vec<u8>, ModbusRequest)> {
        if self.outstanding.is_some() {
            return None;
        }
        let transaction = self.writes.pop_front().or_else(|| self.reads.pop_front())?;
        let id = self.next_transaction_id();
        let frame = transaction.request.encode(id, unit_id);
        let request = transaction.request.clone();
        self.outstanding = Some(Outstanding {
            id,
            sent_at: Instant::now(),
            transaction,
        });
        Some((id, frame, request))
    }

    /// Take the outstanding transaction answered by `transaction_id`
    pub fn take_answered(&mut self, transaction_id: u16) -> ModbusResult<(Transaction, Duration)> {
        match self.outstanding.take() {
            Some(outstanding) if outstanding.id == transaction_id => {
                Ok((outstanding.transaction, outstanding.sent_at.elapsed()))
            }
            Some(outstanding) => {
                let expected = outstanding.id;
                self.outstanding = Some(outstanding);
                Err(ModbusError::transaction_mismatch(expected, transaction_id))
            }
            None => Err(ModbusError::protocol(format!(
                "Unexpected response #{} with nothing outstanding",
                transaction_id
            ))),
        }
    }

    /// Take the outstanding transaction when it has waited `timeout` or longer
    pub fn take_expired(&mut self, timeout: Duration) -> Option<(u16, Transaction)> {
        match &self.outstanding {
            Some(outstanding) if outstanding.sent_at.elapsed() >= timeout => {
                self.outstanding.take().map(|o| (o.id, o.transaction))
            }
            _ => None,
        }
    }

    /// Drop everything pending and outstanding; ids restart at 1
    pub fn reset(&mut self) {
        self.writes.clear();
        self.reads.clear();
        self.outstanding = None;
        self.transaction_id = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigTree, ModbusConfig};
    use crate::data_type::DataType;
    use crate::formula::Formula;
    use crate::protocol::{ModbusFunction, ResponseDecoder};

    fn connection(limit: u16, channels: Vec<Channel>) -> Arc<Connection> {
        let mut tree = ConfigTree::new("root");
        let plc = tree
            .add_connection(
                tree.root(),
                Connection::new("plc", "127.0.0.1", 502).with_batch_register_limit(limit),
            )
            .unwrap();
        for channel in channels {
            tree.add_channel(plc, channel).unwrap();
        }
        ModbusConfig::build(tree).unwrap().connections()[0].clone()
    }

    fn holding(name: &str, address: i16) -> Channel {
        Channel::new(name, Region::Holdings, DataType::UInt16)
            .with_address(address)
            .with_update_interval(100.0)
    }

    fn names(group: &ChannelGroup) -> Vec<&str> {
        group.channels().iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_one_group_per_channel_by_default() {
        let connection = connection(
            0,
            vec![
                holding("a", 0),
                holding("b", 1),
                Channel::new("v", Region::Holdings, DataType::UInt16).with_update_interval(100.0),
                holding("slow", 2).with_update_interval(1000.0),
            ],
        );
        assert!(group_due_channels(&connection, 50.0).is_empty());

        let groups = group_due_channels(&connection, 50.0);
        assert_eq!(groups.len(), 3);
        assert!(matches!(groups[0], ChannelGroup::Virtual(_)));
        assert_eq!(names(&groups[0]), vec!["v"]);
        assert_eq!(names(&groups[1]), vec!["a"]);
        assert_eq!(names(&groups[2]), vec!["b"]);
    }

    #[test]
    fn test_batching_respects_limit_and_regions() {
        let connection = connection(
            4,
            vec![
                holding("a", 0),
                Channel::new("f", Region::Holdings, DataType::Float32)
                    .with_address(2)
                    .with_update_interval(100.0),
                holding("c", 4),
                Channel::new("coil", Region::Coils, DataType::UInt16)
                    .with_address(0)
                    .with_update_interval(100.0),
                holding("off", 1).with_enabled(false),
            ],
        );
        let groups = group_due_channels(&connection, 100.0);
        assert_eq!(groups.len(), 3);
        assert_eq!(names(&groups[0]), vec!["a", "f"]);
        assert_eq!(names(&groups[1]), vec!["c"]);
        assert_eq!(names(&groups[2]), vec!["coil"]);
    }

    #[test]
    fn test_read_completion_routes_values() {
        let temperature = Arc::new(
            Channel::new("temperature", Region::Inputs, DataType::Int16)
                .with_address(10)
                .with_read_formula(Formula::parse("${value} / 10").unwrap())
                .with_fraction_size(1),
        );
        let flow = Arc::new(Channel::new("flow", Region::Inputs, DataType::Float32).with_address(11));
        let transaction = Transaction::read(Region::Inputs, vec![temperature.clone(), flow.clone()]).unwrap();
        assert_eq!(transaction.request.address, 10);
        assert_eq!(transaction.request.quantity, 3);

        // -25 as Int16, then 1.5f32
        let frame = [
            0x00, 0x01, 0x00, 0x00, 0x00, 0x09, 0x01, 0x04, 0x06, 0xFF, 0xE7, 0x3F, 0xC0, 0x00, 0x00,
        ];
        let mut decoder = ResponseDecoder::new();
        decoder.push(&frame);
        let response = decoder.next_frame().unwrap().unwrap();

        match transaction.complete(&response).unwrap() {
            Completion::Read { channels, failures } => {
                assert_eq!(channels.len(), 2);
                assert!(failures.is_empty());
            }
            other => panic!("unexpected completion {:?}", other),
        }
        assert_eq!(temperature.read_value(), -2.5);
        assert_eq!(flow.read_value(), 1.5);
    }

    #[test]
    fn test_write_requests() {
        let coil = Arc::new(Channel::new("pump", Region::Coils, DataType::UInt16).with_address(3));
        let transaction = Transaction::write(coil, 1.0).unwrap();
        assert_eq!(transaction.request.data, vec![0xFF, 0x00]);

        let setpoint = Arc::new(Channel::new("sp", Region::Holdings, DataType::Float32).with_address(8));
        let transaction = Transaction::write(setpoint, 1.5).unwrap();
        assert_eq!(transaction.request.quantity, 2);
        assert_eq!(transaction.request.data, vec![0x3F, 0xC0, 0x00, 0x00]);

        let input = Arc::new(Channel::new("in", Region::Inputs, DataType::UInt16).with_address(0));
        assert!(matches!(
            Transaction::write(input, 1.0),
            Err(ModbusError::InvalidData { .. })
        ));

        let label = Arc::new(Channel::new("label", Region::Holdings, DataType::UInt16).with_address(20));
        let transaction = Transaction::write_text(label, "ABC").unwrap();
        assert_eq!(transaction.request.quantity, 2);
        assert_eq!(transaction.request.data, vec![0x41, 0x42, 0x43, 0x00]);
    }

    #[test]
    fn test_coil_span_is_written_in_one_request() {
        let valves = Arc::new(
            Channel::new("valves", Region::Coils, DataType::UInt16)
                .with_address(16)
                .with_diapason(10),
        );
        let transaction = Transaction::write(valves, 0b10_0000_0101 as f64).unwrap();
        assert_eq!(transaction.request.function, ModbusFunction::WriteMultipleCoils);
        assert_eq!(transaction.request.address, 16);
        assert_eq!(transaction.request.quantity, 10);
        assert_eq!(transaction.request.data, vec![0x05, 0x02]);

        let frame = transaction.request.encode(3, 1);
        assert_eq!(&frame[7..], &[0x0F, 0x00, 0x10, 0x00, 0x0A, 0x02, 0x05, 0x02]);

        let single = Arc::new(
            Channel::new("valve", Region::Coils, DataType::UInt16)
                .with_address(16)
                .with_diapason(1),
        );
        let transaction = Transaction::write(single, 1.0).unwrap();
        assert_eq!(transaction.request.function, ModbusFunction::WriteSingleCoil);
    }

    #[test]
    fn test_text_longer_than_span_is_rejected() {
        let label = Arc::new(
            Channel::new("label", Region::Holdings, DataType::UInt16)
                .with_address(20)
                .with_diapason(2),
        );
        assert!(Transaction::write_text(label.clone(), "ABCD").is_ok());
        assert!(matches!(
            Transaction::write_text(label, "ABCDE"),
            Err(ModbusError::InvalidData { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_orders_writes_first_and_keeps_one_outstanding() {
        let a = Arc::new(holding("a", 0));
        let mut queue = RequestQueue::new();
        assert!(queue.push_read(Transaction::read(Region::Holdings, vec![a.clone()]).unwrap()));
        assert!(!queue.push_read(Transaction::read(Region::Holdings, vec![a.clone()]).unwrap()));
        queue.push_write(Transaction::write(a.clone(), 7.0).unwrap());
        assert_eq!(queue.pending(), 2);

        let (id, frame, request) = queue.take_next(1).unwrap();
        assert_eq!(id, 1);
        assert_eq!(frame[7], 0x06);
        assert!(request.function.is_write_function());
        assert!(queue.take_next(1).is_none());

        assert!(matches!(
            queue.take_answered(9),
            Err(ModbusError::TransactionMismatch { expected: 1, actual: 9 })
        ));
        let (transaction, _) = queue.take_answered(1).unwrap();
        assert!(transaction.is_write());

        let (id, _, _) = queue.take_next(1).unwrap();
        assert_eq!(id, 2);
        assert!(queue.take_expired(Duration::from_millis(500)).is_none());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(queue.take_expired(Duration::from_millis(500)).map(|(id, _)| id), Some(2));

        queue.push_write(Transaction::write(a.clone(), 1.0).unwrap());
        queue.reset();
        assert_eq!(queue.pending(), 0);
        assert!(!queue.has_outstanding());

        queue.push_write(Transaction::write(a, 2.0).unwrap());
        assert_eq!(queue.take_next(1).map(|(id, _, _)| id), Some(1));
    }
}
