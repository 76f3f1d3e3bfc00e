//! Common test utilities

#![allow(dead_code, unreachable_pub)]

use std::borrow::Cow;
use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use nexum_pcsc::driver::{
    CardHandle, Driver, EventSink, RawCardState, TransactionHandle, attributes,
};
use nexum_pcsc::{
    Client, ClientConfig, Disposition, DriverError, Protocol, Reader, ReaderStatus, ShareMode,
};

/// ATR of a typical contactless storage card
pub const ATR: &[u8] = &[
    0x3b, 0x8f, 0x80, 0x01, 0x80, 0x4f, 0x0c, 0xa0, 0x00, 0x00, 0x03, 0x06, 0x03, 0x00, 0x01,
    0x00, 0x00, 0x00, 0x00, 0x6a,
];

/// ATR of a second card swapped in
pub const OTHER_ATR: &[u8] = &[0x3b, 0x02, 0x14, 0x50];

pub const PRESENT: u32 = ReaderStatus::CHANGED.bits() | ReaderStatus::PRESENT.bits();
pub const PRESENT_IN_USE: u32 = PRESENT | ReaderStatus::IN_USE.bits();
pub const EMPTY: u32 = ReaderStatus::CHANGED.bits() | ReaderStatus::EMPTY.bits();
pub const UNKNOWN: u32 = ReaderStatus::CHANGED.bits() | ReaderStatus::UNKNOWN.bits();
pub const MUTE: u32 = PRESENT | ReaderStatus::MUTE.bits();

/// Status word reported by [`MockCard::state`]: PRESENT | SPECIFIC
pub const CARD_STATUS: u32 = 0x0044;

/// Route library logs to the test harness
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Everything the library asked the driver to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Connect {
        reader: String,
        mode: ShareMode,
        preferred: Option<Protocol>,
    },
    Reconnect {
        reader: String,
        mode: ShareMode,
        disposition: Disposition,
    },
    Disconnect {
        reader: String,
        disposition: Disposition,
    },
    Transmit {
        reader: String,
        protocol: Option<Protocol>,
        input: Vec<u8>,
    },
    Control {
        reader: String,
        code: u32,
        input: Vec<u8>,
    },
    AttributeGet {
        reader: String,
        id: u32,
    },
    AttributeSet {
        reader: String,
        id: u32,
        value: Vec<u8>,
    },
    State {
        reader: String,
    },
    BeginTransaction {
        reader: String,
    },
    EndTransaction {
        reader: String,
        disposition: Disposition,
    },
}

#[derive(Default)]
struct State {
    sink: Option<EventSink>,
    starts: usize,
    stops: usize,
    start_failure: Option<DriverError>,
    connect_failures: VecDeque<DriverError>,
    op_failures: VecDeque<DriverError>,
    responses: VecDeque<Vec<u8>>,
    protocol: Option<Protocol>,
    gate: Option<Arc<Notify>>,
    disconnect_gate: Option<Arc<Notify>>,
    calls: Vec<Call>,
}

/// Scripted in-memory driver
#[derive(Clone, Default)]
pub struct MockDriver {
    state: Arc<Mutex<State>>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Client over a clone of this driver
    pub fn client(&self) -> Client {
        Client::new(self.clone())
    }

    /// Client over a clone of this driver with `config`
    pub fn client_with(&self, config: ClientConfig) -> Client {
        Client::with_config(self.clone(), config)
    }

    /// Report a status change through the sink handed over by `start`
    pub fn status(&self, reader: &str, status: u32, atr: &[u8]) {
        let sink = self.state.lock().sink.clone();
        let sink = sink.expect("monitoring was never started");
        sink.status(reader, status, Bytes::copy_from_slice(atr));
    }

    /// Report a driver failure through the sink
    pub fn error(&self, code: &str, message: &str) {
        let sink = self.state.lock().sink.clone();
        let sink = sink.expect("monitoring was never started");
        sink.error(DriverError::new(code, message));
    }

    pub fn starts(&self) -> usize {
        self.state.lock().starts
    }

    pub fn stops(&self) -> usize {
        self.state.lock().stops
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn connects(&self) -> usize {
        self.count(|call| matches!(call, Call::Connect { .. }))
    }

    pub fn disconnects(&self) -> Vec<Disposition> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Disconnect { disposition, .. } => Some(disposition),
                _ => None,
            })
            .collect()
    }

    pub fn transmits(&self) -> usize {
        self.count(|call| matches!(call, Call::Transmit { .. }))
    }

    fn count(&self, filter: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|call| filter(call)).count()
    }

    pub fn fail_start(&self, err: DriverError) {
        self.state.lock().start_failure = Some(err);
    }

    pub fn fail_next_connect(&self, err: DriverError) {
        self.state.lock().connect_failures.push_back(err);
    }

    pub fn fail_next_op(&self, err: DriverError) {
        self.state.lock().op_failures.push_back(err);
    }

    pub fn respond_with(&self, response: &[u8]) {
        self.state.lock().responses.push_back(response.to_vec());
    }

    /// Protocol negotiated by later connects and reconnects (T1 by default)
    pub fn negotiate(&self, protocol: Protocol) {
        self.state.lock().protocol = Some(protocol);
    }

    /// Hold the next transmit until the returned gate is notified
    pub fn gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().gate = Some(Arc::clone(&gate));
        gate
    }

    /// Hold the next disconnect until the returned gate is notified. The
    /// call is recorded before it blocks.
    pub fn disconnect_gate(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().disconnect_gate = Some(Arc::clone(&gate));
        gate
    }

    fn protocol(&self) -> Protocol {
        self.state.lock().protocol.unwrap_or(Protocol::T1)
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn start_monitoring(&self, sink: EventSink) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        if let Some(err) = state.start_failure.take() {
            return Err(err);
        }
        state.starts += 1;
        state.sink = Some(sink);
        Ok(())
    }

    fn stop_monitoring(&self) -> Result<(), DriverError> {
        self.state.lock().stops += 1;
        Ok(())
    }

    async fn connect(
        &self,
        reader: &str,
        mode: ShareMode,
        preferred: Option<Protocol>,
    ) -> Result<Box<dyn CardHandle>, DriverError> {
        {
            let mut state = self.state.lock();
            state.calls.push(Call::Connect {
                reader: reader.to_string(),
                mode,
                preferred,
            });
            if let Some(err) = state.connect_failures.pop_front() {
                return Err(err);
            }
        }
        Ok(Box::new(MockCard {
            driver: self.clone(),
            reader: reader.to_string(),
            protocol: preferred.unwrap_or_else(|| self.protocol()),
        }))
    }
}

fn respond(response: Vec<u8>, output: Option<&mut [u8]>) -> Cow<'_, [u8]> {
    match output {
        Some(buffer) => {
            let target = &mut buffer[..response.len()];
            target.copy_from_slice(&response);
            Cow::Borrowed(target)
        }
        None => Cow::Owned(response),
    }
}

/// Card handed out by [`MockDriver`]
pub struct MockCard {
    driver: MockDriver,
    reader: String,
    protocol: Protocol,
}

impl MockCard {
    fn record(&self, call: Call) -> Result<(), DriverError> {
        let mut state = self.driver.state.lock();
        state.calls.push(call);
        state.op_failures.pop_front().map_or(Ok(()), Err)
    }

    fn next_response(&self, default: &[u8]) -> Vec<u8> {
        self.driver
            .state
            .lock()
            .responses
            .pop_front()
            .unwrap_or_else(|| default.to_vec())
    }
}

#[async_trait]
impl CardHandle for MockCard {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn reconnect(
        &self,
        mode: ShareMode,
        disposition: Disposition,
    ) -> Result<Protocol, DriverError> {
        self.record(Call::Reconnect {
            reader: self.reader.clone(),
            mode,
            disposition,
        })?;
        Ok(self.driver.protocol())
    }

    async fn disconnect(&self, disposition: Disposition) -> Result<(), DriverError> {
        let gate = {
            let mut state = self.driver.state.lock();
            state.calls.push(Call::Disconnect {
                reader: self.reader.clone(),
                disposition,
            });
            state.disconnect_gate.take()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.driver.state.lock().op_failures.pop_front().map_or(Ok(()), Err)
    }

    async fn transmit<'b>(
        &self,
        protocol: Option<Protocol>,
        input: &[u8],
        output: Option<&'b mut [u8]>,
    ) -> Result<Cow<'b, [u8]>, DriverError> {
        let gate = {
            let mut state = self.driver.state.lock();
            state.calls.push(Call::Transmit {
                reader: self.reader.clone(),
                protocol,
                input: input.to_vec(),
            });
            state.gate.take()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        if let Some(err) = self.driver.state.lock().op_failures.pop_front() {
            return Err(err);
        }
        Ok(respond(self.next_response(&[0x90, 0x00]), output))
    }

    async fn control<'b>(
        &self,
        code: u32,
        input: Option<&[u8]>,
        output: Option<&'b mut [u8]>,
    ) -> Result<Cow<'b, [u8]>, DriverError> {
        self.record(Call::Control {
            reader: self.reader.clone(),
            code,
            input: input.unwrap_or_default().to_vec(),
        })?;
        Ok(respond(self.next_response(&[]), output))
    }

    async fn attribute_get<'b>(
        &self,
        id: u32,
        output: Option<&'b mut [u8]>,
    ) -> Result<Cow<'b, [u8]>, DriverError> {
        self.record(Call::AttributeGet {
            reader: self.reader.clone(),
            id,
        })?;
        let value = if id == attributes::ATR_STRING {
            ATR.to_vec()
        } else {
            self.next_response(&[])
        };
        Ok(respond(value, output))
    }

    async fn attribute_set(&self, id: u32, value: &[u8]) -> Result<(), DriverError> {
        self.record(Call::AttributeSet {
            reader: self.reader.clone(),
            id,
            value: value.to_vec(),
        })
    }

    async fn state(&self) -> Result<RawCardState, DriverError> {
        self.record(Call::State {
            reader: self.reader.clone(),
        })?;
        Ok(RawCardState {
            atr: Bytes::from_static(ATR),
            protocol: self.protocol,
            reader: self.reader.clone(),
            status: CARD_STATUS,
        })
    }

    async fn begin_transaction(&self) -> Result<Box<dyn TransactionHandle>, DriverError> {
        self.record(Call::BeginTransaction {
            reader: self.reader.clone(),
        })?;
        Ok(Box::new(MockTransaction {
            driver: self.driver.clone(),
            reader: self.reader.clone(),
        }))
    }
}

struct MockTransaction {
    driver: MockDriver,
    reader: String,
}

#[async_trait]
impl TransactionHandle for MockTransaction {
    async fn end(&self, disposition: Disposition) -> Result<(), DriverError> {
        self.driver.state.lock().calls.push(Call::EndTransaction {
            reader: self.reader.clone(),
            disposition,
        });
        Ok(())
    }
}

/// Start a client and bring `name` up with a connected card
pub async fn connected_reader(client: &Client, driver: &MockDriver, name: &str) -> Reader {
    client.start().expect("mock driver starts");
    driver.status(name, PRESENT, ATR);
    client.process_pending().await;
    client.reader(name).expect("reader was announced")
}
