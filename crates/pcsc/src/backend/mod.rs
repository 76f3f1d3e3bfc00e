//! Driver backed by the system PC/SC service
//!
//! Status changes are collected on a dedicated monitor thread blocking in
//! `SCardGetStatusChange`. Connects run on the tokio blocking pool; every
//! connected card then lives on its own owner thread.

mod worker;

use std::borrow::Cow;
use std::ffi::CString;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use pcsc::{Attribute, Context, Protocols, ReaderState, Scope, State};
use tracing::{debug, trace, warn};

use crate::driver::{
    CardHandle, Disposition, Driver, EventSink, MAX_BUFFER_LEN_EXTENDED, Protocol, RawCardState,
    ShareMode, TransactionHandle, attributes,
};
use crate::error::{DriverError, ErrorCode};

use worker::{CardThread, Exclusive};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

impl From<ShareMode> for pcsc::ShareMode {
    fn from(mode: ShareMode) -> Self {
        match mode {
            ShareMode::Exclusive => Self::Exclusive,
            ShareMode::Shared => Self::Shared,
            ShareMode::Direct => Self::Direct,
        }
    }
}

impl From<Disposition> for pcsc::Disposition {
    fn from(disposition: Disposition) -> Self {
        match disposition {
            Disposition::Leave => Self::LeaveCard,
            Disposition::Reset => Self::ResetCard,
            Disposition::Unpower => Self::UnpowerCard,
            Disposition::Eject => Self::EjectCard,
        }
    }
}

impl From<Option<pcsc::Protocol>> for Protocol {
    fn from(protocol: Option<pcsc::Protocol>) -> Self {
        match protocol {
            Some(pcsc::Protocol::T0) => Self::T0,
            Some(pcsc::Protocol::T1) => Self::T1,
            Some(pcsc::Protocol::RAW) => Self::Raw,
            None => Self::Undefined,
        }
    }
}

fn protocols(preferred: Option<Protocol>) -> Result<Protocols, DriverError> {
    match preferred {
        None => Ok(Protocols::ANY),
        Some(Protocol::Undefined) => Ok(Protocols::UNDEFINED),
        Some(Protocol::T0) => Ok(Protocols::T0),
        Some(Protocol::T1) => Ok(Protocols::T1),
        Some(Protocol::Raw) => Ok(Protocols::RAW),
        Some(Protocol::T15) => Err(DriverError::new(
            ErrorCode::Unsupported,
            "T=15 cannot be requested through PC/SC",
        )),
    }
}

fn attribute(id: u32) -> Result<Attribute, DriverError> {
    Ok(match id {
        attributes::VENDOR_NAME => Attribute::VendorName,
        attributes::VENDOR_IFD_TYPE => Attribute::VendorIfdType,
        attributes::VENDOR_IFD_VERSION => Attribute::VendorIfdVersion,
        attributes::VENDOR_IFD_SERIAL_NO => Attribute::VendorIfdSerialNo,
        attributes::CHANNEL_ID => Attribute::ChannelId,
        attributes::MAX_INPUT => Attribute::MaxInput,
        attributes::ATR_STRING => Attribute::AtrString,
        attributes::DEVICE_FRIENDLY_NAME => Attribute::DeviceFriendlyName,
        other => {
            return Err(DriverError::new(
                ErrorCode::Unsupported,
                format!("attribute {other:#010x} is not supported"),
            ));
        }
    })
}

// DWORD is 64 bits wide on some platforms; status words fit in the low half.
fn word(bits: impl TryInto<u32>) -> u32 {
    bits.try_into().unwrap_or_default()
}

struct MonitorHandle {
    stop: Arc<AtomicBool>,
    thread: thread::JoinHandle<()>,
}

/// [`Driver`] over the system PC/SC service
pub struct PcscDriver {
    context: Context,
    poll_interval: Duration,
    monitor: Mutex<Option<MonitorHandle>>,
}

impl PcscDriver {
    /// Establish a user-scope context with the PC/SC service
    pub fn establish() -> Result<Self, DriverError> {
        let context = Context::establish(Scope::User)?;
        Ok(Self::new(context))
    }

    /// Use an already established context
    pub const fn new(context: Context) -> Self {
        Self {
            context,
            poll_interval: DEFAULT_POLL_INTERVAL,
            monitor: Mutex::new(None),
        }
    }

    /// How long the monitor thread blocks before re-listing readers
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl fmt::Debug for PcscDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PcscDriver")
            .field("poll_interval", &self.poll_interval)
            .field("monitoring", &self.monitor.lock().is_some())
            .finish()
    }
}

#[async_trait]
impl Driver for PcscDriver {
    fn start_monitoring(&self, sink: EventSink) -> Result<(), DriverError> {
        let mut monitor = self.monitor.lock();
        if monitor
            .as_ref()
            .is_some_and(|handle| !handle.thread.is_finished())
        {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let context = self.context.clone();
        let poll_interval = self.poll_interval;
        let flag = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("pcsc-monitor".into())
            .spawn(move || monitor_loop(&context, &sink, &flag, poll_interval))
            .map_err(|err| DriverError::new("ThreadSpawn", err.to_string()))?;

        *monitor = Some(MonitorHandle { stop, thread });
        Ok(())
    }

    fn stop_monitoring(&self) -> Result<(), DriverError> {
        let Some(handle) = self.monitor.lock().take() else {
            return Ok(());
        };
        handle.stop.store(true, Ordering::Release);
        // Wake the thread out of SCardGetStatusChange
        self.context.cancel()?;
        drop(handle.thread);
        Ok(())
    }

    async fn connect(
        &self,
        reader: &str,
        mode: ShareMode,
        preferred: Option<Protocol>,
    ) -> Result<Box<dyn CardHandle>, DriverError> {
        let name = CString::new(reader)
            .map_err(|_| DriverError::new(ErrorCode::UnknownReader, "reader name contains NUL"))?;
        let protocols = protocols(preferred)?;
        let context = self.context.clone();

        let (card, protocol) = tokio::task::spawn_blocking(move || {
            let card = context.connect(&name, mode.into(), protocols)?;
            let protocol = Protocol::from(card.status2_owned()?.protocol2());
            Ok::<_, pcsc::Error>((card, protocol))
        })
        .await
        .map_err(join_error)??;

        debug!(reader, %protocol, "connected to card");
        Ok(Box::new(PcscCard {
            reader: reader.to_string(),
            protocol,
            thread: CardThread::spawn(card)?,
        }))
    }
}

fn monitor_loop(context: &Context, sink: &EventSink, stop: &AtomicBool, poll_interval: Duration) {
    let mut reader_states = vec![ReaderState::new(pcsc::PNP_NOTIFICATION(), State::UNAWARE)];

    while !stop.load(Ordering::Acquire) && !sink.is_closed() {
        // Readers reported as gone were already forwarded
        reader_states.retain(|rs| !rs.event_state().intersects(State::UNKNOWN | State::IGNORE));

        match context.list_readers_owned() {
            Ok(readers) => {
                for reader in readers {
                    if !reader_states.iter().any(|rs| rs.name() == reader.as_c_str()) {
                        trace!(reader = %reader.to_string_lossy(), "tracking reader");
                        reader_states.push(ReaderState::new(reader, State::UNAWARE));
                    }
                }
            }
            Err(pcsc::Error::NoReadersAvailable) => {}
            Err(err) => {
                warn!(error = %err, "failed to list readers");
                sink.error(err.into());
                thread::sleep(poll_interval);
                continue;
            }
        }

        for rs in &mut reader_states {
            rs.sync_current_state();
        }

        match context.get_status_change(Some(poll_interval), &mut reader_states) {
            Ok(()) => {}
            Err(pcsc::Error::Timeout) => continue,
            Err(pcsc::Error::Cancelled) => break,
            Err(err) => {
                warn!(error = %err, "failed to wait for status change");
                sink.error(err.into());
                thread::sleep(poll_interval);
                continue;
            }
        }

        for rs in &reader_states {
            if rs.name() == pcsc::PNP_NOTIFICATION() {
                continue;
            }
            let state = rs.event_state();
            if !state.contains(State::CHANGED) {
                continue;
            }
            let name = rs.name().to_string_lossy().into_owned();
            sink.status(name, word(state.bits()), Bytes::copy_from_slice(rs.atr()));
        }
    }

    debug!("pcsc monitor stopped");
}

fn join_error(err: tokio::task::JoinError) -> DriverError {
    DriverError::new(ErrorCode::Cancelled, err.to_string())
}

fn respond<'b>(data: Vec<u8>, output: Option<&'b mut [u8]>) -> Result<Cow<'b, [u8]>, DriverError> {
    let Some(buffer) = output else {
        return Ok(Cow::Owned(data));
    };
    let capacity = buffer.len();
    let target = buffer.get_mut(..data.len()).ok_or_else(|| {
        DriverError::new(
            "InsufficientBuffer",
            format!("response of {} bytes exceeds buffer of {capacity}", data.len()),
        )
    })?;
    target.copy_from_slice(&data);
    Ok(Cow::Borrowed(target))
}

impl Exclusive for pcsc::Card {
    type Locked<'a> = pcsc::Transaction<'a>;

    fn lock(&mut self) -> Result<pcsc::Transaction<'_>, DriverError> {
        Ok(self.transaction()?)
    }

    fn unlock<'a>(
        locked: pcsc::Transaction<'a>,
        disposition: Disposition,
    ) -> Result<(), (pcsc::Transaction<'a>, DriverError)> {
        locked
            .end(disposition.into())
            .map_err(|(locked, err)| (locked, err.into()))
    }

    fn reconnect(&mut self, mode: ShareMode, disposition: Disposition) -> Result<Protocol, DriverError> {
        pcsc::Card::reconnect(self, mode.into(), Protocols::ANY, disposition.into())?;
        Ok(Protocol::from(self.status2_owned()?.protocol2()))
    }

    fn release(self, disposition: Disposition) -> Result<(), (Self, DriverError)> {
        self.disconnect(disposition.into())
            .map_err(|(card, err)| (card, err.into()))
    }
}

fn exchange(
    result: Result<usize, pcsc::Error>,
    mut buffer: Vec<u8>,
) -> Result<Vec<u8>, DriverError> {
    buffer.truncate(result?);
    Ok(buffer)
}

struct PcscCard {
    reader: String,
    protocol: Protocol,
    thread: CardThread<pcsc::Card>,
}

#[async_trait]
impl CardHandle for PcscCard {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    async fn reconnect(
        &self,
        mode: ShareMode,
        disposition: Disposition,
    ) -> Result<Protocol, DriverError> {
        self.thread.reconnect(mode, disposition).await
    }

    async fn disconnect(&self, disposition: Disposition) -> Result<(), DriverError> {
        self.thread.release(disposition).await
    }

    async fn transmit<'b>(
        &self,
        protocol: Option<Protocol>,
        input: &[u8],
        output: Option<&'b mut [u8]>,
    ) -> Result<Cow<'b, [u8]>, DriverError> {
        if let Some(protocol) = protocol.filter(|&p| p != self.protocol) {
            return Err(DriverError::new(
                ErrorCode::Unsupported,
                format!("cannot switch {} connection to {protocol}", self.protocol),
            ));
        }
        let input = input.to_vec();
        let response = self
            .thread
            .run(move |card| {
                let mut buffer = vec![0; MAX_BUFFER_LEN_EXTENDED];
                let len = card.transmit(&input, &mut buffer).map(<[u8]>::len);
                exchange(len, buffer)
            })
            .await?;
        respond(response, output)
    }

    async fn control<'b>(
        &self,
        code: u32,
        input: Option<&[u8]>,
        output: Option<&'b mut [u8]>,
    ) -> Result<Cow<'b, [u8]>, DriverError> {
        let input = input.map(<[u8]>::to_vec).unwrap_or_default();
        let response = self
            .thread
            .run(move |card| {
                let mut buffer = vec![0; MAX_BUFFER_LEN_EXTENDED];
                let len = card.control(code.into(), &input, &mut buffer).map(<[u8]>::len);
                exchange(len, buffer)
            })
            .await?;
        respond(response, output)
    }

    async fn attribute_get<'b>(
        &self,
        id: u32,
        output: Option<&'b mut [u8]>,
    ) -> Result<Cow<'b, [u8]>, DriverError> {
        let attribute = attribute(id)?;
        let value = self
            .thread
            .run(move |card| card.get_attribute_owned(attribute).map_err(DriverError::from))
            .await?;
        respond(value, output)
    }

    async fn attribute_set(&self, id: u32, value: &[u8]) -> Result<(), DriverError> {
        let attribute = attribute(id)?;
        let value = value.to_vec();
        self.thread
            .run(move |card| card.set_attribute(attribute, &value).map_err(DriverError::from))
            .await
    }

    async fn state(&self) -> Result<RawCardState, DriverError> {
        let fallback = self.reader.clone();
        self.thread
            .run(move |card| {
                let status = card.status2_owned()?;
                let reader = status
                    .reader_names()
                    .next()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or(fallback);
                Ok(RawCardState {
                    atr: Bytes::copy_from_slice(status.atr()),
                    protocol: Protocol::from(status.protocol2()),
                    reader,
                    status: word(status.status().bits()),
                })
            })
            .await
    }

    async fn begin_transaction(&self) -> Result<Box<dyn TransactionHandle>, DriverError> {
        self.thread.begin().await?;
        Ok(Box::new(PcscTransaction {
            thread: self.thread.clone(),
            ended: AtomicBool::new(false),
        }))
    }
}

struct PcscTransaction {
    thread: CardThread<pcsc::Card>,
    ended: AtomicBool,
}

#[async_trait]
impl TransactionHandle for PcscTransaction {
    async fn end(&self, disposition: Disposition) -> Result<(), DriverError> {
        self.thread.end(disposition).await?;
        self.ended.store(true, Ordering::Release);
        Ok(())
    }
}

impl Drop for PcscTransaction {
    fn drop(&mut self) {
        if !self.ended.load(Ordering::Acquire) {
            self.thread.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_respond_into_caller_buffer() {
        let mut buffer = [0u8; 4];
        let response = respond(vec![0x90, 0x00], Some(&mut buffer[..])).unwrap();
        assert!(matches!(response, Cow::Borrowed(&[0x90, 0x00])));

        let mut small = [0u8; 1];
        let err = respond(vec![0x90, 0x00], Some(&mut small[..])).unwrap_err();
        assert_eq!(err.code, ErrorCode::Other("InsufficientBuffer".into()));
    }

    #[test]
    fn test_respond_owned() {
        let response = respond(vec![0x6a, 0x82], None).unwrap();
        assert_eq!(response.as_ref(), &[0x6a, 0x82]);
        assert!(matches!(response, Cow::Owned(_)));
    }

    #[test]
    fn test_unknown_attribute_is_unsupported() {
        assert_eq!(attribute(0x1234).unwrap_err().code, ErrorCode::Unsupported);
        assert!(attribute(attributes::ATR_STRING).is_ok());
    }
}
