//! Card session handle
//!
//! A [`Card`] is bound to one physical insertion. It is created by the reader
//! lifecycle when a card shows up and lent to consumers through
//! [`Reader::with_card`](crate::Reader::with_card).

use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::driver::{CardHandle, Disposition, Protocol, ShareMode, TransactionHandle};
use crate::error::Error;
use crate::flags::CardStatusFlags;

/// Snapshot of a card as reported by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardState {
    /// Answer to reset
    pub atr: Bytes,
    /// Active protocol
    pub protocol: Protocol,
    /// Reader the card sits in
    pub reader: String,
    /// Card status word
    pub status: CardStatusFlags,
}

impl fmt::Display for CardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} atr={} protocol={} status={}",
            self.reader,
            hex::encode(&self.atr),
            self.protocol,
            self.status
        )
    }
}

/// A connected card
pub struct Card {
    handle: Box<dyn CardHandle>,
    reader: String,
    protocol: Mutex<Protocol>,
    disconnected: AtomicBool,
}

impl Card {
    pub(crate) fn new(reader: impl Into<String>, handle: Box<dyn CardHandle>) -> Self {
        let protocol = handle.protocol();
        Self {
            handle,
            reader: reader.into(),
            protocol: Mutex::new(protocol),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Name of the reader the card sits in
    pub fn reader_name(&self) -> &str {
        &self.reader
    }

    /// Protocol negotiated on the last connect or reconnect
    pub fn protocol(&self) -> Protocol {
        *self.protocol.lock()
    }

    /// Whether [`disconnect`](Self::disconnect) was called
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }

    fn ensure_connected(&self, operation: &'static str) -> Result<(), Error> {
        if self.is_disconnected() {
            error!(reader = %self.reader, operation, "card used after disconnect");
            return Err(Error::Disconnected(self.reader.clone()));
        }
        Ok(())
    }

    /// Send an APDU using the negotiated protocol.
    ///
    /// With `output` the response is written into that buffer and returned as
    /// a slice of it; without, the response is owned and sized to fit.
    pub async fn transmit<'b>(
        &self,
        input: &[u8],
        output: Option<&'b mut [u8]>,
    ) -> Result<Cow<'b, [u8]>, Error> {
        self.ensure_connected("transmit")?;
        trace!(reader = %self.reader, command = %hex::encode(input), "transmit");
        let response = self.handle.transmit(None, input, output).await?;
        trace!(reader = %self.reader, response = %hex::encode(&response), "received");
        Ok(response)
    }

    /// Send an APDU with `protocol` for this call only
    pub async fn transmit_protocol<'b>(
        &self,
        protocol: Protocol,
        input: &[u8],
        output: Option<&'b mut [u8]>,
    ) -> Result<Cow<'b, [u8]>, Error> {
        self.ensure_connected("transmit")?;
        trace!(reader = %self.reader, %protocol, command = %hex::encode(input), "transmit");
        Ok(self.handle.transmit(Some(protocol), input, output).await?)
    }

    /// Send a control command to the reader.
    ///
    /// See [`control_code`](crate::driver::control_code) for building `code`.
    pub async fn control<'b>(
        &self,
        code: u32,
        input: Option<&[u8]>,
        output: Option<&'b mut [u8]>,
    ) -> Result<Cow<'b, [u8]>, Error> {
        self.ensure_connected("control")?;
        trace!(reader = %self.reader, code = format_args!("{code:#010x}"), "control");
        Ok(self.handle.control(code, input, output).await?)
    }

    /// Read a reader attribute
    pub async fn attribute_get<'b>(
        &self,
        id: u32,
        output: Option<&'b mut [u8]>,
    ) -> Result<Cow<'b, [u8]>, Error> {
        self.ensure_connected("attribute_get")?;
        Ok(self.handle.attribute_get(id, output).await?)
    }

    /// Write a reader attribute
    pub async fn attribute_set(&self, id: u32, value: &[u8]) -> Result<(), Error> {
        self.ensure_connected("attribute_set")?;
        Ok(self.handle.attribute_set(id, value).await?)
    }

    /// Re-establish the connection and return the newly negotiated protocol
    pub async fn reconnect(
        &self,
        mode: ShareMode,
        disposition: Disposition,
    ) -> Result<Protocol, Error> {
        self.ensure_connected("reconnect")?;
        let protocol = self.handle.reconnect(mode, disposition).await?;
        *self.protocol.lock() = protocol;
        debug!(reader = %self.reader, %protocol, "card reconnected");
        Ok(protocol)
    }

    /// Close the connection. The card cannot be used afterwards.
    pub async fn disconnect(&self, disposition: Disposition) -> Result<(), Error> {
        if self.disconnected.swap(true, Ordering::AcqRel) {
            error!(reader = %self.reader, "card disconnected twice");
            return Err(Error::Disconnected(self.reader.clone()));
        }
        debug!(reader = %self.reader, ?disposition, "disconnecting card");
        Ok(self.handle.disconnect(disposition).await?)
    }

    /// Query the current card state
    pub async fn state(&self) -> Result<CardState, Error> {
        self.ensure_connected("state")?;
        let raw = self.handle.state().await?;
        Ok(CardState {
            atr: raw.atr,
            protocol: raw.protocol,
            reader: raw.reader,
            status: CardStatusFlags::from_raw(raw.status),
        })
    }

    /// Lock the card for a sequence of operations
    pub async fn transaction(&self) -> Result<Transaction<'_>, Error> {
        self.ensure_connected("transaction")?;
        let handle = self.handle.begin_transaction().await?;
        trace!(reader = %self.reader, "transaction started");
        Ok(Transaction {
            card: self,
            handle,
            ended: false,
        })
    }
}

impl fmt::Debug for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Card")
            .field("reader", &self.reader)
            .field("protocol", &self.protocol())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

/// An open card transaction. End it with [`end`](Self::end).
#[must_use = "a transaction holds the card lock until ended"]
pub struct Transaction<'c> {
    card: &'c Card,
    handle: Box<dyn TransactionHandle>,
    ended: bool,
}

impl Transaction<'_> {
    /// The card the transaction locks
    pub const fn card(&self) -> &Card {
        self.card
    }

    /// Release the lock
    pub async fn end(mut self, disposition: Disposition) -> Result<(), Error> {
        self.ended = true;
        self.card.ensure_connected("end transaction")?;
        self.handle.end(disposition).await?;
        trace!(reader = %self.card.reader, ?disposition, "transaction ended");
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.ended {
            warn!(reader = %self.card.reader, "transaction dropped without being ended");
        }
    }
}

impl fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("reader", &self.card.reader)
            .field("ended", &self.ended)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::CardStatus;

    #[test]
    fn test_state_display() {
        let state = CardState {
            atr: Bytes::from_static(&[0x3b, 0x8f, 0x80]),
            protocol: Protocol::T1,
            reader: "iReadCards".into(),
            status: CardStatusFlags::from(CardStatus::PRESENT | CardStatus::SPECIFIC),
        };
        assert_eq!(
            state.to_string(),
            "iReadCards atr=3b8f80 protocol=T1 status={ PRESENT | SPECIFIC }"
        );
    }
}
