//! Channel-based consumption of notifications

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::DriverError;
use crate::event::ReaderChange;
use crate::reader::Reader;

/// Sending half used by channel subscriptions
pub type EventSender<T> = Sender<T>;
/// Receiving half handed out by [`EventEmitter::subscribe`](crate::EventEmitter::subscribe)
pub type EventReceiver<T> = Receiver<T>;

/// Receiver for newly detected readers
pub type ReaderReceiver = EventReceiver<Reader>;
/// Receiver for reader status changes
pub type ReaderChangeReceiver = EventReceiver<ReaderChange>;
/// Receiver for driver errors
pub type DriverErrorReceiver = EventReceiver<DriverError>;

/// Create an unbounded channel for notifications
pub fn event_channel<T>() -> (EventSender<T>, EventReceiver<T>) {
    unbounded()
}
