//! Lifecycle of one physical reader slot
//!
//! Every status word the driver reports for a reader is run through a fixed
//! decision policy that connects cards as they are inserted and tears them
//! down as they are removed. The connected [`Card`] is lent to one operation
//! at a time through [`Reader::with_card`].

use std::fmt;
use std::mem;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::card::Card;
use crate::config::ClientConfig;
use crate::driver::{Driver, Protocol};
use crate::error::{Error, ErrorKind};
use crate::event::{EventEmitter, ReaderChange};
use crate::flags::{ReaderStatus, ReaderStatusFlags};

/// Observable lifecycle state of a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// No card session
    NoCard,
    /// A connect to a freshly inserted card is in flight
    Connecting,
    /// A card is connected and free for use
    Connected,
    /// A card operation is in flight
    SessionBusy,
    /// The reader went away; terminal
    Gone,
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoCard => "no card",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::SessionBusy => "busy",
            Self::Gone => "gone",
        })
    }
}

/// Notifications published by a reader
#[derive(Debug, Default)]
pub struct ReaderEvents {
    /// Every non-terminal status report, after it was applied
    pub change: EventEmitter<ReaderChange>,
    /// The reader went away. Fires exactly once.
    pub disconnect: EventEmitter<()>,
    /// Connect failures and unrecognised status words
    pub error: EventEmitter<Error>,
}

enum Session {
    Absent,
    Connecting,
    Idle(Card),
    Busy,
}

struct Record {
    status: ReaderStatusFlags,
    atr: Bytes,
    session: Session,
    protocol: Option<Protocol>,
    alive: bool,
    pending_removal: bool,
    // Bumped for every status report
    epoch: u64,
}

impl Record {
    fn take_idle(&mut self) -> Option<Card> {
        match mem::replace(&mut self.session, Session::Absent) {
            Session::Idle(card) => {
                self.protocol = None;
                Some(card)
            }
            other => {
                self.session = other;
                None
            }
        }
    }

    const fn in_flight(&self) -> bool {
        matches!(self.session, Session::Busy | Session::Connecting)
    }
}

/// What the policy decided for one status word
enum Step {
    /// The reader is gone; tear down the idle card if there is one
    Terminate(Option<Card>),
    /// Nothing to do
    Ignore(&'static str),
    /// The card was removed
    Remove(Option<Card>),
    /// Status word the policy does not recognise
    Anomaly,
    /// A card showed up in an empty slot
    Connect,
}

struct Shared {
    name: String,
    driver: Arc<dyn Driver>,
    config: ClientConfig,
    record: Mutex<Record>,
    events: ReaderEvents,
}

/// Handle to one reader slot.
///
/// Cheap to clone; all clones observe the same slot.
#[derive(Clone)]
pub struct Reader {
    shared: Arc<Shared>,
}

impl Reader {
    pub(crate) fn new(name: impl Into<String>, driver: Arc<dyn Driver>, config: ClientConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                driver,
                config,
                record: Mutex::new(Record {
                    status: ReaderStatusFlags::default(),
                    atr: Bytes::new(),
                    session: Session::Absent,
                    protocol: None,
                    alive: true,
                    pending_removal: false,
                    epoch: 0,
                }),
                events: ReaderEvents::default(),
            }),
        }
    }

    /// Reader name as reported by the driver
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Last reported status
    pub fn status(&self) -> ReaderStatusFlags {
        self.shared.record.lock().status
    }

    /// Last reported answer to reset, empty when none
    pub fn atr(&self) -> Bytes {
        self.shared.record.lock().atr.clone()
    }

    /// Protocol of the current card session
    pub fn protocol(&self) -> Option<Protocol> {
        self.shared.record.lock().protocol
    }

    /// Current lifecycle state
    pub fn state(&self) -> ReaderState {
        let record = self.shared.record.lock();
        if !record.alive {
            return ReaderState::Gone;
        }
        match record.session {
            Session::Absent => ReaderState::NoCard,
            Session::Connecting => ReaderState::Connecting,
            Session::Idle(_) => ReaderState::Connected,
            Session::Busy => ReaderState::SessionBusy,
        }
    }

    /// Whether the reader is still attached
    pub fn is_alive(&self) -> bool {
        self.shared.record.lock().alive
    }

    /// Notifications published by this reader
    pub fn events(&self) -> &ReaderEvents {
        &self.shared.events
    }

    /// Whether both handles refer to the same slot
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Run `op` against the connected card.
    ///
    /// At most one operation runs per reader; a second call while one is in
    /// flight fails with [`Error::SessionBusy`] without reaching the driver.
    /// Removals reported meanwhile take effect once `op` returns. Dropping
    /// the returned future before it completes gives up the card session.
    pub async fn with_card<T, F>(&self, op: F) -> Result<T, Error>
    where
        F: AsyncFnOnce(&Card) -> Result<T, Error>,
    {
        let card = self.acquire()?;
        let mut reset = SessionReset::new(&self.shared);
        let result = op(&card).await;
        reset.disarm();
        self.release(card).await;
        result
    }

    fn acquire(&self) -> Result<Card, Error> {
        let mut record = self.shared.record.lock();
        if !record.alive {
            return Err(Error::ReaderGone(self.shared.name.clone()));
        }
        match mem::replace(&mut record.session, Session::Busy) {
            Session::Idle(card) => Ok(card),
            Session::Busy => {
                error!(reader = %self.shared.name, "card operation already in flight");
                Err(Error::SessionBusy(self.shared.name.clone()))
            }
            other => {
                record.session = other;
                Err(Error::NoCard(self.shared.name.clone()))
            }
        }
    }

    async fn release(&self, card: Card) {
        let (card, deferred) = {
            let mut record = self.shared.record.lock();
            if record.alive && !record.pending_removal && !card.is_disconnected() {
                record.protocol = Some(card.protocol());
                record.session = Session::Idle(card);
                return;
            }
            let deferred = (record.alive && record.pending_removal).then_some(record.epoch);
            record.pending_removal = false;
            record.session = Session::Absent;
            record.protocol = None;
            (card, deferred)
        };

        self.teardown(card).await;

        if let Some(epoch) = deferred {
            self.settle(epoch).await;
        }
    }

    /// Re-run the policy on the latest status once a deferred removal was
    /// carried out. Skipped if a newer report was handled during teardown.
    async fn settle(&self, epoch: u64) {
        let (step, status, atr) = {
            let mut record = self.shared.record.lock();
            if !record.alive || record.epoch != epoch || !matches!(record.session, Session::Absent) {
                debug!(reader = %self.shared.name, "deferred removal superseded");
                return;
            }
            let status = record.status;
            (decide(&mut record, status), status, record.atr.clone())
        };
        debug!(reader = %self.shared.name, %status, "applying deferred removal");
        self.execute(step, status, atr, false).await;
    }

    /// Run one status report through the lifecycle policy
    pub(crate) async fn apply(&self, status: ReaderStatusFlags, atr: Bytes) {
        let step = {
            let mut record = self.shared.record.lock();
            if !record.alive {
                debug!(reader = %self.shared.name, %status, "discarding status for gone reader");
                return;
            }
            record.epoch = record.epoch.wrapping_add(1);
            record.status = status;
            record.atr = atr.clone();
            decide(&mut record, status)
        };
        self.execute(step, status, atr, true).await;
    }

    async fn execute(&self, step: Step, status: ReaderStatusFlags, atr: Bytes, notify: bool) {
        let connected = match step {
            Step::Terminate(card) => {
                self.finish(card).await;
                return;
            }
            Step::Ignore(reason) => {
                debug!(reader = %self.shared.name, %status, reason, "no lifecycle action");
                false
            }
            Step::Remove(card) => {
                if let Some(card) = card {
                    info!(reader = %self.shared.name, "card removed");
                    self.teardown(card).await;
                }
                false
            }
            Step::Anomaly => {
                warn!(reader = %self.shared.name, %status, "unhandled reader status");
                self.shared.events.error.emit(&Error::UnhandledStatus {
                    reader: self.shared.name.clone(),
                    status,
                });
                false
            }
            Step::Connect => self.connect().await,
        };

        // A new session is always reported, even when settling a deferred removal
        if notify || connected {
            let protocol = self.protocol();
            self.shared.events.change.emit(&ReaderChange {
                status,
                atr,
                protocol,
            });
        }
    }

    /// Returns whether the card ended up connected
    async fn connect(&self) -> bool {
        let shared = &self.shared;
        let mut reset = SessionReset::new(shared);
        let result = shared
            .driver
            .connect(&shared.name, shared.config.share_mode, shared.config.protocol)
            .await;
        reset.disarm();

        let handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                {
                    let mut record = shared.record.lock();
                    if matches!(record.session, Session::Connecting) {
                        record.session = Session::Absent;
                    }
                }
                let err = Error::from(err);
                if err.kind() == ErrorKind::CardAbsent {
                    debug!(reader = %shared.name, error = %err, "card went away before connect");
                } else {
                    warn!(reader = %shared.name, error = %err, "failed to connect card");
                }
                shared.events.error.emit(&err);
                return false;
            }
        };

        let card = Card::new(shared.name.as_str(), handle);
        let protocol = card.protocol();
        let discarded = {
            let mut record = shared.record.lock();
            if record.alive && !record.pending_removal {
                record.protocol = Some(protocol);
                record.session = Session::Idle(card);
                None
            } else {
                record.pending_removal = false;
                record.session = Session::Absent;
                Some(card)
            }
        };

        match discarded {
            None => {
                info!(reader = %shared.name, %protocol, "card connected");
                true
            }
            Some(card) => {
                debug!(reader = %shared.name, "card went away while connecting");
                self.teardown(card).await;
                false
            }
        }
    }

    /// Synthesize the terminal event. Returns `false` if the reader was already gone.
    pub(crate) async fn terminate(&self) -> bool {
        let card = {
            let mut record = self.shared.record.lock();
            if !record.alive {
                return false;
            }
            record.alive = false;
            record.take_idle()
        };
        self.finish(card).await;
        true
    }

    async fn finish(&self, card: Option<Card>) {
        info!(reader = %self.shared.name, "reader gone");
        if let Some(card) = card {
            self.teardown(card).await;
        }
        self.shared.events.disconnect.emit(&());
    }

    /// Best-effort disconnect of a card the lifecycle no longer wants
    async fn teardown(&self, card: Card) {
        if card.is_disconnected() {
            return;
        }
        if let Err(err) = card.disconnect(self.shared.config.teardown).await {
            warn!(reader = %self.shared.name, error = %err, "failed to disconnect card");
        }
    }
}

fn decide(record: &mut Record, status: ReaderStatusFlags) -> Step {
    if status.has_any(&[ReaderStatus::UNKNOWN, ReaderStatus::UNAVAILABLE]) {
        record.alive = false;
        return Step::Terminate(record.take_idle());
    }

    if status.contains(ReaderStatus::MUTE) {
        return Step::Ignore("card is mute");
    }

    if record.in_flight() {
        if status.contains(ReaderStatus::EMPTY) {
            record.pending_removal = true;
            record.protocol = None;
            return Step::Ignore("removal deferred until the session is released");
        }
        return Step::Ignore("session in flight");
    }

    if status.has_any(&[ReaderStatus::IN_USE, ReaderStatus::EXCLUSIVE]) {
        return Step::Ignore("card in use");
    }

    if status.contains(ReaderStatus::EMPTY) {
        return Step::Remove(record.take_idle());
    }

    if !status.contains(ReaderStatus::PRESENT) {
        return Step::Anomaly;
    }

    match record.session {
        Session::Absent => {
            record.session = Session::Connecting;
            Step::Connect
        }
        _ => Step::Ignore("card already connected"),
    }
}

/// Gives up the session if an in-flight connect or card operation is dropped
struct SessionReset<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl<'a> SessionReset<'a> {
    const fn new(shared: &'a Shared) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    const fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for SessionReset<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut record = self.shared.record.lock();
        if record.in_flight() {
            warn!(reader = %self.shared.name, "card session dropped mid-operation");
            record.session = Session::Absent;
            record.protocol = None;
            record.pending_removal = false;
        }
    }
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("status", &self.status())
            .finish()
    }
}
