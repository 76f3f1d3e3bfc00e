//! Reader registry and driver event multiplexing

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, ReplugPolicy};
use crate::driver::{Driver, DriverEvent, EventSink, StatusEvent};
use crate::error::{DriverError, Error};
use crate::event::EventEmitter;
use crate::flags::{ReaderStatus, ReaderStatusFlags};
use crate::reader::Reader;

/// Notifications published by a client
#[derive(Debug, Default)]
pub struct ClientEvents {
    /// A reader name was seen for the first time. Attach reader listeners
    /// here to receive its first change.
    pub reader: EventEmitter<Reader>,
    /// The driver failed independently of any one reader
    pub error: EventEmitter<DriverError>,
}

struct Inner {
    driver: Arc<dyn Driver>,
    config: ClientConfig,
    running: AtomicBool,
    readers: Mutex<Vec<Reader>>,
    sink: EventSink,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<DriverEvent>>,
    shutdown: Notify,
    events: ClientEvents,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if *self.running.get_mut()
            && let Err(err) = self.driver.stop_monitoring()
        {
            debug!(error = %err, "failed to stop monitoring on drop");
        }
    }
}

/// Entry point: tracks every reader the driver reports.
///
/// Cheap to clone; clones share the registry. Events are pumped either by
/// spawning [`run`](Self::run) or by calling
/// [`process_pending`](Self::process_pending).
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    /// Create a stopped client with the default configuration
    pub fn new(driver: impl Driver) -> Self {
        Self::with_config(driver, ClientConfig::default())
    }

    /// Create a stopped client
    pub fn with_config(driver: impl Driver, config: ClientConfig) -> Self {
        let (sink, receiver) = EventSink::channel();
        Self {
            inner: Arc::new(Inner {
                driver: Arc::new(driver),
                config,
                running: AtomicBool::new(false),
                readers: Mutex::new(Vec::new()),
                sink,
                receiver: AsyncMutex::new(receiver),
                shutdown: Notify::new(),
                events: ClientEvents::default(),
            }),
        }
    }

    /// Configuration handed to every reader
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Notifications published by this client
    pub fn events(&self) -> &ClientEvents {
        &self.inner.events
    }

    /// Begin monitoring. Does nothing if already running.
    pub fn start(&self) -> Result<(), Error> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(err) = self.inner.driver.start_monitoring(self.inner.sink.clone()) {
            self.inner.running.store(false, Ordering::Release);
            warn!(error = %err, "failed to start monitoring");
            return Err(err.into());
        }
        info!("client started");
        Ok(())
    }

    /// Stop monitoring.
    ///
    /// Every reader still attached receives its final disconnect, in the order
    /// readers were first seen. Events reported afterwards are discarded.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }

        for reader in self.readers() {
            if reader.terminate().await {
                debug!(reader = %reader.name(), "synthesized disconnect on stop");
            }
        }

        if let Err(err) = self.inner.driver.stop_monitoring() {
            warn!(error = %err, "failed to stop monitoring");
        }
        self.inner.shutdown.notify_waiters();
        info!("client stopped");
    }

    /// Whether the client is monitoring
    pub fn running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Reader by name, if it was ever seen
    pub fn reader(&self, name: &str) -> Option<Reader> {
        self.inner
            .readers
            .lock()
            .iter()
            .find(|reader| reader.name() == name)
            .cloned()
    }

    /// Every reader seen so far, in the order they were first seen
    pub fn readers(&self) -> Vec<Reader> {
        self.inner.readers.lock().clone()
    }

    /// Handle driver events until [`stop`](Self::stop) is called.
    ///
    /// Returns immediately if the client is not running.
    pub async fn run(&self) {
        let mut receiver = self.inner.receiver.lock().await;
        loop {
            let shutdown = self.inner.shutdown.notified();
            if !self.running() {
                break;
            }
            let event = tokio::select! {
                () = shutdown => break,
                event = receiver.recv() => event,
            };
            match event {
                Some(event) => self.dispatch(event).await,
                None => break,
            }
        }
        debug!("event loop finished");
    }

    /// Handle every event queued so far, returning how many were handled
    pub async fn process_pending(&self) -> usize {
        let mut receiver = self.inner.receiver.lock().await;
        let mut handled = 0;
        while let Ok(event) = receiver.try_recv() {
            self.dispatch(event).await;
            handled += 1;
        }
        handled
    }

    /// Handle one driver event
    pub async fn dispatch(&self, event: DriverEvent) {
        match event {
            DriverEvent::Status(event) => self.on_status(event).await,
            DriverEvent::Error(err) => self.on_error(err),
        }
    }

    async fn on_status(&self, event: StatusEvent) {
        let status = ReaderStatusFlags::from_raw(event.status);
        if !self.running() {
            debug!(reader = %event.reader, %status, "discarding status after stop");
            return;
        }
        let reader = self.lookup(&event.reader, status);
        reader.apply(status, event.atr).await;
    }

    fn on_error(&self, err: DriverError) {
        if !self.running() {
            debug!(error = %err, "discarding driver error after stop");
            return;
        }
        warn!(error = %err, "driver error");
        self.inner.events.error.emit(&err);
    }

    fn lookup(&self, name: &str, status: ReaderStatusFlags) -> Reader {
        let reader = {
            let mut readers = self.inner.readers.lock();
            match readers.iter().position(|reader| reader.name() == name) {
                Some(index) if readers[index].is_alive() => return readers[index].clone(),
                Some(index) if !self.replaces_gone(status) => return readers[index].clone(),
                Some(index) => {
                    readers.remove(index);
                    self.register(&mut readers, name)
                }
                None => self.register(&mut readers, name),
            }
        };
        info!(reader = %name, "reader detected");
        self.inner.events.reader.emit(&reader);
        reader
    }

    fn replaces_gone(&self, status: ReaderStatusFlags) -> bool {
        self.inner.config.replug == ReplugPolicy::Recreate
            && !status.has_any(&[ReaderStatus::UNKNOWN, ReaderStatus::UNAVAILABLE])
    }

    fn register(&self, readers: &mut Vec<Reader>, name: &str) -> Reader {
        let reader = Reader::new(name, Arc::clone(&self.inner.driver), self.inner.config);
        readers.push(reader.clone());
        reader
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("running", &self.running())
            .field("readers", &self.inner.readers.lock().len())
            .field("config", &self.inner.config)
            .finish()
    }
}
