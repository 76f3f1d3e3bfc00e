//! Owner thread for one connected card
//!
//! PC/SC card calls block, and a transaction mutably borrows its card for as
//! long as it is open. Each card therefore lives on a thread of its own that
//! serves requests in order and keeps an open transaction on its stack
//! between begin and end.

use std::ops::Deref;
use std::thread;

use crossbeam_channel::{Receiver, Sender, unbounded};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::driver::{Disposition, Protocol, ShareMode};
use crate::error::{DriverError, ErrorCode};

/// A card connection that can be locked for a transaction
pub(super) trait Exclusive: Sized + Send + 'static {
    /// The card while a transaction is open
    type Locked<'a>: Deref<Target = Self>
    where
        Self: 'a;

    fn lock(&mut self) -> Result<Self::Locked<'_>, DriverError>;

    /// End the transaction, handing the lock back if that fails
    fn unlock<'a>(
        locked: Self::Locked<'a>,
        disposition: Disposition,
    ) -> Result<(), (Self::Locked<'a>, DriverError)>;

    fn reconnect(&mut self, mode: ShareMode, disposition: Disposition)
    -> Result<Protocol, DriverError>;

    /// Disconnect, handing the card back if that fails
    fn release(self, disposition: Disposition) -> Result<(), (Self, DriverError)>;
}

type Job<C> = Box<dyn FnOnce(&C) + Send>;
type Reply<T> = oneshot::Sender<Result<T, DriverError>>;

enum Request<C> {
    Run(Job<C>),
    Reconnect {
        mode: ShareMode,
        disposition: Disposition,
        reply: Reply<Protocol>,
    },
    Begin(Reply<()>),
    End {
        disposition: Disposition,
        reply: Reply<()>,
    },
    Release {
        disposition: Disposition,
        reply: Reply<()>,
    },
}

fn released() -> DriverError {
    DriverError::new(ErrorCode::RemovedCard, "card handle released")
}

/// Handle to the thread owning a card. Cloning shares the thread.
pub(super) struct CardThread<C> {
    requests: Sender<Request<C>>,
}

impl<C> Clone for CardThread<C> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
        }
    }
}

impl<C: Exclusive> CardThread<C> {
    /// Move `card` onto a new owner thread
    pub(super) fn spawn(card: C) -> Result<Self, DriverError> {
        let (requests, inbox) = unbounded();
        thread::Builder::new()
            .name("pcsc-card".into())
            .spawn(move || serve(card, &inbox))
            .map_err(|err| DriverError::new("ThreadSpawn", err.to_string()))?;
        Ok(Self { requests })
    }

    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request<C>) -> Result<T, DriverError> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(request(reply))
            .map_err(|_| released())?;
        response.await.map_err(|_| released())?
    }

    /// Run `op` against the card on its owner thread
    pub(super) async fn run<T, F>(&self, op: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(&C) -> Result<T, DriverError> + Send + 'static,
    {
        self.call(|reply| {
            Request::Run(Box::new(move |card| {
                let _ = reply.send(op(card));
            }))
        })
        .await
    }

    pub(super) async fn reconnect(
        &self,
        mode: ShareMode,
        disposition: Disposition,
    ) -> Result<Protocol, DriverError> {
        self.call(|reply| Request::Reconnect {
            mode,
            disposition,
            reply,
        })
        .await
    }

    pub(super) async fn begin(&self) -> Result<(), DriverError> {
        self.call(Request::Begin).await
    }

    pub(super) async fn end(&self, disposition: Disposition) -> Result<(), DriverError> {
        self.call(|reply| Request::End { disposition, reply }).await
    }

    /// End an open transaction without waiting for the outcome
    pub(super) fn abandon(&self) {
        let (reply, _) = oneshot::channel();
        let _ = self.requests.send(Request::End {
            disposition: Disposition::Leave,
            reply,
        });
    }

    /// Disconnect the card and stop the thread. Succeeds if it already stopped.
    pub(super) async fn release(&self, disposition: Disposition) -> Result<(), DriverError> {
        let (reply, response) = oneshot::channel();
        if self
            .requests
            .send(Request::Release { disposition, reply })
            .is_err()
        {
            return Ok(());
        }
        response.await.unwrap_or(Ok(()))
    }
}

fn serve<C: Exclusive>(mut card: C, inbox: &Receiver<Request<C>>) {
    while let Ok(request) = inbox.recv() {
        match request {
            Request::Run(job) => job(&card),
            Request::Reconnect {
                mode,
                disposition,
                reply,
            } => {
                let _ = reply.send(card.reconnect(mode, disposition));
            }
            Request::Begin(reply) => match card.lock() {
                Ok(locked) => {
                    let _ = reply.send(Ok(()));
                    if !hold::<C>(locked, inbox) {
                        break;
                    }
                }
                Err(err) => {
                    let _ = reply.send(Err(err));
                }
            },
            Request::End { reply, .. } => {
                let _ = reply.send(Err(DriverError::new(
                    "NoTransaction",
                    "no transaction is open",
                )));
            }
            Request::Release { disposition, reply } => match card.release(disposition) {
                Ok(()) => {
                    let _ = reply.send(Ok(()));
                    debug!("card released");
                    return;
                }
                Err((kept, err)) => {
                    card = kept;
                    let _ = reply.send(Err(err));
                }
            },
        }
    }
    trace!("card handle dropped");
}

/// Serve requests while a transaction is open. Returns `false` once every
/// handle is gone.
fn hold<C: Exclusive>(mut locked: C::Locked<'_>, inbox: &Receiver<Request<C>>) -> bool {
    let busy = || DriverError::new("TransactionInProgress", "a transaction is open on this card");
    while let Ok(request) = inbox.recv() {
        match request {
            Request::Run(job) => job(&*locked),
            Request::End { disposition, reply } => match C::unlock(locked, disposition) {
                Ok(()) => {
                    let _ = reply.send(Ok(()));
                    return true;
                }
                Err((kept, err)) => {
                    locked = kept;
                    let _ = reply.send(Err(err));
                }
            },
            Request::Begin(reply) => {
                let _ = reply.send(Err(busy()));
            }
            Request::Reconnect { reply, .. } => {
                let _ = reply.send(Err(busy()));
            }
            Request::Release { reply, .. } => {
                let _ = reply.send(Err(busy()));
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeCard {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FakeCard {
        fn note(&self, entry: impl Into<String>) {
            self.log.lock().push(entry.into());
        }
    }

    struct FakeLock<'a>(&'a mut FakeCard);

    impl Deref for FakeLock<'_> {
        type Target = FakeCard;

        fn deref(&self) -> &FakeCard {
            self.0
        }
    }

    impl Exclusive for FakeCard {
        type Locked<'a> = FakeLock<'a>;

        fn lock(&mut self) -> Result<FakeLock<'_>, DriverError> {
            self.note("lock");
            Ok(FakeLock(self))
        }

        fn unlock<'a>(
            locked: FakeLock<'a>,
            disposition: Disposition,
        ) -> Result<(), (FakeLock<'a>, DriverError)> {
            locked.note(format!("unlock {disposition:?}"));
            Ok(())
        }

        fn reconnect(
            &mut self,
            _mode: ShareMode,
            disposition: Disposition,
        ) -> Result<Protocol, DriverError> {
            self.note(format!("reconnect {disposition:?}"));
            Ok(Protocol::T0)
        }

        fn release(self, disposition: Disposition) -> Result<(), (Self, DriverError)> {
            self.note(format!("release {disposition:?}"));
            Ok(())
        }
    }

    fn spawn() -> (CardThread<FakeCard>, Arc<Mutex<Vec<String>>>) {
        let card = FakeCard::default();
        let log = Arc::clone(&card.log);
        (CardThread::spawn(card).unwrap(), log)
    }

    #[tokio::test]
    async fn test_run_returns_result() {
        let (thread, log) = spawn();
        let value = thread
            .run(|card| {
                card.note("transmit");
                Ok(vec![0x90, 0x00])
            })
            .await
            .unwrap();
        assert_eq!(value, vec![0x90, 0x00]);

        let err = thread
            .run(|_| Err::<(), _>(DriverError::new(ErrorCode::Timeout, "slow card")))
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Timeout);
        assert_eq!(*log.lock(), ["transmit"]);
    }

    #[tokio::test]
    async fn test_transaction_spans_requests() {
        let (thread, log) = spawn();

        thread.begin().await.unwrap();
        thread
            .run(|card| {
                card.note("transmit");
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(
            thread.begin().await.unwrap_err().code,
            ErrorCode::Other("TransactionInProgress".into())
        );
        assert!(thread.reconnect(ShareMode::Shared, Disposition::Reset).await.is_err());
        thread.end(Disposition::Leave).await.unwrap();

        assert_eq!(
            thread.reconnect(ShareMode::Shared, Disposition::Reset).await.unwrap(),
            Protocol::T0
        );
        assert_eq!(
            *log.lock(),
            ["lock", "transmit", "unlock Leave", "reconnect Reset"]
        );
        assert_eq!(
            thread.end(Disposition::Leave).await.unwrap_err().code,
            ErrorCode::Other("NoTransaction".into())
        );
    }

    #[tokio::test]
    async fn test_abandoned_transaction_is_ended() {
        let (thread, log) = spawn();

        thread.begin().await.unwrap();
        thread.abandon();
        thread.release(Disposition::Reset).await.unwrap();

        assert_eq!(*log.lock(), ["lock", "unlock Leave", "release Reset"]);
    }

    #[tokio::test]
    async fn test_release_stops_the_thread() {
        let (thread, log) = spawn();

        thread.release(Disposition::Unpower).await.unwrap();
        let err = thread.run(|_| Ok(())).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::RemovedCard);
        // Releasing twice is harmless
        thread.release(Disposition::Unpower).await.unwrap();
        assert_eq!(*log.lock(), ["release Unpower"]);
    }
}
