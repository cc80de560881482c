//! Streaming iterator for scan-shaped reads.
//!
//! An iterator can end in any of these scenarios:
//!
//! 1. `push_error` is called by a producer, which closes the iterator
//!    immediately — items still buffered are discarded,
//! 2. `push_finished` is called by every producer and the consumer drains
//!    the items channel,
//! 3. the consumer's cancellation token is tripped, causing the producer's
//!    next `push_item` to return false and latch [`Error::Canceled`].
//!
//! In all three cases the following call to `next()` returns false.
//!
//! Assumptions:
//!
//! * `next()` is never called again after it returned false.
//! * `next()`, `item()` and `err()` are called from a single consumer.
//! * A consumer that wants to stop early trips the cancellation token so the
//!   producer does not keep working for nothing.

use std::sync::Arc;
use std::sync::OnceLock;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::Kv;

/// Capacity of the items channel between producer and consumer.
const ITEM_BUFFER: usize = 100;

/// Creates a connected producer/consumer pair.
///
/// The usual backend shape is one spawned producer task per iterator:
///
/// ```ignore
/// let (sender, iter) = iterator::channel();
/// let producer = sender.clone();
/// iterator::drive(sender, async move {
///     while let Some(kv) = source.next().await? {
///         if !producer.push_item(kv).await {
///             break;
///         }
///     }
///     Ok(())
/// });
/// return iter;
/// ```
pub fn channel() -> (IteratorSender, KvIterator) {
    let (tx, rx) = mpsc::channel(ITEM_BUFFER);
    let error = Arc::new(OnceLock::new());
    let errored = CancellationToken::new();
    let cancel = CancellationToken::new();

    let sender = IteratorSender {
        tx,
        error: Arc::clone(&error),
        errored: errored.clone(),
        cancel: cancel.clone(),
    };
    let iter = KvIterator {
        rx,
        error,
        errored,
        cancel,
        last_item: None,
        err: None,
        next_called: false,
    };
    (sender, iter)
}

/// Spawns a producer task and terminates the iterator when it returns.
///
/// A future resolving to `Ok(())` finishes the iterator; an `Err` latches it.
/// Cancellation observed inside `push_item` is already latched by the time
/// the future returns, and the latch keeps the first error.
pub fn drive<F>(sender: IteratorSender, produce: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match produce.await {
            Ok(()) => sender.push_finished(),
            Err(e) => sender.push_error(e),
        }
    });
}

/// Producer half of a streaming iterator.
///
/// Cloning yields the multi-producer variant used by range-sharded scans:
/// all clones share the items channel and the error latch. A natural close
/// happens only once every clone has been consumed by `push_finished` /
/// `push_error` (or dropped); any producer error closes the iterator
/// immediately, the first latched error wins, and every other producer's
/// `push_item` returns false from then on.
#[derive(Clone)]
pub struct IteratorSender {
    tx: mpsc::Sender<Kv>,
    error: Arc<OnceLock<Error>>,
    errored: CancellationToken,
    cancel: CancellationToken,
}

impl IteratorSender {
    /// Records a terminal error and wakes the consumer. First write wins.
    fn latch(&self, err: Error) {
        let _ = self.error.set(err);
        self.errored.cancel();
    }

    /// Pushes one item toward the consumer, blocking while the channel is at
    /// capacity.
    ///
    /// Returns false when the consumer cancelled or went away, or when
    /// another producer already latched an error; the producer must stop
    /// promptly in that case.
    pub async fn push_item(&self, kv: Kv) -> bool {
        if self.errored.is_cancelled() {
            return false;
        }
        if self.cancel.is_cancelled() {
            self.latch(Error::Canceled);
            return false;
        }

        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.latch(Error::Canceled);
                false
            }
            _ = self.errored.cancelled() => false,
            res = self.tx.send(kv) => res.is_ok(),
        }
    }

    /// Marks natural completion. Consuming the sender closes this producer's
    /// handle on the items channel exactly once.
    pub fn push_finished(self) {}

    /// Latches a terminal error and closes the iterator immediately. The
    /// latch is first-write-wins; later calls from other producers are
    /// ignored.
    pub fn push_error(self, err: Error) {
        self.latch(err);
    }

    /// The cancellation token shared with the consumer. Producers doing
    /// long-running I/O can select against it to abort in-flight requests.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Consumer half of a streaming iterator.
///
/// The correct iteration pattern is:
///
/// ```ignore
/// let mut it = store.prefix(prefix, limit, ReadOptions::default());
/// while it.next().await {
///     // do something with it.item()
/// }
/// if let Some(err) = it.err() {
///     // handle error
/// }
/// ```
pub struct KvIterator {
    rx: mpsc::Receiver<Kv>,
    error: Arc<OnceLock<Error>>,
    errored: CancellationToken,
    cancel: CancellationToken,
    last_item: Option<Kv>,
    err: Option<Error>,
    next_called: bool,
}

impl KvIterator {
    /// Returns true when an item is available through [`item`](Self::item),
    /// false once the iterator terminated.
    ///
    /// A latched producer error closes the iterator immediately: items still
    /// sitting in the channel buffer are discarded, not delivered. After
    /// `next` returns false, [`err`](Self::err) **must** be consulted;
    /// ignoring it silently drops producer errors.
    pub async fn next(&mut self) -> bool {
        self.next_called = true;

        if self.err.is_some() {
            return false;
        }

        // The error latch is polled before the items channel so an error
        // closes the iterator ahead of any buffered items.
        tokio::select! {
            biased;
            _ = self.errored.cancelled() => {
                self.err = self.error.get().cloned();
                false
            }
            item = self.rx.recv() => match item {
                Some(kv) => {
                    self.last_item = Some(kv);
                    true
                }
                None => {
                    // Channel closed: every producer finished or dropped.
                    self.err = self.error.get().cloned();
                    false
                }
            },
        }
    }

    /// The last item observed by a true-returning [`next`](Self::next).
    ///
    /// # Panics
    ///
    /// Panics when called before `next` ever returned true.
    pub fn item(&self) -> &Kv {
        self.last_item
            .as_ref()
            .expect("item() called before a successful next()")
    }

    /// The error that terminated the iterator, or `None` after a natural
    /// finish.
    ///
    /// # Panics
    ///
    /// Panics when called before any call to `next`: the error is populated
    /// only by `next`, so consulting it earlier is a caller bug.
    pub fn err(&self) -> Option<&Error> {
        assert!(
            self.next_called,
            "err() called before next(); the terminal error is only populated by next()"
        );
        self.err.as_ref()
    }

    /// The cancellation token for this iterator. Tripping it makes the
    /// producer stop and surfaces [`Error::Canceled`] through
    /// [`err`](Self::err).
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drains the iterator into a vector, or returns its terminal error.
    pub async fn collect(mut self) -> Result<Vec<Kv>> {
        let mut out = Vec::new();
        while self.next().await {
            out.push(self.item().clone());
        }
        match self.err() {
            Some(err) => Err(err.clone()),
            None => Ok(out),
        }
    }
}
