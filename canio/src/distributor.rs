//! Frame distribution.
//!
//! A [`Distributor`] owns one opened device. Its reader loop runs on a
//! dedicated thread, because the driver's receive call blocks, and hands
//! every frame first to the primary channel and then to each subscriber, one
//! frame at a time. The reader does not fetch the next frame before all of
//! those writes completed, so every consumer sees the hardware order and a
//! stalled subscriber stalls the whole read path.
//!
//! The primary channel has exactly one consumer at any instant: the
//! background sink, which just drains it, or a filtered read (see
//! [`crate::read`]), which pauses the sink for its duration.

use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::thread;
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, oneshot, watch};

use crate::broadcast::Broadcast;
use crate::can::bitrate::BitratePair;
use crate::can::Frame;
use crate::driver::{BusStatus, Driver, Status};
use crate::error::{Error, Result};
use crate::util::{self, KillJoinHandle};

pub use crate::broadcast::SubscriberId;
pub use tokio::sync::mpsc::error::TryRecvError;

/// Default time [`Distributor::stop`] waits for an in-flight receive.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(2);

/// Pause after a failed receive so a dead device does not spin the reader.
const ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Copy of every frame received after the subscription was registered.
///
/// Yields `None` once the subscription was removed or the device stopped.
/// Dropping it unregisters it on the next frame.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Frame>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> std::result::Result<Frame, TryRecvError> {
        self.rx.try_recv()
    }
}

impl Stream for Subscription {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.rx.poll_recv(cx)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// Counter snapshot, see [`Distributor::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    /// Frames successfully received from the driver.
    pub received: u64,
    /// Failed receive calls. Idle timeouts are not counted.
    pub receive_errors: u64,
    /// Frames the background sink drained from the primary channel.
    pub background_drained: u64,
    /// Times the background sink handed the primary channel to a filtered read.
    pub background_yields: u64,
    /// Frames drained by filtered reads, matching or not.
    pub filtered_drained: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    received: AtomicU64,
    receive_errors: AtomicU64,
    background_drained: AtomicU64,
    background_yields: AtomicU64,
    pub(crate) filtered_drained: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> Stats {
        Stats {
            received: self.received.load(Ordering::Relaxed),
            receive_errors: self.receive_errors.load(Ordering::Relaxed),
            background_drained: self.background_drained.load(Ordering::Relaxed),
            background_yields: self.background_yields.load(Ordering::Relaxed),
            filtered_drained: self.filtered_drained.load(Ordering::Relaxed),
        }
    }
}

/// State shared with the reader thread.
pub(crate) struct Shared {
    driver: Arc<dyn Driver>,
    device: u8,
    stopped: AtomicBool,
    subscribers: Broadcast<Frame>,
    pub(crate) counters: Counters,
}

impl Shared {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn driver_error(&self, status: Status) -> Error {
        Error::driver(status, self.driver.error_text(status))
    }

    fn fan_out(&self, frame: Frame) {
        for id in self.subscribers.send_blocking(&frame) {
            log::debug!("subscriber {} on device {} went away", id, self.device);
        }
    }
}

enum Lifecycle {
    Idle {
        primary_tx: mpsc::Sender<Frame>,
    },
    Running {
        reader_done: oneshot::Receiver<()>,
        sink: KillJoinHandle<()>,
    },
    Stopped,
}

/// An opened CAN device with its receive machinery.
///
/// Created by [`open`](crate::open); frame delivery begins with
/// [`start`](Distributor::start) and ends for good with
/// [`stop`](Distributor::stop).
pub struct Distributor {
    pub(crate) shared: Arc<Shared>,
    bitrate: BitratePair,
    stop_grace: Duration,
    pub(crate) primary: Arc<tokio::sync::Mutex<mpsc::Receiver<Frame>>>,
    /// `true` while the background sink owns the primary channel.
    pub(crate) background: watch::Sender<bool>,
    /// Serializes filtered reads.
    pub(crate) read_lock: tokio::sync::Mutex<()>,
    lifecycle: Mutex<Lifecycle>,
}

impl Distributor {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        device: u8,
        bitrate: BitratePair,
        stop_grace: Duration,
    ) -> Self {
        // Capacity 1 is the closest tokio gets to a rendezvous channel.
        let (primary_tx, primary_rx) = mpsc::channel(1);
        let (background, _) = watch::channel(true);

        Distributor {
            shared: Arc::new(Shared {
                driver,
                device,
                stopped: AtomicBool::new(false),
                subscribers: Broadcast::new(),
                counters: Counters::default(),
            }),
            bitrate,
            stop_grace,
            primary: Arc::new(tokio::sync::Mutex::new(primary_rx)),
            background,
            read_lock: tokio::sync::Mutex::new(()),
            lifecycle: Mutex::new(Lifecycle::Idle { primary_tx }),
        }
    }

    pub fn device(&self) -> u8 {
        self.shared.device
    }

    /// Timing registers the channel was opened with.
    pub fn bitrate(&self) -> BitratePair {
        self.bitrate
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_running(&self) -> bool {
        match &*self.lifecycle() {
            Lifecycle::Running { sink, .. } => !sink.is_finished(),
            _ => false,
        }
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        match &*self.lifecycle() {
            Lifecycle::Idle { .. } => Err(Error::NotStarted),
            Lifecycle::Running { .. } if !self.shared.is_stopped() => Ok(()),
            _ => Err(Error::Stopped),
        }
    }

    /// Start the reader thread and the background sink.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle();
        let primary_tx = match &*lifecycle {
            Lifecycle::Idle { primary_tx } => primary_tx.clone(),
            Lifecycle::Running { .. } => return Err(Error::AlreadyStarted),
            Lifecycle::Stopped => return Err(Error::Stopped),
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Spawn(e.to_string()))?;

        let (done_tx, reader_done) = oneshot::channel();
        let shared = self.shared.clone();
        thread::Builder::new()
            .name(format!("can{}-reader", self.shared.device))
            .spawn(move || {
                reader_loop(&shared, primary_tx);
                drop(done_tx);
            })
            .map_err(|e| Error::Spawn(e.to_string()))?;

        let sink = util::kill_task_on_drop(runtime.spawn(background_sink(
            self.shared.clone(),
            self.primary.clone(),
            self.background.subscribe(),
        )));

        // Dropping the idle sender leaves the reader thread as the only writer.
        *lifecycle = Lifecycle::Running { reader_done, sink };
        log::info!(
            "device {} started at {}",
            self.shared.device,
            self.bitrate
        );
        Ok(())
    }

    /// Stop delivery and release the device.
    ///
    /// Waits up to the configured grace period for a receive call that is
    /// still blocked in the driver; that call cannot be interrupted. All
    /// subscriptions are closed afterwards. The distributor cannot be
    /// restarted.
    pub async fn stop(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Stopped);
        self.shared.stopped.store(true, Ordering::Release);

        let reader_done = match previous {
            Lifecycle::Stopped => return Err(Error::Stopped),
            Lifecycle::Idle { .. } => None,
            Lifecycle::Running { reader_done, sink } => {
                drop(sink);
                Some(reader_done)
            }
        };

        // Unblocks the reader if it is waiting for room in the primary channel.
        // A filtered read holding the channel closes it itself on the way out.
        self.close_primary();

        if let Some(reader_done) = reader_done {
            if tokio::time::timeout(self.stop_grace, reader_done)
                .await
                .is_err()
            {
                log::warn!(
                    "device {}: receive still blocked after {:?}, closing anyway",
                    self.shared.device,
                    self.stop_grace
                );
                self.close_primary();
            }
        }

        let closed = self.shared.subscribers.clear();

        log::info!(
            "device {} stopped, {} subscription(s) closed",
            self.shared.device,
            closed
        );

        self.shared
            .driver
            .close(self.shared.device)
            .map_err(|status| self.shared.driver_error(status))
    }

    fn close_primary(&self) {
        if let Ok(mut primary) = self.primary.try_lock() {
            primary.close();
        }
    }

    /// Register a new subscriber. Safe to call while frames are flowing.
    pub fn subscribe(&self) -> Result<Subscription> {
        if self.shared.is_stopped() {
            return Err(Error::Stopped);
        }
        let (id, rx) = self.shared.subscribers.subscribe();
        log::debug!("device {}: subscriber {} registered", self.shared.device, id);
        Ok(Subscription { id, rx })
    }

    /// Remove a subscriber and close its channel. Unknown ids are ignored.
    ///
    /// If the reader is already blocked handing a frame to this subscriber,
    /// that one frame is still delivered once the subscriber reads. Dropping
    /// the [`Subscription`] instead ends delivery at once.
    pub fn unsubscribe(&self, id: SubscriberId) {
        if self.shared.subscribers.unsubscribe(id) {
            log::debug!("device {}: subscriber {} removed", self.shared.device, id);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    /// Transmit a frame.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        if self.shared.is_stopped() {
            return Err(Error::Stopped);
        }
        self.shared
            .driver
            .transmit(
                self.shared.device,
                frame.raw_id(),
                frame.is_rtr(),
                frame.payload(),
            )
            .map_err(|status| self.shared.driver_error(status))
    }

    pub fn bus_status(&self) -> Result<BusStatus> {
        if self.shared.is_stopped() {
            return Err(Error::Stopped);
        }
        self.shared
            .driver
            .status(self.shared.device)
            .map_err(|status| self.shared.driver_error(status))
    }

    /// Bus load in percent.
    pub fn bus_load(&self) -> Result<u8> {
        Ok(self.bus_status()?.bus_load)
    }

    pub fn stats(&self) -> Stats {
        self.shared.counters.snapshot()
    }
}

impl Drop for Distributor {
    fn drop(&mut self) {
        let lifecycle = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Stopped);
        if matches!(lifecycle, Lifecycle::Stopped) {
            return;
        }
        log::warn!("device {} dropped without stop()", self.shared.device);
        self.shared.stopped.store(true, Ordering::Release);
        if let Err(status) = self.shared.driver.close(self.shared.device) {
            log::debug!(
                "closing device {} failed: {}",
                self.shared.device,
                self.shared.driver.error_text(status)
            );
        }
    }
}

fn reader_loop(shared: &Shared, primary: mpsc::Sender<Frame>) {
    log::debug!("reader for device {} running", shared.device);

    while !shared.is_stopped() {
        match shared.driver.receive(shared.device) {
            Ok(frame) => {
                shared.counters.received.fetch_add(1, Ordering::Relaxed);
                if shared.is_stopped() || primary.blocking_send(frame).is_err() {
                    break;
                }
                shared.fan_out(frame);
            }
            Err(status) if status.is_idle() => {}
            Err(status) => {
                let errors = shared.counters.receive_errors.fetch_add(1, Ordering::Relaxed) + 1;
                log::debug!(
                    "receive on device {} failed ({} so far): {}",
                    shared.device,
                    errors,
                    shared.driver.error_text(status)
                );
                thread::sleep(ERROR_BACKOFF);
            }
        }
    }

    log::debug!("reader for device {} exited", shared.device);
}

async fn background_sink(
    shared: Arc<Shared>,
    primary: Arc<tokio::sync::Mutex<mpsc::Receiver<Frame>>>,
    mut active: watch::Receiver<bool>,
) {
    loop {
        if !*active.borrow_and_update() {
            if active.changed().await.is_err() {
                break;
            }
            continue;
        }

        let mut rx = primary.lock().await;
        tokio::select! {
            biased;

            changed = active.changed() => {
                if changed.is_err() {
                    break;
                }
                shared.counters.background_yields.fetch_add(1, Ordering::Relaxed);
            }

            frame = rx.recv() => match frame {
                Some(_) => {
                    shared.counters.background_drained.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            },
        }
    }
    log::debug!("background sink for device {} exited", shared.device);
}
