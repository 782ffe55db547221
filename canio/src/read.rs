//! Filtered reads on the primary channel.
//!
//! A filtered read takes the primary channel away from the background sink,
//! consumes frames until one matches or the deadline passes, and hands the
//! channel back. Frames that do not match are dropped; only subscriptions see
//! them.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

use crate::can::{Frame, FrameFilter};
use crate::distributor::Distributor;
use crate::error::{Error, Result};

/// Longest wait a read actually schedules. Larger timeouts, up to
/// `Duration::MAX`, wait until a match or stop.
const FOREVER: Duration = Duration::from_secs(86400 * 365 * 30);

/// Outcome of [`Distributor::read_filtered`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilteredRead {
    pub frame: Frame,
    /// Non-matching frames consumed before `frame` arrived.
    pub discarded: usize,
}

/// Keeps the background sink parked while alive.
struct BackgroundPause<'a>(&'a watch::Sender<bool>);

impl<'a> BackgroundPause<'a> {
    fn engage(background: &'a watch::Sender<bool>) -> Self {
        background.send_replace(false);
        BackgroundPause(background)
    }
}

impl Drop for BackgroundPause<'_> {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

impl Distributor {
    /// Wait for the first frame matching `filter`.
    ///
    /// `timeout` is measured from the moment of the call, including the time
    /// spent waiting for a concurrent filtered read to finish. On expiry the
    /// error reports how many frames were seen while waiting.
    pub async fn read_filtered(&self, filter: &FrameFilter, timeout: Duration) -> Result<FilteredRead> {
        let deadline = Instant::now() + timeout.min(FOREVER);
        self.ensure_running()?;

        let expired = |observed| {
            log::debug!(
                "device {}: no frame matching {:?} within {:?} ({} seen)",
                self.device(),
                filter,
                timeout,
                observed
            );
            Error::Timeout { observed }
        };

        let _exclusive = timeout_at(deadline, self.read_lock.lock())
            .await
            .map_err(|_| expired(0))?;
        let _pause = BackgroundPause::engage(&self.background);
        let mut primary = timeout_at(deadline, self.primary.lock())
            .await
            .map_err(|_| expired(0))?;

        let mut observed = 0;
        let result = loop {
            let frame = match timeout_at(deadline, primary.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break Err(Error::Stopped),
                Err(_) => break Err(expired(observed)),
            };
            observed += 1;
            self.shared
                .counters
                .filtered_drained
                .fetch_add(1, Ordering::Relaxed);

            if filter.matches(&frame) {
                break Ok(FilteredRead {
                    frame,
                    discarded: observed - 1,
                });
            }
            log::trace!("device {}: discarding {}", self.device(), frame);
        };

        // stop() could not take the channel from us; nobody drains it anymore.
        if self.shared.is_stopped() {
            primary.close();
        }
        result
    }

    /// Wait for a frame with identifier `id`.
    pub async fn read_by_id(&self, id: u32, timeout: Duration) -> Result<Frame> {
        Ok(self.read_filtered(&FrameFilter::id(id), timeout).await?.frame)
    }

    /// Wait for a frame whose identifier is in `ids`.
    pub async fn read_by_id_set(&self, ids: &HashSet<u32>, timeout: Duration) -> Result<Frame> {
        Ok(self
            .read_filtered(&FrameFilter::Ids(ids.clone()), timeout)
            .await?
            .frame)
    }

    /// Wait for a frame with identifier `id` and exactly `len` payload bytes.
    pub async fn read_by_id_and_length(&self, id: u32, len: u8, timeout: Duration) -> Result<Frame> {
        Ok(self
            .read_filtered(&FrameFilter::IdAndLength { id, len }, timeout)
            .await?
            .frame)
    }

    /// Wait for a remote transmission request for `id`.
    pub async fn read_rtr(&self, id: u32, timeout: Duration) -> Result<bool> {
        self.read_filtered(&FrameFilter::Remote { id }, timeout)
            .await
            .map(|_| true)
    }
}
