//! Client side of streaming calls.
//!
//! The driver pushes data and terminal frames into a [`StreamSlot`]; the
//! caller pulls them through a [`CallStream`]. Data frames can arrive out
//! of order and the terminal frame can arrive before the last data frame,
//! so the slot releases the terminal only once every frame before its
//! `total` has been handed out.

use std::marker::PhantomData;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures_util::stream::{self, Stream};
use relaywire_protocol::{Nonce, ProtocolError, Value};
use serde::de::DeserializeOwned;
use tokio::sync::Notify;

use crate::{CallError, ReorderBuffer};

/// How a stream stopped.
#[derive(Debug)]
pub(crate) enum Terminal {
    /// The peer finished after `total` values.
    End { total: u64 },
    /// The peer failed after `total` values.
    Fault { total: u64, reason: Value },
    /// The transport was replaced underneath the stream.
    Replaced,
    /// The connection closed.
    Closed,
}

impl Terminal {
    /// Whether the terminal applies once `delivered` values are out.
    fn reached(&self, delivered: u64) -> bool {
        match self {
            Self::End { total } | Self::Fault { total, .. } => {
                delivered >= *total
            }
            Self::Replaced | Self::Closed => true,
        }
    }

    /// The announced number of values, if the peer sent one.
    fn total(&self) -> Option<u64> {
        match self {
            Self::End { total } | Self::Fault { total, .. } => Some(*total),
            Self::Replaced | Self::Closed => None,
        }
    }

    fn into_item(self) -> Option<Result<Value, CallError>> {
        match self {
            Self::End { .. } => None,
            Self::Fault { reason, .. } => Some(Err(CallError::Remote(reason))),
            Self::Replaced => Some(Err(CallError::ConnectionLost)),
            Self::Closed => Some(Err(CallError::Closed)),
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    buffer: ReorderBuffer<Value>,
    terminal: Option<Terminal>,
    finished: bool,
}

impl SlotState {
    /// Every frame before the terminal's total has been received. Frames
    /// indexed at or past the total do not count.
    fn is_complete(&self) -> bool {
        let Some(terminal) = &self.terminal else {
            return false;
        };
        let received = match terminal.total() {
            Some(total) => {
                self.buffer.next_expected()
                    + self.buffer.pending_below(total) as u64
            }
            None => self.buffer.next_expected(),
        };
        terminal.reached(received)
    }
}

/// Shared hand-off point between the driver and one [`CallStream`].
#[derive(Debug, Default)]
pub(crate) struct StreamSlot {
    state: Mutex<SlotState>,
    wake: Notify,
}

impl StreamSlot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a data frame. Returns `true` once every frame up to the
    /// announced total is present, i.e. the driver can forget the slot.
    pub(crate) fn push(&self, index: u64, value: Value) -> bool {
        let complete = {
            let mut state = self.lock();
            if !state.buffer.insert(index, value) {
                tracing::debug!(index, "discarding duplicate stream frame");
            }
            state.is_complete()
        };
        self.wake.notify_one();
        complete
    }

    /// Stores the peer's end or fault frame. Returns `true` if the stream
    /// already holds every frame before it.
    pub(crate) fn finish(&self, terminal: Terminal) -> bool {
        let complete = {
            let mut state = self.lock();
            if state.terminal.is_none() {
                state.terminal = Some(terminal);
            }
            state.is_complete()
        };
        self.wake.notify_one();
        complete
    }

    /// Fails the stream because the link went away. Overrides a pending
    /// end or fault whose frames can no longer arrive.
    pub(crate) fn lose(&self, terminal: Terminal) {
        self.lock().terminal = Some(terminal);
        self.wake.notify_one();
    }

    async fn next(&self) -> Option<Result<Value, CallError>> {
        loop {
            {
                let mut state = self.lock();
                if state.finished {
                    return None;
                }
                let delivered = state.buffer.next_expected();
                let within_total = state
                    .terminal
                    .as_ref()
                    .and_then(Terminal::total)
                    .is_none_or(|total| delivered < total);
                if within_total {
                    if let Some(value) = state.buffer.pop_ready() {
                        return Some(Ok(value));
                    }
                }
                if state
                    .terminal
                    .as_ref()
                    .is_some_and(|t| t.reached(delivered))
                {
                    state.finished = true;
                    return state.terminal.take().and_then(Terminal::into_item);
                }
            }
            // `notify_one` leaves a permit behind, so a frame pushed
            // between the unlock above and this await is not missed.
            self.wake.notified().await;
        }
    }
}

// ---------------------------------------------------------------------------
// CallStream
// ---------------------------------------------------------------------------

/// The values produced by a streaming call, in index order.
///
/// Lazy, finite, and not restartable. Dropping it does not cancel the
/// remote procedure; the peer keeps sending and the frames are discarded.
pub struct CallStream<T> {
    nonce: Nonce,
    slot: std::sync::Arc<StreamSlot>,
    _output: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for CallStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallStream")
            .field("nonce", &self.nonce)
            .finish_non_exhaustive()
    }
}

impl<T: DeserializeOwned> CallStream<T> {
    pub(crate) fn new(nonce: Nonce, slot: std::sync::Arc<StreamSlot>) -> Self {
        Self {
            nonce,
            slot,
            _output: PhantomData,
        }
    }

    /// The nonce the stream was opened with.
    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    /// Waits for the next value.
    ///
    /// Returns `None` after the peer's end frame, or after an error item
    /// (peer fault, replaced or closed connection).
    pub async fn next(&mut self) -> Option<Result<T, CallError>> {
        let item = self.slot.next().await?;
        Some(item.and_then(|value| {
            serde_json::from_value(value)
                .map_err(|e| CallError::Protocol(ProtocolError::Decode(e)))
        }))
    }

    /// Collects every value, stopping at the first error.
    pub async fn try_collect(mut self) -> Result<Vec<T>, CallError> {
        let mut values = Vec::new();
        while let Some(item) = self.next().await {
            values.push(item?);
        }
        Ok(values)
    }

    /// Adapts the call into a [`futures_util::Stream`].
    pub fn into_stream(self) -> impl Stream<Item = Result<T, CallError>> + Send
    where
        T: Send + 'static,
    {
        stream::unfold(self, |mut call| async move {
            let item = call.next().await?;
            Some((item, call))
        })
    }
}
