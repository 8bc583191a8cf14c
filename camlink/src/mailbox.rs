//! # Image Mailbox
//!
//! Single-slot hand-off of a captured image from the capture task to the
//! network task.
//!
//! ```text
//!  capture_task ──publish──► [ lock │ Option<ImageRecord> ] ──take──► network_task
//!                    │                                          ▲
//!                    └──────────── ready (latched) ─────────────┘
//! ```
//!
//! Publishing over an unconsumed image drops the older one: only the freshest
//! frame is worth sending. The ready signal holds at most one notification,
//! so two publishes before a take wake the consumer once.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::signal::Signal;
use log::{debug, warn};

/// A published image: its buffer and the number of valid bytes
#[derive(Debug)]
pub struct ImageRecord<B> {
    pub buffer: B,
    pub len: usize,
}

impl<B: AsRef<[u8]>> ImageRecord<B> {
    /// The valid bytes of the image
    pub fn bytes(&self) -> &[u8] {
        let data = self.buffer.as_ref();
        &data[..self.len.min(data.len())]
    }
}

/// Single-slot, overwrite-on-publish image exchange
///
/// `M` selects the lock flavor; `B` is the owned buffer type.
pub struct Mailbox<M: RawMutex, B> {
    slot: Mutex<M, RefCell<Option<ImageRecord<B>>>>,
    ready: Signal<M, ()>,
}

impl<M: RawMutex, B> Mailbox<M, B> {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(RefCell::new(None)),
            ready: Signal::new(),
        }
    }

    /// Install an image and raise the ready signal
    ///
    /// Returns `true` when an unconsumed image was discarded to make room.
    pub fn publish(&self, buffer: B, len: usize) -> bool {
        let stale = self
            .slot
            .lock(|slot| slot.borrow_mut().replace(ImageRecord { buffer, len }));
        self.ready.signal(());

        match stale {
            Some(old) => {
                warn!(
                    "mailbox: discarded unsent image of {} bytes, installed {} bytes",
                    old.len, len
                );
                true
            }
            None => {
                debug!("mailbox: published {} bytes", len);
                false
            }
        }
    }

    /// Wait for the ready signal, then remove the slot's image
    ///
    /// May return `None` when a coalesced signal finds the slot already
    /// emptied; callers skip and wait again.
    pub async fn take(&self) -> Option<ImageRecord<B>> {
        self.ready.wait().await;
        self.try_take()
    }

    /// Remove the slot's image without waiting
    pub fn try_take(&self) -> Option<ImageRecord<B>> {
        self.slot.lock(|slot| slot.borrow_mut().take())
    }

    /// True if an image is waiting
    pub fn is_occupied(&self) -> bool {
        self.slot.lock(|slot| slot.borrow().is_some())
    }
}

impl<M: RawMutex, B> Default for Mailbox<M, B> {
    fn default() -> Self {
        Self::new()
    }
}
