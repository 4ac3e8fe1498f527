//! Handle through which the tracker drives the local-mapping thread.
//!
//! The mapping thread body itself is external; it consumes the receiver end
//! of the keyframe queue and flips the shared flags. There should be a single
//! call to [`local_mapper_channel`] in the app, after which the handle is
//! cloned into the tracker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::warn;

use crate::map::KeyFrameHandle;

#[derive(Debug)]
struct Flags {
    accept_keyframes: AtomicBool,
    stopped: AtomicBool,
    stop_requested: AtomicBool,
    not_stop: AtomicBool,
    abort_ba: AtomicBool,
    reset_requested: AtomicBool,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            accept_keyframes: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            not_stop: AtomicBool::new(false),
            abort_ba: AtomicBool::new(false),
            reset_requested: AtomicBool::new(false),
        }
    }
}

/// Create the keyframe queue and its shared control flags.
pub fn local_mapper_channel() -> (LocalMapperHandle, Receiver<KeyFrameHandle>) {
    let (tx, rx) = unbounded();
    (
        LocalMapperHandle {
            tx,
            flags: Arc::new(Flags::default()),
        },
        rx,
    )
}

#[derive(Debug, Clone)]
pub struct LocalMapperHandle {
    tx: Sender<KeyFrameHandle>,
    flags: Arc<Flags>,
}

impl LocalMapperHandle {
    /// Submit a keyframe. Submission order is tracking order.
    pub fn insert_keyframe(&self, kf: KeyFrameHandle) {
        if self.tx.send(kf).is_err() {
            warn!("local mapper queue is closed, dropping keyframe");
        }
    }

    pub fn keyframes_in_queue(&self) -> usize {
        self.tx.len()
    }

    /// Whether the mapper is idle and ready for more keyframes.
    pub fn accept_keyframes(&self) -> bool {
        self.flags.accept_keyframes.load(Ordering::SeqCst)
    }

    /// Mapper side: signal idleness.
    pub fn set_accept_keyframes(&self, v: bool) {
        self.flags.accept_keyframes.store(v, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flags.stopped.load(Ordering::SeqCst)
    }

    /// Mapper side: report the stopped state.
    pub fn set_stopped(&self, v: bool) {
        self.flags.stopped.store(v, Ordering::SeqCst);
        if !v {
            self.flags.stop_requested.store(false, Ordering::SeqCst);
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.flags.stop_requested.load(Ordering::SeqCst)
    }

    /// Ask the mapper to stop at its next opportunity. Refused while a
    /// keyframe insertion is in flight (`set_not_stop(true)` is held).
    pub fn request_stop(&self) -> bool {
        if self.flags.not_stop.load(Ordering::SeqCst) {
            return false;
        }
        self.flags.stop_requested.store(true, Ordering::SeqCst);
        true
    }

    /// Ask the mapper to break out of its current bundle adjustment.
    pub fn interrupt_ba(&self) {
        self.flags.abort_ba.store(true, Ordering::SeqCst);
    }

    /// Mapper side: poll-and-clear the BA interrupt.
    pub fn take_ba_interrupt(&self) -> bool {
        self.flags.abort_ba.swap(false, Ordering::SeqCst)
    }

    /// Guard keyframe insertion against a concurrent stop. Returns false if
    /// a stop was already requested; the caller must then skip keyframe
    /// creation.
    pub fn set_not_stop(&self, v: bool) -> bool {
        if v && self.stop_requested() {
            return false;
        }
        self.flags.not_stop.store(v, Ordering::SeqCst);
        true
    }

    pub fn request_reset(&self) {
        self.flags.reset_requested.store(true, Ordering::SeqCst);
    }

    /// Mapper side: poll-and-clear the reset request.
    pub fn take_reset_request(&self) -> bool {
        self.flags.reset_requested.swap(false, Ordering::SeqCst)
    }
}
