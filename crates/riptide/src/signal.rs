use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

/// A 64 slot wake-up bitfield. Any thread raises a bit with an atomic OR;
/// the owning loop drains all pending bits with an atomic swap and runs the
/// bound callbacks.
pub struct SignalBitfield {
    bits: AtomicU64,
    slots: RwLock<Vec<Box<dyn Fn() + Send + Sync>>>,
}

impl Default for SignalBitfield {
    fn default() -> Self {
        SignalBitfield {
            bits: AtomicU64::new(0),
            slots: RwLock::new(Vec::new()),
        }
    }
}

impl SignalBitfield {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a callback, returning its bit index. At most 64 signals.
    pub fn add_signal(&self, callback: impl Fn() + Send + Sync + 'static) -> u32 {
        let mut slots = self.slots.write();
        assert!(slots.len() < 64, "signal bitfield is full");
        slots.push(Box::new(callback));
        (slots.len() - 1) as u32
    }

    pub fn signal(&self, index: u32) {
        self.bits.fetch_or(1 << index, Ordering::AcqRel);
    }

    pub fn is_signaled(&self, index: u32) -> bool {
        self.bits.load(Ordering::Acquire) & (1 << index) != 0
    }

    /// Runs every pending callback. Signals raised while processing are kept
    /// for the next call.
    pub fn process(&self) -> u32 {
        let mut pending = self.bits.swap(0, Ordering::AcqRel);
        if pending == 0 {
            return 0;
        }
        let slots = self.slots.read();
        let mut ran = 0;
        while pending != 0 {
            let index = pending.trailing_zeros();
            pending &= !(1 << index);
            if let Some(slot) = slots.get(index as usize) {
                slot();
                ran += 1;
            }
        }
        ran
    }
}

/// Key a poster uses to identify its callbacks for cancellation.
pub type CallbackKey = usize;

const KEY_NONE: usize = usize::MAX;

/// Inbox of one-shot callbacks posted by other threads, drained by the
/// owning loop once per tick. Cancellation is by key and idempotent;
/// `cancel_and_wait` also spins out an in-flight callback.
pub struct CallbackQueue {
    queue: Mutex<VecDeque<(CallbackKey, Box<dyn FnOnce() + Send>)>>,
    running: AtomicUsize,
}

impl Default for CallbackQueue {
    fn default() -> Self {
        CallbackQueue {
            queue: Mutex::new(VecDeque::new()),
            running: AtomicUsize::new(KEY_NONE),
        }
    }
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, key: CallbackKey, callback: impl FnOnce() + Send + 'static) {
        debug_assert_ne!(key, KEY_NONE);
        self.queue.lock().push_back((key, Box::new(callback)));
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn cancel(&self, key: CallbackKey) {
        self.queue.lock().retain(|(k, _)| *k != key);
    }

    pub fn cancel_and_wait(&self, key: CallbackKey) {
        self.cancel(key);
        while self.running.load(Ordering::Acquire) == key {
            std::hint::spin_loop();
        }
    }

    /// Runs everything queued at entry. Callbacks posted during processing
    /// wait for the next call.
    pub fn process(&self) -> usize {
        let drained: Vec<_> = {
            let mut q = self.queue.lock();
            q.drain(..).collect()
        };
        let count = drained.len();
        for (key, callback) in drained {
            self.running.store(key, Ordering::Release);
            callback();
            self.running.store(KEY_NONE, Ordering::Release);
        }
        count
    }
}
