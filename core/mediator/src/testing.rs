//! Test doubles shared by the mediator's unit tests.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use zeroize::Zeroizing;

use crate::codec::{ContainerCodec, KeyedCodec};
use mirrorfs_common::{Error, Result};
use mirrorfs_crypto::KdfParams;

/// Passphrase used by [`CountingCodec`].
pub(crate) const TEST_PASSPHRASE: &[u8] = b"correct horse battery staple";

/// Real codec that counts its calls and can be told to fail encodes.
///
/// Encodes can also be held at a gate, which pins the flushing thread inside
/// the handle lock until the test opens it again.
pub(crate) struct CountingCodec {
    inner: KeyedCodec,
    encodes: AtomicUsize,
    decodes: AtomicUsize,
    fail_encode: AtomicBool,
    gate: Mutex<Gate>,
    gate_changed: Condvar,
}

#[derive(Default)]
struct Gate {
    closed: bool,
    waiting: usize,
}

impl CountingCodec {
    pub(crate) fn new() -> Self {
        let inner = KeyedCodec::from_passphrase(TEST_PASSPHRASE, &KdfParams::insecure_fast())
            .expect("test key derivation");
        Self {
            inner,
            encodes: AtomicUsize::new(0),
            decodes: AtomicUsize::new(0),
            fail_encode: AtomicBool::new(false),
            gate: Mutex::new(Gate::default()),
            gate_changed: Condvar::new(),
        }
    }

    /// The uncounted codec, for seeding and inspecting containers.
    pub(crate) fn inner(&self) -> &KeyedCodec {
        &self.inner
    }

    pub(crate) fn encodes(&self) -> usize {
        self.encodes.load(Ordering::SeqCst)
    }

    pub(crate) fn decodes(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_encodes(&self, fail: bool) {
        self.fail_encode.store(fail, Ordering::SeqCst);
    }

    /// Make every following encode wait until [`Self::open_gate`].
    pub(crate) fn close_gate(&self) {
        self.gate.lock().closed = true;
    }

    pub(crate) fn open_gate(&self) {
        self.gate.lock().closed = false;
        self.gate_changed.notify_all();
    }

    /// Block until `count` encodes are parked at the closed gate.
    pub(crate) fn wait_for_parked(&self, count: usize) {
        let mut gate = self.gate.lock();
        while gate.waiting < count {
            let timed_out = self
                .gate_changed
                .wait_for(&mut gate, Duration::from_secs(10))
                .timed_out();
            assert!(!timed_out, "encode never reached the gate");
        }
    }

    fn pass_gate(&self) {
        let mut gate = self.gate.lock();
        if !gate.closed {
            return;
        }
        gate.waiting += 1;
        self.gate_changed.notify_all();
        while gate.closed {
            self.gate_changed.wait(&mut gate);
        }
        gate.waiting -= 1;
    }
}

impl ContainerCodec for CountingCodec {
    fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.pass_gate();
        if self.fail_encode.load(Ordering::SeqCst) {
            return Err(Error::Crypto("injected encode failure".to_string()));
        }
        self.encodes.fetch_add(1, Ordering::SeqCst);
        self.inner.encode(plaintext)
    }

    fn decode(&self, container: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        self.decodes.fetch_add(1, Ordering::SeqCst);
        self.inner.decode(container)
    }
}
