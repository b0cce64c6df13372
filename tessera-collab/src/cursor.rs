//! Outbound local cursor with debouncing and duplicate suppression.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tessera_core::{ClientIdentity, CursorPosition, Debouncer};

use crate::protocol::{CursorMessage, TransportError};

/// Cursor broadcaster settings.
#[derive(Debug, Clone)]
pub struct CursorConfig {
    /// Quiet period before a position is sent.
    pub debounce: Duration,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
        }
    }
}

/// Outbound side of the cursor channel.
pub trait CursorTransport: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    /// Hand a frame to the socket without waiting.
    fn send(&self, msg: CursorMessage) -> Result<(), TransportError>;
}

impl<T: CursorTransport + ?Sized> CursorTransport for Arc<T> {
    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn send(&self, msg: CursorMessage) -> Result<(), TransportError> {
        (**self).send(msg)
    }
}

struct Outbound<T> {
    transport: T,
    identity: ClientIdentity,
    last_sent: Option<CursorPosition>,
    generation: u64,
}

impl<T: CursorTransport> Outbound<T> {
    fn flush(&mut self, position: CursorPosition, generation: u64) {
        if generation != self.generation {
            log::trace!("Discarding stale cursor flush {generation}");
            return;
        }
        if !self.transport.is_open() || self.last_sent == Some(position) {
            return;
        }

        let msg = CursorMessage::position(
            self.identity.client_id.clone(),
            position,
            self.identity.info.clone(),
        );
        match self.transport.send(msg) {
            Ok(()) => self.last_sent = Some(position),
            Err(e) => log::debug!("Cursor update not sent: {e}"),
        }
    }
}

/// Publishes the local caret on the cursor channel.
///
/// Positions are coalesced over [`CursorConfig::debounce`]; the survivor of a
/// burst is sent only if the transport is open and it differs from the last
/// position actually sent.
pub struct CursorBroadcaster<T: CursorTransport> {
    outbound: Arc<Mutex<Outbound<T>>>,
    debouncer: Debouncer,
}

impl<T: CursorTransport> CursorBroadcaster<T> {
    pub fn new(transport: T, identity: ClientIdentity, config: CursorConfig) -> Self {
        Self {
            outbound: Arc::new(Mutex::new(Outbound {
                transport,
                identity,
                last_sent: None,
                generation: 0,
            })),
            debouncer: Debouncer::new(config.debounce),
        }
    }

    /// Schedule `position` for sending. Must be called inside a tokio runtime.
    pub fn broadcast_position(&mut self, position: CursorPosition) {
        let outbound = self.outbound.clone();
        self.debouncer.trigger(|generation| {
            lock(&outbound).generation = generation;
            async move {
                lock(&outbound).flush(position, generation);
            }
        });
    }

    /// Change the display name used by later messages.
    ///
    /// The next position is sent even if it equals the last one, so peers
    /// pick up the new name.
    pub fn rename(&self, name: &str) {
        let mut outbound = lock(&self.outbound);
        outbound.identity.rename(name);
        outbound.last_sent = None;
    }

    /// Drop any pending update and forget the last sent position, e.g. after
    /// the socket reconnects.
    pub fn reset(&mut self) {
        self.debouncer.cancel();
        let mut outbound = lock(&self.outbound);
        outbound.generation = outbound.generation.wrapping_add(1);
        outbound.last_sent = None;
    }

    /// Cancel any pending update and announce removal if the transport is open.
    pub fn teardown(&mut self) {
        self.debouncer.cancel();
        let mut outbound = lock(&self.outbound);
        outbound.generation = outbound.generation.wrapping_add(1);
        if !outbound.transport.is_open() {
            return;
        }
        let msg = CursorMessage::remove(outbound.identity.client_id.clone());
        if let Err(e) = outbound.transport.send(msg) {
            log::debug!("Cursor removal not sent: {e}");
        }
        outbound.last_sent = None;
    }

    pub fn identity(&self) -> ClientIdentity {
        lock(&self.outbound).identity.clone()
    }

    pub fn last_sent(&self) -> Option<CursorPosition> {
        lock(&self.outbound).last_sent
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tessera_core::ClientId;

    #[derive(Default)]
    struct Recorder {
        closed: AtomicBool,
        sent: Mutex<Vec<CursorMessage>>,
    }

    impl Recorder {
        fn sent(&self) -> Vec<CursorMessage> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl CursorTransport for Recorder {
        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::SeqCst)
        }

        fn send(&self, msg: CursorMessage) -> Result<(), TransportError> {
            if !self.is_open() {
                return Err(TransportError::Closed);
            }
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }

    fn broadcaster() -> (Arc<Recorder>, CursorBroadcaster<Arc<Recorder>>) {
        let recorder = Arc::new(Recorder::default());
        let identity = ClientIdentity::new(
            ClientId::new("me"),
            tessera_core::ClientInfo::new("Me", "#45B7D1"),
        );
        let b = CursorBroadcaster::new(recorder.clone(), identity, CursorConfig::default());
        (recorder, b)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_sends_last_position_once() {
        let (recorder, mut b) = broadcaster();
        for offset in 0..5 {
            b.broadcast_position(CursorPosition::new(0, offset));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tokio::time::sleep(Duration::from_millis(60)).await;

        let sent = recorder.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].position, Some(CursorPosition::new(0, 4)));
        assert_eq!(b.last_sent(), Some(CursorPosition::new(0, 4)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_position_not_resent() {
        let (recorder, mut b) = broadcaster();
        b.broadcast_position(CursorPosition::new(1, 1));
        tokio::time::sleep(Duration::from_millis(60)).await;
        b.broadcast_position(CursorPosition::new(1, 1));
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(recorder.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_transport_skips_and_keeps_last_sent() {
        let (recorder, mut b) = broadcaster();
        recorder.closed.store(true, Ordering::SeqCst);
        b.broadcast_position(CursorPosition::new(2, 0));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(recorder.sent().is_empty());
        assert_eq!(b.last_sent(), None);

        recorder.closed.store(false, Ordering::SeqCst);
        b.broadcast_position(CursorPosition::new(2, 0));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(recorder.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rename_forces_next_send() {
        let (recorder, mut b) = broadcaster();
        b.broadcast_position(CursorPosition::new(0, 0));
        tokio::time::sleep(Duration::from_millis(60)).await;

        b.rename("A name that is far too long");
        b.broadcast_position(CursorPosition::new(0, 0));
        tokio::time::sleep(Duration::from_millis(60)).await;

        let sent = recorder.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].client_info.as_ref().unwrap().name, "A name that is far t");
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_pending_and_forgets_last_sent() {
        let (recorder, mut b) = broadcaster();
        b.broadcast_position(CursorPosition::new(1, 2));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(b.last_sent(), Some(CursorPosition::new(1, 2)));

        b.broadcast_position(CursorPosition::new(4, 0));
        b.reset();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.sent().len(), 1);
        assert_eq!(b.last_sent(), None);

        b.broadcast_position(CursorPosition::new(1, 2));
        tokio::time::sleep(Duration::from_millis(60)).await;
        let sent = recorder.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].position, Some(CursorPosition::new(1, 2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_cancels_and_removes() {
        let (recorder, mut b) = broadcaster();
        b.broadcast_position(CursorPosition::new(3, 3));
        b.teardown();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let sent = recorder.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_remove());
        assert_eq!(sent[0].client_id, ClientId::new("me"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_on_closed_transport_sends_nothing() {
        let (recorder, mut b) = broadcaster();
        recorder.closed.store(true, Ordering::SeqCst);
        b.teardown();
        assert!(recorder.sent().is_empty());
    }
}
