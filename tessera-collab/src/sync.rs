//! Client-side document synchronization.
//!
//! ## Architecture
//!
//! ```text
//! editing surface ──change──► SyncHandle::local_change()
//!                                  │  (dropped unless Idle and loaded)
//!                                  ▼
//!                       SyncClient task ◄── handle_message(remote)
//!                        │ Debouncer (100ms)       │
//!                        ▼                         ▼
//!                 SyncMachine::submit     apply_remote_operation /
//!                  diff(shadow, save)     apply_remote_snapshot
//!                        │                         │
//!                        ▼                         ▼
//!            block_change / document_change   surface mutation
//!                  via DocumentTransport      (phase = ApplyingRemote)
//! ```
//!
//! A single [`PhaseCell`] is shared by the task and every handle. Surface
//! mutations made while applying remote changes fire change notifications;
//! those reach the hook while the phase is `ApplyingRemote` and are dropped,
//! which keeps remote edits from being echoed back as local ones.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tessera_core::{
    adjust_for_operation, diff, Block, BlockOperation, ClientIdentity, CursorPosition, Debouncer, Diff, Document,
};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{DocumentMessage, TransportError};

/// Synchronization settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Quiet period after the last local change before it is submitted.
    pub change_debounce: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            change_debounce: Duration::from_millis(100),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Phase
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncPhase {
    Idle = 0,
    Submitting = 1,
    ApplyingRemote = 2,
}

impl SyncPhase {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Submitting,
            2 => Self::ApplyingRemote,
            _ => Self::Idle,
        }
    }
}

/// Shared holder of the current [`SyncPhase`].
#[derive(Debug, Clone, Default)]
pub struct PhaseCell(Arc<AtomicU8>);

impl PhaseCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> SyncPhase {
        SyncPhase::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_idle(&self) -> bool {
        self.get() == SyncPhase::Idle
    }

    /// Move from `Idle` to `phase`. Fails if another phase is active.
    pub fn try_enter(&self, phase: SyncPhase) -> Option<PhaseGuard> {
        self.0
            .compare_exchange(
                SyncPhase::Idle as u8,
                phase as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| PhaseGuard { cell: self.clone() })
    }
}

/// Restores `Idle` when dropped.
#[derive(Debug)]
pub struct PhaseGuard {
    cell: PhaseCell,
}

impl Drop for PhaseGuard {
    fn drop(&mut self) {
        self.cell.0.store(SyncPhase::Idle as u8, Ordering::Release);
    }
}

// ───────────────────────────────────────────────────────────────────
// Surface and transport seams
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SurfaceError {
    #[error("Block index {0} rejected by surface")]
    IndexRejected(usize),
    #[error("Surface unavailable: {0}")]
    Unavailable(String),
}

/// The rich-text editor as seen by the sync core.
pub trait EditorSurface {
    /// Current content as a document snapshot.
    fn save(&mut self) -> Result<Document, SurfaceError>;

    fn insert_block(&mut self, index: usize, block: &Block) -> Result<(), SurfaceError>;

    fn update_block(&mut self, index: usize, block: &Block) -> Result<(), SurfaceError>;

    fn delete_block(&mut self, index: usize) -> Result<(), SurfaceError>;

    /// Discard the rendered content and render `document` instead.
    fn reload(&mut self, document: &Document) -> Result<(), SurfaceError>;

    /// Local caret, if the surface tracks one.
    fn caret(&self) -> Option<CursorPosition> {
        None
    }

    fn restore_caret(&mut self, _position: CursorPosition) -> Result<(), SurfaceError> {
        Ok(())
    }
}

/// Outbound side of the document channel.
pub trait DocumentTransport: Send + Sync + 'static {
    fn is_open(&self) -> bool;

    /// Hand a frame to the socket without waiting.
    fn send(&self, msg: DocumentMessage) -> Result<(), TransportError>;
}

impl<T: DocumentTransport + ?Sized> DocumentTransport for Arc<T> {
    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn send(&self, msg: DocumentMessage) -> Result<(), TransportError> {
        (**self).send(msg)
    }
}

// ───────────────────────────────────────────────────────────────────
// State machine
// ───────────────────────────────────────────────────────────────────

/// Cheap, cloneable check used by the local-change hook.
#[derive(Debug, Clone, Default)]
pub struct LocalChangeGate {
    phase: PhaseCell,
    loaded: Arc<AtomicBool>,
}

impl LocalChangeGate {
    /// False until a document is loaded, and while any phase is active.
    pub fn accepts(&self) -> bool {
        self.loaded.load(Ordering::Acquire) && self.phase.is_idle()
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase.get()
    }
}

/// Result of applying a remote message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// Another phase was active.
    Ignored,
    /// Applied to the shadow. `changed` is false for out-of-range no-ops.
    Applied { changed: bool },
}

/// A local snapshot turned into outbound changes.
///
/// Holds the `Submitting` phase until dropped, so sends happen inside it.
#[derive(Debug)]
pub struct Submission {
    pub diff: Diff,
    pub snapshot: Document,
    _guard: PhaseGuard,
}

/// Shadow document plus phase. Pure: no I/O, no timers.
#[derive(Debug, Default)]
pub struct SyncMachine {
    shadow: Option<Document>,
    gate: LocalChangeGate,
}

impl SyncMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gate(&self) -> LocalChangeGate {
        self.gate.clone()
    }

    pub fn phase(&self) -> SyncPhase {
        self.gate.phase.get()
    }

    pub fn shadow(&self) -> Option<&Document> {
        self.shadow.as_ref()
    }

    pub fn accepts_local_change(&self) -> bool {
        self.shadow.is_some() && self.gate.phase.is_idle()
    }

    fn set_shadow(&mut self, shadow: Option<Document>) {
        self.gate.loaded.store(shadow.is_some(), Ordering::Release);
        self.shadow = shadow;
    }

    /// Replace the shadow wholesale. `None` waits for the next `document_data`.
    pub fn reset(&mut self, document: Option<Document>) {
        self.set_shadow(document);
    }

    /// Diff `snapshot` against the shadow and advance the shadow to it.
    ///
    /// Returns `None` if another phase is active; the change is coalesced into
    /// a later submission.
    pub fn submit(&mut self, snapshot: Document) -> Option<Submission> {
        let guard = self.gate.phase.try_enter(SyncPhase::Submitting)?;
        let diff = diff(self.shadow.as_ref(), &snapshot);
        self.set_shadow(Some(snapshot.clone()));
        Some(Submission {
            diff,
            snapshot,
            _guard: guard,
        })
    }

    /// Apply a peer's operation to the shadow and mirror it on the surface.
    pub fn apply_remote_operation<S: EditorSurface + ?Sized>(
        &mut self,
        op: &BlockOperation,
        surface: &mut S,
    ) -> RemoteApply {
        // Until `document_data` arrives there is nothing to apply against. The
        // snapshot already contains any operation relayed before it.
        let Some(shadow) = self.shadow.as_mut() else {
            return RemoteApply::Ignored;
        };
        let Some(_guard) = self.gate.phase.try_enter(SyncPhase::ApplyingRemote) else {
            return RemoteApply::Ignored;
        };

        let len_before = shadow.len();
        let caret = surface.caret();

        let changed = shadow.apply(op);
        let block_count = shadow.len();

        let result = match op {
            BlockOperation::Insert { index, block } => surface.insert_block((*index).min(len_before), block),
            BlockOperation::Update { index, block } if *index < len_before => surface.update_block(*index, block),
            BlockOperation::Delete { index } if *index < len_before => surface.delete_block(*index),
            _ => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("Surface rejected remote {} at {}: {e}", op.action(), op.index());
        }

        if let Some(adjusted) = caret.and_then(|c| adjust_for_operation(c, op, block_count)) {
            if let Err(e) = surface.restore_caret(adjusted) {
                log::debug!("Could not restore caret: {e}");
            }
        }

        RemoteApply::Applied { changed }
    }

    /// Adopt a full remote snapshot and re-render the surface from it.
    pub fn apply_remote_snapshot<S: EditorSurface + ?Sized>(
        &mut self,
        document: Document,
        surface: &mut S,
    ) -> RemoteApply {
        let Some(_guard) = self.gate.phase.try_enter(SyncPhase::ApplyingRemote) else {
            return RemoteApply::Ignored;
        };

        let changed = self.shadow.as_ref().map_or(true, |s| !s.same_content(&document));
        if let Err(e) = surface.reload(&document) {
            log::warn!("Surface reload failed: {e}");
        }
        self.set_shadow(Some(document));
        RemoteApply::Applied { changed }
    }
}

// ───────────────────────────────────────────────────────────────────
// Driver task
// ───────────────────────────────────────────────────────────────────

enum SyncInput {
    LocalChange,
    Fire(u64),
    Remote(DocumentMessage),
    Reset,
    Shadow(oneshot::Sender<Option<Document>>),
}

/// Cloneable handle to a running [`SyncClient`]. The task stops once every
/// handle is dropped.
#[derive(Debug, Clone)]
pub struct SyncHandle {
    tx: mpsc::UnboundedSender<SyncInput>,
    gate: LocalChangeGate,
}

impl std::fmt::Debug for SyncInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalChange => f.write_str("LocalChange"),
            Self::Fire(g) => write!(f, "Fire({g})"),
            Self::Remote(m) => write!(f, "Remote({})", m.kind()),
            Self::Reset => f.write_str("Reset"),
            Self::Shadow(_) => f.write_str("Shadow"),
        }
    }
}

impl SyncHandle {
    /// Change notification from the editing surface.
    ///
    /// Safe to call from inside surface callbacks; dropped while a remote
    /// change is being applied or before a document is loaded.
    pub fn local_change(&self) {
        if !self.gate.accepts() {
            log::trace!("Local change ignored in phase {:?}", self.gate.phase());
            return;
        }
        let _ = self.tx.send(SyncInput::LocalChange);
    }

    /// Inbound frame from the document channel.
    pub fn handle_message(&self, msg: DocumentMessage) {
        let _ = self.tx.send(SyncInput::Remote(msg));
    }

    /// Forget the shadow, e.g. when the socket reconnects.
    pub fn reset(&self) {
        let _ = self.tx.send(SyncInput::Reset);
    }

    /// Current shadow document. `None` if not loaded or the task has stopped.
    pub async fn shadow(&self) -> Option<Document> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(SyncInput::Shadow(tx)).ok()?;
        rx.await.ok().flatten()
    }

    pub fn phase(&self) -> SyncPhase {
        self.gate.phase()
    }

    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Event loop that owns the surface, the transport and the [`SyncMachine`].
pub struct SyncClient<S, T> {
    surface: S,
    transport: T,
    identity: ClientIdentity,
    machine: SyncMachine,
    debouncer: Debouncer,
    rx: mpsc::UnboundedReceiver<SyncInput>,
    tx: mpsc::WeakUnboundedSender<SyncInput>,
}

impl<S, T> SyncClient<S, T>
where
    S: EditorSurface + Send + 'static,
    T: DocumentTransport,
{
    /// Start the event loop on the current tokio runtime.
    pub fn spawn(surface: S, transport: T, identity: ClientIdentity, config: SyncConfig) -> SyncHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let machine = SyncMachine::new();
        let handle = SyncHandle {
            tx: tx.clone(),
            gate: machine.gate(),
        };
        let client = Self {
            surface,
            transport,
            identity,
            machine,
            debouncer: Debouncer::new(config.change_debounce),
            rx,
            tx: tx.downgrade(),
        };
        drop(tx);
        tokio::spawn(client.run());
        handle
    }

    async fn run(mut self) {
        log::debug!("Sync client {} started", self.identity.client_id);
        while let Some(input) = self.rx.recv().await {
            match input {
                SyncInput::LocalChange => self.schedule_submit(),
                SyncInput::Fire(generation) => {
                    if self.debouncer.is_current(generation) {
                        self.submit_local();
                    } else {
                        log::trace!("Discarding stale change timer {generation}");
                    }
                }
                SyncInput::Remote(msg) => self.on_remote(msg),
                SyncInput::Reset => {
                    self.debouncer.cancel();
                    self.machine.reset(None);
                }
                SyncInput::Shadow(reply) => {
                    let _ = reply.send(self.machine.shadow().cloned());
                }
            }
        }
        log::debug!("Sync client {} stopped", self.identity.client_id);
    }

    fn schedule_submit(&mut self) {
        let tx = self.tx.clone();
        self.debouncer.trigger(move |generation| async move {
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(SyncInput::Fire(generation));
            }
        });
    }

    fn submit_local(&mut self) {
        if !self.machine.accepts_local_change() {
            return;
        }
        let snapshot = match self.surface.save() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::warn!("Could not save local document: {e}");
                return;
            }
        };
        let Some(submission) = self.machine.submit(snapshot) else {
            return;
        };

        let client_id = Some(self.identity.client_id.clone());
        match submission.diff {
            Diff::Unchanged => {}
            Diff::Operations(ref ops) => {
                log::debug!("Submitting {} block change(s)", ops.len());
                for op in ops {
                    self.send(DocumentMessage::block_change(op.clone(), client_id.clone()));
                }
            }
            Diff::Replace => {
                log::debug!("Submitting full document");
                self.send(DocumentMessage::document_change(
                    submission.snapshot.clone(),
                    client_id,
                ));
            }
        }
    }

    fn send(&self, msg: DocumentMessage) {
        if !self.transport.is_open() {
            log::trace!("Transport closed, skipping {}", msg.kind());
            return;
        }
        if let Err(e) = self.transport.send(msg) {
            log::debug!("Document change not sent: {e}");
        }
    }

    fn on_remote(&mut self, msg: DocumentMessage) {
        if msg.client_id() == Some(&self.identity.client_id) {
            log::trace!("Skipping own {}", msg.kind());
            return;
        }

        let outcome = match msg {
            DocumentMessage::DocumentData { data } => {
                log::debug!("Loaded document with {} block(s)", data.len());
                self.machine.apply_remote_snapshot(data, &mut self.surface)
            }
            DocumentMessage::DocumentChange { data, .. } => {
                self.machine.apply_remote_snapshot(data, &mut self.surface)
            }
            DocumentMessage::BlockChange { change, .. } => {
                self.machine.apply_remote_operation(&change, &mut self.surface)
            }
            DocumentMessage::GetDocument => {
                log::debug!("Ignoring get_document sent to a client");
                return;
            }
        };

        if outcome == RemoteApply::Ignored {
            log::debug!("Remote change ignored in phase {:?}", self.machine.phase());
        }
    }
}
