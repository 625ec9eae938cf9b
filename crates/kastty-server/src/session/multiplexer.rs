//! Session multiplexer: one terminal process, any number of viewers.
//!
//! Every output chunk is appended to the replay buffer and fanned out to
//! the connected viewers under a single lock, so a viewer's snapshot and
//! the live chunks it receives afterwards never overlap or leave a gap.

use super::pty::{ProcessHandle, ProcessSpawner, ProcessSpec, SpawnedProcess};
use super::replay_buffer::ReplayBuffer;
use kastty_core::{KasttyError, KasttyResult, ServerMessage};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// How long to keep draining output after the process has exited.
const EXIT_DRAIN_GRACE: Duration = Duration::from_millis(200);

pub type ViewerId = u64;

/// Why a frame could not be handed to a viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerError {
    /// The viewer's transport is gone.
    Closed,
    /// The viewer's outbound queue is full.
    Lagging,
}

/// A connected party receiving session output.
///
/// Implementations must not block: they are called with the session lock held.
pub trait Viewer: Send + Sync {
    /// Deliver a chunk of terminal output.
    fn send(&self, data: &[u8]) -> Result<(), ViewerError>;

    /// Deliver a control message. Viewers without a control channel ignore it.
    fn send_control(&self, message: &ServerMessage) -> Result<(), ViewerError> {
        let _ = message;
        Ok(())
    }

    /// Ask the viewer's transport to shut down after flushing what is queued.
    fn close(&self) {}
}

/// Result of [`SessionMultiplexer::connect`].
#[derive(Debug, Clone)]
pub struct Attachment {
    pub id: ViewerId,
    /// Replay buffer contents at the moment of connection.
    pub replay: Vec<u8>,
    /// Readonly flag at the moment of connection.
    pub readonly: bool,
}

struct SessionState {
    readonly: bool,
    replay: ReplayBuffer,
    viewers: Vec<(ViewerId, Arc<dyn Viewer>)>,
    next_viewer_id: ViewerId,
}

type ExitCallback = Box<dyn FnOnce(i32) + Send>;

#[derive(Default)]
struct ExitState {
    code: Option<i32>,
    callbacks: Vec<ExitCallback>,
}

/// Coordinates one terminal process with its viewers.
pub struct SessionMultiplexer {
    state: Mutex<SessionState>,
    exit: Mutex<ExitState>,
    process: OnceLock<Arc<dyn ProcessHandle>>,
    /// `None` means unlimited.
    max_viewers: Option<usize>,
}

impl SessionMultiplexer {
    /// Create a session with the given replay capacity and viewer limit.
    pub fn new(replay_capacity: usize, max_viewers: Option<usize>) -> Self {
        Self {
            state: Mutex::new(SessionState {
                readonly: false,
                replay: ReplayBuffer::new(replay_capacity),
                viewers: Vec::new(),
                next_viewer_id: 1,
            }),
            exit: Mutex::new(ExitState::default()),
            process: OnceLock::new(),
            max_viewers,
        }
    }

    /// Spawn the process and start pumping its output. Call once.
    pub fn start(self: &Arc<Self>, spawner: &dyn ProcessSpawner, spec: &ProcessSpec) -> KasttyResult<()> {
        if self.process.get().is_some() {
            return Err(KasttyError::Other("session already started".into()));
        }

        let SpawnedProcess { handle, output, exit } = spawner.spawn(spec)?;
        self.process
            .set(handle)
            .map_err(|_| KasttyError::Other("session already started".into()))?;

        let session = Arc::clone(self);
        tokio::spawn(async move { session.drive(output, exit).await });

        let replay_capacity = self.state().replay.capacity();
        info!(command = %spec.command, args = ?spec.args, replay_capacity, "session started");
        Ok(())
    }

    /// Register a viewer and return the history it missed.
    pub fn connect(&self, viewer: Arc<dyn Viewer>) -> KasttyResult<Attachment> {
        let mut state = self.state();
        if let Some(max) = self.max_viewers {
            if state.viewers.len() >= max {
                warn!(max, "rejecting viewer: limit reached");
                return Err(KasttyError::ViewerLimit(max));
            }
        }

        let id = state.next_viewer_id;
        state.next_viewer_id += 1;
        state.viewers.push((id, viewer));

        let replay = state.replay.contents();
        info!(
            viewer = id,
            viewers = state.viewers.len(),
            replay_bytes = state.replay.len(),
            "viewer connected"
        );
        Ok(Attachment {
            id,
            replay,
            readonly: state.readonly,
        })
    }

    /// Remove a viewer. Unknown or already-removed ids are ignored.
    pub fn disconnect(&self, id: ViewerId) {
        let mut state = self.state();
        let before = state.viewers.len();
        state.viewers.retain(|(vid, _)| *vid != id);
        if state.viewers.len() != before {
            info!(viewer = id, viewers = state.viewers.len(), "viewer disconnected");
        }
    }

    /// Forward input to the process unless the session is readonly.
    pub fn write(&self, data: &[u8]) {
        let state = self.state();
        if state.readonly {
            debug!(bytes = data.len(), "dropping input: session is readonly");
            return;
        }
        match self.process.get() {
            Some(process) => {
                if let Err(e) = process.write(data) {
                    warn!(error = %e, "failed to forward input");
                }
            }
            None => debug!("dropping input: session not started"),
        }
    }

    /// Resize the process's terminal. Allowed in readonly mode.
    pub fn resize(&self, cols: u16, rows: u16) {
        let Some(process) = self.process.get() else {
            debug!(cols, rows, "ignoring resize: session not started");
            return;
        };
        if let Err(e) = process.resize(cols, rows) {
            warn!(error = %e, cols, rows, "failed to resize terminal");
        }
    }

    /// Switch readonly mode; connected viewers are told when it changes.
    pub fn set_readonly(&self, enabled: bool) {
        let mut state = self.state();
        if state.readonly == enabled {
            return;
        }
        state.readonly = enabled;
        info!(readonly = enabled, "readonly mode changed");
        Self::fan_out(&mut state, |viewer| {
            viewer.send_control(&ServerMessage::ReadonlyNotice { enabled })
        });
    }

    pub fn is_readonly(&self) -> bool {
        self.state().readonly
    }

    pub fn viewer_count(&self) -> usize {
        self.state().viewers.len()
    }

    /// Send a control message to every connected viewer.
    pub fn broadcast_control(&self, message: &ServerMessage) {
        let mut state = self.state();
        debug!(kind = message.kind(), viewers = state.viewers.len(), "broadcasting control message");
        Self::fan_out(&mut state, |viewer| viewer.send_control(message));
    }

    /// Disconnect and close every viewer. Returns how many there were.
    pub fn close_all(&self) -> usize {
        let viewers = std::mem::take(&mut self.state().viewers);
        for (_, viewer) in &viewers {
            viewer.close();
        }
        viewers.len()
    }

    /// Register a callback for the process's exit code.
    ///
    /// Each callback runs exactly once, in registration order. A callback
    /// registered after the exit runs immediately.
    pub fn on_exit<F>(&self, callback: F)
    where
        F: FnOnce(i32) + Send + 'static,
    {
        let mut exit = self.exit.lock().unwrap_or_else(PoisonError::into_inner);
        match exit.code {
            Some(code) => {
                drop(exit);
                callback(code);
            }
            None => exit.callbacks.push(Box::new(callback)),
        }
    }

    /// Kill the process. Safe to call repeatedly or after it exited.
    pub fn destroy(&self) {
        let Some(process) = self.process.get() else {
            return;
        };
        if let Err(e) = process.kill() {
            debug!(error = %e, "kill failed (process may have exited already)");
        } else {
            info!("session process killed");
        }
    }

    async fn drive(self: Arc<Self>, mut output: mpsc::Receiver<Vec<u8>>, mut exit: oneshot::Receiver<i32>) {
        let code = loop {
            tokio::select! {
                biased;
                chunk = output.recv() => match chunk {
                    Some(chunk) => self.handle_output(&chunk),
                    None => break (&mut exit).await.unwrap_or(-1),
                },
                code = &mut exit => {
                    let _ = tokio::time::timeout(EXIT_DRAIN_GRACE, async {
                        while let Some(chunk) = output.recv().await {
                            self.handle_output(&chunk);
                        }
                    })
                    .await;
                    break code.unwrap_or(-1);
                }
            }
        };
        self.notify_exit(code);
    }

    fn handle_output(&self, chunk: &[u8]) {
        let mut state = self.state();
        state.replay.append(chunk);
        Self::fan_out(&mut state, |viewer| viewer.send(chunk));
    }

    fn notify_exit(&self, code: i32) {
        let callbacks = {
            let mut exit = self.exit.lock().unwrap_or_else(PoisonError::into_inner);
            if exit.code.is_some() {
                return;
            }
            exit.code = Some(code);
            std::mem::take(&mut exit.callbacks)
        };
        let output_bytes = self.state().replay.total_written();
        info!(code, output_bytes, callbacks = callbacks.len(), "session process exited");
        for callback in callbacks {
            callback(code);
        }
    }

    /// Deliver to every viewer in registration order, evicting those that fail.
    fn fan_out<F>(state: &mut SessionState, mut deliver: F)
    where
        F: FnMut(&dyn Viewer) -> Result<(), ViewerError>,
    {
        let mut failed = Vec::new();
        for (id, viewer) in &state.viewers {
            if let Err(e) = deliver(viewer.as_ref()) {
                failed.push((*id, e));
            }
        }

        for (id, err) in failed {
            let Some(pos) = state.viewers.iter().position(|(vid, _)| *vid == id) else {
                continue;
            };
            let (_, viewer) = state.viewers.remove(pos);
            match err {
                ViewerError::Lagging => {
                    warn!(viewer = id, "viewer fell behind, disconnecting");
                    viewer.close();
                }
                ViewerError::Closed => debug!(viewer = id, "viewer went away"),
            }
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeHandle {
        writes: Mutex<Vec<Vec<u8>>>,
        resizes: Mutex<Vec<(u16, u16)>>,
        kills: AtomicUsize,
        exit_tx: Mutex<Option<oneshot::Sender<i32>>>,
    }

    impl FakeHandle {
        fn finish(&self, code: i32) {
            if let Some(tx) = self.exit_tx.lock().unwrap().take() {
                let _ = tx.send(code);
            }
        }

        fn written(&self) -> Vec<u8> {
            self.writes.lock().unwrap().concat()
        }
    }

    impl ProcessHandle for FakeHandle {
        fn write(&self, data: &[u8]) -> KasttyResult<()> {
            self.writes.lock().unwrap().push(data.to_vec());
            Ok(())
        }

        fn resize(&self, cols: u16, rows: u16) -> KasttyResult<()> {
            self.resizes.lock().unwrap().push((cols, rows));
            Ok(())
        }

        fn kill(&self) -> KasttyResult<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            self.finish(137);
            Ok(())
        }
    }

    struct FakeSpawner {
        handle: Arc<FakeHandle>,
        parts: Mutex<Option<(mpsc::Receiver<Vec<u8>>, oneshot::Receiver<i32>)>>,
    }

    impl ProcessSpawner for FakeSpawner {
        fn spawn(&self, _spec: &ProcessSpec) -> KasttyResult<SpawnedProcess> {
            let (output, exit) = self
                .parts
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| KasttyError::Process("already spawned".into()))?;
            Ok(SpawnedProcess {
                handle: self.handle.clone(),
                output,
                exit,
            })
        }
    }

    struct Harness {
        session: Arc<SessionMultiplexer>,
        handle: Arc<FakeHandle>,
        output_tx: mpsc::Sender<Vec<u8>>,
        spawner: FakeSpawner,
    }

    fn harness(capacity: usize, max_viewers: Option<usize>) -> Harness {
        let (output_tx, output_rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = oneshot::channel();
        let handle = Arc::new(FakeHandle::default());
        *handle.exit_tx.lock().unwrap() = Some(exit_tx);
        Harness {
            session: Arc::new(SessionMultiplexer::new(capacity, max_viewers)),
            spawner: FakeSpawner {
                handle: handle.clone(),
                parts: Mutex::new(Some((output_rx, exit_rx))),
            },
            handle,
            output_tx,
        }
    }

    fn spec() -> ProcessSpec {
        ProcessSpec::new("/bin/sh", Vec::new())
    }

    #[derive(Default)]
    struct RecordingViewer {
        data: Mutex<Vec<u8>>,
        controls: Mutex<Vec<ServerMessage>>,
        closed: AtomicBool,
        fail_with: Mutex<Option<ViewerError>>,
    }

    impl RecordingViewer {
        fn received(&self) -> Vec<u8> {
            self.data.lock().unwrap().clone()
        }
    }

    impl Viewer for RecordingViewer {
        fn send(&self, data: &[u8]) -> Result<(), ViewerError> {
            if let Some(err) = *self.fail_with.lock().unwrap() {
                return Err(err);
            }
            self.data.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn send_control(&self, message: &ServerMessage) -> Result<(), ViewerError> {
            self.controls.lock().unwrap().push(message.clone());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn late_viewer_gets_snapshot_then_live_output() {
        let session = SessionMultiplexer::new(1024, None);
        session.handle_output(b"hello ");
        session.handle_output(b"world");

        let viewer = Arc::new(RecordingViewer::default());
        let attachment = session.connect(viewer.clone()).unwrap();
        assert_eq!(attachment.replay, b"hello world");
        assert!(!attachment.readonly);
        assert!(viewer.received().is_empty());

        session.handle_output(b"!");
        session.handle_output(b"\r\n$ ");
        assert_eq!(viewer.received(), b"!\r\n$ ");
    }

    #[test]
    fn viewers_get_identical_broadcasts_and_independent_snapshots() {
        let session = SessionMultiplexer::new(1024, None);
        let first = Arc::new(RecordingViewer::default());
        let second = Arc::new(RecordingViewer::default());

        let a = session.connect(first.clone()).unwrap();
        session.handle_output(b"one");
        let b = session.connect(second.clone()).unwrap();
        session.handle_output(b"two");

        assert!(a.replay.is_empty());
        assert_eq!(b.replay, b"one");
        assert_eq!(first.received(), b"onetwo");
        assert_eq!(second.received(), b"two");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn disconnect_is_idempotent_and_reconnect_sees_history() {
        let session = SessionMultiplexer::new(1024, None);
        let viewer = Arc::new(RecordingViewer::default());
        let attachment = session.connect(viewer.clone()).unwrap();
        session.handle_output(b"abc");

        session.disconnect(attachment.id);
        session.disconnect(attachment.id);
        assert_eq!(session.viewer_count(), 0);

        session.handle_output(b"def");
        assert_eq!(viewer.received(), b"abc");

        let next = session.connect(Arc::new(RecordingViewer::default())).unwrap();
        assert_eq!(next.replay, b"abcdef");
    }

    #[test]
    fn failed_viewer_does_not_block_others() {
        let session = SessionMultiplexer::new(1024, None);
        let broken = Arc::new(RecordingViewer::default());
        *broken.fail_with.lock().unwrap() = Some(ViewerError::Closed);
        let healthy = Arc::new(RecordingViewer::default());

        session.connect(broken.clone()).unwrap();
        session.connect(healthy.clone()).unwrap();
        session.handle_output(b"data");

        assert_eq!(healthy.received(), b"data");
        assert_eq!(session.viewer_count(), 1);
        assert!(!broken.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn lagging_viewer_is_evicted_and_closed() {
        let session = SessionMultiplexer::new(1024, None);
        let slow = Arc::new(RecordingViewer::default());
        *slow.fail_with.lock().unwrap() = Some(ViewerError::Lagging);

        session.connect(slow.clone()).unwrap();
        session.handle_output(b"data");

        assert_eq!(session.viewer_count(), 0);
        assert!(slow.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn viewer_limit_is_enforced() {
        let session = SessionMultiplexer::new(1024, Some(1));
        let first = session.connect(Arc::new(RecordingViewer::default())).unwrap();
        assert!(matches!(
            session.connect(Arc::new(RecordingViewer::default())),
            Err(KasttyError::ViewerLimit(1))
        ));
        session.disconnect(first.id);
        assert!(session.connect(Arc::new(RecordingViewer::default())).is_ok());
    }

    #[test]
    fn replay_keeps_most_recent_bytes() {
        let session = SessionMultiplexer::new(8, None);
        session.handle_output(&[1, 2, 3, 4, 5, 6, 7, 8]);
        session.handle_output(&[9, 10, 11]);
        let attachment = session.connect(Arc::new(RecordingViewer::default())).unwrap();
        assert_eq!(attachment.replay, vec![4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[tokio::test]
    async fn readonly_gates_writes_but_not_resize() {
        let h = harness(1024, None);
        h.session.start(&h.spawner, &spec()).unwrap();

        h.session.set_readonly(true);
        assert!(h.session.is_readonly());
        h.session.write(b"ls\n");
        h.session.resize(120, 40);
        assert!(h.handle.written().is_empty());
        assert_eq!(*h.handle.resizes.lock().unwrap(), vec![(120, 40)]);

        h.session.set_readonly(false);
        h.session.write(b"ls\n");
        assert_eq!(h.handle.written(), b"ls\n");
    }

    #[test]
    fn readonly_change_is_announced_once() {
        let session = SessionMultiplexer::new(1024, None);
        let viewer = Arc::new(RecordingViewer::default());
        session.connect(viewer.clone()).unwrap();

        session.set_readonly(true);
        session.set_readonly(true);
        session.set_readonly(false);

        assert_eq!(
            *viewer.controls.lock().unwrap(),
            vec![
                ServerMessage::ReadonlyNotice { enabled: true },
                ServerMessage::ReadonlyNotice { enabled: false },
            ]
        );

        let attachment = session.connect(Arc::new(RecordingViewer::default())).unwrap();
        assert!(!attachment.readonly);
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let h = harness(1024, None);
        h.session.start(&h.spawner, &spec()).unwrap();
        assert!(h.session.start(&h.spawner, &spec()).is_err());
    }

    #[tokio::test]
    async fn process_output_reaches_viewers() {
        let h = harness(1024, None);
        let viewer = Arc::new(RecordingViewer::default());
        h.session.connect(viewer.clone()).unwrap();
        h.session.start(&h.spawner, &spec()).unwrap();

        let (done_tx, done_rx) = oneshot::channel();
        h.session.on_exit(move |code| {
            let _ = done_tx.send(code);
        });

        h.output_tx.send(b"first ".to_vec()).await.unwrap();
        h.output_tx.send(b"second".to_vec()).await.unwrap();
        drop(h.output_tx);
        h.handle.finish(0);

        assert_eq!(done_rx.await.unwrap(), 0);
        assert_eq!(viewer.received(), b"first second");
    }

    #[tokio::test]
    async fn exit_callbacks_run_once_in_order() {
        let h = harness(1024, None);
        h.session.start(&h.spawner, &spec()).unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel();
        for i in 0..3 {
            let order = order.clone();
            h.session.on_exit(move |code| order.lock().unwrap().push((i, code)));
        }
        h.session.on_exit(move |code| {
            let _ = done_tx.send(code);
        });

        // A forced kill racing a natural exit resolves once.
        h.session.destroy();
        h.session.destroy();
        h.handle.finish(0);

        assert_eq!(done_rx.await.unwrap(), 137);
        h.session.notify_exit(1);
        assert_eq!(*order.lock().unwrap(), vec![(0, 137), (1, 137), (2, 137)]);
        assert_eq!(h.handle.kills.load(Ordering::SeqCst), 2);

        let late = Arc::new(Mutex::new(None));
        let late_clone = late.clone();
        h.session.on_exit(move |code| *late_clone.lock().unwrap() = Some(code));
        assert_eq!(*late.lock().unwrap(), Some(137));
    }

    #[test]
    fn destroy_before_start_is_noop() {
        let session = SessionMultiplexer::new(16, None);
        session.destroy();
        session.write(b"ignored");
        session.resize(10, 10);
    }

    #[test]
    fn close_all_closes_every_viewer() {
        let session = SessionMultiplexer::new(16, None);
        let a = Arc::new(RecordingViewer::default());
        let b = Arc::new(RecordingViewer::default());
        session.connect(a.clone()).unwrap();
        session.connect(b.clone()).unwrap();

        session.broadcast_control(&ServerMessage::Exit { code: 2 });
        assert_eq!(session.close_all(), 2);

        assert_eq!(session.viewer_count(), 0);
        for viewer in [a, b] {
            assert!(viewer.closed.load(Ordering::SeqCst));
            assert_eq!(*viewer.controls.lock().unwrap(), vec![ServerMessage::Exit { code: 2 }]);
        }
    }
}
