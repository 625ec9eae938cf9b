//! Session management: PTY lifecycle, replay buffer, viewer fan-out.

pub mod multiplexer;
pub mod pty;
pub mod replay_buffer;
pub mod title_watch;

pub use multiplexer::{Attachment, SessionMultiplexer, Viewer, ViewerError};
pub use pty::{ProcessSpawner, ProcessSpec, PtySpawner};
pub use replay_buffer::DEFAULT_REPLAY_CAPACITY;
pub use title_watch::TitleWatcher;
