//! corelend-worker — supervision of the external compute worker.
//!
//! # Architecture
//!
//! ```text
//! WorkerSupervisor (handle, Clone)
//!   │  mpsc<Command> ──▶ SupervisorTask ──▶ watch<WorkerState>
//!   │                      ├── WorkerProcess  (spawn, output readers, terminate)
//!   │                      ├── dyn ControlChannel
//!   │                      │     ├── SocketChannel  (control port, prompt framed)
//!   │                      │     └── FileChannel    (config rewrite + restart)
//!   │                      └── FileChannel fallback
//!   └── is_shutting_down() ◀── AtomicBool shared with the task
//! ```
//!
//! Every operation reports failure as `false` and logs the cause. Nothing
//! on the control path panics or tears down the supervisor.

pub mod artifact;
pub mod channel;
pub mod error;
pub mod process;
pub mod protocol;
pub mod supervisor;

pub use artifact::WorkerArtifact;
pub use channel::{ControlChannel, FileChannel, SocketChannel};
pub use error::{ChannelError, WorkerError, WorkerResult};
pub use process::{Liveness, WorkerProcess};
pub use protocol::{ControlCommand, read_until_prompt};
pub use supervisor::{WATCH_INTERVAL, WorkerSupervisor, restart_backoff};
