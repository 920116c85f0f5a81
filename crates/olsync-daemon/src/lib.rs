//! olsync-daemon library: native implementations of the engine's seams.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod http;
pub mod ignore;
pub mod native_fs;
pub mod persistence;
pub mod prompt;
pub mod socket;
pub mod watcher;

// Re-export key types for convenience
pub use config::{DaemonConfig, expand_tilde};
pub use http::HttpApi;
pub use ignore::DefaultIgnore;
pub use native_fs::NativeFs;
pub use persistence::{PersistedState, StateStorage};
pub use prompt::TerminalResolver;
pub use socket::{SocketIoConnector, SocketSession};
pub use watcher::FileWatcher;
