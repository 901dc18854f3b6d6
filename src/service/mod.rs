pub mod daemon;

pub use daemon::{PeerDaemon, ServerDaemon};
