pub mod client;
pub mod receiver;
pub mod registry;
pub mod server;
pub mod wire;

pub use client::PeerClient;
pub use receiver::PeerReceiver;
pub use registry::PeerRegistry;
pub use server::RendezvousServer;
