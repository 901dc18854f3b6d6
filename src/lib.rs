pub mod config;
pub mod error;
pub mod hash;
pub mod network;
pub mod service;

pub use error::{PeerdropError, Result};
