pub mod broker;
pub mod bundler;
pub mod chain;
pub mod codec;
pub mod config;
pub mod delegation;
pub mod encoding;
pub mod error;
pub mod jsonrpc;
pub mod paymaster;
pub mod pending;
pub mod permissions;
pub mod pipeline;
pub mod server;
pub mod signer;
pub mod storage;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use broker::Broker;
pub use error::{WalletError, WalletResult};
