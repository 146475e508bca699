pub mod contracts;
pub mod provider;
pub mod rpc_pool;

pub use rpc_pool::{ChainReadError, RpcPool};
