//! Client-side connection facades (§4.6): a single reconnecting
//! connection, and a pool of them.

pub mod handler;
pub mod pool;
pub mod reconnect;

pub use handler::SingleConnectionHandler;
pub use pool::{Checkout, PooledConnectionHandler};
pub use reconnect::ReconnectPolicy;
