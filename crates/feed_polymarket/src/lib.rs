//! Polymarket CLOB market-channel feed layer: one [`session::WsSession`] per
//! WebSocket connection, sharded across connections by [`pool::SessionPool`].

pub mod pool;
pub mod session;

pub use pool::SessionPool;
pub use session::{backoff_delay_with_jitter, MessageHandler, StateChangeHandler, WsSession};
