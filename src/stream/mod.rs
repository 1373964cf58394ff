//! Persistent streaming connections to message relay servers.
//!
//! Every configured endpoint is either 'down' (resolving, waiting for a retry, connecting or
//!  handshaking) or 'up'. A connection thread drives down endpoints until they are up, an I/O
//!  thread moves data for up endpoints and demotes them when their connection fails, and a
//!  dispatch thread hands received messages to listeners.

pub mod connection_manager;
pub mod context;
pub mod dispatch;
pub mod endpoint;
pub mod framer;
pub mod io_manager;
pub mod listener;
pub mod manager;
pub mod negotiation;
pub mod resolver;
pub mod rx_buffer;
pub mod selector;
pub mod state;
pub mod transport;
pub mod tx_queue;
