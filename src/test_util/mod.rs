//! Scripted stand-ins for the network facing collaborators of the streaming manager. They are
//!  used for testing the connection lifecycle without sockets, and they are exported for
//!  application testing as well.
//!
//! This is regular code rather than `#[cfg(test)]` so that applications can drive a streaming
//!  manager against the fakes in their own tests.

pub mod transport;
