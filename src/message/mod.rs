//! The application message that travels over streaming connections (a CoT event), its XML and
//!  binary (TAK protobuf) representations, and the transport-internal control messages built on
//!  top of it.

pub mod control;
pub mod cot;
pub mod tak_proto;
pub mod wire;
