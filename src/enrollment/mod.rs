//! Certificate enrollment: obtains a signed client certificate from a server in three steps.
//!  A private key is generated locally, the server's certificate configuration is fetched to
//!  build a CSR, and the server signs the CSR. The result is delivered as password protected
//!  keystores.

pub mod collaborators;
pub mod manager;
pub mod request;
pub mod types;
