//! Bidirectional RPC over a single framed byte stream.
//!
//! Both sides issue calls on the same connection. Our calls are correlated
//! to their replies by id through the pending-call table; the peer's calls
//! are routed to procedures in the local registry and answered from freshly
//! spawned tasks.
//!
//! Submodules:
//! - `framing`: `0x04`-delimited frame codec.
//! - `transport`: locked frame writer and single-consumer frame reader.
//! - `envelope`: JSON call/reply shapes.
//! - `pending`: outstanding-call table and [`CallOutcome`].
//! - `procedure`: the [`Procedure`] trait and [`CallContext`].
//! - `registry`: local procedure table and [`ProcedureSpec`].
//! - `dispatcher`: inbound routing and handler invocation.
//! - `connection`: [`Connection`], the receiver loop, and the registration protocol.

pub mod connection;
pub mod dispatcher;
pub mod envelope;
pub mod framing;
pub mod pending;
pub mod procedure;
pub mod registry;
pub mod transport;

pub use connection::{Connection, ConnectionOptions, NameStatus};
pub use pending::CallOutcome;
pub use procedure::{handler, CallContext, Handler, Procedure, ProcedureOutput};
pub use registry::ProcedureSpec;
