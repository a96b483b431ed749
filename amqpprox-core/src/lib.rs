//! Small cross-cutting utilities shared by every layer of the proxy: the
//! prelude re-exports, process-unique id generation, and the handful of
//! time/size constants the wire format and buffer pool agree on.

pub mod ids;
pub mod prelude;

pub use ids::SessionId;
