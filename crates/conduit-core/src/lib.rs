//! Conduit Core Library
//!
//! Shared functionality for the relay and the agent:
//! - JSON-RPC frame model and inbound classification
//! - Transport seam with serialized, deadline-bounded writes
//! - Request/response correlation over any duplex transport
//! - Common error types, shutdown signals and tracing initialisation

pub mod correlator;
pub mod error;
pub mod frame;
pub mod shutdown;
pub mod tracing_init;
pub mod transport;

pub use correlator::RequestCorrelator;
pub use error::{CallError, FrameError, TransportError};
pub use frame::{ControlMessage, Frame, FrameKind, Inbound};
pub use transport::{CloseReason, FrameSink, FrameSource, FrameWriter, Transport};
