//! DPI bypass
//!
//! Recognizes the TLS ClientHello at the start of a flow and, for server
//! names that meet the bypass criteria, re-emits it as a fragmented stream.

mod decision;
mod engine;
pub mod tls;
mod transform;

pub use decision::{BypassDecision, DecisionCache};
pub use engine::{BypassReason, BypassReport, DpiEngine, DpiState, FlowInspector, InspectOutcome};
pub use tls::{build_client_hello, parse_client_hello, ClientHello, Parse, ServerName};
pub use transform::{build_segments, TransformError, TransformOptions};
