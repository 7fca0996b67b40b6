//! Message structure

use crate::types::PortId;
use crate::vm::value::Value;

/// A message in flight. The three fields are the wire format; there is no
/// malformed shape to reject once one of these exists.
#[derive(Debug, Clone)]
pub struct Message {
    /// Destination: a port or a native handler id.
    pub remote: PortId,
    /// Reply port, `PortId::NULL` when the sender expects no answer.
    pub reply: PortId,
    /// Opaque payload; whatever the sender's VM pushed.
    pub payload: Value,
}

impl Message {
    pub fn new(remote: PortId, reply: PortId, payload: Value) -> Self {
        Self {
            remote,
            reply,
            payload,
        }
    }
}
