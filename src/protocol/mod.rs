//! The RFC 1035 message format, restricted to what a forwarding
//! server needs: the header, questions, and records it either
//! builds itself or must understand to validate an upstream reply.

pub mod deserialise;
pub mod serialise;
pub mod types;
