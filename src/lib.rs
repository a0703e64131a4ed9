//! Schema-driven access-log pipeline.
//!
//! Lines come in from a file (optionally gzipped), a TCP listener, or a
//! redis job queue; each line is tokenized against a user-supplied field
//! schema, transformed into a typed record (with IP enrichment from a
//! memory-mapped interval database), optionally merged into time buckets,
//! and forwarded as newline-delimited JSON over one persistent TCP tunnel.

pub mod aggregate;
pub mod frontend;
pub mod geo;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod schema;
pub mod source;
pub mod transform;
pub mod tunnel;
