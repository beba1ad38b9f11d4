//! Mesh core: envelopes, payload values, input schemas and trace records.

pub mod clock;
pub mod envelope;
pub mod schema;
pub mod trace;
pub mod value;

pub use clock::{round_millis, ClockSource, SystemClock};
pub use envelope::{headers, Envelope, EnvelopeError, STATUS_OK};
pub use schema::{FieldDef, FieldType, InputSchema, Record, SchemaError};
pub use trace::{TraceJournal, TraceRecord};
pub use value::Value;
