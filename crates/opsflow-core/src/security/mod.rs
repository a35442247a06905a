//! Security utilities: redaction of sensitive tool payload fields and inline secrets.

pub mod redaction;

pub use redaction::{PayloadRedactor, REDACTED_PLACEHOLDER};
