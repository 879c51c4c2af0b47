pub mod id;

pub use id::{parse_prefixed, prefixed_ulid};
