//! Query description: rendering values and column references as query text.

pub mod serializer;

pub use serializer::{
    LinkChain, RowRef, SerialisationError, SerialisationState, Timestamp, VALUE_SEPARATOR, Value, print_value,
};
