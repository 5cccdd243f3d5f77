pub mod json;
pub mod plain;

pub use json::output_json;
pub use plain::{output_event_plain, output_plain};
