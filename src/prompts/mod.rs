pub mod botanist;

pub use botanist::{build_messages, build_system_prompt};
