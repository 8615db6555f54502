// Install backend abstraction: the external system that actually fetches modules.

pub mod memory;
pub mod traits;
