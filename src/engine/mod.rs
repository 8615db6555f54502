// Engine orchestration: session tracking, confirmation and install bookkeeping.

pub mod confirmation;
pub mod installed;
pub mod manager;
pub mod policy;
pub mod registry;
pub mod session;
pub mod stats;
pub mod updates;
