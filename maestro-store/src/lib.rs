//! ABOUTME: Shared store abstraction for maestro
//! ABOUTME: StoreBackend trait, in-memory backend, and degrading SharedStore wrapper

pub mod backend;
pub mod keys;
pub mod memory;
pub mod shared;

pub use backend::StoreBackend;
pub use memory::MemoryBackend;
pub use shared::SharedStore;
