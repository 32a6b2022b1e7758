//! Transport adapters translating wire frames into kernel contexts.

pub mod ext_proc;
