//! Database pool, patch records, and document collections

pub mod docstore;
pub mod init;
pub mod patches;

pub use docstore::*;
pub use init::*;
pub use patches::*;
