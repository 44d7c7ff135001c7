//! Pack pool operations: generating sealed pairs from templates, assigning
//! a pair to a new room, and the single-file sealing tools.

pub mod assign;
pub mod config;
pub mod error;
mod files;
pub mod generate;
pub mod pool;
pub mod seal_file;

#[cfg(test)]
mod test_support;

pub use assign::{assign, assign_with, AssignOutcome};
pub use config::{PackConfig, Secret, DEFAULT_PASSWORD};
pub use error::AssignError;
pub use generate::{generate, GenerateReport, GeneratedFile, GENERATION_ROOM_CODE};
pub use pool::{PackPair, PackPool, PoolLock, PoolStatus};
pub use seal_file::{
    audit_sealed_file, default_sealed_name, open_sealed_document, seal_directory, seal_pack_file, AuditReport,
    SealReport, SealedFile,
};
