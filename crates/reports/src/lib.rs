pub mod vault;

pub use vault::{VaultPaths, VaultSummary, build_vault};
