//! Self-update: release discovery, platform asset selection and transactional
//! replacement of the running executable with rollback.

mod checker;
mod manager;
mod replacer;

pub use checker::{is_newer, platform_asset_name, ReleaseAsset, ReleaseDescriptor, VersionChecker};
pub use manager::{UpdateManager, UpdateState};
pub use replacer::{platform_replacer, ProcessReplacer};
