mod commands;
mod paths;

pub use commands::helper_command;
pub use paths::{APK_CACHE_DIR_NAME, AppPaths, AppPathsError};
