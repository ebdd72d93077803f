// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine default locations of the files genstore manages. None of these
//! functions check whether the returned path actually exists.
//!
//! # See Also
//!
//! - [XDG Base Directory](https://wiki.archlinux.org/title/XDG_Base_Directory)

use std::path::PathBuf;

const APP_DIR: &str = "genstore";

/// Determine default path of configuration file.
///
/// Uses `$XDG_CONFIG_HOME/genstore/config.toml`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_config_path() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|path| path.join(APP_DIR).join("config.toml"))
        .ok_or(NoWayHome)
}

/// Determine default directory holding generation repositories.
///
/// Uses `$XDG_DATA_HOME/genstore/meta`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_meta_dir() -> Result<PathBuf> {
    data_dir().map(|path| path.join("meta"))
}

/// Determine default directory holding activation links.
///
/// Uses `$XDG_DATA_HOME/genstore/links`.
///
/// # Errors
///
/// - Return [`NoWayHome`] if home directory path cannot be determined.
pub fn default_link_dir() -> Result<PathBuf> {
    data_dir().map(|path| path.join("links"))
}

fn data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|path| path.join(APP_DIR))
        .ok_or(NoWayHome)
}

/// No way to determine user's home directory.
///
/// # See Also
///
/// - [`dirs::home_dir`](https://docs.rs/dirs/latest/dirs/fn.home_dir.html)
#[derive(Clone, Debug, thiserror::Error)]
#[error("cannot determine absolute path to user's home directory")]
pub struct NoWayHome;

/// Friendly result alias :3
pub type Result<T, E = NoWayHome> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use sealed_test::prelude::*;

    #[cfg(target_os = "linux")]
    #[sealed_test(env = [("XDG_DATA_HOME", "/tmp/alice/data"), ("XDG_CONFIG_HOME", "/tmp/alice/config")])]
    fn xdg_directories_are_honored() -> anyhow::Result<()> {
        pretty_assertions::assert_eq!(
            default_config_path()?,
            PathBuf::from("/tmp/alice/config/genstore/config.toml")
        );
        pretty_assertions::assert_eq!(default_meta_dir()?, PathBuf::from("/tmp/alice/data/genstore/meta"));
        pretty_assertions::assert_eq!(default_link_dir()?, PathBuf::from("/tmp/alice/data/genstore/links"));

        Ok(())
    }
}
