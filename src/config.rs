// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the configuration file genstore reads on startup,
//! by default `$XDG_CONFIG_HOME/genstore/config.toml`. Every field is
//! optional.
//!
//! ```toml
//! [store]
//! meta_dir = "$XDG_DATA_HOME/genstore/meta"
//! link_dir = "$XDG_DATA_HOME/genstore/links"
//! owner = "local"
//! system = "x86_64-linux"
//! interactive = true
//!
//! [remote]
//! url = "https://example.org/alice/generations.git"
//!
//! [gc]
//! max_age_days = 90
//! keep_generations = 10
//! ```

use crate::{context::host_system, link::PrunePolicy};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    io::ErrorKind,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Generation store configuration.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Where and as whom environments are stored.
    pub store: StoreSettings,

    /// Upstream shared with other machines.
    pub remote: Option<RemoteSettings>,

    /// Retention of activation links.
    pub gc: GcSettings,
}

impl StoreConfig {
    /// Load configuration file.
    ///
    /// A missing file yields the default configuration.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::Read`] if file exists but cannot be read.
    /// - Return [`ConfigError::Deserialize`] if file is not valid.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        match read_to_string(path.as_ref()) {
            Ok(data) => data.parse(),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Read {
                source,
                path: path.as_ref().to_path_buf(),
            }),
        }
    }

    /// Target system, detected from the host unless configured.
    pub fn system(&self) -> String {
        self.store.system.clone().unwrap_or_else(host_system)
    }

    /// Upstream URL, if any.
    pub fn remote_url(&self) -> Option<&str> {
        self.remote.as_ref().map(|remote| remote.url.as_str())
    }
}

impl FromStr for StoreConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: StoreConfig = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on path fields.
        config.store.meta_dir = config.store.meta_dir.map(expand).transpose()?;
        config.store.link_dir = config.store.link_dir.map(expand).transpose()?;

        Ok(config)
    }
}

impl Display for StoreConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

fn expand(path: PathBuf) -> Result<PathBuf> {
    Ok(PathBuf::from(
        shellexpand::full(path.to_string_lossy().as_ref())
            .map_err(ConfigError::ShellExpansion)?
            .into_owned(),
    ))
}

/// Store settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Directory holding one generation repository per owner.
    pub meta_dir: Option<PathBuf>,

    /// Directory holding activation links.
    pub link_dir: Option<PathBuf>,

    /// Owner of environments.
    pub owner: String,

    /// Target system double, e.g. "aarch64-darwin".
    pub system: Option<String>,

    /// Ask before running migrations.
    pub interactive: bool,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            meta_dir: None,
            link_dir: None,
            owner: "local".into(),
            system: None,
            interactive: true,
        }
    }
}

/// Upstream settings.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct RemoteSettings {
    /// URL of upstream generation repository.
    pub url: String,
}

/// Activation link retention settings.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(default)]
pub struct GcSettings {
    /// Generation links inactive for longer than this are pruned.
    pub max_age_days: u64,

    /// Number of most recently active generation links always kept.
    pub keep_generations: usize,
}

impl Default for GcSettings {
    fn default() -> Self {
        let policy = PrunePolicy::default();
        Self {
            max_age_days: policy.max_age_days,
            keep_generations: policy.keep_generations,
        }
    }
}

impl From<GcSettings> for PrunePolicy {
    fn from(settings: GcSettings) -> Self {
        Self {
            max_age_days: settings.max_age_days,
            keep_generations: settings.keep_generations,
        }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read configuration file {:?}", path.display())]
    Read {
        #[source]
        source: std::io::Error,
        path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
pub type Result<T, E = ConfigError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;

    #[sealed_test(env = [("GENSTORE_DATA", "/home/alice/.local/share/genstore")])]
    fn deserialize_store_config() -> anyhow::Result<()> {
        let result: StoreConfig = indoc! {r#"
            [store]
            meta_dir = "$GENSTORE_DATA/meta"
            link_dir = "$GENSTORE_DATA/links"
            owner = "alice"
            system = "aarch64-darwin"
            interactive = false

            [remote]
            url = "https://example.org/alice/generations.git"

            [gc]
            max_age_days = 30
            keep_generations = 3
        "#}
        .parse()?;

        let expect = StoreConfig {
            store: StoreSettings {
                meta_dir: Some("/home/alice/.local/share/genstore/meta".into()),
                link_dir: Some("/home/alice/.local/share/genstore/links".into()),
                owner: "alice".into(),
                system: Some("aarch64-darwin".into()),
                interactive: false,
            },
            remote: Some(RemoteSettings {
                url: "https://example.org/alice/generations.git".into(),
            }),
            gc: GcSettings {
                max_age_days: 30,
                keep_generations: 3,
            },
        };

        assert_eq!(result, expect);
        assert_eq!(result.system(), "aarch64-darwin");
        assert_eq!(
            result.remote_url(),
            Some("https://example.org/alice/generations.git")
        );

        Ok(())
    }

    #[test]
    fn partial_config_uses_defaults() -> anyhow::Result<()> {
        let result: StoreConfig = "[gc]\nkeep_generations = 2\n".parse()?;
        assert_eq!(result.store, StoreSettings::default());
        assert_eq!(result.remote, None);
        assert_eq!(result.gc.max_age_days, 90);
        assert_eq!(PrunePolicy::from(result.gc).keep_generations, 2);

        Ok(())
    }

    #[test]
    fn display_parses_back() -> anyhow::Result<()> {
        let mut config = StoreConfig::default();
        config.store.owner = "bob".into();
        config.remote = Some(RemoteSettings {
            url: "file:///srv/generations.git".into(),
        });

        let result: StoreConfig = config.to_string().parse()?;
        assert_eq!(result, config);

        Ok(())
    }

    #[test]
    fn missing_file_is_default() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let result = StoreConfig::load(dir.path().join("config.toml"))?;
        assert_eq!(result, StoreConfig::default());

        Ok(())
    }
}
