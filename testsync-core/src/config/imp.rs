// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::errors::{ConfigParseError, ConfigParseErrorKind};
use camino::{Utf8Path, Utf8PathBuf};
use config::{Config, ConfigBuilder, ConfigError, File, FileFormat, builder::DefaultState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use testsync_metadata::ProfileGroup;
use tracing::warn;

/// Overall configuration for testsync.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestSyncConfig {
    root: Utf8PathBuf,
    inner: TestSyncConfigImpl,
}

impl TestSyncConfig {
    /// The default location of the config within a root directory.
    pub const CONFIG_PATH: &'static str = ".config/testsync.toml";

    /// Contains the default config as a TOML file.
    ///
    /// User configuration is layered on top of the default config.
    pub const DEFAULT_CONFIG: &'static str = include_str!("../../default-config.toml");

    /// Reads the config from the given file, or if not specified from
    /// `.config/testsync.toml` under `root`.
    ///
    /// If no config file is specified and `root` doesn't have
    /// `.config/testsync.toml`, uses the default config options.
    pub fn from_sources(
        root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
    ) -> Result<Self, ConfigParseError> {
        Self::from_sources_impl(root, config_file, |config_file, unknown| {
            let mut unknown_str = String::new();
            for ignored_key in unknown {
                unknown_str.push_str("\n  - ");
                unknown_str.push_str(ignored_key);
            }
            warn!("ignoring unknown configuration keys in config file {config_file}:{unknown_str}");
        })
    }

    // A custom unknown_callback can be passed in while testing.
    fn from_sources_impl(
        root: impl Into<Utf8PathBuf>,
        config_file: Option<&Utf8Path>,
        mut unknown_callback: impl FnMut(&Utf8Path, &BTreeSet<String>),
    ) -> Result<Self, ConfigParseError> {
        let root = root.into();
        let (config_file, source) = match config_file {
            Some(file) => (file.to_owned(), File::new(file.as_str(), FileFormat::Toml)),
            None => {
                let file = root.join(Self::CONFIG_PATH);
                let source = File::new(file.as_str(), FileFormat::Toml).required(false);
                (file, source)
            }
        };

        let builder = Self::make_default_config().add_source(source);
        let (inner, unknown) = Self::build_and_deserialize_config(&builder)
            .map_err(|kind| ConfigParseError::new(&config_file, kind))?;
        if !unknown.is_empty() {
            unknown_callback(&config_file, &unknown);
        }

        Ok(Self { root, inner })
    }

    /// Returns the default config, rooted at `root`.
    ///
    /// This matches the embedded [`Self::DEFAULT_CONFIG`] exactly.
    pub fn default_config(root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            root: root.into(),
            inner: TestSyncConfigImpl::default(),
        }
    }

    /// Returns the root directory the config was read relative to.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Returns the number of finished results to keep.
    pub fn max_retained_results(&self) -> usize {
        self.inner.results.max_retained
    }

    /// Returns true if dropped orphan additions should be logged as warnings.
    pub fn warn_orphaned_adds(&self) -> bool {
        self.inner.tree.warn_orphaned_adds
    }

    /// Returns the group used when a run request doesn't name one.
    pub fn default_group(&self) -> DefaultRunGroup {
        self.inner.run.default_group
    }

    fn make_default_config() -> ConfigBuilder<DefaultState> {
        Config::builder().add_source(File::from_str(Self::DEFAULT_CONFIG, FileFormat::Toml))
    }

    fn build_and_deserialize_config(
        builder: &ConfigBuilder<DefaultState>,
    ) -> Result<(TestSyncConfigImpl, BTreeSet<String>), ConfigParseErrorKind> {
        let config = builder
            .build_cloned()
            .map_err(|error| ConfigParseErrorKind::BuildError(Box::new(error)))?;

        let mut ignored = BTreeSet::new();
        let mut cb = |path: serde_ignored::Path| {
            ignored.insert(path.to_string());
        };
        let ignored_de = serde_ignored::Deserializer::new(config, &mut cb);
        let inner: TestSyncConfigImpl =
            serde_path_to_error::deserialize(ignored_de).map_err(|error| {
                // serde_path_to_error already tracks the key, so drop it from
                // the config error.
                let path = error.path().clone();
                let error = match error.into_inner() {
                    ConfigError::At { error, .. } => *error,
                    other => other,
                };
                ConfigParseErrorKind::DeserializeError(Box::new(serde_path_to_error::Error::new(
                    path, error,
                )))
            })?;

        Ok((inner, ignored))
    }
}

/// The capability group named by `run.default-group`.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefaultRunGroup {
    /// [`ProfileGroup::RUN`].
    #[default]
    Run,

    /// [`ProfileGroup::DEBUG`].
    Debug,

    /// [`ProfileGroup::COVERAGE`].
    Coverage,
}

impl DefaultRunGroup {
    /// Returns the name of the group as written in config.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "run",
            Self::Debug => "debug",
            Self::Coverage => "coverage",
        }
    }

    /// Returns the profile group bit for this group.
    pub fn profile_group(self) -> ProfileGroup {
        match self {
            Self::Run => ProfileGroup::RUN,
            Self::Debug => ProfileGroup::DEBUG,
            Self::Coverage => ProfileGroup::COVERAGE,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct TestSyncConfigImpl {
    #[serde(default)]
    results: ResultsConfig,
    #[serde(default)]
    tree: TreeConfig,
    #[serde(default)]
    run: RunConfig,
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct ResultsConfig {
    max_retained: usize,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self { max_retained: 128 }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct TreeConfig {
    warn_orphaned_adds: bool,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            warn_orphaned_adds: true,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RunConfig {
    default_group: DefaultRunGroup,
}
