// Copyright (c) The testsync Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::{
    ExpectedError,
    errors::{InputKind, Result},
    output::{OutputContext, OutputOpts, OutputWriter, TreeStyles, clap_styles},
};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand, ValueEnum};
use owo_colors::OwoColorize;
use serde::{Serialize, de::DeserializeOwned};
use std::io::Write;
use testsync_core::{
    collection::{CollectionNode, TestCollection},
    config::TestSyncConfig,
    service::{AmbiguousRunRequest, TestService},
};
use testsync_metadata::{
    ProfileGroup, TestItemExpandState, TestRunProfile, TestSyncExitCode, TestsDiff,
};
use tracing::{debug, info};

/// Replays test tree diffs and run profiles offline.
///
/// Diff files are JSON arrays of diff operations, as published by test
/// controllers.
#[derive(Debug, Parser)]
#[command(version, name = "testsync", styles = clap_styles::style())]
pub struct TestSyncApp {
    #[command(flatten)]
    output: OutputOpts,

    #[command(flatten)]
    config_opts: ConfigOpts,

    #[command(subcommand)]
    command: Command,
}

impl TestSyncApp {
    /// Initializes the output context.
    pub fn init_output(&self) -> OutputContext {
        self.output.init()
    }

    /// Executes the app, returning the process exit code.
    pub fn exec(self, output: OutputContext, writer: &mut OutputWriter) -> Result<i32> {
        let config = self.config_opts.make_config()?;
        match self.command {
            Command::Replay { diff_files, reviver } => {
                let collection = replay(&config, &diff_files)?;
                if collection.is_empty() {
                    return Err(ExpectedError::NoTests);
                }
                let mut stdout = writer.stdout_writer();
                if reviver {
                    write_json(&mut stdout, &collection.get_reviver_diff())?;
                } else {
                    write_tree(&mut stdout, &collection, &output.stdout_styles(), output.verbose)?;
                }
                stdout.flush()?;
            }
            Command::Plan {
                profiles,
                diff_files,
                tests,
                group,
            } => {
                let service = TestService::new(&config);
                for profile in read_json::<Vec<TestRunProfile>>(&profiles, InputKind::Profiles)? {
                    service.add_profile(profile);
                }
                for path in &diff_files {
                    service.publish_diff("replay", read_json::<TestsDiff>(path, InputKind::Diff)?);
                }

                let tests = service.with_collection(|collection| {
                    if tests.is_empty() {
                        return Ok(collection
                            .root_items()
                            .map(|node| node.item().clone())
                            .collect());
                    }
                    tests
                        .iter()
                        .map(|test_id| {
                            collection
                                .get_node_by_id(test_id)
                                .map(|node| node.item().clone())
                                .ok_or_else(|| ExpectedError::UnknownTest {
                                    test_id: test_id.clone(),
                                })
                        })
                        .collect::<Result<Vec<_>>>()
                })?;

                let mut request = AmbiguousRunRequest::new(tests);
                request.group = group.map(GroupOpt::profile_group);
                let resolved = service.resolve_run_request(&request);
                debug!("resolved {} run targets", resolved.targets.len());

                let mut stdout = writer.stdout_writer();
                write_json(&mut stdout, &resolved)?;
                stdout.flush()?;
            }
            Command::ShowConfig => {
                let mut stdout = writer.stdout_writer();
                writeln!(stdout, "root: {}", config.root())?;
                writeln!(stdout, "results.max-retained = {}", config.max_retained_results())?;
                writeln!(stdout, "tree.warn-orphaned-adds = {}", config.warn_orphaned_adds())?;
                writeln!(stdout, "run.default-group = {}", config.default_group().as_str())?;
                stdout.flush()?;
            }
        }
        Ok(TestSyncExitCode::OK)
    }
}

#[derive(Debug, Args)]
struct ConfigOpts {
    /// Directory the default config file is resolved against
    #[arg(long, global = true, value_name = "DIR", default_value = ".")]
    root: Utf8PathBuf,

    /// Config file [default: ROOT/.config/testsync.toml]
    #[arg(long, global = true, value_name = "PATH")]
    config_file: Option<Utf8PathBuf>,
}

impl ConfigOpts {
    fn make_config(&self) -> Result<TestSyncConfig> {
        Ok(TestSyncConfig::from_sources(
            &self.root,
            self.config_file.as_deref(),
        )?)
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply diff files in order and print the resulting test tree
    Replay {
        /// Diff files, applied in order
        #[arg(required = true, value_name = "DIFF_FILE")]
        diff_files: Vec<Utf8PathBuf>,

        /// Print a single diff that rebuilds the tree instead
        #[arg(long)]
        reviver: bool,
    },

    /// Resolve which profile runs each test
    ///
    /// Prints the resolved run request as JSON.
    Plan {
        /// JSON file with the run profiles of every controller
        #[arg(long, value_name = "PATH")]
        profiles: Utf8PathBuf,

        /// Diff files, applied in order
        #[arg(value_name = "DIFF_FILE")]
        diff_files: Vec<Utf8PathBuf>,

        /// Composite IDs of tests to run [default: every root]
        #[arg(long = "test", value_name = "ID")]
        tests: Vec<String>,

        /// Group to run in [default: run.default-group from config]
        #[arg(long, value_enum)]
        group: Option<GroupOpt>,
    },

    /// Print the effective config
    ShowConfig,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum GroupOpt {
    Run,
    Debug,
    Coverage,
}

impl GroupOpt {
    fn profile_group(self) -> ProfileGroup {
        match self {
            Self::Run => ProfileGroup::RUN,
            Self::Debug => ProfileGroup::DEBUG,
            Self::Coverage => ProfileGroup::COVERAGE,
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Utf8Path, kind: InputKind) -> Result<T> {
    let contents = std::fs::read_to_string(path).map_err(|err| ExpectedError::InputReadError {
        path: path.to_owned(),
        err,
    })?;
    serde_json::from_str(&contents).map_err(|err| ExpectedError::InputParseError {
        path: path.to_owned(),
        kind,
        err,
    })
}

fn replay(config: &TestSyncConfig, diff_files: &[Utf8PathBuf]) -> Result<TestCollection> {
    let mut collection = TestCollection::new().with_warn_orphaned_adds(config.warn_orphaned_adds());
    for path in diff_files {
        let diff: TestsDiff = read_json(path, InputKind::Diff)?;
        let changes = collection.apply(diff);
        debug!(
            "applied `{path}`: {} changes, {} retired",
            changes.changes.len(),
            changes.retired.len(),
        );
    }
    info!(
        "replayed {} diff files: {} tests under {} roots",
        diff_files.len(),
        collection.len(),
        collection.root_ids().len(),
    );
    Ok(collection)
}

fn write_json(writer: &mut impl Write, value: &impl Serialize) -> Result<()> {
    serde_json::to_writer_pretty(&mut *writer, value)
        .map_err(|err| ExpectedError::SerializeError { err })?;
    writeln!(writer)?;
    Ok(())
}

fn write_tree(
    writer: &mut impl Write,
    collection: &TestCollection,
    styles: &TreeStyles,
    verbose: bool,
) -> Result<()> {
    for node in collection.all() {
        let depth = depth(collection, node);
        let item = &node.item().item;
        write!(writer, "{:indent$}", "", indent = depth * 2)?;
        if node.is_root() {
            write!(writer, "{}", item.label.style(styles.root))?;
        } else {
            write!(writer, "{}", item.label)?;
        }
        if verbose {
            write!(writer, " {}", format!("[{}]", node.id().escape_debug()).style(styles.id))?;
        }
        if node.item().expand == TestItemExpandState::BusyExpanding {
            write!(writer, " {}", "(expanding)".style(styles.busy))?;
        }
        if let Some(error) = &item.error {
            write!(writer, " {}", format!("error: {error}").style(styles.error))?;
        }
        writeln!(writer)?;
    }
    Ok(())
}

fn depth(collection: &TestCollection, node: &CollectionNode) -> usize {
    std::iter::successors(node.item().parent.as_ref(), |parent| {
        collection.get_node_by_id(parent)?.item().parent.as_ref()
    })
    .count()
}
