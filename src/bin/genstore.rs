// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use genstore::{
    builder::NixBuilder,
    config::StoreConfig,
    migrate::MigrationOutcome,
    path::default_config_path,
    registry::{parse_path, render_path},
    vcs::Git2VersionControl,
    ChangeKind, Context, GenerationId, GenerationStore, Outcome,
};

use anyhow::{bail, Result};
use chrono::DateTime;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::{path::PathBuf, process::exit};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "genstore [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    /// Environment to operate on.
    #[arg(short, long, global = true, default_value = "default", value_name = "name")]
    pub env: String,

    /// Operate on the project environment living in this directory.
    #[arg(short, long, global = true, value_name = "dir")]
    pub project: Option<PathBuf>,

    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    fn run(self) -> Result<()> {
        let config_path = match self.config {
            Some(path) => path,
            None => default_config_path()?,
        };
        let store = GenerationStore::open(StoreConfig::load(config_path)?)?;
        let context = store.context(&self.env, self.project);

        match self.command {
            Command::Init => run_init(&store, &context),
            Command::List => run_list(&store, &context),
            Command::History => run_history(&store, &context),
            Command::Commit(opts) => run_commit(&store, &context, opts),
            Command::Rollback => finish(store.rollback(&context)?),
            Command::Switch(opts) => finish(store.switch(&context, opts.generation)?),
            Command::Migrate(opts) => run_migrate(&store, &context, opts),
            Command::Push(opts) => run_push(&store, &context, opts),
            Command::Gc(opts) => run_gc(&store, &context, opts),
            Command::Registry(opts) => run_registry(&store, &context, opts.command),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Create environment unless it exists.
    Init,

    /// List generations of environment.
    List,

    /// Show change log of environment, newest first.
    History,

    /// Stage directory as next generation, build it, and commit it.
    #[command(override_usage = "genstore commit [options] <dir> -m <message>")]
    Commit(CommitOptions),

    /// Switch to generation preceding the current one.
    Rollback,

    /// Switch to previously recorded generation.
    #[command(override_usage = "genstore switch [options] <generation>")]
    Switch(SwitchOptions),

    /// Run pending schema migrations.
    Migrate(MigrateOptions),

    /// Overwrite upstream with local history.
    Push(PushOptions),

    /// Prune stale activation links.
    Gc(GcOptions),

    /// Inspect or edit registry document of environment.
    Registry(RegistryOptions),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct CommitOptions {
    /// Directory holding the declarative environment.
    #[arg(required = true, value_name = "dir")]
    pub dir: PathBuf,

    /// Change description recorded with the generation.
    #[arg(short, long, required = true, value_name = "message")]
    pub message: String,

    /// Record change even if it builds the same artifact.
    #[arg(long)]
    pub edit: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct SwitchOptions {
    /// Generation number to switch to.
    #[arg(required = true, value_name = "generation")]
    pub generation: GenerationId,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct MigrateOptions {
    /// Do not ask for confirmation.
    #[arg(short, long)]
    pub yes: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct PushOptions {
    /// Discard diverging upstream history.
    #[arg(short, long, required = true)]
    pub force: bool,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct GcOptions {
    /// Prune links inactive for more than this many days.
    #[arg(short, long, value_name = "days")]
    pub age: Option<u64>,
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct RegistryOptions {
    #[command(subcommand)]
    pub command: RegistryCommand,
}

#[derive(Debug, Clone, Subcommand)]
enum RegistryCommand {
    /// Print value at path.
    Get { path: String },

    /// Set path to JSON value.
    Set { path: String, value: String },

    /// Set path to number.
    SetNumber { path: String, value: String },

    /// Set path to string.
    SetString { path: String, value: String },

    /// Delete path.
    Delete { path: String },

    /// Append value to array at path.
    Add { path: String, value: String },

    /// Remove first matching value from array at path.
    Remove { path: String, value: String },

    /// Print whole document.
    Dump,

    /// Print schema version of document.
    Version,
}

fn main() {
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .with_timer(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    if let Err(error) = run() {
        error!("{error:?}");
        exit(1);
    }

    exit(0)
}

fn run() -> Result<()> {
    Cli::parse().run()
}

type Store = GenerationStore<Git2VersionControl, NixBuilder>;

fn finish(outcome: Outcome) -> Result<()> {
    if outcome == Outcome::Diverged {
        bail!("environment changed upstream, retry or run `genstore push --force`");
    }

    Ok(())
}

fn run_init(store: &Store, context: &Context) -> Result<()> {
    store.init(context)?;
    info!("environment {context} ready");
    Ok(())
}

fn run_list(store: &Store, context: &Context) -> Result<()> {
    let generations = store.generations(context)?;
    for (id, metadata) in generations.iter() {
        let marker = if Some(id) == generations.current() { "*" } else { " " };
        println!(
            "{marker} {id:>4}  {}  {}  {}",
            timestamp(metadata.created),
            timestamp(metadata.last_active),
            metadata.log_message.join("; "),
        );
    }

    Ok(())
}

fn run_history(store: &Store, context: &Context) -> Result<()> {
    let generations = store.generations(context)?;
    for (id, metadata) in generations.iter().rev() {
        for message in &metadata.log_message {
            println!("{id:>4}  {}  {message}", timestamp(metadata.created));
        }
    }

    Ok(())
}

fn run_commit(store: &Store, context: &Context, opts: CommitOptions) -> Result<()> {
    let kind = if opts.edit {
        ChangeKind::Edit
    } else {
        ChangeKind::Packages
    };

    finish(store.commit_dir(context, &opts.dir, &opts.message, kind)?)
}

fn run_migrate(store: &Store, context: &Context, opts: MigrateOptions) -> Result<()> {
    match store.migrate(context, opts.yes)? {
        MigrationOutcome::UpToDate => info!("{context} is up to date"),
        MigrationOutcome::Migrated { from, to, steps } => {
            info!("migrated {context} from schema {from} to {to}: {}", steps.join(", "))
        }
        MigrationOutcome::Diverged => bail!("environment changed upstream while migrating, retry"),
    }

    Ok(())
}

fn run_push(store: &Store, context: &Context, opts: PushOptions) -> Result<()> {
    if !opts.force {
        bail!("only forced pushes are supported, commits push on their own");
    }

    store.force_push(context)?;
    Ok(())
}

fn run_gc(store: &Store, context: &Context, opts: GcOptions) -> Result<()> {
    let pruned = store.gc(context, opts.age)?;
    info!("pruned {} generation links of {context}", pruned.len());
    Ok(())
}

fn run_registry(store: &Store, context: &Context, command: RegistryCommand) -> Result<()> {
    match command {
        RegistryCommand::Get { path } => {
            println!("{}", store.registry_get(context, &parse_path(&path)?)?);
        }
        RegistryCommand::Dump => println!("{}", store.registry_dump(context)?),
        RegistryCommand::Version => println!("{}", store.registry_version(context)?),
        RegistryCommand::Set { path, value } => {
            let path = parse_path(&path)?;
            let value: Value = serde_json::from_str(&value)?;
            finish(store.edit_registry(context, &format!("set {}", render_path(&path)), |registry| {
                registry.set(&path, value)
            })?)?;
        }
        RegistryCommand::SetNumber { path, value } => {
            let path = parse_path(&path)?;
            let value: Value = serde_json::from_str(&value)?;
            finish(store.edit_registry(context, &format!("set {}", render_path(&path)), |registry| {
                registry.set_number(&path, value)
            })?)?;
        }
        RegistryCommand::SetString { path, value } => {
            let path = parse_path(&path)?;
            finish(store.edit_registry(context, &format!("set {}", render_path(&path)), |registry| {
                registry.set_string(&path, Value::String(value))
            })?)?;
        }
        RegistryCommand::Delete { path } => {
            let path = parse_path(&path)?;
            finish(store.edit_registry(context, &format!("delete {}", render_path(&path)), |registry| {
                registry.delete(&path)
            })?)?;
        }
        RegistryCommand::Add { path, value } => {
            let path = parse_path(&path)?;
            let value = json_or_string(value);
            finish(store.edit_registry(context, &format!("add to {}", render_path(&path)), |registry| {
                registry.add_array(&path, value)
            })?)?;
        }
        RegistryCommand::Remove { path, value } => {
            let path = parse_path(&path)?;
            let value = json_or_string(value);
            finish(store.edit_registry(context, &format!("remove from {}", render_path(&path)), |registry| {
                registry.del_array(&path, &value)
            })?)?;
        }
    }

    Ok(())
}

// Bare words are taken as strings so `registry add pkgs hello` works unquoted.
fn json_or_string(value: String) -> Value {
    serde_json::from_str(&value).unwrap_or(Value::String(value))
}

fn timestamp(seconds: i64) -> String {
    DateTime::from_timestamp(seconds, 0)
        .map(|time| time.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| seconds.to_string())
}
