//! Command-line surface over the worker registry.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use serde_json::json;

use crate::changeset::{Changeset, CommitOptions, CommitOutcome};
use crate::config::{Author, RepoMetadata};
use crate::error::Error;
use crate::marshal::SerDesRegistry;
use crate::worker::{OpenOptions, Registry};

#[derive(Parser)]
#[command(name = "strata", about = "Versioned structured datasets in a Git working copy")]
pub struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Working copy root.
    #[arg(long, global = true, default_value = ".")]
    pub workdir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a fresh working copy with repository metadata.
    Init {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },

    /// Print the current repository status.
    Status,

    /// Apply a changeset (JSON file) as one commit.
    Commit {
        /// Path to the changeset JSON: {"path": {"prior": ..., "next": ...}}.
        changeset: PathBuf,
        #[arg(short, long)]
        message: String,
        /// Skip the conflict check.
        #[arg(long)]
        force: bool,
    },

    /// Rename a subtree and commit the move.
    MoveTree {
        from: String,
        to: String,
        #[arg(short, long)]
        message: String,
    },

    /// Remove a subtree and commit the removal.
    DeleteTree {
        path: String,
        #[arg(short, long)]
        message: String,
    },

    /// Load a dataset and print its index status.
    Index {
        /// Dataset root, relative to the working copy (empty = whole repo).
        #[arg(default_value = "")]
        dataset: String,
    },

    /// Look up one object in a dataset's default index.
    Get {
        #[arg(default_value = "")]
        dataset: String,
        path: String,
    },

    /// Read raw buffer bytes at HEAD.
    Read { path: String },
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

pub fn run(cli: Cli) -> Result<(), Error> {
    let mut registry = Registry::new();

    match cli.command {
        Command::Init { name, email } => {
            let meta = RepoMetadata {
                author: Some(Author { name, email }),
                remote: None,
                branch: None,
            };
            Registry::init(&cli.workdir, &meta)?;
            println!("initialized {}", cli.workdir.display());
            Ok(())
        }

        Command::Status => {
            let handle = registry.open(&cli.workdir, OpenOptions::default())?;
            let status = handle.status();
            println!("{}", serde_json::to_string_pretty(&status).expect("status serializes"));
            Ok(())
        }

        Command::Commit {
            changeset,
            message,
            force,
        } => {
            let body = std::fs::read(&changeset)
                .map_err(|e| commit_input_error(format!("{}: {e}", changeset.display())))?;
            let changeset: Changeset = serde_json::from_slice(&body)
                .map_err(|e| commit_input_error(format!("malformed changeset: {e}")))?;

            let mut opts = CommitOptions::new(load_author(&cli.workdir)?, message);
            opts.skip_conflict_check = force;

            let handle = registry.open(&cli.workdir, OpenOptions::default())?;
            report_outcome(handle.commit(changeset, opts)?);
            Ok(())
        }

        Command::MoveTree { from, to, message } => {
            let opts = CommitOptions::new(load_author(&cli.workdir)?, message);
            let handle = registry.open(&cli.workdir, OpenOptions::default())?;
            report_outcome(handle.move_tree(from, to, opts)?);
            Ok(())
        }

        Command::DeleteTree { path, message } => {
            let opts = CommitOptions::new(load_author(&cli.workdir)?, message);
            let handle = registry.open(&cli.workdir, OpenOptions::default())?;
            report_outcome(handle.delete_tree(path, opts)?);
            Ok(())
        }

        Command::Index { dataset } => {
            let handle = registry.open(&cli.workdir, OpenOptions::default())?;
            let status = handle.load_dataset(
                dataset,
                SerDesRegistry::with_defaults(),
                Box::new(|progress| {
                    eprintln!(
                        "{} {}{}",
                        progress.phase,
                        progress.loaded.map(|l| format!("{l}/")).unwrap_or_default(),
                        progress.total
                    );
                }),
            )?;
            println!("{}", serde_json::to_string_pretty(&status).expect("status serializes"));
            Ok(())
        }

        Command::Get { dataset, path } => {
            let handle = registry.open(&cli.workdir, OpenOptions::default())?;
            handle.load_dataset(
                dataset.clone(),
                SerDesRegistry::with_defaults(),
                Box::new(|_| {}),
            )?;
            match handle.get_object(dataset, path)? {
                Some(object) => {
                    println!("{}", serde_json::to_string_pretty(&object).expect("object serializes"));
                }
                None => println!("null"),
            }
            Ok(())
        }

        Command::Read { path } => {
            let handle = registry.open(&cli.workdir, OpenOptions::default())?;
            match handle.read_buffer(path, None)? {
                Some(bytes) => {
                    use std::io::Write;
                    std::io::stdout().write_all(&bytes).ok();
                }
                None => println!("null"),
            }
            Ok(())
        }
    }
}

fn load_author(workdir: &std::path::Path) -> Result<Author, Error> {
    RepoMetadata::load(workdir)
        .map_err(crate::sync::SyncError::from)?
        .author
        .filter(Author::is_valid)
        .ok_or_else(|| {
            commit_input_error("no author configured; run `strata init` first".to_owned())
        })
}

fn commit_input_error(message: String) -> Error {
    Error::Input(message)
}

fn report_outcome(outcome: CommitOutcome) {
    if outcome.is_conflict() {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({"conflicts": outcome.conflicts}))
                .expect("conflicts serialize")
        );
    } else if let Some(commit) = outcome.new_commit {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({"newCommitHash": commit.to_string()}))
                .expect("outcome serializes")
        );
    }
}
