//! Startup parameters of the agent, parsed once at attach.

use std::{
    ffi::OsString,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use clap::Parser;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use sl2_bolts::Error;
use uuid::Uuid;

use crate::{coordinator::DEFAULT_COORDINATOR, coverage::ArenaId};

/// helper function to go from a parsed cli string to a run id
fn parse_run_id(src: &str) -> Result<Uuid, Error> {
    Ok(Uuid::parse_str(src)?)
}

/// Everything the agent is told when it is injected
#[derive(Parser, Clone, Debug, Serialize, Deserialize)]
#[command(name = "sl2-fuzzer")]
pub struct AgentOptions {
    /// JSON file listing the target functions
    #[arg(short, long, value_name = "PATH")]
    pub target: Option<PathBuf>,

    /// Id of this run, as assigned by the coordinator
    #[arg(short, long, value_parser = parse_run_id)]
    pub run_id: Option<Uuid>,

    /// Arena to request from the coordinator for coverage guidance
    #[arg(short, long)]
    pub arena_id: Option<String>,

    /// Mutate without coverage guidance, even if an arena id is given
    #[arg(short, long)]
    pub no_coverage: bool,

    /// Also intercept registry reads
    #[arg(long)]
    pub registry: bool,

    /// Where the coordinator listens
    #[arg(long, default_value = DEFAULT_COORDINATOR)]
    pub coordinator: SocketAddr,

    /// Whether or not to print debug info
    #[arg(short, long)]
    pub verbose: bool,
}

impl AgentOptions {
    /// Parse an argument vector; its first element is the agent's own name.
    pub fn from_args<I, T>(args: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        Self::try_parse_from(args).map_err(|err| Error::illegal_argument(err.to_string()))
    }

    /// Check everything a run cannot start without.
    pub fn validate(&self) -> Result<(), Error> {
        self.target_path()?;
        self.run_id()?;
        self.arena_id()?;
        Ok(())
    }

    /// The target configuration path
    pub fn target_path(&self) -> Result<&Path, Error> {
        self.target
            .as_deref()
            .ok_or_else(|| Error::illegal_argument("a target configuration path is required"))
    }

    /// The run id
    pub fn run_id(&self) -> Result<Uuid, Error> {
        self.run_id
            .ok_or_else(|| Error::illegal_argument("a run id is required"))
    }

    /// The requested arena, if any
    pub fn arena_id(&self) -> Result<Option<ArenaId>, Error> {
        self.arena_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(ArenaId::new)
            .transpose()
    }

    /// Was coverage guidance asked for?
    #[must_use]
    pub fn coverage_requested(&self) -> bool {
        !self.no_coverage && self.arena_id.as_deref().is_some_and(|id| !id.is_empty())
    }

    /// The log level these options ask for
    #[must_use]
    pub fn log_level(&self) -> LevelFilter {
        if self.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        }
    }
}
