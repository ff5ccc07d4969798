//! Command line parsing.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, CommandFactory, Parser, ValueEnum};
use thiserror::Error;
use tracing::warn;

use crate::error::RuntimeError;
use crate::runtime::config::{InspectorConfig, DEFAULT_INSPECTOR_PORT};
use crate::runtime::RuntimeOptions;

/// Unknown long options farther than this from every known one get no
/// suggestion.
const MAX_SUGGESTION_DISTANCE: usize = 4;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Unrecognized option --{option}")]
    UnknownOption {
        option: String,
        suggestion: Option<String>,
    },

    #[error("Too many arguments")]
    TooManyArguments,

    #[error("Delimiter must be a single character")]
    InvalidDelimiter,

    #[error(transparent)]
    Clap(#[from] clap::Error),

    #[error(transparent)]
    Config(#[from] RuntimeError),
}

impl CliError {
    /// Help and version requests end the process successfully.
    pub fn is_exit_request(&self) -> bool {
        matches!(self, CliError::Clap(err) if !err.use_stderr())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Debug,
    Normal,
    #[default]
    Quiet,
    Silent,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IntrospectPolicy {
    #[value(name = "AllowLoadingSharedObject")]
    AllowLoadingSharedObject,
    #[value(name = "ForbidLoadingSharedObject")]
    ForbidLoadingSharedObject,
    #[value(name = "AllowWritingToJournal")]
    AllowWritingToJournal,
    #[value(name = "ForbidWritingToJournal")]
    ForbidWritingToJournal,
}

/// Cocoa JavaScript runtime host
#[derive(Parser, Debug)]
#[allow(clippy::struct_excessive_bools)]
#[command(name = "cocoa")]
#[command(version, about, long_about = None, disable_version_flag = true)]
pub struct Cli {
    /// Display version information
    #[arg(short = 'v', long, action = ArgAction::Version)]
    pub version: Option<bool>,

    // === Logging ===
    /// Write logs to a file instead of standard output
    #[arg(short = 'o', long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Print logs to standard error
    #[arg(long)]
    pub log_stderr: bool,

    /// Log level (overridden by RUST_LOG)
    #[arg(short = 'L', long, value_enum, default_value_t = LogLevel::Quiet)]
    pub log_level: LogLevel,

    /// Do not write logs with ANSI colors
    #[arg(long)]
    pub disable_log_decoration: bool,

    // === Process ===
    /// Change to this directory before anything else
    #[arg(long, value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Exit right after initialization without running the startup module
    #[arg(long)]
    pub initialize_only: bool,

    // === Engine ===
    /// Number of worker threads for engine background jobs (0 = hardware concurrency)
    #[arg(long, value_name = "N", default_value_t = 0)]
    pub v8_concurrent_workers: usize,

    /// Comma separated flags passed to the engine
    #[arg(long, value_name = "FLAGS", value_delimiter = ',')]
    pub v8_options: Vec<String>,

    // === Runtime ===
    /// Start the inspector, optionally on the given port
    #[arg(
        long,
        value_name = "PORT",
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "9005"
    )]
    pub runtime_inspector: Option<u16>,

    /// Do not run the startup module until the debugger asks for it
    #[arg(long)]
    pub runtime_inspector_no_script: bool,

    /// Pause on the first statement of the startup module
    #[arg(long)]
    pub runtime_inspector_startup_brk: bool,

    /// Comma separated names of language bindings to reject
    #[arg(long, value_name = "NAMES", value_delimiter = ',')]
    pub runtime_blacklist: Vec<String>,

    /// Shared object to load as a language binding (can be used multiple times)
    #[arg(long, value_name = "PATH", action = ArgAction::Append)]
    pub runtime_preload: Vec<String>,

    /// Let language bindings with the same name override each other
    #[arg(long)]
    pub runtime_allow_override: bool,

    /// Enable or disable functions of the `introspect` object
    #[arg(long, value_enum, value_name = "POLICY", value_delimiter = ',')]
    pub introspect_policy: Vec<IntrospectPolicy>,

    // === Scripts ===
    /// Delimiter separated arguments passed to JavaScript
    #[arg(short = 'A', long, value_name = "ARGS", action = ArgAction::Append)]
    pub pass: Vec<String>,

    /// Delimiter used by --pass, comma by default
    #[arg(short = 'D', long, value_name = "CHAR")]
    pub pass_delimiter: Option<String>,

    /// JavaScript module to run (index.js by default)
    #[arg(short = 's', long, value_name = "PATH")]
    pub startup: Option<String>,

    /// Startup module, same as --startup
    #[arg(value_name = "STARTUP")]
    pub positional: Vec<String>,
}

impl Cli {
    /// Parse `args` (including the program name), checking long option
    /// spelling before clap sees them.
    pub fn try_parse_args<I, T>(args: I) -> Result<Cli, CliError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
        check_long_options(&args)?;

        let cli = Cli::try_parse_from(args)?;
        if cli.positional.len() > 1 {
            return Err(CliError::TooManyArguments);
        }
        Ok(cli)
    }

    pub fn startup(&self) -> Option<&str> {
        self.positional.first().or(self.startup.as_ref()).map(String::as_str)
    }

    pub fn delimiter(&self) -> Result<char, CliError> {
        let Some(delimiter) = &self.pass_delimiter else {
            return Ok(',');
        };
        let mut chars = delimiter.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(CliError::InvalidDelimiter),
        }
    }
}

fn long_option_names() -> Vec<String> {
    let command = Cli::command();
    let mut names: Vec<String> = command
        .get_arguments()
        .filter_map(|arg| arg.get_long().map(str::to_string))
        .collect();
    names.push("help".to_string());
    names
}

fn check_long_options(args: &[OsString]) -> Result<(), CliError> {
    let known = long_option_names();
    for arg in args.iter().skip(1) {
        let Some(arg) = arg.to_str() else {
            continue;
        };
        if arg == "--" {
            break;
        }
        let Some(option) = arg.strip_prefix("--") else {
            continue;
        };
        let name = option.split_once('=').map_or(option, |(name, _)| name);
        if known.iter().any(|known| known == name) {
            continue;
        }
        return Err(CliError::UnknownOption {
            option: name.to_string(),
            suggestion: suggest_option(name, &known),
        });
    }
    Ok(())
}

/// Closest known option name, if it is within the suggestion distance.
pub fn suggest_option(name: &str, known: &[String]) -> Option<String> {
    known
        .iter()
        .map(|candidate| (strsim::levenshtein(name, candidate), candidate))
        .min_by_key(|(distance, _)| *distance)
        .filter(|(distance, _)| *distance <= MAX_SUGGESTION_DISTANCE)
        .map(|(_, candidate)| candidate.clone())
}

impl RuntimeOptions {
    /// Runtime options described by the command line.
    pub fn from_cli(cli: &Cli) -> Result<Self, CliError> {
        let delimiter = cli.delimiter()?;
        let mut options = RuntimeOptions::default()
            .with_thread_pool(cli.v8_concurrent_workers)
            .with_v8_options(cli.v8_options.iter().filter(|flag| !flag.is_empty()).cloned())
            .with_blacklist(cli.runtime_blacklist.iter().filter(|name| !name.is_empty()).cloned())
            .with_allow_override(cli.runtime_allow_override)
            .with_pass_args(&cli.pass.join(&delimiter.to_string()), delimiter);
        if let Some(startup) = cli.startup() {
            options = options.with_startup(startup);
        }
        for library in &cli.runtime_preload {
            options = options.with_preload(library.clone());
        }

        for policy in &cli.introspect_policy {
            match policy {
                IntrospectPolicy::AllowLoadingSharedObject => options.introspect_allow_loading_shared_object = true,
                IntrospectPolicy::ForbidLoadingSharedObject => options.introspect_allow_loading_shared_object = false,
                IntrospectPolicy::AllowWritingToJournal => options.introspect_allow_write_journal = true,
                IntrospectPolicy::ForbidWritingToJournal => options.introspect_allow_write_journal = false,
            }
        }

        if let Some(port) = cli.runtime_inspector {
            let inspector = InspectorConfig::new("127.0.0.1", port)?
                .with_no_script(cli.runtime_inspector_no_script)
                .with_break_on_next_statement(cli.runtime_inspector_startup_brk);
            options = options.with_inspector(inspector);
        } else if cli.runtime_inspector_no_script || cli.runtime_inspector_startup_brk {
            warn!(
                "Inspector options have no effect without --runtime-inspector (port {} by default)",
                DEFAULT_INSPECTOR_PORT
            );
        }
        Ok(options)
    }
}
