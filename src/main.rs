use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use cocoa_runtime::bindings::BindingManager;
use cocoa_runtime::cli::{Cli, CliError};
use cocoa_runtime::core::EventLoop;
use cocoa_runtime::logging::LogConfig;
use cocoa_runtime::platform::Platform;
use cocoa_runtime::runtime::{initialize_platform_once, MainRuntime, RuntimeOptions};

fn main() -> ExitCode {
    let cli = match Cli::try_parse_args(std::env::args_os()) {
        Ok(cli) => cli,
        Err(err) => return report_cli_error(err),
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn report_cli_error(err: CliError) -> ExitCode {
    match err {
        CliError::Clap(err) => {
            let exit = if err.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
            let _ = err.print();
            exit
        }
        CliError::UnknownOption { option, suggestion } => {
            eprintln!("Unrecognized option --{option}");
            if let Some(suggestion) = suggestion {
                eprintln!("Did you mean --{suggestion}?");
            }
            ExitCode::FAILURE
        }
        other => {
            eprintln!("{other}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    // Relative paths in every other option are taken from the new directory.
    if let Some(dir) = &cli.working_dir {
        std::env::set_current_dir(dir).with_context(|| format!("Failed to chdir to {}", dir.display()))?;
    }

    LogConfig::from_cli(&cli).init()?;
    let options = RuntimeOptions::from_cli(&cli)?;

    info!("Cocoa runtime, version {}", env!("CARGO_PKG_VERSION"));
    info!("  Google V8 JavaScript Engine, version {}", v8::V8::get_version());
    if options.rt_allow_override {
        warn!("(Vulnerability) Option \"--runtime-allow-override\" may cause fatal security problems");
    }

    initialize_platform_once(&options.v8_options);
    let event_loop = EventLoop::new()?;
    let platform = Platform::make(options.v8_platform_thread_pool)?;
    let bindings = BindingManager::with_builtins(&options.bindings_blacklist, options.rt_allow_override)?;

    let mut runtime = MainRuntime::new(event_loop.clone(), platform.clone(), bindings, options)?;
    let result = runtime.initialize().and_then(|()| {
        if cli.initialize_only {
            debug!("Initialization finished, not running the startup module");
            Ok(())
        } else {
            runtime.run()
        }
    });

    runtime.dispose();
    drop(runtime);
    event_loop.dispose();
    platform.dispose();

    result.context("Runtime failed")
}
