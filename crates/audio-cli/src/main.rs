//! `audio-cli` command-line front end.
//!
//! Loads engine defaults (built-ins, then `--config` TOML, then flags), installs them as
//! the process-wide config, and runs one subcommand against the default audio host.

use anyhow::Result;
use audio_cli::{cli, config, runtime};
use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,audio_io=info")),
        )
        .init();

    let effective = config::resolve(&args)?;
    audio_io::init_config(effective)?;

    match &args.cmd {
        cli::Command::Devices => runtime::list_devices(),
        cli::Command::Config => runtime::print_config(&audio_io::get_config()),
        cli::Command::Record { path, seconds } => runtime::run_record(path, *seconds),
        cli::Command::Play { path } => runtime::run_play(path),
        cli::Command::Tone { seconds, freq } => runtime::run_tone(*seconds, *freq),
    }
}
