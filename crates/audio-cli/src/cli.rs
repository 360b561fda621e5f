use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "audio-cli", version, about = "PCM16 capture and playback")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// TOML file with engine defaults (sample_rate, channels, chunk_size, capture_device, player_device)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Sample rate in Hz
    #[arg(long, global = true)]
    pub sample_rate: Option<u32>,

    /// Interleaved channel count
    #[arg(long, global = true)]
    pub channels: Option<u16>,

    /// Capture chunk size in bytes (whole frames)
    #[arg(long, global = true)]
    pub chunk_size: Option<usize>,

    /// Input device index, -1 for the default device
    #[arg(long, global = true, allow_negative_numbers = true)]
    pub capture_device: Option<i32>,

    /// Output device index, -1 for the default device
    #[arg(long, global = true, allow_negative_numbers = true)]
    pub player_device: Option<i32>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List input and output devices
    Devices,

    /// Print the effective configuration as JSON
    Config,

    /// Record from the capture device into a 16-bit WAV file
    Record {
        path: PathBuf,

        /// Stop after this many seconds (default: until ctrl-c)
        #[arg(long)]
        seconds: Option<f32>,
    },

    /// Play a 16-bit PCM WAV or AIFF file
    Play { path: PathBuf },

    /// Play a sine tone through `write`
    Tone {
        #[arg(long, default_value_t = 2.0)]
        seconds: f32,

        #[arg(long, default_value_t = 440.0)]
        freq: f32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_negative_device_indices() {
        let args = Args::try_parse_from([
            "audio-cli",
            "--capture-device",
            "-1",
            "--player-device",
            "2",
            "devices",
        ])
        .unwrap();
        assert_eq!(args.capture_device, Some(-1));
        assert_eq!(args.player_device, Some(2));
        assert!(matches!(args.cmd, Command::Devices));
    }

    #[test]
    fn global_flags_after_subcommand() {
        let args =
            Args::try_parse_from(["audio-cli", "record", "out.wav", "--seconds", "1.5", "--sample-rate", "48000"])
                .unwrap();
        assert_eq!(args.sample_rate, Some(48_000));
        match args.cmd {
            Command::Record { path, seconds } => {
                assert_eq!(path, PathBuf::from("out.wav"));
                assert_eq!(seconds, Some(1.5));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn tone_defaults() {
        let args = Args::try_parse_from(["audio-cli", "tone"]).unwrap();
        match args.cmd {
            Command::Tone { seconds, freq } => {
                assert_eq!(seconds, 2.0);
                assert_eq!(freq, 440.0);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
