//! Subcommand implementations.
//!
//! Each command drives the engine through its public API only. Ctrl-C stops capture or
//! closes the player from the signal thread, which wakes any blocked `write`.

use std::f32::consts::TAU;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use audio_io::{AudioCapture, AudioConfig, AudioError, AudioPlayer, DeviceIndex, StreamEvent};
use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::recorder::WavRecorder;

/// Print input and output devices to stdout.
pub fn list_devices() -> Result<()> {
    let inputs = audio_io::list_input_devices().context("list input devices")?;
    let outputs = audio_io::list_output_devices().context("list output devices")?;

    println!("input devices:");
    for d in &inputs {
        println!("  #{}: {}", d.index, d.name);
    }
    println!("output devices:");
    for d in &outputs {
        println!("  #{}: {}", d.index, d.name);
    }
    Ok(())
}

pub fn print_config(config: &AudioConfig) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}

/// Record until `seconds` elapse or ctrl-c.
pub fn run_record(path: &Path, seconds: Option<f32>) -> Result<()> {
    let config = audio_io::get_config();
    let capture = AudioCapture::new(DeviceIndex::Default);
    let recorder = WavRecorder::create(path, config.sample_rate, config.channels)?;
    capture.set_callback(recorder.sink());

    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = stop_tx.try_send(());
    })
    .context("install ctrl-c handler")?;

    capture.start().context("start capture")?;
    tracing::info!(
        path = %path.display(),
        sample_rate = config.sample_rate,
        channels = config.channels,
        device = %config.capture_device,
        "recording"
    );
    let events = capture.events();
    wait_for_stop(&stop_rx, &events, seconds.map(Duration::from_secs_f32));

    let stopped = capture.stop();
    capture.clear_callback();
    let bytes = recorder.finish()?;
    stopped.context("stop capture")?;

    let stats = capture.stats();
    tracing::info!(
        bytes,
        chunks = stats.delivered_chunks,
        overruns = stats.overruns,
        "recording finished"
    );
    Ok(())
}

fn wait_for_stop(stop_rx: &Receiver<()>, events: &Receiver<StreamEvent>, limit: Option<Duration>) {
    let deadline = limit.map(|d| std::time::Instant::now() + d);
    loop {
        for event in events.try_iter() {
            if let StreamEvent::Faulted { reason } = event {
                tracing::error!(%reason, "capture failed");
                return;
            }
        }
        let tick = Duration::from_millis(100);
        let wait = match deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(std::time::Instant::now());
                if left.is_zero() {
                    return;
                }
                left.min(tick)
            }
            None => tick,
        };
        match stop_rx.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

/// Play a PCM16 file to the end.
pub fn run_play(path: &Path) -> Result<()> {
    let player = Arc::new(AudioPlayer::new(DeviceIndex::Default));
    close_on_ctrlc(&player)?;

    match player.play_file(path) {
        Ok(bytes) => {
            let stats = player.stats();
            tracing::info!(bytes, underruns = stats.underruns, "playback finished");
            Ok(())
        }
        Err(AudioError::StreamClosed) => {
            tracing::info!("playback interrupted");
            Ok(())
        }
        Err(e) => Err(e).with_context(|| format!("play {}", path.display())),
    }
}

/// Synthesize a sine and push it through `write`.
pub fn run_tone(seconds: f32, freq: f32) -> Result<()> {
    let config = audio_io::get_config();
    let player = Arc::new(AudioPlayer::new(DeviceIndex::Default));
    close_on_ctrlc(&player)?;
    player.start().context("start playback")?;

    let total_frames = (config.sample_rate as f32 * seconds.max(0.0)) as u64;
    let block_frames = (config.chunk_size / (config.channels as usize * 2)).max(1) as u64;
    let mut frame = 0u64;
    while frame < total_frames {
        let frames = block_frames.min(total_frames - frame);
        let pcm = sine_pcm16(freq, config.sample_rate, config.channels, frame, frames as usize);
        match player.write(&pcm) {
            Ok(()) => {}
            Err(AudioError::StreamClosed) => {
                tracing::info!("tone interrupted");
                return Ok(());
            }
            Err(e) => return Err(e).context("write tone"),
        }
        frame += frames;
    }

    match player.drain() {
        Ok(()) | Err(AudioError::StreamClosed) => {}
        Err(e) => return Err(e).context("drain tone"),
    }
    player.stop().context("stop playback")?;
    tracing::info!(
        frames = total_frames,
        underruns = player.stats().underruns,
        "tone finished"
    );
    Ok(())
}

fn close_on_ctrlc(player: &Arc<AudioPlayer>) -> Result<()> {
    let player = player.clone();
    ctrlc::set_handler(move || player.close()).context("install ctrl-c handler")
}

/// `frames` frames of a half-scale sine starting at `start_frame`, same value on every channel.
pub fn sine_pcm16(freq: f32, sample_rate: u32, channels: u16, start_frame: u64, frames: usize) -> Vec<u8> {
    let channels = channels.max(1) as usize;
    let mut out = Vec::with_capacity(frames * channels * 2);
    for i in 0..frames {
        let t = (start_frame + i as u64) as f64 / sample_rate.max(1) as f64;
        let v = ((TAU as f64 * freq as f64 * t).sin() * 0.5 * i16::MAX as f64) as i16;
        for _ in 0..channels {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_has_expected_length_and_shape() {
        let pcm = sine_pcm16(1_000.0, 8_000, 2, 0, 8);
        assert_eq!(pcm.len(), 8 * 2 * 2);

        let samples: Vec<i16> = pcm
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        // Both channels carry the same value.
        for frame in samples.chunks_exact(2) {
            assert_eq!(frame[0], frame[1]);
        }
        assert_eq!(samples[0], 0);
        // Quarter period at 1 kHz / 8 kHz is frame 2: the positive peak.
        assert!(samples[4] > 16_000);
        assert!(samples[12] < -16_000);
    }

    #[test]
    fn sine_continues_across_blocks() {
        let whole = sine_pcm16(440.0, 16_000, 1, 0, 320);
        let mut split = sine_pcm16(440.0, 16_000, 1, 0, 100);
        split.extend(sine_pcm16(440.0, 16_000, 1, 100, 220));
        assert_eq!(whole, split);
    }

    #[test]
    fn stop_wait_honours_deadline() {
        let (_tx, rx) = crossbeam_channel::bounded::<()>(1);
        let (_etx, erx) = crossbeam_channel::bounded::<StreamEvent>(1);
        let started = std::time::Instant::now();
        wait_for_stop(&rx, &erx, Some(Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn stop_wait_returns_on_fault() {
        let (_tx, rx) = crossbeam_channel::bounded::<()>(1);
        let (etx, erx) = crossbeam_channel::bounded::<StreamEvent>(1);
        etx.send(StreamEvent::Faulted {
            reason: "gone".into(),
        })
        .unwrap();
        let started = std::time::Instant::now();
        wait_for_stop(&rx, &erx, None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
