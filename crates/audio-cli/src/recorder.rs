//! WAV writer fed from the capture sink.
//!
//! The sink runs on the audio thread, so it only copies the chunk into a bounded channel.
//! A separate thread owns the `hound` writer and does the file I/O.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use audio_io::AudioBuffer;
use crossbeam_channel::{Sender, TrySendError};

/// Chunks in flight between the sink and the writer thread.
const CHANNEL_CHUNKS: usize = 64;

pub struct WavRecorder {
    tx: Sender<Vec<u8>>,
    join: JoinHandle<Result<u64>>,
}

impl WavRecorder {
    pub fn create(path: &Path, sample_rate: u32, channels: u16) -> Result<Self> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path, spec)
            .with_context(|| format!("create {}", path.display()))?;
        let (tx, rx) = crossbeam_channel::bounded::<Vec<u8>>(CHANNEL_CHUNKS);

        let join = thread::Builder::new()
            .name("wav-writer".into())
            .spawn(move || write_loop(writer, rx))
            .context("spawn wav writer")?;
        Ok(Self { tx, join })
    }

    /// A capture sink that forwards chunks to the writer without blocking.
    pub fn sink(&self) -> impl Fn(AudioBuffer<'_>) + Send + Sync + 'static {
        let tx = self.tx.clone();
        move |chunk: AudioBuffer<'_>| match tx.try_send(chunk.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(bytes = chunk.len(), "wav writer behind, chunk dropped")
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Wait for every queued chunk to be written and finalize the header.
    ///
    /// Every sink returned by [`WavRecorder::sink`] must be dropped first.
    pub fn finish(self) -> Result<u64> {
        drop(self.tx);
        self.join
            .join()
            .map_err(|_| anyhow!("wav writer thread panicked"))?
    }
}

fn write_loop(
    mut writer: hound::WavWriter<BufWriter<File>>,
    rx: crossbeam_channel::Receiver<Vec<u8>>,
) -> Result<u64> {
    let mut bytes = 0u64;
    for chunk in rx {
        for pair in chunk.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        bytes += chunk.len() as u64;
    }
    writer.finalize().context("finalize wav")?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_forwarded_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("take.wav");
        let recorder = WavRecorder::create(&path, 16_000, 1).unwrap();

        let sink = recorder.sink();
        let chunk: Vec<u8> = [1i16, -2, 3, -4]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        sink(AudioBuffer::new(&chunk, 16_000, 1));
        sink(AudioBuffer::new(&chunk, 16_000, 1));
        drop(sink);

        assert_eq!(recorder.finish().unwrap(), 16);
        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        let samples: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, -2, 3, -4, 1, -2, 3, -4]);
    }
}
