//! 16-bit PCM file source for `AudioPlayer::play_file`.
//!
//! Symphonia detects the container (WAV or AIFF) and unpacks packets into interleaved
//! `i16`. The engine does no format conversion, so anything other than 16-bit PCM is
//! rejected at open time.

use std::fs::File;
use std::io;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, Decoder, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::config::SAMPLE_WIDTH_BYTES;
use crate::error::{AudioError, Result};

/// Sequential reader over the PCM16 payload of an audio file.
pub struct Pcm16File {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    channels: u16,
    duration_ms: Option<u64>,
}

impl Pcm16File {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        Self::from_source(Box::new(file), hint)
    }

    /// Open an arbitrary Symphonia [`MediaSource`].
    pub fn from_source(source: Box<dyn MediaSource>, hint: Hint) -> Result<Self> {
        let mss = MediaSourceStream::new(source, Default::default());
        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(map_symphonia_error)?;

        let format = probed.format;
        let track = format
            .default_track()
            .ok_or_else(|| AudioError::UnsupportedFile("no default audio track".into()))?;
        let params = track.codec_params.clone();
        let track_id = track.id;

        if !is_pcm16(&params) {
            let found = codec_name_from_params(&params).unwrap_or("unknown codec");
            return Err(AudioError::UnsupportedFile(format!(
                "expected 16-bit PCM, found {found}"
            )));
        }
        let sample_rate = params
            .sample_rate
            .ok_or_else(|| AudioError::UnsupportedFile("unknown sample rate".into()))?;
        let channels = params
            .channels
            .map(|c| c.count())
            .ok_or_else(|| AudioError::UnsupportedFile("unknown channel layout".into()))?;
        let channels = u16::try_from(channels)
            .map_err(|_| AudioError::UnsupportedFile(format!("{channels} channels")))?;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(map_symphonia_error)?;

        Ok(Self {
            format,
            decoder,
            track_id,
            sample_rate,
            channels,
            duration_ms: duration_ms_from_codec_params(&params),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Best-effort length from the container header.
    pub fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    /// Next block of interleaved little-endian PCM16, `None` at end of file.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => return Err(map_symphonia_error(e)),
            };
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(reason)) => {
                    tracing::warn!(reason, "skipping undecodable packet");
                    continue;
                }
                Err(e) => return Err(map_symphonia_error(e)),
            };
            if decoded.frames() == 0 {
                continue;
            }

            let mut samples = SampleBuffer::<i16>::new(decoded.frames() as u64, *decoded.spec());
            samples.copy_interleaved_ref(decoded);
            let mut bytes = Vec::with_capacity(samples.samples().len() * SAMPLE_WIDTH_BYTES);
            for s in samples.samples() {
                bytes.extend_from_slice(&s.to_le_bytes());
            }
            return Ok(Some(bytes));
        }
    }
}

fn map_symphonia_error(err: SymphoniaError) -> AudioError {
    match err {
        SymphoniaError::IoError(e) => AudioError::Io(e),
        other => AudioError::UnsupportedFile(other.to_string()),
    }
}

fn is_pcm16(params: &CodecParameters) -> bool {
    use symphonia::core::codecs::{CODEC_TYPE_PCM_S16BE, CODEC_TYPE_PCM_S16LE};
    params.codec == CODEC_TYPE_PCM_S16LE || params.codec == CODEC_TYPE_PCM_S16BE
}

fn duration_ms_from_codec_params(params: &CodecParameters) -> Option<u64> {
    let frames = params.n_frames?;
    let rate = params.sample_rate? as u64;
    if rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / rate)
}

fn codec_name_from_params(params: &CodecParameters) -> Option<&'static str> {
    use symphonia::core::codecs::*;
    let name = match params.codec {
        CODEC_TYPE_FLAC => "FLAC",
        CODEC_TYPE_MP3 => "MP3",
        CODEC_TYPE_AAC => "AAC",
        CODEC_TYPE_ALAC => "ALAC",
        CODEC_TYPE_VORBIS => "Vorbis",
        CODEC_TYPE_PCM_S16LE | CODEC_TYPE_PCM_S16BE => "16-bit PCM",
        CODEC_TYPE_PCM_S24LE | CODEC_TYPE_PCM_S24BE => "24-bit PCM",
        CODEC_TYPE_PCM_S32LE | CODEC_TYPE_PCM_S32BE => "32-bit PCM",
        CODEC_TYPE_PCM_F32LE | CODEC_TYPE_PCM_F32BE => "32-bit float PCM",
        CODEC_TYPE_PCM_U8 | CODEC_TYPE_PCM_S8 => "8-bit PCM",
        _ => return None,
    };
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use symphonia::core::codecs::*;

    fn write_wav(path: &Path, spec: hound::WavSpec, samples: &[i16]) {
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn read_all(file: &mut Pcm16File) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = file.next_chunk().unwrap() {
            out.extend_from_slice(&chunk);
        }
        out
    }

    #[test]
    fn reads_pcm16_wav_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ramp.wav");
        let samples: Vec<i16> = (0..10_000).map(|n| (n * 3 - 15_000) as i16).collect();
        write_wav(
            &path,
            hound::WavSpec {
                channels: 2,
                sample_rate: 22_050,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            },
            &samples,
        );

        let mut file = Pcm16File::open(&path).unwrap();
        assert_eq!(file.sample_rate(), 22_050);
        assert_eq!(file.channels(), 2);

        let expected: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        assert_eq!(read_all(&mut file), expected);
        assert!(file.next_chunk().unwrap().is_none());
    }

    #[test]
    fn rejects_float_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("float.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).unwrap();
        for _ in 0..160 {
            writer.write_sample(0.25f32).unwrap();
        }
        writer.finalize().unwrap();

        assert!(matches!(
            Pcm16File::open(&path),
            Err(AudioError::UnsupportedFile(_))
        ));
    }

    #[test]
    fn rejects_non_audio_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.wav");
        std::fs::write(&path, b"definitely not a riff header").unwrap();
        assert!(Pcm16File::open(&path).is_err());
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Pcm16File::open(&dir.path().join("absent.wav")),
            Err(AudioError::Io(_))
        ));
    }

    #[test]
    fn duration_ms_from_codec_params_handles_zero_rate() {
        let mut params = CodecParameters::new();
        params.sample_rate = Some(0);
        params.n_frames = Some(100);
        assert!(duration_ms_from_codec_params(&params).is_none());
        params.sample_rate = Some(16_000);
        params.n_frames = Some(32_000);
        assert_eq!(duration_ms_from_codec_params(&params), Some(2_000));
    }

    #[test]
    fn pcm16_detection() {
        let mut params = CodecParameters::new();
        params.codec = CODEC_TYPE_PCM_S16BE;
        assert!(is_pcm16(&params));
        params.codec = CODEC_TYPE_PCM_S24LE;
        assert!(!is_pcm16(&params));
        assert_eq!(codec_name_from_params(&params), Some("24-bit PCM"));
    }
}
