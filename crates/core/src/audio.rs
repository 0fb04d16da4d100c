//! Audio containers and the encoder collaborator used by the result materializer.

use std::fmt;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::thread;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Output containers accepted at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Wav,
    Mp3,
    Ogg,
    Flac,
}

impl AudioFormat {
    pub const ALL: [AudioFormat; 4] = [Self::Wav, Self::Mp3, Self::Ogg, Self::Flac];

    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Ogg => "ogg",
            Self::Flac => "flac",
        }
    }

    /// HTTP content type for the container. Only mp3 and wav have dedicated
    /// types; everything else is served as `audio/wav`.
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Mp3 => "audio/mpeg",
            Self::Wav | Self::Ogg | Self::Flac => "audio/wav",
        }
    }

    fn ffmpeg_muxer(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp3 => "mp3",
            Self::Ogg => "ogg",
            Self::Flac => "flac",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for AudioFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        AudioFormat::ALL
            .into_iter()
            .find(|format| format.extension() == normalized)
            .ok_or_else(|| {
                format!("unsupported audio format '{raw}' (expected one of wav, mp3, ogg, flac)")
            })
    }
}

/// Interleaved f32 samples in [-1, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub channels: u16,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn frames(&self) -> u64 {
        if self.channels == 0 {
            return 0;
        }
        (self.samples.len() / self.channels as usize) as u64
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Turns raw samples into container bytes.
pub trait AudioEncoder: Send + Sync {
    fn encode(&self, audio: &AudioBuffer, format: AudioFormat) -> Result<Vec<u8>>;
}

/// WAV is written natively; other containers are transcoded from WAV by an
/// external ffmpeg process.
#[derive(Debug, Clone)]
pub struct ContainerEncoder {
    ffmpeg_program: PathBuf,
}

impl ContainerEncoder {
    pub fn new(ffmpeg_program: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_program: ffmpeg_program.into(),
        }
    }
}

impl Default for ContainerEncoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl AudioEncoder for ContainerEncoder {
    fn encode(&self, audio: &AudioBuffer, format: AudioFormat) -> Result<Vec<u8>> {
        let wav = encode_wav(audio)?;
        if format == AudioFormat::Wav {
            return Ok(wav);
        }
        transcode_with_ffmpeg(&self.ffmpeg_program, wav, format)
    }
}

pub fn encode_wav(audio: &AudioBuffer) -> Result<Vec<u8>> {
    if audio.channels == 0 || audio.sample_rate == 0 {
        bail!(
            "invalid audio layout: {} channel(s) at {} Hz",
            audio.channels,
            audio.sample_rate
        );
    }

    let spec = hound::WavSpec {
        channels: audio.channels,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut bytes = Vec::new();
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)
            .context("failed to start WAV writer")?;
        for &sample in &audio.samples {
            let clamped = if sample.is_finite() {
                sample.clamp(-1.0, 1.0)
            } else {
                0.0
            };
            writer
                .write_sample((clamped * i16::MAX as f32) as i16)
                .context("failed to write WAV sample")?;
        }
        writer.finalize().context("failed to finalize WAV")?;
    }

    Ok(bytes)
}

pub fn decode_wav(bytes: &[u8]) -> Result<AudioBuffer> {
    let reader = hound::WavReader::new(Cursor::new(bytes)).context("failed to parse WAV")?;
    read_wav(reader)
}

pub fn decode_wav_file(path: &Path) -> Result<AudioBuffer> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("failed to open WAV file: {}", path.display()))?;
    read_wav(reader)
}

fn read_wav<R: std::io::Read>(mut reader: hound::WavReader<R>) -> Result<AudioBuffer> {
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let bits = u32::from(spec.bits_per_sample.max(2));
            let max_val = ((1i64 << (bits - 1)) - 1) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| (s as f32 / max_val).clamp(-1.0, 1.0)))
                .collect::<Result<_, _>>()
                .context("failed to read WAV samples")?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .context("failed to read WAV samples")?,
    };

    Ok(AudioBuffer {
        samples,
        channels: spec.channels,
        sample_rate: spec.sample_rate,
    })
}

fn transcode_with_ffmpeg(program: &Path, wav: Vec<u8>, format: AudioFormat) -> Result<Vec<u8>> {
    let args = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-f",
        "wav",
        "-i",
        "pipe:0",
        "-f",
        format.ffmpeg_muxer(),
        "pipe:1",
    ];
    debug!(cmd = %format!("{} {}", program.display(), args.join(" ")), "launching ffmpeg transcode");

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to launch {} (is it installed?)", program.display()))?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("failed to open ffmpeg stdin"))?;

    // Feed stdin from a separate thread so a full stdout pipe cannot deadlock us.
    let feeder = thread::spawn(move || stdin.write_all(&wav));

    let output = child
        .wait_with_output()
        .context("failed to wait for ffmpeg")?;
    let fed = feeder
        .join()
        .map_err(|_| anyhow::anyhow!("ffmpeg stdin feeder panicked"))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffmpeg exited with status {} while encoding {format}: {}",
            output.status,
            stderr.trim()
        );
    }
    fed.context("failed to write WAV data to ffmpeg")?;

    if output.stdout.is_empty() {
        bail!("ffmpeg produced no {format} output");
    }

    Ok(output.stdout)
}
