//! Generation engine collaborators.
//!
//! The engine is the only component allowed to hold the GPU. It is invoked
//! synchronously by the executor, one job at a time, and reports either raw
//! samples or a file it wrote itself.

use std::collections::VecDeque;
use std::f32::consts::TAU;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::audio::{self, AudioBuffer, AudioFormat};
use crate::config::{EngineConfig, EngineKind};
use crate::jobs::GenerationParams;

const STDERR_TAIL_LINES: usize = 20;

/// Everything the engine needs for one invocation.
#[derive(Debug, Clone, Copy)]
pub struct EngineRequest<'a> {
    pub job_id: &'a str,
    pub params: &'a GenerationParams,
    /// Return samples instead of writing a file.
    pub in_memory: bool,
    pub output_dir: &'a Path,
    pub scratch_dir: &'a Path,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutput {
    Samples {
        audio: AudioBuffer,
        params: Option<serde_json::Value>,
    },
    File {
        path: PathBuf,
        format: AudioFormat,
        params: Option<serde_json::Value>,
    },
}

pub trait GenerationEngine: Send + Sync {
    fn name(&self) -> &str;

    fn generate(&self, request: &EngineRequest<'_>) -> Result<EngineOutput>;
}

pub fn build_engine(config: &EngineConfig) -> Arc<dyn GenerationEngine> {
    match config.kind {
        EngineKind::Process => Arc::new(ProcessEngine::new(
            config.program.clone(),
            config.args.clone(),
        )),
        EngineKind::Tone => Arc::new(ToneEngine::new(config.sample_rate)),
    }
}

/// Drives an external generation program.
///
/// The program receives one JSON document on stdin and must print a JSON
/// object with `audio_path` (and optionally `params`) as its last stdout line.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    program: PathBuf,
    args: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ProcessInvocation<'a> {
    job_id: &'a str,
    output_dir: &'a Path,
    format: AudioFormat,
    params: &'a GenerationParams,
}

#[derive(Debug, Deserialize)]
struct ProcessReply {
    audio_path: PathBuf,
    #[serde(default)]
    params: Option<serde_json::Value>,
}

impl ProcessEngine {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn run(&self, invocation: &ProcessInvocation<'_>) -> Result<ProcessReply> {
        let payload =
            serde_json::to_vec(invocation).context("failed to serialize engine request")?;

        debug!(
            program = %self.program.display(),
            args = ?self.args,
            job_id = invocation.job_id,
            "launching generation program"
        );

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "failed to launch generation program {}",
                    self.program.display()
                )
            })?;

        let mut stdin = child
            .stdin
            .take()
            .context("generation program stdin was not piped")?;
        let feeder = thread::spawn(move || stdin.write_all(&payload));

        let stderr = child
            .stderr
            .take()
            .context("generation program stderr was not piped")?;
        let stderr_thread = thread::spawn(move || {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => {
                        debug!(target: "engine_stderr", "{}", line);
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line);
                    }
                    Err(e) => {
                        debug!(target: "engine_stderr", "read error: {}", e);
                        break;
                    }
                }
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let output = child
            .wait_with_output()
            .context("failed to wait for generation program")?;
        let stderr_tail = stderr_thread.join().unwrap_or_default();
        let fed = feeder
            .join()
            .map_err(|_| anyhow::anyhow!("engine stdin feeder panicked"))?;

        if !output.status.success() {
            bail!(
                "generation program exited with status {}: {}",
                output.status,
                stderr_tail.trim()
            );
        }
        fed.context("failed to write request to generation program")?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last_line = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .context("generation program printed nothing on stdout")?;

        serde_json::from_str(last_line).with_context(|| {
            format!("generation program reply is not valid JSON: {last_line}")
        })
    }
}

impl GenerationEngine for ProcessEngine {
    fn name(&self) -> &str {
        "process"
    }

    fn generate(&self, request: &EngineRequest<'_>) -> Result<EngineOutput> {
        if !request.in_memory {
            let reply = self.run(&ProcessInvocation {
                job_id: request.job_id,
                output_dir: request.output_dir,
                format: request.params.format,
                params: request.params,
            })?;
            return Ok(EngineOutput::File {
                path: reply.audio_path,
                format: request.params.format,
                params: reply.params,
            });
        }

        // In-memory: have the program render WAV into a private scratch
        // directory, then pull the samples back and drop the directory.
        let work_dir = request.scratch_dir.join(format!("engine-{}", request.job_id));
        fs::create_dir_all(&work_dir).with_context(|| {
            format!("failed to create engine work dir: {}", work_dir.display())
        })?;

        let result = self
            .run(&ProcessInvocation {
                job_id: request.job_id,
                output_dir: &work_dir,
                format: AudioFormat::Wav,
                params: request.params,
            })
            .and_then(|reply| {
                let audio = audio::decode_wav_file(&reply.audio_path)?;
                Ok(EngineOutput::Samples {
                    audio,
                    params: reply.params,
                })
            });

        if let Err(e) = fs::remove_dir_all(&work_dir) {
            warn!(
                path = %work_dir.display(),
                error = %e,
                "Failed to remove engine work dir"
            );
        }

        result
    }
}

/// Deterministic synthesized tone, for dry runs without a model.
#[derive(Debug, Clone)]
pub struct ToneEngine {
    sample_rate: u32,
}

impl ToneEngine {
    const CHANNELS: u16 = 2;
    const AMPLITUDE: f32 = 0.25;

    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
        }
    }

    /// Same prompt and seed always give the same pitch.
    fn frequency_hz(params: &GenerationParams) -> f32 {
        let seed = params.manual_seeds.first().copied().unwrap_or(0);
        let hash = params
            .prompt
            .bytes()
            .fold(seed, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(b)));
        220.0 + (hash % 440) as f32
    }

    fn render(&self, params: &GenerationParams) -> AudioBuffer {
        let frames = (params.audio_duration * f64::from(self.sample_rate)).round() as usize;
        let step = TAU * Self::frequency_hz(params) / self.sample_rate as f32;
        let mut samples = Vec::with_capacity(frames * Self::CHANNELS as usize);
        for frame in 0..frames {
            let value = (step * (frame % self.sample_rate as usize) as f32).sin() * Self::AMPLITUDE;
            samples.push(value);
            samples.push(value);
        }
        AudioBuffer {
            samples,
            channels: Self::CHANNELS,
            sample_rate: self.sample_rate,
        }
    }
}

impl GenerationEngine for ToneEngine {
    fn name(&self) -> &str {
        "tone"
    }

    fn generate(&self, request: &EngineRequest<'_>) -> Result<EngineOutput> {
        let audio = self.render(request.params);
        let params = serde_json::to_value(request.params).ok();

        // Only WAV is written directly; other containers go through the encoder.
        if request.in_memory || request.params.format != AudioFormat::Wav {
            return Ok(EngineOutput::Samples { audio, params });
        }

        fs::create_dir_all(request.output_dir).with_context(|| {
            format!(
                "failed to create output dir: {}",
                request.output_dir.display()
            )
        })?;
        let path = request
            .output_dir
            .join(format!("tone_{}.wav", request.job_id));
        let bytes = audio::encode_wav(&audio)?;
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write tone output: {}", path.display()))?;
        info!(job_id = request.job_id, path = %path.display(), "Tone engine wrote artifact");

        Ok(EngineOutput::File {
            path,
            format: AudioFormat::Wav,
            params,
        })
    }
}
