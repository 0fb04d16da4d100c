//! Turns engine output into a retrievable [`JobResult`] and removes staged inputs.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::params::GenerationParams;
use super::record::{JobResult, ResultMetadata};
use crate::audio::{self, AudioBuffer, AudioEncoder, AudioFormat};
use crate::config::PathsConfig;
use crate::engine::EngineOutput;

const INPUT_PARAMS_SUFFIX: &str = "_input_params.json";

pub struct Materializer {
    encoder: Arc<dyn AudioEncoder>,
    output_dir: PathBuf,
    scratch_dir: PathBuf,
}

impl Materializer {
    pub fn new(encoder: Arc<dyn AudioEncoder>, paths: &PathsConfig) -> Self {
        Self {
            encoder,
            output_dir: paths.output_dir.clone(),
            scratch_dir: paths.scratch_dir.clone(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    pub fn materialize(
        &self,
        job_id: &str,
        params: &GenerationParams,
        output: EngineOutput,
    ) -> Result<JobResult> {
        let format = params.format;
        match output {
            EngineOutput::Samples { audio, params: echoed } => {
                let bytes = self
                    .encoder
                    .encode(&audio, format)
                    .with_context(|| format!("failed to encode {format} output"))?;
                let metadata = sample_metadata(format, bytes.len(), &audio, echoed);

                if params.hold_in_memory {
                    return Ok(JobResult::Inline {
                        bytes: Arc::from(bytes),
                        metadata,
                    });
                }

                fs::create_dir_all(&self.output_dir).with_context(|| {
                    format!(
                        "failed to create output directory: {}",
                        self.output_dir.display()
                    )
                })?;
                let path = self
                    .output_dir
                    .join(format!("{job_id}.{}", format.extension()));
                fs::write(&path, &bytes)
                    .with_context(|| format!("failed to write artifact: {}", path.display()))?;
                info!(job_id, path = %path.display(), size_bytes = bytes.len(), "Artifact written");

                Ok(JobResult::Artifact { path, metadata })
            }
            EngineOutput::File {
                path,
                format: file_format,
                params: echoed,
            } => {
                if params.hold_in_memory {
                    return read_and_discard(job_id, &path, file_format, echoed);
                }

                let size_bytes = fs::metadata(&path)
                    .with_context(|| format!("engine output is missing: {}", path.display()))?
                    .len();
                let mut metadata = ResultMetadata {
                    format: file_format,
                    content_type: file_format.content_type(),
                    size_bytes,
                    sample_rate: None,
                    channels: None,
                    frames: None,
                    duration_secs: None,
                    params: echoed,
                };
                if file_format == AudioFormat::Wav {
                    if let Ok(audio) = audio::decode_wav_file(&path) {
                        fill_layout(&mut metadata, &audio);
                    }
                }

                Ok(JobResult::Artifact { path, metadata })
            }
        }
    }

    /// Best-effort removal of staged reference audio. Never fails the job.
    pub fn cleanup_inputs(&self, job_id: &str, params: &GenerationParams) {
        let Some(path) = params.ref_audio_input.as_deref() else {
            return;
        };
        match remove_staged_file(&self.scratch_dir, path) {
            Ok(true) => debug!(job_id, path = %path.display(), "Removed staged input"),
            Ok(false) => {}
            Err(e) => warn!(
                job_id,
                path = %path.display(),
                error = %format!("{e:#}"),
                "Failed to clean up staged input"
            ),
        }
    }
}

/// Removes `path` if it lives under `scratch_dir`, then its parent directory
/// when that is now empty. Paths outside the scratch area are left alone and
/// reported as `Ok(false)`.
pub fn remove_staged_file(scratch_dir: &Path, path: &Path) -> Result<bool> {
    if !is_within(scratch_dir, path) {
        return Ok(false);
    }

    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to remove staged file: {}", path.display()))
        }
    }

    if let Some(parent) = path.parent() {
        if parent != scratch_dir && is_within(scratch_dir, parent) && dir_is_empty(parent) {
            fs::remove_dir(parent).with_context(|| {
                format!("failed to remove staging directory: {}", parent.display())
            })?;
        }
    }

    Ok(true)
}

fn is_within(root: &Path, path: &Path) -> bool {
    // `starts_with` is lexical, so `<scratch>/../x` would otherwise match.
    if path.components().any(|c| c == Component::ParentDir) {
        return false;
    }
    if path.starts_with(root) {
        return true;
    }
    match (fs::canonicalize(root), path.parent().map(fs::canonicalize)) {
        (Ok(root), Some(Ok(parent))) => parent.starts_with(root),
        _ => false,
    }
}

fn dir_is_empty(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

/// The engine wrote a file although the caller wanted bytes: pull it into
/// memory and remove the file along with its input-params sidecar.
fn read_and_discard(
    job_id: &str,
    path: &Path,
    format: AudioFormat,
    echoed: Option<serde_json::Value>,
) -> Result<JobResult> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read engine output: {}", path.display()))?;

    let mut metadata = ResultMetadata {
        format,
        content_type: format.content_type(),
        size_bytes: bytes.len() as u64,
        sample_rate: None,
        channels: None,
        frames: None,
        duration_secs: None,
        params: echoed,
    };
    if format == AudioFormat::Wav {
        if let Ok(audio) = audio::decode_wav(&bytes) {
            fill_layout(&mut metadata, &audio);
        }
    }

    for leftover in [path.to_path_buf(), input_params_sidecar(path)] {
        match fs::remove_file(&leftover) {
            Ok(()) => debug!(job_id, path = %leftover.display(), "Removed engine file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                job_id,
                path = %leftover.display(),
                error = %e,
                "Failed to remove engine file"
            ),
        }
    }

    Ok(JobResult::Inline {
        bytes: Arc::from(bytes),
        metadata,
    })
}

fn input_params_sidecar(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}{INPUT_PARAMS_SUFFIX}"))
}

fn sample_metadata(
    format: AudioFormat,
    size_bytes: usize,
    audio: &AudioBuffer,
    echoed: Option<serde_json::Value>,
) -> ResultMetadata {
    let mut metadata = ResultMetadata {
        format,
        content_type: format.content_type(),
        size_bytes: size_bytes as u64,
        sample_rate: None,
        channels: None,
        frames: None,
        duration_secs: None,
        params: echoed,
    };
    fill_layout(&mut metadata, audio);
    metadata
}

fn fill_layout(metadata: &mut ResultMetadata, audio: &AudioBuffer) {
    metadata.sample_rate = Some(audio.sample_rate);
    metadata.channels = Some(audio.channels);
    metadata.frames = Some(audio.frames());
    metadata.duration_secs = Some(audio.duration_secs());
}

#[cfg(test)]
mod tests {
    use anyhow::bail;

    use super::*;
    use crate::audio::ContainerEncoder;
    use crate::jobs::params::{AdmissionLimits, GenerationRequest};

    struct BrokenEncoder;

    impl AudioEncoder for BrokenEncoder {
        fn encode(&self, _audio: &AudioBuffer, format: AudioFormat) -> Result<Vec<u8>> {
            bail!("no encoder for {format}")
        }
    }

    fn paths(root: &Path) -> PathsConfig {
        PathsConfig {
            output_dir: root.join("outputs"),
            scratch_dir: root.join("scratch"),
        }
    }

    fn params(hold: bool) -> GenerationParams {
        GenerationRequest {
            return_file_data: hold,
            ..GenerationRequest::with_prompt("ambient")
        }
        .validate(&AdmissionLimits::default())
        .expect("valid params")
    }

    fn tone() -> AudioBuffer {
        AudioBuffer {
            samples: (0..1_600).map(|i| (i as f32 * 0.01).sin() * 0.5).collect(),
            channels: 2,
            sample_rate: 8_000,
        }
    }

    fn materializer(root: &Path) -> Materializer {
        Materializer::new(Arc::new(ContainerEncoder::default()), &paths(root))
    }

    #[test]
    fn samples_held_in_memory_become_inline_bytes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = materializer(dir.path())
            .materialize(
                "job-1",
                &params(true),
                EngineOutput::Samples {
                    audio: tone(),
                    params: None,
                },
            )
            .expect("materialize");

        let JobResult::Inline { bytes, metadata } = result else {
            panic!("expected inline result");
        };
        assert_eq!(metadata.content_type, "audio/wav");
        assert_eq!(metadata.size_bytes, bytes.len() as u64);
        assert_eq!(metadata.frames, Some(800));
        assert_eq!(audio::decode_wav(&bytes).expect("decode").frames(), 800);
        assert!(!dir.path().join("outputs").exists());
    }

    #[test]
    fn samples_not_held_are_written_to_output_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = materializer(dir.path())
            .materialize(
                "job-2",
                &params(false),
                EngineOutput::Samples {
                    audio: tone(),
                    params: None,
                },
            )
            .expect("materialize");

        let JobResult::Artifact { path, metadata } = result else {
            panic!("expected artifact result");
        };
        assert_eq!(path, dir.path().join("outputs").join("job-2.wav"));
        assert_eq!(
            fs::metadata(&path).expect("artifact exists").len(),
            metadata.size_bytes
        );
    }

    #[test]
    fn engine_file_kept_as_artifact_when_not_held() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("engine_out.wav");
        fs::write(&file, audio::encode_wav(&tone()).expect("encode")).expect("write");

        let result = materializer(dir.path())
            .materialize(
                "job-3",
                &params(false),
                EngineOutput::File {
                    path: file.clone(),
                    format: AudioFormat::Wav,
                    params: None,
                },
            )
            .expect("materialize");

        assert!(matches!(&result, JobResult::Artifact { path, .. } if *path == file));
        assert_eq!(result.metadata().frames, Some(800));
        assert!(file.exists());
    }

    #[test]
    fn engine_file_held_in_memory_is_read_and_removed_with_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("output_123.wav");
        let sidecar = dir.path().join("output_123_input_params.json");
        fs::write(&file, audio::encode_wav(&tone()).expect("encode")).expect("write audio");
        fs::write(&sidecar, "{}").expect("write sidecar");

        let result = materializer(dir.path())
            .materialize(
                "job-4",
                &params(true),
                EngineOutput::File {
                    path: file.clone(),
                    format: AudioFormat::Wav,
                    params: Some(serde_json::json!({"seed": 1})),
                },
            )
            .expect("materialize");

        assert!(matches!(result, JobResult::Inline { .. }));
        assert_eq!(
            result.metadata().params,
            Some(serde_json::json!({"seed": 1}))
        );
        assert!(!file.exists());
        assert!(!sidecar.exists());
    }

    #[test]
    fn encoder_failure_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let materializer = Materializer::new(Arc::new(BrokenEncoder), &paths(dir.path()));
        let err = materializer
            .materialize(
                "job-5",
                &params(true),
                EngineOutput::Samples {
                    audio: tone(),
                    params: None,
                },
            )
            .expect_err("encoder failure propagates");
        assert!(format!("{err:#}").contains("no encoder for wav"));
    }

    #[test]
    fn staged_file_and_empty_parent_are_removed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().join("scratch");
        let staging = scratch.join("upload-abc");
        fs::create_dir_all(&staging).expect("mkdir");
        let staged = staging.join("uploaded_audio_abc.mp3");
        fs::write(&staged, b"ID3").expect("write");

        assert!(remove_staged_file(&scratch, &staged).expect("cleanup"));
        assert!(!staged.exists());
        assert!(!staging.exists());
        assert!(scratch.exists());
    }

    #[test]
    fn files_outside_scratch_are_never_touched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().join("scratch");
        fs::create_dir_all(&scratch).expect("mkdir");
        let user_file = dir.path().join("my_reference.wav");
        fs::write(&user_file, b"RIFF").expect("write");

        assert!(!remove_staged_file(&scratch, &user_file).expect("cleanup"));
        assert!(user_file.exists());
    }

    #[test]
    fn parent_dir_segments_cannot_escape_scratch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().join("scratch");
        let staging = scratch.join("upload-abc");
        fs::create_dir_all(&staging).expect("mkdir");
        let config = dir.path().join("config.toml");
        fs::write(&config, "[server]\n").expect("write");

        for sneaky in [
            scratch.join("..").join("config.toml"),
            staging.join("..").join("..").join("config.toml"),
        ] {
            assert!(!remove_staged_file(&scratch, &sneaky).expect("cleanup"));
        }
        assert!(config.exists());
        assert!(staging.exists());
    }

    #[test]
    fn cleanup_tolerates_already_removed_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let scratch = dir.path().join("scratch");
        let staging = scratch.join("upload-gone");
        fs::create_dir_all(&staging).expect("mkdir");
        let keep = staging.join("other.wav");
        fs::write(&keep, b"RIFF").expect("write");

        assert!(remove_staged_file(&scratch, &staging.join("missing.wav")).expect("cleanup"));
        // Parent still holds another file, so it stays.
        assert!(staging.exists());
    }
}
