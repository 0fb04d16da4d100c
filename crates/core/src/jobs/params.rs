//! Generation request parameters: the loose wire shape and its validated form.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::JobError;
use crate::audio::AudioFormat;
use crate::config::QueueConfig;

pub const DEFAULT_LYRICS: &str = "[instrumental]";
const NO_LORA: &str = "none";

/// Request body as callers send it. Every field except `prompt` has a default,
/// and nothing is trusted until [`GenerationRequest::validate`] succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationRequest {
    pub format: String,
    pub audio_duration: f64,
    pub prompt: Option<String>,
    pub lyrics: String,
    pub infer_step: u32,
    pub guidance_scale: f64,
    pub scheduler_type: String,
    pub cfg_type: String,
    pub omega_scale: f64,
    pub manual_seeds: Option<String>,
    pub guidance_interval: f64,
    pub guidance_interval_decay: f64,
    pub min_guidance_scale: f64,
    pub use_erg_tag: bool,
    pub use_erg_lyric: bool,
    pub use_erg_diffusion: bool,
    pub oss_steps: Option<String>,
    pub guidance_scale_text: f64,
    pub guidance_scale_lyric: f64,
    pub audio2audio_enable: bool,
    pub ref_audio_strength: f64,
    pub ref_audio_input: Option<String>,
    pub lora_name_or_path: String,
    pub lora_weight: f64,
    /// Keep the encoded result in memory for inline retrieval.
    pub return_file_data: bool,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            format: "wav".to_string(),
            audio_duration: 60.0,
            prompt: None,
            lyrics: DEFAULT_LYRICS.to_string(),
            infer_step: 60,
            guidance_scale: 15.0,
            scheduler_type: "euler".to_string(),
            cfg_type: "apg".to_string(),
            omega_scale: 10.0,
            manual_seeds: None,
            guidance_interval: 0.5,
            guidance_interval_decay: 0.0,
            min_guidance_scale: 3.0,
            use_erg_tag: true,
            use_erg_lyric: false,
            use_erg_diffusion: true,
            oss_steps: None,
            guidance_scale_text: 0.0,
            guidance_scale_lyric: 0.0,
            audio2audio_enable: false,
            ref_audio_strength: 0.5,
            ref_audio_input: None,
            lora_name_or_path: NO_LORA.to_string(),
            lora_weight: 1.0,
            return_file_data: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerType {
    Euler,
    Heun,
    Pingpong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CfgType {
    Apg,
    Cfg,
    CfgStar,
}

impl SchedulerType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Euler => "euler",
            Self::Heun => "heun",
            Self::Pingpong => "pingpong",
        }
    }
}

impl CfgType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apg => "apg",
            Self::Cfg => "cfg",
            Self::CfgStar => "cfg_star",
        }
    }
}

impl FromStr for SchedulerType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "euler" => Ok(Self::Euler),
            "heun" => Ok(Self::Heun),
            "pingpong" => Ok(Self::Pingpong),
            _ => Err(format!(
                "unsupported scheduler_type '{raw}' (expected euler, heun or pingpong)"
            )),
        }
    }
}

impl FromStr for CfgType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "apg" => Ok(Self::Apg),
            "cfg" => Ok(Self::Cfg),
            "cfg_star" => Ok(Self::CfgStar),
            _ => Err(format!(
                "unsupported cfg_type '{raw}' (expected apg, cfg or cfg_star)"
            )),
        }
    }
}

impl fmt::Display for SchedulerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for CfgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoraAdapter {
    pub name_or_path: String,
    pub weight: f64,
}

/// Validated, immutable parameters stored on a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationParams {
    pub format: AudioFormat,
    pub audio_duration: f64,
    pub prompt: String,
    pub lyrics: String,
    pub infer_step: u32,
    pub guidance_scale: f64,
    pub scheduler_type: SchedulerType,
    pub cfg_type: CfgType,
    pub omega_scale: f64,
    pub manual_seeds: Vec<u64>,
    pub guidance_interval: f64,
    pub guidance_interval_decay: f64,
    pub min_guidance_scale: f64,
    pub use_erg_tag: bool,
    pub use_erg_lyric: bool,
    pub use_erg_diffusion: bool,
    pub oss_steps: Vec<u32>,
    pub guidance_scale_text: f64,
    pub guidance_scale_lyric: f64,
    pub audio2audio_enable: bool,
    pub ref_audio_strength: f64,
    pub ref_audio_input: Option<PathBuf>,
    pub lora: Option<LoraAdapter>,
    pub hold_in_memory: bool,
}

/// Numeric ceilings enforced at admission.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionLimits {
    pub max_audio_duration_secs: f64,
    pub max_infer_steps: u32,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

impl From<&QueueConfig> for AdmissionLimits {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_audio_duration_secs: config.max_audio_duration_secs,
            max_infer_steps: config.max_infer_steps,
        }
    }
}

impl GenerationRequest {
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    pub fn validate(&self, limits: &AdmissionLimits) -> Result<GenerationParams, JobError> {
        let prompt = self
            .prompt
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| JobError::Validation("prompt is required".to_string()))?
            .to_string();

        let format: AudioFormat = self.format.parse().map_err(JobError::Validation)?;
        let scheduler_type: SchedulerType =
            self.scheduler_type.parse().map_err(JobError::Validation)?;
        let cfg_type: CfgType = self.cfg_type.parse().map_err(JobError::Validation)?;

        let duration = self.audio_duration;
        if !duration.is_finite() || duration <= 0.0 {
            return Err(JobError::Validation(format!(
                "audio_duration must be a positive number of seconds, got {duration}"
            )));
        }
        if duration > limits.max_audio_duration_secs {
            return Err(JobError::Validation(format!(
                "audio_duration {duration} exceeds the maximum of {} seconds",
                limits.max_audio_duration_secs
            )));
        }

        if self.infer_step == 0 || self.infer_step > limits.max_infer_steps {
            return Err(JobError::Validation(format!(
                "infer_step must be between 1 and {}, got {}",
                limits.max_infer_steps, self.infer_step
            )));
        }

        require_finite("omega_scale", self.omega_scale)?;
        require_finite("guidance_scale_text", self.guidance_scale_text)?;
        require_finite("guidance_scale_lyric", self.guidance_scale_lyric)?;
        require_non_negative("guidance_scale", self.guidance_scale)?;
        require_non_negative("min_guidance_scale", self.min_guidance_scale)?;
        require_unit_interval("guidance_interval", self.guidance_interval)?;
        require_unit_interval("guidance_interval_decay", self.guidance_interval_decay)?;
        require_unit_interval("ref_audio_strength", self.ref_audio_strength)?;

        let manual_seeds = parse_number_list::<u64>("manual_seeds", self.manual_seeds.as_deref())?;
        let oss_steps = parse_number_list::<u32>("oss_steps", self.oss_steps.as_deref())?;

        let ref_audio_input = self
            .ref_audio_input
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from);
        if self.audio2audio_enable && ref_audio_input.is_none() {
            return Err(JobError::Validation(
                "audio2audio_enable requires ref_audio_input".to_string(),
            ));
        }

        let lora_name = self.lora_name_or_path.trim();
        let lora = if lora_name.is_empty() || lora_name.eq_ignore_ascii_case(NO_LORA) {
            None
        } else {
            require_finite("lora_weight", self.lora_weight)?;
            Some(LoraAdapter {
                name_or_path: lora_name.to_string(),
                weight: self.lora_weight,
            })
        };

        Ok(GenerationParams {
            format,
            audio_duration: duration,
            prompt,
            lyrics: self.lyrics.clone(),
            infer_step: self.infer_step,
            guidance_scale: self.guidance_scale,
            scheduler_type,
            cfg_type,
            omega_scale: self.omega_scale,
            manual_seeds,
            guidance_interval: self.guidance_interval,
            guidance_interval_decay: self.guidance_interval_decay,
            min_guidance_scale: self.min_guidance_scale,
            use_erg_tag: self.use_erg_tag,
            use_erg_lyric: self.use_erg_lyric,
            use_erg_diffusion: self.use_erg_diffusion,
            oss_steps,
            guidance_scale_text: self.guidance_scale_text,
            guidance_scale_lyric: self.guidance_scale_lyric,
            audio2audio_enable: self.audio2audio_enable,
            ref_audio_strength: self.ref_audio_strength,
            ref_audio_input,
            lora,
            hold_in_memory: self.return_file_data,
        })
    }
}

fn require_finite(field: &str, value: f64) -> Result<(), JobError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(JobError::Validation(format!(
            "{field} must be a finite number"
        )))
    }
}

fn require_non_negative(field: &str, value: f64) -> Result<(), JobError> {
    require_finite(field, value)?;
    if value < 0.0 {
        return Err(JobError::Validation(format!(
            "{field} must not be negative, got {value}"
        )));
    }
    Ok(())
}

fn require_unit_interval(field: &str, value: f64) -> Result<(), JobError> {
    require_finite(field, value)?;
    if !(0.0..=1.0).contains(&value) {
        return Err(JobError::Validation(format!(
            "{field} must be within [0, 1], got {value}"
        )));
    }
    Ok(())
}

/// Parses `"1, 2,3"`; `None` and blank strings mean "not set".
fn parse_number_list<T: FromStr>(field: &str, raw: Option<&str>) -> Result<Vec<T>, JobError> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(Vec::new());
    };

    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<T>().map_err(|_| {
                JobError::Validation(format!(
                    "{field} must be a comma-separated list of non-negative integers, got '{raw}'"
                ))
            })
        })
        .collect()
}
