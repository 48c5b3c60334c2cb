//! Video compression through an external codec program (ffmpeg).
//!
//! The codec is treated as a black box: this module validates the quality parameter, builds
//! the argument list, waits for the process and reports its exit status together with
//! whatever it wrote to stderr.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/*
0 = lossless
18-23 = visually lossless to most viewers
23 = default
28 = medium-low quality
51 = worst quality possible
*/
pub const MIN_QUALITY: i64 = 0;
pub const MAX_QUALITY: i64 = 51;
pub const DEFAULT_QUALITY: u8 = 23;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("invalid quality value: {0} (must be between 0-51)")]
    InvalidQuality(i64),

    #[error("input file does not exist: {}", .0.display())]
    InputMissing(PathBuf),

    #[error("codec program '{program}' not found: {source}")]
    ProgramNotFound {
        program: String,
        #[source]
        source: which::Error,
    },

    #[error("failed to start codec program '{}': {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to compress video ({status}): {stderr}")]
    Failed { status: ExitStatus, stderr: String },

    #[error("codec exited successfully but wrote no output at {}", .0.display())]
    MissingOutput(PathBuf),
}

/// A constant rate factor in `[0, 51]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quality(u8);

impl Quality {
    pub const LOSSLESS: Quality = Quality(0);
    pub const WORST: Quality = Quality(MAX_QUALITY as u8);

    pub fn new(value: i64) -> Result<Self, TranscodeError> {
        if !(MIN_QUALITY..=MAX_QUALITY).contains(&value) {
            return Err(TranscodeError::InvalidQuality(value));
        }
        Ok(Quality(value as u8))
    }

    /// Interpret an optional upload form field. Missing, unparsable or out-of-range values fall
    /// back to the default rather than failing the upload.
    pub fn from_form_field(field: Option<&str>) -> Self {
        field
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .and_then(|value| Quality::new(value).ok())
            .unwrap_or_default()
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Quality(DEFAULT_QUALITY)
    }
}

impl TryFrom<i64> for Quality {
    type Error = TranscodeError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Quality::new(value)
    }
}

/// Whether `program` resolves to an executable on `PATH` (or is an executable path).
pub fn is_available(program: &str) -> bool {
    which::which(program).is_ok()
}

#[derive(Debug, Clone)]
pub struct Transcoder {
    program: PathBuf,
}

impl Transcoder {
    /// Resolve `program` on `PATH`. A missing codec binary is reported here, at startup,
    /// instead of on the first upload.
    pub fn locate(program: &str) -> Result<Self, TranscodeError> {
        let resolved = which::which(program).map_err(|source| TranscodeError::ProgramNotFound {
            program: program.to_string(),
            source,
        })?;
        debug!(program = %resolved.display(), "Located codec program");
        Ok(Self { program: resolved })
    }

    /// Use `program` as given, without resolving it first.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(input: &Path, output: &Path, quality: Quality) -> Vec<OsString> {
        vec![
            "-i".into(),
            input.as_os_str().to_owned(),
            "-vcodec".into(),
            "libx264".into(),
            "-crf".into(),
            quality.value().to_string().into(),
            "-y".into(),
            output.as_os_str().to_owned(),
        ]
    }

    /// Compress `input` into `output`.
    ///
    /// `quality` is validated before anything else happens. On failure any partial output is
    /// removed, so an `Err` always means there is no usable file at `output`.
    pub async fn compress(
        &self,
        input: &Path,
        output: &Path,
        quality: i64,
    ) -> Result<(), TranscodeError> {
        let quality = Quality::new(quality)?;

        if !tokio::fs::try_exists(input).await.unwrap_or(false) {
            return Err(TranscodeError::InputMissing(input.to_path_buf()));
        }

        info!(
            input = %input.display(),
            output = %output.display(),
            quality = quality.value(),
            "Compressing video"
        );
        let result = Command::new(&self.program)
            .args(Self::arguments(input, output, quality))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| TranscodeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !result.status.success() {
            remove_partial_output(output).await;
            return Err(TranscodeError::Failed {
                status: result.status,
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            });
        }

        if !tokio::fs::try_exists(output).await.unwrap_or(false) {
            return Err(TranscodeError::MissingOutput(output.to_path_buf()));
        }

        info!(output = %output.display(), "Video compressed successfully");
        Ok(())
    }
}

async fn remove_partial_output(output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => debug!(output = %output.display(), "Removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(output = %output.display(), "Failed to remove partial output: {}", e),
    }
}
