//! FFmpeg command builder and blocking runner.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::error::{EncodeError, EncodeResult};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Builder for FFmpeg invocations.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: PathBuf,
    output: PathBuf,
    /// Arguments placed before `-i`.
    input_args: Vec<String>,
    /// Arguments placed after `-i`.
    output_args: Vec<String>,
    overwrite: bool,
    log_level: String,
}

impl FfmpegCommand {
    pub fn new(input: impl AsRef<Path>, output: impl AsRef<Path>) -> Self {
        Self {
            input: input.as_ref().to_path_buf(),
            output: output.as_ref().to_path_buf(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "error".to_string(),
        }
    }

    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    /// First frame number of an image-sequence input.
    pub fn start_number(self, first: u32) -> Self {
        self.input_arg("-start_number").input_arg(first.to_string())
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-vcodec").output_arg(codec)
    }

    /// Fixed group-of-pictures length.
    pub fn keyframe_interval(self, frames: u32) -> Self {
        self.output_arg("-g")
            .output_arg(frames.to_string())
            .output_arg("-keyint_min")
            .output_arg(frames.to_string())
    }

    pub fn qp(self, qp: u32) -> Self {
        self.output_arg("-qp").output_arg(qp.to_string())
    }

    pub fn crf(self, crf: u8) -> Self {
        self.output_arg("-crf").output_arg(crf.to_string())
    }

    pub fn pixel_format(self, format: impl Into<String>) -> Self {
        self.output_arg("-pix_fmt").output_arg(format)
    }

    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    /// Scales both dimensions by `factor`, truncated to even pixel counts.
    pub fn scale(self, factor: f64) -> Self {
        self.video_filter(format!(
            "scale=trunc(iw*{f}/2)*2:trunc(ih*{f}/2)*2",
            f = factor
        ))
    }

    pub fn frame_limit(self, frames: u32) -> Self {
        self.output_arg("-frames:v").output_arg(frames.to_string())
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.overwrite {
            args.push("-y".to_string());
        }
        args.push("-loglevel".to_string());
        args.push(self.log_level.clone());
        args.extend(self.input_args.iter().cloned());
        args.push("-i".to_string());
        args.push(self.input.to_string_lossy().to_string());
        args.extend(self.output_args.iter().cloned());
        args.push(self.output.to_string_lossy().to_string());
        args
    }
}

/// Runs commands to completion, killing them past the timeout.
#[derive(Debug, Clone)]
pub struct FfmpegRunner {
    program: String,
    timeout: Option<Duration>,
}

impl Default for FfmpegRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegRunner {
    pub fn new() -> Self {
        Self {
            program: "ffmpeg".to_string(),
            timeout: None,
        }
    }

    /// Executable to run instead of `ffmpeg` from `PATH`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn run(&self, cmd: &FfmpegCommand) -> EncodeResult<()> {
        let args = cmd.build_args();
        log::debug!("running {} {}", self.program, args.join(" "));

        let mut child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EncodeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // Drain stderr off-thread so a chatty child cannot block on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut text = String::new();
                let _ = stderr.read_to_string(&mut text);
                text
            })
        });

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if let Some(timeout) = self.timeout {
                if started.elapsed() >= timeout {
                    log::warn!(
                        "{} timed out after {:?}, killing process",
                        self.program,
                        timeout
                    );
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(EncodeError::Timeout {
                        program: self.program.clone(),
                        secs: timeout.as_secs(),
                    });
                }
            }
            thread::sleep(POLL_INTERVAL);
        };

        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        if status.success() {
            Ok(())
        } else {
            Err(EncodeError::failed(
                &self.program,
                stderr.trim(),
                status.code(),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_args_follow_builder_order() {
        let cmd = FfmpegCommand::new("/tmp/batch/%08d.png", "/tmp/batch/temp.mp4")
            .start_number(0)
            .video_codec("libx264")
            .keyframe_interval(15)
            .qp(36)
            .pixel_format("yuv420p")
            .scale(0.8)
            .frame_limit(15);
        assert_eq!(
            cmd.build_args(),
            vec![
                "-y",
                "-loglevel",
                "error",
                "-start_number",
                "0",
                "-i",
                "/tmp/batch/%08d.png",
                "-vcodec",
                "libx264",
                "-g",
                "15",
                "-keyint_min",
                "15",
                "-qp",
                "36",
                "-pix_fmt",
                "yuv420p",
                "-vf",
                "scale=trunc(iw*0.8/2)*2:trunc(ih*0.8/2)*2",
                "-frames:v",
                "15",
                "/tmp/batch/temp.mp4",
            ]
        );
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let runner = FfmpegRunner::new().with_program("/nonexistent/ffmpeg-binary");
        let err = runner
            .run(&FfmpegCommand::new("in", "out"))
            .unwrap_err();
        assert!(matches!(err, EncodeError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_reported() {
        let runner = FfmpegRunner::new()
            .with_program("false")
            .with_timeout(Duration::from_secs(10));
        let err = runner
            .run(&FfmpegCommand::new("in", "out"))
            .unwrap_err();
        assert!(matches!(err, EncodeError::Failed { exit_code: Some(1), .. }));
    }
}
