// FFmpeg transcoder
//
// Reads the room's RTP described by `stream.sdp` and writes an HLS playlist
// with its segments next to it.

use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
};

use super::{TranscodeJob, TranscodeProcess, Transcoder};
use crate::{Result, SfuError};

/// Runs `ffmpeg` as the transcoder
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Command line arguments for `job`
    pub fn arguments(job: &TranscodeJob) -> Vec<String> {
        let segments = job.output_dir.join("%03d.ts");
        let mut args: Vec<String> = ["-protocol_whitelist", "file,udp,rtp", "-i"]
            .iter()
            .map(|arg| arg.to_string())
            .collect();
        args.push(job.sdp_path.to_string_lossy().into_owned());
        args.extend(
            [
                "-c:v",
                "libx264",
                "-preset",
                "ultrafast",
                "-b:v",
                "3000k",
                "-c:a",
                "aac",
                "-b:a",
                "128k",
                "-f",
                "hls",
                "-hls_time",
                "4",
                "-hls_list_size",
                "6",
                "-hls_segment_filename",
            ]
            .iter()
            .map(|arg| arg.to_string()),
        );
        args.push(segments.to_string_lossy().into_owned());
        args.push(job.playlist_path.to_string_lossy().into_owned());
        args
    }
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn spawn(&self, job: &TranscodeJob) -> Result<Box<dyn TranscodeProcess>> {
        let mut child = Command::new(&self.binary)
            .args(Self::arguments(job))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                SfuError::ExternalProcess(format!("failed to start {}: {}", self.binary.display(), err))
            })?;

        if let Some(stderr) = child.stderr.take() {
            let room_id = job.room_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::trace!(room_id = %room_id, "ffmpeg: {}", line);
                }
            });
        }

        tracing::info!(
            room_id = %job.room_id,
            pid = ?child.id(),
            media_port = job.media_port,
            control_port = job.control_port,
            "FFmpeg started"
        );
        Ok(Box::new(FfmpegProcess { child }))
    }
}

struct FfmpegProcess {
    child: Child,
}

#[async_trait]
impl TranscodeProcess for FfmpegProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> Result<()> {
        // SIGKILL on unix; the child is reaped by `kill`.
        self.child.kill().await?;
        Ok(())
    }
}
