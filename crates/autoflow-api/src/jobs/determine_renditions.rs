//! `determine_renditions`: choose the HLS rendition ladder for a source file
//! from its ffprobe output.
//!
//! Args:
//! - `ffprobe_output` (required): the JSON printed by
//!   `ffprobe -show_streams -of json`, usually `${probe.output}`.
//!
//! Output: `{ audio: [...], video: [...], needs_subtitle_download: bool }`.

use autoflow_core::queue::handler::{JobContext, JobError, JobHandler};
use autoflow_types::queue::JobResult;
use serde::{Deserialize, Serialize};

pub const BINDING: &str = "determine_renditions";

/// Frame rate assumed when the source rate is missing or unparseable.
const FALLBACK_FPS: f64 = 30.0;

// ---------------------------------------------------------------------------
// ffprobe input
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<Stream>,
}

#[derive(Debug, Default, Deserialize)]
struct Stream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    height: Option<u32>,
    channels: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    color_transfer: Option<String>,
    color_space: Option<String>,
    #[serde(default)]
    side_data_list: Vec<SideData>,
}

#[derive(Debug, Default, Deserialize)]
struct SideData {
    side_data_type: Option<String>,
}

impl ProbeOutput {
    fn first(&self, codec_type: &str) -> Option<&Stream> {
        self.streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(codec_type))
    }
}

// ---------------------------------------------------------------------------
// Rendition plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioRendition {
    pub variant_name: &'static str,
    pub bitrate: &'static str,
    pub channels: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoRendition {
    pub variant_name: &'static str,
    /// `None` keeps the source dimensions.
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub bitrate: &'static str,
    pub fps: &'static str,
    pub is_hdr: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenditionPlan {
    pub audio: Vec<AudioRendition>,
    pub video: Vec<VideoRendition>,
    pub needs_subtitle_download: bool,
}

/// Parse an ffprobe rate such as `24000/1001` or `25`.
fn parse_frame_rate(rate: &str) -> Option<f64> {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den != 0.0).then(|| num / den)
        }
        None => rate.trim().parse().ok(),
    }
}

fn is_hdr(video: &Stream) -> bool {
    let transfer = video.color_transfer.as_deref();
    let dolby_vision = video.side_data_list.iter().any(|sd| {
        sd.side_data_type
            .as_deref()
            .is_some_and(|t| t.contains("DOVI"))
    });

    matches!(transfer, Some("smpte2084" | "arib-std-b67"))
        || video.color_space.as_deref() == Some("bt2020nc")
        || dolby_vision
}

/// Output frame rate: 59.94 for high frame rate sources, else 29.97.
fn target_fps(source_fps: f64) -> &'static str {
    if source_fps >= 50.0 {
        "60000/1001"
    } else {
        "30000/1001"
    }
}

fn video_ladder(height: u32, fps: &'static str, is_hdr: bool) -> Vec<VideoRendition> {
    let rung = |variant_name, width, height, bitrate| VideoRendition {
        variant_name,
        width: Some(width),
        height: Some(height),
        bitrate,
        fps,
        is_hdr,
    };

    match height {
        2160.. => vec![
            rung("video_4k", 3840, 2160, "25M"),
            rung("video_1080p", 1920, 1080, "12M"),
            rung("video_720p", 1280, 720, "5M"),
        ],
        1080..=2159 => vec![
            rung("video_1080p", 1920, 1080, "12M"),
            rung("video_720p", 1280, 720, "5M"),
        ],
        720..=1079 => vec![rung("video_720p", 1280, 720, "5M")],
        _ => vec![VideoRendition {
            variant_name: "video_source",
            width: None,
            height: None,
            bitrate: "3M",
            fps,
            is_hdr,
        }],
    }
}

fn plan(probe: &ProbeOutput) -> Result<(RenditionPlan, String), JobError> {
    let video = probe
        .first("video")
        .ok_or_else(|| JobError::fatal("ffprobe output has no video stream"))?;

    let height = video.height.unwrap_or(0);
    let source_fps = video
        .r_frame_rate
        .as_deref()
        .or(video.avg_frame_rate.as_deref())
        .and_then(parse_frame_rate)
        .unwrap_or(FALLBACK_FPS);
    let hdr = is_hdr(video);
    let fps = target_fps(source_fps);

    let channels = probe
        .first("audio")
        .map(|a| a.channels.unwrap_or(0))
        .unwrap_or(2);

    // Image-based PGS subtitles cannot be converted to WebVTT.
    let needs_subtitle_download = match probe.first("subtitle") {
        None => true,
        Some(sub) => sub.codec_name.as_deref() == Some("hdmv_pgs_subtitle"),
    };

    let mut audio = vec![AudioRendition {
        variant_name: "audio_stereo",
        bitrate: "192k",
        channels: 2,
    }];
    if channels >= 6 {
        audio.push(AudioRendition {
            variant_name: "audio_surround",
            bitrate: "320k",
            channels: 6,
        });
    }
    let video_renditions = video_ladder(height, fps, hdr);

    let summary = format!(
        "source {height}p @ {source_fps:.2}fps, {}, {channels}ch, subtitles: {} -> {fps}, {} audio, {} video",
        if hdr { "HDR" } else { "SDR" },
        if needs_subtitle_download { "download" } else { "extract" },
        audio.len(),
        video_renditions.len(),
    );

    Ok((
        RenditionPlan {
            audio,
            video: video_renditions,
            needs_subtitle_download,
        },
        summary,
    ))
}

pub struct DetermineRenditionsJob;

impl JobHandler for DetermineRenditionsJob {
    async fn run(&self, ctx: JobContext) -> Result<JobResult, JobError> {
        let raw = ctx
            .args
            .get("ffprobe_output")
            .filter(|v| !v.is_null())
            .ok_or_else(|| JobError::fatal("ffprobe_output is required"))?;
        let probe: ProbeOutput = serde_json::from_value(raw.clone())
            .map_err(|e| JobError::fatal(format!("invalid ffprobe_output: {e}")))?;

        let (plan, summary) = plan(&probe)?;
        tracing::info!(job_id = %ctx.job_id, "{summary}");

        let data = serde_json::to_value(&plan)
            .map_err(|e| JobError::fatal(format!("failed to encode renditions: {e}")))?;
        Ok(JobResult::new(data))
    }
}
