// THEORY:
// Video decode and encode go through the `ffmpeg` and `ffprobe` command line tools
// instead of linked codec libraries. `ffprobe` reports the stream geometry and
// frame rate; `ffmpeg` then decodes to raw `rgb24` on a stdout pipe, and a second
// `ffmpeg` encodes raw `rgb24` arriving on a stdin pipe. Every frame crossing the
// pipes is exactly `width * height * 3` bytes.

use image::RgbImage;
use quimpoll::{PipelineError, PipelineResult, VideoBackend, VideoSink, VideoSource};
use serde::Deserialize;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg: String,
    ffprobe: String,
    codec: String,
}

impl FfmpegBackend {
    pub fn new(
        ffmpeg: impl Into<String>,
        ffprobe: impl Into<String>,
        codec: impl Into<String>,
    ) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
            codec: codec.into(),
        }
    }

    fn stream_info(&self, path: &Path) -> PipelineResult<StreamInfo> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", STREAM_ENTRIES])
            .args(["-of", "json"])
            .arg(path)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| PipelineError::Video(format!("failed to run {}: {e}", self.ffprobe)))?;

        if !output.status.success() {
            let reason = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(PipelineError::CorruptMedia(reason));
        }
        parse_stream_info(&output.stdout)
    }
}

/// Geometry and rate of the first video stream, plus both places a rotation can live:
/// the legacy `rotate` tag and the display matrix side data.
const STREAM_ENTRIES: &str = "stream=width,height,avg_frame_rate,r_frame_rate\
    :stream_tags=rotate:stream_side_data=rotation";

#[derive(Deserialize, Debug)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Deserialize, Debug)]
struct FfprobeStream {
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    #[serde(default)]
    tags: StreamTags,
    #[serde(default)]
    side_data_list: Vec<SideData>,
}

#[derive(Deserialize, Debug, Default)]
struct StreamTags {
    rotate: Option<String>,
}

#[derive(Deserialize, Debug)]
struct SideData {
    rotation: Option<f64>,
}

impl FfprobeStream {
    /// Rotation in degrees, side data first.
    fn rotation(&self) -> f64 {
        self.side_data_list
            .iter()
            .find_map(|side| side.rotation)
            .or_else(|| self.tags.rotate.as_deref().and_then(|r| r.trim().parse().ok()))
            .unwrap_or(0.0)
    }
}

/// Size and rate of the frames ffmpeg will actually emit.
#[derive(Debug, Clone, Copy, PartialEq)]
struct StreamInfo {
    width: u32,
    height: u32,
    fps: Option<f64>,
}

fn parse_stream_info(stdout: &[u8]) -> PipelineResult<StreamInfo> {
    let parsed: FfprobeOutput = serde_json::from_slice(stdout)
        .map_err(|e| PipelineError::Video(format!("unreadable ffprobe output: {e}")))?;
    let stream = parsed
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| PipelineError::CorruptMedia("no video stream".into()))?;

    match (stream.width, stream.height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => {
            let fps = stream
                .avg_frame_rate
                .as_deref()
                .and_then(parse_rate)
                .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_rate));
            // ffmpeg autorotates on decode, so quarter turns swap the coded size.
            let quarter_turn = (stream.rotation().round() as i64).rem_euclid(180) == 90;
            let (width, height) = if quarter_turn {
                (height, width)
            } else {
                (width, height)
            };
            Ok(StreamInfo { width, height, fps })
        }
        _ => Err(PipelineError::CorruptMedia("video stream has no dimensions".into())),
    }
}

/// Parses ffprobe's `num/den` rates. `0/0` means unknown.
fn parse_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/').unwrap_or((rate, "1"));
    let (num, den): (f64, f64) = (num.parse().ok()?, den.parse().ok()?);
    let fps = num / den;
    (fps.is_finite() && fps > 0.0).then_some(fps)
}

impl VideoBackend for FfmpegBackend {
    fn open(&self, path: &Path) -> PipelineResult<Box<dyn VideoSource>> {
        let info = self.stream_info(path)?;
        debug!(width = info.width, height = info.height, fps = ?info.fps, "video stream opened");

        let mut child = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-i"])
            .arg(path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PipelineError::Video(format!("failed to run {}: {e}", self.ffmpeg)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PipelineError::Video("decoder stdout unavailable".into()))?;

        Ok(Box::new(FfmpegSource {
            child,
            stdout,
            info,
        }))
    }

    fn create_sink(
        &self,
        path: &Path,
        width: u32,
        height: u32,
        fps: f64,
    ) -> PipelineResult<Box<dyn VideoSink>> {
        let mut child = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-y", "-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-s", &format!("{width}x{height}"), "-r", &fps.to_string(), "-i", "-"])
            .args(["-c:v", &self.codec, "-pix_fmt", "yuv420p"])
            // yuv420p needs even dimensions.
            .args(["-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2"])
            .args(["-movflags", "+faststart"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| PipelineError::Video(format!("failed to run {}: {e}", self.ffmpeg)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PipelineError::Video("encoder stdin unavailable".into()))?;

        Ok(Box::new(FfmpegSink {
            child,
            stdin: Some(stdin),
            width,
            height,
        }))
    }
}

struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    info: StreamInfo,
}

/// Fills `buf` as far as the reader allows; returns the number of bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl VideoSource for FfmpegSource {
    fn width(&self) -> u32 {
        self.info.width
    }

    fn height(&self) -> u32 {
        self.info.height
    }

    fn fps(&self) -> Option<f64> {
        self.info.fps
    }

    fn next_frame(&mut self) -> PipelineResult<Option<RgbImage>> {
        let mut buf = vec![0u8; self.info.width as usize * self.info.height as usize * 3];
        let filled = read_full(&mut self.stdout, &mut buf)?;
        if filled == 0 {
            let status = self.child.wait()?;
            if !status.success() {
                return Err(PipelineError::CorruptMedia(format!("decoder exited with {status}")));
            }
            return Ok(None);
        }
        if filled < buf.len() {
            warn!(filled, expected = buf.len(), "dropping truncated trailing frame");
            return Ok(None);
        }
        RgbImage::from_raw(self.info.width, self.info.height, buf)
            .map(Some)
            .ok_or_else(|| PipelineError::Video("frame buffer size mismatch".into()))
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

struct FfmpegSink {
    child: Child,
    stdin: Option<ChildStdin>,
    width: u32,
    height: u32,
}

impl VideoSink for FfmpegSink {
    fn write_frame(&mut self, frame: &RgbImage) -> PipelineResult<()> {
        if frame.dimensions() != (self.width, self.height) {
            return Err(PipelineError::Video(format!(
                "frame is {}x{}, encoder expects {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PipelineError::Video("encoder already closed".into()))?;
        stdin.write_all(frame.as_raw())?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> PipelineResult<()> {
        // Closing stdin is the end-of-stream signal.
        drop(self.stdin.take());
        let status = self.child.wait()?;
        if !status.success() {
            return Err(PipelineError::Video(format!("encoder exited with {status}")));
        }
        Ok(())
    }
}

impl Drop for FfmpegSink {
    fn drop(&mut self) {
        if self.stdin.is_some() {
            drop(self.stdin.take());
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rates_parse_from_ffprobe_fractions() {
        assert_eq!(parse_rate("30/1"), Some(30.0));
        assert!((parse_rate("30000/1001").unwrap() - 29.97).abs() < 0.01);
        assert_eq!(parse_rate("0/0"), None);
        assert_eq!(parse_rate("25"), Some(25.0));
        assert_eq!(parse_rate("abc"), None);
    }

    #[test]
    fn stream_info_prefers_average_rate() {
        let json = br#"{"streams":[{"width":640,"height":480,
            "avg_frame_rate":"0/0","r_frame_rate":"24/1"}]}"#;
        assert_eq!(
            parse_stream_info(json).unwrap(),
            StreamInfo {
                width: 640,
                height: 480,
                fps: Some(24.0)
            }
        );
    }

    #[test]
    fn missing_video_stream_is_corrupt_media() {
        let err = parse_stream_info(br#"{"streams":[]}"#).unwrap_err();
        assert!(err.is_input_error());
        let err = parse_stream_info(br#"{"streams":[{"width":0,"height":0}]}"#).unwrap_err();
        assert!(matches!(err, PipelineError::CorruptMedia(_)));
    }

    #[test]
    fn portrait_phone_video_reports_displayed_size() {
        // Newer ffprobe: display matrix side data.
        let json = br#"{"streams":[{"width":1920,"height":1080,"avg_frame_rate":"30/1",
            "side_data_list":[{"side_data_type":"Display Matrix","rotation":-90}]}]}"#;
        let info = parse_stream_info(json).unwrap();
        assert_eq!((info.width, info.height), (1080, 1920));

        // Older ffprobe: rotate tag.
        let json = br#"{"streams":[{"width":1920,"height":1080,"avg_frame_rate":"30/1",
            "tags":{"rotate":"270"}}]}"#;
        let info = parse_stream_info(json).unwrap();
        assert_eq!((info.width, info.height), (1080, 1920));
    }

    #[test]
    fn half_turn_keeps_coded_size() {
        let json = br#"{"streams":[{"width":1920,"height":1080,"avg_frame_rate":"30/1",
            "tags":{"rotate":"180"},"side_data_list":[{"rotation":180}]}]}"#;
        let info = parse_stream_info(json).unwrap();
        assert_eq!((info.width, info.height), (1920, 1080));
    }

    #[test]
    fn read_full_reports_short_reads() {
        let mut data: &[u8] = &[1, 2, 3, 4, 5];
        let mut buf = [0u8; 8];
        assert_eq!(read_full(&mut data, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn missing_ffprobe_is_a_backend_failure() {
        let backend = FfmpegBackend::new("ffmpeg", "/nonexistent/ffprobe", "libx264");
        let err = backend.open(Path::new("/tmp/whatever.mp4")).err().unwrap();
        assert!(matches!(err, PipelineError::Video(_)));
    }
}
