//! Pose and gesture models running in helper subprocesses.
//!
//! Both models live in long-running child processes (typically Python scripts
//! wrapping a YOLO-pose model and the MediaPipe gesture recognizer) so the server
//! needs no native ML runtime. The wire protocol is the same for both:
//!
//! - on startup the child prints a single `READY` line;
//! - per request the server writes `width`, `height` and `channels` as
//!   little-endian `u32`, followed by `width * height * channels` bytes of RGB;
//! - the child answers with exactly one line of JSON.
//!
//! Pose reply: `{"people": [{"keypoints": [[x, y, conf], ...17]}], "error": null}`
//!
//! Gesture reply: `{"gesture": {"label": "Thumb_Up", "score": 0.8} | null,
//! "landmarks": [{"x": .., "y": .., "z": ..}], "error": null}`

use anyhow::{Context, Result, bail};
use image::RgbImage;
use quimpoll::core_modules::gesture_aggregator::{GestureResult, HandLandmark};
use quimpoll::core_modules::keypoint_analyzer::{Keypoint, KeypointIndex, Person};
use quimpoll::{GestureClassifier, PipelineError, PipelineResult, PoseProvider};
use serde::Deserialize;
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use tracing::{info, warn};

const READY: &str = "READY";
const RGB_CHANNELS: u32 = 3;

/// A helper process speaking the frame-in, JSON-line-out protocol.
///
/// A helper that exits is restarted on the next request.
struct HelperProcess {
    name: &'static str,
    argv: Vec<String>,
    process: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl HelperProcess {
    fn spawn(name: &'static str, argv: &[String]) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .with_context(|| format!("{name} command is empty"))?;

        info!(helper = name, command = ?argv, "starting helper process");
        let mut process = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to start {name} helper `{program}`"))?;

        let stdin = process.stdin.take().context("helper stdin unavailable")?;
        let stdout = process.stdout.take().context("helper stdout unavailable")?;
        let mut stdout = BufReader::new(stdout);

        let mut ready_line = String::new();
        stdout.read_line(&mut ready_line)?;
        if ready_line.trim() != READY {
            let _ = process.kill();
            bail!("{name} helper did not signal ready, got: {:?}", ready_line.trim());
        }
        info!(helper = name, "helper ready");

        Ok(Self {
            name,
            argv: argv.to_vec(),
            process,
            stdin,
            stdout,
        })
    }

    /// Sends one frame and returns the reply line, restarting the helper once
    /// if it has gone away.
    fn request(&mut self, frame: &RgbImage) -> io::Result<String> {
        match self.exchange(frame) {
            Err(e) if helper_gone(&e) => {
                warn!(helper = self.name, error = %e, "helper gone, restarting");
                self.respawn()?;
                self.exchange(frame)
            }
            reply => reply,
        }
    }

    fn respawn(&mut self) -> io::Result<()> {
        let fresh = HelperProcess::spawn(self.name, &self.argv)
            .map_err(|e| io::Error::other(format!("{e:#}")))?;
        // Dropping the old process reaps it.
        *self = fresh;
        Ok(())
    }

    fn exchange(&mut self, frame: &RgbImage) -> io::Result<String> {
        self.stdin.write_all(&frame.width().to_le_bytes())?;
        self.stdin.write_all(&frame.height().to_le_bytes())?;
        self.stdin.write_all(&RGB_CHANNELS.to_le_bytes())?;
        self.stdin.write_all(frame.as_raw())?;
        self.stdin.flush()?;

        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("{} helper exited", self.name),
            ));
        }
        Ok(line)
    }
}

fn helper_gone(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe)
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

#[derive(Deserialize, Debug)]
struct PersonJson {
    keypoints: Vec<[f32; 3]>,
}

#[derive(Deserialize, Debug)]
struct PoseReply {
    #[serde(default)]
    people: Vec<PersonJson>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GestureJson {
    label: String,
    score: f32,
}

#[derive(Deserialize, Debug)]
struct GestureReply {
    #[serde(default)]
    gesture: Option<GestureJson>,
    #[serde(default)]
    landmarks: Vec<HandLandmark>,
    #[serde(default)]
    error: Option<String>,
}

fn parse_pose_reply(line: &str) -> PipelineResult<Vec<Person>> {
    let reply: PoseReply = serde_json::from_str(line)
        .map_err(|e| PipelineError::Pose(format!("unparsable reply {:?}: {e}", line.trim())))?;
    if let Some(error) = reply.error {
        return Err(PipelineError::Pose(error));
    }

    let mut people = Vec::with_capacity(reply.people.len());
    for person in reply.people {
        if person.keypoints.len() != KeypointIndex::COUNT {
            warn!(
                "Expected {} keypoints, got {}",
                KeypointIndex::COUNT,
                person.keypoints.len()
            );
            continue;
        }
        let mut keypoints = [Keypoint::default(); KeypointIndex::COUNT];
        for (slot, [x, y, conf]) in keypoints.iter_mut().zip(person.keypoints) {
            *slot = Keypoint::new(x, y, conf);
        }
        people.push(Person::new(people.len(), keypoints));
    }
    Ok(people)
}

fn parse_gesture_reply(line: &str) -> PipelineResult<Option<GestureResult>> {
    let reply: GestureReply = serde_json::from_str(line)
        .map_err(|e| {
            PipelineError::Classifier(format!("unparsable reply {:?}: {e}", line.trim()))
        })?;
    if let Some(error) = reply.error {
        return Err(PipelineError::Classifier(error));
    }

    Ok(reply.gesture.map(|g| GestureResult {
        label: g.label,
        score: g.score,
        landmarks: reply.landmarks,
    }))
}

/// Pose estimation through a helper process.
pub struct SubprocessPoseProvider {
    helper: HelperProcess,
}

impl SubprocessPoseProvider {
    pub fn spawn(argv: &[String]) -> Result<Self> {
        Ok(Self {
            helper: HelperProcess::spawn("pose", argv)?,
        })
    }
}

impl PoseProvider for SubprocessPoseProvider {
    fn detect(&mut self, frame: &RgbImage) -> PipelineResult<Vec<Person>> {
        let line = self
            .helper
            .request(frame)
            .map_err(|e| PipelineError::Pose(e.to_string()))?;
        parse_pose_reply(&line)
    }
}

/// Gesture recognition through a helper process.
pub struct SubprocessGestureClassifier {
    helper: HelperProcess,
}

impl SubprocessGestureClassifier {
    pub fn spawn(argv: &[String]) -> Result<Self> {
        Ok(Self {
            helper: HelperProcess::spawn("gesture", argv)?,
        })
    }
}

impl GestureClassifier for SubprocessGestureClassifier {
    fn classify(&mut self, crop: &RgbImage) -> PipelineResult<Option<GestureResult>> {
        let line = self
            .helper
            .request(crop)
            .map_err(|e| PipelineError::Classifier(e.to_string()))?;
        parse_gesture_reply(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pose_line(people: usize, points: usize) -> String {
        let person = serde_json::json!({ "keypoints": vec![[10.0, 20.0, 0.9]; points] });
        serde_json::json!({ "people": vec![person; people], "error": null }).to_string()
    }

    #[test]
    fn pose_reply_builds_indexed_people() {
        let people = parse_pose_reply(&pose_line(2, 17)).unwrap();
        assert_eq!(people.len(), 2);
        assert_eq!(people[1].index, 1);
        assert_eq!(people[0].get(KeypointIndex::RightWrist).confidence, 0.9);
    }

    #[test]
    fn pose_reply_skips_people_with_wrong_keypoint_count() {
        let line = serde_json::json!({
            "people": [
                { "keypoints": vec![[1.0, 1.0, 0.5]; 5] },
                { "keypoints": vec![[1.0, 1.0, 0.5]; 17] }
            ]
        })
        .to_string();
        let people = parse_pose_reply(&line).unwrap();
        assert_eq!(people.len(), 1);
        assert_eq!(people[0].index, 0);
    }

    #[test]
    fn helper_errors_surface_as_collaborator_failures() {
        let err = parse_pose_reply(r#"{"people":[],"error":"model not loaded"}"#).unwrap_err();
        assert!(matches!(err, PipelineError::Pose(msg) if msg == "model not loaded"));

        let err = parse_gesture_reply("not json").unwrap_err();
        assert!(matches!(err, PipelineError::Classifier(_)));
        assert!(!err.is_input_error());
    }

    #[test]
    fn gesture_reply_carries_landmarks() {
        let line = r#"{"gesture":{"label":"Thumb_Up","score":0.8},
            "landmarks":[{"x":0.5,"y":0.25,"z":0.0}],"error":null}"#;
        let result = parse_gesture_reply(line).unwrap().unwrap();
        assert_eq!(result.label, "Thumb_Up");
        assert_eq!(result.score, 0.8);
        assert_eq!(
            result.landmarks,
            vec![HandLandmark {
                x: 0.5,
                y: 0.25,
                z: 0.0
            }]
        );
    }

    #[test]
    fn null_gesture_is_a_miss() {
        assert_eq!(parse_gesture_reply(r#"{"gesture":null,"landmarks":[]}"#).unwrap(), None);
    }

    #[test]
    fn spawn_rejects_empty_command() {
        assert!(SubprocessPoseProvider::spawn(&[]).is_err());
    }

    #[test]
    fn spawn_requires_ready_handshake() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "echo nope".to_string()];
        assert!(SubprocessGestureClassifier::spawn(&argv).is_err());
    }

    /// Answers one 2x2 crop with `Victory`, then exits.
    fn one_shot_helper() -> Vec<String> {
        let script = concat!(
            "echo READY; head -c 24 >/dev/null; ",
            r#"echo '{"gesture":{"label":"Victory","score":0.7},"landmarks":[]}'"#,
        );
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn round_trip_through_a_shell_helper() {
        let mut classifier = SubprocessGestureClassifier::spawn(&one_shot_helper()).unwrap();
        let crop = RgbImage::new(2, 2);
        let result = classifier.classify(&crop).unwrap().unwrap();
        assert_eq!(result.label, "Victory");
    }

    #[test]
    fn exited_helper_is_restarted_on_next_request() {
        let mut classifier = SubprocessGestureClassifier::spawn(&one_shot_helper()).unwrap();
        let crop = RgbImage::new(2, 2);
        for _ in 0..3 {
            let result = classifier.classify(&crop).unwrap().unwrap();
            assert_eq!(result.label, "Victory");
        }
    }

    #[test]
    fn helper_that_never_answers_fails_after_one_restart() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "echo READY".to_string()];
        let mut pose = SubprocessPoseProvider::spawn(&argv).unwrap();
        let err = pose.detect(&RgbImage::new(2, 2)).unwrap_err();
        assert!(matches!(err, PipelineError::Pose(_)));
    }
}
