// THEORY:
// The `pipeline` module is the top-level API of the gesture engine. One call to
// `GesturePipeline::process` is one run: it validates the submission, takes
// exclusive ownership of the output store, walks every frame through the
// keypoint → crop → classify path, materializes the artifacts, and publishes the
// finished report in a single swap.
//
// Key architectural principles:
// 1.  **Validate Before Mutating**: The extension is checked, the file is opened and
//     the first frame decoded before the store is touched.
// 2.  **All Or Nothing**: Artifacts are written into a staging directory. Only after
//     the report is published are they moved into the store. A run that fails at
//     any point leaves the previous run's artifacts and report exactly as they were.
// 3.  **Run-Scoped Context**: Everything a run mutates (the store's write guard, the
//     staging directory and the report under construction) lives in a `RunContext`
//     passed down the call chain, never in ambient state. Holding the write guard
//     for the whole run serializes overlapping runs and keeps video readers out of
//     a store that is being rewritten.
// 4.  **Sequential Frames**: Video frames are processed strictly in decode order
//     because the best-gesture table carries state from one frame to the next.

use crate::collaborators::{GestureClassifier, PoseProvider, VideoBackend, VideoSource};
use crate::config::PipelineConfig;
use crate::core_modules::annotate::{draw_hand_landmarks, draw_pose};
use crate::core_modules::gesture_aggregator::{
    BestGestureRecord, BestGestureTable, evaluate_person,
};
use crate::core_modules::keypoint_analyzer::Person;
use crate::core_modules::media_encoder::{
    OUTPUT_IMAGE, OUTPUT_VIDEO, encode_inline, gesture_artifact_name, to_base64,
};
use crate::core_modules::output_store::{OutputStore, SharedOutputStore, StagedRun};
use crate::core_modules::poll_data::PollData;
use crate::core_modules::poll_data_store::PollDataStore;
use crate::error::{PipelineError, PipelineResult};
use image::{ImageReader, RgbImage};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLockWriteGuard;
use tracing::{debug, info};

pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "webp"];
pub const VIDEO_EXTENSIONS: [&str; 2] = ["mp4", "webm"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    /// Classifies a declared extension (case-insensitive, with or without a dot).
    pub fn from_extension(extension: &str) -> PipelineResult<Self> {
        let ext = extension.trim_start_matches('.').to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Ok(MediaKind::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Ok(MediaKind::Video)
        } else {
            Err(PipelineError::UnsupportedMediaType(extension.to_string()))
        }
    }
}

/// A submission that passed validation and is ready to process.
enum OpenedMedia {
    Image(RgbImage),
    Video {
        source: Box<dyn VideoSource>,
        first_frame: RgbImage,
    },
}

/// State owned by a single run.
///
/// Fields drop in order, so the staging directory is gone before the guard is released.
struct RunContext<'a> {
    staged: StagedRun,
    store: RwLockWriteGuard<'a, OutputStore>,
    report: PollData,
}

/// The main, top-level struct for the gesture engine.
pub struct GesturePipeline {
    config: PipelineConfig,
    pose: Box<dyn PoseProvider>,
    classifier: Box<dyn GestureClassifier>,
    video: Arc<dyn VideoBackend>,
    store: SharedOutputStore,
    reports: Arc<PollDataStore>,
}

impl GesturePipeline {
    pub fn new(
        config: PipelineConfig,
        pose: Box<dyn PoseProvider>,
        classifier: Box<dyn GestureClassifier>,
        video: Arc<dyn VideoBackend>,
        store: SharedOutputStore,
        reports: Arc<PollDataStore>,
    ) -> Self {
        Self {
            config,
            pose,
            classifier,
            video,
            store,
            reports,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Processes one submitted file end to end and publishes its report.
    ///
    /// Blocks on the output store's write lock; call it from a blocking context.
    pub fn process(&mut self, input: &Path, extension: &str) -> PipelineResult<Arc<PollData>> {
        let started = Instant::now();
        let media = self.open_media(input, extension)?;

        let store = self.store.clone();
        let mut guard = store.blocking_write();
        let staged = guard.stage()?;
        let mut ctx = RunContext {
            staged,
            store: guard,
            report: PollData::default(),
        };

        match media {
            OpenedMedia::Image(frame) => self.run_image(&mut ctx, frame)?,
            OpenedMedia::Video {
                source,
                first_frame,
            } => self.run_video(&mut ctx, source, first_frame)?,
        }

        let RunContext {
            staged,
            mut store,
            report,
        } = ctx;
        let published = self.reports.update(report)?;
        let artifacts = store.commit(staged)?;
        info!(
            people = published.people_detected.count,
            gestures = published.gestures_detected.count,
            artifacts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "run complete"
        );
        Ok(published)
    }

    fn open_media(&self, input: &Path, extension: &str) -> PipelineResult<OpenedMedia> {
        let kind = MediaKind::from_extension(extension)?;
        if !input.is_file() {
            return Err(PipelineError::MissingFile);
        }

        match kind {
            MediaKind::Image => {
                let frame = ImageReader::open(input)?
                    .with_guessed_format()?
                    .decode()
                    .map_err(|e| PipelineError::CorruptMedia(e.to_string()))?
                    .to_rgb8();
                Ok(OpenedMedia::Image(frame))
            }
            MediaKind::Video => {
                let mut source = self.video.open(input)?;
                let first_frame = source.next_frame()?.ok_or_else(|| {
                    PipelineError::CorruptMedia("video contains no frames".into())
                })?;
                Ok(OpenedMedia::Video {
                    source,
                    first_frame,
                })
            }
        }
    }

    fn run_image(&mut self, ctx: &mut RunContext<'_>, frame: RgbImage) -> PipelineResult<()> {
        let people = self.detect_people(&frame)?;
        ctx.report.people_detected.count = people.len() as u32;

        for person in &people {
            // Images do not compete: every usable observation is reported.
            for mut record in self.evaluate(person, &frame)? {
                self.annotate_gesture(&mut record);
                self.materialize_gesture(ctx, &record)?;
            }
        }

        let annotated = self.annotate_frame(&frame, &people);
        let quality = self.config.jpeg_quality;
        ctx.staged.write_jpeg(OUTPUT_IMAGE, &annotated, quality)?;
        ctx.report.people_detected.media = encode_inline(&annotated, quality)?;
        Ok(())
    }

    fn run_video(
        &mut self,
        ctx: &mut RunContext<'_>,
        mut source: Box<dyn VideoSource>,
        first_frame: RgbImage,
    ) -> PipelineResult<()> {
        let fps = source
            .fps()
            .filter(|fps| fps.is_finite() && *fps > 0.0)
            .unwrap_or(self.config.default_fps);
        let mut sink = self.video.create_sink(
            &ctx.staged.video_path(),
            source.width(),
            source.height(),
            fps,
        )?;

        let mut table = BestGestureTable::new();
        let mut frames = 0u64;
        let mut next = Some(first_frame);

        while let Some(frame) = next {
            let people = self.detect_people(&frame)?;
            sink.write_frame(&self.annotate_frame(&frame, &people))?;
            // The reported head count is that of the final frame.
            ctx.report.people_detected.count = people.len() as u32;

            for person in &people {
                for record in self.evaluate(person, &frame)? {
                    if table.offer(record) {
                        debug!(frame = frames, "best gesture updated");
                    }
                }
            }

            frames += 1;
            next = source.next_frame()?;
        }
        sink.finish()?;
        info!(frames, fps, candidates = table.len(), "video decoded");

        ctx.report.people_detected.media = to_base64(&ctx.staged.read(OUTPUT_VIDEO)?);

        for mut record in table.into_records() {
            self.annotate_gesture(&mut record);
            if record.image.as_raw().iter().all(|&b| b == 0) {
                debug!(key = %record.key, "dropping all-black crop");
                continue;
            }
            self.materialize_gesture(ctx, &record)?;
        }
        Ok(())
    }

    fn detect_people(&mut self, frame: &RgbImage) -> PipelineResult<Vec<Person>> {
        let mut people = self.pose.detect(frame)?;
        for (index, person) in people.iter_mut().enumerate() {
            person.index = index;
        }
        Ok(people)
    }

    fn evaluate(
        &mut self,
        person: &Person,
        frame: &RgbImage,
    ) -> PipelineResult<Vec<BestGestureRecord>> {
        evaluate_person(
            person,
            frame,
            self.config.gesture_threshold,
            self.config.crop_scale,
            self.classifier.as_mut(),
        )
    }

    fn annotate_frame(&self, frame: &RgbImage, people: &[Person]) -> RgbImage {
        let mut annotated = frame.clone();
        if self.config.annotate {
            draw_pose(&mut annotated, people);
        }
        annotated
    }

    fn annotate_gesture(&self, record: &mut BestGestureRecord) {
        if self.config.annotate {
            draw_hand_landmarks(&mut record.image, &record.result.landmarks);
        }
    }

    /// Stages a gesture crop and adds it to the report.
    fn materialize_gesture(
        &self,
        ctx: &mut RunContext<'_>,
        record: &BestGestureRecord,
    ) -> PipelineResult<()> {
        let quality = self.config.jpeg_quality;
        let name = gesture_artifact_name(&record.key);
        ctx.staged.write_jpeg(&name, &record.image, quality)?;
        let inline = encode_inline(&record.image, quality)?;
        ctx.report.record_gesture(&record.result.label, inline);
        Ok(())
    }
}
