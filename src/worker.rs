use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use clap::ValueEnum;
use tracing::*;

use crate::engine::{InputProps, ProgressFn, RenderEngine, StagedProps};
use crate::error::JobError;
use crate::mix;
use crate::queue::{Outcome, QueueHandle};
use crate::{JobRequest, RenderJob, VideoType};

/// What a multi-version job does after one of its video types fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum SubStepFailurePolicy {
    /// Keep rendering the remaining video types; the job still ends in error.
    #[default]
    Continue,
    /// Stop at the first failed video type.
    Abort,
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub entry_point: PathBuf,
    pub composition_id: String,
    pub output_dir: PathBuf,
    pub failure_policy: SubStepFailurePolicy,
}

pub struct Processor<E> {
    queue: QueueHandle,
    engine: Arc<E>,
    settings: ProcessorSettings,
}

impl<E: RenderEngine> Processor<E> {
    pub fn new(queue: QueueHandle, engine: Arc<E>, settings: ProcessorSettings) -> Self {
        Processor {
            queue,
            engine,
            settings,
        }
    }

    /// Renders every video type of a claimed job, writing progress and
    /// outputs into the queue as it goes.
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn process(&self, job: &RenderJob) -> Outcome {
        let mut last_error = None;

        for video_type in job.request.video_types() {
            if !self.queue.begin_sub_step(job.id, video_type) {
                debug!("Job no longer active, stopping");
                break;
            }
            info!(video_type = %video_type, "Rendering variant");

            match self.render_variant(job, video_type).await {
                Ok(output) => {
                    info!(video_type = %video_type, output = %output, "Variant rendered");
                    self.queue.record_output(job.id, video_type, output);
                }
                Err(err) => {
                    let message = format!("Error rendering {}: {}", video_type, err);
                    error!(video_type = %video_type, error = %err, "Variant failed");
                    self.queue.record_error(job.id, message.clone());
                    last_error = Some(message);
                    if self.settings.failure_policy == SubStepFailurePolicy::Abort {
                        break;
                    }
                }
            }
        }

        match last_error {
            Some(message) => Outcome::Failed(message),
            None => Outcome::Completed,
        }
    }

    async fn render_variant(&self, job: &RenderJob, video_type: VideoType) -> Result<String, JobError> {
        let staged = StagedProps::stage(input_props(&job.request, video_type)).await?;

        let bundle = self.engine.bundle(&self.settings.entry_point).await?;
        let composition = self
            .engine
            .select_composition(&bundle, &self.settings.composition_id, &staged)
            .await?;

        tokio::fs::create_dir_all(&self.settings.output_dir).await?;
        let output = self.settings.output_dir.join(output_file_name(video_type));

        let on_progress: ProgressFn = {
            let queue = self.queue.clone();
            let id = job.id;
            Arc::new(move |progress| {
                queue.report_progress(id, progress.fraction());
            })
        };
        self.engine
            .render_media(&composition, &output, &staged, on_progress)
            .await?;

        Ok(output.to_string_lossy().into_owned())
    }
}

pub fn input_props(request: &JobRequest, video_type: VideoType) -> InputProps {
    let mut metadata = request.metadata.clone();
    metadata.video_type = video_type;
    InputProps {
        audio_tracks: mix::resolve(video_type, &request.audio),
        lyrics: request.lyrics.clone(),
        duration_in_seconds: request.duration_in_seconds,
        album_art_url: request.album_art_url.clone(),
        background_image_url: request.background_for(video_type).map(String::from),
        metadata,
    }
}

pub fn output_file_name(video_type: VideoType) -> String {
    format!(
        "lyrics-video-{}-{}.mp4",
        Utc::now().timestamp_millis(),
        video_type.slug()
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::testing::ScriptedEngine;
    use crate::queue::{Claim, QueueOptions};
    use crate::{sample_request, Status};

    fn settings(output_dir: PathBuf, failure_policy: SubStepFailurePolicy) -> ProcessorSettings {
        ProcessorSettings {
            entry_point: PathBuf::from("remotion/index.ts"),
            composition_id: "LyricsVideo".into(),
            output_dir,
            failure_policy,
        }
    }

    fn claim(queue: &QueueHandle) -> RenderJob {
        match queue.claim_next() {
            Claim::Claimed { job, .. } => job,
            other => panic!("expected a claim, got {other:?}"),
        }
    }

    #[test]
    fn input_props_carry_mix_and_background_for_the_variant() {
        let mut request = sample_request();
        request.audio.vocal = Some("vocal.mp3".into());
        request.background_image_url = Some("default.png".into());
        request
            .background_images
            .insert(VideoType::VocalOnly, "vocal.png".into());

        let props = input_props(&request, VideoType::VocalOnly);
        assert_eq!(props.audio_tracks, mix::resolve(VideoType::VocalOnly, &request.audio));
        assert_eq!(props.background_image_url.as_deref(), Some("vocal.png"));
        assert_eq!(props.metadata.video_type, VideoType::VocalOnly);

        let props = input_props(&request, VideoType::LyricsVideo);
        assert_eq!(props.background_image_url.as_deref(), Some("default.png"));
    }

    #[test]
    fn output_names_carry_the_variant() {
        let name = output_file_name(VideoType::LittleVocal);
        assert!(name.starts_with("lyrics-video-"));
        assert!(name.ends_with("-little-vocal.mp4"));
    }

    #[tokio::test]
    async fn engine_ticks_drive_job_progress() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _events) = QueueHandle::new(QueueOptions::default());
        let (engine, step, mut ticks) = ScriptedEngine::new().stepped();
        let (engine, mut started) = engine.notify_started();
        let processor = Processor::new(
            queue.clone(),
            Arc::new(engine),
            settings(dir.path().to_path_buf(), SubStepFailurePolicy::Continue),
        );

        let id = queue.add(sample_request()).unwrap();
        let job = claim(&queue);
        let run = tokio::spawn(async move { processor.process(&job).await });

        assert_eq!(started.recv().await, Some(VideoType::LyricsVideo));
        for expected in [0.0, 0.5, 1.0] {
            step.add_permits(1);
            assert_eq!(ticks.recv().await.map(|tick| tick.fraction()), Some(expected));
            let job = queue.get(id).unwrap();
            assert_eq!(job.progress, expected);
            assert_eq!(job.current_video_type, Some(VideoType::LyricsVideo));
        }

        assert_eq!(started.recv().await, Some(VideoType::VocalOnly));
        let job = queue.get(id).unwrap();
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.current_video_type, Some(VideoType::VocalOnly));
        assert!(job.result.contains_key(&VideoType::LyricsVideo));

        step.add_permits(9);
        assert_eq!(run.await.unwrap(), Outcome::Completed);
        assert_eq!(queue.get(id).unwrap().result.len(), 4);
    }

    #[tokio::test]
    async fn failed_variant_does_not_stop_siblings_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _events) = QueueHandle::new(QueueOptions::default());
        let engine = Arc::new(ScriptedEngine::new().failing(VideoType::VocalOnly));
        let processor = Processor::new(
            queue.clone(),
            engine.clone(),
            settings(dir.path().to_path_buf(), SubStepFailurePolicy::Continue),
        );

        let id = queue.add(sample_request()).unwrap();
        let job = claim(&queue);
        let outcome = processor.process(&job).await;

        assert_eq!(
            outcome,
            Outcome::Failed("Error rendering Vocal Only: encoder crashed".into())
        );
        assert_eq!(engine.calls().len(), 4);
        let job = queue.get(id).unwrap();
        assert_eq!(job.result.len(), 3);
        assert!(!job.result.contains_key(&VideoType::VocalOnly));

        queue.finish(id, outcome);
        assert_eq!(queue.get(id).unwrap().status, Status::Error);
    }

    #[tokio::test]
    async fn abort_policy_stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _events) = QueueHandle::new(QueueOptions::default());
        let engine = Arc::new(ScriptedEngine::new().failing(VideoType::VocalOnly));
        let processor = Processor::new(
            queue.clone(),
            engine.clone(),
            settings(dir.path().to_path_buf(), SubStepFailurePolicy::Abort),
        );

        let id = queue.add(sample_request()).unwrap();
        let job = claim(&queue);
        assert!(matches!(processor.process(&job).await, Outcome::Failed(_)));

        let rendered: Vec<_> = engine.calls().iter().map(|call| call.video_type).collect();
        assert_eq!(rendered, vec![VideoType::LyricsVideo, VideoType::VocalOnly]);
        assert_eq!(queue.get(id).unwrap().result.len(), 1);
    }

    #[tokio::test]
    async fn cancelled_job_stops_before_next_variant() {
        let dir = tempfile::tempdir().unwrap();
        let (queue, _events) = QueueHandle::new(QueueOptions {
            event_capacity: 8,
            cancel_cooldown: Duration::from_millis(10),
        });
        let (engine, gate) = ScriptedEngine::new().gated();
        let (engine, mut started) = engine.notify_started();
        let engine = Arc::new(engine);
        let processor = Processor::new(
            queue.clone(),
            engine.clone(),
            settings(dir.path().to_path_buf(), SubStepFailurePolicy::Continue),
        );

        let id = queue.add(sample_request()).unwrap();
        let job = claim(&queue);
        let run = tokio::spawn(async move { processor.process(&job).await });

        assert_eq!(started.recv().await, Some(VideoType::LyricsVideo));
        queue.cancel();
        gate.add_permits(1);

        assert_eq!(run.await.unwrap(), Outcome::Completed);
        assert_eq!(engine.calls().len(), 1);
        let job = queue.get(id).unwrap();
        assert_eq!(job.status, Status::Error);
        assert!(job.result.is_empty());
    }
}
