//! Boundary to the external rendering engine.
//!
//! The engine turns audio, lyrics and images into an mp4. This crate only
//! drives it: bundle the project entry point, pick the composition, render
//! it while listening to frame progress.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, trace};

use crate::mix::AudioTrack;
use crate::{LyricLine, SongMetadata};

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Bundle failed: {0}")]
    Bundle(String),

    #[error("Composition not found: {0}")]
    CompositionNotFound(String),

    #[error("{0}")]
    Render(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderProgress {
    pub rendered_frames: u64,
    pub total_frames: u64,
}

impl RenderProgress {
    pub fn fraction(&self) -> f64 {
        if self.total_frames == 0 {
            return 0.0;
        }
        (self.rendered_frames as f64 / self.total_frames as f64).clamp(0.0, 1.0)
    }
}

pub type ProgressFn = Arc<dyn Fn(RenderProgress) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct BundleHandle {
    pub entry_point: PathBuf,
}

#[derive(Debug, Clone)]
pub struct Composition {
    pub id: String,
    pub entry_point: PathBuf,
}

/// Props handed to the composition for one video type.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputProps {
    pub audio_tracks: Vec<AudioTrack>,
    pub lyrics: Vec<LyricLine>,
    pub duration_in_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub album_art_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub background_image_url: Option<String>,
    pub metadata: SongMetadata,
}

/// Input props written to a private temporary directory.
///
/// The directory and everything in it is removed when this is dropped.
#[derive(Debug)]
pub struct StagedProps {
    props: InputProps,
    path: PathBuf,
    _dir: TempDir,
}

impl StagedProps {
    pub async fn stage(props: InputProps) -> Result<Self, crate::JobError> {
        let dir = tempfile::Builder::new().prefix("lyricq-").tempdir()?;
        let path = dir.path().join("props.json");
        tokio::fs::write(&path, serde_json::to_vec(&props)?).await?;
        Ok(StagedProps {
            props,
            path,
            _dir: dir,
        })
    }

    pub fn props(&self) -> &InputProps {
        &self.props
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
pub trait RenderEngine: Send + Sync + 'static {
    async fn bundle(&self, entry_point: &Path) -> Result<BundleHandle, EngineError>;

    async fn select_composition(
        &self,
        bundle: &BundleHandle,
        composition_id: &str,
        props: &StagedProps,
    ) -> Result<Composition, EngineError>;

    async fn render_media(
        &self,
        composition: &Composition,
        output: &Path,
        props: &StagedProps,
        on_progress: ProgressFn,
    ) -> Result<(), EngineError>;
}

/// Drives a renderer command line such as `npx remotion`.
///
/// Children are spawned with `kill_on_drop`, so dropping a render future
/// stops the process.
#[derive(Debug, Clone)]
pub struct CommandEngine {
    program: String,
    args: Vec<String>,
}

impl CommandEngine {
    pub fn new(command_line: &str) -> Self {
        let mut parts = command_line.split_whitespace().map(String::from);
        CommandEngine {
            program: parts.next().unwrap_or_else(|| "npx".to_string()),
            args: parts.collect(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null()).kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl RenderEngine for CommandEngine {
    async fn bundle(&self, entry_point: &Path) -> Result<BundleHandle, EngineError> {
        if !tokio::fs::try_exists(entry_point).await.unwrap_or(false) {
            return Err(EngineError::Bundle(format!(
                "entry point {} does not exist",
                entry_point.display()
            )));
        }
        Ok(BundleHandle {
            entry_point: entry_point.to_path_buf(),
        })
    }

    async fn select_composition(
        &self,
        bundle: &BundleHandle,
        composition_id: &str,
        props: &StagedProps,
    ) -> Result<Composition, EngineError> {
        let output = self
            .command()
            .arg("compositions")
            .arg(&bundle.entry_point)
            .arg("--props")
            .arg(props.path())
            .arg("--quiet")
            .output()
            .await
            .map_err(|err| EngineError::Bundle(err.to_string()))?;

        if !output.status.success() {
            return Err(EngineError::Bundle(last_line(&output.stderr).unwrap_or_else(
                || format!("renderer exited with {}", output.status),
            )));
        }

        let listed = String::from_utf8_lossy(&output.stdout);
        debug!(compositions = %listed.trim(), "Listed compositions");
        if listed.split_whitespace().any(|id| id == composition_id) {
            Ok(Composition {
                id: composition_id.to_string(),
                entry_point: bundle.entry_point.clone(),
            })
        } else {
            Err(EngineError::CompositionNotFound(composition_id.to_string()))
        }
    }

    async fn render_media(
        &self,
        composition: &Composition,
        output: &Path,
        props: &StagedProps,
        on_progress: ProgressFn,
    ) -> Result<(), EngineError> {
        let mut child = self
            .command()
            .arg("render")
            .arg(&composition.entry_point)
            .arg(&composition.id)
            .arg(output)
            .arg("--props")
            .arg(props.path())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| EngineError::Render(err.to_string()))?;

        let stdout_task = child.stdout.take().map(|stdout| {
            let on_progress = on_progress.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(progress) = parse_frame_counter(&line) {
                        on_progress(progress);
                    }
                }
            })
        });

        let mut last_error_line = None;
        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                trace!(line = %line, "renderer");
                if let Some(progress) = parse_frame_counter(&line) {
                    on_progress(progress);
                } else if !line.trim().is_empty() {
                    last_error_line = Some(line);
                }
            }
        }

        let status = child
            .wait()
            .await
            .map_err(|err| EngineError::Render(err.to_string()))?;
        if let Some(task) = stdout_task {
            let _ = task.await;
        }

        if status.success() {
            Ok(())
        } else {
            Err(EngineError::Render(
                last_error_line.unwrap_or_else(|| format!("renderer exited with {}", status)),
            ))
        }
    }
}

fn last_line(bytes: &[u8]) -> Option<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
}

/// Finds a `rendered/total` frame counter anywhere in a renderer output line.
fn parse_frame_counter(line: &str) -> Option<RenderProgress> {
    line.split_whitespace().find_map(|token| {
        let token = token.trim_matches(|c: char| !c.is_ascii_digit() && c != '/');
        let (rendered, total) = token.split_once('/')?;
        let rendered_frames = rendered.parse().ok()?;
        let total_frames = total.parse().ok()?;
        (total_frames > 0 && rendered_frames <= total_frames).then_some(RenderProgress {
            rendered_frames,
            total_frames,
        })
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashSet;
    use std::sync::Mutex;

    use tokio::sync::{mpsc, Semaphore};

    use super::*;
    use crate::VideoType;

    #[derive(Debug, Clone)]
    pub(crate) struct RenderCall {
        pub video_type: VideoType,
        pub audio_tracks: Vec<AudioTrack>,
        pub background_image_url: Option<String>,
        pub output: PathBuf,
    }

    /// Engine double: replays fixed progress ticks, optionally waits on a
    /// gate before finishing each render and fails chosen video types.
    pub(crate) struct ScriptedEngine {
        ticks: Vec<RenderProgress>,
        fail: HashSet<VideoType>,
        gate: Option<Arc<Semaphore>>,
        step: Option<(Arc<Semaphore>, mpsc::UnboundedSender<RenderProgress>)>,
        started: Option<mpsc::UnboundedSender<VideoType>>,
        calls: Mutex<Vec<RenderCall>>,
    }

    impl ScriptedEngine {
        pub(crate) fn new() -> Self {
            ScriptedEngine {
                ticks: [0, 50, 100]
                    .into_iter()
                    .map(|rendered_frames| RenderProgress {
                        rendered_frames,
                        total_frames: 100,
                    })
                    .collect(),
                fail: HashSet::new(),
                gate: None,
                step: None,
                started: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing(mut self, video_type: VideoType) -> Self {
            self.fail.insert(video_type);
            self
        }

        /// Renders block until a permit is added to the returned semaphore.
        pub(crate) fn gated(mut self) -> (Self, Arc<Semaphore>) {
            let gate = Arc::new(Semaphore::new(0));
            self.gate = Some(gate.clone());
            (self, gate)
        }

        /// Each tick waits for a permit, then is echoed on the receiver once
        /// the progress callback has returned.
        pub(crate) fn stepped(
            mut self,
        ) -> (Self, Arc<Semaphore>, mpsc::UnboundedReceiver<RenderProgress>) {
            let permits = Arc::new(Semaphore::new(0));
            let (tx, rx) = mpsc::unbounded_channel();
            self.step = Some((permits.clone(), tx));
            (self, permits, rx)
        }

        pub(crate) fn notify_started(mut self) -> (Self, mpsc::UnboundedReceiver<VideoType>) {
            let (tx, rx) = mpsc::unbounded_channel();
            self.started = Some(tx);
            (self, rx)
        }

        pub(crate) fn calls(&self) -> Vec<RenderCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RenderEngine for ScriptedEngine {
        async fn bundle(&self, entry_point: &Path) -> Result<BundleHandle, EngineError> {
            Ok(BundleHandle {
                entry_point: entry_point.to_path_buf(),
            })
        }

        async fn select_composition(
            &self,
            bundle: &BundleHandle,
            composition_id: &str,
            _props: &StagedProps,
        ) -> Result<Composition, EngineError> {
            Ok(Composition {
                id: composition_id.to_string(),
                entry_point: bundle.entry_point.clone(),
            })
        }

        async fn render_media(
            &self,
            _composition: &Composition,
            output: &Path,
            props: &StagedProps,
            on_progress: ProgressFn,
        ) -> Result<(), EngineError> {
            assert!(props.path().exists(), "props must be staged during render");
            let video_type = props.props().metadata.video_type;
            self.calls.lock().unwrap().push(RenderCall {
                video_type,
                audio_tracks: props.props().audio_tracks.clone(),
                background_image_url: props.props().background_image_url.clone(),
                output: output.to_path_buf(),
            });
            if let Some(started) = &self.started {
                let _ = started.send(video_type);
            }
            for tick in &self.ticks {
                if let Some((permits, _)) = &self.step {
                    permits
                        .acquire()
                        .await
                        .map_err(|err| EngineError::Render(err.to_string()))?
                        .forget();
                }
                on_progress(*tick);
                if let Some((_, ticked)) = &self.step {
                    let _ = ticked.send(*tick);
                }
                tokio::task::yield_now().await;
            }
            if let Some(gate) = &self.gate {
                gate.acquire()
                    .await
                    .map_err(|err| EngineError::Render(err.to_string()))?
                    .forget();
            }
            if self.fail.contains(&video_type) {
                return Err(EngineError::Render("encoder crashed".into()));
            }
            Ok(())
        }
    }
}
