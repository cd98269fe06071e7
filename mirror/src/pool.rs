//! Bounded worker pool executing transcode and copy tasks

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::action::{extension_of, Action};
use crate::error::{MirrorError, Result};
use crate::metadata::FileStamp;

/// External encoder invocation, shared read-only by every worker
#[derive(Debug, Clone)]
pub struct Encoder {
    program: String,
    args: Vec<String>,
}

impl Encoder {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Make sure the encoder binary can be started at all.
    ///
    /// Only the spawn matters here; the exit status of `--version` is ignored.
    pub async fn probe(&self) -> Result<()> {
        Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|_| ())
            .map_err(|e| MirrorError::EncoderMissing {
                program: self.program.clone(),
                message: e.to_string(),
            })
    }

    /// Run `<program> <source> <destination> <args...>`; true on exit code zero
    pub async fn encode(&self, source: &Path, destination: &Path) -> Result<bool> {
        let output = Command::new(&self.program)
            .arg(source)
            .arg(destination)
            .args(&self.args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| MirrorError::EncoderSpawn {
                path: source.to_path_buf(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            debug!(
                source = %source.display(),
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "encoder exited with failure"
            );
        }
        Ok(output.status.success())
    }
}

/// A unit of work owned by the pool until it reports back
#[derive(Debug, Clone)]
pub struct PendingTask {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub action: Action,
    /// Store key of the source file; `None` when the file is not tracked
    pub key: Option<String>,
    /// Source stamp observed when the task was decided
    pub stamp: FileStamp,
}

/// What a finished task actually wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Transcoded,
    Copied,
    /// Encoder refused the input; the source was copied here instead
    FallbackCopied(PathBuf),
    Ignored,
}

#[derive(Debug)]
pub struct TaskReport {
    seq: u64,
    pub task: PendingTask,
    pub result: Result<TaskOutcome>,
}

/// Run one task to completion
pub async fn execute(task: &PendingTask, encoder: &Encoder) -> Result<TaskOutcome> {
    match task.action {
        Action::Transcode => {
            let fallback = fallback_destination(&task.destination, &task.source);
            if encoder.encode(&task.source, &task.destination).await? {
                info!(source = %task.source.display(), destination = %task.destination.display(), "converted");
                if fallback != task.destination && fs::metadata(&fallback).await.is_ok() {
                    match fs::remove_file(&fallback).await {
                        Ok(()) => debug!(path = %fallback.display(), "removed superseded fallback copy"),
                        Err(e) => warn!(path = %fallback.display(), "failed to remove fallback copy: {}", e),
                    }
                }
                return Ok(TaskOutcome::Transcoded);
            }

            warn!(source = %task.source.display(), "Falling back to copy");
            match fs::remove_file(&task.destination).await {
                Ok(()) => debug!(path = %task.destination.display(), "removed partial encoder output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %task.destination.display(), "failed to remove partial output: {}", e),
            }

            copy_file(&task.source, &fallback).await?;
            Ok(TaskOutcome::FallbackCopied(fallback))
        }
        Action::Copy => {
            copy_file(&task.source, &task.destination).await?;
            debug!(source = %task.source.display(), destination = %task.destination.display(), "copied");
            Ok(TaskOutcome::Copied)
        }
        Action::Ignore => Ok(TaskOutcome::Ignored),
    }
}

/// Where a transcode that the encoder refused is copied instead: the
/// destination with the source's own extension
pub fn fallback_destination(destination: &Path, source: &Path) -> PathBuf {
    match extension_of(source) {
        Some(ext) => destination.with_extension(ext),
        None => destination.with_extension(""),
    }
}

async fn copy_file(source: &Path, destination: &Path) -> Result<()> {
    fs::copy(source, destination).await.map_err(|e| {
        MirrorError::copy_error(source, destination, format!("Failed to copy file: {}", e))
    })?;
    Ok(())
}

/// Fixed-width pool of concurrent tasks.
///
/// Completed reports are handed back to the caller, which stays the only
/// place where shared state (the metadata store) is mutated.
pub struct WorkerPool {
    encoder: Arc<Encoder>,
    width: usize,
    wait_per_task: Option<Duration>,
    tasks: JoinSet<TaskReport>,
    next_seq: u64,
}

impl WorkerPool {
    pub fn new(width: usize, encoder: Encoder) -> Self {
        Self {
            encoder: Arc::new(encoder),
            width: width.max(1),
            wait_per_task: None,
            tasks: JoinSet::new(),
            next_seq: 0,
        }
    }

    /// Block after every submission until that task finishes or `timeout` elapses
    pub fn with_wait_per_task(mut self, timeout: Duration) -> Self {
        self.wait_per_task = Some(timeout);
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Submit a task, returning whatever finished in the meantime.
    ///
    /// When `width` tasks are already running this waits for one to finish
    /// first, which bounds the number of in-flight tasks.
    pub async fn submit(&mut self, task: PendingTask) -> Vec<Result<TaskReport>> {
        let mut finished = Vec::new();

        while self.tasks.len() >= self.width {
            match self.tasks.join_next().await {
                Some(joined) => finished.push(joined.map_err(|e| MirrorError::Task(e.to_string()))),
                None => break,
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let encoder = Arc::clone(&self.encoder);
        self.tasks.spawn(async move {
            let result = execute(&task, &encoder).await;
            TaskReport { seq, task, result }
        });

        if let Some(timeout) = self.wait_per_task {
            self.wait_for(seq, timeout, &mut finished).await;
        }

        while let Some(joined) = self.tasks.try_join_next() {
            finished.push(joined.map_err(|e| MirrorError::Task(e.to_string())));
        }

        finished
    }

    async fn wait_for(&mut self, seq: u64, timeout: Duration, finished: &mut Vec<Result<TaskReport>>) {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.tasks.join_next()).await {
                Ok(Some(Ok(report))) => {
                    let done = report.seq == seq;
                    finished.push(Ok(report));
                    if done {
                        return;
                    }
                }
                Ok(Some(Err(e))) => finished.push(Err(MirrorError::Task(e.to_string()))),
                Ok(None) => return,
                Err(_) => {
                    warn!(timeout_secs = timeout.as_secs(), "task still running after wait timeout, continuing");
                    return;
                }
            }
        }
    }

    /// Wait for every in-flight task
    pub async fn drain(&mut self) -> Vec<Result<TaskReport>> {
        let mut finished = Vec::with_capacity(self.tasks.len());
        while let Some(joined) = self.tasks.join_next().await {
            finished.push(joined.map_err(|e| MirrorError::Task(e.to_string())));
        }
        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn stamp() -> FileStamp {
        FileStamp { size: 0, last_modified: 0.0 }
    }

    fn task(source: PathBuf, destination: PathBuf, action: Action) -> PendingTask {
        PendingTask {
            source,
            destination,
            action,
            key: None,
            stamp: stamp(),
        }
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[tokio::test]
    async fn test_probe_missing_encoder() {
        let encoder = Encoder::new("definitely-not-an-encoder-binary", Vec::new());
        let err = encoder.probe().await.unwrap_err();
        assert!(matches!(err, MirrorError::EncoderMissing { .. }));
    }

    #[tokio::test]
    async fn test_copy_task() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("c.png");
        let dest = temp_dir.path().join("out.png");
        fs::write(&source, b"\x89PNG").await.unwrap();

        let encoder = Encoder::new("unused", Vec::new());
        let outcome = execute(&task(source, dest.clone(), Action::Copy), &encoder).await.unwrap();

        assert_eq!(outcome, TaskOutcome::Copied);
        assert_eq!(fs::read(&dest).await.unwrap(), b"\x89PNG");
    }

    #[tokio::test]
    async fn test_copy_into_missing_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("c.png");
        fs::write(&source, b"x").await.unwrap();
        let dest = temp_dir.path().join("no").join("such").join("c.png");

        let encoder = Encoder::new("unused", Vec::new());
        let err = execute(&task(source, dest, Action::Copy), &encoder).await.unwrap_err();
        assert!(matches!(err, MirrorError::FileCopy { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_transcode_passes_arguments() {
        let temp_dir = TempDir::new().unwrap();
        let script = write_script(temp_dir.path(), "enc", r#"echo "$3 $4" > "$2""#);
        let source = temp_dir.path().join("a.wav");
        let dest = temp_dir.path().join("a.opus");
        fs::write(&source, b"wave").await.unwrap();

        let encoder = Encoder::new(
            script.to_string_lossy(),
            vec!["--cvbr".to_string(), "--quiet".to_string()],
        );
        let outcome = execute(&task(source, dest.clone(), Action::Transcode), &encoder).await.unwrap();

        assert_eq!(outcome, TaskOutcome::Transcoded);
        assert_eq!(fs::read_to_string(&dest).await.unwrap(), "--cvbr --quiet\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_transcode_failure_falls_back_to_copy() {
        let temp_dir = TempDir::new().unwrap();
        let script = write_script(temp_dir.path(), "enc", r#"echo partial > "$2"; exit 1"#);
        let source = temp_dir.path().join("vorbis.ogg");
        let dest = temp_dir.path().join("out").join("vorbis.opus");
        fs::create_dir_all(dest.parent().unwrap()).await.unwrap();
        fs::write(&source, b"OggS vorbis").await.unwrap();

        let encoder = Encoder::new(script.to_string_lossy(), Vec::new());
        let outcome = execute(&task(source, dest.clone(), Action::Transcode), &encoder).await.unwrap();

        let fallback = temp_dir.path().join("out").join("vorbis.ogg");
        assert_eq!(outcome, TaskOutcome::FallbackCopied(fallback.clone()));
        assert_eq!(fs::read(&fallback).await.unwrap(), b"OggS vorbis");
        assert!(!dest.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_transcode_replaces_fallback_copy() {
        let temp_dir = TempDir::new().unwrap();
        let script = write_script(temp_dir.path(), "enc", r#"cp "$1" "$2""#);
        let source = temp_dir.path().join("vorbis.ogg");
        let dest = temp_dir.path().join("out").join("vorbis.opus");
        let stale = temp_dir.path().join("out").join("vorbis.ogg");
        fs::create_dir_all(dest.parent().unwrap()).await.unwrap();
        fs::write(&source, b"OggS vorbis").await.unwrap();
        fs::write(&stale, b"old copy").await.unwrap();

        let encoder = Encoder::new(script.to_string_lossy(), Vec::new());
        let outcome = execute(&task(source, dest.clone(), Action::Transcode), &encoder).await.unwrap();

        assert_eq!(outcome, TaskOutcome::Transcoded);
        assert!(dest.exists());
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn test_pool_bounds_in_flight_tasks() {
        let temp_dir = TempDir::new().unwrap();
        let mut pool = WorkerPool::new(2, Encoder::new("unused", Vec::new()));
        let mut reports = Vec::new();

        for i in 0..5 {
            let source = temp_dir.path().join(format!("{}.txt", i));
            fs::write(&source, format!("file {}", i)).await.unwrap();
            let dest = temp_dir.path().join(format!("{}.copy", i));
            reports.extend(pool.submit(task(source, dest, Action::Copy)).await);
            assert!(pool.in_flight() <= 2);
        }
        reports.extend(pool.drain().await);

        assert_eq!(pool.in_flight(), 0);
        assert_eq!(reports.len(), 5);
        assert!(reports.iter().all(|r| matches!(r, Ok(report) if report.result.is_ok())));
        for i in 0..5 {
            assert!(temp_dir.path().join(format!("{}.copy", i)).exists());
        }
    }

    #[tokio::test]
    async fn test_wait_per_task_reports_immediately() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("a.txt");
        fs::write(&source, b"a").await.unwrap();

        let mut pool = WorkerPool::new(4, Encoder::new("unused", Vec::new()))
            .with_wait_per_task(Duration::from_secs(30));
        let reports = pool
            .submit(task(source, temp_dir.path().join("b.txt"), Action::Copy))
            .await;

        assert_eq!(reports.len(), 1);
        assert_eq!(pool.in_flight(), 0);
    }
}
