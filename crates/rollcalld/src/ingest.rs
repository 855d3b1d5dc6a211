//! Bulk registration from a PDF document.
//!
//! The document's file name carries the identity (`<name>-<group>.pdf`). Every
//! embedded image is extracted into a private temporary workspace, then one
//! sub-attempt per image detects faces and submits each crop through the
//! [`Registrar`]. Per-crop results are tallied and classified:
//!
//! | registered | conflicts | outcome   |
//! |-----------:|----------:|-----------|
//! | 1          | any       | success   |
//! | > 1        | any       | failure   |
//! | 0          | > 0       | duplicate |
//! | 0          | 0         | failure   |
//!
//! The workspace is removed on every exit path.

use crate::config::Config;
use crate::engine::EngineHandle;
use crate::error::PipelineError;
use crate::pdf;
use crate::registrar::{Registrar, RegistrationStatus};
use image::{ImageFormat, RgbImage};
use rollcall_core::{FaceCandidate, IdentityKey};
use serde::Serialize;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Success,
    Failure,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentOutcome {
    pub status: DocumentStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl DocumentOutcome {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            status: DocumentStatus::Failure,
            message: message.into(),
            name: None,
            group: None,
        }
    }
}

/// Per-crop results of one document.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    pub registered: usize,
    pub conflicts: usize,
    pub failed: usize,
}

impl Tally {
    fn record(&mut self, status: &RegistrationStatus) {
        match status {
            RegistrationStatus::Registered => self.registered += 1,
            RegistrationStatus::Conflict => self.conflicts += 1,
            RegistrationStatus::Failed(_) => self.failed += 1,
        }
    }
}

pub fn classify(key: &IdentityKey, tally: Tally) -> DocumentOutcome {
    match (tally.registered, tally.conflicts) {
        (1, _) => DocumentOutcome {
            status: DocumentStatus::Success,
            message: format!("Registered 1 face: {key}."),
            name: Some(key.name.clone()),
            group: Some(key.group.clone()),
        },
        (n, _) if n > 1 => DocumentOutcome::failure(
            "Multiple faces found in the PDF. Please provide a single face.",
        ),
        (0, d) if d > 0 => DocumentOutcome {
            status: DocumentStatus::Duplicate,
            message: format!(
                "Face already registered for {} in group {}.",
                key.name, key.group
            ),
            name: None,
            group: None,
        },
        _ => DocumentOutcome::failure("No face found in any image."),
    }
}

/// Derive the identity from an uploaded document's file name.
///
/// Directories and a trailing `.pdf` (any case) are stripped, then the stem is
/// split on its first `-` into name and group. A missing or blank group falls
/// back to the default group; a blank name is an error.
pub fn parse_document_name(file_name: &str) -> Result<IdentityKey, PipelineError> {
    let base = file_name
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or(file_name);
    let stem = base
        .len()
        .checked_sub(4)
        .filter(|&i| base.get(i..).is_some_and(|ext| ext.eq_ignore_ascii_case(".pdf")))
        .map_or(base, |i| &base[..i]);

    let (name, group) = stem.split_once('-').unwrap_or((stem, ""));
    if name.trim().is_empty() {
        return Err(PipelineError::InvalidDocumentName(file_name.to_string()));
    }
    Ok(IdentityKey::new(name, group))
}

pub struct IngestPipeline {
    engine: EngineHandle,
    registrar: Arc<dyn Registrar>,
    workspace_dir: PathBuf,
    permits: Arc<Semaphore>,
    outbound_timeout: Duration,
    ingest_timeout: Duration,
    debug_artifacts: bool,
}

impl IngestPipeline {
    pub fn new(engine: EngineHandle, registrar: Arc<dyn Registrar>, config: &Config) -> Self {
        Self {
            engine,
            registrar,
            workspace_dir: config.workspace_dir.clone(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_ingestions)),
            outbound_timeout: config.outbound_timeout(),
            ingest_timeout: config.ingest_timeout(),
            debug_artifacts: config.debug_artifacts,
        }
    }

    /// Ingest one document. Never fails: every error is a classified outcome.
    pub async fn ingest(
        &self,
        file_name: &str,
        contents: Vec<u8>,
        cancel: &CancellationToken,
    ) -> DocumentOutcome {
        let span = tracing::info_span!("ingest", run = %uuid::Uuid::new_v4(), file = %file_name);
        async {
            let outcome = self.ingest_inner(file_name, contents, cancel).await;
            tracing::info!(status = ?outcome.status, message = %outcome.message, "ingestion finished");
            outcome
        }
        .instrument(span)
        .await
    }

    async fn ingest_inner(
        &self,
        file_name: &str,
        contents: Vec<u8>,
        cancel: &CancellationToken,
    ) -> DocumentOutcome {
        let key = match parse_document_name(file_name) {
            Ok(key) => key,
            Err(e) => return DocumentOutcome::failure(e.to_string()),
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return DocumentOutcome::failure(PipelineError::Cancelled.to_string()),
            permit = Arc::clone(&self.permits).acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            return DocumentOutcome::failure("ingestion is shutting down");
        };

        let workspace = match self.create_workspace() {
            Ok(dir) => dir,
            Err(e) => {
                tracing::error!(error = %e, dir = %self.workspace_dir.display(), "cannot create ingestion workspace");
                return DocumentOutcome::failure("internal error");
            }
        };
        tracing::debug!(workspace = %workspace.path().display(), "workspace created");

        let run_cancel = cancel.child_token();
        let deadline = Instant::now() + self.ingest_timeout;
        let result = self
            .run(&key, contents, workspace.path(), deadline, &run_cancel)
            .await;

        let workspace_path = workspace.path().to_path_buf();
        if let Err(e) = workspace.close() {
            tracing::warn!(error = %e, workspace = %workspace_path.display(), "failed to remove workspace");
        }

        match result {
            Ok(tally) => {
                tracing::debug!(?tally, "sub-attempts complete");
                classify(&key, tally)
            }
            Err(PipelineError::TimedOut) => {
                tracing::warn!(timeout_secs = self.ingest_timeout.as_secs(), "ingestion timed out");
                DocumentOutcome::failure(PipelineError::TimedOut.to_string())
            }
            Err(e) if e.is_internal() => {
                tracing::error!(error = %e, "ingestion failed");
                DocumentOutcome::failure("internal error")
            }
            Err(e) => DocumentOutcome::failure(e.to_string()),
        }
    }

    fn create_workspace(&self) -> std::io::Result<tempfile::TempDir> {
        std::fs::create_dir_all(&self.workspace_dir)?;
        tempfile::Builder::new()
            .prefix("ingest-")
            .tempdir_in(&self.workspace_dir)
    }

    /// Extract and fan out. Returns only after every task that might touch
    /// `workspace` has stopped, including on timeout.
    async fn run(
        &self,
        key: &IdentityKey,
        contents: Vec<u8>,
        workspace: &Path,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Tally, PipelineError> {
        let out_dir = workspace.to_path_buf();
        let extract_cancel = cancel.clone();
        let mut extraction = tokio::task::spawn_blocking(move || {
            pdf::extract_images(&contents, &out_dir, &extract_cancel)
        });
        let extraction = tokio::select! {
            joined = &mut extraction => joined?.map_err(|e| match e {
                pdf::PdfError::Cancelled => PipelineError::Cancelled,
                other => PipelineError::ExtractionFailed(other.to_string()),
            })?,
            _ = tokio::time::sleep_until(deadline) => {
                cancel.cancel();
                // The extractor stops before its next image.
                if let Some(error) = abandoned_extraction_error(extraction.await) {
                    tracing::debug!(%error, "extraction ended abnormally after ingest timeout");
                }
                return Err(PipelineError::TimedOut);
            }
        };
        tracing::info!(images = extraction.images.len(), skipped = extraction.skipped, "images extracted");

        let debug_dir = if self.debug_artifacts {
            let dir = workspace.join("debug");
            tokio::fs::create_dir_all(&dir).await?;
            Some(dir)
        } else {
            None
        };

        let mut attempts = JoinSet::new();
        for path in extraction.images {
            let attempt = SubAttempt {
                engine: self.engine.clone(),
                registrar: Arc::clone(&self.registrar),
                key: key.clone(),
                outbound_timeout: self.outbound_timeout,
                debug_dir: debug_dir.clone(),
                cancel: cancel.clone(),
            };
            attempts.spawn(attempt.run(path));
        }

        let mut tally = Tally::default();
        let joined = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = attempts.join_next().await {
                match joined {
                    Ok(statuses) => statuses.iter().for_each(|s| tally.record(s)),
                    Err(e) => {
                        tracing::warn!(error = %e, "sub-attempt aborted");
                        tally.failed += 1;
                    }
                }
            }
        })
        .await;

        if joined.is_err() {
            cancel.cancel();
            attempts.shutdown().await;
            return Err(PipelineError::TimedOut);
        }
        Ok(tally)
    }
}

/// One extracted image. Owns everything it touches.
struct SubAttempt {
    engine: EngineHandle,
    registrar: Arc<dyn Registrar>,
    key: IdentityKey,
    outbound_timeout: Duration,
    debug_dir: Option<PathBuf>,
    cancel: CancellationToken,
}

impl SubAttempt {
    async fn run(self, path: PathBuf) -> Vec<RegistrationStatus> {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let load_path = path.clone();
        let image = match tokio::task::spawn_blocking(move || image::open(&load_path)).await {
            Ok(Ok(img)) => Arc::new(img.to_rgb8()),
            Ok(Err(e)) => {
                tracing::warn!(image = %stem, error = %e, "cannot load extracted image");
                return vec![RegistrationStatus::Failed(e.to_string())];
            }
            Err(e) => return vec![RegistrationStatus::Failed(e.to_string())],
        };

        let detections = match self.engine.detect(image.clone(), &self.cancel).await {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(image = %stem, error = %e, "detection failed");
                return vec![RegistrationStatus::Failed(e.to_string())];
            }
        };
        tracing::debug!(image = %stem, faces = detections.len(), "faces detected");

        let mut statuses = Vec::with_capacity(detections.len());
        for (index, detection) in detections.iter().enumerate() {
            let Some(candidate) = FaceCandidate::from_detection(&image, detection) else {
                continue;
            };
            let png = match encode_png(&candidate.crop) {
                Ok(bytes) => bytes,
                Err(e) => {
                    statuses.push(RegistrationStatus::Failed(e.to_string()));
                    continue;
                }
            };
            if let Some(dir) = &self.debug_dir {
                // Synchronous so an aborted attempt never leaves a write in flight.
                let debug_path = dir.join(format!("{stem}_face{index}.png"));
                if let Err(e) = std::fs::write(&debug_path, &png) {
                    tracing::debug!(error = %e, "debug crop not written");
                }
            }

            let status = match tokio::time::timeout(
                self.outbound_timeout,
                self.registrar.register(&self.key, png, &self.cancel),
            )
            .await
            {
                Ok(status) => status,
                Err(_) => RegistrationStatus::Failed(PipelineError::TimedOut.to_string()),
            };
            tracing::debug!(image = %stem, face = index, status = ?status, "crop submitted");
            statuses.push(status);
        }
        statuses
    }
}

/// What went wrong with an extraction the timeout already gave up on, if anything.
fn abandoned_extraction_error(
    joined: Result<Result<pdf::Extraction, pdf::PdfError>, tokio::task::JoinError>,
) -> Option<String> {
    match joined {
        Ok(Ok(_)) | Ok(Err(pdf::PdfError::Cancelled)) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) => Some(e.to_string()),
    }
}

fn encode_png(image: &RgbImage) -> Result<Vec<u8>, image::ImageError> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrollment::EnrollmentManager;
    use crate::registrar::LocalRegistrar;
    use crate::testing::{build_pdf, face_image, fake_engine};
    use async_trait::async_trait;
    use rollcall_store::{FaceStore, SqliteStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const RED: [u8; 3] = [255, 0, 0];
    const BLUE: [u8; 3] = [0, 0, 255];

    /// Accepts every crop, so several faces in one document register.
    struct AcceptAll;

    #[async_trait]
    impl Registrar for AcceptAll {
        async fn register(&self, _: &IdentityKey, _: Vec<u8>, _: &CancellationToken) -> RegistrationStatus {
            RegistrationStatus::Registered
        }
    }

    struct Panicking;

    #[async_trait]
    impl Registrar for Panicking {
        async fn register(&self, _: &IdentityKey, _: Vec<u8>, _: &CancellationToken) -> RegistrationStatus {
            panic!("registrar exploded");
        }
    }

    /// Sleeps through each call and records the peak number of calls in flight.
    #[derive(Default)]
    struct Slow {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Registrar for Slow {
        async fn register(&self, _: &IdentityKey, _: Vec<u8>, _: &CancellationToken) -> RegistrationStatus {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            RegistrationStatus::Registered
        }
    }

    /// Counts crops present under `<workspace>/ingest-*/debug` at call time.
    struct DebugRecorder {
        workspace: PathBuf,
        seen: AtomicUsize,
    }

    #[async_trait]
    impl Registrar for DebugRecorder {
        async fn register(&self, _: &IdentityKey, _: Vec<u8>, _: &CancellationToken) -> RegistrationStatus {
            let crops = std::fs::read_dir(&self.workspace)
                .unwrap()
                .filter_map(Result::ok)
                .filter_map(|run| std::fs::read_dir(run.path().join("debug")).ok())
                .map(|entries| entries.count())
                .sum::<usize>();
            self.seen.store(crops, Ordering::SeqCst);
            RegistrationStatus::Registered
        }
    }

    fn config(workspace: &Path) -> Config {
        Config {
            workspace_dir: workspace.to_path_buf(),
            ..Config::default()
        }
    }

    fn workspace_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    fn local_pipeline(workspace: &Path) -> (IngestPipeline, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let engine = fake_engine(2);
        let enrollment = Arc::new(EnrollmentManager::new(engine.clone(), store.clone(), false, 0.1));
        let registrar = Arc::new(LocalRegistrar::new(enrollment));
        (IngestPipeline::new(engine, registrar, &config(workspace)), store)
    }

    #[test]
    fn test_parse_document_name() {
        let key = parse_document_name("Jane Doe-CS101.pdf").unwrap();
        assert_eq!((key.name.as_str(), key.group.as_str()), ("jane doe", "cs101"));

        let key = parse_document_name("uploads/2024/John.PDF").unwrap();
        assert_eq!((key.name.as_str(), key.group.as_str()), ("john", "default_group"));

        let key = parse_document_name("a - b-c.pdf").unwrap();
        assert_eq!((key.name.as_str(), key.group.as_str()), ("a", "b-c"));

        let key = parse_document_name("alice- .pdf").unwrap();
        assert_eq!(key.group, "default_group");

        let key = parse_document_name("C:\\scans\\bob-math").unwrap();
        assert_eq!((key.name.as_str(), key.group.as_str()), ("bob", "math"));

        assert!(parse_document_name("-physics.pdf").is_err());
        assert!(parse_document_name(".pdf").is_err());
        assert!(parse_document_name("dir/").is_err());
    }

    #[test]
    fn test_classify() {
        let key = IdentityKey::new("alice", "cs101");
        let tally = |registered, conflicts, failed| Tally { registered, conflicts, failed };

        let success = classify(&key, tally(1, 2, 3));
        assert_eq!(success.status, DocumentStatus::Success);
        assert_eq!(success.name.as_deref(), Some("alice"));
        assert_eq!(success.message, "Registered 1 face: alice - cs101.");

        assert_eq!(classify(&key, tally(2, 0, 0)).status, DocumentStatus::Failure);
        assert_eq!(classify(&key, tally(0, 1, 4)).status, DocumentStatus::Duplicate);
        let none = classify(&key, tally(0, 0, 2));
        assert_eq!(none.status, DocumentStatus::Failure);
        assert_eq!(none.message, "No face found in any image.");
    }

    #[test]
    fn test_outcome_json_omits_missing_identity() {
        let json = serde_json::to_value(DocumentOutcome::failure("x")).unwrap();
        assert_eq!(json, serde_json::json!({"status": "failure", "message": "x"}));
    }

    #[tokio::test]
    async fn test_single_face_document_registers() {
        let workspace = tempfile::tempdir().unwrap();
        let (pipeline, store) = local_pipeline(workspace.path());
        let pdf = build_pdf(&[vec![face_image(&[RED])]]);

        let outcome = pipeline.ingest("Alice-CS101.pdf", pdf, &CancellationToken::new()).await;
        assert_eq!(outcome.status, DocumentStatus::Success);
        assert_eq!(store.identity_count().unwrap(), 1);
        assert!(workspace_is_empty(workspace.path()));
    }

    #[tokio::test]
    async fn test_already_registered_document_is_duplicate() {
        let workspace = tempfile::tempdir().unwrap();
        let (pipeline, store) = local_pipeline(workspace.path());
        let cancel = CancellationToken::new();

        let first = pipeline
            .ingest("alice-cs101.pdf", build_pdf(&[vec![face_image(&[RED])]]), &cancel)
            .await;
        assert_eq!(first.status, DocumentStatus::Success);
        let second = pipeline
            .ingest("alice-cs101.pdf", build_pdf(&[vec![face_image(&[BLUE])]]), &cancel)
            .await;
        assert_eq!(second.status, DocumentStatus::Duplicate);
        assert_eq!(store.identity_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_two_distinct_faces_is_failure() {
        let workspace = tempfile::tempdir().unwrap();
        let pipeline = IngestPipeline::new(fake_engine(2), Arc::new(AcceptAll), &config(workspace.path()));
        let pdf = build_pdf(&[vec![face_image(&[RED])], vec![face_image(&[BLUE])]]);

        let outcome = pipeline.ingest("alice-cs101.pdf", pdf, &CancellationToken::new()).await;
        assert_eq!(outcome.status, DocumentStatus::Failure);
        assert!(outcome.message.starts_with("Multiple faces"));
        assert!(workspace_is_empty(workspace.path()));
    }

    #[tokio::test]
    async fn test_no_faces_is_failure() {
        let workspace = tempfile::tempdir().unwrap();
        let (pipeline, store) = local_pipeline(workspace.path());
        let pdf = build_pdf(&[vec![face_image(&[])], vec![]]);

        let outcome = pipeline.ingest("alice.pdf", pdf, &CancellationToken::new()).await;
        assert_eq!(outcome.status, DocumentStatus::Failure);
        assert_eq!(outcome.message, "No face found in any image.");
        assert_eq!(store.identity_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupted_document_cleans_up() {
        let workspace = tempfile::tempdir().unwrap();
        let (pipeline, _) = local_pipeline(workspace.path());

        let outcome = pipeline
            .ingest("alice.pdf", b"garbage bytes".to_vec(), &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, DocumentStatus::Failure);
        assert!(outcome.message.starts_with("could not extract images"));
        assert!(workspace_is_empty(workspace.path()));
    }

    #[tokio::test]
    async fn test_bad_file_name_is_failure() {
        let workspace = tempfile::tempdir().unwrap();
        let (pipeline, _) = local_pipeline(workspace.path());
        let pdf = build_pdf(&[vec![face_image(&[RED])]]);
        let outcome = pipeline.ingest("-cs101.pdf", pdf, &CancellationToken::new()).await;
        assert_eq!(outcome.status, DocumentStatus::Failure);
    }

    #[tokio::test]
    async fn test_panicking_sub_attempt_counts_as_failed() {
        let workspace = tempfile::tempdir().unwrap();
        let pipeline = IngestPipeline::new(fake_engine(1), Arc::new(Panicking), &config(workspace.path()));
        let pdf = build_pdf(&[vec![face_image(&[RED])]]);

        let outcome = pipeline.ingest("alice.pdf", pdf, &CancellationToken::new()).await;
        assert_eq!(outcome.status, DocumentStatus::Failure);
        assert!(workspace_is_empty(workspace.path()));
    }

    #[tokio::test]
    async fn test_outbound_timeout_fails_the_crop() {
        let workspace = tempfile::tempdir().unwrap();
        let registrar = Arc::new(Slow {
            delay: Duration::from_secs(5),
            ..Slow::default()
        });
        let mut cfg = config(workspace.path());
        cfg.outbound_timeout_secs = 0;
        let pipeline = IngestPipeline::new(fake_engine(1), registrar, &cfg);
        let pdf = build_pdf(&[vec![face_image(&[RED])]]);

        let outcome = pipeline.ingest("alice.pdf", pdf, &CancellationToken::new()).await;
        assert_eq!(outcome.status, DocumentStatus::Failure);
    }

    #[tokio::test]
    async fn test_ingest_timeout_aborts_and_cleans_up() {
        let workspace = tempfile::tempdir().unwrap();
        let registrar = Arc::new(Slow {
            delay: Duration::from_secs(30),
            ..Slow::default()
        });
        let mut cfg = config(workspace.path());
        cfg.ingest_timeout_secs = 0;
        let pipeline = IngestPipeline::new(fake_engine(1), registrar, &cfg);
        let pdf = build_pdf(&[vec![face_image(&[RED])]]);

        let outcome = pipeline.ingest("alice.pdf", pdf, &CancellationToken::new()).await;
        assert_eq!(outcome.status, DocumentStatus::Failure);
        assert_eq!(outcome.message, "operation timed out");
        assert!(workspace_is_empty(workspace.path()));
    }

    #[tokio::test]
    async fn test_abandoned_extraction_reports_only_abnormal_ends() {
        let cancelled = tokio::task::spawn_blocking(
            || -> Result<pdf::Extraction, pdf::PdfError> { Err(pdf::PdfError::Cancelled) },
        )
        .await;
        assert!(abandoned_extraction_error(cancelled).is_none());

        let panicked = tokio::task::spawn_blocking(
            || -> Result<pdf::Extraction, pdf::PdfError> { panic!("decoder crashed") },
        )
        .await;
        let error = abandoned_extraction_error(panicked).unwrap();
        assert!(error.contains("panic"), "{error}");
    }

    #[tokio::test]
    async fn test_debug_crops_live_inside_workspace() {
        let workspace = tempfile::tempdir().unwrap();
        let recorder = Arc::new(DebugRecorder {
            workspace: workspace.path().to_path_buf(),
            seen: AtomicUsize::new(0),
        });
        let mut cfg = config(workspace.path());
        cfg.debug_artifacts = true;
        let pipeline = IngestPipeline::new(fake_engine(1), recorder.clone(), &cfg);
        let pdf = build_pdf(&[vec![face_image(&[RED])]]);

        let outcome = pipeline.ingest("alice.pdf", pdf, &CancellationToken::new()).await;
        assert_eq!(outcome.status, DocumentStatus::Success);
        assert_eq!(recorder.seen.load(Ordering::SeqCst), 1);
        assert!(workspace_is_empty(workspace.path()));
    }

    #[tokio::test]
    async fn test_semaphore_serialises_documents() {
        let workspace = tempfile::tempdir().unwrap();
        let registrar = Arc::new(Slow {
            delay: Duration::from_millis(50),
            ..Slow::default()
        });
        let pipeline = Arc::new(IngestPipeline::new(
            fake_engine(2),
            registrar.clone(),
            &config(workspace.path()),
        ));

        let mut runs = JoinSet::new();
        for name in ["alice.pdf", "bob.pdf", "carol.pdf"] {
            let pipeline = Arc::clone(&pipeline);
            let pdf = build_pdf(&[vec![face_image(&[RED])]]);
            runs.spawn(async move { pipeline.ingest(name, pdf, &CancellationToken::new()).await });
        }
        while let Some(outcome) = runs.join_next().await {
            assert_eq!(outcome.unwrap().status, DocumentStatus::Success);
        }
        assert_eq!(registrar.peak.load(Ordering::SeqCst), 1);
    }
}
