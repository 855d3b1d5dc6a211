//! Request handling shared by every inbound surface.
//!
//! [`ServiceContext`] is built once at startup and holds the immutable handles
//! each operation needs. Every request gets a child of the daemon's shutdown
//! token, so stopping the daemon cancels in-flight inference and registration
//! calls.

use crate::attendance::{AttendanceThrottler, Decision};
use crate::config::Config;
use crate::engine::EngineHandle;
use crate::enrollment::{EnrollmentManager, EnrollmentState, RejectReason};
use crate::error::PipelineError;
use crate::ingest::{DocumentOutcome, IngestPipeline};
use crate::registrar::{HttpRegistrar, LocalRegistrar, Registrar};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use image::RgbImage;
use rollcall_core::liveness;
use rollcall_core::matcher::{match_query, GalleryIndex};
use rollcall_core::{AttendanceEvent, FaceCandidate, IdentityKey, MatcherKind};
use rollcall_store::{FaceStore, StoreError};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

const UNKNOWN: &str = "Unknown";
const INTERNAL_ERROR: &str = "internal error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterStatus {
    Success,
    Conflict,
    Rejected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegisterResponse {
    pub status: RegisterStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub message: String,
}

impl RegisterResponse {
    fn new(status: RegisterStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            embedding: None,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RecognizeResponse {
    /// A match, or `Unknown` for both name and group.
    Identified {
        name: String,
        group: String,
        embedding: Vec<f32>,
        /// `None` when the gallery is empty.
        distance: Option<f32>,
    },
    Throttled {
        status: &'static str,
        recognized_name: String,
        #[serde(rename = "nextAllowedAttempt")]
        next_allowed_attempt: DateTime<Utc>,
    },
    Error {
        status: &'static str,
        message: String,
    },
}

impl RecognizeResponse {
    fn error(message: impl Into<String>) -> Self {
        RecognizeResponse::Error {
            status: "error",
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkStatus {
    Success,
    Failed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkResponse {
    pub status: MarkStatus,
    pub message: String,
    #[serde(rename = "nextAllowedAttempt", skip_serializing_if = "Option::is_none")]
    pub next_allowed_attempt: Option<DateTime<Utc>>,
}

impl MarkResponse {
    fn error(message: impl Into<String>) -> Self {
        Self {
            status: MarkStatus::Error,
            message: message.into(),
            next_allowed_attempt: None,
        }
    }
}

/// An identity without its embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentitySummary {
    pub id: String,
    pub name: String,
    pub group: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub identities: u64,
    pub embedding_dim: usize,
    pub inference_workers: usize,
    pub matcher: String,
    pub enforce_liveness: bool,
    pub registrar: &'static str,
    pub uptime_secs: i64,
}

struct CachedGallery {
    revision: u64,
    index: Arc<dyn GalleryIndex>,
}

pub struct ServiceContext {
    config: Config,
    engine: EngineHandle,
    store: Arc<dyn FaceStore>,
    enrollment: Arc<EnrollmentManager>,
    throttler: AttendanceThrottler,
    ingest: IngestPipeline,
    // Identities are never updated or deleted, so the count is a revision.
    gallery: Arc<Mutex<Option<CachedGallery>>>,
    remote_registrar: bool,
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
}

impl ServiceContext {
    /// Wire the configured registrar: remote when `registrar_url` is set.
    pub fn new(
        config: Config,
        engine: EngineHandle,
        store: Arc<dyn FaceStore>,
        shutdown: CancellationToken,
    ) -> Result<Self, reqwest::Error> {
        let enrollment = Arc::new(EnrollmentManager::new(
            engine.clone(),
            Arc::clone(&store),
            config.enforce_liveness,
            config.liveness_threshold,
        ));
        let registrar: Arc<dyn Registrar> = match &config.registrar_url {
            Some(url) => {
                tracing::info!(url = %url, "using remote registrar");
                Arc::new(HttpRegistrar::new(url.clone(), config.outbound_timeout())?)
            }
            None => Arc::new(LocalRegistrar::new(Arc::clone(&enrollment))),
        };
        Ok(Self::assemble(config, engine, store, enrollment, registrar, shutdown))
    }

    fn assemble(
        config: Config,
        engine: EngineHandle,
        store: Arc<dyn FaceStore>,
        enrollment: Arc<EnrollmentManager>,
        registrar: Arc<dyn Registrar>,
        shutdown: CancellationToken,
    ) -> Self {
        let ingest = IngestPipeline::new(engine.clone(), registrar, &config);
        let throttler = AttendanceThrottler::new(config.throttle_key, config.cooldown());
        Self {
            remote_registrar: config.registrar_url.is_some(),
            config,
            engine,
            store,
            enrollment,
            throttler,
            ingest,
            gallery: Arc::new(Mutex::new(None)),
            shutdown,
            started_at: Utc::now(),
        }
    }

    pub async fn register(&self, name: &str, group: &str, image: &[u8]) -> RegisterResponse {
        if name.trim().is_empty() {
            return RegisterResponse::new(RegisterStatus::Rejected, "Name must not be empty.");
        }
        let key = IdentityKey::new(name, group);
        let image = match decode_image(image) {
            Ok(img) => img,
            Err(e) => return RegisterResponse::new(RegisterStatus::Rejected, e.to_string()),
        };

        let cancel = self.shutdown.child_token();
        let outcome = match self.enrollment.enroll_image(key, Arc::new(image), &cancel).await {
            Ok(outcome) => outcome,
            Err(e) => return RegisterResponse::new(RegisterStatus::Error, public_message(&e)),
        };

        match outcome.state {
            EnrollmentState::Stored => RegisterResponse {
                status: RegisterStatus::Success,
                embedding: outcome.embedding.map(|e| e.values),
                message: "Registration successful.".into(),
            },
            EnrollmentState::Duplicate => RegisterResponse::new(
                RegisterStatus::Conflict,
                "User with this name and group already exists.",
            ),
            EnrollmentState::Rejected(reason) => {
                RegisterResponse::new(RegisterStatus::Rejected, reject_message(reason))
            }
            other => {
                tracing::error!(state = ?other, "enrollment ended in a non-terminal state");
                RegisterResponse::new(RegisterStatus::Error, INTERNAL_ERROR)
            }
        }
    }

    pub async fn register_from_document(&self, file_name: &str, contents: Vec<u8>) -> DocumentOutcome {
        let cancel = self.shutdown.child_token();
        self.ingest.ingest(file_name, contents, &cancel).await
    }

    pub async fn recognize(&self, image: &[u8]) -> RecognizeResponse {
        match self.try_recognize(image).await {
            Ok(response) => response,
            Err(e) => RecognizeResponse::error(public_message(&e)),
        }
    }

    async fn try_recognize(&self, image: &[u8]) -> Result<RecognizeResponse, PipelineError> {
        let image = Arc::new(decode_image(image)?);
        let cancel = self.shutdown.child_token();

        let detections = self.engine.detect(image.clone(), &cancel).await?;
        // Sorted by confidence: the first box is the dominant face.
        let Some(candidate) = detections
            .first()
            .and_then(|d| FaceCandidate::from_detection(&image, d))
        else {
            return Ok(RecognizeResponse::error("No face detected"));
        };
        if detections.len() > 1 {
            tracing::debug!(faces = detections.len(), "recognizing dominant face only");
        }

        let verdict = candidate
            .landmarks
            .as_ref()
            .and_then(|lm| liveness::evaluate(lm, self.config.liveness_threshold));
        if self.config.enforce_liveness && !verdict.is_some_and(|v| v.is_live) {
            return Ok(RecognizeResponse::error("Liveness detection failed"));
        }

        let query = self.engine.embed(candidate.crop, &cancel).await?;
        let gallery = self.gallery().await?;
        let result = match_query(gallery.as_ref(), &query, self.config.match_threshold);
        let distance = result.distance.is_finite().then_some(result.distance);

        let Some(key) = result.identity else {
            tracing::info!(distance = ?distance, "face not recognized");
            return Ok(RecognizeResponse::Identified {
                name: UNKNOWN.into(),
                group: UNKNOWN.into(),
                embedding: query.values,
                distance,
            });
        };

        let throttler = self.throttler.clone();
        let check_key = key.clone();
        let decision = self
            .with_store(move |store| throttler.check(store, &check_key, Utc::now()))
            .await?;
        tracing::info!(identity = %key, distance = result.distance, allowed = decision.is_allowed(), "face recognized");

        Ok(match decision {
            Decision::Allowed => RecognizeResponse::Identified {
                name: key.name,
                group: key.group,
                embedding: query.values,
                distance,
            },
            Decision::Throttled {
                next_allowed_attempt,
                ..
            } => RecognizeResponse::Throttled {
                status: "failed",
                recognized_name: key.name,
                next_allowed_attempt,
            },
        })
    }

    /// Record attendance for a registered identity, subject to the cooldown.
    ///
    /// The event is stamped with the daemon's clock; `date` is only echoed.
    pub async fn mark_attendance(
        &self,
        name: &str,
        group: &str,
        image: &[u8],
        attended: bool,
        date: &str,
    ) -> MarkResponse {
        let key = IdentityKey::new(name, group);
        let echoed = match parse_client_date(date) {
            Some(d) => d,
            None => return MarkResponse::error(format!("Invalid date: {date:?}")),
        };
        tracing::debug!(identity = %key, image_bytes = image.len(), "mark requested");

        let throttler = self.throttler.clone();
        let lookup = key.clone();
        let admitted = self
            .with_store(move |store| {
                if store.find_identity(&lookup)?.is_none() {
                    return Ok(None);
                }
                throttler.admit(store, &lookup, attended, Utc::now()).map(Some)
            })
            .await;

        match admitted {
            Ok(Some(Decision::Allowed)) => MarkResponse {
                status: MarkStatus::Success,
                message: format!(
                    "Attendance for {} in group {} marked as {attended} on {echoed}.",
                    key.name, key.group
                ),
                next_allowed_attempt: None,
            },
            Ok(Some(Decision::Throttled {
                next_allowed_attempt,
                ..
            })) => MarkResponse {
                status: MarkStatus::Failed,
                message: format!("Attendance for {} was already marked.", key.name),
                next_allowed_attempt: Some(next_allowed_attempt),
            },
            Ok(None) => MarkResponse::error(format!("Unknown identity: {key}")),
            Err(e) => MarkResponse::error(public_message(&e)),
        }
    }

    pub async fn list_groups(&self) -> Result<Vec<String>, PipelineError> {
        let groups = self.with_store(|store| store.groups()).await?;
        Ok(groups.into_iter().map(|g| g.name).collect())
    }

    /// Identities of `group`, or of every group when `group` is empty.
    pub async fn list_identities(&self, group: &str) -> Result<Vec<IdentitySummary>, PipelineError> {
        let group = group.trim().to_lowercase();
        let identities = self
            .with_store(move |store| {
                if group.is_empty() {
                    store.identities()
                } else {
                    store.identities_in_group(&group)
                }
            })
            .await?;
        Ok(identities
            .into_iter()
            .map(|i| IdentitySummary {
                id: i.id,
                name: i.name,
                group: i.group,
                created_at: i.created_at,
            })
            .collect())
    }

    /// Newest events first, for one name or for everyone when `name` is empty.
    pub async fn attendance_log(
        &self,
        name: &str,
        limit: usize,
    ) -> Result<Vec<AttendanceEvent>, PipelineError> {
        let name = name.trim().to_lowercase();
        self.with_store(move |store| {
            store.attendance_log((!name.is_empty()).then_some(name.as_str()), None, limit)
        })
        .await
    }

    pub async fn status(&self) -> Result<StatusResponse, PipelineError> {
        let identities = self.with_store(|store| store.identity_count()).await?;
        let matcher = match self.config.matcher_kind() {
            MatcherKind::ExactScan => "exact-scan".to_string(),
            MatcherKind::ApproximateIndex { lists, scan_lists } => {
                format!("approximate-index (lists={lists}, scan_lists={scan_lists})")
            }
        };
        Ok(StatusResponse {
            version: env!("CARGO_PKG_VERSION"),
            identities,
            embedding_dim: self.engine.dimension(),
            inference_workers: self.engine.worker_count(),
            matcher,
            enforce_liveness: self.config.enforce_liveness,
            registrar: if self.remote_registrar { "remote" } else { "local" },
            uptime_secs: (Utc::now() - self.started_at).num_seconds(),
        })
    }

    /// Current gallery snapshot, rebuilt when identities were added.
    async fn gallery(&self) -> Result<Arc<dyn GalleryIndex>, PipelineError> {
        let cache = Arc::clone(&self.gallery);
        let kind = self.config.matcher_kind();
        self.with_store(move |store| {
            let revision = store.identity_count()?;
            let mut cached = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(current) = cached.as_ref().filter(|c| c.revision == revision) {
                return Ok(Arc::clone(&current.index));
            }
            let identities = store.identities()?;
            tracing::debug!(identities = identities.len(), "gallery rebuilt");
            let index: Arc<dyn GalleryIndex> = Arc::from(kind.build(identities));
            *cached = Some(CachedGallery {
                revision,
                index: Arc::clone(&index),
            });
            Ok(index)
        })
        .await
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T, PipelineError>
    where
        F: FnOnce(&dyn FaceStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        Ok(tokio::task::spawn_blocking(move || f(store.as_ref())).await??)
    }
}

fn decode_image(bytes: &[u8]) -> Result<RgbImage, PipelineError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| PipelineError::InvalidImage(e.to_string()))
}

/// Reply text for an error; internal faults are logged and hidden.
fn public_message(err: &PipelineError) -> String {
    if err.is_internal() {
        tracing::error!(error = %err, "request failed");
        INTERNAL_ERROR.to_string()
    } else {
        err.to_string()
    }
}

fn reject_message(reason: RejectReason) -> &'static str {
    match reason {
        RejectReason::NoFace | RejectReason::EmptyCrop => "Face not found",
        RejectReason::MultipleFaces(_) => "More than one face detected. Please provide a single face.",
        RejectReason::NotLive => "Liveness detection failed",
    }
}

/// Accepts RFC 3339, a naive ISO date-time or a bare date. Empty means now.
fn parse_client_date(date: &str) -> Option<String> {
    let date = date.trim();
    if date.is_empty() {
        return Some(Utc::now().to_rfc3339());
    }
    if let Ok(d) = DateTime::parse_from_rfc3339(date) {
        return Some(d.to_rfc3339());
    }
    if let Ok(d) = NaiveDateTime::parse_from_str(date, "%Y-%m-%dT%H:%M:%S%.f") {
        return Some(d.to_string());
    }
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .ok()
        .map(|d| d.to_string())
}
