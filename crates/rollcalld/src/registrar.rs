//! Outbound registration call used by document ingestion.
//!
//! Each face crop found in a document is submitted as `(name, group, PNG)`.
//! [`LocalRegistrar`] enrolls in-process; [`HttpRegistrar`] posts the crop to a
//! remote registration endpoint as a multipart form.

use crate::enrollment::{EnrollmentManager, EnrollmentOutcome};
use crate::error::PipelineError;
use async_trait::async_trait;
use rollcall_core::IdentityKey;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationStatus {
    Registered,
    /// The identity already exists.
    Conflict,
    Failed(String),
}

#[async_trait]
pub trait Registrar: Send + Sync {
    async fn register(
        &self,
        key: &IdentityKey,
        face_png: Vec<u8>,
        cancel: &CancellationToken,
    ) -> RegistrationStatus;
}

/// Registers through this daemon's own enrollment manager.
pub struct LocalRegistrar {
    enrollment: Arc<EnrollmentManager>,
}

impl LocalRegistrar {
    pub fn new(enrollment: Arc<EnrollmentManager>) -> Self {
        Self { enrollment }
    }
}

#[async_trait]
impl Registrar for LocalRegistrar {
    async fn register(
        &self,
        key: &IdentityKey,
        face_png: Vec<u8>,
        cancel: &CancellationToken,
    ) -> RegistrationStatus {
        let crop = match image::load_from_memory(&face_png) {
            Ok(img) => img.to_rgb8(),
            Err(e) => return RegistrationStatus::Failed(format!("undecodable crop: {e}")),
        };
        let result = self
            .enrollment
            .enroll_crop(key.clone(), crop, cancel)
            .await
            .and_then(EnrollmentOutcome::into_result);
        match result {
            Ok(_) => RegistrationStatus::Registered,
            Err(PipelineError::DuplicateIdentity) => RegistrationStatus::Conflict,
            Err(e) => RegistrationStatus::Failed(e.to_string()),
        }
    }
}

/// Posts crops to a remote `/register`-style endpoint.
pub struct HttpRegistrar {
    client: reqwest::Client,
    url: String,
}

impl HttpRegistrar {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post(&self, key: &IdentityKey, face_png: Vec<u8>) -> Result<u16, reqwest::Error> {
        let image = reqwest::multipart::Part::bytes(face_png)
            .file_name("face.png")
            .mime_str("image/png")?;
        let form = reqwest::multipart::Form::new()
            .text("name", key.name.clone())
            .text("group", key.group.clone())
            .part("image", image);
        let response = self.client.post(&self.url).multipart(form).send().await?;
        Ok(response.status().as_u16())
    }
}

#[async_trait]
impl Registrar for HttpRegistrar {
    async fn register(
        &self,
        key: &IdentityKey,
        face_png: Vec<u8>,
        cancel: &CancellationToken,
    ) -> RegistrationStatus {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RegistrationStatus::Failed("cancelled".into()),
            result = self.post(key, face_png) => result,
        };
        match result {
            Ok(code) => {
                tracing::debug!(identity = %key, status = code, url = %self.url, "registration call");
                status_from_code(code)
            }
            Err(e) => {
                let err = PipelineError::UpstreamCallFailed(e.to_string());
                tracing::warn!(identity = %key, error = %err, "registration call failed");
                RegistrationStatus::Failed(err.to_string())
            }
        }
    }
}

pub fn status_from_code(code: u16) -> RegistrationStatus {
    match code {
        200 => RegistrationStatus::Registered,
        409 => RegistrationStatus::Conflict,
        other => RegistrationStatus::Failed(format!("HTTP {other}")),
    }
}
