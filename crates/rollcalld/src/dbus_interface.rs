use crate::service::ServiceContext;
use serde::Serialize;
use std::sync::Arc;
use zbus::interface;

pub const BUS_NAME: &str = "io.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/io/rollcall/Rollcall1";

/// Upper bound on attendance events returned by one `AttendanceLog` call.
const MAX_LOG_ENTRIES: u32 = 1000;

/// D-Bus interface for the rollcall daemon.
///
/// Bus name: io.rollcall.Rollcall1
/// Object path: /io/rollcall/Rollcall1
///
/// Every method replies with a JSON document.
pub struct RollcallService {
    ctx: Arc<ServiceContext>,
}

impl RollcallService {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn internal<E: std::fmt::Display>(err: E) -> zbus::fdo::Error {
    tracing::error!(error = %err, "request failed");
    zbus::fdo::Error::Failed("internal error".into())
}

#[interface(name = "io.rollcall.Rollcall1")]
impl RollcallService {
    /// Enroll a face image as `(name, group)`.
    async fn register(&self, name: &str, group: &str, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(name, group, bytes = image.len(), "register requested");
        to_json(&self.ctx.register(name, group, &image).await)
    }

    /// Enroll from a PDF whose file name is `<name>-<group>.pdf`.
    async fn register_from_document(
        &self,
        file_name: &str,
        contents: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(file_name, bytes = contents.len(), "register_from_document requested");
        to_json(&self.ctx.register_from_document(file_name, contents).await)
    }

    /// Identify the dominant face in an image.
    async fn recognize(&self, image: Vec<u8>) -> zbus::fdo::Result<String> {
        tracing::info!(bytes = image.len(), "recognize requested");
        to_json(&self.ctx.recognize(&image).await)
    }

    async fn mark_attendance(
        &self,
        name: &str,
        group: &str,
        image: Vec<u8>,
        attended: bool,
        date: &str,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name, group, attended, "mark_attendance requested");
        to_json(
            &self
                .ctx
                .mark_attendance(name, group, &image, attended, date)
                .await,
        )
    }

    async fn list_groups(&self) -> zbus::fdo::Result<String> {
        to_json(&self.ctx.list_groups().await.map_err(internal)?)
    }

    /// Identities of one group, or all when `group` is empty. No embeddings.
    async fn list_identities(&self, group: &str) -> zbus::fdo::Result<String> {
        to_json(&self.ctx.list_identities(group).await.map_err(internal)?)
    }

    /// Newest attendance events, for one name or all when `name` is empty.
    async fn attendance_log(&self, name: &str, limit: u32) -> zbus::fdo::Result<String> {
        let limit = limit.clamp(1, MAX_LOG_ENTRIES) as usize;
        to_json(&self.ctx.attendance_log(name, limit).await.map_err(internal)?)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        to_json(&self.ctx.status().await.map_err(internal)?)
    }
}
