//! Abstract read-only accessor for the remote course-management server
//! (spec.md §4.3).

pub mod auth;
pub mod http;
pub mod mock;

use crate::download::Download;
use crate::error::Result;
use crate::model::{Course, File, Semester};
use std::sync::Arc;

/// All operations are async and may fail with any of the categories in
/// spec.md §7. Implementations SHOULD memoize JSON GETs at the URL level
/// (the HTTP-backed implementation does this in `http_client`).
#[async_trait::async_trait]
pub trait RemoteCatalog: Send + Sync {
    async fn get_semesters(&self) -> Result<Vec<Semester>>;
    async fn get_courses(&self, semester: &Semester) -> Result<Vec<Course>>;
    async fn get_course_root_folder(&self, course: &Course) -> Result<File>;
    async fn get_folder_files(&self, folder: &File) -> Result<Vec<File>>;
    async fn get_file_details(&self, id: &str) -> Result<File>;
    async fn download_file(&self, file: &File) -> Result<Arc<Download>>;

    /// Drive the login flow for `credentials`; fatal to the mount on
    /// failure (spec.md §7 Auth).
    async fn login(&self, credentials: &auth::Credentials) -> Result<()>;

    /// Verify an existing session is still valid for `username`.
    async fn check_login(&self, username: &str) -> Result<bool>;
}
