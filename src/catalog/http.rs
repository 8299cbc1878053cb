//! HTTP-backed `RemoteCatalog`. The wire schema of the actual remote API is
//! out of scope (spec.md §1); this implements a plausible REST/JSON shape
//! behind the same trait the `MockCatalog` implements, so swapping it for a
//! different backend only touches this file.

use super::auth::Credentials;
use super::RemoteCatalog;
use crate::download::Download;
use crate::error::{CampusFsError, Result};
use crate::http_client::{ClientConfig, HttpSession};
use crate::model::{Course, File, Semester};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

pub struct StudipCatalog {
    base_url: String,
    cache_dir: PathBuf,
    session: HttpSession,
    downloads: parking_lot::Mutex<std::collections::HashMap<String, Arc<Download>>>,
    /// Course context for file ids already seen via `get_course_root_folder`/
    /// `get_folder_files`, so `get_file_details` can decode a bare id (the
    /// abstracted `api/files/{id}` response carries no course of its own).
    file_courses: parking_lot::Mutex<std::collections::HashMap<String, Course>>,
}

impl StudipCatalog {
    pub fn new(
        base_url: String,
        cache_dir: PathBuf,
        authenticator: Arc<dyn super::auth::Authenticator>,
        config: ClientConfig,
    ) -> Result<Self> {
        Ok(Self {
            base_url,
            cache_dir,
            session: HttpSession::new(config, authenticator)?,
            downloads: parking_lot::Mutex::new(std::collections::HashMap::new()),
            file_courses: parking_lot::Mutex::new(std::collections::HashMap::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }

    fn remember_course(&self, file: &File) {
        self.file_courses.lock().insert(file.id.clone(), file.course.clone());
    }
}

#[derive(Deserialize)]
struct SemesterDto {
    id: String,
    title: String,
    #[serde(default)]
    lexical: Option<String>,
    begin: i64,
}

#[derive(Deserialize)]
struct CourseDto {
    id: String,
    title: String,
    #[serde(default)]
    abbrev: Option<String>,
    #[serde(rename = "type", default)]
    course_type: Option<String>,
    #[serde(default)]
    type_abbrev: Option<String>,
    #[serde(default)]
    class: Option<String>,
}

#[derive(Deserialize)]
struct FileDto {
    id: String,
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    mkdate: i64,
    chdate: i64,
    #[serde(default)]
    is_folder: bool,
    #[serde(default = "default_true")]
    is_accessible: bool,
    #[serde(default)]
    is_single_child: bool,
    #[serde(default)]
    parent_id: Option<String>,
    #[serde(default)]
    path: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn from_unix(ts: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or_else(Utc::now)
}

#[async_trait::async_trait]
impl RemoteCatalog for StudipCatalog {
    async fn get_semesters(&self) -> Result<Vec<Semester>> {
        let body = self.session.get_json(&self.url("api/semesters")).await?;
        let raw: Vec<SemesterDto> = serde_json::from_value((*body).clone())
            .map_err(|e| CampusFsError::Protocol(format!("decoding semesters: {e}")))?;
        Ok(raw
            .into_iter()
            .map(|s| {
                let lexical = s.lexical.clone().unwrap_or_else(|| s.title.clone());
                Semester {
                    id: s.id,
                    name: s.title,
                    lexical_short: lexical.chars().take(4).collect(),
                    lexical,
                    start_date: from_unix(s.begin),
                }
            })
            .collect())
    }

    async fn get_courses(&self, semester: &Semester) -> Result<Vec<Course>> {
        let body = self
            .session
            .get_json(&self.url(&format!("api/semesters/{}/courses", semester.id)))
            .await?;
        let raw: Vec<CourseDto> = serde_json::from_value((*body).clone())
            .map_err(|e| CampusFsError::Protocol(format!("decoding courses: {e}")))?;
        Ok(raw
            .into_iter()
            .map(|c| Course {
                id: c.id,
                name: c.title,
                abbrev: c.abbrev.unwrap_or_default(),
                course_type: c.course_type.clone().unwrap_or_default(),
                type_abbrev: c.type_abbrev.unwrap_or_else(|| c.course_type.unwrap_or_default()),
                class: c.class.unwrap_or_default(),
                semester: semester.clone(),
            })
            .collect())
    }

    async fn get_course_root_folder(&self, course: &Course) -> Result<File> {
        let body = self
            .session
            .get_json(&self.url(&format!("api/courses/{}/top_folder", course.id)))
            .await?;
        let file = decode_file((*body).clone(), course)?;
        self.remember_course(&file);
        Ok(file)
    }

    async fn get_folder_files(&self, folder: &File) -> Result<Vec<File>> {
        let body = self
            .session
            .get_json(&self.url(&format!("api/folders/{}/contents", folder.id)))
            .await?;
        let raw: Vec<FileDto> = serde_json::from_value((*body).clone())
            .map_err(|e| CampusFsError::Protocol(format!("decoding folder contents: {e}")))?;
        let files: Vec<File> = raw
            .into_iter()
            .map(|dto| decode_file_dto(dto, &folder.course))
            .collect::<Result<_>>()?;
        for file in &files {
            self.remember_course(file);
        }
        Ok(files)
    }

    async fn get_file_details(&self, id: &str) -> Result<File> {
        let course = self.file_courses.lock().get(id).cloned().ok_or_else(|| {
            CampusFsError::Protocol(format!(
                "get_file_details({id}): unknown course context, fetch via get_folder_files first"
            ))
        })?;
        let body = self.session.get_json(&self.url(&format!("api/files/{id}"))).await?;
        let file = decode_file((*body).clone(), &course)?;
        self.remember_course(&file);
        Ok(file)
    }

    async fn download_file(&self, file: &File) -> Result<Arc<Download>> {
        if let Some(existing) = self.downloads.lock().get(&file.id) {
            return Ok(existing.clone());
        }
        let url = self.url(&format!("api/files/{}/content", file.id));
        let local_path = self.cache_dir.join(&file.id);
        let download = Arc::new(Download::new(
            url,
            local_path,
            file.size,
            Some(file.changed),
        ));
        self.downloads.lock().insert(file.id.clone(), download.clone());
        Ok(download)
    }

    async fn login(&self, credentials: &Credentials) -> Result<()> {
        match credentials {
            Credentials::Basic { .. } | Credentials::OAuth1 { .. } | Credentials::Form { .. } => {
                self.session.authenticator().login(self.session.client()).await
            }
        }
    }

    async fn check_login(&self, username: &str) -> Result<bool> {
        let body = self
            .session
            .get_json(&self.url(&format!("api/whoami?user={username}")))
            .await;
        Ok(body.is_ok())
    }
}

fn decode_file(value: serde_json::Value, course: &Course) -> Result<File> {
    let dto: FileDto =
        serde_json::from_value(value).map_err(|e| CampusFsError::Protocol(format!("decoding file: {e}")))?;
    decode_file_dto(dto, course)
}

fn decode_file_dto(dto: FileDto, course: &Course) -> Result<File> {
    Ok(File {
        id: dto.id,
        name: dto.name,
        description: dto.description.unwrap_or_default(),
        author: dto.author.unwrap_or_default(),
        size: dto.size,
        created: from_unix(dto.mkdate),
        changed: from_unix(dto.chdate),
        is_folder: dto.is_folder,
        is_accessible: dto.is_accessible,
        is_single_child: dto.is_single_child,
        parent: dto.parent_id,
        path: dto.path,
        course: course.clone(),
    })
}
