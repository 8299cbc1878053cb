//! In-memory `RemoteCatalog` used by unit and scenario tests.
//!
//! Metadata (semesters, courses, folder listings) is served straight out of
//! memory. File bodies go through a tiny hand-rolled HTTP server bound to
//! `127.0.0.1` so `download_file` drives the real `Download` HEAD/GET state
//! machine end to end rather than special-casing it — the same reasoning
//! that keeps `catalog::auth`'s SSO scraping free of an HTML parser crate.
//! Callers that need a download to be already satisfied with no network
//! traffic at all (spec.md §8 scenario 4) can pre-seed the cache file
//! directly via [`MockCatalog::seed_cached_file`].

use super::auth::Credentials;
use super::RemoteCatalog;
use crate::download::{self, Download};
use crate::error::{CampusFsError, Result};
use crate::model::{Course, File, Semester};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;

pub struct MockCatalog {
    semesters: Vec<Semester>,
    courses: HashMap<String, Vec<Course>>,        // keyed by semester id
    course_roots: HashMap<String, File>,           // keyed by course id
    folder_children: HashMap<String, Vec<File>>,   // keyed by folder id
    files_by_id: Mutex<HashMap<String, File>>,
    bodies: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    downloads: Mutex<HashMap<String, Arc<Download>>>,
    cache_dir: PathBuf,
    server_addr: std::net::SocketAddr,
    pub download_calls: Mutex<u64>,
}

impl MockCatalog {
    /// `cache_dir` is where `download_file` will place fetched bodies, the
    /// same role `StudipCatalog::cache_dir` plays for the real backend.
    pub fn new(cache_dir: PathBuf) -> Self {
        let bodies: Arc<Mutex<HashMap<String, Vec<u8>>>> = Arc::new(Mutex::new(HashMap::new()));
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock catalog listener");
        let server_addr = listener.local_addr().expect("listener has a local address");
        let bodies_bg = bodies.clone();
        std::thread::spawn(move || serve(listener, bodies_bg));
        Self {
            semesters: Vec::new(),
            courses: HashMap::new(),
            course_roots: HashMap::new(),
            folder_children: HashMap::new(),
            files_by_id: Mutex::new(HashMap::new()),
            bodies,
            downloads: Mutex::new(HashMap::new()),
            cache_dir,
            server_addr,
            download_calls: Mutex::new(0),
        }
    }

    pub fn add_semester(&mut self, semester: Semester) {
        self.semesters.push(semester);
    }

    pub fn add_course(&mut self, semester_id: &str, course: Course, root: File) {
        self.courses
            .entry(semester_id.to_string())
            .or_default()
            .push(course.clone());
        self.course_roots.insert(course.id.clone(), root.clone());
        self.files_by_id.lock().insert(root.id.clone(), root);
    }

    pub fn add_file(&mut self, parent_folder_id: &str, file: File, body: Option<Vec<u8>>) {
        self.files_by_id.lock().insert(file.id.clone(), file.clone());
        if let Some(bytes) = body {
            self.bodies.lock().insert(file.id.clone(), bytes);
        }
        self.folder_children
            .entry(parent_folder_id.to_string())
            .or_default()
            .push(file);
    }

    /// Write `body` straight to the cache path `download_file` would use,
    /// with the file's `changed` time, so `is_cached_locally` is already
    /// true and no HEAD/GET is ever issued for it.
    pub fn seed_cached_file(&self, file: &File, body: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        let path = self.cache_dir.join(&file.id);
        std::fs::write(&path, body)?;
        download::set_mtime(&path, file.changed)
    }

    fn url_for(&self, id: &str) -> String {
        format!("http://{}/file/{}", self.server_addr, id)
    }
}

#[async_trait::async_trait]
impl RemoteCatalog for MockCatalog {
    async fn get_semesters(&self) -> Result<Vec<Semester>> {
        Ok(self.semesters.clone())
    }

    async fn get_courses(&self, semester: &Semester) -> Result<Vec<Course>> {
        Ok(self.courses.get(&semester.id).cloned().unwrap_or_default())
    }

    async fn get_course_root_folder(&self, course: &Course) -> Result<File> {
        self.course_roots
            .get(&course.id)
            .cloned()
            .ok_or_else(|| CampusFsError::NotFound(format!("no root folder for course {}", course.id)))
    }

    async fn get_folder_files(&self, folder: &File) -> Result<Vec<File>> {
        Ok(self
            .folder_children
            .get(&folder.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_file_details(&self, id: &str) -> Result<File> {
        self.files_by_id
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| CampusFsError::NotFound(format!("no such file {id}")))
    }

    async fn download_file(&self, file: &File) -> Result<Arc<Download>> {
        if let Some(existing) = self.downloads.lock().get(&file.id) {
            return Ok(existing.clone());
        }
        *self.download_calls.lock() += 1;
        let url = self.url_for(&file.id);
        let local_path = self.cache_dir.join(&file.id);
        let download = Arc::new(Download::new(url, local_path, file.size, Some(file.changed)));
        self.downloads
            .lock()
            .insert(file.id.clone(), download.clone());
        Ok(download)
    }

    async fn login(&self, _credentials: &Credentials) -> Result<()> {
        Ok(())
    }

    async fn check_login(&self, _username: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Single-threaded HTTP/1.1 server: every connection gets one request
/// answered from `bodies` keyed by the last path segment, then closes.
fn serve(listener: TcpListener, bodies: Arc<Mutex<HashMap<String, Vec<u8>>>>) {
    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(s) => s,
            Err(_) => break,
        };
        let mut buf = [0u8; 1024];
        let n = match stream.read(&mut buf) {
            Ok(n) if n > 0 => n,
            _ => continue,
        };
        let request = String::from_utf8_lossy(&buf[..n]);
        let mut parts = request.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let path = parts.next().unwrap_or("/").to_string();
        let id = path.rsplit('/').next().unwrap_or("").to_string();
        let body = bodies.lock().get(&id).cloned().unwrap_or_default();
        if method == "HEAD" {
            let resp = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(resp.as_bytes());
        } else {
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = stream.write_all(header.as_bytes());
            let _ = stream.write_all(&body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn semester() -> Semester {
        Semester {
            id: "sem1".into(),
            name: "Summer 2026".into(),
            lexical: "SoSe 2026".into(),
            lexical_short: "S26".into(),
            start_date: Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap(),
        }
    }

    fn course(sem: &Semester) -> Course {
        Course {
            id: "course1".into(),
            name: "Intro".into(),
            abbrev: "INT".into(),
            course_type: "lecture".into(),
            type_abbrev: "V".into(),
            class: "undergrad".into(),
            semester: sem.clone(),
        }
    }

    fn file(id: &str, course: &Course, size: u64) -> File {
        File {
            id: id.into(),
            name: format!("{id}.pdf"),
            description: String::new(),
            author: String::new(),
            size: Some(size),
            created: Utc.with_ymd_and_hms(2026, 4, 2, 0, 0, 0).unwrap(),
            changed: Utc.with_ymd_and_hms(2026, 4, 2, 0, 0, 0).unwrap(),
            is_folder: false,
            is_accessible: true,
            is_single_child: false,
            parent: Some("root".into()),
            path: vec![],
            course: course.clone(),
        }
    }

    #[tokio::test]
    async fn download_file_serves_real_bytes_over_its_http_server() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MockCatalog::new(dir.path().to_path_buf());
        let sem = semester();
        let crs = course(&sem);
        catalog.add_semester(sem.clone());
        catalog.add_course(&sem.id, crs.clone(), file("root", &crs, 0));
        let f = file("doc1", &crs, 5);
        catalog.add_file("root", f.clone(), Some(b"HELLO".to_vec()));

        let download = catalog.download_file(&f).await.unwrap();
        let client = reqwest::Client::new();
        download.start_loading(&client).await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("doc1")).unwrap(), b"HELLO");
    }

    #[tokio::test]
    async fn seeded_cache_file_needs_no_network() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MockCatalog::new(dir.path().to_path_buf());
        let sem = semester();
        let crs = course(&sem);
        let f = file("doc2", &crs, 11);
        catalog.add_file("root", f.clone(), None);
        catalog.seed_cached_file(&f, b"HELLO WORLD").unwrap();

        let download = catalog.download_file(&f).await.unwrap();
        assert!(download.is_cached_locally());
        let client = reqwest::Client::new();
        download.start_loading(&client).await.unwrap();
        assert_eq!(download.state(), download::State::Done);
    }

    #[tokio::test]
    async fn download_file_is_idempotent_per_file_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MockCatalog::new(dir.path().to_path_buf());
        let sem = semester();
        let crs = course(&sem);
        let f = file("doc3", &crs, 5);
        catalog.add_file("root", f.clone(), Some(b"HELLO".to_vec()));

        let a = catalog.download_file(&f).await.unwrap();
        let b = catalog.download_file(&f).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*catalog.download_calls.lock(), 1);
    }
}
