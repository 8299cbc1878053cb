//! Template-expansion tree node (spec.md §4.6), grounded directly in
//! `studip_fuse/path/virtual_path.py`: owned `Arc` parent links stand in
//! for the Python version's GC-managed back-references, since VPs are
//! immutable after construction and never form cycles.

use crate::catalog::RemoteCatalog;
use crate::download::Download;
use crate::encode::{encode, Charset, Mode};
use crate::error::{CampusFsError, Result};
use crate::model::{DataField, KnownData};
use crate::path_util;
use crate::template::Template;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Token keys whose values name a remote object and so get run through the
/// name encoder; everything else (ids, timestamps) passes through as-is.
const ESCAPED_SCALAR_TOKENS: &[&str] = &[
    "semester",
    "semester-lexical",
    "semester-lexical-short",
    "course",
    "type",
    "type-abbrev",
    "class",
    "name",
    "description",
    "author",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentsStatus {
    Unknown,
    Pending,
    Available,
    Failed,
}

impl ContentsStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentsStatus::Unknown => "unknown",
            ContentsStatus::Pending => "pending",
            ContentsStatus::Available => "available",
            ContentsStatus::Failed => "failed",
        }
    }
}

struct ContentsState {
    status: ContentsStatus,
    error: Option<String>,
}

/// Attributes `getattr` can report about a VP, independent of any FUSE type
/// (the FUSE operations layer translates these into `fuser::FileAttr`).
#[derive(Clone, Debug)]
pub struct Attrs {
    pub is_dir: bool,
    pub accessible: bool,
    pub size: Option<u64>,
    pub mtime: Option<DateTime<Utc>>,
}

pub struct VirtualPath {
    catalog: Arc<dyn RemoteCatalog>,
    template: Arc<Template>,
    /// Index into `template.segments`: segments before it have been
    /// consumed (rendered into `path_segments` in the original); segments
    /// from it onward are still to come. Equal to `template.segments.len()`
    /// means this VP is a file, not a folder.
    segment_index: usize,
    known_data: KnownData,
    parent: Option<Arc<VirtualPath>>,
    charset: Charset,
    mode: Mode,
    contents: Mutex<ContentsState>,
}

impl VirtualPath {
    pub fn root(
        catalog: Arc<dyn RemoteCatalog>,
        template: Arc<Template>,
        charset: Charset,
        mode: Mode,
    ) -> Arc<VirtualPath> {
        Arc::new(VirtualPath {
            catalog,
            template,
            segment_index: 0,
            known_data: KnownData::default(),
            parent: None,
            charset,
            mode,
            contents: Mutex::new(ContentsState {
                status: ContentsStatus::Unknown,
                error: None,
            }),
        })
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn is_folder(&self) -> bool {
        self.segment_index < self.template.segments.len()
    }

    fn next_segment(&self) -> Option<&crate::template::Segment> {
        self.template.segments.get(self.segment_index)
    }

    /// The minimal [`DataField`]s the next (unrendered) segment requires;
    /// empty for a literal segment with no tokens.
    fn content_options(&self) -> Vec<DataField> {
        self.next_segment().map(|s| s.required_data()).unwrap_or_default()
    }

    /// The next segment is itself a `path`/`short-path` placeholder, so this
    /// VP may recurse through nested remote folders while staying on the
    /// same template segment (spec.md §9 "expand loop").
    fn loops_over_path(&self) -> bool {
        self.is_folder() && self.next_segment().map(|s| s.is_path_like()).unwrap_or(false)
    }

    /// Token values for this node's known objects, with name-like values
    /// run through the encoder (spec.md §4.1); ids and timestamps are left
    /// untouched.
    fn escaped_tokens(&self) -> BTreeMap<String, String> {
        let mut tokens = self.known_data.tokens();
        for key in ESCAPED_SCALAR_TOKENS {
            if let Some(v) = tokens.get_mut(*key) {
                *v = encode(v.as_str(), self.charset, self.mode);
            }
        }
        for key in ["path", "short-path"] {
            if let Some(v) = tokens.get_mut(key) {
                *v = v
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .map(|s| encode(s, self.charset, self.mode))
                    .collect::<Vec<_>>()
                    .join("/");
            }
        }
        tokens
    }

    /// Render every consumed segment and join, collapsing to a normalized
    /// path (spec.md §4.6 `partial_path`). Fails only if a consumed segment
    /// is missing a token it was promised when it advanced — a bug in the
    /// dispatch logic below, not a user-facing condition.
    pub fn partial_path(&self) -> Result<String> {
        let tokens = self.escaped_tokens();
        let mut rendered = Vec::with_capacity(self.segment_index);
        for seg in &self.template.segments[..self.segment_index] {
            rendered.push(seg.render(&tokens)?);
        }
        Ok(path_util::normalize(&path_util::join(&rendered)))
    }

    /// Stable inode number derived from the rendered path, matching the
    /// reference implementation's `hash(partial_path)`.
    pub fn ino(&self) -> Result<u64> {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.partial_path()?.hash(&mut hasher);
        Ok(hasher.finish())
    }

    fn sub_path(self: &Arc<Self>, new_known_data: Option<KnownData>, advance: bool) -> Arc<VirtualPath> {
        let known_data = new_known_data.unwrap_or_else(|| self.known_data.clone());
        let segment_index = if advance {
            self.segment_index + 1
        } else {
            self.segment_index
        };
        Arc::new(VirtualPath {
            catalog: self.catalog.clone(),
            template: self.template.clone(),
            segment_index,
            known_data,
            parent: Some(self.clone()),
            charset: self.charset,
            mode: self.mode,
            contents: Mutex::new(ContentsState {
                status: ContentsStatus::Unknown,
                error: None,
            }),
        })
    }

    fn set_status(&self, status: ContentsStatus) {
        self.contents.lock().status = status;
    }

    fn fail(&self, err: &CampusFsError) {
        let mut guard = self.contents.lock();
        guard.status = ContentsStatus::Failed;
        guard.error = Some(err.to_string());
    }

    /// Enumerate the children of this folder, dispatching on which
    /// [`DataField`] the next template segment requires (spec.md §4.6).
    pub async fn list_contents(self: &Arc<Self>) -> Result<Vec<Arc<VirtualPath>>> {
        if !self.is_folder() {
            return Err(CampusFsError::Protocol("list_contents called on a file".into()));
        }
        self.set_status(ContentsStatus::Pending);
        let result = self.list_contents_dispatch().await;
        match &result {
            Ok(_) => self.set_status(ContentsStatus::Available),
            Err(err) => self.fail(err),
        }
        result
    }

    async fn list_contents_dispatch(self: &Arc<Self>) -> Result<Vec<Arc<VirtualPath>>> {
        let options = self.content_options();
        if options.contains(&DataField::File) {
            self.list_contents_file().await
        } else if options.contains(&DataField::Course) {
            self.list_contents_course().await
        } else if options.contains(&DataField::Semester) {
            self.list_contents_semester().await
        } else {
            Ok(vec![self.sub_path(None, true)])
        }
    }

    async fn list_contents_semester(self: &Arc<Self>) -> Result<Vec<Arc<VirtualPath>>> {
        let semesters = self.catalog.get_semesters().await?;
        Ok(semesters
            .into_iter()
            .map(|s| self.sub_path(Some(self.known_data.with_semester(s)), true))
            .collect())
    }

    async fn list_contents_course(self: &Arc<Self>) -> Result<Vec<Arc<VirtualPath>>> {
        if self.known_data.course.is_some() {
            return Ok(vec![self.sub_path(None, true)]);
        }
        if let Some(semester) = self.known_data.semester.clone() {
            let courses = self.catalog.get_courses(&semester).await?;
            return Ok(courses
                .into_iter()
                .map(|c| self.sub_path(Some(self.known_data.with_course(c)), true))
                .collect());
        }
        let semesters = self.catalog.get_semesters().await?;
        let by_semester = futures::future::try_join_all(semesters.into_iter().map(|s| {
            let catalog = self.catalog.clone();
            async move {
                let courses = catalog.get_courses(&s).await?;
                Ok::<_, CampusFsError>((s, courses))
            }
        }))
        .await?;
        let mut out = Vec::new();
        for (semester, courses) in by_semester {
            for course in courses {
                let kd = self.known_data.with_semester(semester.clone()).with_course(course);
                out.push(self.sub_path(Some(kd), true));
            }
        }
        Ok(out)
    }

    async fn list_contents_file(self: &Arc<Self>) -> Result<Vec<Arc<VirtualPath>>> {
        if let Some(file) = self.known_data.file.clone() {
            if self.loops_over_path() && file.is_folder {
                let children = self.catalog.get_folder_files(&file).await?;
                return Ok(children
                    .into_iter()
                    .map(|child| self.sub_path(Some(self.known_data.with_file(child)), false))
                    .collect());
            }
            return Ok(vec![self.sub_path(None, true)]);
        }

        if let Some(course) = self.known_data.course.clone() {
            let root = self.catalog.get_course_root_folder(&course).await?;
            let advance = !(self.loops_over_path() && root.is_folder);
            let kd = self.known_data.with_file(root.clone()).with_root_folder(root);
            return Ok(vec![self.sub_path(Some(kd), advance)]);
        }

        if let Some(semester) = self.known_data.semester.clone() {
            let courses = self.catalog.get_courses(&semester).await?;
            let roots = futures::future::try_join_all(courses.into_iter().map(|c| {
                let catalog = self.catalog.clone();
                async move {
                    let root = catalog.get_course_root_folder(&c).await?;
                    Ok::<_, CampusFsError>((c, root))
                }
            }))
            .await?;
            let loops_over_path = self.loops_over_path();
            return Ok(roots
                .into_iter()
                .map(|(course, root)| {
                    let advance = !(loops_over_path && root.is_folder);
                    let kd = self
                        .known_data
                        .with_course(course)
                        .with_file(root.clone())
                        .with_root_folder(root);
                    self.sub_path(Some(kd), advance)
                })
                .collect());
        }

        let semesters = self.catalog.get_semesters().await?;
        let by_semester = futures::future::try_join_all(semesters.into_iter().map(|s| {
            let catalog = self.catalog.clone();
            async move {
                let courses = catalog.get_courses(&s).await?;
                Ok::<_, CampusFsError>((s, courses))
            }
        }))
        .await?;
        let mut root_futures = Vec::new();
        for (semester, courses) in by_semester {
            for course in courses {
                let catalog = self.catalog.clone();
                let semester = semester.clone();
                root_futures.push(async move {
                    let root = catalog.get_course_root_folder(&course).await?;
                    Ok::<_, CampusFsError>((semester, course, root))
                });
            }
        }
        let results = futures::future::try_join_all(root_futures).await?;
        let loops_over_path = self.loops_over_path();
        Ok(results
            .into_iter()
            .map(|(semester, course, root)| {
                let advance = !(loops_over_path && root.is_folder);
                let kd = self
                    .known_data
                    .with_semester(semester)
                    .with_course(course)
                    .with_file(root.clone())
                    .with_root_folder(root);
                self.sub_path(Some(kd), advance)
            })
            .collect())
    }

    /// Default no-op: every VP is readable once resolved (spec.md §4.6).
    pub fn access(&self, _mode: i32) -> Result<()> {
        Ok(())
    }

    pub fn getattr(&self) -> Attrs {
        let is_dir = self.is_folder();
        let file = self.known_data.file.as_ref();
        let accessible = if is_dir {
            true
        } else {
            file.map(|f| f.is_accessible).unwrap_or(true)
        };
        let size = if is_dir {
            None
        } else {
            match file.and_then(|f| f.size) {
                Some(size) => Some(size),
                None => {
                    if let Ok(p) = self.partial_path() {
                        log::warn!("size of {p} unknown: not loaded from the remote server");
                    }
                    None
                }
            }
        };
        Attrs {
            is_dir,
            accessible,
            size,
            mtime: self.known_data.most_specific_times(),
        }
    }

    /// Delegates to the catalog's download engine; only valid on files.
    pub async fn open_file(&self) -> Result<Arc<Download>> {
        let file = self
            .known_data
            .file
            .as_ref()
            .ok_or_else(|| CampusFsError::Protocol("open_file called on a folder".into()))?;
        self.catalog.download_file(file).await
    }

    /// `contents-status` and, once failed, `contents-exception` (spec.md
    /// §4.6 extended attributes).
    pub fn xattr(&self, name: &str) -> Option<String> {
        let guard = self.contents.lock();
        match name {
            "contents-status" => Some(guard.status.as_str().to_string()),
            "contents-exception" => guard.error.clone(),
            _ => None,
        }
    }

    pub fn xattr_names(&self) -> Vec<&'static str> {
        let guard = self.contents.lock();
        let mut names = vec!["contents-status"];
        if guard.error.is_some() {
            names.push("contents-exception");
        }
        names
    }
}

impl fmt::Debug for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualPath")
            .field("partial_path", &self.partial_path().unwrap_or_default())
            .field("is_folder", &self.is_folder())
            .field("known", &self.known_data.fields())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::mock::MockCatalog;
    use crate::model::{Course, File, Semester};
    use chrono::TimeZone;

    fn semester() -> Semester {
        Semester {
            id: "ws17".into(),
            name: "Wintersemester 2017/18".into(),
            lexical: "2017W".into(),
            lexical_short: "17W".into(),
            start_date: Utc.with_ymd_and_hms(2017, 10, 1, 0, 0, 0).unwrap(),
        }
    }

    fn course(sem: &Semester) -> Course {
        Course {
            id: "c1".into(),
            name: "Algorithms".into(),
            abbrev: "Algo".into(),
            course_type: "lecture".into(),
            type_abbrev: "V".into(),
            class: "undergrad".into(),
            semester: sem.clone(),
        }
    }

    fn root_file(course: &Course) -> File {
        File {
            id: "root".into(),
            name: "Hauptordner".into(),
            description: String::new(),
            author: String::new(),
            size: None,
            created: course.semester.start_date,
            changed: course.semester.start_date,
            is_folder: true,
            is_accessible: true,
            is_single_child: true,
            parent: None,
            path: vec![],
            course: course.clone(),
        }
    }

    fn build_catalog() -> (Arc<MockCatalog>, Semester, Course) {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MockCatalog::new(dir.path().to_path_buf());
        let sem = semester();
        let crs = course(&sem);
        catalog.add_semester(sem.clone());
        catalog.add_course(&sem.id, crs.clone(), root_file(&crs));
        (Arc::new(catalog), sem, crs)
    }

    #[tokio::test]
    async fn root_lists_one_child_per_semester() {
        let (catalog, _, _) = build_catalog();
        let template = Arc::new(Template::parse("{semester-lexical}/{course}/{short-path}/{name}"));
        let root = VirtualPath::root(catalog, template, Charset::Ascii, Mode::Typeable);
        let children = root.list_contents().await.unwrap();
        assert_eq!(children.len(), 1);
        assert!(children[0].is_folder());
        assert_eq!(children[0].partial_path().unwrap(), "2017W");
    }

    #[tokio::test]
    async fn semester_then_course_then_root_folder_chain() {
        let (catalog, _, _) = build_catalog();
        let template = Arc::new(Template::parse("{semester-lexical}/{course}/{short-path}/{name}"));
        let root = VirtualPath::root(catalog, template, Charset::Ascii, Mode::Typeable);
        let semesters = root.list_contents().await.unwrap();
        let courses = semesters[0].list_contents().await.unwrap();
        assert_eq!(courses.len(), 1);
        assert_eq!(courses[0].partial_path().unwrap(), "2017W/Algorithms");
        let after_course = courses[0].list_contents().await.unwrap();
        // This segment requires {short-path}, a File token, fetching the
        // course root folder.
        assert_eq!(after_course.len(), 1);
        assert!(after_course[0].is_folder());
    }

    #[tokio::test]
    async fn getattr_reports_folder_without_size() {
        let (catalog, _, _) = build_catalog();
        let template = Arc::new(Template::parse("{semester-lexical}"));
        let root = VirtualPath::root(catalog, template, Charset::Ascii, Mode::Typeable);
        let attrs = root.getattr();
        assert!(attrs.is_dir);
        assert_eq!(attrs.size, None);
    }

    #[tokio::test]
    async fn contents_status_reflects_list_contents_outcome() {
        let (catalog, _, _) = build_catalog();
        let template = Arc::new(Template::parse("{semester-lexical}"));
        let root = VirtualPath::root(catalog, template, Charset::Ascii, Mode::Typeable);
        assert_eq!(root.xattr("contents-status").unwrap(), "unknown");
        root.list_contents().await.unwrap();
        assert_eq!(root.xattr("contents-status").unwrap(), "available");
    }

    #[tokio::test]
    async fn course_root_folder_expands_into_its_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MockCatalog::new(dir.path().to_path_buf());
        let sem = semester();
        let crs = course(&sem);
        catalog.add_semester(sem.clone());
        let root = root_file(&crs);
        catalog.add_course(&sem.id, crs.clone(), root.clone());
        let nested = File {
            id: "nested".into(),
            name: "slides.pdf".into(),
            description: String::new(),
            author: String::new(),
            size: Some(42),
            created: sem.start_date,
            changed: sem.start_date,
            is_folder: false,
            is_accessible: true,
            is_single_child: false,
            parent: Some(root.id.clone()),
            path: vec![],
            course: crs,
        };
        catalog.add_file(&root.id, nested, None);
        let catalog = Arc::new(catalog);

        let template = Arc::new(Template::parse("{semester-lexical}/{course}/{short-path}/{name}"));
        let vp_root = VirtualPath::root(catalog, template, Charset::Ascii, Mode::Typeable);
        let semesters = vp_root.list_contents().await.unwrap();
        let courses = semesters[0].list_contents().await.unwrap();
        let after_course = courses[0].list_contents().await.unwrap();
        // The course root folder is a folder with {short-path} still ahead,
        // so it must stay on that segment rather than advance past it.
        assert_eq!(after_course.len(), 1);
        assert!(after_course[0].is_folder());

        // Listing it again must walk its real children via get_folder_files
        // instead of rendering the root folder's own name as the leaf.
        let expanded = after_course[0].list_contents().await.unwrap();
        assert_eq!(expanded.len(), 1);

        let mut node = expanded[0].clone();
        while node.is_folder() {
            let next = node.list_contents().await.unwrap();
            assert_eq!(next.len(), 1);
            node = next[0].clone();
        }
        let attrs = node.getattr();
        assert!(!attrs.is_dir);
        assert_eq!(attrs.size, Some(42));
    }
}
