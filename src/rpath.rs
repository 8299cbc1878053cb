//! Merges VirtualPaths that render to the same path into one filesystem
//! node (spec.md §4.7), grounded directly in
//! `studip_fuse/path/real_path.py`. The flattening-loop termination check
//! is new engineering the Python version gets for free from `async for`
//! suspension (spec.md §9): we detect a no-progress VP handing back itself
//! among its own children and fail loudly instead of looping forever.

use crate::download::Download;
use crate::error::{CampusFsError, Result};
use crate::path_util;
use crate::vpath::{Attrs, VirtualPath};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub struct RealPath {
    pub parent: Option<Arc<RealPath>>,
    vps: Vec<Arc<VirtualPath>>,
    path: String,
    is_folder: bool,
    list_cache: Mutex<Option<Vec<Arc<RealPath>>>>,
    resolve_cache: Mutex<HashMap<String, Option<Arc<RealPath>>>>,
}

impl RealPath {
    /// All of `vps` must render to the same path, and more than one is only
    /// allowed if all of them are folders (spec.md §8 invariant).
    pub fn new(parent: Option<Arc<RealPath>>, vps: Vec<Arc<VirtualPath>>) -> Result<Arc<RealPath>> {
        if vps.is_empty() {
            return Err(CampusFsError::Protocol("RealPath with no generating VirtualPaths".into()));
        }
        let path = vps[0].partial_path()?;
        for vp in &vps[1..] {
            let p = vp.partial_path()?;
            if p != path {
                return Err(CampusFsError::Protocol(format!(
                    "generating VPs for one RealPath render to different paths: '{path}' vs '{p}'"
                )));
            }
        }
        let is_folder = vps[0].is_folder();
        if vps.len() > 1 && !is_folder {
            return Err(CampusFsError::Protocol(format!(
                "RealPath '{path}' has multiple generating VPs but not all are folders"
            )));
        }
        Ok(Arc::new(RealPath {
            parent,
            vps,
            path,
            is_folder,
            list_cache: Mutex::new(None),
            resolve_cache: Mutex::new(HashMap::new()),
        }))
    }

    pub fn root(vps: Vec<Arc<VirtualPath>>) -> Result<Arc<RealPath>> {
        Self::new(None, vps)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_folder(&self) -> bool {
        self.is_folder
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Stable inode number derived from the rendered path; the FUSE
    /// operations layer reserves `1` for the root regardless of this value.
    pub fn ino(&self) -> u64 {
        use std::hash::{Hash, Hasher};
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.path.hash(&mut hasher);
        hasher.finish()
    }

    pub async fn list_contents(self: &Arc<Self>) -> Result<Vec<Arc<RealPath>>> {
        if let Some(cached) = self.list_cache.lock().clone() {
            return Ok(cached);
        }
        let result = self.list_contents_uncached().await?;
        *self.list_cache.lock() = Some(result.clone());
        Ok(result)
    }

    async fn list_contents_uncached(self: &Arc<Self>) -> Result<Vec<Arc<RealPath>>> {
        let mut groups: BTreeMap<String, Vec<Arc<VirtualPath>>> = BTreeMap::new();
        for vp in &self.vps {
            groups.entry(vp.partial_path()?).or_default().push(vp.clone());
        }

        // Flatten VPs that made no progress (stayed on `self.path`, e.g. a
        // folder whose template segment chose to recurse) until none remain.
        loop {
            let Some(stuck) = groups.remove(&self.path) else { break };
            let children_lists = futures::future::try_join_all(stuck.into_iter().map(|vp| async move {
                let children = vp.list_contents().await?;
                for child in &children {
                    if Arc::ptr_eq(child, &vp) {
                        return Err(CampusFsError::Protocol(format!(
                            "'{}' returned itself among its own children; template never terminates",
                            vp.partial_path().unwrap_or_default()
                        )));
                    }
                }
                Ok::<_, CampusFsError>(children)
            }))
            .await?;
            for children in children_lists {
                for child in children {
                    groups.entry(child.partial_path()?).or_default().push(child);
                }
            }
        }

        groups.into_values().map(|vps| RealPath::new(Some(self.clone()), vps)).collect()
    }

    /// Consumes an owned `Arc` so the recursive call can return a boxed,
    /// `'static` future (needed since `async fn` can't recurse into itself
    /// without indirection).
    pub fn resolve(self: Arc<Self>, rel_path: String) -> BoxFuture<'static, Result<Option<Arc<RealPath>>>> {
        Box::pin(async move {
            let rel = path_util::normalize(&rel_path);
            if rel.is_empty() {
                return Ok(Some(self));
            }
            if let Some(cached) = self.resolve_cache.lock().get(&rel).cloned() {
                return Ok(cached);
            }
            let children = self.list_contents().await?;
            let mut resolved = None;
            for child in &children {
                if path_util::eq(&rel, child.path()) {
                    resolved = Some(child.clone());
                    break;
                } else if path_util::eq(&path_util::head(&rel), &path_util::name(child.path())) {
                    resolved = child.clone().resolve(path_util::tail(&rel)).await?;
                    break;
                }
            }
            self.resolve_cache.lock().insert(rel, resolved.clone());
            Ok(resolved)
        })
    }

    /// Merge the stable attribute subset across all generating VPs (spec.md
    /// §4.7); if they disagree the result depends on iteration order, same
    /// as the reference implementation.
    pub fn getattr(&self) -> Attrs {
        let mut merged = Attrs {
            is_dir: self.is_folder,
            accessible: true,
            size: None,
            mtime: None,
        };
        if self.vps.len() > 1 {
            log::debug!("'{}' has {} generating VPs; getattr merge order is unspecified", self.path, self.vps.len());
        }
        for vp in &self.vps {
            let a = vp.getattr();
            merged.accessible = a.accessible;
            if a.size.is_some() {
                merged.size = a.size;
            }
            if a.mtime.is_some() {
                merged.mtime = a.mtime;
            }
        }
        merged
    }

    pub fn access(&self, mode: i32) -> Result<()> {
        for vp in &self.vps {
            vp.access(mode)?;
        }
        Ok(())
    }

    /// Only valid when exactly one VP generates this RP; a folder with
    /// multiple generating VPs is never a file, so this can't be reached
    /// from `fuse_ops::open` on a directory.
    pub async fn open_file(&self) -> Result<Arc<Download>> {
        if self.vps.len() != 1 {
            return Err(CampusFsError::Protocol(format!(
                "open_file on '{}' with {} generating VPs",
                self.path,
                self.vps.len()
            )));
        }
        self.vps[0].open_file().await
    }

    pub fn xattr(&self, name: &str) -> Option<String> {
        self.vps.iter().find_map(|vp| vp.xattr(name))
    }

    pub fn xattr_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = Vec::new();
        for vp in &self.vps {
            for n in vp.xattr_names() {
                if !names.contains(&n) {
                    names.push(n);
                }
            }
        }
        names
    }

    /// Drop this node's memoized `list_contents`/`resolve` results and
    /// recurse into already-materialized children (spec.md §4.7
    /// invalidation signal). Unmaterialized subtrees need no invalidation:
    /// they'll fetch fresh on first access.
    pub fn invalidate(&self) {
        let children = self.list_cache.lock().take();
        self.resolve_cache.lock().clear();
        if let Some(children) = children {
            for child in children {
                child.invalidate();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::mock::MockCatalog;
    use crate::catalog::RemoteCatalog;
    use crate::encode::{Charset, Mode};
    use crate::model::{Course, File, Semester};
    use crate::template::Template;
    use chrono::{TimeZone, Utc};

    fn semester(id: &str, lexical: &str) -> Semester {
        Semester {
            id: id.into(),
            name: lexical.into(),
            lexical: lexical.into(),
            lexical_short: lexical.chars().take(3).collect(),
            start_date: Utc.with_ymd_and_hms(2018, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn course(sem: &Semester, id: &str, name: &str, type_: &str) -> Course {
        Course {
            id: id.into(),
            name: name.into(),
            abbrev: name.into(),
            course_type: type_.into(),
            type_abbrev: type_.into(),
            class: "undergrad".into(),
            semester: sem.clone(),
        }
    }

    fn folder(id: &str, course: &Course) -> File {
        File {
            id: id.into(),
            name: id.into(),
            description: String::new(),
            author: String::new(),
            size: None,
            created: course.semester.start_date,
            changed: course.semester.start_date,
            is_folder: true,
            is_accessible: true,
            is_single_child: false,
            parent: None,
            path: vec![],
            course: course.clone(),
        }
    }

    #[tokio::test]
    async fn root_lists_union_of_two_semesters() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MockCatalog::new(dir.path().to_path_buf());
        let ws17 = semester("ws17", "2017W");
        let ss18 = semester("ss18", "SS18");
        catalog.add_semester(ws17.clone());
        catalog.add_semester(ss18.clone());
        catalog.add_course(&ws17.id, course(&ws17, "c1", "Algo", "V"), folder("root1", &course(&ws17, "c1", "Algo", "V")));
        let catalog: Arc<dyn RemoteCatalog> = Arc::new(catalog);

        let template = Arc::new(Template::parse("{semester-lexical}"));
        let root_vp = VirtualPath::root(catalog, template, Charset::Ascii, Mode::Typeable);
        let vps = root_vp.list_contents().await.unwrap();
        let root_rp = RealPath::root(vps).unwrap();
        let children = root_rp.list_contents().await.unwrap();
        let mut names: Vec<&str> = children.iter().map(|c| c.path()).collect();
        names.sort();
        assert_eq!(names, vec!["2017W", "SS18"]);
    }

    #[tokio::test]
    async fn resolve_empty_path_is_self_and_caches() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = MockCatalog::new(dir.path().to_path_buf());
        let catalog: Arc<dyn RemoteCatalog> = Arc::new(catalog);
        let template = Arc::new(Template::parse("{semester-lexical}"));
        let root_vp = VirtualPath::root(catalog, template, Charset::Ascii, Mode::Typeable);
        let root_rp = RealPath::root(vec![root_vp]).unwrap();
        let resolved = root_rp.clone().resolve(String::new()).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&resolved, &root_rp));
    }

    #[tokio::test]
    async fn resolve_dotdot_matches_direct_child() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog = MockCatalog::new(dir.path().to_path_buf());
        let ws17 = semester("ws17", "2017W");
        catalog.add_semester(ws17.clone());
        let catalog: Arc<dyn RemoteCatalog> = Arc::new(catalog);
        let template = Arc::new(Template::parse("{semester-lexical}"));
        let root_vp = VirtualPath::root(catalog, template, Charset::Ascii, Mode::Typeable);
        let vps = root_vp.list_contents().await.unwrap();
        let root_rp = RealPath::root(vps).unwrap();

        let direct = root_rp.clone().resolve("2017W".into()).await.unwrap();
        let via_dotdot = root_rp.clone().resolve("a/../2017W".into()).await.unwrap();
        assert!(direct.is_some());
        assert_eq!(direct.unwrap().path(), via_dotdot.unwrap().path());
    }
}
