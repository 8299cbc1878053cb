//! End-to-end mount scenarios, one per literal case, exercising the real
//! FUSE round trip (`MockCatalog` -> `VirtualPath`/`RealPath` -> `CampusFs`
//! -> an actual kernel mount) the way `brfs`'s own `tests.rs` drives
//! `BuildResultFS` through a real mounted directory instead of stubbing the
//! filesystem trait.

use campusfs::catalog::mock::MockCatalog;
use campusfs::catalog::RemoteCatalog;
use campusfs::encode::{Charset, Mode};
use campusfs::fuse_ops::{self, CampusFs, FsEvent};
use campusfs::model::{Course, File, Semester};
use campusfs::rpath::RealPath;
use campusfs::scheduler::Scheduler;
use campusfs::template::Template;
use campusfs::vpath::VirtualPath;
use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Holds everything that must outlive the mounted directory: the temp mount
/// point, the background FUSE session (unmounts on drop), and the scheduler
/// thread (stopped explicitly in `Drop` after the session is gone).
struct Mounted {
    mount_dir: tempfile::TempDir,
    session: Option<fuser::BackgroundSession>,
    scheduler: Scheduler,
}

impl Mounted {
    fn new(root: Arc<RealPath>) -> Self {
        let (scheduler, ()) = Scheduler::start(|| async { Ok::<(), campusfs::error::CampusFsError>(()) })
            .expect("start scheduler");
        let mount_dir = tempfile::tempdir().expect("tempdir");
        let (tx, rx) = fuse_ops::event_channel();
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let client = reqwest::Client::new();
        let fs = CampusFs::new(tx, scheduler.clone(), client, root, uid, gid);
        let session = fuse_ops::mount(mount_dir.path(), fs, Vec::new()).expect("mount");
        match rx.recv() {
            Ok(FsEvent::Init) => {}
            other => panic!("expected Init event, got {other:?}"),
        }
        Mounted {
            mount_dir,
            session: Some(session),
            scheduler,
        }
    }

    fn path(&self) -> &std::path::Path {
        self.mount_dir.path()
    }
}

impl Drop for Mounted {
    fn drop(&mut self) {
        self.session.take();
        self.scheduler.shutdown(Duration::from_secs(5));
    }
}

fn semester(id: &str, lexical: &str) -> Semester {
    Semester {
        id: id.into(),
        name: lexical.into(),
        lexical: lexical.into(),
        lexical_short: lexical.chars().take(3).collect(),
        start_date: Utc.with_ymd_and_hms(2017, 10, 1, 0, 0, 0).unwrap(),
    }
}

fn course(sem: &Semester, id: &str, name: &str) -> Course {
    Course {
        id: id.into(),
        name: name.into(),
        abbrev: name.into(),
        course_type: "lecture".into(),
        type_abbrev: "V".into(),
        class: "undergrad".into(),
        semester: sem.clone(),
    }
}

fn root_vp(catalog: Arc<dyn RemoteCatalog>, format: &str) -> Arc<RealPath> {
    let template = Arc::new(Template::parse(format));
    let vp = VirtualPath::root(catalog, template, Charset::Ascii, Mode::Typeable);
    RealPath::root(vec![vp]).expect("build root RealPath")
}

fn read_dir_names(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn mount_and_readdir_root_lists_both_semesters() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = MockCatalog::new(dir.path().to_path_buf());
    catalog.add_semester(semester("ws17", "2017W"));
    catalog.add_semester(semester("ss18", "SS18"));
    let catalog: Arc<dyn RemoteCatalog> = Arc::new(catalog);

    let root = root_vp(catalog, "{semester-lexical}");
    let mounted = Mounted::new(root);

    assert_eq!(read_dir_names(mounted.path()), vec!["2017W", "SS18"]);
}

#[test]
fn readdir_semester_lists_its_courses() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = MockCatalog::new(dir.path().to_path_buf());
    let ws17 = semester("ws17", "2017W");
    catalog.add_semester(ws17.clone());
    let algo = course(&ws17, "5792", "Algo");
    let folder = File {
        id: "root".into(),
        name: "root".into(),
        description: String::new(),
        author: String::new(),
        size: None,
        created: ws17.start_date,
        changed: ws17.start_date,
        is_folder: true,
        is_accessible: true,
        is_single_child: false,
        parent: None,
        path: vec![],
        course: algo.clone(),
    };
    catalog.add_course(&ws17.id, algo, folder);
    let catalog: Arc<dyn RemoteCatalog> = Arc::new(catalog);

    let root = root_vp(catalog, "{semester-lexical}/{course}");
    let mounted = Mounted::new(root);

    assert_eq!(read_dir_names(&mounted.path().join("2017W")), vec!["Algo"]);
}

#[test]
fn getattr_on_a_file_reports_size_and_mtime() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = MockCatalog::new(dir.path().to_path_buf());
    let ws17 = semester("ws17", "2017W");
    catalog.add_semester(ws17.clone());
    let algo = course(&ws17, "5792", "Algo");
    let changed = Utc.with_ymd_and_hms(2018, 1, 2, 3, 4, 5).unwrap();
    let slides = File {
        id: "abc".into(),
        name: "slides.pdf".into(),
        description: String::new(),
        author: String::new(),
        size: Some(1024),
        created: changed,
        changed,
        is_folder: false,
        is_accessible: true,
        is_single_child: false,
        parent: None,
        path: vec![],
        course: algo.clone(),
    };
    catalog.add_course(&ws17.id, algo, slides);
    let catalog: Arc<dyn RemoteCatalog> = Arc::new(catalog);

    let root = root_vp(catalog, "{semester-lexical}/{course}/{name}");
    let mounted = Mounted::new(root);

    let meta = std::fs::metadata(mounted.path().join("2017W/Algo/slides.pdf")).unwrap();
    assert!(meta.is_file());
    assert_eq!(meta.len(), 1024);
    assert_eq!(meta.permissions().readonly(), true);
    use std::os::unix::fs::MetadataExt;
    assert_eq!(meta.mtime(), 1514862245);
}

#[test]
fn open_and_read_a_pre_cached_file_needs_no_network() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = MockCatalog::new(dir.path().to_path_buf());
    let ws17 = semester("ws17", "2017W");
    catalog.add_semester(ws17.clone());
    let algo = course(&ws17, "5792", "Algo");
    let changed = Utc.with_ymd_and_hms(2018, 1, 2, 3, 4, 5).unwrap();
    let hello = File {
        id: "abc".into(),
        name: "hello.txt".into(),
        description: String::new(),
        author: String::new(),
        size: Some(12),
        created: changed,
        changed,
        is_folder: false,
        is_accessible: true,
        is_single_child: false,
        parent: None,
        path: vec![],
        course: algo.clone(),
    };
    catalog.seed_cached_file(&hello, b"HELLO WORLD\n").unwrap();
    catalog.add_course(&ws17.id, algo, hello);
    let catalog: Arc<dyn RemoteCatalog> = Arc::new(catalog);

    let root = root_vp(catalog, "{semester-lexical}/{course}/{name}");
    let mounted = Mounted::new(root);

    let mut file = std::fs::File::open(mounted.path().join("2017W/Algo/hello.txt")).unwrap();
    use std::io::Read;
    let mut buf = [0u8; 5];
    file.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"HELLO");
}

#[test]
fn concurrent_opens_of_the_same_file_coalesce_into_one_download() {
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = MockCatalog::new(dir.path().to_path_buf());
    let ws17 = semester("ws17", "2017W");
    catalog.add_semester(ws17.clone());
    let algo = course(&ws17, "5792", "Algo");
    let changed = Utc.with_ymd_and_hms(2018, 1, 2, 3, 4, 5).unwrap();
    let abcd = File {
        id: "abcd".into(),
        name: "abcd.txt".into(),
        description: String::new(),
        author: String::new(),
        size: Some(4),
        created: changed,
        changed,
        is_folder: false,
        is_accessible: true,
        is_single_child: false,
        parent: None,
        path: vec![],
        course: algo.clone(),
    };
    catalog.add_course(&ws17.id, algo, abcd.clone());
    catalog.add_file("root", abcd, Some(b"ABCD".to_vec()));
    let catalog = Arc::new(catalog);
    let root = root_vp(catalog.clone() as Arc<dyn RemoteCatalog>, "{semester-lexical}/{course}/{name}");
    let mounted = Mounted::new(root);

    let path = mounted.path().join("2017W/Algo/abcd.txt");
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || {
                use std::io::Read;
                let mut buf = Vec::new();
                std::fs::File::open(&path).unwrap().read_to_end(&mut buf).unwrap();
                buf
            })
        })
        .collect();
    for handle in readers {
        assert_eq!(handle.join().unwrap(), b"ABCD");
    }
    assert_eq!(*catalog.download_calls.lock(), 1);
}

#[test]
fn two_virtual_paths_rendering_to_the_same_node_union_their_children() {
    // Two distinct courses share the same {type-abbrev} value "Algo", so
    // both VPs render to the same RealPath node; its listing must be the
    // union of each course's own root folder rather than just one of them.
    let dir = tempfile::tempdir().unwrap();
    let mut catalog = MockCatalog::new(dir.path().to_path_buf());
    let ws17 = semester("ws17", "2017W");
    catalog.add_semester(ws17.clone());
    let algo_a = Course {
        type_abbrev: "Algo".into(),
        ..course(&ws17, "c1", "Algo")
    };
    let algo_b = Course {
        type_abbrev: "Algo".into(),
        ..course(&ws17, "c2", "Other")
    };
    let folder_a = File {
        id: "root-a".into(),
        name: "from-course".into(),
        description: String::new(),
        author: String::new(),
        size: None,
        created: ws17.start_date,
        changed: ws17.start_date,
        is_folder: true,
        is_accessible: true,
        is_single_child: false,
        parent: None,
        path: vec![],
        course: algo_a.clone(),
    };
    let folder_b = File {
        id: "root-b".into(),
        name: "from-type".into(),
        course: algo_b.clone(),
        ..folder_a.clone()
    };
    catalog.add_course(&ws17.id, algo_a, folder_a);
    catalog.add_course(&ws17.id, algo_b, folder_b);
    let catalog: Arc<dyn RemoteCatalog> = Arc::new(catalog);

    let root = root_vp(catalog, "{semester-lexical}/{type-abbrev}/{short-path}/{name}");
    let mounted = Mounted::new(root);

    assert_eq!(
        read_dir_names(&mounted.path().join("2017W/Algo")),
        vec!["from-course", "from-type"]
    );
}
