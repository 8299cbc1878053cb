//! Translates kernel filesystem calls to `RealPath` operations (spec.md
//! §4.9), grounded directly in `brfs::main`'s `impl fuser::Filesystem for
//! BuildResultFS` — same method set, same `reply.error(libc::…)` idiom, same
//! `(BackgroundSession, Receiver<Event>)` mount handshake. `brfs` entered
//! its caller's tokio context with `runtime.enter(...)`; this dispatches
//! through [`Scheduler::call`] instead, since the bridge here owns a
//! dedicated loop thread rather than borrowing the FUSE thread's own.

use crate::download::Download;
use crate::error::Result;
use crate::path_util;
use crate::rpath::RealPath;
use crate::scheduler::Scheduler;
use crate::vpath::Attrs;
use chrono::{DateTime, Utc};
use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen,
    ReplyXattr, Request,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const TTL: Duration = Duration::from_secs(0);
const ROOT_INO: u64 = 1;

#[derive(Clone, Copy, Debug)]
pub enum FsEvent {
    Init,
    Destroy,
}

struct OpenFile {
    download: Arc<Download>,
    file: Mutex<fs::File>,
}

pub struct CampusFs {
    sender: Sender<FsEvent>,
    scheduler: Scheduler,
    http_client: reqwest::Client,
    root: Arc<RealPath>,
    inodes: Mutex<HashMap<u64, Arc<RealPath>>>,
    open_files: Mutex<HashMap<u64, OpenFile>>,
    next_fh: AtomicU64,
    uid: u32,
    gid: u32,
}

impl CampusFs {
    pub fn new(
        sender: Sender<FsEvent>,
        scheduler: Scheduler,
        http_client: reqwest::Client,
        root: Arc<RealPath>,
        uid: u32,
        gid: u32,
    ) -> Self {
        Self {
            sender,
            scheduler,
            http_client,
            root,
            inodes: Mutex::new(HashMap::new()),
            open_files: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            uid,
            gid,
        }
    }

    fn lookup_ino(&self, ino: u64) -> Option<Arc<RealPath>> {
        if ino == ROOT_INO {
            return Some(self.root.clone());
        }
        self.inodes.lock().get(&ino).cloned()
    }

    fn ino_for(&self, rp: &Arc<RealPath>) -> u64 {
        if rp.is_root() {
            return ROOT_INO;
        }
        let ino = rp.ino();
        self.inodes.lock().insert(ino, rp.clone());
        ino
    }

    /// Submit `fut` to the scheduler loop and flatten the resulting
    /// `Result<Result<T>>` (one layer from the loop itself stopping, one
    /// from the operation's own outcome) into a single `Result<T>`.
    fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.scheduler.call(fut)?
    }

    fn file_attr(&self, ino: u64, attrs: &Attrs) -> FileAttr {
        let kind = if attrs.is_dir {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        let mut perm = if attrs.is_dir { 0o555 } else { 0o000 };
        if attrs.is_dir || attrs.accessible {
            perm |= 0o444;
        }
        let time = attrs.mtime.map(to_system_time).unwrap_or(SystemTime::UNIX_EPOCH);
        FileAttr {
            ino,
            size: attrs.size.unwrap_or(0),
            blocks: 0,
            atime: time,
            mtime: time,
            ctime: time,
            crtime: time,
            kind,
            perm,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

fn to_system_time(dt: DateTime<Utc>) -> SystemTime {
    let secs = dt.timestamp();
    if secs >= 0 {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        SystemTime::UNIX_EPOCH - Duration::from_secs((-secs) as u64)
    }
}

impl fuser::Filesystem for CampusFs {
    fn init(
        &mut self,
        _req: &Request<'_>,
        _config: &mut fuser::KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        self.sender.send(FsEvent::Init).map_err(|_| libc::EIO)
    }

    fn destroy(&mut self) {
        self.sender
            .send(FsEvent::Destroy)
            .unwrap_or_else(|err| log::warn!("failed to send destroy event: {err}"));
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(parent_rp) = self.lookup_ino(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let name = name.to_string();
        match self.run(async move { parent_rp.resolve(name).await }) {
            Ok(Some(rp)) => {
                let attrs = rp.getattr();
                let ino = self.ino_for(&rp);
                reply.entry(&TTL, &self.file_attr(ino, &attrs), 0);
            }
            Ok(None) => reply.error(libc::ENOENT),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        match self.lookup_ino(ino) {
            Some(rp) => {
                let attrs = rp.getattr();
                reply.attr(&TTL, &self.file_attr(ino, &attrs));
            }
            None => reply.error(libc::ENOENT),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        match self.lookup_ino(ino) {
            Some(rp) => match rp.access(mask) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            },
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(rp) = self.lookup_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if !rp.is_folder() {
            reply.error(libc::ENOTDIR);
            return;
        }
        let parent_ino = rp
            .parent
            .clone()
            .map(|p| self.ino_for(&p))
            .unwrap_or(ROOT_INO);
        let rp_for_list = rp.clone();
        match self.run(async move { rp_for_list.list_contents().await }) {
            Ok(children) => {
                let mut entries = vec![
                    (ino, FileType::Directory, ".".to_string()),
                    (parent_ino, FileType::Directory, "..".to_string()),
                ];
                for child in &children {
                    let child_ino = self.ino_for(child);
                    let kind = if child.is_folder() {
                        FileType::Directory
                    } else {
                        FileType::RegularFile
                    };
                    entries.push((child_ino, kind, path_util::name(child.path())));
                }
                // Offset semantics: 0 means "from the start"; any other
                // value means "resume after the entry previously reported
                // at that offset" (same inconsistency brfs documents).
                let to_skip = if offset == 0 { 0 } else { offset as usize + 1 };
                let mut i = offset;
                for (child_ino, kind, name) in entries.into_iter().skip(to_skip) {
                    if reply.add(child_ino, i, kind, name) {
                        break;
                    }
                    i += 1;
                }
                reply.ok();
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let Some(rp) = self.lookup_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if rp.is_folder() {
            reply.error(libc::EISDIR);
            return;
        }
        let client = self.http_client.clone();
        let result = self.run(async move {
            let download = rp.open_file().await?;
            download.start_loading(&client).await?;
            Ok(download)
        });
        match result {
            Ok(download) => match open_local(&download.local_path) {
                Ok(file) => {
                    let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
                    self.open_files.lock().insert(
                        fh,
                        OpenFile {
                            download,
                            file: Mutex::new(file),
                        },
                    );
                    reply.opened(fh, 0);
                }
                Err(errno) => reply.error(errno),
            },
            Err(err) => reply.error(err.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let download = {
            let open_files = self.open_files.lock();
            match open_files.get(&fh) {
                Some(entry) => entry.download.clone(),
                None => {
                    reply.error(libc::EBADF);
                    return;
                }
            }
        };
        let client = self.http_client.clone();
        let offset = offset.max(0) as u64;
        if let Err(err) =
            self.run(async move { download.await_readable(&client, offset, size as u64).await })
        {
            reply.error(err.errno());
            return;
        }

        let open_files = self.open_files.lock();
        let Some(entry) = open_files.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let mut file = entry.file.lock();
        if let Err(err) = file.seek(SeekFrom::Start(offset)) {
            reply.error(err.raw_os_error().unwrap_or(libc::EIO));
            return;
        }
        let mut buf = vec![0u8; size as usize];
        let mut read_total = 0usize;
        loop {
            match file.read(&mut buf[read_total..]) {
                Ok(0) => break,
                Ok(n) => read_total += n,
                Err(err) => {
                    reply.error(err.raw_os_error().unwrap_or(libc::EIO));
                    return;
                }
            }
            if read_total == buf.len() {
                break;
            }
        }
        reply.data(&buf[..read_total]);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.open_files.lock().get(&fh) {
            Some(entry) => {
                let _ = entry.file.lock().sync_all();
                reply.ok();
            }
            None => reply.error(libc::EBADF),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.open_files.lock().get(&fh) {
            Some(entry) => match entry.file.lock().sync_all() {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.raw_os_error().unwrap_or(libc::EIO)),
            },
            None => reply.error(libc::EBADF),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.open_files.lock().remove(&fh) {
            Some(_) => reply.ok(),
            None => reply.error(libc::EBADF),
        }
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let Some(rp) = self.lookup_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(name) = name.to_str() else {
            reply.error(libc::ENODATA);
            return;
        };
        match rp.xattr(name) {
            Some(value) => reply_sized_bytes(reply, value.as_bytes(), size),
            None => reply.error(libc::ENODATA),
        }
    }

    // If this isn't implemented, macOS tries to manage ._ files for xattrs
    // out of band, adding overhead and logspam.
    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let Some(rp) = self.lookup_ino(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut bytes = Vec::new();
        for name in rp.xattr_names() {
            bytes.extend_from_slice(name.as_bytes());
            bytes.push(0);
        }
        reply_sized_bytes(reply, &bytes, size);
    }
}

fn reply_sized_bytes(reply: ReplyXattr, bytes: &[u8], requested_size: u32) {
    if requested_size == 0 {
        reply.size(bytes.len() as u32);
    } else if bytes.len() as u32 > requested_size {
        reply.error(libc::ERANGE);
    } else {
        reply.data(bytes);
    }
}

fn open_local(path: &Path) -> std::result::Result<fs::File, libc::c_int> {
    fs::File::open(path).map_err(|err| err.raw_os_error().unwrap_or(libc::EIO))
}

/// Mount options accepted by `fuser::spawn_mount2`; `rw` is never passed
/// since this filesystem is read-only, matching spec.md §6's `-o` policy.
/// The caller builds `fs` with the sender half of [`event_channel`] and
/// keeps the receiver to await the `Init`/`Destroy` handshake, the same
/// shape `brfs::main` uses around its own `spawn_mount2` call.
pub fn mount<P: AsRef<Path>>(
    mount_path: P,
    fs: CampusFs,
    extra_options: Vec<fuser::MountOption>,
) -> std::io::Result<fuser::BackgroundSession> {
    let mut options = vec![
        fuser::MountOption::RO,
        fuser::MountOption::FSName("campusfs".to_owned()),
    ];
    options.extend(extra_options);
    log::debug!("about to spawn_mount with options {options:?}");
    fuser::spawn_mount2(fs, &mount_path, &options)
}

/// Builds the `(sender, receiver)` pair a caller should construct the
/// `CampusFs` with before calling [`mount`], so it can await the `Init`/
/// `Destroy` handshake the way `brfs::main` does.
pub fn event_channel() -> (Sender<FsEvent>, Receiver<FsEvent>) {
    channel()
}
