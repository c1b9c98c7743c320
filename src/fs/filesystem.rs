//! FUSE adapter
//!
//! Translates inode-addressed kernel requests into path operations on
//! [`SecretsFs`]. The mount is read-only; every mutating request falls back
//! to fuser's default ENOSYS reply.
//!
//! The fuser session loop dispatches one request at a time. Reads may wait
//! on a decrypt, so they run on the runtime's blocking pool and reply from
//! there; every other operation answers from memory on the loop itself.

use super::dispatch::{NodeAttr, SecretsFs};
use super::inode::{child_path, InodeTable};
use crate::config::MountConfig;
use crate::error::{Error, Result};
use crate::tree::NodeKind;
use fuser::{
    FileAttr, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, Request,
};
use libc::ENOENT;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use zeroize::Zeroizing;

const TTL: Duration = Duration::from_secs(1);

/// Longest name reported by statfs
const MAX_NAME_LEN: u32 = 255;

const BLOCK_SIZE: u32 = 4096;

/// FUSE filesystem serving a [`SecretsFs`]
pub struct SecretsFuse {
    /// Path operations
    fs: Arc<SecretsFs>,
    /// Inode numbering
    inodes: InodeTable,
    /// Ownership and permissions
    config: MountConfig,
    /// Runs reads off the session loop
    runtime: Handle,
}

impl SecretsFuse {
    pub fn new(fs: Arc<SecretsFs>, config: MountConfig, runtime: Handle) -> Self {
        SecretsFuse {
            fs,
            inodes: InodeTable::new(),
            config,
            runtime,
        }
    }

    /// Read `path` on the blocking pool and pass the result to `respond`
    pub fn spawn_read<F>(&self, path: String, offset: u64, size: u32, respond: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<Zeroizing<Vec<u8>>>) + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        self.runtime
            .spawn_blocking(move || respond(fs.read(&path, offset, size)))
    }

    /// Build kernel attributes for a resolved node
    fn file_attr(&self, ino: u64, attr: NodeAttr) -> FileAttr {
        let time = SystemTime::from(self.fs.tree().loaded_at());
        let (perm, nlink) = match attr.kind {
            NodeKind::Directory => (self.config.dir_mode, 2),
            NodeKind::File => (self.config.file_mode, 1),
        };

        FileAttr {
            ino,
            size: attr.size,
            blocks: (attr.size + 511) / 512,
            atime: time,
            mtime: time,
            ctime: time,
            crtime: time,
            kind: attr.kind.to_fuser(),
            perm,
            nlink,
            uid: self.config.uid,
            gid: self.config.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: 0,
        }
    }

    fn path_of(&self, ino: u64) -> Result<String> {
        self.inodes
            .path(ino)
            .ok_or_else(|| Error::NotFound(format!("inode {}", ino)))
    }
}

impl Filesystem for SecretsFuse {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={}, name={:?})", parent, name);

        let (Ok(parent_path), Some(name)) = (self.path_of(parent), name.to_str()) else {
            reply.error(ENOENT);
            return;
        };

        let path = child_path(&parent_path, name);
        match self.fs.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.ino_for(&path);
                reply.entry(&TTL, &self.file_attr(ino, attr), 0);
            }
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        debug!("getattr(ino={})", ino);

        match self.path_of(ino).and_then(|path| self.fs.getattr(&path)) {
            Ok(attr) => reply.attr(&TTL, &self.file_attr(ino, attr)),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn opendir(&mut self, _req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        debug!("opendir(ino={})", ino);

        match self.path_of(ino).and_then(|path| self.fs.opendir(&path)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={}, offset={})", ino, offset);

        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };
        let children = match self.fs.readdir(&path) {
            Ok(children) => children,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        let mut entries: Vec<(u64, NodeKind, String)> = vec![
            (ino, NodeKind::Directory, ".".to_string()),
            (self.inodes.parent_ino(&path), NodeKind::Directory, "..".to_string()),
        ];
        entries.extend(children.into_iter().map(|entry| {
            let child_ino = self.inodes.ino_for(&child_path(&path, &entry.name));
            (child_ino, entry.kind, entry.name)
        }));

        for (i, (child_ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            let buffer_full = reply.add(*child_ino, (i + 1) as i64, kind.to_fuser(), name);
            if buffer_full {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        debug!("releasedir(ino={}, fh={})", ino, fh);

        match self.path_of(ino).and_then(|path| self.fs.releasedir(&path, fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn open(&mut self, _req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        debug!("open(ino={}, flags={})", ino, flags);

        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            reply.error(libc::EROFS);
            return;
        }

        match self.path_of(ino).and_then(|path| self.fs.open(&path)) {
            Ok(fh) => reply.opened(fh, 0),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }

        let path = match self.path_of(ino) {
            Ok(path) => path,
            Err(e) => {
                reply.error(e.to_errno());
                return;
            }
        };

        self.spawn_read(path, offset as u64, size, move |result| match result {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.to_errno()),
        });
    }

    fn release(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        debug!("release(ino={}, fh={})", ino, fh);

        match self.path_of(ino).and_then(|path| self.fs.release(&path, fh)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e.to_errno()),
        }
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        let files = self.fs.tree().leaf_count() as u64;
        reply.statfs(
            0,          // blocks
            0,          // bfree
            0,          // bavail
            files,      // files
            0,          // ffree
            BLOCK_SIZE, // bsize
            MAX_NAME_LEN,
            BLOCK_SIZE, // frsize
        );
    }
}

/// Mount options for a read-only secrets mount
pub fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let mut options = vec![
        MountOption::RO,
        MountOption::FSName(config.fs_name.clone()),
        MountOption::Subtype("sopsfs".to_string()),
        MountOption::NoExec,
        MountOption::NoSuid,
        MountOption::NoDev,
    ];

    if config.auto_unmount {
        options.push(MountOption::AutoUnmount);
    }
    if config.allow_other {
        options.push(MountOption::AllowOther);
    }
    options
}

/// Mount `fs` at `mount_point` on a background session.
///
/// Reads are served on `runtime`'s blocking pool. The filesystem stays
/// mounted until the returned session is dropped.
pub fn mount(
    fs: Arc<SecretsFs>,
    mount_point: &Path,
    config: &MountConfig,
    runtime: Handle,
) -> Result<fuser::BackgroundSession> {
    std::fs::create_dir_all(mount_point)?;

    let options = mount_options(config);
    info!("Mounting at {:?}", mount_point);

    fuser::spawn_mount2(SecretsFuse::new(fs, config.clone(), runtime), mount_point, &options)
        .map_err(|e| Error::Mount(format!("Failed to mount at {}: {}", mount_point.display(), e)))
}
