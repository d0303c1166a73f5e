//! VirtIO 9P transport (9P2000.L subset).
//!
//! Each request chain carries one message `{size: u32, id: u8, tag: u16,
//! body}`; the reply goes into the writable half of the same chain with
//! `id + 1`. Errors travel as `Rlerror` (id 7) carrying a Linux errno.
//! The device keeps the FID table; everything behind a FID belongs to the
//! [`FsBackend`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::device::{RecvStatus, VirtioBus, VirtioCore, VirtioDevice};
use crate::features;

/// Protocol error (malformed message, unknown FID, unknown op).
pub const P9_EPROTO: i32 = 71;
/// Operation not supported.
pub const P9_ENOTSUP: i32 = 524;

/// Reply id of `Rlerror` minus one (errors are sent as request id 6).
const ERROR_REPLY_ID: u8 = 6;

/// Errno-valued result used across the 9P boundary. The error is a
/// positive Linux errno, written to the wire as-is.
pub type FsResult<T> = Result<T, i32>;

/// 9P server-side unique file identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Qid {
    /// File type bits.
    pub kind: u8,
    /// Version (changes on modification).
    pub version: u32,
    /// Unique path id.
    pub path: u64,
}

/// Backend-owned file handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FsFile(pub u64);

/// `statfs` reply fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStatFs {
    pub bsize: u32,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
}

/// `getattr` reply fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStat {
    pub qid: Qid,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
    pub ctime_sec: u64,
    pub ctime_nsec: u64,
}

/// POSIX lock description carried by `lock`/`getlock`.
#[derive(Debug, Clone, Default)]
pub struct FsLock {
    pub kind: u8,
    pub flags: u32,
    pub start: u64,
    pub length: u64,
    pub proc_id: u32,
    pub client_id: String,
}

/// `setattr` arguments beyond the FID.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mask: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime_sec: u64,
    pub atime_nsec: u64,
    pub mtime_sec: u64,
    pub mtime_nsec: u64,
}

/// Completion for the asynchronous `open`.
pub type OpenCompletion = Box<dyn FnOnce(FsResult<Qid>) + Send>;

/// Host filesystem behind the 9P device.
///
/// Handles returned by `attach` and `walk` are owned by the backend; the
/// device releases them through [`Self::close`] when a FID is clunked or
/// rebound. `walk` must return a handle distinct from its input, since the
/// device may close the input while storing the result under the same
/// FID.
///
/// `open` either completes in the caller (`Some`) or returns `None` and
/// invokes `done` later from another thread; it must not call `done` from
/// within the submitting call.
pub trait FsBackend: Send {
    fn statfs(&mut self) -> FsStatFs;
    fn attach(&mut self, uid: u32, uname: &str, aname: &str) -> FsResult<(FsFile, Qid)>;
    fn walk(&mut self, file: FsFile, names: &[String]) -> FsResult<(FsFile, Vec<Qid>)>;
    fn open(&mut self, file: FsFile, flags: u32, done: OpenCompletion) -> Option<FsResult<Qid>>;
    fn create(&mut self, file: FsFile, name: &str, flags: u32, mode: u32, gid: u32)
        -> FsResult<Qid>;
    fn symlink(&mut self, file: FsFile, name: &str, target: &str, gid: u32) -> FsResult<Qid>;
    fn mknod(
        &mut self,
        file: FsFile,
        name: &str,
        mode: u32,
        major: u32,
        minor: u32,
        gid: u32,
    ) -> FsResult<Qid>;
    fn readlink(&mut self, file: FsFile) -> FsResult<String>;
    fn stat(&mut self, file: FsFile) -> FsResult<FsStat>;
    fn setattr(&mut self, file: FsFile, attr: &SetAttr) -> FsResult<()>;
    fn readdir(&mut self, file: FsFile, offset: u64, max_count: u32) -> FsResult<Vec<u8>>;
    fn read(&mut self, file: FsFile, offset: u64, max_count: u32) -> FsResult<Vec<u8>>;
    fn write(&mut self, file: FsFile, offset: u64, data: &[u8]) -> FsResult<u32>;
    fn lock(&mut self, file: FsFile, lock: &FsLock) -> FsResult<u8>;
    fn getlock(&mut self, file: FsFile, lock: &FsLock) -> FsResult<FsLock>;
    fn link(&mut self, dir: FsFile, file: FsFile, name: &str) -> FsResult<()>;
    fn mkdir(&mut self, file: FsFile, name: &str, mode: u32, gid: u32) -> FsResult<Qid>;
    fn renameat(
        &mut self,
        dir: FsFile,
        name: &str,
        new_dir: FsFile,
        new_name: &str,
    ) -> FsResult<()>;
    fn unlinkat(&mut self, dir: FsFile, name: &str) -> FsResult<()>;
    fn close(&mut self, file: FsFile);
}

/// Little-endian 9P message writer.
struct P9Writer {
    buf: Vec<u8>,
}

impl P9Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn u8(&mut self, val: u8) -> &mut Self {
        self.buf.push(val);
        self
    }

    fn u16(&mut self, val: u16) -> &mut Self {
        self.buf.extend_from_slice(&val.to_le_bytes());
        self
    }

    fn u32(&mut self, val: u32) -> &mut Self {
        self.buf.extend_from_slice(&val.to_le_bytes());
        self
    }

    fn u64(&mut self, val: u64) -> &mut Self {
        self.buf.extend_from_slice(&val.to_le_bytes());
        self
    }

    fn string(&mut self, val: &str) -> &mut Self {
        self.u16(val.len() as u16);
        self.buf.extend_from_slice(val.as_bytes());
        self
    }

    fn qid(&mut self, qid: &Qid) -> &mut Self {
        self.u8(qid.kind).u32(qid.version).u64(qid.path)
    }

    fn bytes(&mut self, val: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(val);
        self
    }

    fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Little-endian 9P message reader; every short read is a protocol error.
struct P9Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> P9Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> FsResult<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or(P9_EPROTO)?;
        if end > self.buf.len() {
            return Err(P9_EPROTO);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> FsResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> FsResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap_or([0; 2])))
    }

    fn u32(&mut self) -> FsResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap_or([0; 4])))
    }

    fn u64(&mut self) -> FsResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap_or([0; 8])))
    }

    fn string(&mut self) -> FsResult<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| P9_EPROTO)
    }
}

/// What a dispatched request did with the chain.
enum Dispatch {
    /// Reply already published.
    Replied,
    /// Backend holds the completion; the chain stays pending.
    InFlight,
}

/// The 9P device.
pub struct VirtioNineP {
    core: VirtioCore,
    fs: Box<dyn FsBackend>,
    /// Negotiated maximum message size.
    msize: u32,
    fids: HashMap<u32, FsFile>,
    in_flight: bool,
    handle: Weak<Mutex<Self>>,
}

impl VirtioNineP {
    const DEFAULT_MSIZE: u32 = 8192;

    /// Creates the device exporting `fs` under `mount_tag`.
    #[must_use]
    pub fn new(bus: &VirtioBus, fs: Box<dyn FsBackend>, mount_tag: &str) -> Arc<Mutex<Self>> {
        let tag = mount_tag.as_bytes();
        let mut core = VirtioCore::new(bus, crate::VirtioDeviceId::NineP as u32, 2 + tag.len());
        core.offer_features(features::VERSION_1 | features::P9_F_MOUNT_TAG);
        core.set_config(0, &(tag.len() as u16).to_le_bytes());
        core.set_config(2, tag);

        tracing::info!(mount_tag, "virtio-9p ready");

        let dev = Arc::new(Mutex::new(Self {
            core,
            fs,
            msize: Self::DEFAULT_MSIZE,
            fids: HashMap::new(),
            in_flight: false,
            handle: Weak::new(),
        }));
        dev.lock().unwrap_or_else(|e| e.into_inner()).handle = Arc::downgrade(&dev);
        dev
    }

    fn fid_find(&self, fid: u32) -> FsResult<FsFile> {
        self.fids.get(&fid).copied().ok_or(P9_EPROTO)
    }

    /// Binds `fid`, releasing whatever it pointed at before.
    fn fid_set(&mut self, fid: u32, file: FsFile) {
        if let Some(old) = self.fids.insert(fid, file) {
            self.fs.close(old);
        }
    }

    fn fid_delete(&mut self, fid: u32) {
        if let Some(file) = self.fids.remove(&fid) {
            self.fs.close(file);
        }
    }

    fn send_reply(&mut self, queue_idx: usize, desc_idx: u16, id: u8, tag: u16, body: &[u8]) {
        let len = body.len() + 7;
        let mut msg = P9Writer::new();
        msg.u32(len as u32).u8(id + 1).u16(tag).bytes(body);
        let msg = msg.into_vec();
        if self
            .core
            .copy_to_queue(queue_idx, desc_idx, 0, &msg)
            .is_err()
        {
            tracing::warn!(id, tag, "9p reply does not fit the chain");
            return;
        }
        self.core.consume_desc(queue_idx, desc_idx, len);
    }

    fn send_error(&mut self, queue_idx: usize, desc_idx: u16, tag: u16, errno: i32) {
        tracing::debug!(tag, errno, "9p error reply");
        let mut body = P9Writer::new();
        body.u32(errno as u32);
        let body = body.into_vec();
        self.send_reply(queue_idx, desc_idx, ERROR_REPLY_ID, tag, &body);
    }

    fn open_completion(&self, queue_idx: usize, desc_idx: u16, tag: u16) -> OpenCompletion {
        let handle = self.handle.clone();
        Box::new(move |result| {
            if let Some(dev) = handle.upgrade() {
                let mut dev = dev.lock().unwrap_or_else(|e| e.into_inner());
                dev.finish_open(queue_idx, desc_idx, tag, result);
            }
        })
    }

    fn finish_open(&mut self, queue_idx: usize, desc_idx: u16, tag: u16, result: FsResult<Qid>) {
        self.reply_open(queue_idx, desc_idx, tag, result);
        self.in_flight = false;
        self.queue_notify(queue_idx);
    }

    fn reply_open(&mut self, queue_idx: usize, desc_idx: u16, tag: u16, result: FsResult<Qid>) {
        match result {
            Ok(qid) => {
                let mut body = P9Writer::new();
                body.qid(&qid).u32(self.msize.saturating_sub(24));
                let body = body.into_vec();
                self.send_reply(queue_idx, desc_idx, 12, tag, &body);
            }
            Err(errno) => self.send_error(queue_idx, desc_idx, tag, errno),
        }
    }

    /// Runs one request; `Err` carries the errno for the error reply.
    #[allow(clippy::too_many_lines)]
    fn dispatch(
        &mut self,
        id: u8,
        tag: u16,
        r: &mut P9Reader<'_>,
        queue_idx: usize,
        desc_idx: u16,
    ) -> FsResult<Dispatch> {
        let mut reply = P9Writer::new();
        match id {
            8 => {
                // statfs
                let st = self.fs.statfs();
                reply
                    .u32(0)
                    .u32(st.bsize)
                    .u64(st.blocks)
                    .u64(st.bfree)
                    .u64(st.bavail)
                    .u64(st.files)
                    .u64(st.ffree)
                    .u64(0)
                    .u32(256); // max filename length
            }
            12 => {
                // lopen, possibly asynchronous
                let fid = r.u32()?;
                let flags = r.u32()?;
                let file = self.fid_find(fid)?;
                let done = self.open_completion(queue_idx, desc_idx, tag);
                return match self.fs.open(file, flags, done) {
                    Some(result) => {
                        self.reply_open(queue_idx, desc_idx, tag, result);
                        Ok(Dispatch::Replied)
                    }
                    None => {
                        self.in_flight = true;
                        Ok(Dispatch::InFlight)
                    }
                };
            }
            14 => {
                // lcreate
                let fid = r.u32()?;
                let name = r.string()?;
                let flags = r.u32()?;
                let mode = r.u32()?;
                let gid = r.u32()?;
                let file = self.fid_find(fid)?;
                let qid = self.fs.create(file, &name, flags, mode, gid)?;
                reply.qid(&qid).u32(self.msize.saturating_sub(24));
            }
            16 => {
                // symlink
                let fid = r.u32()?;
                let name = r.string()?;
                let target = r.string()?;
                let gid = r.u32()?;
                let file = self.fid_find(fid)?;
                let qid = self.fs.symlink(file, &name, &target, gid)?;
                reply.qid(&qid);
            }
            18 => {
                // mknod
                let fid = r.u32()?;
                let name = r.string()?;
                let mode = r.u32()?;
                let major = r.u32()?;
                let minor = r.u32()?;
                let gid = r.u32()?;
                let file = self.fid_find(fid)?;
                let qid = self.fs.mknod(file, &name, mode, major, minor, gid)?;
                reply.qid(&qid);
            }
            22 => {
                // readlink
                let fid = r.u32()?;
                let file = self.fid_find(fid)?;
                let target = self.fs.readlink(file)?;
                reply.string(&target);
            }
            24 => {
                // getattr
                let fid = r.u32()?;
                let mask = r.u64()?;
                let file = self.fid_find(fid)?;
                let st = self.fs.stat(file)?;
                reply
                    .u64(mask)
                    .qid(&st.qid)
                    .u32(st.mode)
                    .u32(st.uid)
                    .u32(st.gid)
                    .u64(st.nlink)
                    .u64(st.rdev)
                    .u64(st.size)
                    .u64(st.blksize)
                    .u64(st.blocks)
                    .u64(st.atime_sec)
                    .u64(st.atime_nsec)
                    .u64(st.mtime_sec)
                    .u64(st.mtime_nsec)
                    .u64(st.ctime_sec)
                    .u64(st.ctime_nsec)
                    .u64(0)
                    .u64(0)
                    .u64(0)
                    .u64(0);
            }
            26 => {
                // setattr
                let fid = r.u32()?;
                let attr = SetAttr {
                    mask: r.u32()?,
                    mode: r.u32()?,
                    uid: r.u32()?,
                    gid: r.u32()?,
                    size: r.u64()?,
                    atime_sec: r.u64()?,
                    atime_nsec: r.u64()?,
                    mtime_sec: r.u64()?,
                    mtime_nsec: r.u64()?,
                };
                let file = self.fid_find(fid)?;
                self.fs.setattr(file, &attr)?;
            }
            30 => {
                // xattrwalk
                return Err(P9_ENOTSUP);
            }
            40 | 116 => {
                // readdir / read: same wire shape
                let fid = r.u32()?;
                let offset = r.u64()?;
                let count = r.u32()?;
                let file = self.fid_find(fid)?;
                let data = if id == 40 {
                    self.fs.readdir(file, offset, count)?
                } else {
                    self.fs.read(file, offset, count)?
                };
                reply.u32(data.len() as u32).bytes(&data);
            }
            50 => {
                // fsync: nothing buffered
                let _fid = r.u32()?;
            }
            52 => {
                // lock
                let fid = r.u32()?;
                let lock = FsLock {
                    kind: r.u8()?,
                    flags: r.u32()?,
                    start: r.u64()?,
                    length: r.u64()?,
                    proc_id: r.u32()?,
                    client_id: r.string()?,
                };
                let file = self.fid_find(fid)?;
                let status = self.fs.lock(file, &lock)?;
                reply.u8(status);
            }
            54 => {
                // getlock
                let fid = r.u32()?;
                let lock = FsLock {
                    kind: r.u8()?,
                    flags: 0,
                    start: r.u64()?,
                    length: r.u64()?,
                    proc_id: r.u32()?,
                    client_id: r.string()?,
                };
                let file = self.fid_find(fid)?;
                let out = self.fs.getlock(file, &lock)?;
                reply
                    .u8(out.kind)
                    .u64(out.start)
                    .u64(out.length)
                    .u32(out.proc_id)
                    .string(&out.client_id);
            }
            70 => {
                // link
                let dfid = r.u32()?;
                let fid = r.u32()?;
                let name = r.string()?;
                let dir = self.fid_find(dfid)?;
                let file = self.fid_find(fid)?;
                self.fs.link(dir, file, &name)?;
            }
            72 => {
                // mkdir
                let fid = r.u32()?;
                let name = r.string()?;
                let mode = r.u32()?;
                let gid = r.u32()?;
                let file = self.fid_find(fid)?;
                let qid = self.fs.mkdir(file, &name, mode, gid)?;
                reply.qid(&qid);
            }
            74 => {
                // renameat
                let fid = r.u32()?;
                let name = r.string()?;
                let new_fid = r.u32()?;
                let new_name = r.string()?;
                let dir = self.fid_find(fid)?;
                let new_dir = self.fid_find(new_fid)?;
                self.fs.renameat(dir, &name, new_dir, &new_name)?;
            }
            76 => {
                // unlinkat
                let fid = r.u32()?;
                let name = r.string()?;
                let _flags = r.u32()?;
                let dir = self.fid_find(fid)?;
                self.fs.unlinkat(dir, &name)?;
            }
            100 => {
                // version
                let msize = r.u32()?;
                let _version = r.string()?;
                self.msize = msize;
                reply.u32(self.msize).string("9P2000.L");
            }
            104 => {
                // attach
                let fid = r.u32()?;
                let _afid = r.u32()?;
                let uname = r.string()?;
                let aname = r.string()?;
                let uid = r.u32()?;
                let (file, qid) = self.fs.attach(uid, &uname, &aname)?;
                self.fid_set(fid, file);
                reply.qid(&qid);
            }
            108 => {
                // flush: requests complete in order, nothing to cancel
                let _oldtag = r.u16()?;
            }
            110 => {
                // walk
                let fid = r.u32()?;
                let new_fid = r.u32()?;
                let nwname = r.u16()?;
                let file = self.fid_find(fid)?;
                let mut names = Vec::with_capacity(usize::from(nwname));
                for _ in 0..nwname {
                    names.push(r.string()?);
                }
                let (new_file, qids) = self.fs.walk(file, &names)?;
                reply.u16(qids.len() as u16);
                for qid in &qids {
                    reply.qid(qid);
                }
                self.fid_set(new_fid, new_file);
            }
            118 => {
                // write: payload continues in the message body
                let fid = r.u32()?;
                let offset = r.u64()?;
                let count = r.u32()?;
                let data = r.take(count as usize)?;
                let file = self.fid_find(fid)?;
                let written = self.fs.write(file, offset, data)?;
                reply.u32(written);
            }
            120 => {
                // clunk
                let fid = r.u32()?;
                self.fid_delete(fid);
            }
            other => {
                tracing::warn!(id = other, "unsupported 9p operation");
                return Err(P9_EPROTO);
            }
        }

        let body = reply.into_vec();
        self.send_reply(queue_idx, desc_idx, id, tag, &body);
        Ok(Dispatch::Replied)
    }
}

impl VirtioDevice for VirtioNineP {
    fn core(&self) -> &VirtioCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut VirtioCore {
        &mut self.core
    }

    fn recv(
        &mut self,
        queue_idx: usize,
        desc_idx: u16,
        read_size: usize,
        _write_size: usize,
    ) -> RecvStatus {
        if queue_idx != 0 {
            return RecvStatus::Done;
        }
        if self.in_flight {
            return RecvStatus::Stall;
        }

        // Pull the whole message out of the chain; requests are bounded by
        // the negotiated msize.
        let len = read_size.min(self.msize.max(Self::DEFAULT_MSIZE) as usize);
        let mut msg = vec![0u8; len];
        if self
            .core
            .copy_from_queue(queue_idx, desc_idx, 0, &mut msg)
            .is_err()
        {
            self.send_error(queue_idx, desc_idx, 0, P9_EPROTO);
            return RecvStatus::Done;
        }

        let mut r = P9Reader::new(&msg);
        let header = (|| -> FsResult<(u8, u16)> {
            let _size = r.u32()?;
            let id = r.u8()?;
            let tag = r.u16()?;
            Ok((id, tag))
        })();
        let Ok((id, tag)) = header else {
            self.send_error(queue_idx, desc_idx, 0, P9_EPROTO);
            return RecvStatus::Done;
        };

        tracing::trace!(id, tag, "9p request");

        match self.dispatch(id, tag, &mut r, queue_idx, desc_idx) {
            Ok(Dispatch::Replied | Dispatch::InFlight) => {}
            Err(errno) => self.send_error(queue_idx, desc_idx, tag, errno),
        }
        RecvStatus::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{program_queue, push_avail, rig, write_desc, TestRig, USED_RING};
    use crate::dma::GuestDma;
    use crate::queue::{desc_flags, Desc};

    const REQ_ADDR: u64 = 0x4000;
    const REPLY_ADDR: u64 = 0x6000;

    /// Tiny in-memory tree: handle 1 = root dir, handle 2+ = files created
    /// by walk/attach. Records closes so the FID lifecycle is observable.
    struct MemFs {
        next_handle: u64,
        closed: Arc<Mutex<Vec<u64>>>,
        defer_open: bool,
        deferred: Arc<Mutex<Vec<(OpenCompletion, FsResult<Qid>)>>>,
        file_data: Vec<u8>,
    }

    impl MemFs {
        fn new() -> Self {
            Self {
                next_handle: 1,
                closed: Arc::new(Mutex::new(Vec::new())),
                defer_open: false,
                deferred: Arc::new(Mutex::new(Vec::new())),
                file_data: b"root file contents".to_vec(),
            }
        }

        fn fresh(&mut self) -> FsFile {
            let h = self.next_handle;
            self.next_handle += 1;
            FsFile(h)
        }
    }

    impl FsBackend for MemFs {
        fn statfs(&mut self) -> FsStatFs {
            FsStatFs {
                bsize: 4096,
                blocks: 1000,
                bfree: 500,
                bavail: 400,
                files: 64,
                ffree: 32,
            }
        }

        fn attach(&mut self, _uid: u32, _uname: &str, _aname: &str) -> FsResult<(FsFile, Qid)> {
            let f = self.fresh();
            Ok((f, Qid { kind: 0x80, version: 0, path: f.0 }))
        }

        fn walk(&mut self, _file: FsFile, names: &[String]) -> FsResult<(FsFile, Vec<Qid>)> {
            if names.iter().any(|n| n == "missing") {
                return Err(2); // ENOENT
            }
            let f = self.fresh();
            let qids = names
                .iter()
                .enumerate()
                .map(|(i, _)| Qid { kind: 0, version: 0, path: 100 + i as u64 })
                .collect();
            Ok((f, qids))
        }

        fn open(&mut self, file: FsFile, _flags: u32, done: OpenCompletion) -> Option<FsResult<Qid>> {
            let result = Ok(Qid { kind: 0, version: 1, path: file.0 });
            if self.defer_open {
                self.deferred.lock().unwrap().push((done, result));
                None
            } else {
                Some(result)
            }
        }

        fn create(&mut self, _f: FsFile, _n: &str, _fl: u32, _m: u32, _g: u32) -> FsResult<Qid> {
            Ok(Qid { kind: 0, version: 0, path: 7 })
        }

        fn symlink(&mut self, _f: FsFile, _n: &str, _t: &str, _g: u32) -> FsResult<Qid> {
            Ok(Qid::default())
        }

        fn mknod(&mut self, _f: FsFile, _n: &str, _m: u32, _ma: u32, _mi: u32, _g: u32) -> FsResult<Qid> {
            Ok(Qid::default())
        }

        fn readlink(&mut self, _file: FsFile) -> FsResult<String> {
            Ok("/target".to_string())
        }

        fn stat(&mut self, file: FsFile) -> FsResult<FsStat> {
            Ok(FsStat {
                qid: Qid { kind: 0, version: 0, path: file.0 },
                mode: 0o644,
                size: self.file_data.len() as u64,
                ..FsStat::default()
            })
        }

        fn setattr(&mut self, _file: FsFile, _attr: &SetAttr) -> FsResult<()> {
            Ok(())
        }

        fn readdir(&mut self, _f: FsFile, _off: u64, _max: u32) -> FsResult<Vec<u8>> {
            Ok(vec![1, 2, 3])
        }

        fn read(&mut self, _f: FsFile, off: u64, max: u32) -> FsResult<Vec<u8>> {
            let start = (off as usize).min(self.file_data.len());
            let end = (start + max as usize).min(self.file_data.len());
            Ok(self.file_data[start..end].to_vec())
        }

        fn write(&mut self, _f: FsFile, _off: u64, data: &[u8]) -> FsResult<u32> {
            self.file_data.extend_from_slice(data);
            Ok(data.len() as u32)
        }

        fn lock(&mut self, _f: FsFile, _l: &FsLock) -> FsResult<u8> {
            Ok(0)
        }

        fn getlock(&mut self, _f: FsFile, l: &FsLock) -> FsResult<FsLock> {
            Ok(l.clone())
        }

        fn link(&mut self, _d: FsFile, _f: FsFile, _n: &str) -> FsResult<()> {
            Ok(())
        }

        fn mkdir(&mut self, _f: FsFile, _n: &str, _m: u32, _g: u32) -> FsResult<Qid> {
            Ok(Qid { kind: 0x80, version: 0, path: 9 })
        }

        fn renameat(&mut self, _d: FsFile, _n: &str, _nd: FsFile, _nn: &str) -> FsResult<()> {
            Ok(())
        }

        fn unlinkat(&mut self, _d: FsFile, _n: &str) -> FsResult<()> {
            Ok(())
        }

        fn close(&mut self, file: FsFile) {
            self.closed.lock().unwrap().push(file.0);
        }
    }

    struct P9Rig {
        rig: TestRig,
        dev: Arc<Mutex<VirtioNineP>>,
        avail_idx: u16,
    }

    fn p9_rig(fs: MemFs) -> P9Rig {
        let rig = rig();
        let dev = VirtioNineP::new(&rig.bus, Box::new(fs), "hostshare");
        program_queue(&mut *dev.lock().unwrap(), 0, 8);
        P9Rig {
            rig,
            dev,
            avail_idx: 0,
        }
    }

    impl P9Rig {
        /// Sends a raw 9P message and returns the reply bytes.
        fn roundtrip(&mut self, id: u8, tag: u16, body: &[u8]) -> Vec<u8> {
            let mut msg = P9Writer::new();
            msg.u32((body.len() + 7) as u32).u8(id).u16(tag).bytes(body);
            let msg = msg.into_vec();
            self.rig.ram.write(REQ_ADDR, &msg);

            write_desc(
                &self.rig.ram,
                0,
                Desc {
                    addr: REQ_ADDR,
                    len: msg.len() as u32,
                    flags: desc_flags::NEXT,
                    next: 1,
                },
            );
            write_desc(
                &self.rig.ram,
                1,
                Desc {
                    addr: REPLY_ADDR,
                    len: 8192,
                    flags: desc_flags::WRITE,
                    next: 0,
                },
            );
            push_avail(
                &self.rig.ram,
                self.avail_idx & 7,
                0,
                self.avail_idx.wrapping_add(1),
            );
            self.avail_idx = self.avail_idx.wrapping_add(1);

            self.dev.lock().unwrap().queue_notify(0);

            let len = u32::from_le_bytes(
                self.rig.ram.snapshot(REPLY_ADDR, 4).try_into().unwrap(),
            ) as usize;
            self.rig.ram.snapshot(REPLY_ADDR, len.clamp(7, 8192))
        }

        fn attach(&mut self, fid: u32) {
            let mut body = P9Writer::new();
            body.u32(fid).u32(!0u32).string("user").string("/").u32(500);
            let body = body.into_vec();
            let reply = self.roundtrip(104, 1, &body);
            assert_eq!(reply[4], 105);
        }
    }

    #[test]
    fn test_version_negotiates_msize() {
        let mut p9 = p9_rig(MemFs::new());
        let mut body = P9Writer::new();
        body.u32(16384).string("9P2000.L");
        let body = body.into_vec();
        let reply = p9.roundtrip(100, 0xbeef, &body);

        assert_eq!(reply[4], 101); // Rversion
        assert_eq!(u16::from_le_bytes([reply[5], reply[6]]), 0xbeef);
        assert_eq!(u32::from_le_bytes(reply[7..11].try_into().unwrap()), 16384);
        let strlen = u16::from_le_bytes([reply[11], reply[12]]) as usize;
        assert_eq!(&reply[13..13 + strlen], b"9P2000.L");
        assert_eq!(p9.dev.lock().unwrap().msize, 16384);
    }

    #[test]
    fn test_truncated_version_yields_eproto() {
        let mut p9 = p9_rig(MemFs::new());
        // version with the string cut off mid-length
        let reply = p9.roundtrip(100, 0x77, &[0x00, 0x20]);

        assert_eq!(reply[4], 7); // Rlerror
        assert_eq!(u16::from_le_bytes([reply[5], reply[6]]), 0x77);
        assert_eq!(
            u32::from_le_bytes(reply[7..11].try_into().unwrap()),
            P9_EPROTO as u32
        );
        // No FID state was created.
        assert!(p9.dev.lock().unwrap().fids.is_empty());
    }

    #[test]
    fn test_attach_binds_fid() {
        let mut p9 = p9_rig(MemFs::new());
        p9.attach(1);
        let dev = p9.dev.lock().unwrap();
        assert_eq!(dev.fids.len(), 1);
        assert!(dev.fids.contains_key(&1));
    }

    #[test]
    fn test_walk_binds_new_fid_and_reports_qids() {
        let mut p9 = p9_rig(MemFs::new());
        p9.attach(1);

        let mut body = P9Writer::new();
        body.u32(1).u32(2).u16(2).string("etc").string("motd");
        let body = body.into_vec();
        let reply = p9.roundtrip(110, 3, &body);

        assert_eq!(reply[4], 111); // Rwalk
        assert_eq!(u16::from_le_bytes([reply[7], reply[8]]), 2);
        assert!(p9.dev.lock().unwrap().fids.contains_key(&2));
    }

    #[test]
    fn test_walk_error_leaves_fid_unbound() {
        let mut p9 = p9_rig(MemFs::new());
        p9.attach(1);

        let mut body = P9Writer::new();
        body.u32(1).u32(2).u16(1).string("missing");
        let body = body.into_vec();
        let reply = p9.roundtrip(110, 3, &body);

        assert_eq!(reply[4], 7);
        assert_eq!(u32::from_le_bytes(reply[7..11].try_into().unwrap()), 2);
        assert!(!p9.dev.lock().unwrap().fids.contains_key(&2));
    }

    #[test]
    fn test_unknown_fid_is_protocol_error() {
        let mut p9 = p9_rig(MemFs::new());
        let mut body = P9Writer::new();
        body.u32(42).u64(0xfff);
        let body = body.into_vec();
        let reply = p9.roundtrip(24, 9, &body);

        assert_eq!(reply[4], 7);
        assert_eq!(
            u32::from_le_bytes(reply[7..11].try_into().unwrap()),
            P9_EPROTO as u32
        );
    }

    #[test]
    fn test_read_and_write() {
        let mut p9 = p9_rig(MemFs::new());
        p9.attach(1);

        let mut body = P9Writer::new();
        body.u32(1).u64(5).u32(4);
        let body = body.into_vec();
        let reply = p9.roundtrip(116, 4, &body);
        assert_eq!(reply[4], 117); // Rread
        assert_eq!(u32::from_le_bytes(reply[7..11].try_into().unwrap()), 4);
        assert_eq!(&reply[11..15], b"file");

        let mut body = P9Writer::new();
        body.u32(1).u64(0).u32(3).bytes(b"abc");
        let body = body.into_vec();
        let reply = p9.roundtrip(118, 5, &body);
        assert_eq!(reply[4], 119); // Rwrite
        assert_eq!(u32::from_le_bytes(reply[7..11].try_into().unwrap()), 3);
    }

    #[test]
    fn test_write_with_short_payload_is_eproto() {
        let mut p9 = p9_rig(MemFs::new());
        p9.attach(1);

        let mut body = P9Writer::new();
        body.u32(1).u64(0).u32(100).bytes(b"short");
        let body = body.into_vec();
        let reply = p9.roundtrip(118, 6, &body);
        assert_eq!(reply[4], 7);
    }

    #[test]
    fn test_clunk_and_rebind_close_backend_files() {
        let fs = MemFs::new();
        let closed = fs.closed.clone();
        let mut p9 = p9_rig(fs);
        p9.attach(1); // handle 1

        // Rebinding fid 1 via walk closes the old handle.
        let mut body = P9Writer::new();
        body.u32(1).u32(1).u16(0);
        let body = body.into_vec();
        let reply = p9.roundtrip(110, 3, &body);
        assert_eq!(reply[4], 111);
        assert_eq!(closed.lock().unwrap().as_slice(), &[1]);

        // Clunk closes the current handle and forgets the FID.
        let mut body = P9Writer::new();
        body.u32(1);
        let body = body.into_vec();
        let reply = p9.roundtrip(120, 4, &body);
        assert_eq!(reply[4], 121); // Rclunk
        assert_eq!(closed.lock().unwrap().as_slice(), &[1, 2]);
        assert!(p9.dev.lock().unwrap().fids.is_empty());
    }

    #[test]
    fn test_xattrwalk_not_supported() {
        let mut p9 = p9_rig(MemFs::new());
        let reply = p9.roundtrip(30, 8, &[]);
        assert_eq!(reply[4], 7);
        assert_eq!(
            u32::from_le_bytes(reply[7..11].try_into().unwrap()),
            P9_ENOTSUP as u32
        );
    }

    #[test]
    fn test_statfs_reply_shape() {
        let mut p9 = p9_rig(MemFs::new());
        let reply = p9.roundtrip(8, 2, &[]);
        assert_eq!(reply[4], 9); // Rstatfs
        // type(4) + bsize(4) + 6 u64 counters + fsid(8)... check bsize.
        assert_eq!(u32::from_le_bytes(reply[11..15].try_into().unwrap()), 4096);
    }

    #[test]
    fn test_async_open_stalls_queue_until_completion() {
        let mut fs = MemFs::new();
        fs.defer_open = true;
        let deferred = fs.deferred.clone();
        let mut p9 = p9_rig(fs);
        p9.attach(1);

        let mut body = P9Writer::new();
        body.u32(1).u32(0);
        let body = body.into_vec();

        // Submit lopen by hand so we can observe the stall.
        let mut msg = P9Writer::new();
        msg.u32((body.len() + 7) as u32).u8(12).u16(9).bytes(&body);
        let msg = msg.into_vec();
        p9.rig.ram.write(REQ_ADDR, &msg);
        write_desc(
            &p9.rig.ram,
            0,
            Desc {
                addr: REQ_ADDR,
                len: msg.len() as u32,
                flags: desc_flags::NEXT,
                next: 1,
            },
        );
        write_desc(
            &p9.rig.ram,
            1,
            Desc {
                addr: REPLY_ADDR,
                len: 4096,
                flags: desc_flags::WRITE,
                next: 0,
            },
        );
        push_avail(&p9.rig.ram, p9.avail_idx & 7, 0, p9.avail_idx.wrapping_add(1));
        let used_before = p9.rig.ram.read_u16(USED_RING + 2);
        p9.dev.lock().unwrap().queue_notify(0);

        {
            let mut dev = p9.dev.lock().unwrap();
            assert!(dev.in_flight);
            assert_eq!(p9.rig.ram.read_u16(USED_RING + 2), used_before);
            assert_eq!(dev.recv(0, 0, 16, 16), RecvStatus::Stall);
        }

        let (done, result) = deferred.lock().unwrap().pop().unwrap();
        done(result);

        let dev = p9.dev.lock().unwrap();
        assert!(!dev.in_flight);
        assert_eq!(
            p9.rig.ram.read_u16(USED_RING + 2),
            used_before.wrapping_add(1)
        );
        let reply = p9.rig.ram.snapshot(REPLY_ADDR, 11);
        assert_eq!(reply[4], 13); // Rlopen
    }
}
