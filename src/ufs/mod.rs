//! In-memory block-structured file store with descriptor semantics.
//!
//! Files are lists of 4 KiB blocks where every block except the last is
//! full. Descriptors address a file through a `(block, offset)` cursor and
//! advance independently of each other. A deleted file stays readable and
//! writable through the descriptors already open on it; its storage goes
//! away when the last one closes. Nothing here touches the disk and nothing
//! is shared across threads.

use std::cell::RefCell;
use std::rc::Rc;

use bitflags::bitflags;
use thiserror::Error;

use crate::slot_table::SlotTable;

/// Fixed unit of file storage.
pub const BLOCK_SIZE: usize = 4096;
/// Upper bound on a single file, 100 MB exactly.
pub const MAX_FILE_SIZE: usize = 100 * 1024 * 1024;

bitflags! {
    /// Flags accepted by [`UserFs::open`].
    ///
    /// An empty flag set grants both read and write, and so does `CREATE`
    /// alone; the three permission bits narrow access once any of them is
    /// present.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: u32 {
        /// Create the file if the name does not resolve.
        const CREATE = 1;
        /// Permit reads only.
        const READ_ONLY = 2;
        /// Permit writes only.
        const WRITE_ONLY = 4;
        /// Permit both directions.
        const READ_WRITE = 8;
    }
}

/// Failure modes of the file store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UfsError {
    /// Name does not resolve, or the descriptor slot is vacant.
    #[error("no such file")]
    NoFile,
    /// The operation would push the file past [`MAX_FILE_SIZE`].
    #[error("out of memory")]
    NoMem,
    /// The descriptor's flags do not permit the operation.
    #[error("no permission")]
    NoPermission,
}

/// Opaque descriptor handle; the slot index is recycled after close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fd(usize);

#[derive(Debug)]
struct Block {
    bytes: Vec<u8>,
    used: usize,
}

impl Block {
    fn new() -> Self {
        Block {
            bytes: vec![0; BLOCK_SIZE],
            used: 0,
        }
    }
}

#[derive(Debug)]
struct FileNode {
    name: String,
    // Never empty; all blocks except the last are full, and the bytes past
    // `used` in the last one are zero.
    blocks: Vec<Block>,
}

impl FileNode {
    fn size(&self) -> usize {
        (self.blocks.len() - 1) * BLOCK_SIZE + self.blocks[self.blocks.len() - 1].used
    }
}

#[derive(Debug)]
struct Descriptor {
    file: Rc<RefCell<FileNode>>,
    block: usize,
    // 0..=BLOCK_SIZE; the upper bound is the end-of-block resting position.
    offset: usize,
    flags: OpenFlags,
}

impl Descriptor {
    fn readable(&self) -> bool {
        self.flags.is_empty()
            || self
                .flags
                .intersects(OpenFlags::CREATE | OpenFlags::READ_ONLY | OpenFlags::READ_WRITE)
    }

    fn writable(&self) -> bool {
        self.flags.is_empty()
            || self
                .flags
                .intersects(OpenFlags::CREATE | OpenFlags::WRITE_ONLY | OpenFlags::READ_WRITE)
    }

    fn pos(&self) -> usize {
        self.block * BLOCK_SIZE + self.offset
    }
}

/// The file store: a name registry plus a descriptor table.
#[derive(Debug, Default)]
pub struct UserFs {
    files: Vec<Rc<RefCell<FileNode>>>,
    descriptors: SlotTable<Descriptor>,
}

impl UserFs {
    /// Creates an empty store.
    pub fn new() -> Self {
        UserFs::default()
    }

    /// Opens `name`, creating it when `CREATE` is set, and returns the
    /// lowest free descriptor slot. The cursor starts at the beginning.
    pub fn open(&mut self, name: &str, flags: OpenFlags) -> Result<Fd, UfsError> {
        let file = match self.files.iter().find(|f| f.borrow().name == name) {
            Some(file) => Rc::clone(file),
            None => {
                if !flags.contains(OpenFlags::CREATE) {
                    return Err(UfsError::NoFile);
                }
                let file = Rc::new(RefCell::new(FileNode {
                    name: name.to_string(),
                    blocks: vec![Block::new()],
                }));
                self.files.push(Rc::clone(&file));
                file
            }
        };
        let slot = self.descriptors.insert(Descriptor {
            file,
            block: 0,
            offset: 0,
            flags,
        });
        Ok(Fd(slot))
    }

    /// Writes `buf` at the descriptor's cursor, allocating blocks on demand.
    /// Fails whole with [`UfsError::NoMem`] when the write would cross the
    /// file size cap.
    pub fn write(&mut self, fd: Fd, buf: &[u8]) -> Result<usize, UfsError> {
        let desc = self.descriptors.get_mut(fd.0).ok_or(UfsError::NoFile)?;
        if !desc.writable() {
            return Err(UfsError::NoPermission);
        }
        if desc.pos() + buf.len() > MAX_FILE_SIZE {
            return Err(UfsError::NoMem);
        }
        let mut file = desc.file.borrow_mut();
        let mut written = 0;
        while written < buf.len() {
            if desc.offset == BLOCK_SIZE {
                desc.block += 1;
                desc.offset = 0;
                if desc.block == file.blocks.len() {
                    file.blocks.push(Block::new());
                }
            }
            let block = &mut file.blocks[desc.block];
            let room = (BLOCK_SIZE - desc.offset).min(buf.len() - written);
            block.bytes[desc.offset..desc.offset + room]
                .copy_from_slice(&buf[written..written + room]);
            desc.offset += room;
            written += room;
            if desc.offset > block.used {
                block.used = desc.offset;
            }
        }
        Ok(written)
    }

    /// Reads up to `buf.len()` bytes from the cursor. Returns 0 at end of
    /// file.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> Result<usize, UfsError> {
        let desc = self.descriptors.get_mut(fd.0).ok_or(UfsError::NoFile)?;
        if !desc.readable() {
            return Err(UfsError::NoPermission);
        }
        let file = desc.file.borrow();
        let mut read = 0;
        while read < buf.len() {
            if desc.offset == BLOCK_SIZE {
                if desc.block + 1 == file.blocks.len() {
                    break;
                }
                desc.block += 1;
                desc.offset = 0;
            }
            let block = &file.blocks[desc.block];
            let avail = block.used.saturating_sub(desc.offset).min(buf.len() - read);
            if avail == 0 {
                break;
            }
            buf[read..read + avail].copy_from_slice(&block.bytes[desc.offset..desc.offset + avail]);
            desc.offset += avail;
            read += avail;
        }
        Ok(read)
    }

    /// Releases the descriptor slot. The file's storage goes with the last
    /// descriptor when the name was already deleted.
    pub fn close(&mut self, fd: Fd) -> Result<(), UfsError> {
        self.descriptors.remove(fd.0).map(drop).ok_or(UfsError::NoFile)
    }

    /// Unlinks `name`. Open descriptors keep the file alive until the last
    /// one closes; the name is free for reuse immediately.
    pub fn delete(&mut self, name: &str) -> Result<(), UfsError> {
        let idx = self
            .files
            .iter()
            .position(|f| f.borrow().name == name)
            .ok_or(UfsError::NoFile)?;
        self.files.remove(idx);
        Ok(())
    }

    /// Grows (zero filled) or shrinks the file to `new_size`. Every
    /// descriptor pointing past the new end is clamped onto it.
    pub fn resize(&mut self, fd: Fd, new_size: usize) -> Result<(), UfsError> {
        let desc = self.descriptors.get(fd.0).ok_or(UfsError::NoFile)?;
        if !desc.writable() {
            return Err(UfsError::NoPermission);
        }
        if new_size > MAX_FILE_SIZE {
            return Err(UfsError::NoMem);
        }
        let file = Rc::clone(&desc.file);
        let (last_block, last_used) = {
            let mut node = file.borrow_mut();
            let old_size = node.size();
            if new_size < old_size {
                shrink(&mut node, new_size);
            } else if new_size > old_size {
                grow(&mut node, new_size);
            }
            (node.blocks.len() - 1, node.blocks[node.blocks.len() - 1].used)
        };
        for (_, desc) in self.descriptors.iter_mut() {
            if Rc::ptr_eq(&desc.file, &file)
                && (desc.pos() > new_size || desc.block > last_block)
            {
                desc.block = last_block;
                desc.offset = last_used;
            }
        }
        Ok(())
    }

    /// Current size of the descriptor's file in bytes.
    pub fn size(&self, fd: Fd) -> Result<usize, UfsError> {
        let desc = self.descriptors.get(fd.0).ok_or(UfsError::NoFile)?;
        Ok(desc.file.borrow().size())
    }

    /// Drops every file and descriptor.
    pub fn destroy(&mut self) {
        self.files.clear();
        self.descriptors = SlotTable::new();
    }
}

fn shrink(node: &mut FileNode, new_size: usize) {
    let keep = if new_size == 0 {
        1
    } else {
        new_size.div_ceil(BLOCK_SIZE)
    };
    node.blocks.truncate(keep);
    let last = node.blocks.last_mut().unwrap();
    let used = new_size - (keep - 1) * BLOCK_SIZE;
    // Re-zero the abandoned tail so a later grow exposes zeros, not stale
    // bytes.
    last.bytes[used..last.used].fill(0);
    last.used = used;
}

fn grow(node: &mut FileNode, new_size: usize) {
    let total = new_size.div_ceil(BLOCK_SIZE).max(1);
    node.blocks.last_mut().unwrap().used = BLOCK_SIZE;
    while node.blocks.len() < total {
        let mut block = Block::new();
        block.used = BLOCK_SIZE;
        node.blocks.push(block);
    }
    node.blocks.last_mut().unwrap().used = new_size - (total - 1) * BLOCK_SIZE;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_flags_grant_read_and_write() {
        let mut fs = UserFs::new();
        let fd = fs.open("f", OpenFlags::CREATE).unwrap();
        fs.write(fd, b"data").unwrap();
        fs.close(fd).unwrap();
        let fd = fs.open("f", OpenFlags::empty()).unwrap();
        fs.write(fd, b"DATA").unwrap();
        let rd = fs.open("f", OpenFlags::empty()).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(rd, &mut buf), Ok(4));
        assert_eq!(&buf, b"DATA");
    }

    #[test]
    fn permission_bits_gate_operations() {
        let mut fs = UserFs::new();
        let fd = fs.open("f", OpenFlags::CREATE).unwrap();
        fs.write(fd, b"x").unwrap();
        let ro = fs.open("f", OpenFlags::READ_ONLY).unwrap();
        assert_eq!(fs.write(ro, b"y"), Err(UfsError::NoPermission));
        let wo = fs.open("f", OpenFlags::WRITE_ONLY).unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(fs.read(wo, &mut buf), Err(UfsError::NoPermission));
        assert_eq!(fs.resize(ro, 0), Err(UfsError::NoPermission));
    }

    #[test]
    fn open_without_create_requires_existence() {
        let mut fs = UserFs::new();
        assert_eq!(fs.open("missing", OpenFlags::READ_ONLY), Err(UfsError::NoFile));
        assert_eq!(fs.open("missing", OpenFlags::empty()), Err(UfsError::NoFile));
    }

    #[test]
    fn descriptor_slots_are_lowest_free() {
        let mut fs = UserFs::new();
        let a = fs.open("f", OpenFlags::CREATE).unwrap();
        let b = fs.open("f", OpenFlags::empty()).unwrap();
        let c = fs.open("f", OpenFlags::empty()).unwrap();
        assert_eq!((a, b, c), (Fd(0), Fd(1), Fd(2)));
        fs.close(b).unwrap();
        assert_eq!(fs.open("f", OpenFlags::empty()), Ok(Fd(1)));
    }

    #[test]
    fn write_spanning_blocks_reads_back() {
        let mut fs = UserFs::new();
        let fd = fs.open("big", OpenFlags::CREATE).unwrap();
        let payload: Vec<u8> = (0..BLOCK_SIZE * 2 + 100).map(|i| (i % 251) as u8).collect();
        assert_eq!(fs.write(fd, &payload), Ok(payload.len()));
        assert_eq!(fs.size(fd), Ok(payload.len()));

        let rd = fs.open("big", OpenFlags::READ_ONLY).unwrap();
        let mut got = vec![0u8; payload.len() + 10];
        let mut total = 0;
        loop {
            let n = fs.read(rd, &mut got[total..]).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, payload.len());
        assert_eq!(&got[..total], &payload[..]);
    }

    #[test]
    fn size_cap_is_enforced() {
        let mut fs = UserFs::new();
        let fd = fs.open("f", OpenFlags::CREATE).unwrap();
        let oversized = vec![0u8; MAX_FILE_SIZE + 1];
        assert_eq!(fs.write(fd, &oversized), Err(UfsError::NoMem));
        assert_eq!(fs.resize(fd, MAX_FILE_SIZE + 1), Err(UfsError::NoMem));
        // Nothing was written on the failed attempt.
        assert_eq!(fs.size(fd), Ok(0));
    }

    #[test]
    fn resize_shrink_clamps_other_descriptors() {
        let mut fs = UserFs::new();
        let fd = fs.open("f", OpenFlags::CREATE).unwrap();
        fs.write(fd, &[7u8; 100]).unwrap();
        fs.resize(fd, 10).unwrap();
        // Past-the-end cursor lands exactly on the new EOF.
        let mut buf = [0u8; 8];
        assert_eq!(fs.read(fd, &mut buf), Ok(0));
        assert_eq!(fs.size(fd), Ok(10));

        let rd = fs.open("f", OpenFlags::READ_ONLY).unwrap();
        let mut all = [0u8; 64];
        assert_eq!(fs.read(rd, &mut all), Ok(10));
        assert_eq!(&all[..10], &[7u8; 100][..10]);
    }

    #[test]
    fn resize_shrink_across_blocks_then_grow_is_zero_filled() {
        let mut fs = UserFs::new();
        let fd = fs.open("f", OpenFlags::CREATE).unwrap();
        fs.write(fd, &vec![9u8; BLOCK_SIZE + 50]).unwrap();
        fs.resize(fd, 20).unwrap();
        fs.resize(fd, BLOCK_SIZE + 10).unwrap();
        assert_eq!(fs.size(fd), Ok(BLOCK_SIZE + 10));

        let rd = fs.open("f", OpenFlags::READ_ONLY).unwrap();
        let mut all = vec![0xffu8; BLOCK_SIZE + 20];
        let mut total = 0;
        loop {
            let n = fs.read(rd, &mut all[total..]).unwrap();
            if n == 0 {
                break;
            }
            total += n;
        }
        assert_eq!(total, BLOCK_SIZE + 10);
        assert_eq!(&all[..20], &[9u8; 20]);
        assert!(all[20..total].iter().all(|b| *b == 0));
    }

    #[test]
    fn delete_while_open_keeps_descriptors_working() {
        let mut fs = UserFs::new();
        let fd = fs.open("f", OpenFlags::CREATE).unwrap();
        fs.write(fd, b"hello").unwrap();
        fs.delete("f").unwrap();

        assert_eq!(fs.open("f", OpenFlags::READ_ONLY), Err(UfsError::NoFile));
        let mut buf = [0u8; 5];
        let rd = fs.open("f", OpenFlags::CREATE).unwrap();
        // The fresh file shares only the name, not the storage.
        assert_eq!(fs.read(rd, &mut buf), Ok(0));

        // The original descriptor still sees the old contents.
        let back = fs.open("f", OpenFlags::empty());
        assert!(back.is_ok());
        fs.write(fd, b" more").unwrap();
        assert_eq!(fs.size(fd), Ok(10));
        fs.close(fd).unwrap();
    }

    #[test]
    fn independent_cursors_on_one_file() {
        let mut fs = UserFs::new();
        let w = fs.open("f", OpenFlags::CREATE).unwrap();
        fs.write(w, b"hello").unwrap();
        let r1 = fs.open("f", OpenFlags::READ_ONLY).unwrap();
        let r2 = fs.open("f", OpenFlags::READ_ONLY).unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(fs.read(r1, &mut buf), Ok(2));
        assert_eq!(&buf, b"he");
        let mut buf5 = [0u8; 5];
        assert_eq!(fs.read(r2, &mut buf5), Ok(5));
        assert_eq!(&buf5, b"hello");
        assert_eq!(fs.read(r1, &mut buf), Ok(2));
        assert_eq!(&buf, b"ll");
    }
}
