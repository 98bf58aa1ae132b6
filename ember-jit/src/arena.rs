//! The executable code arena.
//!
//! One mmap'd region holds everything the engine ever generates: the fixed
//! dispatcher stub at the base, then blocks appended at the write cursor.
//! Regions are never individually freed; invalidation overwrites in place and
//! `clear` rewinds the cursor past the stub.
//!
//! All raw-pointer unsafety in the crate is confined to this module. Code is
//! only mutated inside a write scope (W^X: the region is writable or
//! executable, never both) or through a registered [PatchSite], which is
//! replaced atomically by size.

use std::io;
use std::ptr;

#[derive(Debug)]
pub enum CodeError {
    /// The host refused to grant memory for the arena.
    OutOfCodeSpace(io::Error),
    /// The reserved region has no room for the requested bytes.
    CodeSpaceExhausted { needed: usize, remaining: usize },
}

impl std::fmt::Display for CodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodeError::OutOfCodeSpace(err) => write!(f, "failed to reserve code space: {err}"),
            CodeError::CodeSpaceExhausted { needed, remaining } => {
                write!(f, "code space exhausted: needed {needed} bytes, {remaining} remaining")
            }
        }
    }
}

impl std::error::Error for CodeError {}

/// A registered patchable byte range. The only way to modify finalized code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchSite {
    offset: u32,
    len: u32,
}

impl PatchSite {
    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }
}

pub struct CodeArena {
    base: *mut u8,
    size: usize,
    cursor: usize,
    /// Displacement from the writable alias of an offset to its executable
    /// alias. Zero on hosts where both views share one mapping.
    exec_displacement: isize,
    trap_byte: u8,
    write_scope_open: bool,
}

// The arena owns its mapping exclusively; cross-thread mutation is serialized
// by the engine's writer boundary.
unsafe impl Send for CodeArena {}

fn page_size() -> usize {
    // Safety: sysconf has no preconditions.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

impl CodeArena {
    /// Reserves `size` bytes (rounded up to the page size) of memory that can
    /// be made executable, fills them with `trap_byte` and leaves the region
    /// executable.
    pub fn reserve(size: usize, trap_byte: u8) -> Result<Self, CodeError> {
        let page = page_size();
        let size = size.checked_add(page - 1).ok_or(CodeError::CodeSpaceExhausted {
            needed: size,
            remaining: 0,
        })? & !(page - 1);

        // Safety: anonymous private mapping, no file backing.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(CodeError::OutOfCodeSpace(io::Error::last_os_error()));
        }

        let mut arena = Self {
            base: base as *mut u8,
            size,
            cursor: 0,
            exec_displacement: 0,
            trap_byte,
            write_scope_open: false,
        };

        // Safety: the whole region is mapped and currently writable.
        unsafe { ptr::write_bytes(arena.base, trap_byte, size) };
        arena.protect_exec().map_err(CodeError::OutOfCodeSpace)?;

        tracing::debug!("reserved {size:#x} byte code arena at {:p}", arena.base);
        Ok(arena)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.size - self.cursor
    }

    #[inline]
    pub fn trap_byte(&self) -> u8 {
        self.trap_byte
    }

    /// The executable alias of `offset`. Pure and branch-free.
    #[inline]
    pub fn exec_ptr(&self, offset: usize) -> *const u8 {
        debug_assert!(offset <= self.size);
        // Safety: offset is within the mapping.
        unsafe { self.base.add(offset).offset(self.exec_displacement) as *const u8 }
    }

    /// The writable alias of `offset`. Pure and branch-free.
    #[inline]
    pub fn write_ptr(&self, offset: usize) -> *const u8 {
        debug_assert!(offset <= self.size);
        unsafe { self.base.add(offset) as *const u8 }
    }

    /// Byte view of the whole executable region, for backends that walk
    /// generated code.
    #[inline]
    pub fn exec_slice(&self) -> &[u8] {
        // Safety: the mapping is readable in both protection states and the
        // returned borrow prevents concurrent mutation through `&mut self`.
        unsafe { std::slice::from_raw_parts(self.exec_ptr(0), self.size) }
    }

    fn protect(&self, prot: libc::c_int) -> io::Result<()> {
        // Safety: base/size describe our own mapping.
        let ret = unsafe { libc::mprotect(self.base as *mut libc::c_void, self.size, prot) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn protect_exec(&self) -> io::Result<()> {
        self.protect(libc::PROT_READ | libc::PROT_EXEC)
    }

    fn protect_write(&self) -> io::Result<()> {
        self.protect(libc::PROT_READ | libc::PROT_WRITE)
    }

    /// Opens a write scope around a sequence of code emission.
    ///
    /// Write scopes must not nest; the exclusive borrow enforces this
    /// statically, and the flag catches misuse through raw pointers.
    /// Addresses handed out inside the scope must not be executed until the
    /// scope drops.
    pub fn begin_write(&mut self) -> ArenaWriter<'_> {
        assert!(!self.write_scope_open, "nested code arena write scope");
        if let Err(err) = self.protect_write() {
            panic!("failed to make code arena writable: {err}");
        }
        self.write_scope_open = true;
        ArenaWriter { arena: self }
    }

    /// Atomically replaces the contents of a registered patch site.
    ///
    /// Runs under its own short write scope; call only from the writer
    /// serialization boundary.
    pub fn patch(&mut self, site: PatchSite, bytes: &[u8]) {
        assert_eq!(
            bytes.len(),
            site.len as usize,
            "patch size mismatch at offset {:#x}",
            site.offset
        );
        assert!((site.offset + site.len) as usize <= self.cursor, "patch site out of range");

        let mut writer = self.begin_write();
        // Safety: the site was validated against the emitted range.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                writer.arena.base.add(site.offset as usize),
                bytes.len(),
            );
        }
        drop(writer);
    }

    /// Rewinds the cursor to `offset` and re-poisons everything past it.
    /// Used when abandoning a partially emitted block and on full clears.
    pub fn rewind(&mut self, offset: usize) {
        assert!(offset <= self.cursor, "rewind past the write cursor");
        let mut writer = self.begin_write();
        writer.arena.cursor = offset;
        writer.poison_from(offset);
        drop(writer);
    }
}

impl Drop for CodeArena {
    fn drop(&mut self) {
        if !self.base.is_null() {
            // Safety: unmapping our own mapping; no generated code can run
            // after the arena is gone because all entry offsets are owned by
            // the engine that owns the arena.
            unsafe { libc::munmap(self.base as *mut libc::c_void, self.size) };
        }
    }
}

/// Scoped handle for appending code. Dropping it flips the region back to
/// executable.
pub struct ArenaWriter<'a> {
    arena: &'a mut CodeArena,
}

impl ArenaWriter<'_> {
    #[inline]
    pub fn offset(&self) -> usize {
        self.arena.cursor
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.arena.remaining()
    }

    pub fn emit_bytes(&mut self, bytes: &[u8]) -> Result<(), CodeError> {
        if bytes.len() > self.arena.remaining() {
            return Err(CodeError::CodeSpaceExhausted {
                needed: bytes.len(),
                remaining: self.arena.remaining(),
            });
        }
        // Safety: bounds checked above; region is writable inside the scope.
        unsafe {
            ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.arena.base.add(self.arena.cursor),
                bytes.len(),
            );
        }
        self.arena.cursor += bytes.len();
        Ok(())
    }

    pub fn emit_u8(&mut self, value: u8) -> Result<(), CodeError> {
        self.emit_bytes(&[value])
    }

    pub fn emit_u32(&mut self, value: u32) -> Result<(), CodeError> {
        self.emit_bytes(&value.to_le_bytes())
    }

    pub fn emit_u64(&mut self, value: u64) -> Result<(), CodeError> {
        self.emit_bytes(&value.to_le_bytes())
    }

    /// Back-patches a u64 emitted earlier in this scope (branch labels).
    pub fn patch_u64(&mut self, offset: usize, value: u64) {
        assert!(offset + 8 <= self.arena.cursor, "label patch out of range");
        // Safety: bounds checked; writable inside the scope.
        unsafe {
            ptr::copy_nonoverlapping(
                value.to_le_bytes().as_ptr(),
                self.arena.base.add(offset),
                8,
            );
        }
    }

    /// Registers a patchable site over already-emitted bytes.
    pub fn register_patch_site(&self, offset: usize, len: usize) -> PatchSite {
        assert!(offset + len <= self.arena.cursor, "patch site outside emitted code");
        PatchSite { offset: offset as u32, len: len as u32 }
    }

    /// Fills everything from `offset` to the end of the region with the trap
    /// byte so stale bytes can never execute silently.
    pub fn poison_from(&mut self, offset: usize) {
        assert!(offset <= self.arena.size);
        // Safety: in-bounds fill of our own writable mapping.
        unsafe {
            ptr::write_bytes(
                self.arena.base.add(offset),
                self.arena.trap_byte,
                self.arena.size - offset,
            );
        }
    }
}

impl Drop for ArenaWriter<'_> {
    fn drop(&mut self) {
        self.arena.write_scope_open = false;
        if let Err(err) = self.arena.protect_exec() {
            // Failing to restore execute permission would make every block
            // entry fault; there is no way to continue from here.
            panic!("failed to restore code arena protection: {err}");
        }
    }
}
