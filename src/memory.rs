//! Paged guest virtual memory.
//!
//! The address space is a sparse table of 4 KiB pages with per-page
//! read/write/exec attributes. Pages are reference counted and copied
//! on the first write when shared, which makes forked machines cheap
//! and lets anonymous regions be backed by a single shared zero page
//! until they are touched.
//!
//! Everything at or above the heap base is *anonymous*: the heap
//! arena, the mmap arena above it, and the stack at the top of the
//! address space. Reading an unmapped anonymous page yields zeroes
//! without allocating; writing materializes a private zeroed page.
//! Unmapped accesses below the heap base fault.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use crate::address::Address;
use crate::machine::MachineException;

/// Size of one guest page in bytes.
pub const PAGE_SIZE: usize = 4096;
pub(crate) const PAGE_SHIFT: u32 = 12;

const OFFSET_MASK: u64 = (PAGE_SIZE - 1) as u64;

/// Per-page protection bits. The default is the heap/mmap default:
/// readable and writable, not executable.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PageAttributes {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Default for PageAttributes {
    fn default() -> Self {
        PageAttributes {
            read: true,
            write: true,
            exec: false,
        }
    }
}

impl PageAttributes {
    /// Attributes for code pages.
    pub const fn readable_executable() -> Self {
        PageAttributes {
            read: true,
            write: false,
            exec: true,
        }
    }
    /// Decode the low three `PROT_*` bits of an `mprotect`/`mmap`
    /// protection argument.
    pub fn from_prot(prot: i32) -> Self {
        PageAttributes {
            read: prot & 1 != 0,
            write: prot & 2 != 0,
            exec: prot & 4 != 0,
        }
    }
}

#[derive(Clone)]
struct PageData([u8; PAGE_SIZE]);

/// One guest page: attributes plus reference-counted contents.
///
/// A page whose contents are shared (refcount > 1) is cloned by
/// [`Page::data_mut`] before the first write, so writes through one
/// holder are never visible through another.
#[derive(Clone)]
pub struct Page {
    pub attr: PageAttributes,
    data: Arc<PageData>,
}

impl Page {
    fn zeroed(attr: PageAttributes) -> Page {
        Page {
            attr,
            data: Arc::new(PageData([0; PAGE_SIZE])),
        }
    }
    fn sharing(attr: PageAttributes, data: Arc<PageData>) -> Page {
        Page { attr, data }
    }
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.data.0
    }
    /// Mutable view of the contents, performing the copy-on-write
    /// clone if the contents are shared.
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut Arc::make_mut(&mut self.data).0
    }
    /// True while the contents are shared with another holder.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.data) > 1
    }
}

/// A host-side slice referencing a contiguous run of bytes inside one
/// guest page, produced by [`Memory::gather_buffers_from_range`] for
/// zero-copy I/O.
///
/// The pointer is only valid until the next operation that can move or
/// free pages on the owning [`Memory`] (writes, `free_pages`, another
/// gather, dropping the machine). Callers dereference it through the
/// unsafe accessors and must not hold the slices across such calls.
#[derive(Clone, Copy, Debug)]
pub struct VBuffer {
    pub ptr: *mut u8,
    pub len: usize,
}

impl VBuffer {
    pub const NULL: VBuffer = VBuffer {
        ptr: std::ptr::null_mut(),
        len: 0,
    };

    /// # Safety
    /// The owning `Memory` must not have been mutated or dropped since
    /// the gather call that produced this buffer.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.ptr, self.len)
    }
    /// # Safety
    /// As [`VBuffer::as_slice`], and no other reference to the same
    /// page bytes may be live.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr, self.len)
    }
}

/// A value that can be read from or written to guest memory in one
/// little-endian move.
pub trait MemoryValue: Copy {
    const SIZE: usize;
    fn from_le(bytes: &[u8]) -> Self;
    fn to_le(self, out: &mut [u8]);
}

macro_rules! impl_memory_value {
    ($($ty:ty),*) => {
        $(impl MemoryValue for $ty {
            const SIZE: usize = std::mem::size_of::<$ty>();
            fn from_le(bytes: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                buf.copy_from_slice(&bytes[..Self::SIZE]);
                <$ty>::from_le_bytes(buf)
            }
            fn to_le(self, out: &mut [u8]) {
                out[..Self::SIZE].copy_from_slice(&self.to_le_bytes());
            }
        })*
    };
}
impl_memory_value!(u8, u16, u32, u64, u128);

/// The guest address space plus the region bookkeeping the memory
/// system calls operate on: program break, mmap arena pointer, and
/// the initial stack pointer.
#[derive(Clone)]
pub struct Memory<A: Address> {
    pages: HashMap<u64, Page>,
    zero_page: Arc<PageData>,
    max_pages: usize,
    heap_base: A,
    brk: A,
    brk_max: u64,
    mmap_next: A,
    stack_initial: A,
}

impl<A: Address> Memory<A> {
    /// The default ceiling on how far `brk` may move the program
    /// break above the heap base: 16 MiB.
    pub const BRK_MAX: u64 = 16 << 20;

    pub(crate) fn new(memory_max: u64, brk_max: u64, stack_initial: A) -> Memory<A> {
        Memory {
            pages: HashMap::new(),
            zero_page: Arc::new(PageData([0; PAGE_SIZE])),
            max_pages: (memory_max / PAGE_SIZE as u64) as usize,
            heap_base: A::ZERO,
            brk: A::ZERO,
            brk_max,
            mmap_next: A::ZERO,
            stack_initial,
        }
    }

    /// Place the heap arena. Everything at or above `heap_base`
    /// becomes anonymous; the mmap arena begins where the brk arena
    /// ends.
    pub(crate) fn set_heap_region(&mut self, heap_base: A) {
        self.heap_base = heap_base;
        self.brk = heap_base;
        self.mmap_next = A::from_u64(heap_base.to_u64() + self.brk_max);
    }

    /// Copy a flat program image into the address space with the given
    /// attributes.
    pub(crate) fn load_image(
        &mut self,
        base: A,
        image: &[u8],
        attr: PageAttributes,
    ) -> Result<(), MachineException> {
        let base = base.to_u64();
        let mut copied = 0;
        while copied < image.len() {
            let addr = base.wrapping_add(copied as u64);
            let pageno = addr >> PAGE_SHIFT;
            let offset = (addr & OFFSET_MASK) as usize;
            let n = (PAGE_SIZE - offset).min(image.len() - copied);
            if !self.pages.contains_key(&pageno)
                && self.pages.len() >= self.max_pages
            {
                return Err(self.out_of_memory());
            }
            let page = self
                .pages
                .entry(pageno)
                .or_insert_with(|| Page::zeroed(attr));
            page.data_mut()[offset..offset + n]
                .copy_from_slice(&image[copied..copied + n]);
            copied += n;
        }
        Ok(())
    }

    fn out_of_memory(&self) -> MachineException {
        MachineException::OutOfMemory {
            pages: self.pages.len(),
            max: self.max_pages,
        }
    }

    fn is_anonymous(&self, pageno: u64) -> bool {
        pageno >= self.heap_base.to_u64() >> PAGE_SHIFT
    }

    fn page_for_read(
        &self,
        pageno: u64,
        addr: u64,
    ) -> Result<Option<&Page>, MachineException> {
        match self.pages.get(&pageno) {
            Some(page) if page.attr.read => Ok(Some(page)),
            Some(_) => Err(MachineException::ProtectionFault { addr }),
            None if self.is_anonymous(pageno) => Ok(None),
            None => Err(MachineException::ProtectionFault { addr }),
        }
    }

    fn page_for_write(
        &mut self,
        pageno: u64,
        addr: u64,
    ) -> Result<&mut Page, MachineException> {
        let anonymous = self.is_anonymous(pageno);
        let over_budget = self.pages.len() >= self.max_pages;
        let oom = self.out_of_memory();
        let page = match self.pages.entry(pageno) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                if !anonymous {
                    return Err(MachineException::ProtectionFault { addr });
                }
                if over_budget {
                    return Err(oom);
                }
                entry.insert(Page::zeroed(PageAttributes::default()))
            }
        };
        if !page.attr.write {
            return Err(MachineException::ProtectionFault { addr });
        }
        Ok(page)
    }

    /// Read a `T`-sized little-endian value. Unaligned and
    /// page-straddling reads are handled bytewise.
    pub fn read<T: MemoryValue>(&self, addr: A) -> Result<T, MachineException> {
        let mut buf = [0u8; 16];
        self.memcpy_in(&mut buf[..T::SIZE], addr)?;
        Ok(T::from_le(&buf))
    }

    /// Write a `T`-sized little-endian value, copy-on-write included.
    pub fn write<T: MemoryValue>(
        &mut self,
        addr: A,
        value: T,
    ) -> Result<(), MachineException> {
        let mut buf = [0u8; 16];
        value.to_le(&mut buf);
        self.memcpy_out(addr, &buf[..T::SIZE])
    }

    /// Read an address-sized value (e.g. one iovec field).
    pub fn read_address(&self, addr: A) -> Result<A, MachineException> {
        Ok(if A::BYTES == 4 {
            A::from_u32(self.read::<u32>(addr)?)
        } else if A::BYTES == 8 {
            A::from_u64(self.read::<u64>(addr)?)
        } else {
            A::from_u128(self.read::<u128>(addr)?)
        })
    }

    /// Bulk copy guest memory into a host buffer, crossing page
    /// boundaries as needed.
    pub fn memcpy_in(
        &self,
        dst: &mut [u8],
        src: A,
    ) -> Result<(), MachineException> {
        let mut copied = 0;
        while copied < dst.len() {
            let addr = src.to_u64().wrapping_add(copied as u64);
            let pageno = addr >> PAGE_SHIFT;
            let offset = (addr & OFFSET_MASK) as usize;
            let n = (PAGE_SIZE - offset).min(dst.len() - copied);
            match self.page_for_read(pageno, addr)? {
                Some(page) => dst[copied..copied + n]
                    .copy_from_slice(&page.data()[offset..offset + n]),
                None => dst[copied..copied + n].fill(0),
            }
            copied += n;
        }
        Ok(())
    }

    /// Bulk copy a host buffer into guest memory.
    pub fn memcpy_out(
        &mut self,
        dst: A,
        src: &[u8],
    ) -> Result<(), MachineException> {
        let mut copied = 0;
        while copied < src.len() {
            let addr = dst.to_u64().wrapping_add(copied as u64);
            let pageno = addr >> PAGE_SHIFT;
            let offset = (addr & OFFSET_MASK) as usize;
            let n = (PAGE_SIZE - offset).min(src.len() - copied);
            let page = self.page_for_write(pageno, addr)?;
            page.data_mut()[offset..offset + n]
                .copy_from_slice(&src[copied..copied + n]);
            copied += n;
        }
        Ok(())
    }

    /// Read a NUL-terminated guest string of at most `maxlen` bytes.
    /// Stops at the terminator or at `maxlen`, whichever comes first.
    pub fn memcstring(
        &self,
        addr: A,
        maxlen: usize,
    ) -> Result<String, MachineException> {
        let mut bytes = Vec::new();
        let mut scanned = 0;
        'pages: while scanned < maxlen {
            let a = addr.to_u64().wrapping_add(scanned as u64);
            let pageno = a >> PAGE_SHIFT;
            let offset = (a & OFFSET_MASK) as usize;
            let n = (PAGE_SIZE - offset).min(maxlen - scanned);
            match self.page_for_read(pageno, a)? {
                Some(page) => {
                    let chunk = &page.data()[offset..offset + n];
                    match chunk.iter().position(|&b| b == 0) {
                        Some(end) => {
                            bytes.extend_from_slice(&chunk[..end]);
                            break 'pages;
                        }
                        None => bytes.extend_from_slice(chunk),
                    }
                }
                // Lazy anonymous page: all zeroes, so the string ends.
                None => break 'pages,
            }
            scanned += n;
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Fetch one 16-bit instruction parcel. The page must be present
    /// and executable; lazily zero-filled pages are not executable
    /// fetch targets.
    pub fn exec_read_u16(&self, addr: A) -> Result<u16, MachineException> {
        let a = addr.to_u64();
        let pageno = a >> PAGE_SHIFT;
        let offset = (a & OFFSET_MASK) as usize;
        match self.pages.get(&pageno) {
            Some(page) if page.attr.exec => {
                let data = page.data();
                Ok(u16::from_le_bytes([data[offset], data[offset + 1]]))
            }
            _ => Err(MachineException::ExecutionSpaceProtectionFault { pc: a }),
        }
    }

    /// Resolve a guest range into at most `out.len()` host slices,
    /// ordered by increasing guest address. Anonymous pages are
    /// materialized and shared pages un-shared so the slices are safe
    /// to write through. Returns 0 if any page in the covered prefix
    /// is unmapped or unreadable.
    pub fn gather_buffers_from_range(
        &mut self,
        out: &mut [VBuffer],
        addr: A,
        len: usize,
    ) -> Result<usize, MachineException> {
        let mut cnt = 0;
        let mut done = 0;
        while done < len && cnt < out.len() {
            let a = addr.to_u64().wrapping_add(done as u64);
            let pageno = a >> PAGE_SHIFT;
            let offset = (a & OFFSET_MASK) as usize;
            let n = (PAGE_SIZE - offset).min(len - done);

            let anonymous = self.is_anonymous(pageno);
            let over_budget = self.pages.len() >= self.max_pages;
            let oom = self.out_of_memory();
            let page = match self.pages.entry(pageno) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    if !anonymous {
                        return Ok(0);
                    }
                    if over_budget {
                        return Err(oom);
                    }
                    entry.insert(Page::zeroed(PageAttributes::default()))
                }
            };
            if !page.attr.read {
                return Ok(0);
            }
            let data = page.data_mut();
            out[cnt] = VBuffer {
                ptr: data[offset..].as_mut_ptr(),
                len: n,
            };
            cnt += 1;
            done += n;
        }
        Ok(cnt)
    }

    /// Apply attributes to every page intersecting the range,
    /// allocating missing pages against the shared zero page.
    pub fn set_page_attr(
        &mut self,
        addr: A,
        len: u64,
        attr: PageAttributes,
    ) -> Result<(), MachineException> {
        if len == 0 {
            return Ok(());
        }
        let first = addr.to_u64() >> PAGE_SHIFT;
        let last = addr.to_u64().wrapping_add(len - 1) >> PAGE_SHIFT;
        for pageno in first..=last {
            let over_budget = self.pages.len() >= self.max_pages;
            let oom = self.out_of_memory();
            let zero = self.zero_page.clone();
            match self.pages.entry(pageno) {
                Entry::Occupied(mut entry) => entry.get_mut().attr = attr,
                Entry::Vacant(entry) => {
                    if over_budget {
                        return Err(oom);
                    }
                    entry.insert(Page::sharing(attr, zero));
                }
            }
        }
        Ok(())
    }

    /// Release every page intersecting the range. Later accesses fault
    /// unless the range is anonymous (in which case they see zeroes
    /// again).
    pub fn free_pages(&mut self, addr: A, len: u64) {
        if len == 0 {
            return;
        }
        let first = addr.to_u64() >> PAGE_SHIFT;
        let last = addr.to_u64().wrapping_add(len - 1) >> PAGE_SHIFT;
        for pageno in first..=last {
            self.pages.remove(&pageno);
        }
    }

    /// Base of the heap arena.
    pub fn heap_address(&self) -> A {
        self.heap_base
    }

    /// Move the program break. A zero argument queries the current
    /// break; anything else is clamped to the arena and stored.
    pub fn brk(&mut self, new_end: A) -> A {
        if new_end == A::ZERO {
            return self.brk;
        }
        let base = self.heap_base.to_u64();
        let end = new_end.to_u64().clamp(base, base + self.brk_max);
        self.brk = A::from_u64(end);
        self.brk
    }

    /// Ceiling on the program break, relative to the heap base.
    pub fn brk_max(&self) -> u64 {
        self.brk_max
    }

    /// The next free address in the mmap arena. Mutable so the mman
    /// system calls can advance and retract it.
    pub fn mmap_address(&mut self) -> &mut A {
        &mut self.mmap_next
    }

    /// Initial stack pointer handed to freshly constructed machines.
    pub fn stack_initial(&self) -> A {
        self.stack_initial
    }

    /// Number of pages currently materialized.
    pub fn pages_active(&self) -> usize {
        self.pages.len()
    }

    /// A copy-on-write duplicate of this address space. Pages are
    /// shared until either side writes to them.
    pub fn fork(&self) -> Memory<A> {
        self.clone()
    }
}
