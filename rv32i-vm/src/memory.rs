use std::collections::BTreeMap;
use thiserror::Error;

/// Allocation granularity of the guest address space.
pub const PAGE_SIZE: usize = 4096;

/// Mask selecting the page base of an address.
pub const PAGE_MASK: u32 = !(PAGE_SIZE as u32 - 1);

/// Mask selecting the offset of the containing aligned word within a page.
const WORD_IN_PAGE_MASK: u32 = (PAGE_SIZE as u32 - 1) & !0x3;

type Page = Box<[u8; PAGE_SIZE]>;

/// Errors raised when installing raw pages (snapshot restore).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Page base {0:#010x} is not 4 KiB aligned")]
    MisalignedPage(u32),

    #[error("Page at {base:#010x} has {len} bytes, expected {}", PAGE_SIZE)]
    PageSize { base: u32, len: usize },
}

/// Word-granular view of guest memory used by the execution engine.
///
/// Both methods operate on the aligned word containing `addr`; sub-word
/// lanes are extracted and merged by the caller.
pub trait Bus {
    fn read32(&self, addr: u32) -> u32;
    fn write32(&mut self, addr: u32, val: u32);
}

/// Sparse 32-bit address space made of demand-allocated 4 KiB pages.
///
/// Pages are created on the first write that touches them. Reads of a page
/// that was never written return zero without allocating anything, so the
/// observable contents are identical to an eagerly zero-filled space.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Memory {
    pages: BTreeMap<u32, Page>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    fn split(addr: u32) -> (u32, usize) {
        (addr & PAGE_MASK, (addr & WORD_IN_PAGE_MASK) as usize)
    }

    fn page_mut(&mut self, base: u32) -> &mut Page {
        self.pages
            .entry(base)
            .or_insert_with(|| Box::new([0; PAGE_SIZE]))
    }

    /// Read the little-endian word containing `addr`.
    #[inline]
    pub fn read_word(&self, addr: u32) -> u32 {
        let (base, off) = Self::split(addr);
        match self.pages.get(&base) {
            Some(page) => {
                u32::from_le_bytes([page[off], page[off + 1], page[off + 2], page[off + 3]])
            }
            None => 0,
        }
    }

    /// Write `value` little-endian into the word containing `addr`.
    #[inline]
    pub fn write_word(&mut self, addr: u32, value: u32) {
        let (base, off) = Self::split(addr);
        self.page_mut(base)[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_byte(&self, addr: u32) -> u8 {
        self.pages
            .get(&(addr & PAGE_MASK))
            .map_or(0, |page| page[(addr & !PAGE_MASK) as usize])
    }

    pub fn write_byte(&mut self, addr: u32, value: u8) {
        self.page_mut(addr & PAGE_MASK)[(addr & !PAGE_MASK) as usize] = value;
    }

    /// Copy `data` into memory starting at `addr`, wrapping at the top of
    /// the address space. Used by program loaders.
    pub fn load(&mut self, addr: u32, data: &[u8]) {
        let mut cursor = addr;
        let mut rest = data;
        while !rest.is_empty() {
            let off = (cursor & !PAGE_MASK) as usize;
            let chunk = rest.len().min(PAGE_SIZE - off);
            self.page_mut(cursor & PAGE_MASK)[off..off + chunk].copy_from_slice(&rest[..chunk]);
            rest = &rest[chunk..];
            cursor = cursor.wrapping_add(chunk as u32);
        }
    }

    /// Zero `len` bytes starting at `addr`. Pages that were never allocated
    /// already read as zero and are left untouched.
    pub fn zero_range(&mut self, addr: u32, len: usize) {
        let mut cursor = addr;
        let mut remaining = len;
        while remaining > 0 {
            let off = (cursor & !PAGE_MASK) as usize;
            let chunk = remaining.min(PAGE_SIZE - off);
            if let Some(page) = self.pages.get_mut(&(cursor & PAGE_MASK)) {
                page[off..off + chunk].fill(0);
            }
            remaining -= chunk;
            cursor = cursor.wrapping_add(chunk as u32);
        }
    }

    pub fn read_bytes(&self, addr: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.read_byte(addr.wrapping_add(i as u32)))
            .collect()
    }

    /// Number of pages currently backed by storage.
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn is_allocated(&self, addr: u32) -> bool {
        self.pages.contains_key(&(addr & PAGE_MASK))
    }

    /// Allocated pages in ascending address order.
    pub fn pages(&self) -> impl Iterator<Item = (u32, &[u8; PAGE_SIZE])> {
        self.pages.iter().map(|(&base, page)| (base, &**page))
    }

    /// Install a full page image, replacing any existing contents.
    pub fn insert_page(&mut self, base: u32, data: &[u8]) -> Result<(), MemoryError> {
        if base & !PAGE_MASK != 0 {
            return Err(MemoryError::MisalignedPage(base));
        }
        let page: [u8; PAGE_SIZE] = data.try_into().map_err(|_| MemoryError::PageSize {
            base,
            len: data.len(),
        })?;
        self.pages.insert(base, Box::new(page));
        Ok(())
    }

    /// Drop every page, returning memory to its all-zero initial state.
    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

impl Bus for Memory {
    #[inline(always)]
    fn read32(&self, addr: u32) -> u32 {
        self.read_word(addr)
    }

    #[inline(always)]
    fn write32(&mut self, addr: u32, val: u32) {
        self.write_word(addr, val)
    }
}
