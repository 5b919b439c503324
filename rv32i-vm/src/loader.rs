//! Binary and ELF loading utilities.

use crate::memory::Memory;
use goblin::elf::header::EM_RISCV;
use goblin::elf::{Elf, program_header::PT_LOAD};
use thiserror::Error;

const ADDRESS_SPACE: u64 = 1 << 32;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("ELF parse error: {0}")]
    Parse(#[from] goblin::error::Error),

    #[error("ELF image is 64-bit; only ELF32 is supported")]
    NotElf32,

    #[error("ELF image is big-endian")]
    BigEndian,

    #[error("ELF machine {0} is not RISC-V")]
    Machine(u16),

    #[error("Segment at file offset {offset:#x} exceeds file bounds")]
    Truncated { offset: u64 },

    #[error("Region {addr:#x}+{size:#x} does not fit in the 32-bit address space")]
    OutOfRange { addr: u64, size: u64 },
}

fn check_range(addr: u64, size: u64) -> Result<u32, LoadError> {
    match addr.checked_add(size) {
        Some(end) if end <= ADDRESS_SPACE => Ok(addr as u32),
        _ => Err(LoadError::OutOfRange { addr, size }),
    }
}

/// A `PT_LOAD` segment whose file bounds and target range have been checked.
struct Segment<'a> {
    base: u32,
    data: &'a [u8],
    /// Bytes past `data` that must read as zero.
    bss: usize,
}

/// Load an ELF32 RISC-V executable and return its entry point.
///
/// Every `PT_LOAD` segment is copied to its physical address (virtual
/// address when `p_paddr` is zero); the tail between `p_filesz` and
/// `p_memsz` is zero-filled. All segments are validated before any of them
/// is copied, so `memory` is untouched when an error is returned.
pub fn load_elf(buffer: &[u8], memory: &mut Memory) -> Result<u32, LoadError> {
    let elf = Elf::parse(buffer)?;
    if elf.is_64 {
        return Err(LoadError::NotElf32);
    }
    if !elf.little_endian {
        return Err(LoadError::BigEndian);
    }
    if elf.header.e_machine != EM_RISCV {
        return Err(LoadError::Machine(elf.header.e_machine));
    }

    let mut segments = Vec::new();
    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
            continue;
        }

        let file_end = ph
            .p_offset
            .checked_add(ph.p_filesz)
            .filter(|end| *end <= buffer.len() as u64)
            .ok_or(LoadError::Truncated {
                offset: ph.p_offset,
            })?;

        let target_addr = if ph.p_paddr != 0 {
            ph.p_paddr
        } else {
            ph.p_vaddr
        };
        let base = check_range(target_addr, ph.p_memsz.max(ph.p_filesz))?;

        segments.push(Segment {
            base,
            data: &buffer[ph.p_offset as usize..file_end as usize],
            bss: ph.p_memsz.saturating_sub(ph.p_filesz) as usize,
        });
    }
    let entry = check_range(elf.entry, 0)?;

    for seg in &segments {
        memory.load(seg.base, seg.data);
        if seg.bss > 0 {
            let bss_start = seg.base.wrapping_add(seg.data.len() as u32);
            memory.zero_range(bss_start, seg.bss);
        }
    }

    log::debug!(
        "ELF loaded: entry=0x{:08x}, segments={}",
        entry,
        segments.len()
    );
    Ok(entry)
}

/// Copy a flat binary to `base`. The entry point is `base`.
pub fn load_raw(buffer: &[u8], base: u32, memory: &mut Memory) -> Result<u32, LoadError> {
    check_range(base as u64, buffer.len() as u64)?;
    memory.load(base, buffer);
    log::debug!("Raw image loaded: base=0x{:08x}, size={}", base, buffer.len());
    Ok(base)
}

/// Load an ELF image if `buffer` carries the ELF magic, otherwise treat it
/// as a flat binary placed at `load_addr`.
pub fn load_image(buffer: &[u8], load_addr: u32, memory: &mut Memory) -> Result<u32, LoadError> {
    if buffer.starts_with(b"\x7FELF") {
        load_elf(buffer, memory)
    } else {
        load_raw(buffer, load_addr, memory)
    }
}
