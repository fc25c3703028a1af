use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::slice;

/// Cursor over a memory-mapped checkpoint file.
///
/// Weight tensors are handed out as borrowed `&[f32]` views into the map, so
/// loading stays lazy: pages are faulted in by the OS on first touch.
#[derive(Debug)]
pub(crate) struct MemoryMapper {
    mmap: Mmap,
    offset: usize,
}

impl MemoryMapper {
    pub fn new(file: File) -> Result<Self> {
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .map(&file)
                .context("Failed to create memory mapping")?
        };
        Ok(Self { mmap, offset: 0 })
    }

    /// Returns the next `count` packed little-endian f32 values as a slice.
    pub fn get_f32_slice(&mut self, count: usize) -> Result<&[f32]> {
        let bytes_needed = count * std::mem::size_of::<f32>();
        let bytes = self.get_bytes(bytes_needed)?;

        // SAFETY: the slice has exactly `count * 4` bytes and f32 tolerates
        // the mmap's page alignment. The checkpoint stores packed IEEE-754
        // little-endian floats, which is also the host representation on
        // every platform this targets.
        let floats = unsafe { slice::from_raw_parts(bytes.as_ptr() as *const f32, count) };
        Ok(floats)
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&[u8]> {
        if self.offset + count > self.mmap.len() {
            anyhow::bail!(
                "Insufficient data: need {} bytes, have {} remaining",
                count,
                self.mmap.len() - self.offset
            );
        }
        let result = &self.mmap[self.offset..self.offset + count];
        self.offset += count;
        Ok(result)
    }

    pub fn skip(&mut self, bytes: usize) -> Result<()> {
        if self.offset + bytes > self.mmap.len() {
            anyhow::bail!(
                "Cannot skip {} bytes: only {} remaining",
                bytes,
                self.mmap.len() - self.offset
            );
        }
        self.offset += bytes;
        Ok(())
    }

    /// Bytes left after the cursor. Used to reject trailing garbage.
    pub fn remaining(&self) -> usize {
        self.mmap.len() - self.offset
    }
}
