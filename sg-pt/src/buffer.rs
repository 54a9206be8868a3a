//! Page aligned data transfer buffers

use std::alloc::Layout;
use std::ptr::NonNull;

use anyhow::{bail, Error};

/// Zero initialized, page aligned buffer
///
/// Direct IO (dio, O_DIRECT) needs page alignment, so every data
/// transfer buffer of the copy engine is allocated through this type.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    len: usize,
}

// Plain heap memory, owned exclusively.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

pub fn page_size() -> usize {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        size if size > 0 => size as usize,
        _ => 4096,
    }
}

impl AlignedBuffer {
    pub fn new(len: usize) -> Result<Self, Error> {
        // zero sized allocations are not allowed, keep at least one page
        let layout = Layout::from_size_align(len.max(1), page_size())?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => bail!("alloc of {} byte transfer buffer failed", len),
        };
        Ok(Self { ptr, layout, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Address as stored in the v4 header
    pub fn addr(&self) -> u64 {
        self.ptr.as_ptr() as usize as u64
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn aligned_and_zeroed() -> Result<(), Error> {
        let mut buffer = AlignedBuffer::new(3 * 512)?;
        assert_eq!(buffer.as_ptr() as usize % page_size(), 0);
        assert_eq!(buffer.len(), 1536);
        assert!(buffer.as_slice().iter().all(|b| *b == 0));
        buffer.as_mut_slice()[1535] = 7;
        assert_eq!(buffer.as_slice()[1535], 7);

        let empty = AlignedBuffer::new(0)?;
        assert!(empty.is_empty());
        Ok(())
    }
}
