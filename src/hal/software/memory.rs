//! Backing storage for software buffers and images.

use crate::hal::{GpuError, GpuResult};

/// Buffer contents, 8-byte aligned so any record type up to `u64` casts in place
#[derive(Clone, Debug, Default)]
pub struct Memory {
    words: Vec<u64>,
    size: usize,
}

impl Memory {
    pub fn zeroed(size: usize) -> Self {
        Self {
            words: vec![0; size.div_ceil(8)],
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.size]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.size]
    }

    /// Whole records of `T`; a trailing partial record is not visible
    pub fn typed<T: bytemuck::Pod>(&self) -> GpuResult<&[T]> {
        let bytes = self.bytes();
        let whole = bytes.len() / std::mem::size_of::<T>() * std::mem::size_of::<T>();
        bytemuck::try_cast_slice(&bytes[..whole]).map_err(|e| GpuError::Backend(e.to_string()))
    }

    pub fn typed_mut<T: bytemuck::Pod>(&mut self) -> GpuResult<&mut [T]> {
        let bytes = self.bytes_mut();
        let whole = bytes.len() / std::mem::size_of::<T>() * std::mem::size_of::<T>();
        bytemuck::try_cast_slice_mut(&mut bytes[..whole]).map_err(|e| GpuError::Backend(e.to_string()))
    }

    pub fn range(&self, offset: u64, len: u64, name: &str) -> GpuResult<std::ops::Range<usize>> {
        let end = offset.checked_add(len).filter(|&end| end <= self.size as u64);
        match end {
            Some(end) => Ok(offset as usize..end as usize),
            None => Err(GpuError::OutOfBounds {
                resource: name.to_string(),
                offset,
                len,
                size: self.size as u64,
            }),
        }
    }
}

/// RGBA8 pixels, row-major
#[derive(Clone, Debug, Default)]
pub struct ImageMemory {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<[u8; 4]>,
}

impl ImageMemory {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![[0; 4]; width as usize * height as usize],
        }
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len() * 4
    }

    pub fn bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.pixels)
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.pixels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_view_hides_partial_record() {
        let memory = Memory::zeroed(20);
        assert_eq!(memory.typed::<u64>().unwrap().len(), 2);
        assert_eq!(memory.typed::<u32>().unwrap().len(), 5);
        assert_eq!(memory.bytes().len(), 20);
    }

    #[test]
    fn test_range_rejects_overflow() {
        let memory = Memory::zeroed(16);
        assert_eq!(memory.range(4, 8, "b").unwrap(), 4..12);
        assert!(memory.range(12, 8, "b").is_err());
        assert!(memory.range(u64::MAX, 2, "b").is_err());
    }
}
