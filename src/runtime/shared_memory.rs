//! Typed memory block shared by an owner and its workers.
//!
//! The block is a memory-mapped temp file. The owner creates it and hands
//! its [`SharedMemoryDescriptor`] to workers, which map the same file. Reads
//! and writes are not synchronized: callers that write while others read
//! must coordinate among themselves.

use std::fs::OpenOptions;
use std::mem::size_of;
use std::path::PathBuf;

use memmap2::MmapMut;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::runtime::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElementKind {
    F32,
    F64,
    I32,
    I64,
}

impl ElementKind {
    pub fn size(self) -> usize {
        match self {
            ElementKind::F32 | ElementKind::I32 => 4,
            ElementKind::F64 | ElementKind::I64 => 8,
        }
    }
}

/// Plain numeric element that can live in a shared block.
pub trait Element: Copy + Send + Sync + 'static {
    const KIND: ElementKind;
}

impl Element for f32 {
    const KIND: ElementKind = ElementKind::F32;
}

impl Element for f64 {
    const KIND: ElementKind = ElementKind::F64;
}

impl Element for i32 {
    const KIND: ElementKind = ElementKind::I32;
}

impl Element for i64 {
    const KIND: ElementKind = ElementKind::I64;
}

/// Everything a worker needs to map a block someone else created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMemoryDescriptor {
    pub path: PathBuf,
    pub kind: ElementKind,
    pub len: usize,
}

pub struct SharedMemory {
    map: MmapMut,
    descriptor: SharedMemoryDescriptor,
    // Only the creator holds the file; dropping it unlinks the path. Existing
    // mappings stay valid.
    _owner: Option<NamedTempFile>,
}

impl std::fmt::Debug for SharedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedMemory")
            .field("descriptor", &self.descriptor)
            .field("owner", &self._owner.is_some())
            .finish()
    }
}

impl SharedMemory {
    /// Allocate a zeroed block of `len` elements of `T`.
    pub fn create<T: Element>(len: usize) -> Result<Self, Error> {
        let bytes = byte_len(len, size_of::<T>())?;
        let file = NamedTempFile::new()?;
        file.as_file().set_len(bytes as u64)?;
        // SAFETY: the file was just created by us and is sized to the mapping.
        let map = unsafe { MmapMut::map_mut(file.as_file())? };

        let descriptor = SharedMemoryDescriptor {
            path: file.path().to_path_buf(),
            kind: T::KIND,
            len,
        };
        debug!(path = %descriptor.path.display(), kind = ?T::KIND, len, "allocated shared memory");

        Ok(Self {
            map,
            descriptor,
            _owner: Some(file),
        })
    }

    /// Map a block created elsewhere. The creator must still be alive.
    pub fn open(descriptor: &SharedMemoryDescriptor) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&descriptor.path)?;
        // SAFETY: the mapping is shared with other processes by design;
        // concurrent access is the caller's responsibility.
        let map = unsafe { MmapMut::map_mut(&file)? };
        let expected = byte_len(descriptor.len, descriptor.kind.size())?;
        if map.len() < expected {
            return Err(Error::OutOfBounds {
                start: 0,
                end: descriptor.len,
                len: map.len() / descriptor.kind.size(),
            });
        }

        Ok(Self {
            map,
            descriptor: descriptor.clone(),
            _owner: None,
        })
    }

    pub fn descriptor(&self) -> &SharedMemoryDescriptor {
        &self.descriptor
    }

    pub fn len(&self) -> usize {
        self.descriptor.len
    }

    pub fn is_empty(&self) -> bool {
        self.descriptor.len == 0
    }

    pub fn as_slice<T: Element>(&self) -> Result<&[T], Error> {
        self.check_kind::<T>()?;
        if self.descriptor.len == 0 {
            return Ok(&[]);
        }
        // SAFETY: the mapping is page aligned, sized for `len` elements of
        // the checked kind, and every bit pattern is a valid `T`.
        Ok(unsafe { std::slice::from_raw_parts(self.map.as_ptr() as *const T, self.descriptor.len) })
    }

    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T], Error> {
        self.check_kind::<T>()?;
        if self.descriptor.len == 0 {
            return Ok(&mut []);
        }
        // SAFETY: as in `as_slice`, and `&mut self` excludes other borrows of
        // this mapping.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.map.as_mut_ptr() as *mut T, self.descriptor.len) })
    }

    /// Copy `data` into the block starting at element 0.
    pub fn fill<T: Element>(&mut self, data: &[T]) -> Result<(), Error> {
        let len = self.descriptor.len;
        let dest = self.as_mut_slice::<T>()?;
        if data.len() > len {
            return Err(Error::OutOfBounds {
                start: 0,
                end: data.len(),
                len,
            });
        }
        dest[..data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn get<T: Element>(&self, index: usize, size: usize) -> Result<&[T], Error> {
        let all = self.as_slice::<T>()?;
        let end = index.checked_add(size).filter(|&end| end <= all.len()).ok_or(Error::OutOfBounds {
            start: index,
            end: index.saturating_add(size),
            len: all.len(),
        })?;
        Ok(&all[index..end])
    }

    /// A window of `size` elements at a uniformly chosen start. Returns the
    /// start index with the window.
    pub fn get_random<T: Element, R: Rng + ?Sized>(&self, rng: &mut R, size: usize) -> Result<(usize, &[T]), Error> {
        let len = self.descriptor.len;
        if size > len {
            return Err(Error::OutOfBounds {
                start: 0,
                end: size,
                len,
            });
        }
        let index = rng.gen_range(0..=len - size);
        Ok((index, self.get(index, size)?))
    }

    fn check_kind<T: Element>(&self) -> Result<(), Error> {
        if T::KIND != self.descriptor.kind {
            return Err(Error::ElementKind {
                actual: self.descriptor.kind,
                requested: T::KIND,
            });
        }
        Ok(())
    }
}

fn byte_len(len: usize, element_size: usize) -> Result<usize, Error> {
    len.checked_mul(element_size)
        .filter(|&bytes| bytes <= isize::MAX as usize)
        .ok_or(Error::TooLarge { len, element_size })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn writes_are_visible_through_a_second_mapping() {
        let mut owner = SharedMemory::create::<f64>(16).unwrap();
        let mut worker = SharedMemory::open(owner.descriptor()).unwrap();

        owner.fill(&[1.0f64, 2.0, 3.0]).unwrap();
        assert_eq!(worker.get::<f64>(0, 3).unwrap(), &[1.0, 2.0, 3.0]);

        worker.as_mut_slice::<f64>().unwrap()[15] = 7.5;
        assert_eq!(owner.get::<f64>(15, 1).unwrap(), &[7.5]);
    }

    #[test]
    fn oversized_blocks_are_refused_before_touching_disk() {
        let err = SharedMemory::create::<f64>(usize::MAX).unwrap_err();
        assert!(matches!(err, Error::TooLarge { len: usize::MAX, element_size: 8 }));
        assert!(matches!(
            SharedMemory::create::<f32>(usize::MAX / 2),
            Err(Error::TooLarge { .. })
        ));
    }

    #[test]
    fn element_kind_is_enforced() {
        let block = SharedMemory::create::<i32>(4).unwrap();
        assert!(matches!(block.as_slice::<f32>(), Err(Error::ElementKind { .. })));
        assert_eq!(block.as_slice::<i32>().unwrap(), &[0, 0, 0, 0]);
    }

    #[test]
    fn reads_are_bounds_checked() {
        let mut block = SharedMemory::create::<i64>(4).unwrap();
        assert!(block.get::<i64>(3, 2).is_err());
        assert!(block.get::<i64>(usize::MAX, 2).is_err());
        assert!(block.fill(&[0i64; 5]).is_err());
    }

    #[test]
    fn random_window_stays_in_range() {
        let mut block = SharedMemory::create::<f32>(10).unwrap();
        let data: Vec<f32> = (0..10).map(|i| i as f32).collect();
        block.fill(&data).unwrap();

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..50 {
            let (start, window) = block.get_random::<f32, _>(&mut rng, 4).unwrap();
            assert!(start <= 6);
            assert_eq!(window[0], start as f32);
        }
        assert!(block.get_random::<f32, _>(&mut rng, 11).is_err());
    }
}
