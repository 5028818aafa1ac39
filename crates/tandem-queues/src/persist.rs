use std::{
    marker::PhantomData,
    ops::{Deref, DerefMut},
    path::Path,
};

use shared_memory::{Shmem, ShmemConf, ShmemError};

use crate::error::PersistError;

/// A `T` memory-mapped over a file sized exactly to `size_of::<T>()`.
///
/// Used for PTCP queue buffers and any counters that must survive a crash.
/// Unlike the mmap helper this is grounded on, the mapping isn't leaked:
/// `Drop` `msync`s the region (so a crash mid-teardown still leaves a
/// recoverable file) and then unmaps it.
pub struct MapPod<T> {
    shmem: Shmem,
    _marker: PhantomData<T>,
}

impl<T: Default> MapPod<T> {
    pub fn open_or_create(path: &Path) -> Result<Self, PersistError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PersistError::CreateDir(parent.to_path_buf(), e))?;
        }

        match ShmemConf::new().size(size_of::<T>()).flink(path).create() {
            Ok(shmem) => {
                // SAFETY: shmem.as_ptr() is valid for size_of::<T>() bytes and
                // freshly allocated (zeroed by the OS), so writing a T into it
                // is not overwriting live data.
                unsafe { shmem.as_ptr().cast::<T>().write(T::default()) };
                Ok(Self { shmem, _marker: PhantomData })
            }
            Err(ShmemError::LinkExists) => {
                let shmem = ShmemConf::new().flink(path).open()?;
                Ok(Self { shmem, _marker: PhantomData })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get(&self) -> &T {
        // SAFETY: mapping is sized to T and exclusively owned by this handle.
        unsafe { &*self.shmem.as_ptr().cast::<T>() }
    }

    pub fn get_mut(&mut self) -> &mut T {
        // SAFETY: see `get`; `&mut self` proves exclusive access.
        unsafe { &mut *self.shmem.as_ptr().cast::<T>() }
    }
}

impl<T> Deref for MapPod<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: see `MapPod::get`.
        unsafe { &*self.shmem.as_ptr().cast::<T>() }
    }
}

impl<T> DerefMut for MapPod<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: see `MapPod::get_mut`.
        unsafe { &mut *self.shmem.as_ptr().cast::<T>() }
    }
}

impl<T> Drop for MapPod<T> {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe exactly this mapping's region.
        let code = unsafe {
            libc::msync(self.shmem.as_ptr().cast::<libc::c_void>(), size_of::<T>(), libc::MS_SYNC)
        };
        if code != 0 {
            tracing::warn!(?code, "msync failed while dropping MapPod");
        }
    }
}

// SAFETY: the mapping is exclusively owned by one `MapPod`; `T: Send`/`Sync`
// is sufficient for sharing it across threads the same way an owned `T` would be.
unsafe impl<T: Send> Send for MapPod<T> {}
unsafe impl<T: Sync> Sync for MapPod<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    #[repr(C)]
    struct Counters {
        a: u64,
        b: u64,
    }

    #[test]
    fn create_then_reopen_preserves_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counters.ptcp");

        {
            let mut pod = MapPod::<Counters>::open_or_create(&path).unwrap();
            pod.get_mut().a = 7;
            pod.get_mut().b = 42;
        }

        let pod = MapPod::<Counters>::open_or_create(&path).unwrap();
        assert_eq!(pod.get().a, 7);
        assert_eq!(pod.get().b, 42);
    }
}
