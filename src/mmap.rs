#[cfg(windows)]
pub mod _win {
    use core::ptr::null_mut;
    use winapi::um::{
        memoryapi::{VirtualAlloc, VirtualFree},
        winnt::{MEM_COMMIT, MEM_DECOMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS, PAGE_READWRITE},
    };

    /// A reserved address range. Pages are inaccessible until committed.
    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn uninit() -> Self {
            Self {
                start: null_mut(),
                end: null_mut(),
                size: 0,
            }
        }

        /// Reserves `size` bytes of address space. Returns an uninitialized
        /// mapping on failure; callers check [`Mmap::is_reserved`].
        pub fn reserve(size: usize) -> Self {
            unsafe {
                let mem = VirtualAlloc(null_mut(), size, MEM_RESERVE, PAGE_NOACCESS) as *mut u8;
                if mem.is_null() {
                    return Self::uninit();
                }
                Self {
                    start: mem,
                    end: mem.add(size),
                    size,
                }
            }
        }

        pub fn is_reserved(&self) -> bool {
            !self.start.is_null()
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }
        pub const fn size(&self) -> usize {
            self.size
        }

        pub fn commit(&self, page: *mut u8, size: usize) -> bool {
            unsafe { !VirtualAlloc(page.cast(), size, MEM_COMMIT, PAGE_READWRITE).is_null() }
        }

        pub fn decommit(&self, page: *mut u8, size: usize) {
            unsafe {
                VirtualFree(page.cast(), size, MEM_DECOMMIT);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            if !self.start.is_null() {
                unsafe {
                    VirtualFree(self.start.cast(), 0, MEM_RELEASE);
                }
            }
        }
    }
}

#[cfg(unix)]
pub mod _unix {
    use std::ptr::null_mut;

    /// A reserved address range. Pages are inaccessible until committed.
    pub struct Mmap {
        start: *mut u8,
        end: *mut u8,
        size: usize,
    }

    impl Mmap {
        pub const fn uninit() -> Self {
            Self {
                start: null_mut(),
                end: null_mut(),
                size: 0,
            }
        }

        /// Reserves `size` bytes of address space. Returns an uninitialized
        /// mapping on failure; callers check [`Mmap::is_reserved`].
        pub fn reserve(size: usize) -> Self {
            unsafe {
                let map = libc::mmap(
                    null_mut(),
                    size as _,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE,
                    -1,
                    0,
                );
                if map == libc::MAP_FAILED {
                    return Self::uninit();
                }
                Self {
                    start: map as *mut u8,
                    end: (map as usize + size) as *mut u8,
                    size,
                }
            }
        }

        pub fn is_reserved(&self) -> bool {
            !self.start.is_null()
        }

        pub fn start(&self) -> *mut u8 {
            self.start
        }
        pub fn end(&self) -> *mut u8 {
            self.end
        }
        pub const fn size(&self) -> usize {
            self.size
        }

        /// Makes `[page, page + size)` readable and writable. Committed pages
        /// are zero-filled by the OS.
        pub fn commit(&self, page: *mut u8, size: usize) -> bool {
            unsafe { libc::mprotect(page as *mut _, size as _, libc::PROT_READ | libc::PROT_WRITE) == 0 }
        }

        pub fn decommit(&self, page: *mut u8, size: usize) {
            unsafe {
                libc::madvise(page as *mut _, size as _, libc::MADV_DONTNEED);
                libc::mprotect(page as *mut _, size as _, libc::PROT_NONE);
            }
        }
    }

    impl Drop for Mmap {
        fn drop(&mut self) {
            if !self.start.is_null() {
                unsafe {
                    libc::munmap(self.start as *mut _, self.size as _);
                }
            }
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
#[cfg(windows)]
pub use _win::*;

unsafe impl Send for Mmap {}
