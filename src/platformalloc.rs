// Abstract over system virtual memory functions

use std::ptr::NonNull;

use crate::error::ReserveFailed;

/// A page-aligned block of memory reserved from the operating system. Unmapped on drop.
#[derive(Debug)]
pub struct Reservation {
    base: NonNull<u8>,
    len: usize,
}

// The reservation is only raw bytes; who may touch which bytes is decided by the owner.
unsafe impl Send for Reservation {}
unsafe impl Sync for Reservation {}

impl Reservation {
    /// Reserve at least `bytes` bytes, rounded up to a whole number of pages.
    pub fn new(bytes: usize) -> Result<Self, ReserveFailed> {
        if bytes == 0 {
            return Err(ReserveFailed { bytes });
        }
        #[cfg(test)]
        if refusals::refuse_next() {
            return Err(ReserveFailed { bytes });
        }
        let len = bytes.checked_next_multiple_of(vendor::PAGE_SIZE).ok_or(ReserveFailed { bytes })?;

        let base = vendor::sys_alloc(len)?;
        debug_assert!(base.as_ptr().addr() % vendor::PAGE_SIZE == 0, "base: {base:?}");
        #[cfg(test)]
        refusals::LIVE.set(refusals::LIVE.get() + 1);

        Ok(Self { base, len })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        #[cfg(test)]
        refusals::LIVE.set(refusals::LIVE.get() - 1);
        vendor::sys_dealloc(self.base, self.len);
    }
}

pub fn page_size() -> usize {
    vendor::PAGE_SIZE
}


#[cfg(target_os = "linux")]
mod vendor {
    pub const PAGE_SIZE: usize = 4096;

    use crate::error::ReserveFailed;
    use rustix::mm::{MapFlags, ProtFlags, mmap_anonymous, munmap};
    use std::ffi::c_void;
    use std::ptr::{self, NonNull};

    pub fn sys_alloc(reqsize: usize) -> Result<NonNull<u8>, ReserveFailed> {
        match unsafe {
            mmap_anonymous(
                ptr::null_mut(),
                reqsize,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE | MapFlags::NORESERVE,
            )
        } {
            Ok(p) => NonNull::new(p as *mut u8).ok_or(ReserveFailed { bytes: reqsize }),
            Err(_) => Err(ReserveFailed { bytes: reqsize }),
        }
    }

    pub fn sys_dealloc(p: NonNull<u8>, size: usize) {
        unsafe {
            munmap(p.as_ptr() as *mut c_void, size).ok();
        }
    }
}

#[cfg(target_vendor = "apple")]
mod vendor {
    pub const PAGE_SIZE: usize = 16384;

    use crate::error::ReserveFailed;
    use mach_sys::kern_return::KERN_SUCCESS;
    use mach_sys::port::mach_port_t;
    use mach_sys::traps::mach_task_self;
    use mach_sys::vm::{mach_vm_allocate, mach_vm_deallocate};
    use mach_sys::vm_statistics::VM_FLAGS_ANYWHERE;
    use mach_sys::vm_types::{mach_vm_address_t, mach_vm_size_t};
    use std::ptr::NonNull;

    pub fn sys_alloc(size: usize) -> Result<NonNull<u8>, ReserveFailed> {
        let task: mach_port_t = unsafe { mach_task_self() };
        let mut address: mach_vm_address_t = 0;
        let vmsize: mach_vm_size_t = size as mach_vm_size_t;

        let retval = unsafe { mach_vm_allocate(task, &mut address, vmsize, VM_FLAGS_ANYWHERE) };
        if retval == KERN_SUCCESS {
            NonNull::new(address as *mut u8).ok_or(ReserveFailed { bytes: size })
        } else {
            Err(ReserveFailed { bytes: size })
        }
    }

    pub fn sys_dealloc(p: NonNull<u8>, size: usize) {
        unsafe {
            let retval = mach_vm_deallocate(mach_task_self(), p.as_ptr().addr() as u64, size as u64);
            debug_assert!(retval == KERN_SUCCESS);
        }
    }
}

// Everywhere else, borrow page-aligned memory from the system allocator.
#[cfg(not(any(target_os = "linux", target_vendor = "apple")))]
mod vendor {
    pub const PAGE_SIZE: usize = 4096;

    use crate::error::ReserveFailed;
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::ptr::NonNull;

    pub fn sys_alloc(size: usize) -> Result<NonNull<u8>, ReserveFailed> {
        let layout = Layout::from_size_align(size, PAGE_SIZE).map_err(|_| ReserveFailed { bytes: size })?;
        NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(ReserveFailed { bytes: size })
    }

    pub fn sys_dealloc(p: NonNull<u8>, size: usize) {
        if let Ok(layout) = Layout::from_size_align(size, PAGE_SIZE) {
            unsafe { dealloc(p.as_ptr(), layout) };
        }
    }
}
