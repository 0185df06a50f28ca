use std::io;
use std::ptr;

/// A writable byte region requested from the operating system.
///
/// The region is an anonymous private mapping, prefaulted so the first
/// append into every segment does not take a page fault. It is released
/// when the value is dropped.
pub struct Memory {
  addr: *mut u8,
  size: usize,
}

impl Memory {
  /// Map a region of `size` bytes.
  pub fn map(size: usize) -> io::Result<Self> {
    // SAFETY: Anonymous mapping with no requested address; the kernel
    //         picks a region that aliases nothing else.
    let addr = unsafe {
      libc::mmap(
        ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
        -1,
        0,
      )
    };
    if addr == libc::MAP_FAILED {
      return Err(io::Error::last_os_error());
    }

    Ok(Self {
      addr: addr as *mut u8,
      size,
    })
  }

  pub fn addr(&self) -> *mut u8 {
    self.addr
  }

  pub fn size(&self) -> usize {
    self.size
  }
}

impl Drop for Memory {
  fn drop(&mut self) {
    // SAFETY: addr/size are exactly what mmap returned.
    unsafe { libc::munmap(self.addr as *mut libc::c_void, self.size) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn map_is_writable() {
    let memory = Memory::map(4096).unwrap();
    assert_eq!(memory.size(), 4096);

    unsafe {
      memory.addr().write(0xa5);
      assert_eq!(memory.addr().read(), 0xa5);
    }
  }
}
