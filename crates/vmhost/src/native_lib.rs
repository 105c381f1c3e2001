use std::ffi::c_void;
use std::ptr::NonNull;

/// A dynamically loaded shared library, closed on drop.
///
/// Symbol addresses obtained from [`SharedLibrary::symbol`] stay valid only while the
/// library is alive.
#[derive(Debug)]
pub struct SharedLibrary {
    #[cfg_attr(not(unix), allow(dead_code))]
    handle: NonNull<c_void>,
}

#[cfg(unix)]
mod imp {
    use std::ffi::{c_char, c_void, CStr, CString};
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;
    use std::ptr::NonNull;

    use super::SharedLibrary;

    fn last_dl_error() -> String {
        // SAFETY: dlerror returns null or a NUL-terminated thread-local string.
        let msg = unsafe { libc::dlerror() };
        if msg.is_null() {
            return "unknown dynamic loader error".to_string();
        }
        unsafe { CStr::from_ptr(msg as *const c_char) }
            .to_string_lossy()
            .into_owned()
    }

    impl SharedLibrary {
        pub fn open(path: &Path) -> Result<Self, String> {
            let c_path = CString::new(path.as_os_str().as_bytes())
                .map_err(|_| "path contains a NUL byte".to_string())?;
            // SAFETY: c_path is NUL-terminated and outlives the call.
            let handle =
                unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
            let handle = NonNull::new(handle).ok_or_else(last_dl_error)?;
            Ok(SharedLibrary { handle })
        }

        pub fn symbol(&self, name: &str) -> Option<NonNull<c_void>> {
            let c_name = CString::new(name).ok()?;
            // SAFETY: handle came from a successful dlopen and is not closed yet.
            let sym = unsafe { libc::dlsym(self.handle.as_ptr(), c_name.as_ptr()) };
            NonNull::new(sym)
        }
    }

    impl Drop for SharedLibrary {
        fn drop(&mut self) {
            // SAFETY: handle is closed exactly once.
            unsafe {
                libc::dlclose(self.handle.as_ptr());
            }
        }
    }
}

#[cfg(not(unix))]
mod imp {
    use std::ffi::c_void;
    use std::path::Path;
    use std::ptr::NonNull;

    use super::SharedLibrary;

    impl SharedLibrary {
        pub fn open(_path: &Path) -> Result<Self, String> {
            Err("shared library loading is not supported on this platform".to_string())
        }

        pub fn symbol(&self, _name: &str) -> Option<NonNull<c_void>> {
            None
        }
    }
}
