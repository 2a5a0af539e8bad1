//! Best-effort fast file extension
//!
//! Preallocating a multi-gigabyte target normally makes the OS zero-fill
//! every new byte. On Windows, a process holding `SeManageVolumePrivilege`
//! can skip the zero-fill by moving the valid-data length with
//! `SetFileValidData` after `set_len`. The privilege is requested once per
//! process; when it cannot be acquired (or on platforms without an
//! equivalent) preallocation simply takes the zero-filling slow path.

use std::fs::File;
use std::io;
use std::sync::OnceLock;

use tracing::{debug, info};

static FAST_EXTEND_AVAILABLE: OnceLock<bool> = OnceLock::new();

/// Try once per process to enable fast file extension
///
/// Returns whether the fast path is available. Never fails: an unavailable
/// privilege is logged and reported as `false`.
pub fn acquire_fast_extend() -> bool {
    *FAST_EXTEND_AVAILABLE.get_or_init(|| match platform::enable_manage_volume() {
        Ok(()) => {
            debug!("volume management privilege acquired, fast file extension enabled");
            true
        }
        Err(error) => {
            info!("fast file extension unavailable, preallocation will zero-fill: {error}");
            false
        }
    })
}

/// Mark bytes up to `len` as valid without zero-filling them
///
/// Requires a successful [`acquire_fast_extend`] first; `len` must not
/// exceed the file's allocated length.
pub fn fast_extend(file: &File, len: u64) -> io::Result<()> {
    platform::set_valid_data(file, len)
}

#[cfg(windows)]
mod platform {
    use std::fs::File;
    use std::io;
    use std::os::windows::io::AsRawHandle;

    use windows::Win32::Foundation::{CloseHandle, ERROR_NOT_ALL_ASSIGNED, GetLastError, HANDLE};
    use windows::Win32::Security::{
        AdjustTokenPrivileges, LUID_AND_ATTRIBUTES, LookupPrivilegeValueW, SE_PRIVILEGE_ENABLED,
        TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES, TOKEN_QUERY,
    };
    use windows::Win32::Storage::FileSystem::SetFileValidData;
    use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};
    use windows::core::w;

    pub fn enable_manage_volume() -> io::Result<()> {
        unsafe {
            let mut token = HANDLE::default();
            OpenProcessToken(
                GetCurrentProcess(),
                TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY,
                &mut token,
            )
            .map_err(io::Error::other)?;

            let result = (|| {
                let mut privileges = TOKEN_PRIVILEGES {
                    PrivilegeCount: 1,
                    Privileges: [LUID_AND_ATTRIBUTES {
                        Luid: Default::default(),
                        Attributes: SE_PRIVILEGE_ENABLED,
                    }],
                };
                LookupPrivilegeValueW(
                    None,
                    w!("SeManageVolumePrivilege"),
                    &mut privileges.Privileges[0].Luid,
                )
                .map_err(io::Error::other)?;

                AdjustTokenPrivileges(token, false, Some(&privileges), 0, None, None)
                    .map_err(io::Error::other)?;

                // AdjustTokenPrivileges succeeds even when the privilege was
                // not actually assigned to the token
                if GetLastError() == ERROR_NOT_ALL_ASSIGNED {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        "SeManageVolumePrivilege is not assigned to this process",
                    ));
                }
                Ok(())
            })();

            let _ = CloseHandle(token);
            result
        }
    }

    pub fn set_valid_data(file: &File, len: u64) -> io::Result<()> {
        unsafe {
            SetFileValidData(HANDLE(file.as_raw_handle()), len as i64).map_err(io::Error::other)
        }
    }
}

#[cfg(not(windows))]
mod platform {
    use std::fs::File;
    use std::io;

    pub fn enable_manage_volume() -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no volume management privilege on this platform",
        ))
    }

    pub fn set_valid_data(_file: &File, _len: u64) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "fast file extension is not supported on this platform",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(not(windows))]
    fn unsupported_platform_takes_the_slow_path() {
        assert!(!acquire_fast_extend());
        // The result is cached process-wide
        assert!(!acquire_fast_extend());

        let file = tempfile::tempfile().unwrap();
        assert!(fast_extend(&file, 1024).is_err());
    }
}
