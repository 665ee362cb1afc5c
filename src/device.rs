use crate::error_utilities::log_ret_last_os_err;

use rdma_sys::{ibv_context, ibv_device, ibv_open_device};
use rdma_sys::{ibv_free_device_list, ibv_get_device_list, ibv_get_device_name};

use std::ffi::CStr;
use std::io;
use std::ops::Deref;
use std::os::raw::c_int;
use std::ptr::NonNull;
use std::{fmt, slice};

use numeric_cast::NumericCast;
use scopeguard::guard_on_unwind;

/// An array of RDMA devices.
pub(crate) struct DeviceList {
    /// base address
    arr: NonNull<Device>,
    /// array length
    len: usize,
}

/// A RDMA device
#[repr(transparent)]
pub(crate) struct Device(NonNull<ibv_device>);

impl DeviceList {
    /// Returns `*mut *mut ibv_device`
    fn ffi_ptr(&self) -> *mut *mut ibv_device {
        self.arr.as_ptr().cast()
    }

    /// Returns available rdma devices
    pub(crate) fn available() -> io::Result<Self> {
        // SAFETY: ffi
        unsafe {
            let mut num_devices: c_int = 0;
            let arr = ibv_get_device_list(&mut num_devices);
            if arr.is_null() {
                return Err(log_ret_last_os_err());
            }

            // SAFETY: repr(transparent)
            let arr: NonNull<Device> = NonNull::new_unchecked(arr.cast());

            let _guard = guard_on_unwind((), |()| ibv_free_device_list(arr.as_ptr().cast()));

            let len: usize = num_devices.numeric_cast();

            Ok(Self { arr, len })
        }
    }

    /// Returns the slice of devices
    pub(crate) fn as_slice(&self) -> &[Device] {
        // SAFETY: guaranteed by `DeviceList::available`
        unsafe { slice::from_raw_parts(self.arr.as_ptr(), self.len) }
    }

    /// Open the device whose kernel name equals `name`.
    ///
    /// The list itself is freed when it goes out of scope, opened contexts stay valid.
    pub(crate) fn open(&self, name: &str) -> io::Result<NonNull<ibv_context>> {
        let dev = self
            .iter()
            .find(|dev| dev.c_name().to_bytes() == name.as_bytes())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no RDMA device named `{name}`"),
                )
            })?;
        // SAFETY: ffi, the device pointer stays valid while the list is alive
        NonNull::new(unsafe { ibv_open_device(dev.ffi_ptr()) }).ok_or_else(log_ret_last_os_err)
    }
}

impl Drop for DeviceList {
    #[inline]
    fn drop(&mut self) {
        // SAFETY: ffi
        unsafe { ibv_free_device_list(self.ffi_ptr()) }
    }
}

impl Deref for DeviceList {
    type Target = [Device];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.as_slice()
    }
}

impl fmt::Debug for DeviceList {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <[Device] as fmt::Debug>::fmt(self, f)
    }
}

impl Device {
    /// Returns `*mut ibv_device`
    fn ffi_ptr(&self) -> *mut ibv_device {
        self.0.as_ptr()
    }

    /// Returns kernel device name
    pub(crate) fn c_name(&self) -> &CStr {
        // SAFETY: ffi
        unsafe { CStr::from_ptr(ibv_get_device_name(self.ffi_ptr())) }
    }
}

impl fmt::Debug for Device {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.c_name().to_string_lossy())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "needs an RDMA capable host"]
    fn unknown_name_is_not_found() {
        let list = DeviceList::available().unwrap();
        let err = list.open("no-such-device-0").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
