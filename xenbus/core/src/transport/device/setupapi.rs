//! Device interface enumeration through SetupAPI

use std::io;
use std::mem::{offset_of, size_of};
use std::ptr;

use windows_sys::core::GUID;
use windows_sys::Win32::Devices::DeviceAndDriverInstallation::{
    SetupDiDestroyDeviceInfoList, SetupDiEnumDeviceInterfaces, SetupDiGetClassDevsW,
    SetupDiGetDeviceInterfaceDetailW, DIGCF_DEVICEINTERFACE, DIGCF_PRESENT, HDEVINFO,
    SP_DEVICE_INTERFACE_DATA, SP_DEVICE_INTERFACE_DETAIL_DATA_W,
};
use windows_sys::Win32::Foundation::{
    GetLastError, ERROR_INSUFFICIENT_BUFFER, ERROR_NO_MORE_ITEMS, INVALID_HANDLE_VALUE,
};

use super::{open_exclusive, DevicePlatform, RawDevice};
use crate::transport::TransportError;

const XENBUS_GUID: GUID = GUID::from_u128(0x14ce175a_3ee2_4fae_9252_00dbd84f018e);

/// Owns a device information set
struct DeviceInfoList(HDEVINFO);

impl Drop for DeviceInfoList {
    fn drop(&mut self) {
        // SAFETY: the set came from SetupDiGetClassDevsW and is destroyed once
        unsafe {
            SetupDiDestroyDeviceInfoList(self.0);
        }
    }
}

fn unavailable(context: &str) -> TransportError {
    TransportError::unavailable(context, io::Error::last_os_error())
}

/// Locates the xenbus device through its registered interface class
#[derive(Clone, Copy, Debug, Default)]
pub struct SetupApiPlatform;

impl SetupApiPlatform {
    fn first_interface_path() -> Result<String, TransportError> {
        // SAFETY: all pointers passed below point at live, correctly sized
        // locals; the detail buffer is u32-aligned and at least `required`
        // bytes long before the second call.
        unsafe {
            let set = SetupDiGetClassDevsW(
                &XENBUS_GUID,
                ptr::null(),
                ptr::null_mut(),
                DIGCF_PRESENT | DIGCF_DEVICEINTERFACE,
            );
            if set as isize == INVALID_HANDLE_VALUE as isize {
                return Err(unavailable("SetupDiGetClassDevs failed"));
            }
            let list = DeviceInfoList(set);

            let mut interface: SP_DEVICE_INTERFACE_DATA = std::mem::zeroed();
            interface.cbSize = size_of::<SP_DEVICE_INTERFACE_DATA>() as u32;
            if SetupDiEnumDeviceInterfaces(list.0, ptr::null(), &XENBUS_GUID, 0, &mut interface) == 0 {
                if GetLastError() == ERROR_NO_MORE_ITEMS {
                    return Err(TransportError::Unavailable {
                        context: "No xenbus device present".into(),
                        source: None,
                    });
                }
                return Err(unavailable("SetupDiEnumDeviceInterfaces failed"));
            }

            let mut required = 0u32;
            let sized = SetupDiGetDeviceInterfaceDetailW(
                list.0,
                &interface,
                ptr::null_mut(),
                0,
                &mut required,
                ptr::null_mut(),
            );
            if sized != 0 || GetLastError() != ERROR_INSUFFICIENT_BUFFER {
                return Err(unavailable("SetupDiGetDeviceInterfaceDetail (size) failed"));
            }

            let words = (required as usize).div_ceil(size_of::<u32>());
            let mut buffer = vec![0u32; words.max(2)];
            let detail = buffer.as_mut_ptr().cast::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>();
            (*detail).cbSize = size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() as u32;

            if SetupDiGetDeviceInterfaceDetailW(
                list.0,
                &interface,
                detail,
                required,
                ptr::null_mut(),
                ptr::null_mut(),
            ) == 0
            {
                return Err(unavailable("SetupDiGetDeviceInterfaceDetail failed"));
            }

            let offset = offset_of!(SP_DEVICE_INTERFACE_DETAIL_DATA_W, DevicePath);
            let chars = (required as usize).saturating_sub(offset) / size_of::<u16>();
            let start = buffer.as_ptr().cast::<u8>().add(offset).cast::<u16>();
            let wide = std::slice::from_raw_parts(start, chars);
            let end = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());

            String::from_utf16(&wide[..end]).map_err(|e| TransportError::Unavailable {
                context: "Device path is not valid UTF-16".into(),
                source: Some(Box::new(e)),
            })
        }
    }
}

impl DevicePlatform for SetupApiPlatform {
    fn discover(&self) -> Result<String, TransportError> {
        tracing::debug!(guid = super::XENBUS_INTERFACE_GUID, "Enumerating xenbus device interfaces");
        Self::first_interface_path()
    }

    fn open(&self, path: &str) -> io::Result<Box<dyn RawDevice>> {
        open_exclusive(path)
    }
}
