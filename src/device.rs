// LitePCIe DMA Rust Bindings
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! The privileged driver boundary.
//!
//! [`DmaDevice`] models the control and data calls a LitePCIe driver offers
//! to user space; [`OverlappedDevice`] adds the asynchronous completion model.
//! [`LitePcieDevice`] implements them on top of the real driver.
//!
//! # Platform Support
//!
//! ## Linux
//! The driver exposes one character device per board (`/dev/litepcie0`, ...).
//! Control uses `ioctl`, zero-copy maps the DMA buffers with `mmap`, and
//! readiness is reported by `poll` (`POLLIN` inbound, `POLLOUT` outbound).
//!
//! ## Windows
//! The KMDF driver registers the `GUID_DEVINTERFACE_litepciedrv` interface;
//! the DMA channel is opened by appending its name (e.g. `\DMA0`) to the
//! interface path. Transfers use overlapped `ReadFile` / `WriteFile`.
//! Zero-copy mapping is not offered.

use crate::channel::{Direction, Directions};
use crate::error::{DmaError, DmaResult};
use crate::ring::SharedRegion;
use std::time::Duration;

/// Counter pair reported by the driver for one DMA engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counts {
    pub hw_count: u64,
    pub sw_count: u64,
}

/// Location and shape of one driver-owned DMA ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingGeometry {
    /// Offset to pass to the mapping call.
    pub offset: u64,
    pub slot_size: usize,
    pub slot_count: usize,
}

impl RingGeometry {
    /// Size of the ring in bytes.
    pub fn len(&self) -> usize {
        self.slot_size * self.slot_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Both driver rings as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingLayout {
    pub inbound: RingGeometry,
    pub outbound: RingGeometry,
}

impl RingLayout {
    pub fn for_direction(&self, direction: Direction) -> &RingGeometry {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }
}

/// Control and data calls offered by the privileged driver.
///
/// All calls take `&self`: a handle is shared between the session and the
/// lock guard, and the driver serializes calls on the same handle.
pub trait DmaDevice: Send + Sync {
    /// Request the locks for `wanted` without blocking; returns the
    /// directions granted.
    fn request_lock(&self, wanted: Directions) -> DmaResult<Directions>;

    /// Release the locks for `release`. Releasing a lock that is not held is
    /// a no-op.
    fn release_lock(&self, release: Directions) -> DmaResult<()>;

    /// Route outbound data back inbound inside the FPGA.
    fn set_loopback(&self, enable: bool) -> DmaResult<()>;

    /// Enable or disable a DMA engine; returns its counters after the call.
    ///
    /// Enabling resets both counters to zero. Calling with `enable = true` on
    /// a running engine only reports the current counters.
    fn enable_channel(&self, direction: Direction, enable: bool) -> DmaResult<Counts>;

    /// Geometry and mapping offsets of the driver's rings.
    fn ring_layout(&self) -> DmaResult<RingLayout>;

    /// Map the driver's ring for `direction` into the process.
    fn map_ring(
        &self,
        _direction: Direction,
        _geometry: &RingGeometry,
    ) -> DmaResult<Box<dyn SharedRegion>> {
        Err(DmaError::ZeroCopyUnsupported)
    }

    /// Tell the driver how many slots software has released.
    fn push_sw_count(&self, direction: Direction, sw_count: u64) -> DmaResult<()>;

    /// Copy completed inbound data out of the driver; returns bytes moved.
    fn read(&self, buf: &mut [u8]) -> DmaResult<usize>;

    /// Copy outbound data into the driver; returns bytes moved.
    fn write(&self, buf: &[u8]) -> DmaResult<usize>;

    /// Wait up to `timeout` for any of `interest` to become ready.
    ///
    /// Returns the ready directions, empty on timeout.
    fn wait_ready(&self, _interest: Directions, _timeout: Duration) -> DmaResult<Directions> {
        Err(DmaError::PlatformNotSupported("readiness polling"))
    }
}

/// Outcome of submitting an overlapped transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The transfer finished synchronously, moving this many bytes.
    Completed(usize),
    /// The transfer is in flight; harvest it with `wait_any`.
    Pending,
}

/// Asynchronous (overlapped) transfers, at most one in flight per direction.
pub trait OverlappedDevice: DmaDevice {
    /// Start a transfer of `len` bytes at `buf` for `direction`.
    ///
    /// # Safety
    ///
    /// `buf` must stay valid (and, for inbound, otherwise untouched) until
    /// the transfer is harvested by `wait_any` or cancelled by `cancel_all`.
    unsafe fn submit(&self, direction: Direction, buf: *mut u8, len: usize)
        -> DmaResult<Submission>;

    /// Wait up to `timeout` for one pending transfer among `pending` to
    /// complete; returns its direction and byte count, `None` on timeout.
    fn wait_any(
        &self,
        pending: Directions,
        timeout: Duration,
    ) -> DmaResult<Option<(Direction, usize)>>;

    /// Cancel every in-flight transfer and wait for the cancellations.
    fn cancel_all(&self);
}

// ============================================================================
// Linux Implementation
// ============================================================================

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use crate::ioctl::{self, DmaEngine, DmaLock, DmaLoopback, MmapDmaInfo, MmapDmaUpdate};
    use std::fs::{File, OpenOptions};
    use std::io::{Read, Write};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use std::path::{Path, PathBuf};

    /// A LitePCIe character device.
    #[derive(Debug)]
    pub struct LitePcieDevice {
        file: File,
        path: PathBuf,
    }

    impl LitePcieDevice {
        /// Open the device node (e.g. `/dev/litepcie0`).
        pub fn open(path: impl AsRef<Path>) -> DmaResult<Self> {
            let path = path.as_ref().to_path_buf();
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_CLOEXEC)
                .open(&path)
                .map_err(|source| DmaError::DeviceUnavailable {
                    path: path.clone(),
                    source,
                })?;
            log::info!("opened LitePCIe device {}", path.display());
            Ok(Self { file, path })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        fn ioctl<T>(&self, request: u64, arg: &mut T) -> DmaResult<()> {
            // SAFETY: `arg` is a live `#[repr(C)]` struct whose size is
            // encoded in `request`.
            let rc =
                unsafe { libc::ioctl(self.file.as_raw_fd(), request as _, arg as *mut T) };
            if rc < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            Ok(())
        }
    }

    impl DmaDevice for LitePcieDevice {
        fn request_lock(&self, wanted: Directions) -> DmaResult<Directions> {
            let mut m = DmaLock::request(wanted);
            self.ioctl(ioctl::linux::LOCK, &mut m)?;
            Ok(m.granted())
        }

        fn release_lock(&self, release: Directions) -> DmaResult<()> {
            let mut m = DmaLock::release(release);
            self.ioctl(ioctl::linux::LOCK, &mut m)
        }

        fn set_loopback(&self, enable: bool) -> DmaResult<()> {
            let mut m = DmaLoopback {
                loopback_enable: enable as u8,
            };
            self.ioctl(ioctl::linux::DMA, &mut m)
        }

        fn enable_channel(&self, direction: Direction, enable: bool) -> DmaResult<Counts> {
            let request = match direction {
                Direction::Inbound => ioctl::linux::DMA_WRITER,
                Direction::Outbound => ioctl::linux::DMA_READER,
            };
            let mut m = DmaEngine::request(enable);
            self.ioctl(request, &mut m)?;
            m.counts(direction)
        }

        fn ring_layout(&self) -> DmaResult<RingLayout> {
            let mut m = MmapDmaInfo::default();
            self.ioctl(ioctl::linux::MMAP_DMA_INFO, &mut m)?;
            Ok(RingLayout {
                inbound: RingGeometry {
                    offset: m.dma_rx_buf_offset,
                    slot_size: m.dma_rx_buf_size as usize,
                    slot_count: m.dma_rx_buf_count as usize,
                },
                outbound: RingGeometry {
                    offset: m.dma_tx_buf_offset,
                    slot_size: m.dma_tx_buf_size as usize,
                    slot_count: m.dma_tx_buf_count as usize,
                },
            })
        }

        fn map_ring(
            &self,
            direction: Direction,
            geometry: &RingGeometry,
        ) -> DmaResult<Box<dyn SharedRegion>> {
            let len = geometry.len();
            // SAFETY: a fresh shared mapping of the device at the offset the
            // driver reported; ownership of the mapping moves into the region.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    self.file.as_raw_fd(),
                    geometry.offset as libc::off_t,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(DmaError::MmapFailed(format!(
                    "{} ring: {}",
                    direction,
                    std::io::Error::last_os_error()
                )));
            }
            log::debug!("mapped {} ring: {} bytes", direction, len);
            Ok(Box::new(MmapRegion {
                ptr: ptr as *mut u8,
                len,
            }))
        }

        fn push_sw_count(&self, direction: Direction, sw_count: u64) -> DmaResult<()> {
            let request = match direction {
                Direction::Inbound => ioctl::linux::MMAP_DMA_WRITER_UPDATE,
                Direction::Outbound => ioctl::linux::MMAP_DMA_READER_UPDATE,
            };
            let mut m = MmapDmaUpdate::new(sw_count);
            self.ioctl(request, &mut m)
        }

        fn read(&self, buf: &mut [u8]) -> DmaResult<usize> {
            Ok((&self.file).read(buf)?)
        }

        fn write(&self, buf: &[u8]) -> DmaResult<usize> {
            Ok((&self.file).write(buf)?)
        }

        fn wait_ready(&self, interest: Directions, timeout: Duration) -> DmaResult<Directions> {
            let mut events: libc::c_short = 0;
            if interest.has(Direction::Inbound) {
                events |= libc::POLLIN;
            }
            if interest.has(Direction::Outbound) {
                events |= libc::POLLOUT;
            }
            let mut pfd = libc::pollfd {
                fd: self.file.as_raw_fd(),
                events,
                revents: 0,
            };
            let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

            // SAFETY: one valid pollfd.
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    return Ok(Directions::empty());
                }
                return Err(err.into());
            }

            let mut ready = Directions::empty();
            if pfd.revents & libc::POLLIN != 0 {
                ready |= Directions::INBOUND;
            }
            if pfd.revents & libc::POLLOUT != 0 {
                ready |= Directions::OUTBOUND;
            }
            Ok(ready & interest)
        }
    }

    /// A DMA ring mapped from the driver; unmapped on drop.
    struct MmapRegion {
        ptr: *mut u8,
        len: usize,
    }

    // SAFETY: the mapping is process-wide and not tied to a thread.
    unsafe impl Send for MmapRegion {}

    // SAFETY: `ptr` is valid for `len` bytes until `munmap` in `drop`.
    unsafe impl SharedRegion for MmapRegion {
        fn as_ptr(&self) -> *mut u8 {
            self.ptr
        }

        fn len(&self) -> usize {
            self.len
        }
    }

    impl Drop for MmapRegion {
        fn drop(&mut self) {
            // SAFETY: `ptr`/`len` came from a successful mmap.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.len);
            }
        }
    }
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(target_os = "windows")]
mod windows_impl {
    use super::*;
    use crate::ioctl::{self, DmaEngine, DmaLock, DmaLoopback, MmapDmaUpdate};
    use std::ffi::c_void;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use windows::core::{GUID, PCWSTR};
    use windows::Win32::Devices::DeviceAndDriverInstallation::{
        SetupDiDestroyDeviceInfoList, SetupDiEnumDeviceInterfaces, SetupDiGetClassDevsW,
        SetupDiGetDeviceInterfaceDetailW, DIGCF_DEVICEINTERFACE, DIGCF_PRESENT, HDEVINFO,
        SP_DEVICE_INTERFACE_DATA, SP_DEVICE_INTERFACE_DETAIL_DATA_W,
    };
    use windows::Win32::Foundation::{
        CloseHandle, ERROR_IO_PENDING, GENERIC_READ, GENERIC_WRITE, HANDLE, WAIT_FAILED,
        WAIT_OBJECT_0, WAIT_TIMEOUT,
    };
    use windows::Win32::Storage::FileSystem::{
        CreateFileW, ReadFile, WriteFile, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_NO_BUFFERING,
        FILE_FLAG_OVERLAPPED, FILE_SHARE_MODE, OPEN_EXISTING,
    };
    use windows::Win32::System::Threading::{CreateEventW, ResetEvent, WaitForMultipleObjects};
    use windows::Win32::System::IO::{CancelIoEx, DeviceIoControl, GetOverlappedResult, OVERLAPPED};

    /// `GUID_DEVINTERFACE_litepciedrv`.
    const GUID_DEVINTERFACE_LITEPCIEDRV: GUID =
        GUID::from_u128(0x164adc02_e1ae_4fe1_a904_9a013577b891);

    fn win_err(e: windows::core::Error) -> DmaError {
        DmaError::Io(std::io::Error::from(e))
    }

    fn is_pending(e: &windows::core::Error) -> bool {
        e.code() == ERROR_IO_PENDING.to_hresult()
    }

    /// Device interface path of the first LitePCIe board.
    fn interface_path() -> std::io::Result<String> {
        let dev_info = unsafe {
            SetupDiGetClassDevsW(
                Some(&GUID_DEVINTERFACE_LITEPCIEDRV),
                PCWSTR::null(),
                None,
                DIGCF_DEVICEINTERFACE | DIGCF_PRESENT,
            )
        }
        .map_err(std::io::Error::from)?;

        struct DevInfoCleanup(HDEVINFO);
        impl Drop for DevInfoCleanup {
            fn drop(&mut self) {
                unsafe {
                    let _ = SetupDiDestroyDeviceInfoList(self.0);
                }
            }
        }
        let _cleanup = DevInfoCleanup(dev_info);

        let mut dev_data = SP_DEVICE_INTERFACE_DATA {
            cbSize: std::mem::size_of::<SP_DEVICE_INTERFACE_DATA>() as u32,
            ..Default::default()
        };
        unsafe {
            SetupDiEnumDeviceInterfaces(
                dev_info,
                None,
                &GUID_DEVINTERFACE_LITEPCIEDRV,
                0,
                &mut dev_data,
            )
        }
        .map_err(std::io::Error::from)?;

        // First call only reports the required size.
        let mut required = 0u32;
        let _ = unsafe {
            SetupDiGetDeviceInterfaceDetailW(dev_info, &dev_data, None, 0, Some(&mut required), None)
        };
        if required == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "bad device interface detail length",
            ));
        }

        // u32 storage keeps the detail struct aligned.
        let mut storage = vec![0u32; (required as usize).div_ceil(4)];
        let detail = storage.as_mut_ptr() as *mut SP_DEVICE_INTERFACE_DETAIL_DATA_W;
        unsafe {
            (*detail).cbSize = std::mem::size_of::<SP_DEVICE_INTERFACE_DETAIL_DATA_W>() as u32;
            SetupDiGetDeviceInterfaceDetailW(
                dev_info,
                &dev_data,
                Some(detail),
                required,
                None,
                None,
            )
        }
        .map_err(std::io::Error::from)?;

        let path = unsafe {
            let start = std::ptr::addr_of!((*detail).DevicePath) as *const u16;
            let max = (required as usize - (start as usize - detail as usize)) / 2;
            let wide = std::slice::from_raw_parts(start, max);
            let end = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
            String::from_utf16_lossy(&wide[..end])
        };
        log::info!("found LitePCIe device interface {}", path);
        Ok(path)
    }

    fn wide(s: &str) -> Vec<u16> {
        s.encode_utf16().chain(std::iter::once(0)).collect()
    }

    /// One in-flight overlapped transfer.
    struct InFlight {
        overlapped: Box<OVERLAPPED>,
    }

    /// A LitePCIe DMA channel opened through the KMDF driver.
    pub struct LitePcieDevice {
        handle: HANDLE,
        path: PathBuf,
        /// Completion event per direction.
        events: [HANDLE; 2],
        in_flight: Mutex<[Option<InFlight>; 2]>,
    }

    // SAFETY: the handles are kernel objects usable from any thread; the
    // in-flight OVERLAPPED blocks are only touched under the mutex.
    unsafe impl Send for LitePcieDevice {}
    unsafe impl Sync for LitePcieDevice {}

    impl LitePcieDevice {
        /// Open the DMA channel `name` (e.g. `\DMA0`) of the first board.
        pub fn open(name: impl AsRef<Path>) -> DmaResult<Self> {
            let name = name.as_ref().to_string_lossy().into_owned();
            let unavailable = |source| DmaError::DeviceUnavailable {
                path: PathBuf::from(&name),
                source,
            };

            let path = PathBuf::from(interface_path().map_err(unavailable)? + &name);
            let wide_path = wide(&path.to_string_lossy());
            let handle = unsafe {
                CreateFileW(
                    PCWSTR(wide_path.as_ptr()),
                    (GENERIC_READ | GENERIC_WRITE).0,
                    FILE_SHARE_MODE(0),
                    None,
                    OPEN_EXISTING,
                    FILE_ATTRIBUTE_NORMAL | FILE_FLAG_NO_BUFFERING | FILE_FLAG_OVERLAPPED,
                    None,
                )
            }
            .map_err(|e| unavailable(std::io::Error::from(e)))?;
            let handle = scopeguard::guard(handle, |h| unsafe {
                let _ = CloseHandle(h);
            });

            let mut events = [HANDLE::default(); 2];
            for event in events.iter_mut() {
                *event = unsafe { CreateEventW(None, true, false, PCWSTR::null()) }
                    .map_err(win_err)?;
            }

            log::info!("opened LitePCIe device {}", path.display());
            Ok(Self {
                handle: scopeguard::ScopeGuard::into_inner(handle),
                path,
                events,
                in_flight: Mutex::new([None, None]),
            })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Buffered control call; waits for completion on the overlapped handle.
        fn control<T>(&self, code: u32, arg: &mut T) -> DmaResult<()> {
            let event =
                unsafe { CreateEventW(None, true, false, PCWSTR::null()) }.map_err(win_err)?;
            let event = scopeguard::guard(event, |e| unsafe {
                let _ = CloseHandle(e);
            });

            let size = std::mem::size_of::<T>() as u32;
            let ptr = arg as *mut T as *mut c_void;
            let mut overlapped = OVERLAPPED {
                hEvent: *event,
                ..Default::default()
            };
            let mut returned = 0u32;
            let result = unsafe {
                DeviceIoControl(
                    self.handle,
                    code,
                    Some(ptr as *const c_void),
                    size,
                    Some(ptr),
                    size,
                    Some(&mut returned),
                    Some(&mut overlapped),
                )
            };
            match result {
                Ok(()) => Ok(()),
                Err(e) if is_pending(&e) => unsafe {
                    GetOverlappedResult(self.handle, &overlapped, &mut returned, true)
                }
                .map_err(win_err),
                Err(e) => Err(win_err(e)),
            }
        }

        /// Blocking transfer through a private overlapped block.
        fn transfer(&self, direction: Direction, buf: *mut u8, len: usize) -> DmaResult<usize> {
            let event =
                unsafe { CreateEventW(None, true, false, PCWSTR::null()) }.map_err(win_err)?;
            let event = scopeguard::guard(event, |e| unsafe {
                let _ = CloseHandle(e);
            });
            let mut overlapped = OVERLAPPED {
                hEvent: *event,
                ..Default::default()
            };
            let mut moved = 0u32;
            let result = unsafe { self.start(direction, buf, len, &mut moved, &mut overlapped) };
            match result {
                Ok(()) => Ok(moved as usize),
                Err(e) if is_pending(&e) => {
                    unsafe { GetOverlappedResult(self.handle, &overlapped, &mut moved, true) }
                        .map_err(win_err)?;
                    Ok(moved as usize)
                }
                Err(e) => Err(win_err(e)),
            }
        }

        /// Issue `ReadFile` (inbound) or `WriteFile` (outbound).
        unsafe fn start(
            &self,
            direction: Direction,
            buf: *mut u8,
            len: usize,
            moved: &mut u32,
            overlapped: *mut OVERLAPPED,
        ) -> windows::core::Result<()> {
            match direction {
                Direction::Inbound => {
                    let slice = std::slice::from_raw_parts_mut(buf, len);
                    ReadFile(self.handle, Some(slice), Some(moved), Some(overlapped))
                }
                Direction::Outbound => {
                    let slice = std::slice::from_raw_parts(buf as *const u8, len);
                    WriteFile(self.handle, Some(slice), Some(moved), Some(overlapped))
                }
            }
        }
    }

    impl DmaDevice for LitePcieDevice {
        fn request_lock(&self, wanted: Directions) -> DmaResult<Directions> {
            let mut m = DmaLock::request(wanted);
            self.control(ioctl::win32::LOCK, &mut m)?;
            Ok(m.granted())
        }

        fn release_lock(&self, release: Directions) -> DmaResult<()> {
            let mut m = DmaLock::release(release);
            self.control(ioctl::win32::LOCK, &mut m)
        }

        fn set_loopback(&self, enable: bool) -> DmaResult<()> {
            let mut m = DmaLoopback {
                loopback_enable: enable as u8,
            };
            self.control(ioctl::win32::DMA, &mut m)
        }

        fn enable_channel(&self, direction: Direction, enable: bool) -> DmaResult<Counts> {
            let code = match direction {
                Direction::Inbound => ioctl::win32::DMA_WRITER,
                Direction::Outbound => ioctl::win32::DMA_READER,
            };
            let mut m = DmaEngine::request(enable);
            self.control(code, &mut m)?;
            m.counts(direction)
        }

        fn ring_layout(&self) -> DmaResult<RingLayout> {
            Err(DmaError::ZeroCopyUnsupported)
        }

        fn push_sw_count(&self, direction: Direction, sw_count: u64) -> DmaResult<()> {
            let code = match direction {
                Direction::Inbound => ioctl::win32::MMAP_DMA_WRITER_UPDATE,
                Direction::Outbound => ioctl::win32::MMAP_DMA_READER_UPDATE,
            };
            let mut m = MmapDmaUpdate::new(sw_count);
            self.control(code, &mut m)
        }

        fn read(&self, buf: &mut [u8]) -> DmaResult<usize> {
            self.transfer(Direction::Inbound, buf.as_mut_ptr(), buf.len())
        }

        fn write(&self, buf: &[u8]) -> DmaResult<usize> {
            self.transfer(Direction::Outbound, buf.as_ptr() as *mut u8, buf.len())
        }
    }

    impl OverlappedDevice for LitePcieDevice {
        unsafe fn submit(
            &self,
            direction: Direction,
            buf: *mut u8,
            len: usize,
        ) -> DmaResult<Submission> {
            let mut in_flight = self.in_flight.lock().map_err(|_| {
                DmaError::violation(direction, "in-flight table poisoned")
            })?;
            if in_flight[direction.index()].is_some() {
                return Err(DmaError::violation(direction, "transfer already in flight"));
            }

            let event = self.events[direction.index()];
            ResetEvent(event).map_err(win_err)?;
            let mut overlapped = Box::new(OVERLAPPED {
                hEvent: event,
                ..Default::default()
            });
            let mut moved = 0u32;
            match self.start(direction, buf, len, &mut moved, &mut *overlapped) {
                Ok(()) => Ok(Submission::Completed(moved as usize)),
                Err(e) if is_pending(&e) => {
                    in_flight[direction.index()] = Some(InFlight { overlapped });
                    Ok(Submission::Pending)
                }
                Err(e) => Err(DmaError::violation(
                    direction,
                    format!("transfer submission failed: {}", e),
                )),
            }
        }

        fn wait_any(
            &self,
            pending: Directions,
            timeout: Duration,
        ) -> DmaResult<Option<(Direction, usize)>> {
            let directions: Vec<Direction> = pending.each().collect();
            let handles: Vec<HANDLE> = directions
                .iter()
                .map(|d| self.events[d.index()])
                .collect();
            if handles.is_empty() {
                return Ok(None);
            }

            let timeout_ms = timeout.as_millis().min(u32::MAX as u128 - 1) as u32;
            let result = unsafe { WaitForMultipleObjects(&handles, false, timeout_ms) };
            if result == WAIT_TIMEOUT {
                return Ok(None);
            }
            if result == WAIT_FAILED {
                return Err(std::io::Error::last_os_error().into());
            }

            let index = result.0.wrapping_sub(WAIT_OBJECT_0.0) as usize;
            let direction = *directions.get(index).ok_or_else(|| {
                DmaError::Io(std::io::Error::other(format!(
                    "unexpected wait result {:#x}",
                    result.0
                )))
            })?;

            let done = self
                .in_flight
                .lock()
                .map_err(|_| DmaError::violation(direction, "in-flight table poisoned"))?
                [direction.index()]
            .take()
            .ok_or_else(|| DmaError::violation(direction, "completion without a transfer"))?;

            let mut moved = 0u32;
            unsafe { GetOverlappedResult(self.handle, &*done.overlapped, &mut moved, false) }
                .map_err(|e| {
                    DmaError::violation(direction, format!("transfer completion failed: {}", e))
                })?;
            Ok(Some((direction, moved as usize)))
        }

        fn cancel_all(&self) {
            let Ok(mut in_flight) = self.in_flight.lock() else {
                return;
            };
            for (i, slot) in in_flight.iter_mut().enumerate() {
                if let Some(op) = slot.take() {
                    let mut moved = 0u32;
                    unsafe {
                        let _ = CancelIoEx(self.handle, Some(&*op.overlapped));
                        let _ = GetOverlappedResult(self.handle, &*op.overlapped, &mut moved, true);
                    }
                    log::debug!("cancelled {} transfer", Direction::ALL[i]);
                }
            }
        }
    }

    impl Drop for LitePcieDevice {
        fn drop(&mut self) {
            self.cancel_all();
            unsafe {
                for event in self.events {
                    let _ = CloseHandle(event);
                }
                let _ = CloseHandle(self.handle);
            }
            log::debug!("closed LitePCIe device {}", self.path.display());
        }
    }

    impl std::fmt::Debug for LitePcieDevice {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("LitePcieDevice")
                .field("path", &self.path)
                .finish()
        }
    }
}

// ============================================================================
// Unsupported Platform Stub
// ============================================================================

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
mod stub_impl {
    use super::*;
    use std::path::Path;

    #[derive(Debug)]
    enum Never {}

    /// Placeholder; cannot be opened on this platform.
    #[derive(Debug)]
    pub struct LitePcieDevice {
        never: Never,
    }

    impl LitePcieDevice {
        pub fn open(_path: impl AsRef<Path>) -> DmaResult<Self> {
            Err(DmaError::PlatformNotSupported("LitePCIe driver"))
        }
    }

    impl DmaDevice for LitePcieDevice {
        fn request_lock(&self, _wanted: Directions) -> DmaResult<Directions> {
            match self.never {}
        }

        fn release_lock(&self, _release: Directions) -> DmaResult<()> {
            match self.never {}
        }

        fn set_loopback(&self, _enable: bool) -> DmaResult<()> {
            match self.never {}
        }

        fn enable_channel(&self, _direction: Direction, _enable: bool) -> DmaResult<Counts> {
            match self.never {}
        }

        fn ring_layout(&self) -> DmaResult<RingLayout> {
            match self.never {}
        }

        fn push_sw_count(&self, _direction: Direction, _sw_count: u64) -> DmaResult<()> {
            match self.never {}
        }

        fn read(&self, _buf: &mut [u8]) -> DmaResult<usize> {
            match self.never {}
        }

        fn write(&self, _buf: &[u8]) -> DmaResult<usize> {
            match self.never {}
        }
    }
}

// ============================================================================
// Public API
// ============================================================================

#[cfg(target_os = "linux")]
pub use linux_impl::LitePcieDevice;

#[cfg(target_os = "windows")]
pub use windows_impl::LitePcieDevice;

#[cfg(not(any(target_os = "linux", target_os = "windows")))]
pub use stub_impl::LitePcieDevice;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_for_direction() {
        let layout = RingLayout {
            inbound: RingGeometry {
                offset: 0,
                slot_size: 8192,
                slot_count: 256,
            },
            outbound: RingGeometry {
                offset: 8192 * 256,
                slot_size: 8192,
                slot_count: 256,
            },
        };
        assert_eq!(layout.for_direction(Direction::Outbound).offset, 8192 * 256);
        assert_eq!(layout.for_direction(Direction::Inbound).len(), 2 * 1024 * 1024);
    }

    #[test]
    fn test_open_missing_device() {
        let result = LitePcieDevice::open("/dev/litepcie-does-not-exist");
        match result {
            Err(DmaError::DeviceUnavailable { .. }) | Err(DmaError::PlatformNotSupported(_)) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
