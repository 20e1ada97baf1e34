//! Binding to the WaveForms `dwf` runtime
//!
//! The library is opened at runtime so the bridge builds without the vendor SDK installed.
//! Only the analog-in subset needed for record-mode streaming is resolved.

use super::{AcquisitionMode, AcquisitionSetup, AnalogInput, DaqError, DaqState, RecordStatus};
use libloading::Library;
use std::ffi::{c_char, c_double, c_int, c_uchar, CStr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

type Hdwf = c_int;

/// Handle value the driver reports when no device could be opened
const HDWF_NONE: Hdwf = 0;
const ERROR_MSG_LEN: usize = 512;
const SHORT_STRING_LEN: usize = 32;
const ENUMFILTER_ALL: c_int = 0;

type FnString = unsafe extern "C" fn(*mut c_char) -> c_int;
type FnEnum = unsafe extern "C" fn(c_int, *mut c_int) -> c_int;
type FnEnumString = unsafe extern "C" fn(c_int, *mut c_char) -> c_int;
type FnEnumIsOpened = unsafe extern "C" fn(c_int, *mut c_int) -> c_int;
type FnDeviceOpen = unsafe extern "C" fn(c_int, *mut Hdwf) -> c_int;
type FnNoArgs = unsafe extern "C" fn() -> c_int;
type FnHandle = unsafe extern "C" fn(Hdwf) -> c_int;
type FnHandleInt = unsafe extern "C" fn(Hdwf, c_int) -> c_int;
type FnHandleIntInt = unsafe extern "C" fn(Hdwf, c_int, c_int) -> c_int;
type FnHandleIntDouble = unsafe extern "C" fn(Hdwf, c_int, c_double) -> c_int;
type FnHandleDouble = unsafe extern "C" fn(Hdwf, c_double) -> c_int;
type FnHandleDoubleOut = unsafe extern "C" fn(Hdwf, *mut c_double) -> c_int;
type FnStatus = unsafe extern "C" fn(Hdwf, c_int, *mut c_uchar) -> c_int;
type FnStatusRecord = unsafe extern "C" fn(Hdwf, *mut c_int, *mut c_int, *mut c_int) -> c_int;
type FnStatusData16 = unsafe extern "C" fn(Hdwf, c_int, *mut i16, c_int, c_int) -> c_int;

struct DwfApi {
    get_last_error_msg: FnString,
    get_version: FnString,
    enumerate: FnEnum,
    enum_device_name: FnEnumString,
    enum_sn: FnEnumString,
    enum_device_is_opened: FnEnumIsOpened,
    device_open: FnDeviceOpen,
    device_close_all: FnNoArgs,
    device_auto_configure_set: FnHandleInt,
    analog_in_reset: FnHandle,
    analog_in_configure: FnHandleIntInt,
    analog_in_status: FnStatus,
    analog_in_status_record: FnStatusRecord,
    analog_in_status_data16: FnStatusData16,
    analog_in_frequency_set: FnHandleDouble,
    analog_in_frequency_get: FnHandleDoubleOut,
    analog_in_record_length_set: FnHandleDouble,
    analog_in_acquisition_mode_set: FnHandleInt,
    analog_in_channel_enable_set: FnHandleIntInt,
    analog_in_channel_range_set: FnHandleIntDouble,
    analog_in_channel_offset_set: FnHandleIntDouble,
    analog_out_reset: FnHandleInt,
}

/// Copy a function pointer out of the library
///
/// # Safety
/// `T` must match the C signature of `name`.
unsafe fn symbol<T: Copy>(lib: &Library, name: &str) -> Result<T, DaqError> {
    let mut raw = name.as_bytes().to_vec();
    raw.push(0);
    lib.get::<T>(&raw)
        .map(|sym| *sym)
        .map_err(|e| DaqError::MissingSymbol {
            symbol: name.to_string(),
            reason: e.to_string(),
        })
}

impl DwfApi {
    unsafe fn resolve(lib: &Library) -> Result<Self, DaqError> {
        Ok(Self {
            get_last_error_msg: symbol(lib, "FDwfGetLastErrorMsg")?,
            get_version: symbol(lib, "FDwfGetVersion")?,
            enumerate: symbol(lib, "FDwfEnum")?,
            enum_device_name: symbol(lib, "FDwfEnumDeviceName")?,
            enum_sn: symbol(lib, "FDwfEnumSN")?,
            enum_device_is_opened: symbol(lib, "FDwfEnumDeviceIsOpened")?,
            device_open: symbol(lib, "FDwfDeviceOpen")?,
            device_close_all: symbol(lib, "FDwfDeviceCloseAll")?,
            device_auto_configure_set: symbol(lib, "FDwfDeviceAutoConfigureSet")?,
            analog_in_reset: symbol(lib, "FDwfAnalogInReset")?,
            analog_in_configure: symbol(lib, "FDwfAnalogInConfigure")?,
            analog_in_status: symbol(lib, "FDwfAnalogInStatus")?,
            analog_in_status_record: symbol(lib, "FDwfAnalogInStatusRecord")?,
            analog_in_status_data16: symbol(lib, "FDwfAnalogInStatusData16")?,
            analog_in_frequency_set: symbol(lib, "FDwfAnalogInFrequencySet")?,
            analog_in_frequency_get: symbol(lib, "FDwfAnalogInFrequencyGet")?,
            analog_in_record_length_set: symbol(lib, "FDwfAnalogInRecordLengthSet")?,
            analog_in_acquisition_mode_set: symbol(lib, "FDwfAnalogInAcquisitionModeSet")?,
            analog_in_channel_enable_set: symbol(lib, "FDwfAnalogInChannelEnableSet")?,
            analog_in_channel_range_set: symbol(lib, "FDwfAnalogInChannelRangeSet")?,
            analog_in_channel_offset_set: symbol(lib, "FDwfAnalogInChannelOffsetSet")?,
            analog_out_reset: symbol(lib, "FDwfAnalogOutReset")?,
        })
    }
}

/// Attached device as reported by enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaqDeviceInfo {
    pub index: i32,
    pub name: String,
    pub serial: String,
    pub in_use: bool,
}

/// Loaded vendor runtime
pub struct DwfLibrary {
    api: DwfApi,
    path: PathBuf,
    // Keeps the function pointers in `api` valid; absent when `api` is built in-process
    _lib: Option<Library>,
}

impl DwfLibrary {
    /// Platform location of the runtime when no override is configured
    pub fn default_path() -> PathBuf {
        if cfg!(target_os = "windows") {
            PathBuf::from("dwf.dll")
        } else if cfg!(target_os = "macos") {
            PathBuf::from("/Library/Frameworks/dwf.framework/dwf")
        } else {
            PathBuf::from("libdwf.so")
        }
    }

    pub fn load(path: Option<&Path>) -> Result<Self, DaqError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        log::debug!("Loading driver library from {}", path.display());

        // SAFETY: loading runs the library initialisers; the dwf runtime has no unsound ones.
        let lib = unsafe { Library::new(&path) }.map_err(|e| DaqError::LibraryLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        // SAFETY: the aliases in this module mirror the declarations in dwf.h.
        let api = unsafe { DwfApi::resolve(&lib)? };

        Ok(Self {
            api,
            path,
            _lib: Some(lib),
        })
    }

    #[cfg(test)]
    fn from_api(api: DwfApi) -> Self {
        Self {
            api,
            path: PathBuf::from("in-process"),
            _lib: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Text of the driver's most recent error
    pub fn last_error_message(&self) -> String {
        let mut buf = [0u8; ERROR_MSG_LEN];
        // SAFETY: the driver writes at most ERROR_MSG_LEN bytes including the terminator.
        unsafe { (self.api.get_last_error_msg)(buf.as_mut_ptr().cast()) };
        c_buffer_to_string(&buf)
    }

    pub fn version(&self) -> Result<String, DaqError> {
        let mut buf = [0u8; SHORT_STRING_LEN];
        // SAFETY: version strings fit the documented 32-byte buffer.
        let ok = unsafe { (self.api.get_version)(buf.as_mut_ptr().cast()) };
        self.check("FDwfGetVersion", ok)?;
        Ok(c_buffer_to_string(&buf))
    }

    /// List attached devices
    pub fn enumerate(&self) -> Result<Vec<DaqDeviceInfo>, DaqError> {
        let mut count: c_int = 0;
        // SAFETY: count is a valid out pointer.
        let ok = unsafe { (self.api.enumerate)(ENUMFILTER_ALL, &mut count) };
        self.check("FDwfEnum", ok)?;

        let mut devices = Vec::with_capacity(count.max(0) as usize);
        for index in 0..count {
            let mut name = [0u8; SHORT_STRING_LEN];
            let mut serial = [0u8; SHORT_STRING_LEN];
            let mut in_use: c_int = 0;
            // SAFETY: index comes from FDwfEnum and buffers match the 32-byte contract.
            unsafe {
                self.check(
                    "FDwfEnumDeviceName",
                    (self.api.enum_device_name)(index, name.as_mut_ptr().cast()),
                )?;
                self.check(
                    "FDwfEnumSN",
                    (self.api.enum_sn)(index, serial.as_mut_ptr().cast()),
                )?;
                self.check(
                    "FDwfEnumDeviceIsOpened",
                    (self.api.enum_device_is_opened)(index, &mut in_use),
                )?;
            }
            devices.push(DaqDeviceInfo {
                index,
                name: c_buffer_to_string(&name),
                serial: c_buffer_to_string(&serial),
                in_use: in_use != 0,
            });
        }
        Ok(devices)
    }

    fn check(&self, function: &'static str, ret: c_int) -> Result<(), DaqError> {
        if ret != 0 {
            Ok(())
        } else {
            Err(DaqError::Call {
                function,
                message: self.last_error_message(),
            })
        }
    }
}

/// An opened acquisition device
pub struct DwfDevice {
    lib: Arc<DwfLibrary>,
    handle: Hdwf,
    closed: bool,
}

impl DwfDevice {
    /// Open device `index`, or the first available one for -1
    pub fn open(lib: Arc<DwfLibrary>, index: i32) -> Result<Self, DaqError> {
        if index < -1 {
            return Err(DaqError::InvalidArgument(format!(
                "device index {} is out of range",
                index
            )));
        }

        let mut handle: Hdwf = HDWF_NONE;
        // SAFETY: handle is a valid out pointer.
        let ok = unsafe { (lib.api.device_open)(index, &mut handle) };
        if ok == 0 || handle == HDWF_NONE {
            return Err(DaqError::OpenFailed(lib.last_error_message()));
        }

        log::info!("🔌 Opened device {} (handle {})", index, handle);
        Ok(Self {
            lib,
            handle,
            closed: false,
        })
    }

    /// Frequency the device actually settled on, which may differ from the request
    pub fn frequency(&self) -> Result<f64, DaqError> {
        let mut hz: c_double = 0.0;
        // SAFETY: hz is a valid out pointer.
        let ok = unsafe { (self.lib.api.analog_in_frequency_get)(self.handle, &mut hz) };
        self.lib.check("FDwfAnalogInFrequencyGet", ok)?;
        Ok(hz)
    }

    /// Best-effort teardown: stop analog in/out and close every device
    pub fn reset_and_close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let api = &self.lib.api;
        // SAFETY: the handle stays valid until FDwfDeviceCloseAll below.
        unsafe {
            if (api.analog_in_reset)(self.handle) == 0 {
                log::warn!("FDwfAnalogInReset failed: {}", self.lib.last_error_message());
            }
            for channel in 0..2 {
                if (api.analog_out_reset)(self.handle, channel) == 0 {
                    log::warn!(
                        "FDwfAnalogOutReset({}) failed: {}",
                        channel,
                        self.lib.last_error_message()
                    );
                }
            }
            if (api.device_close_all)() == 0 {
                log::warn!("FDwfDeviceCloseAll failed: {}", self.lib.last_error_message());
            }
        }
        log::info!("🔌 Device closed");
    }

    fn call(&self, function: &'static str, ret: c_int) -> Result<(), DaqError> {
        self.lib.check(function, ret)
    }
}

impl AnalogInput for DwfDevice {
    fn configure(&mut self, setup: &AcquisitionSetup) -> Result<(), DaqError> {
        let api = &self.lib.api;
        let h = self.handle;
        let mode = AcquisitionMode::Record;
        log::debug!("Configuring {} acquisition on handle {}", mode, h);

        // SAFETY: plain value arguments on an open handle.
        unsafe {
            // Only apply settings on explicit FDwfAnalogInConfigure calls
            self.call(
                "FDwfDeviceAutoConfigureSet",
                (api.device_auto_configure_set)(h, 0),
            )?;

            for channel in &setup.channels {
                self.call(
                    "FDwfAnalogInChannelEnableSet",
                    (api.analog_in_channel_enable_set)(h, channel.index, 1),
                )?;
                self.call(
                    "FDwfAnalogInChannelRangeSet",
                    (api.analog_in_channel_range_set)(h, channel.index, channel.range_volts),
                )?;
                self.call(
                    "FDwfAnalogInChannelOffsetSet",
                    (api.analog_in_channel_offset_set)(h, channel.index, channel.offset_volts),
                )?;
            }

            self.call(
                "FDwfAnalogInAcquisitionModeSet",
                (api.analog_in_acquisition_mode_set)(h, mode as c_int),
            )?;
            self.call(
                "FDwfAnalogInFrequencySet",
                (api.analog_in_frequency_set)(h, setup.frequency_hz),
            )?;
            self.call(
                "FDwfAnalogInRecordLengthSet",
                (api.analog_in_record_length_set)(h, setup.record_length_secs),
            )?;
            self.call(
                "FDwfAnalogInConfigure",
                (api.analog_in_configure)(h, 1, 0),
            )?;
        }

        match self.frequency() {
            Ok(actual) if (actual - setup.frequency_hz).abs() > 0.5 => log::warn!(
                "Device runs at {:.1} Hz instead of the requested {:.1} Hz",
                actual,
                setup.frequency_hz
            ),
            Ok(_) => {}
            Err(e) => log::debug!("Could not read back acquisition frequency: {}", e),
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), DaqError> {
        // SAFETY: plain value arguments on an open handle.
        let ok = unsafe { (self.lib.api.analog_in_configure)(self.handle, 0, 1) };
        self.call("FDwfAnalogInConfigure", ok)
    }

    fn status(&mut self) -> Result<DaqState, DaqError> {
        let mut raw: c_uchar = 0;
        // SAFETY: raw is a valid out pointer.
        let ok = unsafe { (self.lib.api.analog_in_status)(self.handle, 1, &mut raw) };
        self.call("FDwfAnalogInStatus", ok)?;
        Ok(DaqState::from(raw))
    }

    fn status_record(&mut self) -> Result<RecordStatus, DaqError> {
        let (mut available, mut lost, mut corrupted): (c_int, c_int, c_int) = (0, 0, 0);
        // SAFETY: all three are valid out pointers.
        let ok = unsafe {
            (self.lib.api.analog_in_status_record)(
                self.handle,
                &mut available,
                &mut lost,
                &mut corrupted,
            )
        };
        self.call("FDwfAnalogInStatusRecord", ok)?;
        Ok(RecordStatus {
            available: available.max(0) as usize,
            lost: lost.max(0) as usize,
            corrupted: corrupted.max(0) as usize,
        })
    }

    fn read_channel(&mut self, channel: i32, buffer: &mut [i16]) -> Result<(), DaqError> {
        let count = c_int::try_from(buffer.len()).map_err(|_| {
            DaqError::InvalidArgument(format!("{} samples exceed one read", buffer.len()))
        })?;
        // SAFETY: the driver writes exactly `count` samples into `buffer`.
        let ok = unsafe {
            (self.lib.api.analog_in_status_data16)(
                self.handle,
                channel,
                buffer.as_mut_ptr(),
                0,
                count,
            )
        };
        self.call("FDwfAnalogInStatusData16", ok)
    }
}

impl Drop for DwfDevice {
    fn drop(&mut self) {
        self.reset_and_close();
    }
}

/// Decode a NUL-terminated driver string, tolerating a missing terminator
fn c_buffer_to_string(buf: &[u8]) -> String {
    match CStr::from_bytes_until_nul(buf) {
        Ok(s) => s.to_string_lossy().trim_end().to_string(),
        Err(_) => String::from_utf8_lossy(buf).trim_end().to_string(),
    }
}
