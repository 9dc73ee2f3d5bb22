//! DeepStream NvDsSR bindings
//!
//! `libnvdsgst_smartrecord.so` is loaded at runtime so the agent still runs
//! (with the managed backend disabled) on machines without DeepStream.

use libloading::Library;
use std::ffi::{c_char, c_int, c_uint, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{deliver_completion, deliver_fault, Container, NativePtr, RecordingInfo};
use crate::backend::{EngineParams, RecordBin, RecordContext, RecordEngine};
use crate::error::{Result, SmartRecError};

/// Where DeepStream 6/7 installs the smart record library
pub const DEFAULT_LIBRARY_PATHS: &[&str] =
    &["/opt/nvidia/deepstream/deepstream/lib/libnvdsgst_smartrecord.so"];

type NvDsSRCallbackFunc =
    unsafe extern "C" fn(info: *mut NvDsSRRecordingInfo, user_data: *mut c_void) -> *mut c_void;

#[repr(C)]
struct NvDsSRInitParams {
    callback: Option<NvDsSRCallbackFunc>,
    container_type: c_int,
    width: c_uint,
    height: c_uint,
    file_name_prefix: *mut c_char,
    dirpath: *mut c_char,
    default_duration: c_uint,
    cache_size: c_uint,
}

/// Only the leading `recordbin` field is read; the rest stays opaque.
#[repr(C)]
struct NvDsSRContext {
    recordbin: *mut c_void,
    _opaque: [u8; 0],
}

#[repr(C)]
#[allow(dead_code)]
struct NvDsSRRecordingInfo {
    ctx: *mut NvDsSRContext,
    session_id: c_uint,
    filename: *mut c_char,
    dirpath: *mut c_char,
    duration: u64,
    container_type: c_int,
    width: c_uint,
    height: c_uint,
    contains_video: c_int,
    channels: c_uint,
    sampling_rate: c_uint,
    contains_audio: c_int,
}

type CreateFn = unsafe extern "C" fn(*mut *mut NvDsSRContext, *mut NvDsSRInitParams) -> c_int;
type StartFn =
    unsafe extern "C" fn(*mut NvDsSRContext, *mut c_uint, c_uint, c_uint, *mut c_void) -> c_int;
type StopFn = unsafe extern "C" fn(*mut NvDsSRContext, c_uint) -> c_int;
type DestroyFn = unsafe extern "C" fn(*mut NvDsSRContext) -> c_int;

#[derive(Clone, Copy)]
struct SrApi {
    create: CreateFn,
    start: StartFn,
    stop: StopFn,
    destroy: DestroyFn,
}

/// Loaded smart record library
pub struct NvDsSrLibrary {
    lib: Arc<Library>,
    api: SrApi,
    path: PathBuf,
}

impl NvDsSrLibrary {
    /// Try each candidate path in order.
    ///
    /// Failure is reported as `BackendUnavailable`; callers cache it for the
    /// lifetime of the process.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        let mut failures = Vec::new();
        for candidate in candidates {
            let path = candidate.as_ref();
            // SAFETY: loading runs the library's initializers; the DeepStream
            // library has no initializers with preconditions on our side.
            match unsafe { Self::load_from(path) } {
                Ok(library) => {
                    info!("Loaded NvDsSR library from {:?}", path);
                    return Ok(library);
                }
                Err(e) => {
                    debug!("NvDsSR library not usable at {:?}: {}", path, e);
                    failures.push(format!("{}: {}", path.display(), e));
                }
            }
        }

        if failures.is_empty() {
            failures.push("no candidate paths configured".to_string());
        }
        Err(SmartRecError::BackendUnavailable(failures.join("; ")))
    }

    unsafe fn load_from(path: &Path) -> std::result::Result<Self, libloading::Error> {
        let lib = Library::new(path)?;
        let api = SrApi {
            create: *lib.get::<CreateFn>(b"NvDsSRCreate\0")?,
            start: *lib.get::<StartFn>(b"NvDsSRStart\0")?,
            stop: *lib.get::<StopFn>(b"NvDsSRStop\0")?,
            destroy: *lib.get::<DestroyFn>(b"NvDsSRDestroy\0")?,
        };
        Ok(Self {
            lib: Arc::new(lib),
            api,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordEngine for NvDsSrLibrary {
    fn name(&self) -> &'static str {
        "nvds"
    }

    fn create(&self, params: &EngineParams) -> Result<Box<dyn RecordContext>> {
        let prefix = c_string(&params.file_prefix, "smart-rec-file-prefix")?;
        let dirpath = c_string(&params.directory.to_string_lossy(), "smart-rec-dir-path")?;

        // Init params and their strings must outlive the context.
        let mut init = Box::new(NvDsSRInitParams {
            callback: Some(record_done_trampoline),
            container_type: params.container.as_native(),
            width: params.width,
            height: params.height,
            file_name_prefix: prefix.as_ptr() as *mut c_char,
            dirpath: dirpath.as_ptr() as *mut c_char,
            default_duration: params.default_duration_seconds,
            cache_size: params.cache_seconds,
        });

        let mut raw: *mut NvDsSRContext = std::ptr::null_mut();
        // SAFETY: `raw` is a valid out-pointer and `init` is live for the call
        // and for the lifetime of the returned context.
        let status = unsafe { (self.api.create)(&mut raw, init.as_mut()) };
        if status != 0 || raw.is_null() {
            return Err(SmartRecError::NativeCall {
                call: "NvDsSRCreate",
                status,
            });
        }

        // SAFETY: create succeeded, so `raw` points to a live context.
        let recordbin = unsafe { (*raw).recordbin };
        Ok(Box::new(NvDsRecordContext {
            _lib: Arc::clone(&self.lib),
            api: self.api,
            raw,
            recordbin: NativePtr::from_raw(recordbin),
            _init: init,
            _prefix: prefix,
            _dirpath: dirpath,
        }))
    }
}

struct NvDsRecordContext {
    _lib: Arc<Library>,
    api: SrApi,
    raw: *mut NvDsSRContext,
    recordbin: NativePtr,
    _init: Box<NvDsSRInitParams>,
    _prefix: CString,
    _dirpath: CString,
}

// SAFETY: NvDsSR contexts may be driven from any thread as long as calls on
// one context are serialized, which `&mut self` guarantees.
unsafe impl Send for NvDsRecordContext {}

impl RecordContext for NvDsRecordContext {
    fn record_bin(&self) -> Option<RecordBin> {
        if self.recordbin.is_null() {
            None
        } else {
            Some(RecordBin::Element(self.recordbin))
        }
    }

    fn start(&mut self, back_seconds: u32, duration_seconds: u32, user_data: NativePtr) -> Result<u32> {
        let mut session_id: c_uint = 0;
        // SAFETY: `raw` is live until destroy; user_data is pinned by the caller.
        let status = unsafe {
            (self.api.start)(
                self.raw,
                &mut session_id,
                back_seconds,
                duration_seconds,
                user_data.as_raw(),
            )
        };
        if status != 0 {
            return Err(SmartRecError::NativeCall {
                call: "NvDsSRStart",
                status,
            });
        }
        Ok(session_id)
    }

    fn stop(&mut self, session_id: u32) -> Result<bool> {
        // SAFETY: `raw` is live until destroy.
        let status = unsafe { (self.api.stop)(self.raw, session_id) };
        if status != 0 {
            return Err(SmartRecError::NativeCall {
                call: "NvDsSRStop",
                status,
            });
        }
        Ok(true)
    }

    fn destroy(self: Box<Self>) -> Result<()> {
        // SAFETY: `raw` came from NvDsSRCreate and is destroyed exactly once.
        let status = unsafe { (self.api.destroy)(self.raw) };
        if status != 0 {
            return Err(SmartRecError::NativeCall {
                call: "NvDsSRDestroy",
                status,
            });
        }
        Ok(())
    }
}

unsafe extern "C" fn record_done_trampoline(
    info: *mut NvDsSRRecordingInfo,
    user_data: *mut c_void,
) -> *mut c_void {
    let result = catch_unwind(AssertUnwindSafe(|| {
        if info.is_null() {
            // SAFETY: user_data is the pinned context passed to NvDsSRStart.
            unsafe { deliver_fault(user_data, "NvDsSR reported a null recording info".into()) };
            return;
        }
        // SAFETY: NvDsSR hands us a valid info block for the callback's duration.
        let info = unsafe { recording_info(&*info) };
        // SAFETY: as above.
        unsafe { deliver_completion(user_data, info) };
    }));

    if result.is_err() {
        error!("Panic in NvDsSR completion callback");
    }
    std::ptr::null_mut()
}

unsafe fn recording_info(raw: &NvDsSRRecordingInfo) -> RecordingInfo {
    RecordingInfo {
        session_id: raw.session_id,
        filename: lossy(raw.filename),
        dirpath: PathBuf::from(lossy(raw.dirpath)),
        duration: Duration::from_millis(raw.duration),
        container: Container::from_native(raw.container_type),
        width: raw.width,
        height: raw.height,
    }
}

unsafe fn lossy(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

fn c_string(value: &str, name: &'static str) -> Result<CString> {
    CString::new(value).map_err(|_| SmartRecError::Source {
        operation: name,
        reason: "contains an interior NUL byte".to_string(),
    })
}
