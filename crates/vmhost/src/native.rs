//! [`Engine`] backed by an engine shared library.
//!
//! The library exports `vmhost_engine_api_v1`, a function returning a pointer to a
//! static [`VmEngineApiV1`] table. Strings and buffers the engine hands out are
//! released with the table's `free_string` / `free_buffer`; buffers the host hands
//! out are released with the callbacks in [`VmEmbedderCallbacks`].

use std::cell::RefCell;
use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::fs::File;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use vmhost_contracts::{ENGINE_API_SYMBOL, ENGINE_API_VERSION, ENGINE_LIBRARY_NAME};

use crate::engine::{
    ContextHandle, ContextRequest, ContextSpec, Embedder, Engine, EngineError, EngineErrorKind,
    EngineResult, EntryPoint, InitParams, LibraryHandle, RecordId,
};
use crate::host_io;
use crate::native_lib::SharedLibrary;
use crate::options::{PackageResolution, ServiceBind};
use crate::service::CapturedStream;
use crate::snapshot::{
    FullSnapshot, PrecompiledSnapshot, ScriptSource, SnapshotBlob, SnapshotKind,
};

pub const ENGINE_LIB_ENV: &str = "VMHOST_ENGINE_LIB";

pub const VM_OK: c_int = 0;
pub const VM_API_ERROR: c_int = 1;
pub const VM_COMPILATION_ERROR: c_int = 2;
pub const VM_RESTART_REQUEST: c_int = 3;
pub const VM_ERROR: c_int = 4;

pub const VM_SOURCE_URI: c_int = 0;
pub const VM_SOURCE_TEXT: c_int = 1;
pub const VM_SOURCE_SNAPSHOT: c_int = 2;

type ErrorOut = *mut *mut c_char;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VmBuffer {
    pub ptr: *mut u8,
    pub len: usize,
}

impl VmBuffer {
    const EMPTY: VmBuffer = VmBuffer {
        ptr: ptr::null_mut(),
        len: 0,
    };
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct VmEntryPoint {
    pub library: *const c_char,
    pub class: *const c_char,
    pub function: *const c_char,
}

// -------------------------
// Host callbacks
// -------------------------

#[repr(C)]
pub struct VmEmbedderCallbacks {
    pub user_data: *mut c_void,
    /// Returns 1 and sets `out_context` when created, 0 when declined or failed
    /// (`out_error` is set on failure).
    pub create_context: unsafe extern "C" fn(
        user_data: *mut c_void,
        uri: *const c_char,
        entry: *const c_char,
        package_root: *const c_char,
        package_config: *const c_char,
        out_context: *mut u64,
        out_error: ErrorOut,
    ) -> c_int,
    pub context_teardown: unsafe extern "C" fn(user_data: *mut c_void, record: u64),
    /// Returns 1 when found, 0 when absent, -1 for a name that is not UTF-8.
    pub environment_lookup: unsafe extern "C" fn(
        user_data: *mut c_void,
        name: *const u8,
        name_len: usize,
        out_value: *mut *const u8,
        out_len: *mut usize,
    ) -> c_int,
    pub service_assets: unsafe extern "C" fn(
        user_data: *mut c_void,
        out: *mut VmBuffer,
        out_error: ErrorOut,
    ) -> c_int,
    pub service_request: unsafe extern "C" fn(
        user_data: *mut c_void,
        method: *const c_char,
        keys: *const *const c_char,
        values: *const *const c_char,
        count: usize,
    ) -> *mut c_char,
    pub stream_listen:
        unsafe extern "C" fn(user_data: *mut c_void, stream_id: *const c_char) -> bool,
    pub stream_cancel: unsafe extern "C" fn(user_data: *mut c_void, stream_id: *const c_char),
    pub file_open: unsafe extern "C" fn(name: *const c_char, write: bool) -> *mut c_void,
    pub file_read: unsafe extern "C" fn(file: *mut c_void, out: *mut VmBuffer) -> bool,
    pub file_write: unsafe extern "C" fn(file: *mut c_void, data: *const u8, len: usize) -> bool,
    pub file_close: unsafe extern "C" fn(file: *mut c_void),
    pub entropy: unsafe extern "C" fn(buf: *mut u8, len: usize) -> bool,
    pub free_host_buffer: unsafe extern "C" fn(buf: VmBuffer),
    pub free_host_string: unsafe extern "C" fn(s: *mut c_char),
}

/// Arguments of `initialize`.
///
/// `executable`, `executable_argv` and `working_directory` are only valid for the
/// duration of the call; the engine copies what it keeps. `callbacks` stays valid
/// until `cleanup` returns.
#[repr(C)]
pub struct VmInitParams {
    pub vm_snapshot: *const u8,
    pub vm_snapshot_len: usize,
    pub instructions: *const u8,
    pub data: *const u8,
    pub executable: *const c_char,
    pub executable_argv: *const *const c_char,
    pub executable_argc: usize,
    pub working_directory: *const c_char,
    pub callbacks: *const VmEmbedderCallbacks,
}

// -------------------------
// Engine table
// -------------------------

#[repr(C)]
pub struct VmEngineApiV1 {
    pub version: u32,
    pub version_string: unsafe extern "C" fn() -> *const c_char,
    pub set_flags: unsafe extern "C" fn(argc: usize, argv: *const *const c_char),
    pub start_event_handler: unsafe extern "C" fn(),
    pub stop_event_handler: unsafe extern "C" fn(),
    pub initialize:
        unsafe extern "C" fn(params: *const VmInitParams, out_error: ErrorOut) -> c_int,
    pub cleanup: unsafe extern "C" fn(out_error: ErrorOut) -> c_int,
    pub terminate_exit_code_handler: unsafe extern "C" fn(),
    pub global_exit_code: unsafe extern "C" fn() -> c_int,

    pub create_context: unsafe extern "C" fn(
        uri: *const c_char,
        entry: *const c_char,
        snapshot: *const u8,
        snapshot_len: usize,
        record: u64,
        out_context: *mut u64,
        out_error: ErrorOut,
    ) -> c_int,
    pub is_service_context: unsafe extern "C" fn(context: u64) -> bool,
    pub enter_context: unsafe extern "C" fn(context: u64),
    pub exit_context: unsafe extern "C" fn(),
    pub enter_scope: unsafe extern "C" fn(),
    pub exit_scope: unsafe extern "C" fn(),
    pub shutdown_context: unsafe extern "C" fn(),
    pub make_runnable: unsafe extern "C" fn(context: u64) -> bool,

    pub install_native_resolvers: unsafe extern "C" fn(out_error: ErrorOut) -> c_int,
    pub install_library_tag_handler: unsafe extern "C" fn(out_error: ErrorOut) -> c_int,
    pub install_environment_lookup: unsafe extern "C" fn(out_error: ErrorOut) -> c_int,
    /// `ip` null and `port` -1 mean "no bind address".
    pub setup_service: unsafe extern "C" fn(
        ip: *const c_char,
        port: c_int,
        running_precompiled: bool,
        out_error: ErrorOut,
    ) -> c_int,
    pub prepare_for_script_loading: unsafe extern "C" fn(
        trace_loading: bool,
        out_library: *mut u64,
        out_error: ErrorOut,
    ) -> c_int,
    pub setup_service_load_port: unsafe extern "C" fn(out_error: ErrorOut) -> c_int,
    pub setup_package_resolution: unsafe extern "C" fn(
        package_root: *const c_char,
        package_config: *const c_char,
        out_error: ErrorOut,
    ) -> c_int,
    /// `out_async_id` is -1 when no timing span was opened.
    pub load_script: unsafe extern "C" fn(
        uri: *const c_char,
        source_kind: c_int,
        data: *const u8,
        len: usize,
        out_async_id: *mut i64,
        out_error: ErrorOut,
    ) -> c_int,
    pub timeline_async_end: unsafe extern "C" fn(label: *const c_char, async_id: i64),
    pub run_loop: unsafe extern "C" fn(out_error: ErrorOut) -> c_int,
    pub setup_io_library: unsafe extern "C" fn(uri: *const c_char, out_error: ErrorOut) -> c_int,

    pub builtin_library:
        unsafe extern "C" fn(out_library: *mut u64, out_error: ErrorOut) -> c_int,
    pub has_root_library: unsafe extern "C" fn() -> bool,
    pub import_root_library: unsafe extern "C" fn(builtin: u64, out_error: ErrorOut) -> c_int,
    pub load_service_for_precompilation: unsafe extern "C" fn(out_error: ErrorOut) -> c_int,
    pub compile_all: unsafe extern "C" fn(out_error: ErrorOut) -> c_int,
    pub precompile: unsafe extern "C" fn(
        entry_points: *const VmEntryPoint,
        count: usize,
        reset_fields: bool,
        out_error: ErrorOut,
    ) -> c_int,
    pub start_main: unsafe extern "C" fn(
        builtin: u64,
        argc: usize,
        argv: *const *const c_char,
        out_error: ErrorOut,
    ) -> c_int,
    pub invoke_io_service_handler: unsafe extern "C" fn(
        keys: *const *const c_char,
        values: *const *const c_char,
        count: usize,
        out_json: *mut *mut c_char,
        out_error: ErrorOut,
    ) -> c_int,
    /// `stream_id` is `Stdout` or `Stderr`.
    pub set_stream_capture: unsafe extern "C" fn(stream_id: *const c_char, enabled: bool),

    pub create_script_snapshot:
        unsafe extern "C" fn(out: *mut VmBuffer, out_error: ErrorOut) -> c_int,
    pub create_full_snapshot: unsafe extern "C" fn(
        vm: *mut VmBuffer,
        context: *mut VmBuffer,
        out_error: ErrorOut,
    ) -> c_int,
    pub create_precompiled_snapshot: unsafe extern "C" fn(
        vm: *mut VmBuffer,
        context: *mut VmBuffer,
        instructions: *mut VmBuffer,
        out_error: ErrorOut,
    ) -> c_int,

    pub free_buffer: unsafe extern "C" fn(buf: VmBuffer),
    pub free_string: unsafe extern "C" fn(s: *mut c_char),
}

type GetEngineApi = unsafe extern "C" fn() -> *const VmEngineApiV1;

/// Interior NUL bytes cannot cross the ABI; they are dropped.
fn lossy_cstring(s: &str) -> CString {
    CString::new(s.replace('\0', "")).unwrap_or_default()
}

struct CStringArray {
    _owned: Vec<CString>,
    ptrs: Vec<*const c_char>,
}

impl CStringArray {
    fn new<S: AsRef<str>>(items: &[S]) -> Self {
        let owned: Vec<CString> = items.iter().map(|s| lossy_cstring(s.as_ref())).collect();
        let ptrs = owned.iter().map(|s| s.as_ptr()).collect();
        CStringArray {
            _owned: owned,
            ptrs,
        }
    }

    fn len(&self) -> usize {
        self.ptrs.len()
    }

    fn as_ptr(&self) -> *const *const c_char {
        if self.ptrs.is_empty() {
            ptr::null()
        } else {
            self.ptrs.as_ptr()
        }
    }
}

unsafe fn opt_str<'a>(p: *const c_char) -> Option<&'a str> {
    if p.is_null() {
        return None;
    }
    CStr::from_ptr(p).to_str().ok()
}

unsafe fn set_error(out: ErrorOut, message: &str) {
    if !out.is_null() {
        *out = lossy_cstring(message).into_raw();
    }
}

fn host_buffer(bytes: Vec<u8>) -> VmBuffer {
    let boxed = bytes.into_boxed_slice();
    let len = boxed.len();
    VmBuffer {
        ptr: Box::into_raw(boxed) as *mut u8,
        len,
    }
}

/// Runs a callback body; unwinding into the engine is never allowed.
fn guard<R>(f: impl FnOnce() -> R) -> R {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|_| std::process::abort())
}

struct EmbedderSlot {
    engine: *const NativeEngine,
    embedder: Arc<dyn Embedder>,
    callbacks: VmEmbedderCallbacks,
}

unsafe fn slot<'a>(user_data: *mut c_void) -> &'a EmbedderSlot {
    &*(user_data as *const EmbedderSlot)
}

unsafe extern "C" fn cb_create_context(
    user_data: *mut c_void,
    uri: *const c_char,
    entry: *const c_char,
    package_root: *const c_char,
    package_config: *const c_char,
    out_context: *mut u64,
    out_error: ErrorOut,
) -> c_int {
    guard(|| unsafe {
        let slot = slot(user_data);
        let Some(uri) = opt_str(uri) else {
            set_error(out_error, "context URI is not valid UTF-8");
            return 0;
        };
        let request = ContextRequest {
            uri,
            entry: opt_str(entry).unwrap_or("main"),
            package_root: opt_str(package_root),
            package_config: opt_str(package_config),
        };
        match slot.embedder.create_context(&*slot.engine, &request) {
            Ok(Some(handle)) => {
                if !out_context.is_null() {
                    *out_context = handle.0;
                }
                1
            }
            Ok(None) => 0,
            Err(message) => {
                set_error(out_error, &message);
                0
            }
        }
    })
}

unsafe extern "C" fn cb_context_teardown(user_data: *mut c_void, record: u64) {
    guard(|| unsafe { slot(user_data).embedder.context_teardown(RecordId(record)) })
}

unsafe extern "C" fn cb_environment_lookup(
    user_data: *mut c_void,
    name: *const u8,
    name_len: usize,
    out_value: *mut *const u8,
    out_len: *mut usize,
) -> c_int {
    guard(|| unsafe {
        if out_value.is_null() || out_len.is_null() {
            return -1;
        }
        let name = if name.is_null() {
            &[][..]
        } else {
            std::slice::from_raw_parts(name, name_len)
        };
        match slot(user_data).embedder.environment_lookup(name) {
            Ok(Some(value)) => {
                *out_value = value.as_ptr();
                *out_len = value.len();
                1
            }
            Ok(None) => 0,
            Err(_) => -1,
        }
    })
}

unsafe extern "C" fn cb_service_assets(
    user_data: *mut c_void,
    out: *mut VmBuffer,
    out_error: ErrorOut,
) -> c_int {
    guard(|| unsafe {
        match slot(user_data).embedder.service_assets() {
            Ok(bytes) => {
                *out = host_buffer(bytes);
                VM_OK
            }
            Err(message) => {
                set_error(out_error, &message);
                VM_ERROR
            }
        }
    })
}

unsafe extern "C" fn cb_service_request(
    user_data: *mut c_void,
    method: *const c_char,
    keys: *const *const c_char,
    values: *const *const c_char,
    count: usize,
) -> *mut c_char {
    guard(|| unsafe {
        let slot = slot(user_data);
        let Some(method) = opt_str(method) else {
            return ptr::null_mut();
        };
        let count = if keys.is_null() || values.is_null() {
            0
        } else {
            count
        };
        let mut params = Vec::with_capacity(count);
        for i in 0..count {
            let key = opt_str(*keys.add(i)).unwrap_or_default();
            let value = opt_str(*values.add(i)).unwrap_or_default();
            params.push((key, value));
        }
        match slot.embedder.service_request(&*slot.engine, method, &params) {
            Some(response) => lossy_cstring(&response).into_raw(),
            None => ptr::null_mut(),
        }
    })
}

unsafe extern "C" fn cb_stream_listen(user_data: *mut c_void, stream_id: *const c_char) -> bool {
    guard(|| unsafe {
        let slot = slot(user_data);
        opt_str(stream_id).is_some_and(|id| slot.embedder.stream_listen(&*slot.engine, id))
    })
}

unsafe extern "C" fn cb_stream_cancel(user_data: *mut c_void, stream_id: *const c_char) {
    guard(|| unsafe {
        let slot = slot(user_data);
        if let Some(id) = opt_str(stream_id) {
            slot.embedder.stream_cancel(&*slot.engine, id);
        }
    })
}

unsafe extern "C" fn cb_file_open(name: *const c_char, write: bool) -> *mut c_void {
    guard(|| unsafe {
        let Some(name) = opt_str(name) else {
            return ptr::null_mut();
        };
        match host_io::open_file(Path::new(name), write) {
            Ok(file) => Box::into_raw(Box::new(file)) as *mut c_void,
            Err(_) => ptr::null_mut(),
        }
    })
}

unsafe extern "C" fn cb_file_read(file: *mut c_void, out: *mut VmBuffer) -> bool {
    guard(|| unsafe {
        if file.is_null() || out.is_null() {
            return false;
        }
        let file = &mut *(file as *mut File);
        match host_io::read_file(file) {
            Ok(bytes) => {
                *out = host_buffer(bytes);
                true
            }
            Err(_) => false,
        }
    })
}

unsafe extern "C" fn cb_file_write(file: *mut c_void, data: *const u8, len: usize) -> bool {
    guard(|| unsafe {
        if file.is_null() || (data.is_null() && len > 0) {
            return false;
        }
        let file = &mut *(file as *mut File);
        let bytes = if len == 0 {
            &[][..]
        } else {
            std::slice::from_raw_parts(data, len)
        };
        host_io::write_file(file, bytes).is_ok()
    })
}

unsafe extern "C" fn cb_file_close(file: *mut c_void) {
    guard(|| unsafe {
        if !file.is_null() {
            drop(Box::from_raw(file as *mut File));
        }
    })
}

unsafe extern "C" fn cb_entropy(buf: *mut u8, len: usize) -> bool {
    guard(|| unsafe {
        if buf.is_null() {
            return len == 0;
        }
        host_io::fill_entropy(std::slice::from_raw_parts_mut(buf, len))
    })
}

unsafe extern "C" fn cb_free_host_buffer(buf: VmBuffer) {
    guard(|| unsafe {
        if !buf.ptr.is_null() {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(buf.ptr, buf.len)));
        }
    })
}

unsafe extern "C" fn cb_free_host_string(s: *mut c_char) {
    guard(|| unsafe {
        if !s.is_null() {
            drop(CString::from_raw(s));
        }
    })
}

// -------------------------
// Engine adapter
// -------------------------

/// An engine loaded from a shared library.
///
/// The value must stay in place between `initialize` and `cleanup`: engine
/// callbacks reach it through its address.
pub struct NativeEngine {
    api: *const VmEngineApiV1,
    slot: RefCell<Option<Box<EmbedderSlot>>>,
    // Keeps `api` mapped.
    _library: SharedLibrary,
}

impl NativeEngine {
    pub fn load(path: &Path) -> Result<Self> {
        let library = SharedLibrary::open(path).map_err(|reason| {
            anyhow::anyhow!("failed to load engine library {}: {reason}", path.display())
        })?;
        let sym = library
            .symbol(ENGINE_API_SYMBOL)
            .with_context(|| format!("{} does not export {ENGINE_API_SYMBOL}", path.display()))?;
        // SAFETY: the exported symbol has the `GetEngineApi` signature.
        let get_api: GetEngineApi = unsafe { std::mem::transmute(sym.as_ptr()) };
        let api = unsafe { get_api() };
        if api.is_null() {
            bail!("{ENGINE_API_SYMBOL} returned no function table");
        }
        let version = unsafe { (*api).version };
        if version != ENGINE_API_VERSION {
            bail!(
                "engine library {} speaks ABI version {version}, expected {ENGINE_API_VERSION}",
                path.display()
            );
        }
        Ok(NativeEngine {
            api,
            slot: RefCell::new(None),
            _library: library,
        })
    }

    pub fn locate_and_load() -> Result<Self> {
        let path = locate_engine_library()?;
        Self::load(&path)
    }

    fn api(&self) -> &VmEngineApiV1 {
        // SAFETY: the table is static data of the library, which lives as long as self.
        unsafe { &*self.api }
    }

    fn take_string(&self, s: *mut c_char) -> Option<String> {
        if s.is_null() {
            return None;
        }
        let out = unsafe { CStr::from_ptr(s) }.to_string_lossy().into_owned();
        unsafe { (self.api().free_string)(s) };
        Some(out)
    }

    fn take_buffer(&self, kind: SnapshotKind, buf: VmBuffer) -> SnapshotBlob {
        if buf.ptr.is_null() {
            return SnapshotBlob::new(kind, Vec::new());
        }
        let bytes = unsafe { std::slice::from_raw_parts(buf.ptr, buf.len) }.to_vec();
        unsafe { (self.api().free_buffer)(buf) };
        SnapshotBlob::new(kind, bytes)
    }

    /// Calls an engine function that reports status plus an optional message.
    fn call(&self, f: impl FnOnce(ErrorOut) -> c_int) -> EngineResult<()> {
        let mut err: *mut c_char = ptr::null_mut();
        let code = f(&mut err);
        let message = self.take_string(err);
        if code == VM_OK {
            return Ok(());
        }
        let kind = EngineErrorKind::classify(
            code == VM_RESTART_REQUEST,
            code == VM_COMPILATION_ERROR,
            code == VM_API_ERROR,
        );
        Err(EngineError::new(
            kind,
            message.unwrap_or_else(|| format!("engine call failed with status {code}")),
        ))
    }

    fn call_str(&self, f: impl FnOnce(ErrorOut) -> c_int) -> Result<(), String> {
        self.call(f).map_err(|err| err.message)
    }
}

impl Engine for NativeEngine {
    fn version(&self) -> String {
        let s = unsafe { (self.api().version_string)() };
        unsafe { opt_str(s) }.unwrap_or("unknown").to_string()
    }

    fn set_flags(&self, flags: &[String]) {
        let argv = CStringArray::new(flags);
        unsafe { (self.api().set_flags)(argv.len(), argv.as_ptr()) }
    }

    fn start_event_handler(&self) {
        unsafe { (self.api().start_event_handler)() }
    }

    fn stop_event_handler(&self) {
        unsafe { (self.api().stop_event_handler)() }
    }

    fn initialize(
        &self,
        params: InitParams<'_>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<(), String> {
        let mut slot = Box::new(EmbedderSlot {
            engine: self as *const NativeEngine,
            embedder,
            callbacks: VmEmbedderCallbacks {
                user_data: ptr::null_mut(),
                create_context: cb_create_context,
                context_teardown: cb_context_teardown,
                environment_lookup: cb_environment_lookup,
                service_assets: cb_service_assets,
                service_request: cb_service_request,
                stream_listen: cb_stream_listen,
                stream_cancel: cb_stream_cancel,
                file_open: cb_file_open,
                file_read: cb_file_read,
                file_write: cb_file_write,
                file_close: cb_file_close,
                entropy: cb_entropy,
                free_host_buffer: cb_free_host_buffer,
                free_host_string: cb_free_host_string,
            },
        });
        slot.callbacks.user_data = &*slot as *const EmbedderSlot as *mut c_void;

        let executable = lossy_cstring(params.executable);
        let argv = CStringArray::new(params.executable_args);
        let cwd = lossy_cstring(&params.working_directory.to_string_lossy());
        let (vm_ptr, vm_len) = match params.vm_snapshot {
            Some(bytes) => (bytes.as_ptr(), bytes.len()),
            None => (ptr::null(), 0),
        };
        let raw = VmInitParams {
            vm_snapshot: vm_ptr,
            vm_snapshot_len: vm_len,
            instructions: params.instructions.map_or(ptr::null(), |s| s.0),
            data: params.data.map_or(ptr::null(), |s| s.0),
            executable: executable.as_ptr(),
            executable_argv: argv.as_ptr(),
            executable_argc: argv.len(),
            working_directory: cwd.as_ptr(),
            callbacks: &slot.callbacks,
        };
        // The engine may call back during initialization.
        *self.slot.borrow_mut() = Some(slot);
        let result = self.call_str(|err| unsafe { (self.api().initialize)(&raw, err) });
        if result.is_err() {
            self.slot.borrow_mut().take();
        }
        result
    }

    fn cleanup(&self) -> Result<(), String> {
        let result = self.call_str(|err| unsafe { (self.api().cleanup)(err) });
        self.slot.borrow_mut().take();
        result
    }

    fn terminate_exit_code_handler(&self) {
        unsafe { (self.api().terminate_exit_code_handler)() }
    }

    fn global_exit_code(&self) -> i32 {
        unsafe { (self.api().global_exit_code)() }
    }

    fn create_context(&self, spec: ContextSpec<'_>) -> Result<ContextHandle, String> {
        let uri = lossy_cstring(spec.uri);
        let entry = lossy_cstring(spec.entry);
        let (snap_ptr, snap_len) = match spec.snapshot {
            Some(bytes) => (bytes.as_ptr(), bytes.len()),
            None => (ptr::null(), 0),
        };
        let mut handle = 0u64;
        self.call_str(|err| unsafe {
            (self.api().create_context)(
                uri.as_ptr(),
                entry.as_ptr(),
                snap_ptr,
                snap_len,
                spec.record.0,
                &mut handle,
                err,
            )
        })?;
        Ok(ContextHandle(handle))
    }

    fn is_service_context(&self, context: ContextHandle) -> bool {
        unsafe { (self.api().is_service_context)(context.0) }
    }

    fn enter_context(&self, context: ContextHandle) {
        unsafe { (self.api().enter_context)(context.0) }
    }

    fn exit_context(&self) {
        unsafe { (self.api().exit_context)() }
    }

    fn enter_scope(&self) {
        unsafe { (self.api().enter_scope)() }
    }

    fn exit_scope(&self) {
        unsafe { (self.api().exit_scope)() }
    }

    fn shutdown_context(&self) {
        unsafe { (self.api().shutdown_context)() }
    }

    fn make_runnable(&self, context: ContextHandle) -> bool {
        unsafe { (self.api().make_runnable)(context.0) }
    }

    fn install_native_resolvers(&self) -> EngineResult<()> {
        self.call(|err| unsafe { (self.api().install_native_resolvers)(err) })
    }

    fn install_library_tag_handler(&self) -> EngineResult<()> {
        self.call(|err| unsafe { (self.api().install_library_tag_handler)(err) })
    }

    fn install_environment_lookup(&self) -> EngineResult<()> {
        self.call(|err| unsafe { (self.api().install_environment_lookup)(err) })
    }

    fn setup_service(
        &self,
        bind: Option<&ServiceBind>,
        running_precompiled: bool,
    ) -> Result<(), String> {
        let ip = bind.map(|b| lossy_cstring(&b.ip));
        let port = bind.map_or(-1, |b| c_int::from(b.port));
        self.call_str(|err| unsafe {
            (self.api().setup_service)(
                ip.as_ref().map_or(ptr::null(), |ip| ip.as_ptr()),
                port,
                running_precompiled,
                err,
            )
        })
    }

    fn prepare_for_script_loading(&self, trace_loading: bool) -> EngineResult<LibraryHandle> {
        let mut lib = 0u64;
        self.call(|err| unsafe {
            (self.api().prepare_for_script_loading)(trace_loading, &mut lib, err)
        })?;
        Ok(LibraryHandle(lib))
    }

    fn setup_service_load_port(&self) -> EngineResult<()> {
        self.call(|err| unsafe { (self.api().setup_service_load_port)(err) })
    }

    fn setup_package_resolution(&self, packages: &PackageResolution) -> EngineResult<()> {
        let root = packages.root().map(lossy_cstring);
        let map = packages.map().map(lossy_cstring);
        self.call(|err| unsafe {
            (self.api().setup_package_resolution)(
                root.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
                map.as_ref().map_or(ptr::null(), |s| s.as_ptr()),
                err,
            )
        })
    }

    fn load_script(&self, uri: &str, source: &ScriptSource) -> EngineResult<Option<i64>> {
        let c_uri = lossy_cstring(uri);
        let (kind, data): (c_int, &[u8]) = match source {
            ScriptSource::Uri => (VM_SOURCE_URI, &[][..]),
            ScriptSource::Text(bytes) => (VM_SOURCE_TEXT, bytes.as_slice()),
            ScriptSource::Snapshot(bytes) => (VM_SOURCE_SNAPSHOT, bytes.as_slice()),
        };
        let mut async_id: i64 = -1;
        self.call(|err| unsafe {
            (self.api().load_script)(
                c_uri.as_ptr(),
                kind,
                data.as_ptr(),
                data.len(),
                &mut async_id,
                err,
            )
        })?;
        Ok((async_id >= 0).then_some(async_id))
    }

    fn timeline_async_end(&self, label: &str, async_id: i64) {
        let label = lossy_cstring(label);
        unsafe { (self.api().timeline_async_end)(label.as_ptr(), async_id) }
    }

    fn run_loop(&self) -> EngineResult<()> {
        self.call(|err| unsafe { (self.api().run_loop)(err) })
    }

    fn setup_io_library(&self, uri: &str) -> EngineResult<()> {
        let uri = lossy_cstring(uri);
        self.call(|err| unsafe { (self.api().setup_io_library)(uri.as_ptr(), err) })
    }

    fn builtin_library(&self) -> EngineResult<LibraryHandle> {
        let mut lib = 0u64;
        self.call(|err| unsafe { (self.api().builtin_library)(&mut lib, err) })?;
        Ok(LibraryHandle(lib))
    }

    fn has_root_library(&self) -> bool {
        unsafe { (self.api().has_root_library)() }
    }

    fn import_root_library(&self, builtin: LibraryHandle) -> EngineResult<()> {
        self.call(|err| unsafe { (self.api().import_root_library)(builtin.0, err) })
    }

    fn load_service_for_precompilation(&self) -> Result<(), String> {
        self.call_str(|err| unsafe { (self.api().load_service_for_precompilation)(err) })
    }

    fn compile_all(&self) -> EngineResult<()> {
        self.call(|err| unsafe { (self.api().compile_all)(err) })
    }

    fn precompile(&self, entry_points: &[EntryPoint], reset_fields: bool) -> EngineResult<()> {
        let names: Vec<[CString; 3]> = entry_points
            .iter()
            .map(|e| {
                [
                    lossy_cstring(e.library),
                    lossy_cstring(e.class),
                    lossy_cstring(e.function),
                ]
            })
            .collect();
        let table: Vec<VmEntryPoint> = names
            .iter()
            .map(|[library, class, function]| VmEntryPoint {
                library: library.as_ptr(),
                class: class.as_ptr(),
                function: function.as_ptr(),
            })
            .collect();
        self.call(|err| unsafe {
            (self.api().precompile)(table.as_ptr(), table.len(), reset_fields, err)
        })
    }

    fn start_main(&self, builtin: LibraryHandle, args: &[String]) -> EngineResult<()> {
        let argv = CStringArray::new(args);
        self.call(|err| unsafe {
            (self.api().start_main)(builtin.0, argv.len(), argv.as_ptr(), err)
        })
    }

    fn invoke_io_service_handler(&self, keys: &[&str], values: &[&str]) -> EngineResult<String> {
        let keys = CStringArray::new(keys);
        let values = CStringArray::new(values);
        let mut json: *mut c_char = ptr::null_mut();
        self.call(|err| unsafe {
            (self.api().invoke_io_service_handler)(
                keys.as_ptr(),
                values.as_ptr(),
                keys.len().min(values.len()),
                &mut json,
                err,
            )
        })?;
        Ok(self.take_string(json).unwrap_or_default())
    }

    fn set_stream_capture(&self, stream: CapturedStream, enabled: bool) {
        let id = lossy_cstring(stream.id());
        unsafe { (self.api().set_stream_capture)(id.as_ptr(), enabled) }
    }

    fn create_script_snapshot(&self) -> EngineResult<SnapshotBlob> {
        let mut buf = VmBuffer::EMPTY;
        self.call(|err| unsafe { (self.api().create_script_snapshot)(&mut buf, err) })?;
        Ok(self.take_buffer(SnapshotKind::ContextHeap, buf))
    }

    fn create_full_snapshot(&self) -> EngineResult<FullSnapshot> {
        let mut vm = VmBuffer::EMPTY;
        let mut context = VmBuffer::EMPTY;
        self.call(|err| unsafe {
            (self.api().create_full_snapshot)(&mut vm, &mut context, err)
        })?;
        Ok(FullSnapshot {
            vm: self.take_buffer(SnapshotKind::VmGlobals, vm),
            context: self.take_buffer(SnapshotKind::ContextHeap, context),
        })
    }

    fn create_precompiled_snapshot(&self) -> EngineResult<PrecompiledSnapshot> {
        let mut vm = VmBuffer::EMPTY;
        let mut context = VmBuffer::EMPTY;
        let mut instructions = VmBuffer::EMPTY;
        self.call(|err| unsafe {
            (self.api().create_precompiled_snapshot)(&mut vm, &mut context, &mut instructions, err)
        })?;
        Ok(PrecompiledSnapshot {
            vm: self.take_buffer(SnapshotKind::VmGlobals, vm),
            context: self.take_buffer(SnapshotKind::ContextHeap, context),
            instructions: self.take_buffer(SnapshotKind::CompiledInstructions, instructions),
        })
    }
}

// -------------------------
// Library discovery
// -------------------------

pub fn locate_engine_library() -> Result<PathBuf> {
    let env_override = std::env::var_os(ENGINE_LIB_ENV).map(PathBuf::from);
    locate_engine_library_from(env_override, std::env::current_exe().ok().as_deref())
}

pub fn locate_engine_library_from(
    env_override: Option<PathBuf>,
    exe: Option<&Path>,
) -> Result<PathBuf> {
    if let Some(path) = env_override {
        if path.is_file() {
            return Ok(path);
        }
        bail!(
            "{ENGINE_LIB_ENV} points at {}, which is not a file",
            path.display()
        );
    }

    let mut checked: Vec<PathBuf> = Vec::new();
    if let Some(exe_dir) = exe.and_then(Path::parent) {
        for cand in [
            exe_dir.join(ENGINE_LIBRARY_NAME),
            exe_dir.join("..").join("lib").join(ENGINE_LIBRARY_NAME),
        ] {
            checked.push(cand.clone());
            if cand.is_file() {
                return Ok(cand);
            }
        }
    }

    let checked = checked
        .into_iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");
    bail!(
        "could not locate the engine library {ENGINE_LIBRARY_NAME}\n\n\
         looked for:\n{checked}\n\n\
         fix:\n  - set {ENGINE_LIB_ENV} to the library path, or\n  \
         - install the library next to the vmhost executable"
    );
}
