//! Minimal OpenCL 1.2 host API FFI used by the accelerator runtime.

#![allow(non_camel_case_types)]

use std::ffi::c_void;
#[cfg(target_os = "linux")]
use std::ffi::{CStr, CString, c_char};
use std::sync::OnceLock;

use accelflow_core::error::{EngineError, Result};

pub type cl_int = i32;
pub type cl_uint = u32;
pub type cl_bool = cl_uint;
pub type cl_bitfield = u64;
pub type cl_platform_id = *mut c_void;
pub type cl_device_id = *mut c_void;
pub type cl_context = *mut c_void;
pub type cl_command_queue = *mut c_void;
pub type cl_program = *mut c_void;
pub type cl_kernel = *mut c_void;
pub type cl_mem = *mut c_void;
pub type cl_event = *mut c_void;

pub const CL_SUCCESS: cl_int = 0;
pub const CL_DEVICE_NOT_FOUND: cl_int = -1;
pub const CL_INVALID_KERNEL_NAME: cl_int = -46;
pub const CL_PLATFORM_NOT_FOUND_KHR: cl_int = -1001;
pub const CL_TRUE: cl_bool = 1;

pub const CL_PLATFORM_VERSION: cl_uint = 0x0901;
pub const CL_PLATFORM_NAME: cl_uint = 0x0902;
pub const CL_PLATFORM_VENDOR: cl_uint = 0x0903;

pub const CL_DEVICE_TYPE_CPU: cl_bitfield = 1 << 1;
pub const CL_DEVICE_TYPE_GPU: cl_bitfield = 1 << 2;
pub const CL_DEVICE_TYPE_ACCELERATOR: cl_bitfield = 1 << 3;
pub const CL_DEVICE_TYPE_ALL: cl_bitfield = 0xFFFF_FFFF;

pub const CL_DEVICE_TYPE: cl_uint = 0x1000;
pub const CL_DEVICE_GLOBAL_MEM_SIZE: cl_uint = 0x101F;
pub const CL_DEVICE_NAME: cl_uint = 0x102B;

pub const CL_PROGRAM_BUILD_LOG: cl_uint = 0x1183;

pub const CL_MEM_READ_WRITE: cl_bitfield = 1 << 0;
pub const CL_MEM_ALLOC_HOST_PTR: cl_bitfield = 1 << 4;

pub const CL_MAP_READ: cl_bitfield = 1 << 0;
pub const CL_MAP_WRITE: cl_bitfield = 1 << 1;

type GetPlatformIds = unsafe extern "C" fn(cl_uint, *mut cl_platform_id, *mut cl_uint) -> cl_int;
type GetPlatformInfo =
    unsafe extern "C" fn(cl_platform_id, cl_uint, usize, *mut c_void, *mut usize) -> cl_int;
type GetDeviceIds = unsafe extern "C" fn(
    cl_platform_id,
    cl_bitfield,
    cl_uint,
    *mut cl_device_id,
    *mut cl_uint,
) -> cl_int;
type GetDeviceInfo =
    unsafe extern "C" fn(cl_device_id, cl_uint, usize, *mut c_void, *mut usize) -> cl_int;
type CreateContext = unsafe extern "C" fn(
    *const isize,
    cl_uint,
    *const cl_device_id,
    *const c_void,
    *mut c_void,
    *mut cl_int,
) -> cl_context;
type CreateCommandQueue =
    unsafe extern "C" fn(cl_context, cl_device_id, cl_bitfield, *mut cl_int) -> cl_command_queue;
type CreateProgramWithBinary = unsafe extern "C" fn(
    cl_context,
    cl_uint,
    *const cl_device_id,
    *const usize,
    *const *const u8,
    *mut cl_int,
    *mut cl_int,
) -> cl_program;
type BuildProgram = unsafe extern "C" fn(
    cl_program,
    cl_uint,
    *const cl_device_id,
    *const std::ffi::c_char,
    *const c_void,
    *mut c_void,
) -> cl_int;
type GetProgramBuildInfo = unsafe extern "C" fn(
    cl_program,
    cl_device_id,
    cl_uint,
    usize,
    *mut c_void,
    *mut usize,
) -> cl_int;
type CreateKernel =
    unsafe extern "C" fn(cl_program, *const std::ffi::c_char, *mut cl_int) -> cl_kernel;
type CreateBuffer =
    unsafe extern "C" fn(cl_context, cl_bitfield, usize, *mut c_void, *mut cl_int) -> cl_mem;
type SetKernelArg = unsafe extern "C" fn(cl_kernel, cl_uint, usize, *const c_void) -> cl_int;
type EnqueueTask = unsafe extern "C" fn(
    cl_command_queue,
    cl_kernel,
    cl_uint,
    *const cl_event,
    *mut cl_event,
) -> cl_int;
type Finish = unsafe extern "C" fn(cl_command_queue) -> cl_int;
type EnqueueMapBuffer = unsafe extern "C" fn(
    cl_command_queue,
    cl_mem,
    cl_bool,
    cl_bitfield,
    usize,
    usize,
    cl_uint,
    *const cl_event,
    *mut cl_event,
    *mut cl_int,
) -> *mut c_void;
type EnqueueUnmapMemObject = unsafe extern "C" fn(
    cl_command_queue,
    cl_mem,
    *mut c_void,
    cl_uint,
    *const cl_event,
    *mut cl_event,
) -> cl_int;
type Release = unsafe extern "C" fn(*mut c_void) -> cl_int;

/// Resolved OpenCL entry points.
pub struct OpenClApi {
    pub get_platform_ids: GetPlatformIds,
    pub get_platform_info: GetPlatformInfo,
    pub get_device_ids: GetDeviceIds,
    pub get_device_info: GetDeviceInfo,
    pub create_context: CreateContext,
    pub create_command_queue: CreateCommandQueue,
    pub create_program_with_binary: CreateProgramWithBinary,
    pub build_program: BuildProgram,
    pub get_program_build_info: GetProgramBuildInfo,
    pub create_kernel: CreateKernel,
    pub create_buffer: CreateBuffer,
    pub set_kernel_arg: SetKernelArg,
    pub enqueue_task: EnqueueTask,
    pub finish: Finish,
    pub enqueue_map_buffer: EnqueueMapBuffer,
    pub enqueue_unmap_mem_object: EnqueueUnmapMemObject,
    pub release_mem_object: Release,
    pub release_kernel: Release,
    pub release_program: Release,
    pub release_command_queue: Release,
    pub release_context: Release,
}

static OPENCL_API: OnceLock<std::result::Result<OpenClApi, String>> = OnceLock::new();

#[cfg(target_os = "linux")]
unsafe extern "C" {
    fn dlopen(filename: *const c_char, flags: i32) -> *mut c_void;
    fn dlerror() -> *const c_char;
    fn dlsym(handle: *mut c_void, symbol: *const c_char) -> *mut c_void;
}

#[cfg(target_os = "linux")]
const RTLD_NOW: i32 = 2;
#[cfg(target_os = "linux")]
const RTLD_LOCAL: i32 = 0;

#[cfg(target_os = "linux")]
fn last_dl_error(fallback: &str) -> String {
    // SAFETY: dlerror returns a thread-local C string or null.
    unsafe {
        let p = dlerror();
        if p.is_null() {
            fallback.to_string()
        } else {
            CStr::from_ptr(p).to_string_lossy().to_string()
        }
    }
}

#[cfg(target_os = "linux")]
fn load_symbol<T>(handle: *mut c_void, name: &'static str) -> std::result::Result<T, String> {
    let cname = CString::new(name).map_err(|_| format!("invalid OpenCL symbol name: {name}"))?;
    // SAFETY: handle is a valid dlopen handle and cname is NUL-terminated.
    let ptr = unsafe { dlsym(handle, cname.as_ptr()) };
    if ptr.is_null() {
        Err(format!(
            "dlsym({name}) failed: {}",
            last_dl_error("unknown dlsym error")
        ))
    } else {
        // SAFETY: ptr points to the OpenCL entry point whose signature is T.
        Ok(unsafe { std::mem::transmute_copy(&ptr) })
    }
}

#[cfg(target_os = "linux")]
fn init_opencl_api() -> std::result::Result<OpenClApi, String> {
    let mut candidates = Vec::new();
    if let Some(path) = std::env::var_os("ACCELFLOW_OPENCL_LIB") {
        candidates.push(path.to_string_lossy().to_string());
    }
    candidates.push("libOpenCL.so.1".to_string());
    candidates.push("libOpenCL.so".to_string());

    let mut handle = std::ptr::null_mut();
    let mut last_err = "unknown dlopen error".to_string();
    for candidate in &candidates {
        let soname = CString::new(candidate.as_str())
            .map_err(|_| format!("invalid OpenCL library path: {candidate}"))?;
        // SAFETY: NUL-terminated path and valid dlopen flags.
        handle = unsafe { dlopen(soname.as_ptr(), RTLD_NOW | RTLD_LOCAL) };
        if !handle.is_null() {
            break;
        }
        last_err = last_dl_error("unknown dlopen error");
    }
    if handle.is_null() {
        return Err(format!(
            "dlopen({}) failed: {last_err}",
            candidates.join("|")
        ));
    }

    Ok(OpenClApi {
        get_platform_ids: load_symbol(handle, "clGetPlatformIDs")?,
        get_platform_info: load_symbol(handle, "clGetPlatformInfo")?,
        get_device_ids: load_symbol(handle, "clGetDeviceIDs")?,
        get_device_info: load_symbol(handle, "clGetDeviceInfo")?,
        create_context: load_symbol(handle, "clCreateContext")?,
        create_command_queue: load_symbol(handle, "clCreateCommandQueue")?,
        create_program_with_binary: load_symbol(handle, "clCreateProgramWithBinary")?,
        build_program: load_symbol(handle, "clBuildProgram")?,
        get_program_build_info: load_symbol(handle, "clGetProgramBuildInfo")?,
        create_kernel: load_symbol(handle, "clCreateKernel")?,
        create_buffer: load_symbol(handle, "clCreateBuffer")?,
        set_kernel_arg: load_symbol(handle, "clSetKernelArg")?,
        enqueue_task: load_symbol(handle, "clEnqueueTask")?,
        finish: load_symbol(handle, "clFinish")?,
        enqueue_map_buffer: load_symbol(handle, "clEnqueueMapBuffer")?,
        enqueue_unmap_mem_object: load_symbol(handle, "clEnqueueUnmapMemObject")?,
        release_mem_object: load_symbol(handle, "clReleaseMemObject")?,
        release_kernel: load_symbol(handle, "clReleaseKernel")?,
        release_program: load_symbol(handle, "clReleaseProgram")?,
        release_command_queue: load_symbol(handle, "clReleaseCommandQueue")?,
        release_context: load_symbol(handle, "clReleaseContext")?,
    })
}

#[cfg(not(target_os = "linux"))]
#[cfg_attr(target_os = "macos", link(name = "OpenCL", kind = "framework"))]
#[cfg_attr(not(target_os = "macos"), link(name = "OpenCL"))]
unsafe extern "C" {
    fn clGetPlatformIDs(n: cl_uint, platforms: *mut cl_platform_id, num: *mut cl_uint) -> cl_int;
    fn clGetPlatformInfo(
        platform: cl_platform_id,
        param: cl_uint,
        size: usize,
        value: *mut c_void,
        size_ret: *mut usize,
    ) -> cl_int;
    fn clGetDeviceIDs(
        platform: cl_platform_id,
        device_type: cl_bitfield,
        n: cl_uint,
        devices: *mut cl_device_id,
        num: *mut cl_uint,
    ) -> cl_int;
    fn clGetDeviceInfo(
        device: cl_device_id,
        param: cl_uint,
        size: usize,
        value: *mut c_void,
        size_ret: *mut usize,
    ) -> cl_int;
    fn clCreateContext(
        props: *const isize,
        n: cl_uint,
        devices: *const cl_device_id,
        notify: *const c_void,
        user_data: *mut c_void,
        err: *mut cl_int,
    ) -> cl_context;
    fn clCreateCommandQueue(
        ctx: cl_context,
        device: cl_device_id,
        props: cl_bitfield,
        err: *mut cl_int,
    ) -> cl_command_queue;
    fn clCreateProgramWithBinary(
        ctx: cl_context,
        n: cl_uint,
        devices: *const cl_device_id,
        lengths: *const usize,
        binaries: *const *const u8,
        status: *mut cl_int,
        err: *mut cl_int,
    ) -> cl_program;
    fn clBuildProgram(
        program: cl_program,
        n: cl_uint,
        devices: *const cl_device_id,
        options: *const std::ffi::c_char,
        notify: *const c_void,
        user_data: *mut c_void,
    ) -> cl_int;
    fn clGetProgramBuildInfo(
        program: cl_program,
        device: cl_device_id,
        param: cl_uint,
        size: usize,
        value: *mut c_void,
        size_ret: *mut usize,
    ) -> cl_int;
    fn clCreateKernel(
        program: cl_program,
        name: *const std::ffi::c_char,
        err: *mut cl_int,
    ) -> cl_kernel;
    fn clCreateBuffer(
        ctx: cl_context,
        flags: cl_bitfield,
        size: usize,
        host_ptr: *mut c_void,
        err: *mut cl_int,
    ) -> cl_mem;
    fn clSetKernelArg(kernel: cl_kernel, index: cl_uint, size: usize, value: *const c_void)
    -> cl_int;
    fn clEnqueueTask(
        queue: cl_command_queue,
        kernel: cl_kernel,
        n: cl_uint,
        wait: *const cl_event,
        event: *mut cl_event,
    ) -> cl_int;
    fn clFinish(queue: cl_command_queue) -> cl_int;
    fn clEnqueueMapBuffer(
        queue: cl_command_queue,
        buffer: cl_mem,
        blocking: cl_bool,
        flags: cl_bitfield,
        offset: usize,
        size: usize,
        n: cl_uint,
        wait: *const cl_event,
        event: *mut cl_event,
        err: *mut cl_int,
    ) -> *mut c_void;
    fn clEnqueueUnmapMemObject(
        queue: cl_command_queue,
        mem: cl_mem,
        ptr: *mut c_void,
        n: cl_uint,
        wait: *const cl_event,
        event: *mut cl_event,
    ) -> cl_int;
    fn clReleaseMemObject(mem: *mut c_void) -> cl_int;
    fn clReleaseKernel(kernel: *mut c_void) -> cl_int;
    fn clReleaseProgram(program: *mut c_void) -> cl_int;
    fn clReleaseCommandQueue(queue: *mut c_void) -> cl_int;
    fn clReleaseContext(ctx: *mut c_void) -> cl_int;
}

#[cfg(not(target_os = "linux"))]
fn init_opencl_api() -> std::result::Result<OpenClApi, String> {
    Ok(OpenClApi {
        get_platform_ids: clGetPlatformIDs,
        get_platform_info: clGetPlatformInfo,
        get_device_ids: clGetDeviceIDs,
        get_device_info: clGetDeviceInfo,
        create_context: clCreateContext,
        create_command_queue: clCreateCommandQueue,
        create_program_with_binary: clCreateProgramWithBinary,
        build_program: clBuildProgram,
        get_program_build_info: clGetProgramBuildInfo,
        create_kernel: clCreateKernel,
        create_buffer: clCreateBuffer,
        set_kernel_arg: clSetKernelArg,
        enqueue_task: clEnqueueTask,
        finish: clFinish,
        enqueue_map_buffer: clEnqueueMapBuffer,
        enqueue_unmap_mem_object: clEnqueueUnmapMemObject,
        release_mem_object: clReleaseMemObject,
        release_kernel: clReleaseKernel,
        release_program: clReleaseProgram,
        release_command_queue: clReleaseCommandQueue,
        release_context: clReleaseContext,
    })
}

/// Resolve the OpenCL entry points once per process.
pub fn opencl_api() -> Result<&'static OpenClApi> {
    let api = OPENCL_API.get_or_init(init_opencl_api);
    api.as_ref().map_err(|err| {
        EngineError::RuntimeUnavailable(format!(
            "failed to load the OpenCL ICD loader: {err}. \
Install the vendor runtime (e.g. the FPGA board support package) and make \
libOpenCL.so.1 visible via LD_LIBRARY_PATH, or set ACCELFLOW_OPENCL_LIB."
        ))
    })
}

// SAFETY: the table holds plain function pointers into the loaded library,
// which stays loaded for the life of the process.
unsafe impl Send for OpenClApi {}
unsafe impl Sync for OpenClApi {}

/// Symbolic name of an OpenCL status code.
pub fn cl_error_name(code: cl_int) -> &'static str {
    match code {
        0 => "CL_SUCCESS",
        -1 => "CL_DEVICE_NOT_FOUND",
        -2 => "CL_DEVICE_NOT_AVAILABLE",
        -3 => "CL_COMPILER_NOT_AVAILABLE",
        -4 => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
        -5 => "CL_OUT_OF_RESOURCES",
        -6 => "CL_OUT_OF_HOST_MEMORY",
        -7 => "CL_PROFILING_INFO_NOT_AVAILABLE",
        -8 => "CL_MEM_COPY_OVERLAP",
        -9 => "CL_IMAGE_FORMAT_MISMATCH",
        -10 => "CL_IMAGE_FORMAT_NOT_SUPPORTED",
        -11 => "CL_BUILD_PROGRAM_FAILURE",
        -12 => "CL_MAP_FAILURE",
        -13 => "CL_MISALIGNED_SUB_BUFFER_OFFSET",
        -14 => "CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST",
        -30 => "CL_INVALID_VALUE",
        -31 => "CL_INVALID_DEVICE_TYPE",
        -32 => "CL_INVALID_PLATFORM",
        -33 => "CL_INVALID_DEVICE",
        -34 => "CL_INVALID_CONTEXT",
        -35 => "CL_INVALID_QUEUE_PROPERTIES",
        -36 => "CL_INVALID_COMMAND_QUEUE",
        -37 => "CL_INVALID_HOST_PTR",
        -38 => "CL_INVALID_MEM_OBJECT",
        -42 => "CL_INVALID_BINARY",
        -43 => "CL_INVALID_BUILD_OPTIONS",
        -44 => "CL_INVALID_PROGRAM",
        -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
        -46 => "CL_INVALID_KERNEL_NAME",
        -47 => "CL_INVALID_KERNEL_DEFINITION",
        -48 => "CL_INVALID_KERNEL",
        -49 => "CL_INVALID_ARG_INDEX",
        -50 => "CL_INVALID_ARG_VALUE",
        -51 => "CL_INVALID_ARG_SIZE",
        -52 => "CL_INVALID_KERNEL_ARGS",
        -53 => "CL_INVALID_WORK_DIMENSION",
        -54 => "CL_INVALID_WORK_GROUP_SIZE",
        -55 => "CL_INVALID_WORK_ITEM_SIZE",
        -58 => "CL_INVALID_EVENT",
        -59 => "CL_INVALID_OPERATION",
        -61 => "CL_INVALID_BUFFER_SIZE",
        -1001 => "CL_PLATFORM_NOT_FOUND_KHR",
        _ => "CL_UNKNOWN_ERROR",
    }
}

/// `"CL_NAME (code)"` for diagnostics.
pub fn describe(code: cl_int) -> String {
    format!("{} ({code})", cl_error_name(code))
}

#[inline]
pub fn check_cl(code: cl_int, op: &'static str) -> Result<()> {
    if code == CL_SUCCESS {
        Ok(())
    } else {
        Err(EngineError::Driver {
            op,
            reason: describe(code),
        })
    }
}
