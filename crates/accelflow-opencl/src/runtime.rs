//! [`ComputeRuntime`] on the OpenCL host API.

use std::ffi::{CString, c_void};
use std::ptr::{self, NonNull};

use accelflow_core::error::{EngineError, Result};
use accelflow_core::runtime::{
    ComputeRuntime, DeviceInfo, HandleKind, KernelArg, PlatformInfo, RawHandle,
};
use accelflow_core::types::{DeviceClass, MapMode};
use tracing::{debug, warn};

use crate::sys::{self, OpenClApi, cl_bitfield, cl_int, cl_mem, cl_uint, check_cl, describe};

/// OpenCL runtime bound to the process-wide ICD loader.
pub struct OpenClRuntime {
    api: &'static OpenClApi,
}

impl OpenClRuntime {
    /// Load the OpenCL entry points.
    ///
    /// # Errors
    /// `RuntimeUnavailable` if the ICD loader cannot be opened or lacks a
    /// required symbol.
    pub fn new() -> Result<Self> {
        let api = sys::opencl_api()?;
        debug!("OpenCL runtime loaded");
        Ok(Self { api })
    }

    fn platform_string(&self, platform: sys::cl_platform_id, param: cl_uint) -> Result<String> {
        let mut size = 0usize;
        // SAFETY: size query with a null value pointer.
        let rc = unsafe {
            (self.api.get_platform_info)(platform, param, 0, ptr::null_mut(), &mut size)
        };
        check_cl(rc, "clGetPlatformInfo")?;
        let mut buf = vec![0u8; size];
        // SAFETY: buf holds exactly `size` bytes.
        let rc = unsafe {
            (self.api.get_platform_info)(
                platform,
                param,
                size,
                buf.as_mut_ptr().cast(),
                ptr::null_mut(),
            )
        };
        check_cl(rc, "clGetPlatformInfo")?;
        Ok(c_string_lossy(&buf))
    }

    fn device_info_bytes(&self, device: sys::cl_device_id, param: cl_uint) -> Result<Vec<u8>> {
        let mut size = 0usize;
        // SAFETY: size query with a null value pointer.
        let rc =
            unsafe { (self.api.get_device_info)(device, param, 0, ptr::null_mut(), &mut size) };
        check_cl(rc, "clGetDeviceInfo")?;
        let mut buf = vec![0u8; size];
        // SAFETY: buf holds exactly `size` bytes.
        let rc = unsafe {
            (self.api.get_device_info)(
                device,
                param,
                size,
                buf.as_mut_ptr().cast(),
                ptr::null_mut(),
            )
        };
        check_cl(rc, "clGetDeviceInfo")?;
        Ok(buf)
    }

    fn device_u64(&self, device: sys::cl_device_id, param: cl_uint) -> Result<u64> {
        let bytes = self.device_info_bytes(device, param)?;
        let raw: [u8; 8] = bytes.get(..8).and_then(|b| b.try_into().ok()).ok_or_else(|| {
            EngineError::Driver {
                op: "clGetDeviceInfo",
                reason: format!("expected 8-byte value for param {param:#x}, got {}", bytes.len()),
            }
        })?;
        Ok(u64::from_ne_bytes(raw))
    }

    fn build_log(&self, program: sys::cl_program, device: sys::cl_device_id) -> String {
        let mut size = 0usize;
        // SAFETY: size query with a null value pointer.
        let rc = unsafe {
            (self.api.get_program_build_info)(
                program,
                device,
                sys::CL_PROGRAM_BUILD_LOG,
                0,
                ptr::null_mut(),
                &mut size,
            )
        };
        if rc != sys::CL_SUCCESS || size == 0 {
            return String::from("<no build log>");
        }
        let mut buf = vec![0u8; size];
        // SAFETY: buf holds exactly `size` bytes.
        let rc = unsafe {
            (self.api.get_program_build_info)(
                program,
                device,
                sys::CL_PROGRAM_BUILD_LOG,
                size,
                buf.as_mut_ptr().cast(),
                ptr::null_mut(),
            )
        };
        if rc != sys::CL_SUCCESS {
            return String::from("<no build log>");
        }
        let log = c_string_lossy(&buf);
        if log.trim().is_empty() {
            String::from("<empty build log>")
        } else {
            log
        }
    }

    fn release_program_quietly(&self, program: sys::cl_program) {
        // SAFETY: program is a live handle this runtime just created.
        let rc = unsafe { (self.api.release_program)(program) };
        if rc != sys::CL_SUCCESS {
            warn!(error = %describe(rc), "clReleaseProgram failed after rejected build");
        }
    }
}

fn c_string_lossy(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).trim().to_string()
}

fn handle_or_error(ptr: *mut c_void, rc: cl_int, op: &'static str) -> Result<RawHandle> {
    check_cl(rc, op)?;
    RawHandle::from_ptr(ptr).ok_or_else(|| EngineError::Driver {
        op,
        reason: "returned a null handle".into(),
    })
}

fn device_type_mask(class: DeviceClass) -> cl_bitfield {
    match class {
        DeviceClass::Accelerator => sys::CL_DEVICE_TYPE_ACCELERATOR,
        DeviceClass::Gpu => sys::CL_DEVICE_TYPE_GPU,
        DeviceClass::Cpu => sys::CL_DEVICE_TYPE_CPU,
        DeviceClass::Any => sys::CL_DEVICE_TYPE_ALL,
    }
}

fn class_from_mask(mask: cl_bitfield) -> DeviceClass {
    if mask & sys::CL_DEVICE_TYPE_ACCELERATOR != 0 {
        DeviceClass::Accelerator
    } else if mask & sys::CL_DEVICE_TYPE_GPU != 0 {
        DeviceClass::Gpu
    } else if mask & sys::CL_DEVICE_TYPE_CPU != 0 {
        DeviceClass::Cpu
    } else {
        DeviceClass::Any
    }
}

fn map_flags(mode: MapMode) -> cl_bitfield {
    match mode {
        MapMode::Read => sys::CL_MAP_READ,
        MapMode::Write => sys::CL_MAP_WRITE,
        MapMode::ReadWrite => sys::CL_MAP_READ | sys::CL_MAP_WRITE,
    }
}

impl ComputeRuntime for OpenClRuntime {
    fn name(&self) -> &'static str {
        "opencl"
    }

    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        let mut count: cl_uint = 0;
        // SAFETY: count query with a null output array.
        let rc = unsafe { (self.api.get_platform_ids)(0, ptr::null_mut(), &mut count) };
        if rc == sys::CL_PLATFORM_NOT_FOUND_KHR {
            return Ok(Vec::new());
        }
        check_cl(rc, "clGetPlatformIDs")?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut ids = vec![ptr::null_mut(); count as usize];
        // SAFETY: ids has room for `count` platform ids.
        let rc = unsafe { (self.api.get_platform_ids)(count, ids.as_mut_ptr(), ptr::null_mut()) };
        check_cl(rc, "clGetPlatformIDs")?;

        ids.into_iter()
            .enumerate()
            .filter_map(|(index, id)| RawHandle::from_ptr(id).map(|h| (index, id, h)))
            .map(|(index, id, handle)| {
                Ok(PlatformInfo {
                    index,
                    handle,
                    name: self.platform_string(id, sys::CL_PLATFORM_NAME)?,
                    vendor: self.platform_string(id, sys::CL_PLATFORM_VENDOR)?,
                    version: self.platform_string(id, sys::CL_PLATFORM_VERSION)?,
                })
            })
            .collect()
    }

    fn devices(&self, platform: &PlatformInfo, class: DeviceClass) -> Result<Vec<DeviceInfo>> {
        let mask = device_type_mask(class);
        let mut count: cl_uint = 0;
        // SAFETY: count query with a null output array.
        let rc = unsafe {
            (self.api.get_device_ids)(
                platform.handle.as_ptr(),
                mask,
                0,
                ptr::null_mut(),
                &mut count,
            )
        };
        if rc == sys::CL_DEVICE_NOT_FOUND {
            return Ok(Vec::new());
        }
        check_cl(rc, "clGetDeviceIDs")?;
        if count == 0 {
            return Ok(Vec::new());
        }
        let mut ids = vec![ptr::null_mut(); count as usize];
        // SAFETY: ids has room for `count` device ids.
        let rc = unsafe {
            (self.api.get_device_ids)(
                platform.handle.as_ptr(),
                mask,
                count,
                ids.as_mut_ptr(),
                ptr::null_mut(),
            )
        };
        check_cl(rc, "clGetDeviceIDs")?;

        let mut out = Vec::with_capacity(ids.len());
        for (index, id) in ids.into_iter().enumerate() {
            let Some(handle) = RawHandle::from_ptr(id) else {
                continue;
            };
            let name = c_string_lossy(&self.device_info_bytes(id, sys::CL_DEVICE_NAME)?);
            let device_type = self.device_u64(id, sys::CL_DEVICE_TYPE)?;
            let global_mem_bytes = self.device_u64(id, sys::CL_DEVICE_GLOBAL_MEM_SIZE)?;
            out.push(DeviceInfo {
                index,
                handle,
                name,
                class: class_from_mask(device_type),
                global_mem_bytes,
            });
        }
        Ok(out)
    }

    fn create_context(&self, device: RawHandle) -> Result<RawHandle> {
        let devices = [device.as_ptr()];
        let mut rc: cl_int = 0;
        // SAFETY: one valid device id; no properties and no notify callback.
        let ctx = unsafe {
            (self.api.create_context)(
                ptr::null(),
                1,
                devices.as_ptr(),
                ptr::null(),
                ptr::null_mut(),
                &mut rc,
            )
        };
        handle_or_error(ctx, rc, "clCreateContext")
    }

    fn create_queue(&self, context: RawHandle, device: RawHandle) -> Result<RawHandle> {
        let mut rc: cl_int = 0;
        // SAFETY: valid context/device; default (in-order, no profiling) properties.
        let queue = unsafe {
            (self.api.create_command_queue)(context.as_ptr(), device.as_ptr(), 0, &mut rc)
        };
        handle_or_error(queue, rc, "clCreateCommandQueue")
    }

    fn build_program(
        &self,
        context: RawHandle,
        device: RawHandle,
        binary: &[u8],
    ) -> Result<RawHandle> {
        let devices = [device.as_ptr()];
        let lengths = [binary.len()];
        let binaries = [binary.as_ptr()];
        let mut status: cl_int = 0;
        let mut rc: cl_int = 0;
        // SAFETY: one device with one binary of `binary.len()` bytes that
        // outlives the call.
        let program = unsafe {
            (self.api.create_program_with_binary)(
                context.as_ptr(),
                1,
                devices.as_ptr(),
                lengths.as_ptr(),
                binaries.as_ptr(),
                &mut status,
                &mut rc,
            )
        };
        if rc != sys::CL_SUCCESS || status != sys::CL_SUCCESS || program.is_null() {
            if !program.is_null() {
                self.release_program_quietly(program);
            }
            let code = if rc != sys::CL_SUCCESS { rc } else { status };
            return Err(EngineError::BuildRejected {
                code: format!("clCreateProgramWithBinary: {}", describe(code)),
                log: "the runtime rejected the binary image for this device".into(),
            });
        }

        // SAFETY: program was just created for exactly this device.
        let rc = unsafe {
            (self.api.build_program)(
                program,
                1,
                devices.as_ptr(),
                ptr::null(),
                ptr::null(),
                ptr::null_mut(),
            )
        };
        if rc != sys::CL_SUCCESS {
            let log = self.build_log(program, device.as_ptr());
            self.release_program_quietly(program);
            return Err(EngineError::BuildRejected {
                code: format!("clBuildProgram: {}", describe(rc)),
                log,
            });
        }
        handle_or_error(program, rc, "clBuildProgram")
    }

    fn create_kernel(&self, program: RawHandle, name: &str) -> Result<RawHandle> {
        let cname = CString::new(name).map_err(|_| EngineError::KernelNotFound {
            name: name.to_string(),
        })?;
        let mut rc: cl_int = 0;
        // SAFETY: program is built; cname is NUL-terminated.
        let kernel = unsafe { (self.api.create_kernel)(program.as_ptr(), cname.as_ptr(), &mut rc) };
        if rc == sys::CL_INVALID_KERNEL_NAME {
            return Err(EngineError::KernelNotFound {
                name: name.to_string(),
            });
        }
        handle_or_error(kernel, rc, "clCreateKernel")
    }

    fn create_buffer(&self, context: RawHandle, bytes: usize) -> Result<RawHandle> {
        let mut rc: cl_int = 0;
        // SAFETY: no host pointer; the runtime allocates host-accessible memory.
        let mem = unsafe {
            (self.api.create_buffer)(
                context.as_ptr(),
                sys::CL_MEM_READ_WRITE | sys::CL_MEM_ALLOC_HOST_PTR,
                bytes,
                ptr::null_mut(),
                &mut rc,
            )
        };
        handle_or_error(mem, rc, "clCreateBuffer")
    }

    fn set_kernel_arg(&self, kernel: RawHandle, index: u32, arg: KernelArg) -> Result<()> {
        let rc = match arg {
            KernelArg::Buffer(buffer) => {
                let mem: cl_mem = buffer.as_ptr();
                // SAFETY: value points at a cl_mem that lives across the call.
                unsafe {
                    (self.api.set_kernel_arg)(
                        kernel.as_ptr(),
                        index,
                        size_of::<cl_mem>(),
                        (&mem as *const cl_mem).cast(),
                    )
                }
            }
            KernelArg::Int(value) => {
                // SAFETY: value points at an i32 that lives across the call.
                unsafe {
                    (self.api.set_kernel_arg)(
                        kernel.as_ptr(),
                        index,
                        size_of::<i32>(),
                        (&value as *const i32).cast(),
                    )
                }
            }
        };
        check_cl(rc, "clSetKernelArg")
    }

    fn enqueue_task(&self, queue: RawHandle, kernel: RawHandle) -> Result<()> {
        // SAFETY: live queue and kernel; no wait list and no event.
        let rc = unsafe {
            (self.api.enqueue_task)(
                queue.as_ptr(),
                kernel.as_ptr(),
                0,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        check_cl(rc, "clEnqueueTask")
    }

    fn finish(&self, queue: RawHandle) -> Result<()> {
        // SAFETY: live queue.
        let rc = unsafe { (self.api.finish)(queue.as_ptr()) };
        check_cl(rc, "clFinish")
    }

    fn map_buffer(
        &self,
        queue: RawHandle,
        buffer: RawHandle,
        mode: MapMode,
        bytes: usize,
    ) -> Result<NonNull<u8>> {
        let mut rc: cl_int = 0;
        // SAFETY: blocking map of `bytes` from offset 0 of a live buffer.
        let ptr = unsafe {
            (self.api.enqueue_map_buffer)(
                queue.as_ptr(),
                buffer.as_ptr(),
                sys::CL_TRUE,
                map_flags(mode),
                0,
                bytes,
                0,
                ptr::null(),
                ptr::null_mut(),
                &mut rc,
            )
        };
        check_cl(rc, "clEnqueueMapBuffer")?;
        NonNull::new(ptr.cast::<u8>()).ok_or_else(|| EngineError::Driver {
            op: "clEnqueueMapBuffer",
            reason: "returned a null mapping".into(),
        })
    }

    fn unmap_buffer(&self, queue: RawHandle, buffer: RawHandle, ptr: NonNull<u8>) -> Result<()> {
        // SAFETY: ptr came from clEnqueueMapBuffer on this buffer.
        let rc = unsafe {
            (self.api.enqueue_unmap_mem_object)(
                queue.as_ptr(),
                buffer.as_ptr(),
                ptr.as_ptr().cast(),
                0,
                ptr::null(),
                ptr::null_mut(),
            )
        };
        // Enqueued only: the stage's next kernel runs on the same in-order
        // queue, so it is ordered after the unmap without a host wait.
        check_cl(rc, "clEnqueueUnmapMemObject")
    }

    fn release(&self, kind: HandleKind, handle: RawHandle) -> Result<()> {
        let (release, op) = match kind {
            HandleKind::Buffer => (self.api.release_mem_object, "clReleaseMemObject"),
            HandleKind::Kernel => (self.api.release_kernel, "clReleaseKernel"),
            HandleKind::Program => (self.api.release_program, "clReleaseProgram"),
            HandleKind::Queue => (self.api.release_command_queue, "clReleaseCommandQueue"),
            HandleKind::Context => (self.api.release_context, "clReleaseContext"),
        };
        // SAFETY: handle is a live object of `kind`, released exactly once by
        // its owning DeviceHandle.
        let rc = unsafe { release(handle.as_ptr()) };
        check_cl(rc, op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_class_masks_round_trip() {
        for class in [DeviceClass::Accelerator, DeviceClass::Gpu, DeviceClass::Cpu] {
            assert_eq!(class_from_mask(device_type_mask(class)), class);
        }
        assert_eq!(device_type_mask(DeviceClass::Any), sys::CL_DEVICE_TYPE_ALL);
    }

    #[test]
    fn read_write_map_sets_both_flags() {
        assert_eq!(map_flags(MapMode::Read), sys::CL_MAP_READ);
        assert_eq!(map_flags(MapMode::Write), sys::CL_MAP_WRITE);
        assert_eq!(map_flags(MapMode::ReadWrite), 0b11);
    }

    #[test]
    fn info_strings_stop_at_nul() {
        assert_eq!(c_string_lossy(b"Intel FPGA\0\0junk"), "Intel FPGA");
        assert_eq!(c_string_lossy(b"no terminator"), "no terminator");
    }

    /// Minimal OpenCL entry points for host-side tests. Calls are counted
    /// per thread so tests can run in parallel.
    mod fake {
        use std::cell::Cell;
        use std::ffi::{c_char, c_void};
        use std::ptr;

        use crate::sys::{
            CL_SUCCESS, OpenClApi, cl_bitfield, cl_bool, cl_command_queue, cl_context,
            cl_device_id, cl_event, cl_int, cl_kernel, cl_mem, cl_platform_id, cl_program,
            cl_uint,
        };

        const CL_INVALID_OPERATION: cl_int = -59;

        thread_local! {
            pub static FINISHES: Cell<usize> = const { Cell::new(0) };
            pub static UNMAPS: Cell<usize> = const { Cell::new(0) };
            pub static DEVICE_IDS_RC: Cell<cl_int> = const { Cell::new(CL_SUCCESS) };
        }

        unsafe extern "C" fn get_platform_ids(
            _: cl_uint,
            _: *mut cl_platform_id,
            _: *mut cl_uint,
        ) -> cl_int {
            CL_INVALID_OPERATION
        }

        unsafe extern "C" fn get_info(
            _: *mut c_void,
            _: cl_uint,
            _: usize,
            _: *mut c_void,
            _: *mut usize,
        ) -> cl_int {
            CL_INVALID_OPERATION
        }

        unsafe extern "C" fn get_device_ids(
            _: cl_platform_id,
            _: cl_bitfield,
            _: cl_uint,
            _: *mut cl_device_id,
            num_devices: *mut cl_uint,
        ) -> cl_int {
            if !num_devices.is_null() {
                // SAFETY: caller passes a valid out pointer or null.
                unsafe { *num_devices = 0 };
            }
            DEVICE_IDS_RC.get()
        }

        unsafe extern "C" fn create_context(
            _: *const isize,
            _: cl_uint,
            _: *const cl_device_id,
            _: *const c_void,
            _: *mut c_void,
            _: *mut cl_int,
        ) -> cl_context {
            ptr::null_mut()
        }

        unsafe extern "C" fn create_command_queue(
            _: cl_context,
            _: cl_device_id,
            _: cl_bitfield,
            _: *mut cl_int,
        ) -> cl_command_queue {
            ptr::null_mut()
        }

        unsafe extern "C" fn create_program_with_binary(
            _: cl_context,
            _: cl_uint,
            _: *const cl_device_id,
            _: *const usize,
            _: *const *const u8,
            _: *mut cl_int,
            _: *mut cl_int,
        ) -> cl_program {
            ptr::null_mut()
        }

        unsafe extern "C" fn build_program(
            _: cl_program,
            _: cl_uint,
            _: *const cl_device_id,
            _: *const c_char,
            _: *const c_void,
            _: *mut c_void,
        ) -> cl_int {
            CL_INVALID_OPERATION
        }

        unsafe extern "C" fn get_program_build_info(
            _: cl_program,
            _: cl_device_id,
            _: cl_uint,
            _: usize,
            _: *mut c_void,
            _: *mut usize,
        ) -> cl_int {
            CL_INVALID_OPERATION
        }

        unsafe extern "C" fn create_kernel(
            _: cl_program,
            _: *const c_char,
            _: *mut cl_int,
        ) -> cl_kernel {
            ptr::null_mut()
        }

        unsafe extern "C" fn create_buffer(
            _: cl_context,
            _: cl_bitfield,
            _: usize,
            _: *mut c_void,
            _: *mut cl_int,
        ) -> cl_mem {
            ptr::null_mut()
        }

        unsafe extern "C" fn set_kernel_arg(
            _: cl_kernel,
            _: cl_uint,
            _: usize,
            _: *const c_void,
        ) -> cl_int {
            CL_INVALID_OPERATION
        }

        unsafe extern "C" fn enqueue_task(
            _: cl_command_queue,
            _: cl_kernel,
            _: cl_uint,
            _: *const cl_event,
            _: *mut cl_event,
        ) -> cl_int {
            CL_INVALID_OPERATION
        }

        unsafe extern "C" fn finish(_: cl_command_queue) -> cl_int {
            FINISHES.set(FINISHES.get() + 1);
            CL_SUCCESS
        }

        #[allow(clippy::too_many_arguments)]
        unsafe extern "C" fn enqueue_map_buffer(
            _: cl_command_queue,
            _: cl_mem,
            _: cl_bool,
            _: cl_bitfield,
            _: usize,
            _: usize,
            _: cl_uint,
            _: *const cl_event,
            _: *mut cl_event,
            _: *mut cl_int,
        ) -> *mut c_void {
            ptr::null_mut()
        }

        unsafe extern "C" fn enqueue_unmap_mem_object(
            _: cl_command_queue,
            _: cl_mem,
            _: *mut c_void,
            _: cl_uint,
            _: *const cl_event,
            _: *mut cl_event,
        ) -> cl_int {
            UNMAPS.set(UNMAPS.get() + 1);
            CL_SUCCESS
        }

        unsafe extern "C" fn release(_: *mut c_void) -> cl_int {
            CL_SUCCESS
        }

        pub fn api() -> &'static OpenClApi {
            Box::leak(Box::new(OpenClApi {
                get_platform_ids,
                get_platform_info: get_info,
                get_device_ids,
                get_device_info: get_info,
                create_context,
                create_command_queue,
                create_program_with_binary,
                build_program,
                get_program_build_info,
                create_kernel,
                create_buffer,
                set_kernel_arg,
                enqueue_task,
                finish,
                enqueue_map_buffer,
                enqueue_unmap_mem_object,
                release_mem_object: release,
                release_kernel: release,
                release_program: release,
                release_command_queue: release,
                release_context: release,
            }))
        }
    }

    fn handle(addr: usize) -> RawHandle {
        RawHandle::from_ptr(ptr::without_provenance_mut(addr)).expect("non-null")
    }

    #[test]
    fn unmap_does_not_wait_for_the_queue() {
        let rt = OpenClRuntime { api: fake::api() };
        let mut pixels = [0u8; 4];
        let mapped = NonNull::new(pixels.as_mut_ptr()).expect("non-null");

        rt.unmap_buffer(handle(0x10), handle(0x20), mapped).expect("unmap");
        assert_eq!(fake::UNMAPS.get(), 1);
        assert_eq!(fake::FINISHES.get(), 0, "unmap must not block on the queue");

        rt.finish(handle(0x10)).expect("finish");
        assert_eq!(fake::FINISHES.get(), 1);
    }

    #[test]
    fn device_query_failures_are_not_reported_as_empty() {
        let rt = OpenClRuntime { api: fake::api() };
        let platform = PlatformInfo {
            index: 0,
            handle: handle(0x30),
            name: "fake".into(),
            vendor: "fake".into(),
            version: "OpenCL 1.2".into(),
        };

        fake::DEVICE_IDS_RC.set(sys::CL_DEVICE_NOT_FOUND);
        assert!(
            rt.devices(&platform, DeviceClass::Accelerator)
                .expect("not found is empty")
                .is_empty()
        );

        // CL_INVALID_PLATFORM
        fake::DEVICE_IDS_RC.set(-32);
        let err = rt
            .devices(&platform, DeviceClass::Accelerator)
            .expect_err("driver error");
        assert!(matches!(err, EngineError::Driver { op: "clGetDeviceIDs", .. }));
        assert!(err.to_string().contains("CL_INVALID_PLATFORM"));

        fake::DEVICE_IDS_RC.set(sys::CL_SUCCESS);
        assert!(
            rt.devices(&platform, DeviceClass::Any)
                .expect("zero devices")
                .is_empty()
        );
    }

    #[test]
    fn null_handles_are_driver_errors() {
        let err = handle_or_error(ptr::null_mut(), sys::CL_SUCCESS, "clCreateContext")
            .expect_err("null handle");
        assert!(err.to_string().starts_with("clCreateContext failed"));
    }
}
