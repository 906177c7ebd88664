//! Error taxonomy for device memory and kernel dispatch.
//!
//! Every fallible operation in the workspace returns [`Result`]. Failures
//! carry enough context (call name, device name, driver error text) to be
//! diagnosed from the log alone; nothing in this layer retries.

/// Errors from the virtual memory table, buffer allocator, argument binder,
/// and device backends.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A device API call returned non-success.
    #[error("driver call '{call}' failed on {device}: {detail}")]
    Driver {
        /// Name of the failing driver entry point.
        call: &'static str,
        /// Device the call was issued against.
        device: String,
        /// Driver error text or code.
        detail: String,
    },

    /// A virtual pointer has no entry in the memory table.
    #[error("unknown virtual pointer {ptr:#018x}")]
    UnknownPointer { ptr: u64 },

    /// A virtual pointer was unregistered twice.
    #[error("double free of virtual pointer {ptr:#018x}")]
    DoubleFree { ptr: u64 },

    /// `free` was called on a pointer that does not own its buffer at
    /// offset 0 (sub-range pointers are not independently freeable).
    #[error("invalid free of derived pointer {ptr:#018x} at offset {offset}")]
    InvalidFree { ptr: u64, offset: usize },

    /// Argument resolution, sub-buffer creation, or the bind call failed.
    /// The enqueue is aborted before submission.
    #[error("kernel argument binding failed at index {index}: {reason}")]
    ArgumentBinding { index: usize, reason: String },

    /// Device buffer-object creation failed.
    #[error("allocation of {bytes} bytes failed on {device}: {reason}")]
    Allocation {
        bytes: usize,
        device: String,
        reason: String,
    },

    /// A host/device transfer did not complete.
    #[error("data transfer failed: {0}")]
    Transfer(String),

    /// The backend could not supply a compiled kernel for the requested
    /// name and element type.
    #[error("kernel '{name}' not available")]
    KernelMissing { name: String },

    /// Caller-supplied sizes or parameters are inconsistent.
    #[error("invalid arguments: {reason}")]
    InvalidArguments { reason: String },
}

/// Workspace-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_error_mentions_call_and_device() {
        let e = Error::Driver {
            call: "clEnqueueNDRangeKernel",
            device: "Test GPU".into(),
            detail: "CL_INVALID_KERNEL_ARGS".into(),
        };
        let s = e.to_string();
        assert!(s.contains("clEnqueueNDRangeKernel"));
        assert!(s.contains("Test GPU"));
        assert!(s.contains("CL_INVALID_KERNEL_ARGS"));
    }

    #[test]
    fn unknown_pointer_formats_hex() {
        let e = Error::UnknownPointer { ptr: 0x8000_0000_0000_0001 };
        assert!(e.to_string().contains("0x8000000000000001"));
    }

    #[test]
    fn double_free_display() {
        let e = Error::DoubleFree { ptr: 1 };
        assert!(e.to_string().contains("double free"));
    }

    #[test]
    fn invalid_free_shows_offset() {
        let e = Error::InvalidFree { ptr: 1, offset: 128 };
        assert!(e.to_string().contains("128"));
    }

    #[test]
    fn binding_error_shows_index() {
        let e = Error::ArgumentBinding { index: 3, reason: "no view".into() };
        assert!(e.to_string().contains("index 3"));
    }

    #[test]
    fn allocation_error_shows_size() {
        let e = Error::Allocation {
            bytes: 4096,
            device: "host".into(),
            reason: "out of memory".into(),
        };
        let s = e.to_string();
        assert!(s.contains("4096"));
        assert!(s.contains("out of memory"));
    }

    #[test]
    fn kernel_missing_names_kernel() {
        let e = Error::KernelMissing { name: "im2col_f32".into() };
        assert!(e.to_string().contains("im2col_f32"));
    }

    #[test]
    fn is_std_error() {
        let e: Box<dyn std::error::Error> = Box::new(Error::Transfer("bus".into()));
        assert!(!e.to_string().is_empty());
    }
}
