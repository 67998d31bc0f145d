//! Architecture and platform support.
//!
//! The rest of the kernel consumes a small named contract from this module:
//! interrupt enable/disable/restore, a spin hint, a CPU identifier, the
//! kernel clock, and thread parking (the scheduler's block/ready
//! primitives). Ports implement the same surface for real hardware.

cfg_if::cfg_if! {
    if #[cfg(target_os = "none")] {
        compile_error!(
            "no bare-metal port is wired into this tree; \
             the hosted platform is the only in-tree arch"
        );
    } else {
        mod hosted;
        pub use self::hosted::*;
    }
}
