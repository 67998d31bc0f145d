//! Memory management: physical frames, per-address-space page tables, and
//! address spaces made of backend-serviced areas.
//!
//! Lock order within this module, deepest last: address space, then area,
//! then share-info (all sleeping mutexes), then the page-table and
//! frame-table spinlocks.

mod backend;

pub mod addrspace;
pub mod frame;
pub mod page;
pub mod tlb;

pub use self::addrspace::{area_share, AddressSpace, PfAccess, PfOutcome};
pub use self::frame::{FrameId, FrameTable, PAGE_SIZE};
pub use self::page::{PageTable, Pte};
