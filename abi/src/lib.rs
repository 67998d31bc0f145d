//! IPC ABI definitions, shared between the kernel and task-side libraries.
//!
//! Everything in this crate is part of the wire contract between the kernel
//! and user tasks: message layout, system method numbers, error codes, and
//! the generational IDs used to name tasks and calls across the syscall
//! boundary. Changing any numeric value here alters the ABI.

#![no_std]

use serde::{Deserialize, Serialize};
use zerocopy::{AsBytes, FromBytes, Unaligned};

/// Number of argument words in a message, in addition to the method word.
pub const MSG_ARG_COUNT: usize = 5;

/// Well-known phone descriptor connecting a freshly created task to the
/// naming service.
pub const PHONE_NS: usize = 0;

/// Number of phone slots in each task's phone table.
pub const MAX_PHONES: usize = 16;

/// Maximum number of unanswered asynchronous calls a task may have in
/// flight. Further sends are refused with a temporary error until replies
/// are drained.
pub const MAX_ASYNC_CALLS: usize = 4;

/// Upper bound on a single bulk data transfer, in bytes.
pub const DATA_XFER_LIMIT: usize = 64 * 1024;

/// A single IPC message: one method word plus [`MSG_ARG_COUNT`] argument
/// words, each the machine's natural word. On a reply the method slot
/// carries the return value instead.
///
/// This is the entire fixed-width payload of a call; anything larger moves
/// through the bulk-transfer methods.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, FromBytes, AsBytes)]
#[repr(C)]
pub struct RawMessage {
    /// Method on a request, return value on a reply.
    pub method: usize,
    /// Argument words 1 through 5, in slot order.
    pub args: [usize; MSG_ARG_COUNT],
}

impl RawMessage {
    pub const fn new(method: usize, args: [usize; MSG_ARG_COUNT]) -> Self {
        Self { method, args }
    }

    /// Reads the return value of a reply. Same slot as the method word.
    pub fn retval(&self) -> isize {
        self.method as isize
    }

    /// Stores a return value into the reply slot.
    pub fn set_retval(&mut self, retval: isize) {
        self.method = retval as usize;
    }

    /// Reads argument slot `n`, where `n` is 1-based to match the wire
    /// naming (arg1..arg5).
    ///
    /// # Panics
    ///
    /// If `n` is zero or greater than [`MSG_ARG_COUNT`].
    pub fn arg(&self, n: usize) -> usize {
        self.args[n - 1]
    }

    /// Writes argument slot `n` (1-based).
    pub fn set_arg(&mut self, n: usize, value: usize) {
        self.args[n - 1] = value;
    }
}

/// Type used to track generation numbers of reusable kernel object slots.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Default, Serialize, Deserialize, FromBytes, AsBytes,
    Unaligned,
)]
#[repr(transparent)]
pub struct Generation(pub u8);

impl Generation {
    pub fn next(self) -> Self {
        Generation(self.0.wrapping_add(1) & (TaskId::GEN_MASK as u8))
    }
}

/// Names a particular incarnation of a task.
///
/// A `TaskId` combines a task table index with a generation number. The
/// generation is bumped whenever the slot is reused, so a peer holding an
/// ID for a task that has since died gets a stale-ID error instead of
/// talking to an unrelated newcomer.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, FromBytes, AsBytes,
)]
#[repr(transparent)]
pub struct TaskId(pub u16);

impl TaskId {
    /// Number of bits used for the table index; the rest hold the
    /// generation.
    pub const INDEX_BITS: u32 = 10;
    pub const INDEX_MASK: u16 = (1 << Self::INDEX_BITS) - 1;
    pub const GEN_MASK: u16 = 0xFFFF >> Self::INDEX_BITS;

    pub fn for_index_and_gen(index: usize, gen: Generation) -> Self {
        TaskId(
            (index as u16 & Self::INDEX_MASK)
                | ((gen.0 as u16 & Self::GEN_MASK) << Self::INDEX_BITS),
        )
    }

    pub fn index(&self) -> usize {
        usize::from(self.0 & Self::INDEX_MASK)
    }

    pub fn generation(&self) -> Generation {
        Generation((self.0 >> Self::INDEX_BITS) as u8)
    }
}

/// Names a particular incarnation of a call slot.
///
/// Same index-plus-generation scheme as [`TaskId`], sized for the call
/// slab. A reply that races with cancellation ends up carrying a stale
/// `CallId`; the kernel and the task-side async table both detect this via
/// the generation and drop the reply silently.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize, FromBytes, AsBytes,
)]
#[repr(transparent)]
pub struct CallId(pub u32);

impl CallId {
    pub const INDEX_BITS: u32 = 16;
    pub const INDEX_MASK: u32 = (1 << Self::INDEX_BITS) - 1;

    pub fn for_index_and_gen(index: usize, gen: u16) -> Self {
        CallId((index as u32 & Self::INDEX_MASK) | ((gen as u32) << Self::INDEX_BITS))
    }

    pub fn index(&self) -> usize {
        (self.0 & Self::INDEX_MASK) as usize
    }

    pub fn generation(&self) -> u16 {
        (self.0 >> Self::INDEX_BITS) as u16
    }
}

/// Opaque identifier of a phone, as revealed to the peer side of a
/// connection handshake in argument slot 5.
///
/// The value is composed from generational IDs, not kernel addresses, so it
/// names a connection without disclosing kernel memory layout and cannot be
/// forged into a usable descriptor.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PhoneHash(pub usize);

impl PhoneHash {
    pub fn compose(holder: TaskId, phone: usize) -> Self {
        PhoneHash(((holder.0 as usize) << 16) | (phone & 0xFFFF) | (1 << 31))
    }
}

/// System IPC methods. These have kernel-defined semantics; their numeric
/// values and argument-slot assignments are relied on by userspace.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum SysMethod {
    /// Injected by the kernel when a phone to this answerbox is hung up.
    /// Deliberately zero so receivers can test for it with one compare.
    PhoneHungup = 0,
    /// The caller clones one of its phones for the callee. ARG1 carries the
    /// caller's phone to clone on send, and the new descriptor on receipt.
    ConnectionClone = 1,
    /// Sent over a cloned phone to introduce the new connection; the kernel
    /// fills ARG5 with the hash of the phone used.
    CloneEstablish = 2,
    /// The caller asks the callee to get a phone back to the caller. The
    /// kernel allocates the reverse phone at delivery and passes its
    /// descriptor to the receiver in ARG5.
    ConnectToMe = 3,
    /// The caller asks the callee (typically the naming service) to connect
    /// it to a third party. The new phone tracks whoever answers; ARG5
    /// carries its hash while the call is in flight and the descriptor on
    /// the reply.
    ConnectMeTo = 4,
    /// Send an address-space area. ARG1 source base, ARG2 size (filled by
    /// the kernel), ARG3 flags; on accept the recipient sets ARG1 to the
    /// destination base and the kernel confirms it in ARG2.
    ShareOut = 5,
    /// Receive an address-space area. ARG1 wanted size, ARG2 user argument;
    /// on accept the recipient sets ARG1 source base, ARG2 flags, ARG3
    /// destination base, and the kernel confirms the mapping in ARG4.
    ShareIn = 6,
    /// Bulk byte transfer toward the recipient. ARG1 source address, ARG2
    /// size; the recipient may shorten the transfer but never lengthen it.
    DataWrite = 7,
    /// Bulk byte transfer from the recipient. ARG1 destination address,
    /// ARG2 size; the recipient may shorten the transfer.
    DataRead = 8,
    /// Three-party protocol: the caller proves possession of a phone to a
    /// third task (hash in ARG5); on accept the recipient gets its own
    /// phone to that task in ARG1.
    StateChangeAuthorize = 9,
    /// Debugger operations; ARG1 selects the [`DebugOp`].
    Debug = 10,
}

impl core::convert::TryFrom<usize> for SysMethod {
    type Error = ();

    fn try_from(x: usize) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::PhoneHungup),
            1 => Ok(Self::ConnectionClone),
            2 => Ok(Self::CloneEstablish),
            3 => Ok(Self::ConnectToMe),
            4 => Ok(Self::ConnectMeTo),
            5 => Ok(Self::ShareOut),
            6 => Ok(Self::ShareIn),
            7 => Ok(Self::DataWrite),
            8 => Ok(Self::DataRead),
            9 => Ok(Self::StateChangeAuthorize),
            10 => Ok(Self::Debug),
            _ => Err(()),
        }
    }
}

/// Last method number with kernel-defined semantics.
pub const LAST_SYSTEM_METHOD: usize = 511;

/// Liveness probe; answered by the kernel without delivery.
pub const METHOD_PING: usize = 512;

/// First method number free for application protocols. Methods between
/// [`LAST_SYSTEM_METHOD`] and here are reserved for the kernel-visible
/// protocol.
pub const FIRST_USER_METHOD: usize = 1024;

/// Sub-operations of [`SysMethod::Debug`], selected by ARG1.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(usize)]
pub enum DebugOp {
    /// Read the target task's status record. ARG2/ARG3 name a buffer in the
    /// caller's address space that receives the serialized [`TaskStatus`].
    TaskState = 1,
}

impl core::convert::TryFrom<usize> for DebugOp {
    type Error = ();

    fn try_from(x: usize) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(Self::TaskState),
            _ => Err(()),
        }
    }
}

/// Status record returned by the `TaskState` debug operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub alive: bool,
    pub generation: Generation,
    pub threads: usize,
    pub fault: Option<FaultInfo>,
}

/// Error codes as carried in the reply slot of a message. Zero is success,
/// negative values are one of these.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[repr(isize)]
pub enum ErrorCode {
    /// The target no longer exists.
    NoEnt = -1,
    /// The phone was torn down, or the peer died mid-conversation.
    Hangup = -2,
    /// A fixed resource (phone table, async window) is exhausted.
    Limit = -3,
    /// The target exists but cannot take the request right now.
    Busy = -4,
    /// Kernel allocation failed.
    NoMem = -5,
    /// An address range collides with an existing one.
    Overlap = -6,
    /// The request is malformed or not valid in the current state.
    Inval = -7,
    /// The operation is recognized but not supported.
    NotSup = -8,
    /// The blocked operation was interrupted.
    Intr = -9,
}

impl ErrorCode {
    /// Decodes a reply slot: `Ok(v)` for non-negative values, the error
    /// otherwise.
    pub fn from_retval(retval: isize) -> Result<usize, ErrorCode> {
        match retval {
            v if v >= 0 => Ok(v as usize),
            -1 => Err(ErrorCode::NoEnt),
            -2 => Err(ErrorCode::Hangup),
            -3 => Err(ErrorCode::Limit),
            -4 => Err(ErrorCode::Busy),
            -5 => Err(ErrorCode::NoMem),
            -6 => Err(ErrorCode::Overlap),
            -7 => Err(ErrorCode::Inval),
            -8 => Err(ErrorCode::NotSup),
            _ => Err(ErrorCode::Intr),
        }
    }

    pub fn as_retval(self) -> isize {
        self as isize
    }
}

/// Reply slot value meaning success.
pub const EOK: isize = 0;

/// Raw return values of the asynchronous send syscall when no call ID could
/// be produced.
pub const CALLRET_FATAL: isize = -1;
pub const CALLRET_TEMPORARY: isize = -2;

bitflags::bitflags! {
    /// Per-call state bits.
    pub struct CallFlags: u32 {
        /// The call has been answered and is traveling back to its caller.
        const ANSWERED = 1 << 0;
        /// The call record must not be freed on an error path; its storage
        /// is owned elsewhere.
        const STATIC_ALLOC = 1 << 1;
        /// The call passed through at least one forward.
        const FORWARDED = 1 << 2;
        /// The eventual answer carries no information anyone wants; free
        /// the record instead of routing it. Used for kernel-synthesized
        /// notifications.
        const DISCARD_ANSWER = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Flags accepted by the receive syscall.
    pub struct WaitFlags: u32 {
        /// Return immediately instead of blocking when nothing is pending.
        const NON_BLOCKING = 1 << 0;
        /// Allow the blocked receive to be interrupted.
        const INTERRUPTIBLE = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Address-space area permissions and kind.
    pub struct AreaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Demand-allocated zero-filled memory.
        const ANON = 1 << 4;
        /// Memory-mapped device registers; never demand-allocated.
        const DEVICE = 1 << 5;
    }
}

/// A record describing a fault taken by a task.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultInfo {
    /// The task violated memory access rules, either directly (`source`
    /// `User`) or by handing the kernel a bad buffer (`source` `Kernel`).
    MemoryAccess {
        /// Offending address, when the trap reports one.
        address: Option<usize>,
        source: FaultSource,
    },
    /// Arguments passed to a syscall were invalid.
    SyscallUsage(UsageError),
    /// The task tried to transmit a reply for a call it does not hold.
    BadReply,
}

impl From<UsageError> for FaultInfo {
    fn from(e: UsageError) -> Self {
        Self::SyscallUsage(e)
    }
}

/// A kernel-defined fault, arising from how a user task behaved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum UsageError {
    /// A program used an undefined syscall number.
    BadSyscallNumber,
    /// A task ID that will never be valid, as it is out of range.
    TaskOutOfRange,
    /// A phone descriptor outside the task's phone table.
    PhoneOutOfRange,
    /// A call ID that could never have been issued.
    CallOutOfRange,
    /// A buffer argument is malformed (wraps the address space or is
    /// misaligned).
    InvalidSlice,
    /// A debug request the kernel could not decode.
    BadDebugMessage,
}

/// Origin of a fault.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum FaultSource {
    /// User code did something that was intercepted by the processor.
    User,
    /// User code asked the kernel to do something bad on its behalf.
    Kernel,
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::TryFrom;

    #[test]
    fn task_id_round_trip() {
        let id = TaskId::for_index_and_gen(37, Generation(5));
        assert_eq!(id.index(), 37);
        assert_eq!(id.generation(), Generation(5));
    }

    #[test]
    fn call_id_round_trip() {
        let id = CallId::for_index_and_gen(1023, 0xBEEF);
        assert_eq!(id.index(), 1023);
        assert_eq!(id.generation(), 0xBEEF);
    }

    #[test]
    fn hangup_method_is_zero() {
        assert_eq!(SysMethod::PhoneHungup as usize, 0);
        assert_eq!(SysMethod::try_from(0), Ok(SysMethod::PhoneHungup));
    }

    #[test]
    fn retval_encoding_round_trips() {
        for &e in &[
            ErrorCode::NoEnt,
            ErrorCode::Hangup,
            ErrorCode::Limit,
            ErrorCode::Busy,
            ErrorCode::NoMem,
            ErrorCode::Overlap,
            ErrorCode::Inval,
            ErrorCode::NotSup,
            ErrorCode::Intr,
        ] {
            assert_eq!(ErrorCode::from_retval(e.as_retval()), Err(e));
        }
        assert_eq!(ErrorCode::from_retval(0), Ok(0));
        assert_eq!(ErrorCode::from_retval(42), Ok(42));
    }

    #[test]
    fn reply_slot_aliases_method() {
        let mut m = RawMessage::new(FIRST_USER_METHOD, [1, 2, 3, 4, 5]);
        m.set_retval(ErrorCode::Hangup.as_retval());
        assert_eq!(m.retval(), -2);
        assert_eq!(m.arg(5), 5);
    }
}
