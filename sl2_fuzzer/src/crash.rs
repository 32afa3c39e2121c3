//! Crash capture: the exception context saved for post-mortem reporting and the state machine
//! guarding it.

use core::{
    fmt::{self, Display, Formatter},
    sync::atomic::{AtomicU8, Ordering},
};
use std::sync::OnceLock;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Exit status of a run that crashed
pub const CRASH_EXIT_STATUS: i32 = 2;

/// Exit status of a run whose mutation failed
pub const RUN_FAILED_EXIT_STATUS: i32 = 1;

/// Exception codes the agent knows by name
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum ExceptionCode {
    /// Invalid memory access
    AccessViolation = 0xC0000005,
    /// Access to an out-of-bounds array element, with hardware bounds checking
    ArrayBoundsExceeded = 0xC000008C,
    /// A breakpoint was hit
    Breakpoint = 0x80000003,
    /// Misaligned data access
    DatatypeMisalignment = 0x80000002,
    /// Denormal floating-point operand
    FltDenormalOperand = 0xC000008D,
    /// Floating-point division by zero
    FltDivideByZero = 0xC000008E,
    /// Inexact floating-point result
    FltInexactResult = 0xC000008F,
    /// Other floating-point exception
    FltInvalidOperation = 0xC0000090,
    /// Floating-point exponent overflow
    FltOverflow = 0xC0000091,
    /// Floating-point stack over- or underflow
    FltStackCheck = 0xC0000092,
    /// Floating-point exponent underflow
    FltUnderflow = 0xC0000093,
    /// Guard page touched
    GuardPage = 0x80000001,
    /// Invalid instruction
    IllegalInstruction = 0xC000001D,
    /// Page could not be brought in
    InPageError = 0xC0000006,
    /// Integer division by zero
    IntDivideByZero = 0xC0000094,
    /// Integer overflow
    IntOverflow = 0xC0000095,
    /// Invalid disposition returned by an exception handler
    InvalidDisposition = 0xC0000026,
    /// Invalid handle used
    InvalidHandle = 0xC0000008,
    /// Continued after a noncontinuable exception
    NoncontinuableException = 0xC0000025,
    /// Privileged instruction in user mode
    PrivInstruction = 0xC0000096,
    /// Trace trap
    SingleStep = 0x80000004,
    /// Stack exhausted
    StackOverflow = 0xC00000FD,
    /// Heap corruption, as reported by the heap manager and application verifier
    HeapCorruption = 0xC0000374,
    /// `__fastfail` and `/GS` failures
    StackBufferOverrun = 0xC0000409,
    /// Assertion failure raised by the runtime
    AssertionFailure = 0xC0000420,
}

impl ExceptionCode {
    /// The platform name of the exception
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            ExceptionCode::AccessViolation => "EXCEPTION_ACCESS_VIOLATION",
            ExceptionCode::ArrayBoundsExceeded => "EXCEPTION_ARRAY_BOUNDS_EXCEEDED",
            ExceptionCode::Breakpoint => "EXCEPTION_BREAKPOINT",
            ExceptionCode::DatatypeMisalignment => "EXCEPTION_DATATYPE_MISALIGNMENT",
            ExceptionCode::FltDenormalOperand => "EXCEPTION_FLT_DENORMAL_OPERAND",
            ExceptionCode::FltDivideByZero => "EXCEPTION_FLT_DIVIDE_BY_ZERO",
            ExceptionCode::FltInexactResult => "EXCEPTION_FLT_INEXACT_RESULT",
            ExceptionCode::FltInvalidOperation => "EXCEPTION_FLT_INVALID_OPERATION",
            ExceptionCode::FltOverflow => "EXCEPTION_FLT_OVERFLOW",
            ExceptionCode::FltStackCheck => "EXCEPTION_FLT_STACK_CHECK",
            ExceptionCode::FltUnderflow => "EXCEPTION_FLT_UNDERFLOW",
            ExceptionCode::GuardPage => "EXCEPTION_GUARD_PAGE",
            ExceptionCode::IllegalInstruction => "EXCEPTION_ILLEGAL_INSTRUCTION",
            ExceptionCode::InPageError => "EXCEPTION_IN_PAGE_ERROR",
            ExceptionCode::IntDivideByZero => "EXCEPTION_INT_DIVIDE_BY_ZERO",
            ExceptionCode::IntOverflow => "EXCEPTION_INT_OVERFLOW",
            ExceptionCode::InvalidDisposition => "EXCEPTION_INVALID_DISPOSITION",
            ExceptionCode::InvalidHandle => "EXCEPTION_INVALID_HANDLE",
            ExceptionCode::NoncontinuableException => "EXCEPTION_NONCONTINUABLE_EXCEPTION",
            ExceptionCode::PrivInstruction => "EXCEPTION_PRIV_INSTRUCTION",
            ExceptionCode::SingleStep => "EXCEPTION_SINGLE_STEP",
            ExceptionCode::StackOverflow => "EXCEPTION_STACK_OVERFLOW",
            ExceptionCode::HeapCorruption => "STATUS_HEAP_CORRUPTION",
            ExceptionCode::StackBufferOverrun => "STATUS_STACK_BUFFER_OVERRUN",
            ExceptionCode::AssertionFailure => "STATUS_ASSERTION_FAILURE",
        }
    }

    /// Name of a raw exception code, `EXCEPTION_UNKNOWN` if unknown
    #[must_use]
    pub fn name_of(code: u32) -> &'static str {
        ExceptionCode::try_from(code).map_or("EXCEPTION_UNKNOWN", ExceptionCode::name)
    }
}

impl Display for ExceptionCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Exception flag marking an exception that cannot be continued
pub const EXCEPTION_NONCONTINUABLE: u32 = 0x1;

/// A copy of the platform exception record
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    /// Raw exception code, see [`ExceptionCode`]
    pub code: u32,
    /// Exception flags
    pub flags: u32,
    /// Faulting instruction
    pub address: u64,
    /// Code specific parameters, e.g. the access type and address of an access violation
    pub parameters: Vec<u64>,
}

/// Register snapshot of one thread
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadContext {
    /// Program counter
    pub pc: u64,
    /// Stack pointer
    pub sp: u64,
    /// Flags register
    pub flags: u64,
    /// General purpose registers, in the architecture's encoding order
    pub registers: Vec<u64>,
}

/// An exception as delivered by the instrumentation layer, before translation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawException {
    /// The exception record
    pub record: ExceptionRecord,
    /// Machine context as seen by the instrumentation layer
    pub mcontext: ThreadContext,
}

/// Everything preserved about the first unhandled exception of a run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionContext {
    /// The faulting thread
    pub thread_id: u64,
    /// Its registers, in the target's view
    pub thread_context: ThreadContext,
    /// Our own copy of the exception record
    pub record: ExceptionRecord,
}

/// States of the crash-capture state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum CrashState {
    /// The target runs normally
    Running = 0,
    /// An unhandled exception was captured
    Excepted = 1,
    /// The run is being reported at exit
    Reporting = 2,
    /// Everything is torn down
    Closed = 3,
}

/// The crash-capture state machine.
///
/// Only one `Running -> Excepted` transition is accepted per run. The transition is an atomic
/// compare-and-swap, so two threads faulting at once cannot both win.
#[derive(Debug)]
pub struct CrashMonitor {
    state: AtomicU8,
    context: OnceLock<ExceptionContext>,
}

impl Default for CrashMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashMonitor {
    /// A monitor in [`CrashState::Running`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(CrashState::Running.into()),
            context: OnceLock::new(),
        }
    }

    /// The current state
    #[must_use]
    pub fn state(&self) -> CrashState {
        CrashState::try_from(self.state.load(Ordering::Acquire)).unwrap_or(CrashState::Closed)
    }

    /// Attempt the `Running -> Excepted` transition. On failure, returns the state that was
    /// found instead; the caller must treat that as a fatal instrumentation failure.
    pub fn try_except(&self) -> Result<(), CrashState> {
        self.state
            .compare_exchange(
                CrashState::Running.into(),
                CrashState::Excepted.into(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|found| CrashState::try_from(found).unwrap_or(CrashState::Closed))
    }

    /// Save the context of the exception that won [`CrashMonitor::try_except`].
    pub fn record(&self, context: ExceptionContext) {
        if self.context.set(context).is_err() {
            log::warn!("exception context already recorded, keeping the first one");
        }
    }

    /// The saved exception context, if the run crashed
    #[must_use]
    pub fn context(&self) -> Option<&ExceptionContext> {
        self.context.get()
    }

    /// Has the run crashed?
    #[must_use]
    pub fn crashed(&self) -> bool {
        self.context.get().is_some()
            || matches!(self.state(), CrashState::Excepted)
    }

    /// Enter [`CrashState::Reporting`]. Returns whether the run crashed before.
    pub fn begin_reporting(&self) -> bool {
        let previous = self.state.swap(CrashState::Reporting.into(), Ordering::AcqRel);
        previous == u8::from(CrashState::Excepted) || self.context.get().is_some()
    }

    /// Enter [`CrashState::Closed`].
    pub fn close(&self) {
        self.state.store(CrashState::Closed.into(), Ordering::Release);
    }
}
