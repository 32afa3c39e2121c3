//! The capabilities the agent borrows from the dynamic binary instrumentation backend.
//!
//! The engine never touches target memory, threads or code caches directly; everything goes
//! through a [`Platform`], so the same hooks run on top of any backend that can wrap function
//! entry points and instrument freshly compiled basic blocks.

use core::fmt::{self, Debug};
use std::path::Path;

use sl2_bolts::Error;

use crate::{
    agent::RunContext,
    capture::CallState,
    crash::{ExceptionContext, RawException, ThreadContext},
    modules::ModuleInfo,
};

/// Runs before the wrapped function. Whatever it returns is handed to the post-hook of the
/// same call, on the same thread. Returning `None` skips the post-hook.
pub type PreHook = fn(&RunContext, &mut dyn WrapContext) -> Option<CallState>;

/// Runs after the wrapped function returned. The context is `None` if the call did not
/// complete normally (an exception or a `longjmp` unwound through it).
pub type PostHook = fn(&RunContext, Option<&mut dyn WrapContext>, CallState);

/// The pair of callbacks installed at one function address.
#[derive(Clone, Copy)]
pub struct HookPair {
    /// Symbol the pair was resolved for, for diagnostics only
    pub symbol: &'static str,
    /// Called on entry
    pub pre: PreHook,
    /// Called on return, if any
    pub post: Option<PostHook>,
}

impl Debug for HookPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookPair")
            .field("symbol", &self.symbol)
            .field("post", &self.post.is_some())
            .finish_non_exhaustive()
    }
}

/// Argument access for an intercepted call.
pub trait WrapContext {
    /// The `index`th pointer-sized argument.
    fn arg(&self, index: usize) -> usize;

    /// The raw return value. Only meaningful in a post-hook.
    fn retval(&self) -> usize;

    /// Overwrite the value the target will see returned.
    fn set_retval(&mut self, value: usize);

    /// Address the wrapped function will return to.
    fn return_address(&self) -> usize;

    /// Register state of the calling thread, in the target's view.
    fn mcontext(&self) -> ThreadContext;
}

/// Post-mortem support: everything needed to turn a caught exception into a crash artifact
/// without leaking instrumentation state into it.
pub trait Postmortem {
    /// Translate the instrumentation-side machine context of `exception` into the context the
    /// target itself would have observed.
    fn capture_context(&self, exception: &RawException) -> ThreadContext;

    /// Switch the current thread to the target's execution state.
    fn switch_to_app_state(&self);

    /// Switch the current thread back to the instrumentation's execution state.
    fn switch_to_instrumentation_state(&self);

    /// Write a post-mortem snapshot of the whole process to `path`.
    fn write_postmortem(&self, path: &Path, context: &ExceptionContext) -> Result<(), Error>;
}

/// The instrumentation backend hosting the agent.
///
/// Module-load notifications and basic-block compilation are expected to be serialized by the
/// backend; hook callbacks may arrive on any target thread concurrently.
pub trait Platform: Postmortem + Send + Sync {
    /// Name of the main executable, as reported for its module
    fn application_name(&self) -> &str;

    /// Id of the target process
    fn process_id(&self) -> u32;

    /// Id of the calling target thread
    fn current_thread_id(&self) -> u64;

    /// Bring up the wrapping and register-reservation layers.
    fn init(&self) -> Result<(), Error>;

    /// Start calling [`RunContext::on_basic_block`] for every newly compiled block.
    fn enable_block_instrumentation(&self) -> Result<(), Error>;

    /// Exported address of `symbol` inside `module`
    fn symbol_address(&self, module: &ModuleInfo, symbol: &str) -> Option<usize>;

    /// Drop any code cache entries overlapping `[address, address + size)`.
    fn flush_region(&self, address: usize, size: usize);

    /// Install `hooks` at `address`. Fails if the address is already wrapped.
    fn wrap(&self, address: usize, hooks: HookPair) -> Result<(), Error>;

    /// Copy `len` bytes of target memory.
    fn read_memory(&self, address: usize, len: usize) -> Result<Vec<u8>, Error>;

    /// Overwrite target memory with `bytes`.
    fn write_memory(&self, address: usize, bytes: &[u8]) -> Result<(), Error>;

    /// Size of the mapped region starting at `address`
    fn region_size(&self, address: usize) -> Option<usize>;

    /// Path of the file backing the mapped view at `address`
    fn mapped_file_name(&self, address: usize) -> Option<String>;

    /// Path of the file or device behind an open `handle`
    fn handle_path(&self, handle: usize) -> Option<String>;

    /// Current file pointer of an open `handle`
    fn file_position(&self, handle: usize) -> Option<u64>;

    /// Decode the exception pointers structure at `address`.
    fn read_exception_pointers(&self, address: usize) -> Option<RawException>;

    /// Remove every installed wrap. Runs before [`Platform::shutdown`].
    fn unwrap_all(&self);

    /// Tear down the dispatch and register-reservation layers.
    fn shutdown(&self);

    /// Terminate the target with `status`. Real backends do not return from this.
    fn exit_process(&self, status: i32);

    /// Abort immediately, without running any exit callbacks.
    fn abort(&self);
}

/// Keeps the current thread in the target's execution state while alive.
///
/// Post-mortem artifacts and context snapshots have to be taken from the target's point of
/// view; dropping the guard switches back on every exit path.
pub struct AppStateGuard<'a, P>
where
    P: Postmortem + ?Sized,
{
    platform: &'a P,
}

impl<'a, P> AppStateGuard<'a, P>
where
    P: Postmortem + ?Sized,
{
    /// Switch to the target's state until the guard is dropped.
    pub fn new(platform: &'a P) -> Self {
        platform.switch_to_app_state();
        Self { platform }
    }
}

impl<P> Drop for AppStateGuard<'_, P>
where
    P: Postmortem + ?Sized,
{
    fn drop(&mut self) {
        self.platform.switch_to_instrumentation_state();
    }
}

impl<P> Debug for AppStateGuard<'_, P>
where
    P: Postmortem + ?Sized,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AppStateGuard")
    }
}
