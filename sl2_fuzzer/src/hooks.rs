//! The built-in hook table and the dispatcher installing it on every module load.
//!
//! Pre-hooks capture what is knowable before the call runs and hand it to the post-hook as a
//! [`CallState`]. Post-hooks decide whether the call is targeted and drive the mutation.

use core::fmt::{self, Debug};
use std::sync::{Mutex, PoisonError};

use hashbrown::HashSet;

use crate::{
    agent::RunContext,
    capture::{read_dword, CallState, CapturedCall, Transfer},
    crash::{ExceptionCode, ExceptionRecord, RawException, EXCEPTION_NONCONTINUABLE},
    modules::ModuleInfo,
    platform::{HookPair, Platform, PostHook, PreHook, WrapContext},
    targets::{Function, TargetConfig},
};

/// Bytes flushed from the code cache around a freshly wrapped entry point
pub const FLUSH_SIZE: usize = 0x1000;

/// `PF_FASTFAIL_AVAILABLE`
pub const PF_FASTFAIL_AVAILABLE: u32 = 23;

const KERNELBASE: &[&str] = &["KERNELBASE.DLL"];
const ADVAPI32: &[&str] = &["ADVAPI32.DLL"];
const REGISTRY: &[&str] = &["KERNELBASE.DLL", "ADVAPI32.DLL"];
const WININET: &[&str] = &["WININET.DLL"];
const WINHTTP: &[&str] = &["WINHTTP.DLL"];
const WINSOCK: &[&str] = &["WS2_32.DLL"];
const CRT: &[&str] = &["UCRTBASE.DLL", "UCRTBASED.DLL", "MSVCRT.DLL"];

/// One interceptable symbol
#[derive(Clone, Copy)]
pub struct HookEntry {
    /// Exported symbol
    pub symbol: &'static str,
    /// The logical function behind it
    pub function: Function,
    /// Modules expected to export it
    pub modules: &'static [&'static str],
    /// Captures the call's arguments
    pub pre: PreHook,
    /// Mutates what the call read
    pub post: PostHook,
    /// Only hooked when registry reads are enabled
    pub requires_registry: bool,
}

impl HookEntry {
    const fn new(
        symbol: &'static str,
        function: Function,
        modules: &'static [&'static str],
        pre: PreHook,
    ) -> Self {
        Self {
            symbol,
            function,
            modules,
            pre,
            post: post_generic,
            requires_registry: false,
        }
    }

    /// Is `module` one of the modules expected to export this symbol?
    #[must_use]
    pub fn expected_in(&self, module: &ModuleInfo) -> bool {
        self.modules.iter().any(|name| module.is_named(name))
    }

    /// The pair installed for this entry
    #[must_use]
    pub fn hooks(&self) -> HookPair {
        HookPair {
            symbol: self.symbol,
            pre: self.pre,
            post: Some(self.post),
        }
    }
}

impl Debug for HookEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookEntry")
            .field("symbol", &self.symbol)
            .field("function", &self.function)
            .field("modules", &self.modules)
            .field("requires_registry", &self.requires_registry)
            .finish_non_exhaustive()
    }
}

/// Every input-reading symbol the agent knows how to intercept
pub static HOOK_TABLE: [HookEntry; 14] = [
    HookEntry::new("ReadFile", Function::ReadFile, KERNELBASE, pre_read_file),
    HookEntry::new(
        "InternetReadFile",
        Function::InternetReadFile,
        WININET,
        pre_internet_read_file,
    ),
    HookEntry::new("ReadEventLogA", Function::ReadEventLog, ADVAPI32, pre_read_event_log),
    HookEntry::new("ReadEventLogW", Function::ReadEventLog, ADVAPI32, pre_read_event_log),
    HookEntry {
        requires_registry: true,
        ..HookEntry::new(
            "RegQueryValueExW",
            Function::RegQueryValueEx,
            REGISTRY,
            pre_reg_query_value_ex,
        )
    },
    HookEntry {
        requires_registry: true,
        ..HookEntry::new(
            "RegQueryValueExA",
            Function::RegQueryValueEx,
            REGISTRY,
            pre_reg_query_value_ex,
        )
    },
    HookEntry::new(
        "WinHttpWebSocketReceive",
        Function::WinHttpWebSocketReceive,
        WINHTTP,
        pre_win_http_web_socket_receive,
    ),
    HookEntry::new(
        "WinHttpReadData",
        Function::WinHttpReadData,
        WINHTTP,
        pre_win_http_read_data,
    ),
    HookEntry::new("recv", Function::Recv, WINSOCK, pre_recv),
    HookEntry::new("fread_s", Function::FreadS, CRT, pre_fread_s),
    HookEntry::new("fread", Function::Fread, CRT, pre_fread),
    HookEntry::new("_read", Function::Read, CRT, pre_read),
    HookEntry {
        post: post_map_view_of_file,
        ..HookEntry::new(
            "MapViewOfFile",
            Function::MapViewOfFile,
            KERNELBASE,
            pre_map_view_of_file,
        )
    },
    HookEntry {
        post: post_map_view_of_file,
        ..HookEntry::new(
            "MapViewOfFileEx",
            Function::MapViewOfFile,
            KERNELBASE,
            pre_map_view_of_file,
        )
    },
];

/// A hook installed regardless of the target configuration, keeping platform fail-fast paths
/// from bypassing crash capture.
#[derive(Clone, Copy, Debug)]
pub struct Mitigation {
    /// The exporting module
    pub module: &'static str,
    /// What gets installed there
    pub hooks: HookPair,
}

/// Every mitigation
pub static MITIGATIONS: [Mitigation; 4] = [
    Mitigation {
        module: "KERNELBASE.DLL",
        hooks: HookPair {
            symbol: "IsProcessorFeaturePresent",
            pre: pre_is_processor_feature_present,
            post: Some(post_is_processor_feature_present),
        },
    },
    Mitigation {
        module: "KERNELBASE.DLL",
        hooks: HookPair {
            symbol: "UnhandledExceptionFilter",
            pre: pre_unhandled_exception_filter,
            post: None,
        },
    },
    Mitigation {
        module: "VERIFIER.DLL",
        hooks: HookPair {
            symbol: "VerifierStopMessage",
            pre: pre_verifier_stop_message,
            post: None,
        },
    },
    Mitigation {
        module: "VERIFIER.DLL",
        hooks: HookPair {
            symbol: "VerifierStopMessageEx",
            pre: pre_verifier_stop_message,
            post: None,
        },
    },
];

/// Installs hooks as modules load.
///
/// Every address is wrapped at most once per load of its module, however often the load is
/// reported.
#[derive(Debug, Default)]
pub struct HookDispatcher {
    installed: Mutex<HashSet<usize>>,
    registry: bool,
}

impl HookDispatcher {
    /// A dispatcher; `registry` enables the registry-read hooks
    #[must_use]
    pub fn new(registry: bool) -> Self {
        Self {
            installed: Mutex::new(HashSet::new()),
            registry,
        }
    }

    /// Install every mitigation and every selected hook `module` exports. Returns the number of
    /// hooks newly installed.
    pub fn on_module_load(
        &self,
        platform: &dyn Platform,
        targets: &TargetConfig,
        module: &ModuleInfo,
    ) -> usize {
        let mut count = 0;

        for mitigation in MITIGATIONS.iter().filter(|m| module.is_named(m.module)) {
            log::debug!("loading {} mitigation", mitigation.hooks.symbol);
            if let Some(address) = platform.symbol_address(module, mitigation.hooks.symbol) {
                count += usize::from(self.install(platform, address, mitigation.hooks, module));
            }
        }
        if module.is_named("OLE32.DLL") {
            log::info!("OLE32.DLL loaded, but there is no DllDebugObjectRpcHook mitigation");
        }

        for entry in &HOOK_TABLE {
            if entry.requires_registry && !self.registry {
                continue;
            }
            if !entry.expected_in(module) {
                continue;
            }
            if !targets.is_selected(entry.function, entry.symbol, &module.name) {
                continue;
            }
            let Some(address) = platform.symbol_address(module, entry.symbol) else {
                continue;
            };
            count += usize::from(self.install(platform, address, entry.hooks(), module));
        }

        count
    }

    fn install(
        &self,
        platform: &dyn Platform,
        address: usize,
        hooks: HookPair,
        module: &ModuleInfo,
    ) -> bool {
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        if installed.contains(&address) {
            log::debug!("{} @ {address:#x} is already wrapped", hooks.symbol);
            return false;
        }

        platform.flush_region(address, FLUSH_SIZE);
        match platform.wrap(address, hooks) {
            Ok(()) => {
                log::debug!("wrapped {} @ {address:#x} in {}", hooks.symbol, module.name);
                installed.insert(address);
                true
            }
            Err(err) => {
                log::warn!(
                    "failed to wrap {} @ {address:#x} in {}: {err}",
                    hooks.symbol,
                    module.name
                );
                false
            }
        }
    }

    /// Is `address` wrapped?
    #[must_use]
    pub fn is_installed(&self, address: usize) -> bool {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&address)
    }

    /// `module` was unloaded, taking its wrapped functions with it. Returns the number of hooks
    /// forgotten; a later load of a module at the same place gets hooked afresh.
    pub fn on_module_unload(&self, module: &ModuleInfo) -> usize {
        let mut installed = self.installed.lock().unwrap_or_else(PoisonError::into_inner);
        let before = installed.len();
        installed.retain(|address| !module.contains(*address));
        let pruned = before - installed.len();
        if pruned > 0 {
            log::debug!("{} unloaded, forgetting {pruned} hooks", module.name);
        }
        pruned
    }

    /// Forget every installed hook, once the platform removed them.
    pub fn clear(&self) {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Start a call reading `requested` bytes into `buffer`, fingerprinted by `handle`.
fn capture_handle_read(
    ctx: &RunContext,
    wrap: &dyn WrapContext,
    function: Function,
    handle: usize,
    buffer: usize,
    requested: usize,
    transfer: Transfer,
) -> Option<CallState> {
    let platform = ctx.platform();
    let mut call = CapturedCall::new(function, buffer, requested);
    call.transfer = transfer;
    call.return_address = wrap.return_address();
    call.source = platform.handle_path(handle);
    call.position = platform.file_position(handle).unwrap_or_default();
    call.hash_args();
    Some(ctx.ledger().capture(call))
}

/// `ReadFile(hFile, lpBuffer, nNumberOfBytesToRead, lpNumberOfBytesRead, lpOverlapped)`
fn pre_read_file(ctx: &RunContext, wrap: &mut dyn WrapContext) -> Option<CallState> {
    log::debug!("<in pre_read_file>");
    capture_handle_read(
        ctx,
        wrap,
        Function::ReadFile,
        wrap.arg(0),
        wrap.arg(1),
        wrap.arg(2),
        Transfer::OutPointer(wrap.arg(3)),
    )
}

/// `InternetReadFile(hFile, lpBuffer, dwNumberOfBytesToRead, lpdwNumberOfBytesRead)`
fn pre_internet_read_file(ctx: &RunContext, wrap: &mut dyn WrapContext) -> Option<CallState> {
    capture_handle_read(
        ctx,
        wrap,
        Function::InternetReadFile,
        wrap.arg(0),
        wrap.arg(1),
        wrap.arg(2),
        Transfer::OutPointer(wrap.arg(3)),
    )
}

/// `ReadEventLog(hEventLog, dwReadFlags, dwRecordOffset, lpBuffer, nNumberOfBytesToRead,
/// pnBytesRead, pnMinNumberOfBytesNeeded)`
fn pre_read_event_log(ctx: &RunContext, wrap: &mut dyn WrapContext) -> Option<CallState> {
    let mut call = CapturedCall::new(Function::ReadEventLog, wrap.arg(3), wrap.arg(4));
    call.transfer = Transfer::OutPointer(wrap.arg(5));
    call.return_address = wrap.return_address();
    call.source = ctx.platform().handle_path(wrap.arg(0));
    call.position = wrap.arg(2) as u64;
    call.hash_args();
    Some(ctx.ledger().capture(call))
}

/// `RegQueryValueEx(hKey, lpValueName, lpReserved, lpType, lpData, lpcbData)`
fn pre_reg_query_value_ex(ctx: &RunContext, wrap: &mut dyn WrapContext) -> Option<CallState> {
    let (data, size) = (wrap.arg(4), wrap.arg(5));
    // size queries without a buffer have nothing to mutate
    if data == 0 || size == 0 {
        return None;
    }
    let requested = match read_dword(ctx.platform(), size) {
        Ok(requested) => requested as usize,
        Err(err) => {
            log::warn!("RegQueryValueEx: cannot read lpcbData: {err}");
            return None;
        }
    };
    capture_handle_read(
        ctx,
        wrap,
        Function::RegQueryValueEx,
        wrap.arg(0),
        data,
        requested,
        Transfer::OutPointer(size),
    )
}

/// `WinHttpWebSocketReceive(hWebSocket, pvBuffer, dwBufferLength, pdwBytesRead, peBufferType)`
fn pre_win_http_web_socket_receive(
    ctx: &RunContext,
    wrap: &mut dyn WrapContext,
) -> Option<CallState> {
    capture_handle_read(
        ctx,
        wrap,
        Function::WinHttpWebSocketReceive,
        wrap.arg(0),
        wrap.arg(1),
        wrap.arg(2),
        Transfer::OutPointer(wrap.arg(3)),
    )
}

/// `WinHttpReadData(hRequest, lpBuffer, dwNumberOfBytesToRead, lpdwNumberOfBytesRead)`
fn pre_win_http_read_data(ctx: &RunContext, wrap: &mut dyn WrapContext) -> Option<CallState> {
    capture_handle_read(
        ctx,
        wrap,
        Function::WinHttpReadData,
        wrap.arg(0),
        wrap.arg(1),
        wrap.arg(2),
        Transfer::OutPointer(wrap.arg(3)),
    )
}

/// `recv(s, buf, len, flags)`
fn pre_recv(ctx: &RunContext, wrap: &mut dyn WrapContext) -> Option<CallState> {
    capture_handle_read(
        ctx,
        wrap,
        Function::Recv,
        wrap.arg(0),
        wrap.arg(1),
        wrap.arg(2),
        Transfer::ReturnInt,
    )
}

/// `fread_s(buffer, bufferSize, elementSize, count, stream)`
fn pre_fread_s(ctx: &RunContext, wrap: &mut dyn WrapContext) -> Option<CallState> {
    let elem_size = wrap.arg(2);
    let requested = wrap.arg(1).min(elem_size.saturating_mul(wrap.arg(3)));
    let mut call = CapturedCall::new(Function::FreadS, wrap.arg(0), requested);
    call.transfer = Transfer::ReturnValue { elem_size };
    call.return_address = wrap.return_address();
    call.hash_args();
    Some(ctx.ledger().capture(call))
}

/// `fread(buffer, size, count, stream)`
fn pre_fread(ctx: &RunContext, wrap: &mut dyn WrapContext) -> Option<CallState> {
    let elem_size = wrap.arg(1);
    let requested = elem_size.saturating_mul(wrap.arg(2));
    let mut call = CapturedCall::new(Function::Fread, wrap.arg(0), requested);
    call.transfer = Transfer::ReturnValue { elem_size };
    call.return_address = wrap.return_address();
    call.hash_args();
    Some(ctx.ledger().capture(call))
}

/// `_read(fd, buffer, count)`
fn pre_read(ctx: &RunContext, wrap: &mut dyn WrapContext) -> Option<CallState> {
    let mut call = CapturedCall::new(Function::Read, wrap.arg(1), wrap.arg(2));
    call.transfer = Transfer::ReturnInt;
    call.return_address = wrap.return_address();
    call.hash_args();
    Some(ctx.ledger().capture(call))
}

/// `MapViewOfFile(hFileMappingObject, dwDesiredAccess, dwFileOffsetHigh, dwFileOffsetLow,
/// dwNumberOfBytesToMap)`. The view itself is only known after the call.
fn pre_map_view_of_file(ctx: &RunContext, wrap: &mut dyn WrapContext) -> Option<CallState> {
    let high = wrap.arg(2) as u64 & 0xffff_ffff;
    let low = wrap.arg(3) as u64 & 0xffff_ffff;
    let mut call = CapturedCall::new(Function::MapViewOfFile, 0, wrap.arg(4));
    call.position = (high << 32) | low;
    call.return_address = wrap.return_address();
    Some(ctx.ledger().capture(call))
}

/// Mutate whatever a generic read call wrote.
fn post_generic(ctx: &RunContext, wrap: Option<&mut dyn WrapContext>, state: CallState) {
    let _release = ctx.ledger().release_on_drop();
    let CallState::Read(mut call) = state else {
        return;
    };
    let Some(wrap) = wrap else {
        log::debug!("{} did not return normally, skipping", call.function);
        return;
    };

    log::debug!("<in post_generic>");
    let count = ctx.ledger().increment_call_count(call.function);
    if call.failed(wrap) {
        log::debug!("{} failed, nothing to mutate", call.function);
        return;
    }
    if !ctx.is_function_targeted(&call, count) {
        return;
    }

    call.clamp_to_transferred(wrap, ctx.platform());
    if let Err(err) = ctx.mutate(&call) {
        ctx.fail_run(&err);
    }
}

/// Mutate a freshly mapped view. Its address is the call's return value.
fn post_map_view_of_file(ctx: &RunContext, wrap: Option<&mut dyn WrapContext>, state: CallState) {
    let _release = ctx.ledger().release_on_drop();
    let CallState::Read(mut call) = state else {
        return;
    };
    let Some(wrap) = wrap else {
        return;
    };

    log::debug!("<in post_map_view_of_file>");
    let count = ctx.ledger().increment_call_count(call.function);
    let platform = ctx.platform();

    call.buffer = wrap.retval();
    if call.buffer == 0 {
        log::debug!("MapViewOfFile failed, nothing to mutate");
        return;
    }

    if call.requested == 0 {
        log::debug!("MapViewOfFile called with dwNumberOfBytesToMap=0, querying memory");
        match platform.region_size(call.buffer) {
            Some(size) => call.requested = size,
            None => log::warn!("cannot query the region mapped at {:#x}", call.buffer),
        }
    }

    call.source = platform.mapped_file_name(call.buffer);
    let interesting = call.source.is_some();
    if !interesting {
        log::warn!(
            "no filename for a mapped view of {} bytes, assuming uninteresting",
            call.requested
        );
    }
    call.hash_args();

    if interesting && ctx.is_function_targeted(&call, count) {
        if let Err(err) = ctx.mutate(&call) {
            ctx.fail_run(&err);
        }
    }
}

/// Remember which processor feature is being asked about.
fn pre_is_processor_feature_present(
    _ctx: &RunContext,
    wrap: &mut dyn WrapContext,
) -> Option<CallState> {
    Some(CallState::FeatureQuery(wrap.arg(0) as u32))
}

/// Deny fast-fail support, so `__fastfail` raises a regular exception crash capture sees.
fn post_is_processor_feature_present(
    _ctx: &RunContext,
    wrap: Option<&mut dyn WrapContext>,
    state: CallState,
) {
    if let (Some(wrap), CallState::FeatureQuery(PF_FASTFAIL_AVAILABLE)) = (wrap, state) {
        log::debug!("denying PF_FASTFAIL_AVAILABLE");
        wrap.set_retval(0);
    }
}

/// The target is about to die of an unhandled exception: capture it first.
fn pre_unhandled_exception_filter(
    ctx: &RunContext,
    wrap: &mut dyn WrapContext,
) -> Option<CallState> {
    match ctx.platform().read_exception_pointers(wrap.arg(0)) {
        Some(exception) => ctx.on_exception(&exception),
        None => log::warn!("UnhandledExceptionFilter called without readable exception pointers"),
    }
    None
}

/// Application verifier found heap corruption.
fn pre_verifier_stop_message(ctx: &RunContext, wrap: &mut dyn WrapContext) -> Option<CallState> {
    let exception = RawException {
        record: ExceptionRecord {
            code: ExceptionCode::HeapCorruption.into(),
            flags: EXCEPTION_NONCONTINUABLE,
            address: wrap.return_address() as u64,
            parameters: Vec::new(),
        },
        mcontext: wrap.mcontext(),
    };
    ctx.on_exception(&exception);
    None
}
