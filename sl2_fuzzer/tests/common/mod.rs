//! An emulated instrumentation backend: a fake address space, recorded wraps, exits and
//! post-mortems, and a way to "call" wrapped functions through their hooks.

#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Barrier, Mutex, MutexGuard, PoisonError},
};

use hashbrown::HashMap;
use sl2_bolts::Error;
use sl2_fuzzer::{
    coordinator::{InMemoryCoordinator, StreamCoordinator},
    crash::{ExceptionContext, RawException, ThreadContext},
    modules::ModuleInfo,
    mutation::{Mutation, MutationEngine, MutationStrategy},
    options::AgentOptions,
    platform::{HookPair, Platform, Postmortem, WrapContext},
    RunContext,
};
use tempfile::NamedTempFile;
use uuid::Uuid;

pub const APPLICATION: &str = "target.exe";
pub const PID: u32 = 4242;

pub const MAIN_BASE: usize = 0x40_0000;
pub const MAIN_END: usize = 0x48_0000;

pub const KERNELBASE_BASE: usize = 0x7ff0_0000;
pub const KERNELBASE_END: usize = 0x7ff8_0000;
pub const READ_FILE: usize = 0x7ff0_1000;
pub const MAP_VIEW_OF_FILE: usize = 0x7ff0_2000;
pub const IS_PROCESSOR_FEATURE_PRESENT: usize = 0x7ff0_3000;
pub const UNHANDLED_EXCEPTION_FILTER: usize = 0x7ff0_4000;
pub const REG_QUERY_VALUE_EX_W: usize = 0x7ff0_5000;

pub const WS2_32_BASE: usize = 0x7fa0_0000;
pub const WS2_32_END: usize = 0x7fa4_0000;
pub const RECV: usize = 0x7fa0_1000;

pub const ARENA_ID: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

pub const FILE_HANDLE: usize = 0x44;
pub const SOCKET: usize = 0x1f0;
pub const INPUT_PATH: &str = "D:\\inputs\\seed.bin";

pub fn main_module() -> ModuleInfo {
    ModuleInfo::new(MAIN_BASE, MAIN_END, "D:\\target\\target.exe")
}

pub fn ws2_32() -> ModuleInfo {
    ModuleInfo::new(
        WS2_32_BASE,
        WS2_32_END,
        "C:\\Windows\\System32\\ws2_32.dll",
    )
}

pub fn kernelbase() -> ModuleInfo {
    ModuleInfo::new(
        KERNELBASE_BASE,
        KERNELBASE_END,
        "C:\\Windows\\System32\\KERNELBASE.dll",
    )
}

/// Everything the emulated backend saw
#[derive(Debug, Default)]
pub struct State {
    pub thread_id: u64,
    pub regions: BTreeMap<usize, Vec<u8>>,
    pub exports: HashMap<(String, String), usize>,
    pub wraps: HashMap<usize, HookPair>,
    pub wrap_attempts: Vec<usize>,
    pub flushed: Vec<(usize, usize)>,
    pub handles: HashMap<usize, (String, u64)>,
    pub mapped_files: HashMap<usize, String>,
    pub exception_pointers: HashMap<usize, RawException>,
    pub events: Vec<&'static str>,
    pub exits: Vec<i32>,
    pub aborts: usize,
    pub dumps: Vec<(PathBuf, ExceptionContext)>,
    pub fail_init: bool,
}

impl State {
    fn region(&self, address: usize, len: usize) -> Option<(usize, usize)> {
        let (base, bytes) = self.regions.range(..=address).next_back()?;
        let offset = address - base;
        (offset + len <= bytes.len()).then_some((*base, offset))
    }
}

#[derive(Clone, Debug)]
pub struct EmulatedPlatform {
    name: String,
    state: Arc<Mutex<State>>,
}

impl Default for EmulatedPlatform {
    fn default() -> Self {
        Self::new(APPLICATION)
    }
}

impl EmulatedPlatform {
    pub fn new(name: &str) -> Self {
        let platform = Self {
            name: name.to_string(),
            state: Arc::new(Mutex::new(State {
                thread_id: 1,
                ..State::default()
            })),
        };
        for (symbol, address) in [
            ("ReadFile", READ_FILE),
            ("MapViewOfFile", MAP_VIEW_OF_FILE),
            ("IsProcessorFeaturePresent", IS_PROCESSOR_FEATURE_PRESENT),
            ("UnhandledExceptionFilter", UNHANDLED_EXCEPTION_FILTER),
            ("RegQueryValueExW", REG_QUERY_VALUE_EX_W),
        ] {
            platform.export("KERNELBASE.DLL", symbol, address);
        }
        platform.export("WS2_32.DLL", "recv", RECV);
        platform.open_handle(FILE_HANDLE, INPUT_PATH, 0);
        platform
    }

    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn export(&self, module: &str, symbol: &str, address: usize) {
        self.state()
            .exports
            .insert((module.to_ascii_uppercase(), symbol.to_string()), address);
    }

    pub fn map(&self, base: usize, bytes: Vec<u8>) {
        self.state().regions.insert(base, bytes);
    }

    pub fn map_file(&self, base: usize, bytes: Vec<u8>, path: &str) {
        self.map(base, bytes);
        self.state().mapped_files.insert(base, path.to_string());
    }

    pub fn open_handle(&self, handle: usize, path: &str, position: u64) {
        self.state()
            .handles
            .insert(handle, (path.to_string(), position));
    }

    /// The target unloads `module`: its wraps go away with its code.
    pub fn unload(&self, module: &ModuleInfo) {
        self.state()
            .wraps
            .retain(|address, _| !module.contains(*address));
    }

    pub fn set_thread(&self, thread_id: u64) {
        self.state().thread_id = thread_id;
    }

    pub fn memory(&self, address: usize, len: usize) -> Vec<u8> {
        self.read_memory(address, len).unwrap()
    }

    pub fn poke(&self, address: usize, bytes: &[u8]) {
        self.write_memory(address, bytes).unwrap();
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.state().events.clone()
    }

    pub fn exits(&self) -> Vec<i32> {
        self.state().exits.clone()
    }

    pub fn aborts(&self) -> usize {
        self.state().aborts
    }

    pub fn is_wrapped(&self, address: usize) -> bool {
        self.state().wraps.contains_key(&address)
    }

    /// Call the function at `address` the way the target would: through its hooks, if any.
    /// `body` stands in for the function itself and returns its return value.
    pub fn call<F>(&self, ctx: &RunContext, address: usize, args: &[usize], body: F) -> usize
    where
        F: FnOnce(&EmulatedPlatform) -> usize,
    {
        let hooks = self.state().wraps.get(&address).copied();
        let mut wrap = EmulatedWrap::new(args, MAIN_BASE + 0x1234);
        let Some(hooks) = hooks else {
            return body(self);
        };

        let state = (hooks.pre)(ctx, &mut wrap);
        wrap.retval = body(self);
        if let (Some(state), Some(post)) = (state, hooks.post) {
            post(ctx, Some(&mut wrap), state);
        }
        wrap.retval
    }

    /// Like [`EmulatedPlatform::call`], but the function never returns normally.
    pub fn call_unwinding(&self, ctx: &RunContext, address: usize, args: &[usize]) {
        let hooks = self.state().wraps.get(&address).copied();
        let mut wrap = EmulatedWrap::new(args, MAIN_BASE + 0x1234);
        if let Some(hooks) = hooks {
            if let (Some(state), Some(post)) = ((hooks.pre)(ctx, &mut wrap), hooks.post) {
                post(ctx, None, state);
            }
        }
    }
}

impl Postmortem for EmulatedPlatform {
    fn capture_context(&self, exception: &RawException) -> ThreadContext {
        ThreadContext {
            pc: exception.record.address,
            ..exception.mcontext.clone()
        }
    }

    fn switch_to_app_state(&self) {
        self.state().events.push("app");
    }

    fn switch_to_instrumentation_state(&self) {
        self.state().events.push("instrumentation");
    }

    fn write_postmortem(&self, path: &Path, context: &ExceptionContext) -> Result<(), Error> {
        let mut state = self.state();
        state.events.push("postmortem");
        state.dumps.push((path.to_path_buf(), context.clone()));
        Ok(())
    }
}

impl Platform for EmulatedPlatform {
    fn application_name(&self) -> &str {
        &self.name
    }

    fn process_id(&self) -> u32 {
        PID
    }

    fn current_thread_id(&self) -> u64 {
        self.state().thread_id
    }

    fn init(&self) -> Result<(), Error> {
        let mut state = self.state();
        if state.fail_init {
            return Err(Error::unsupported("no wrapping layer"));
        }
        state.events.push("init");
        Ok(())
    }

    fn enable_block_instrumentation(&self) -> Result<(), Error> {
        self.state().events.push("blocks");
        Ok(())
    }

    fn symbol_address(&self, module: &ModuleInfo, symbol: &str) -> Option<usize> {
        self.state()
            .exports
            .get(&(module.name.to_ascii_uppercase(), symbol.to_string()))
            .copied()
    }

    fn flush_region(&self, address: usize, size: usize) {
        self.state().flushed.push((address, size));
    }

    fn wrap(&self, address: usize, hooks: HookPair) -> Result<(), Error> {
        let mut state = self.state();
        state.wrap_attempts.push(address);
        if state.wraps.contains_key(&address) {
            return Err(Error::illegal_state(format!("{address:#x} is already wrapped")));
        }
        state.wraps.insert(address, hooks);
        Ok(())
    }

    fn read_memory(&self, address: usize, len: usize) -> Result<Vec<u8>, Error> {
        let state = self.state();
        let (base, offset) = state
            .region(address, len)
            .ok_or_else(|| Error::illegal_argument(format!("{address:#x} is not mapped")))?;
        Ok(state.regions[&base][offset..offset + len].to_vec())
    }

    fn write_memory(&self, address: usize, bytes: &[u8]) -> Result<(), Error> {
        let mut state = self.state();
        let (base, offset) = state
            .region(address, bytes.len())
            .ok_or_else(|| Error::illegal_argument(format!("{address:#x} is not mapped")))?;
        let region = state
            .regions
            .get_mut(&base)
            .ok_or_else(|| Error::key_not_found(format!("{base:#x}")))?;
        region[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn region_size(&self, address: usize) -> Option<usize> {
        let state = self.state();
        let (base, offset) = state.region(address, 0)?;
        Some(state.regions[&base].len() - offset)
    }

    fn mapped_file_name(&self, address: usize) -> Option<String> {
        self.state().mapped_files.get(&address).cloned()
    }

    fn handle_path(&self, handle: usize) -> Option<String> {
        self.state().handles.get(&handle).map(|(path, _)| path.clone())
    }

    fn file_position(&self, handle: usize) -> Option<u64> {
        self.state().handles.get(&handle).map(|(_, position)| *position)
    }

    fn read_exception_pointers(&self, address: usize) -> Option<RawException> {
        self.state().exception_pointers.get(&address).cloned()
    }

    fn unwrap_all(&self) {
        let mut state = self.state();
        state.wraps.clear();
        state.events.push("unwrap_all");
    }

    fn shutdown(&self) {
        self.state().events.push("shutdown");
    }

    fn exit_process(&self, status: i32) {
        self.state().exits.push(status);
    }

    fn abort(&self) {
        let mut state = self.state();
        state.aborts += 1;
        state.events.push("abort");
    }
}

/// Arguments and return value of one emulated call
#[derive(Debug, Default)]
pub struct EmulatedWrap {
    pub args: Vec<usize>,
    pub retval: usize,
    pub return_address: usize,
}

impl EmulatedWrap {
    pub fn new(args: &[usize], return_address: usize) -> Self {
        Self {
            args: args.to_vec(),
            retval: 0,
            return_address,
        }
    }
}

impl WrapContext for EmulatedWrap {
    fn arg(&self, index: usize) -> usize {
        self.args.get(index).copied().unwrap_or_default()
    }

    fn retval(&self) -> usize {
        self.retval
    }

    fn set_retval(&mut self, value: usize) {
        self.retval = value;
    }

    fn return_address(&self) -> usize {
        self.return_address
    }

    fn mcontext(&self) -> ThreadContext {
        ThreadContext {
            pc: self.return_address as u64,
            ..ThreadContext::default()
        }
    }
}

/// Flips every byte and logs which strategy it was asked for.
#[derive(Clone, Debug, Default)]
pub struct XorEngine {
    pub requests: Arc<Mutex<Vec<Option<MutationStrategy>>>>,
    pub fail: bool,
}

impl XorEngine {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<Option<MutationStrategy>> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn apply(&self, request: Option<MutationStrategy>, mutation: &mut Mutation) -> Result<(), Error> {
        if self.fail {
            return Err(Error::unknown("engine failure"));
        }
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        mutation.buffer.iter_mut().for_each(|b| *b ^= 0xff);
        mutation.strategy = Some(request.unwrap_or_default());
        Ok(())
    }
}

impl MutationEngine for XorEngine {
    fn mutate(&mut self, mutation: &mut Mutation) -> Result<(), Error> {
        self.apply(None, mutation)
    }

    fn mutate_with(
        &mut self,
        strategy: MutationStrategy,
        mutation: &mut Mutation,
    ) -> Result<(), Error> {
        self.apply(Some(strategy), mutation)
    }
}

/// Flips every byte like [`XorEngine`], but only once the test lets it: it waits on `entered`
/// when a mutation starts and on `release` before doing it.
#[derive(Clone, Debug)]
pub struct GatedEngine {
    pub entered: Arc<Barrier>,
    pub release: Arc<Barrier>,
}

impl GatedEngine {
    pub fn new() -> Self {
        Self {
            entered: Arc::new(Barrier::new(2)),
            release: Arc::new(Barrier::new(2)),
        }
    }

    fn apply(&self, mutation: &mut Mutation) -> Result<(), Error> {
        self.entered.wait();
        self.release.wait();
        mutation.buffer.iter_mut().for_each(|b| *b ^= 0xff);
        Ok(())
    }
}

impl MutationEngine for GatedEngine {
    fn mutate(&mut self, mutation: &mut Mutation) -> Result<(), Error> {
        self.apply(mutation)
    }

    fn mutate_with(
        &mut self,
        _strategy: MutationStrategy,
        mutation: &mut Mutation,
    ) -> Result<(), Error> {
        self.apply(mutation)
    }
}

/// A coordinator connection that went away
#[derive(Debug)]
pub struct Hangup;

impl Read for Hangup {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::ConnectionReset.into())
    }
}

impl Write for Hangup {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::ErrorKind::ConnectionRefused.into())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn unreachable_coordinator() -> StreamCoordinator<Hangup> {
    StreamCoordinator::new(Hangup)
}

/// Select every call of ReadFile and MapViewOfFile.
pub const DEFAULT_TARGETS: &str = r#"[
    {"function": "ReadFile", "selected": true},
    {"function": "MapViewOfFile", "selected": true}
]"#;

pub fn targets_file(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(json.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

/// One emulated target process, ready to attach to
pub struct Harness {
    pub platform: EmulatedPlatform,
    pub coordinator: InMemoryCoordinator,
    pub engine: XorEngine,
    pub targets: NamedTempFile,
    pub run_id: Uuid,
    pub crash_dir: tempfile::TempDir,
}

impl Harness {
    pub fn new(targets: &str) -> Self {
        let crash_dir = tempfile::tempdir().unwrap();
        Self {
            platform: EmulatedPlatform::default(),
            coordinator: InMemoryCoordinator::new(crash_dir.path()),
            engine: XorEngine::default(),
            targets: targets_file(targets),
            run_id: Uuid::new_v4(),
            crash_dir,
        }
    }

    /// The agent's command line: targets, run id, then `extra`
    pub fn args(&self, extra: &[&str]) -> Vec<String> {
        let mut args = vec![
            "sl2-fuzzer".to_string(),
            "-t".to_string(),
            self.targets.path().to_string_lossy().into_owned(),
            "-r".to_string(),
            self.run_id.to_string(),
        ];
        args.extend(extra.iter().map(ToString::to_string));
        args
    }

    pub fn options(&self, extra: &[&str]) -> AgentOptions {
        AgentOptions::from_args(self.args(extra)).unwrap()
    }

    pub fn try_attach(&self, extra: &[&str]) -> Result<RunContext, Error> {
        self.try_attach_with(extra, Box::new(self.engine.clone()))
    }

    pub fn try_attach_with(
        &self,
        extra: &[&str],
        engine: Box<dyn MutationEngine>,
    ) -> Result<RunContext, Error> {
        RunContext::attach(
            &self.options(extra),
            Box::new(self.platform.clone()),
            Box::new(self.coordinator.clone()),
            engine,
        )
    }

    /// Attach and load the main module and KERNELBASE.
    pub fn attach(&self, extra: &[&str]) -> RunContext {
        let ctx = self.try_attach(extra).unwrap();
        load_modules(&ctx);
        ctx
    }
}

pub fn load_modules(ctx: &RunContext) {
    ctx.on_module_load(&main_module());
    ctx.on_module_load(&kernelbase());
}

/// `ReadFile` of up to `requested` bytes into `buffer`, of which `transferred` arrive.
pub fn read_file(
    harness: &Harness,
    ctx: &RunContext,
    buffer: usize,
    requested: usize,
    transferred: u32,
) -> usize {
    let bytes_read = buffer + 0x10_0000;
    harness.platform.map(bytes_read, vec![0; 4]);
    harness.platform.call(
        ctx,
        READ_FILE,
        &[FILE_HANDLE, buffer, requested, bytes_read, 0],
        |platform| {
            platform.poke(bytes_read, &transferred.to_le_bytes());
            1
        },
    )
}
