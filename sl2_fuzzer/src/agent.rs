//! The run-scoped context: attach, the callbacks the backend forwards, and exit.
//!
//! One [`RunContext`] exists per target process. The backend creates it at attach and hands
//! it, by reference, to every hook and instrumentation callback until exit.

use core::{
    fmt::{self, Debug},
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
    time::Duration,
};
use std::{
    ffi::OsString,
    sync::{Mutex, MutexGuard, OnceLock, PoisonError, TryLockError},
    thread,
    time::Instant,
};

use serde::{Deserialize, Serialize};
use sl2_bolts::Error;
use uuid::Uuid;

use crate::{
    capture::{CallLedger, CapturedCall},
    coordinator::{Coordinator, StreamCoordinator},
    coverage::{ArenaCounter, BasicBlockInstrumentor, CoverageArena},
    crash::{
        CrashMonitor, ExceptionCode, ExceptionContext, RawException, CRASH_EXIT_STATUS,
        RUN_FAILED_EXIT_STATUS,
    },
    hooks::HookDispatcher,
    modules::{ModuleFilter, ModuleInfo, ModuleRegistry},
    mutation::{request_mutation, Mutation, MutationEngine},
    options::AgentOptions,
    platform::{AppStateGuard, Platform},
    targets::TargetConfig,
};

/// How a run ended
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "termination", content = "reason", rename_all = "snake_case")]
pub enum Termination {
    /// The target exited on its own
    Normal,
    /// The agent could not go on; nothing was reported
    Fatal(String),
    /// A mutation failed; the attempt is inconclusive
    RunFailed(String),
    /// The target crashed with the named exception
    Crash(String),
}

impl Termination {
    /// Write the structured log line announcing this termination.
    pub fn log(&self) {
        let line = serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"));
        match self {
            Termination::Normal => log::info!("{line}"),
            _ => log::error!("{line}"),
        }
    }
}

#[derive(Serialize)]
struct ExceptionAnnouncement<'a> {
    exception: &'a str,
}

/// How long teardown waits for a coordinator session another thread is using
const SESSION_WAIT: Duration = Duration::from_secs(1);

/// What attach hands over to the context
struct Attached {
    run_id: Uuid,
    targets: TargetConfig,
    arena: Option<CoverageArena>,
}

/// Everything belonging to one run of the target.
pub struct RunContext {
    run_id: Uuid,
    platform: Box<dyn Platform>,
    coordinator: Mutex<Box<dyn Coordinator>>,
    engine: Mutex<Box<dyn MutationEngine>>,
    targets: TargetConfig,
    modules: ModuleRegistry,
    hooks: HookDispatcher,
    arena: Option<CoverageArena>,
    ledger: CallLedger,
    crash: CrashMonitor,
    mutations: AtomicU32,
    exiting: AtomicBool,
    failed: AtomicBool,
    termination: OnceLock<Termination>,
}

impl Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("modules", &self.modules.len())
            .field("coverage_guided", &self.coverage_guided())
            .field("crash", &self.crash.state())
            .field("termination", &self.termination.get())
            .finish_non_exhaustive()
    }
}

impl RunContext {
    /// Bring the agent up from its injection arguments.
    ///
    /// Parses `args` (the first one being the agent's own name), registers the stderr logger,
    /// connects to the coordinator the options name and attaches. An unparsable command line or
    /// an unreachable coordinator is as fatal as any other attach failure.
    pub fn connect<I, T>(
        args: I,
        platform: Box<dyn Platform>,
        engine: Box<dyn MutationEngine>,
    ) -> Result<Self, Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let options = match AgentOptions::from_args(args) {
            Ok(options) => options,
            Err(err) => return Err(fatal(platform.as_ref(), err)),
        };
        if let Err(err) = crate::init_logging(&options) {
            log::debug!("keeping the logger already registered: {err}");
        }

        log::info!("connecting to the coordinator at {}", options.coordinator);
        let coordinator = match StreamCoordinator::connect(options.coordinator) {
            Ok(coordinator) => coordinator,
            Err(err) => {
                let err = Error::illegal_state(format!(
                    "coordinator at {} is unreachable: {err}",
                    options.coordinator
                ));
                return Err(fatal(platform.as_ref(), err));
            }
        };

        Self::attach(&options, platform, Box::new(coordinator), engine)
    }

    /// Bring the agent up inside the target.
    ///
    /// Any failure here is fatal: it is logged, the platform aborts the process and the error is
    /// returned for backends whose abort returns.
    pub fn attach(
        options: &AgentOptions,
        platform: Box<dyn Platform>,
        coordinator: Box<dyn Coordinator>,
        engine: Box<dyn MutationEngine>,
    ) -> Result<Self, Error> {
        Self::attach_with_filter(options, ModuleFilter::default(), platform, coordinator, engine)
    }

    /// [`RunContext::attach`], leaving the modules `filter` rejects out of coverage.
    pub fn attach_with_filter(
        options: &AgentOptions,
        filter: ModuleFilter,
        platform: Box<dyn Platform>,
        mut coordinator: Box<dyn Coordinator>,
        engine: Box<dyn MutationEngine>,
    ) -> Result<Self, Error> {
        let attached = match Self::prepare(options, platform.as_ref(), coordinator.as_mut()) {
            Ok(attached) => attached,
            Err(err) => return Err(fatal(platform.as_ref(), err)),
        };

        log::info!(
            "attached to {} (pid {}) for run {}",
            platform.application_name(),
            platform.process_id(),
            attached.run_id
        );

        Ok(Self {
            run_id: attached.run_id,
            platform,
            coordinator: Mutex::new(coordinator),
            engine: Mutex::new(engine),
            targets: attached.targets,
            modules: ModuleRegistry::new(filter),
            hooks: HookDispatcher::new(options.registry),
            arena: attached.arena,
            ledger: CallLedger::default(),
            crash: CrashMonitor::new(),
            mutations: AtomicU32::new(0),
            exiting: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            termination: OnceLock::new(),
        })
    }

    fn prepare(
        options: &AgentOptions,
        platform: &dyn Platform,
        coordinator: &mut dyn Coordinator,
    ) -> Result<Attached, Error> {
        options.validate()?;
        let targets = TargetConfig::from_path(options.target_path()?)?;
        let run_id = options.run_id()?;

        coordinator.open()?;
        coordinator.assign_run_id(run_id)?;
        coordinator.register_pid(platform.process_id())?;

        platform.init()?;

        let arena = match options.arena_id()? {
            Some(id) if !options.no_coverage => {
                log::info!("arena {id} given, instrumenting basic blocks");
                let arena = CoverageArena::new(id);
                arena.load(&coordinator.request_arena(arena.id())?)?;
                platform.enable_block_instrumentation()?;
                Some(arena)
            }
            _ => {
                log::info!("no arena given or coverage disabled, mutating without guidance");
                None
            }
        };

        Ok(Attached {
            run_id,
            targets,
            arena,
        })
    }

    /// The backend reports a freshly loaded module.
    pub fn on_module_load(&self, module: &ModuleInfo) {
        self.modules
            .on_module_loaded(module, self.platform.application_name());
        self.hooks.on_module_load(self.platform.as_ref(), &self.targets, module);
    }

    /// The backend reports a module being unloaded. Its hooks went away with it.
    ///
    /// The module stays in the registry; coverage offsets of a run never move.
    pub fn on_module_unload(&self, module: &ModuleInfo) {
        self.hooks.on_module_unload(module);
    }

    /// The backend compiled a basic block starting at `block_start`. Returns the counter to
    /// increment in front of it, if the block is covered.
    #[must_use]
    pub fn on_basic_block(&self, block_start: usize) -> Option<ArenaCounter<'_>> {
        let arena = self.arena.as_ref()?;
        BasicBlockInstrumentor::new(&self.modules, arena).instrument(block_start)
    }

    /// The target raised an unhandled exception.
    ///
    /// The first exception of a run is recorded and terminates the process with
    /// [`CRASH_EXIT_STATUS`]. Anything after that, including exceptions raised while the run is
    /// already being torn down, aborts immediately.
    pub fn on_exception(&self, exception: &RawException) {
        if let Err(state) = self.crash.try_except() {
            self.terminate(Termination::Fatal(format!(
                "exception {:#x} while {state:?}",
                exception.record.code
            )));
            self.platform.abort();
            return;
        }

        let thread_id = self.platform.current_thread_id();
        let thread_context = {
            let _app = AppStateGuard::new(self.platform.as_ref());
            self.platform.capture_context(exception)
        };
        self.crash.record(ExceptionContext {
            thread_id,
            thread_context,
            record: exception.record.clone(),
        });

        let name = ExceptionCode::name_of(exception.record.code);
        match serde_json::to_string(&ExceptionAnnouncement { exception: name }) {
            Ok(line) => log::error!("{line}"),
            Err(err) => log::error!("cannot announce {name}: {err}"),
        }

        self.terminate(Termination::Crash(name.to_string()));
        self.platform.exit_process(CRASH_EXIT_STATUS);
    }

    /// Mutate the bytes `call` read, in place.
    pub fn mutate(&self, call: &CapturedCall) -> Result<(), Error> {
        let original = self.platform.read_memory(call.buffer, call.requested)?;
        let index = self.mutations.fetch_add(1, Ordering::Relaxed);
        let mut mutation = Mutation::for_call(call, index, original);

        request_mutation(
            &self.coordinator,
            lock(&self.engine).as_mut(),
            self.arena.as_ref(),
            &mut mutation,
        )?;

        log::debug!(
            "mutation {} of {}: {} bytes at {:#x}",
            mutation.index,
            mutation.function,
            mutation.len(),
            call.buffer
        );
        self.platform.write_memory(call.buffer, &mutation.buffer)
    }

    /// Give up on this run after a mutation failure. Coverage of a failed run is not reported.
    pub fn fail_run(&self, err: &Error) {
        self.failed.store(true, Ordering::Release);
        self.terminate(Termination::RunFailed(err.to_string()));
        self.platform.exit_process(RUN_FAILED_EXIT_STATUS);
    }

    /// The target process is exiting. Only the first call does anything.
    pub fn on_exit(&self) {
        if self.exiting.swap(true, Ordering::AcqRel) {
            return;
        }

        let crashed = self.crash.begin_reporting();
        if crashed {
            if let Err(err) = self.write_postmortem() {
                log::error!("cannot write the post-mortem snapshot: {err}");
            }
        }

        if let Some(arena) = &self.arena {
            if crashed || self.failed.load(Ordering::Acquire) {
                log::info!("run did not finish normally, not reporting arena {}", arena.id());
            } else if let Err(err) = self.report_coverage(arena) {
                log::warn!("cannot report coverage: {err}");
            }
        }

        match self.try_session() {
            Some(mut session) => {
                if let Err(err) = session.close() {
                    log::warn!("cannot close the coordinator session: {err}");
                }
            }
            None => log::warn!("coordinator session busy, leaving it open"),
        }

        self.modules.clear();
        self.platform.unwrap_all();
        self.hooks.clear();
        self.platform.shutdown();
        self.crash.close();

        if self.termination.get().is_none() {
            self.terminate(Termination::Normal);
        }
    }

    fn write_postmortem(&self) -> Result<(), Error> {
        let context = self
            .crash
            .context()
            .ok_or_else(|| Error::empty_optional("exception context"))?;
        let paths = self
            .try_session()
            .ok_or_else(|| Error::illegal_state("coordinator session busy"))?
            .crash_paths(self.platform.process_id())?;
        log::info!(
            "writing post-mortem snapshot to {}",
            paths.initial_dump_path.display()
        );
        let _app = AppStateGuard::new(self.platform.as_ref());
        self.platform
            .write_postmortem(&paths.initial_dump_path, context)
    }

    fn report_coverage(&self, arena: &CoverageArena) -> Result<(), Error> {
        let mut coordinator = self
            .try_session()
            .ok_or_else(|| Error::illegal_state("coordinator session busy"))?;
        coordinator.register_arena(arena)?;
        let info = coordinator.coverage(arena)?;
        log::info!("#COVERAGE:{}", serde_json::to_string(&info)?);
        Ok(())
    }

    /// The coordinator session, unless another thread holds on to it for longer than
    /// [`SESSION_WAIT`]. Teardown must never hang on a thread the process is leaving behind.
    fn try_session(&self) -> Option<MutexGuard<'_, Box<dyn Coordinator>>> {
        let deadline = Instant::now() + SESSION_WAIT;
        loop {
            match self.coordinator.try_lock() {
                Ok(session) => return Some(session),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(5));
                }
                Err(TryLockError::WouldBlock) => return None,
            }
        }
    }

    /// Log a termination. The first one of the run is the one recorded.
    fn terminate(&self, termination: Termination) {
        termination.log();
        // a later termination (e.g. a fatal abort after a crash) only gets logged
        let _ = self.termination.set(termination);
    }

    /// Should this call, the `call_count`-th of its function, be mutated?
    #[must_use]
    pub fn is_function_targeted(&self, call: &CapturedCall, call_count: u32) -> bool {
        let main_base = self.modules.main_module_base().unwrap_or_default();
        self.targets
            .is_function_targeted(call, call_count, main_base)
    }

    /// This run's id
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The instrumentation backend
    #[must_use]
    pub fn platform(&self) -> &dyn Platform {
        self.platform.as_ref()
    }

    /// Intercepted call metrics
    #[must_use]
    pub fn ledger(&self) -> &CallLedger {
        &self.ledger
    }

    /// The tracked modules
    #[must_use]
    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    /// The installed hooks
    #[must_use]
    pub fn hooks(&self) -> &HookDispatcher {
        &self.hooks
    }

    /// The target configuration
    #[must_use]
    pub fn targets(&self) -> &TargetConfig {
        &self.targets
    }

    /// The coverage arena, if the run is coverage-guided
    #[must_use]
    pub fn arena(&self) -> Option<&CoverageArena> {
        self.arena.as_ref()
    }

    /// Is the run coverage-guided?
    #[must_use]
    pub fn coverage_guided(&self) -> bool {
        self.arena.is_some()
    }

    /// The crash state machine
    #[must_use]
    pub fn crash(&self) -> &CrashMonitor {
        &self.crash
    }

    /// How the run ended, once it did
    #[must_use]
    pub fn termination(&self) -> Option<&Termination> {
        self.termination.get()
    }
}

/// Log a fatal attach failure and abort.
fn fatal(platform: &dyn Platform, err: Error) -> Error {
    Termination::Fatal(err.to_string()).log();
    platform.abort();
    err
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T>
where
    T: ?Sized,
{
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
