//! The session with the remote coordinator: the call contract, its wire format, and a local
//! implementation for offline runs.

use core::fmt::{self, Debug};
use std::{
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sl2_bolts::{sha256_hex, Error};
use uuid::Uuid;

use crate::{
    coverage::{ArenaId, CoverageArena, ARENA_SIZE},
    mutation::{Mutation, MutationAdvice, MutationStrategy},
};

/// Default address of the coordinator
pub const DEFAULT_COORDINATOR: &str = "127.0.0.1:13370";

/// Frames larger than this are refused
pub const MAX_FRAME_LEN: usize = 64 << 20;

/// The coordinator's verdict on a finished arena
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageInfo {
    /// Hash identifying the execution path
    #[serde(rename = "hash")]
    pub path_hash: String,
    /// Whether the arena landed in a known bucket
    #[serde(rename = "bkt")]
    pub bucketing: bool,
    /// Score of the run
    #[serde(rename = "scr")]
    pub score: u32,
    /// Tries left before the coordinator gives up on this path
    #[serde(rename = "rem")]
    pub tries_remaining: u32,
}

/// Where the crash artifacts of a process go
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrashPaths {
    /// The post-mortem snapshot written at exit
    pub initial_dump_path: PathBuf,
}

/// The calls the agent makes to its coordinator.
///
/// Every call is synchronous; the agent holds the session for the whole run.
pub trait Coordinator: Send {
    /// Open the session.
    fn open(&mut self) -> Result<(), Error>;

    /// Tell the coordinator which run this is.
    fn assign_run_id(&mut self, run_id: Uuid) -> Result<(), Error>;

    /// Tell the coordinator which process runs the target.
    fn register_pid(&mut self, pid: u32) -> Result<(), Error>;

    /// The arena stored under `id`, or a zeroed one.
    fn request_arena(&mut self, id: &ArenaId) -> Result<Vec<u8>, Error>;

    /// Advise a strategy for the next mutation, given the coverage so far.
    fn advise_mutation(&mut self, arena: &CoverageArena) -> Result<MutationAdvice, Error>;

    /// Register a finished mutation. `Ok(false)` means the coordinator rejected it.
    fn register_mutation(&mut self, mutation: &Mutation) -> Result<bool, Error>;

    /// Register the finished arena of this run.
    fn register_arena(&mut self, arena: &CoverageArena) -> Result<(), Error>;

    /// Score a finished arena.
    fn coverage(&mut self, arena: &CoverageArena) -> Result<CoverageInfo, Error>;

    /// Paths for the crash artifacts of process `pid`.
    fn crash_paths(&mut self, pid: u32) -> Result<CrashPaths, Error>;

    /// Close the session.
    fn close(&mut self) -> Result<(), Error>;
}

impl<C> Coordinator for Box<C>
where
    C: Coordinator + ?Sized,
{
    fn open(&mut self) -> Result<(), Error> {
        (**self).open()
    }

    fn assign_run_id(&mut self, run_id: Uuid) -> Result<(), Error> {
        (**self).assign_run_id(run_id)
    }

    fn register_pid(&mut self, pid: u32) -> Result<(), Error> {
        (**self).register_pid(pid)
    }

    fn request_arena(&mut self, id: &ArenaId) -> Result<Vec<u8>, Error> {
        (**self).request_arena(id)
    }

    fn advise_mutation(&mut self, arena: &CoverageArena) -> Result<MutationAdvice, Error> {
        (**self).advise_mutation(arena)
    }

    fn register_mutation(&mut self, mutation: &Mutation) -> Result<bool, Error> {
        (**self).register_mutation(mutation)
    }

    fn register_arena(&mut self, arena: &CoverageArena) -> Result<(), Error> {
        (**self).register_arena(arena)
    }

    fn coverage(&mut self, arena: &CoverageArena) -> Result<CoverageInfo, Error> {
        (**self).coverage(arena)
    }

    fn crash_paths(&mut self, pid: u32) -> Result<CrashPaths, Error> {
        (**self).crash_paths(pid)
    }

    fn close(&mut self) -> Result<(), Error> {
        (**self).close()
    }
}

/// An arena as sent over the wire
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArenaMessage {
    /// The arena's id
    pub id: ArenaId,
    /// Its bytes
    pub map: Vec<u8>,
}

impl From<&CoverageArena> for ArenaMessage {
    fn from(arena: &CoverageArena) -> Self {
        Self {
            id: arena.id().clone(),
            map: arena.to_vec(),
        }
    }
}

/// A request frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorRequest {
    /// [`Coordinator::open`]
    Open,
    /// [`Coordinator::assign_run_id`]
    AssignRunId(Uuid),
    /// [`Coordinator::register_pid`]
    RegisterPid(u32),
    /// [`Coordinator::request_arena`]
    RequestArena(ArenaId),
    /// [`Coordinator::advise_mutation`]
    AdviseMutation(ArenaMessage),
    /// [`Coordinator::register_mutation`]
    RegisterMutation(Mutation),
    /// [`Coordinator::register_arena`]
    RegisterArena(ArenaMessage),
    /// [`Coordinator::coverage`]
    Coverage(ArenaMessage),
    /// [`Coordinator::crash_paths`]
    CrashPaths(u32),
    /// [`Coordinator::close`]
    Close,
}

/// A response frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorResponse {
    /// Done
    Ok,
    /// The request was understood and refused
    Rejected,
    /// An arena map
    Arena(Vec<u8>),
    /// Mutation advice
    Advice(MutationAdvice),
    /// A coverage verdict
    Coverage(CoverageInfo),
    /// Crash artifact paths
    CrashPaths(CrashPaths),
    /// The coordinator failed
    Error(String),
}

/// Write one frame: the big-endian `u32` length of the body, then the `postcard` body.
pub fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), Error>
where
    W: Write,
    T: Serialize,
{
    let body = postcard::to_allocvec(message)?;
    let header = u32::try_from(body.len())?.to_be_bytes();
    let mut frame = header.to_vec();
    frame.extend(body);
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame written by [`write_frame`].
pub fn read_frame<R, T>(reader: &mut R) -> Result<T, Error>
where
    R: Read,
    T: DeserializeOwned,
{
    let mut size_bytes = [0_u8; 4];
    reader.read_exact(&mut size_bytes)?;
    let size = u32::from_be_bytes(size_bytes) as usize;
    if size > MAX_FRAME_LEN {
        return Err(Error::illegal_state(format!(
            "frame of {size} bytes exceeds the limit of {MAX_FRAME_LEN}"
        )));
    }
    let mut bytes = vec![0_u8; size];
    reader.read_exact(&mut bytes)?;
    Ok(postcard::from_bytes(&bytes)?)
}

/// A coordinator at the other end of a byte stream.
pub struct StreamCoordinator<S> {
    stream: S,
}

impl<S> Debug for StreamCoordinator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamCoordinator").finish_non_exhaustive()
    }
}

impl StreamCoordinator<TcpStream> {
    /// Connect to the coordinator listening at `addr`.
    pub fn connect<A>(addr: A) -> Result<Self, Error>
    where
        A: ToSocketAddrs,
    {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S> StreamCoordinator<S>
where
    S: Read + Write,
{
    /// Speak to the coordinator over `stream`
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Give the stream back
    pub fn into_inner(self) -> S {
        self.stream
    }

    fn transact(&mut self, request: &CoordinatorRequest) -> Result<CoordinatorResponse, Error> {
        write_frame(&mut self.stream, request)?;
        match read_frame(&mut self.stream)? {
            CoordinatorResponse::Error(message) => Err(Error::illegal_state(format!(
                "coordinator failed {}: {message}",
                request_name(request)
            ))),
            response => Ok(response),
        }
    }

    fn expect_ok(&mut self, request: &CoordinatorRequest) -> Result<(), Error> {
        match self.transact(request)? {
            CoordinatorResponse::Ok => Ok(()),
            other => Err(unexpected(request, &other)),
        }
    }
}

fn request_name(request: &CoordinatorRequest) -> &'static str {
    match request {
        CoordinatorRequest::Open => "open",
        CoordinatorRequest::AssignRunId(_) => "assign_run_id",
        CoordinatorRequest::RegisterPid(_) => "register_pid",
        CoordinatorRequest::RequestArena(_) => "request_arena",
        CoordinatorRequest::AdviseMutation(_) => "advise_mutation",
        CoordinatorRequest::RegisterMutation(_) => "register_mutation",
        CoordinatorRequest::RegisterArena(_) => "register_arena",
        CoordinatorRequest::Coverage(_) => "coverage",
        CoordinatorRequest::CrashPaths(_) => "crash_paths",
        CoordinatorRequest::Close => "close",
    }
}

fn unexpected(request: &CoordinatorRequest, response: &CoordinatorResponse) -> Error {
    Error::illegal_state(format!(
        "unexpected response to {}: {response:?}",
        request_name(request)
    ))
}

impl<S> Coordinator for StreamCoordinator<S>
where
    S: Read + Write + Send,
{
    fn open(&mut self) -> Result<(), Error> {
        self.expect_ok(&CoordinatorRequest::Open)
    }

    fn assign_run_id(&mut self, run_id: Uuid) -> Result<(), Error> {
        self.expect_ok(&CoordinatorRequest::AssignRunId(run_id))
    }

    fn register_pid(&mut self, pid: u32) -> Result<(), Error> {
        self.expect_ok(&CoordinatorRequest::RegisterPid(pid))
    }

    fn request_arena(&mut self, id: &ArenaId) -> Result<Vec<u8>, Error> {
        let request = CoordinatorRequest::RequestArena(id.clone());
        match self.transact(&request)? {
            CoordinatorResponse::Arena(map) => Ok(map),
            other => Err(unexpected(&request, &other)),
        }
    }

    fn advise_mutation(&mut self, arena: &CoverageArena) -> Result<MutationAdvice, Error> {
        let request = CoordinatorRequest::AdviseMutation(arena.into());
        match self.transact(&request)? {
            CoordinatorResponse::Advice(advice) => Ok(advice),
            other => Err(unexpected(&request, &other)),
        }
    }

    fn register_mutation(&mut self, mutation: &Mutation) -> Result<bool, Error> {
        let request = CoordinatorRequest::RegisterMutation(mutation.clone());
        match self.transact(&request)? {
            CoordinatorResponse::Ok => Ok(true),
            CoordinatorResponse::Rejected => Ok(false),
            other => Err(unexpected(&request, &other)),
        }
    }

    fn register_arena(&mut self, arena: &CoverageArena) -> Result<(), Error> {
        self.expect_ok(&CoordinatorRequest::RegisterArena(arena.into()))
    }

    fn coverage(&mut self, arena: &CoverageArena) -> Result<CoverageInfo, Error> {
        let request = CoordinatorRequest::Coverage(arena.into());
        match self.transact(&request)? {
            CoordinatorResponse::Coverage(info) => Ok(info),
            other => Err(unexpected(&request, &other)),
        }
    }

    fn crash_paths(&mut self, pid: u32) -> Result<CrashPaths, Error> {
        let request = CoordinatorRequest::CrashPaths(pid);
        match self.transact(&request)? {
            CoordinatorResponse::CrashPaths(paths) => Ok(paths),
            other => Err(unexpected(&request, &other)),
        }
    }

    fn close(&mut self) -> Result<(), Error> {
        self.expect_ok(&CoordinatorRequest::Close)
    }
}

/// A call as seen by the [`InMemoryCoordinator`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinatorCall {
    /// [`Coordinator::open`]
    Open,
    /// [`Coordinator::assign_run_id`]
    AssignRunId(Uuid),
    /// [`Coordinator::register_pid`]
    RegisterPid(u32),
    /// [`Coordinator::request_arena`]
    RequestArena(ArenaId),
    /// [`Coordinator::advise_mutation`]
    AdviseMutation,
    /// [`Coordinator::register_mutation`]
    RegisterMutation(u32),
    /// [`Coordinator::register_arena`]
    RegisterArena(ArenaId),
    /// [`Coordinator::coverage`]
    Coverage,
    /// [`Coordinator::crash_paths`]
    CrashPaths(u32),
    /// [`Coordinator::close`]
    Close,
}

/// Everything an [`InMemoryCoordinator`] was told
#[derive(Clone, Debug, Default)]
pub struct CoordinatorJournal {
    /// Calls, in order
    pub calls: Vec<CoordinatorCall>,
    /// Accepted mutations
    pub mutations: Vec<Mutation>,
    /// Registered arenas
    pub arenas: Vec<ArenaMessage>,
}

#[derive(Debug)]
struct InMemoryState {
    journal: CoordinatorJournal,
    advice: MutationStrategy,
    reject_mutations: bool,
    crash_dir: PathBuf,
    open: bool,
}

/// A coordinator living inside the agent.
///
/// Hands out zeroed arenas, fixed advice and crash paths below a local directory, and keeps a
/// journal of every call. Clones share the same state.
#[derive(Clone, Debug)]
pub struct InMemoryCoordinator {
    state: Arc<Mutex<InMemoryState>>,
}

impl Default for InMemoryCoordinator {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl InMemoryCoordinator {
    /// A coordinator placing crash artifacts in `crash_dir`
    #[must_use]
    pub fn new<P>(crash_dir: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            state: Arc::new(Mutex::new(InMemoryState {
                journal: CoordinatorJournal::default(),
                advice: MutationStrategy::default(),
                reject_mutations: false,
                crash_dir: crash_dir.into(),
                open: false,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, InMemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advise `strategy` from now on.
    pub fn set_advice(&self, strategy: MutationStrategy) {
        self.state().advice = strategy;
    }

    /// Reject (or accept again) every registered mutation.
    pub fn reject_mutations(&self, reject: bool) {
        self.state().reject_mutations = reject;
    }

    /// A copy of the journal
    #[must_use]
    pub fn journal(&self) -> CoordinatorJournal {
        self.state().journal.clone()
    }

    /// Journal `call` and hand out the state for the rest of it.
    fn enter(&self, call: CoordinatorCall) -> Result<MutexGuard<'_, InMemoryState>, Error> {
        let mut state = self.state();
        if !state.open && call != CoordinatorCall::Open {
            return Err(Error::illegal_state(format!(
                "{call:?} outside of an open session"
            )));
        }
        state.journal.calls.push(call);
        Ok(state)
    }

    fn record(&self, call: CoordinatorCall) -> Result<(), Error> {
        self.enter(call).map(drop)
    }
}

impl Coordinator for InMemoryCoordinator {
    fn open(&mut self) -> Result<(), Error> {
        self.enter(CoordinatorCall::Open)?.open = true;
        Ok(())
    }

    fn assign_run_id(&mut self, run_id: Uuid) -> Result<(), Error> {
        self.record(CoordinatorCall::AssignRunId(run_id))?;
        Ok(())
    }

    fn register_pid(&mut self, pid: u32) -> Result<(), Error> {
        self.record(CoordinatorCall::RegisterPid(pid))?;
        Ok(())
    }

    fn request_arena(&mut self, id: &ArenaId) -> Result<Vec<u8>, Error> {
        self.record(CoordinatorCall::RequestArena(id.clone()))?;
        Ok(vec![0; ARENA_SIZE])
    }

    fn advise_mutation(&mut self, _arena: &CoverageArena) -> Result<MutationAdvice, Error> {
        let state = self.enter(CoordinatorCall::AdviseMutation)?;
        Ok(MutationAdvice {
            strategy: state.advice,
        })
    }

    fn register_mutation(&mut self, mutation: &Mutation) -> Result<bool, Error> {
        let mut state = self.enter(CoordinatorCall::RegisterMutation(mutation.index))?;
        if state.reject_mutations {
            return Ok(false);
        }
        state.journal.mutations.push(mutation.clone());
        Ok(true)
    }

    fn register_arena(&mut self, arena: &CoverageArena) -> Result<(), Error> {
        let mut state = self.enter(CoordinatorCall::RegisterArena(arena.id().clone()))?;
        state.journal.arenas.push(arena.into());
        Ok(())
    }

    fn coverage(&mut self, arena: &CoverageArena) -> Result<CoverageInfo, Error> {
        self.record(CoordinatorCall::Coverage)?;
        let map = arena.to_vec();
        let covered = map.iter().filter(|b| **b != 0).count();
        Ok(CoverageInfo {
            path_hash: sha256_hex(&[&map]),
            bucketing: false,
            score: u32::try_from(covered)?,
            tries_remaining: 0,
        })
    }

    fn crash_paths(&mut self, pid: u32) -> Result<CrashPaths, Error> {
        let state = self.enter(CoordinatorCall::CrashPaths(pid))?;
        Ok(CrashPaths {
            initial_dump_path: state.crash_dir.join(format!("{pid}.initial.dmp")),
        })
    }

    fn close(&mut self) -> Result<(), Error> {
        self.enter(CoordinatorCall::Close)?.open = false;
        Ok(())
    }
}
