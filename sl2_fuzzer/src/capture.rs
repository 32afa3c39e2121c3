//! Per-call state carried from a pre-hook to its post-hook, and the ledger counting it.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use sl2_bolts::{sha256_hex, Error};

use crate::{
    platform::{Platform, WrapContext},
    targets::Function,
};

/// Where an intercepted call reports how many bytes actually arrived
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transfer {
    /// Nothing reports it
    Unknown,
    /// A `DWORD` out-parameter at this address receives the byte count
    OutPointer(usize),
    /// The return value is a `size_t` count of elements of `elem_size` bytes
    ReturnValue {
        /// Size of one element
        elem_size: usize,
    },
    /// The return value is an `int` byte count, negative on failure
    ReturnInt,
}

/// One intercepted read: everything the mutation pipeline needs about the call.
///
/// Created in the pre-hook (or, for mapped views, completed in the post-hook), owned by
/// exactly one call and dropped when that call's post-hook returns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapturedCall {
    /// Which logical function was called
    pub function: Function,
    /// Destination buffer in target memory
    pub buffer: usize,
    /// Bytes requested; clamped to the bytes transferred once known
    pub requested: usize,
    /// How to learn the bytes transferred
    pub transfer: Transfer,
    /// File, device or key the bytes come from
    pub source: Option<String>,
    /// Offset into `source`
    pub position: u64,
    /// Fingerprint of source, position and size, for target selection
    pub arg_hash: Option<String>,
    /// Where the intercepted function returns to
    pub return_address: usize,
}

impl CapturedCall {
    /// A call of `function` reading up to `requested` bytes into `buffer`
    #[must_use]
    pub fn new(function: Function, buffer: usize, requested: usize) -> Self {
        Self {
            function,
            buffer,
            requested,
            transfer: Transfer::Unknown,
            source: None,
            position: 0,
            arg_hash: None,
            return_address: 0,
        }
    }

    /// (Re)compute [`CapturedCall::arg_hash`] from the current source, position and size.
    pub fn hash_args(&mut self) {
        let source = self.source.as_deref().unwrap_or_default();
        self.arg_hash = Some(sha256_hex(&[
            source.as_bytes(),
            &self.position.to_le_bytes(),
            &(self.requested as u64).to_le_bytes(),
        ]));
    }

    /// Bytes the call reports as transferred, if it reports anything.
    pub fn transferred(
        &self,
        wrap: &dyn WrapContext,
        platform: &dyn Platform,
    ) -> Result<Option<usize>, Error> {
        match self.transfer {
            Transfer::Unknown | Transfer::OutPointer(0) => Ok(None),
            Transfer::OutPointer(address) => {
                let count = read_dword(platform, address)?;
                Ok(Some(usize::try_from(count)?))
            }
            Transfer::ReturnValue { elem_size } => Ok(Some(wrap.retval().saturating_mul(elem_size))),
            Transfer::ReturnInt => {
                // only the low 32 bits carry the `int`
                let count = wrap.retval() as u32 as i32;
                Ok(Some(usize::try_from(count).unwrap_or(0)))
            }
        }
    }

    /// Did the call report failure through its return value? Such a call read nothing and is
    /// not mutated.
    #[must_use]
    pub fn failed(&self, wrap: &dyn WrapContext) -> bool {
        match self.transfer {
            Transfer::ReturnInt => (wrap.retval() as u32 as i32) < 0,
            _ => false,
        }
    }

    /// Shrink [`CapturedCall::requested`] to the bytes transferred, if fewer arrived.
    pub fn clamp_to_transferred(&mut self, wrap: &dyn WrapContext, platform: &dyn Platform) {
        match self.transferred(wrap, platform) {
            Ok(Some(transferred)) if transferred < self.requested => {
                log::debug!(
                    "{}: {} of {} requested bytes transferred",
                    self.function,
                    transferred,
                    self.requested
                );
                self.requested = transferred;
            }
            Ok(_) => {}
            Err(err) => log::warn!("{}: cannot read transfer count: {err}", self.function),
        }
    }
}

/// Read a little-endian `DWORD` from target memory.
pub fn read_dword(platform: &dyn Platform, address: usize) -> Result<u32, Error> {
    let bytes = platform.read_memory(address, 4)?;
    let bytes: [u8; 4] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::illegal_state(format!("short read at {address:#x}")))?;
    Ok(u32::from_le_bytes(bytes))
}

/// What a pre-hook stashes for its post-hook
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallState {
    /// An input read that may get mutated
    Read(CapturedCall),
    /// The processor feature queried through `IsProcessorFeaturePresent`
    FeatureQuery(u32),
}

/// Counts intercepted calls.
///
/// `captured` and `released` must be equal whenever no intercepted call is in flight; anything
/// else means a per-call descriptor outlived its call.
#[derive(Debug, Default)]
pub struct CallLedger {
    captured: AtomicU64,
    released: AtomicU64,
    calls: [AtomicU32; Function::COUNT],
}

impl CallLedger {
    /// Hand `call` over to the post-hook, counting it.
    #[must_use]
    pub fn capture(&self, call: CapturedCall) -> CallState {
        self.captured.fetch_add(1, Ordering::Relaxed);
        CallState::Read(call)
    }

    /// A guard counting one release when dropped, whichever way the post-hook leaves.
    #[must_use]
    pub fn release_on_drop(&self) -> ReleaseGuard<'_> {
        ReleaseGuard { ledger: self }
    }

    /// Count one more completed call of `function` and return the new count.
    pub fn increment_call_count(&self, function: Function) -> u32 {
        self.calls[function.id() as usize].fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Completed calls of `function` so far
    #[must_use]
    pub fn call_count(&self, function: Function) -> u32 {
        self.calls[function.id() as usize].load(Ordering::Relaxed)
    }

    /// Descriptors handed out by pre-hooks
    #[must_use]
    pub fn captured(&self) -> u64 {
        self.captured.load(Ordering::Relaxed)
    }

    /// Descriptors released by post-hooks
    #[must_use]
    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

/// See [`CallLedger::release_on_drop`]
#[derive(Debug)]
pub struct ReleaseGuard<'a> {
    ledger: &'a CallLedger,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.ledger.released.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::{CallLedger, CallState, CapturedCall, Transfer};
    use crate::{crash::ThreadContext, platform::WrapContext, targets::Function};

    struct Returning(usize);

    impl WrapContext for Returning {
        fn arg(&self, _index: usize) -> usize {
            0
        }

        fn retval(&self) -> usize {
            self.0
        }

        fn set_retval(&mut self, value: usize) {
            self.0 = value;
        }

        fn return_address(&self) -> usize {
            0
        }

        fn mcontext(&self) -> ThreadContext {
            ThreadContext::default()
        }
    }

    #[test]
    fn negative_int_return_is_a_failure() {
        let mut call = CapturedCall::new(Function::Recv, 0x1000, 16);
        call.transfer = Transfer::ReturnInt;
        // SOCKET_ERROR, as seen through a 64-bit register
        assert!(call.failed(&Returning(usize::MAX)));
        assert!(call.failed(&Returning(0xffff_ffff)));
        assert!(!call.failed(&Returning(0)));
        assert!(!call.failed(&Returning(5)));

        call.transfer = Transfer::ReturnValue { elem_size: 1 };
        assert!(!call.failed(&Returning(usize::MAX)));
    }

    #[test]
    fn arg_hash_depends_on_size_and_source() {
        let mut a = CapturedCall::new(Function::ReadFile, 0x1000, 100);
        a.source = Some("C:\\input.bin".into());
        a.hash_args();
        let mut b = a.clone();
        b.requested = 40;
        b.hash_args();
        assert_ne!(a.arg_hash, b.arg_hash);
        let mut c = a.clone();
        c.hash_args();
        assert_eq!(a.arg_hash, c.arg_hash);
        assert_eq!(a.arg_hash.as_ref().map(String::len), Some(64));
    }

    #[test]
    fn ledger_balances() {
        let ledger = CallLedger::default();
        for _ in 0..3 {
            let state = ledger.capture(CapturedCall::new(Function::Recv, 1, 1));
            let _release = ledger.release_on_drop();
            assert!(matches!(state, CallState::Read(_)));
        }
        assert_eq!(ledger.captured(), 3);
        assert_eq!(ledger.released(), 3);
    }

    #[test]
    fn per_function_counts() {
        let ledger = CallLedger::default();
        assert_eq!(ledger.increment_call_count(Function::Fread), 1);
        assert_eq!(ledger.increment_call_count(Function::Fread), 2);
        assert_eq!(ledger.call_count(Function::Fread), 2);
        assert_eq!(ledger.call_count(Function::Read), 0);
    }
}
