//! Turning a captured read into mutated bytes: the contract with the mutation engine and the
//! request pipeline around it.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use sl2_bolts::Error;

use crate::{
    capture::CapturedCall, coordinator::Coordinator, coverage::CoverageArena, targets::Function,
};

/// A mutation strategy, as chosen by the coordinator or the engine
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationStrategy(pub u32);

/// The coordinator's advice for the next mutation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationAdvice {
    /// Strategy to apply
    pub strategy: MutationStrategy,
}

/// One mutation, from request to registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    /// The intercepted function
    pub function: Function,
    /// Sequence number, unique within the run
    pub index: u32,
    /// Strategy applied; `None` until the engine resolved one
    pub strategy: Option<MutationStrategy>,
    /// File, device or key the bytes came from
    pub resource: Option<String>,
    /// Offset into `resource`
    pub position: u64,
    /// The bytes, original on the way in and mutated on the way out
    pub buffer: Vec<u8>,
}

impl Mutation {
    /// A pending mutation of `buffer`, as read by `call`
    #[must_use]
    pub fn for_call(call: &CapturedCall, index: u32, buffer: Vec<u8>) -> Self {
        Self {
            function: call.function,
            index,
            strategy: None,
            resource: call.source.clone(),
            position: call.position,
            buffer,
        }
    }

    /// Number of bytes mutated
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// `true` for an empty buffer
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// The external mutation engine.
///
/// Engines mutate `buffer` in place. They must not change its length, and they record the
/// strategy they actually used in [`Mutation::strategy`].
pub trait MutationEngine: Send {
    /// Apply the engine's default mutation.
    fn mutate(&mut self, mutation: &mut Mutation) -> Result<(), Error>;

    /// Apply `strategy`.
    fn mutate_with(
        &mut self,
        strategy: MutationStrategy,
        mutation: &mut Mutation,
    ) -> Result<(), Error>;
}

/// Mutate `mutation` and register the result with the coordinator.
///
/// With an `arena`, the run is coverage-guided: the coordinator advises a strategy based on it
/// first. The session is only locked for the advice and for the registration, never while the
/// engine runs. Any failure, including a rejected registration, is returned as an error; the
/// caller treats it as a failed run.
pub fn request_mutation<C>(
    coordinator: &Mutex<C>,
    engine: &mut dyn MutationEngine,
    arena: Option<&CoverageArena>,
    mutation: &mut Mutation,
) -> Result<(), Error>
where
    C: Coordinator + ?Sized,
{
    let original_len = mutation.len();

    let advice = match arena {
        Some(arena) => Some(session(coordinator).advise_mutation(arena)?),
        None => None,
    };

    if let Some(advice) = advice {
        log::debug!("advised strategy {:?} for {}", advice.strategy, mutation.function);
        engine.mutate_with(advice.strategy, mutation)?;
        mutation.strategy.get_or_insert(advice.strategy);
    } else {
        engine.mutate(mutation)?;
    }

    if mutation.len() != original_len {
        return Err(Error::illegal_state(format!(
            "mutation engine resized a {original_len} byte buffer to {}",
            mutation.len()
        )));
    }

    if session(coordinator).register_mutation(mutation)? {
        Ok(())
    } else {
        Err(Error::illegal_state(format!(
            "coordinator rejected mutation {} of {}",
            mutation.index, mutation.function
        )))
    }
}

fn session<C>(coordinator: &Mutex<C>) -> MutexGuard<'_, C>
where
    C: ?Sized,
{
    coordinator.lock().unwrap_or_else(PoisonError::into_inner)
}
