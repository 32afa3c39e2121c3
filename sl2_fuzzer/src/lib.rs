/*!
The in-process engine of the sl2 fuzzing agent.

The agent lives inside the target process. It counts basic-block executions into a per-run
coverage arena, intercepts calls reading external input, mutates what they read before the
target sees it, and captures the first unhandled exception for post-mortem analysis. Everything
is reported to a remote coordinator.

A dynamic binary instrumentation backend drives it through a [`platform::Platform`]: it creates
one [`agent::RunContext`] at attach, forwards module loads, compiled blocks and exceptions to
it, and calls [`agent::RunContext::on_exit`] when the process ends.
*/

#![deny(rustdoc::broken_intra_doc_links)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(
    clippy::unreadable_literal,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate
)]
#![cfg_attr(not(test), warn(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
))]
#![cfg_attr(test, deny(
    missing_debug_implementations,
    missing_docs,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_qualifications,
    unused_must_use,
))]

pub mod agent;
pub mod capture;
pub mod coordinator;
pub mod coverage;
pub mod crash;
pub mod hooks;
pub mod modules;
pub mod mutation;
pub mod options;
pub mod platform;
pub mod targets;

pub use agent::{RunContext, Termination};
pub use sl2_bolts::Error;

/// Register the stderr logger at the level `options` ask for.
///
/// The level is applied even if a logger was registered before, in which case the error says so.
pub fn init_logging(options: &options::AgentOptions) -> Result<(), Error> {
    log::set_max_level(options.log_level());
    sl2_bolts::SimpleStderrLogger::set_logger()
}
