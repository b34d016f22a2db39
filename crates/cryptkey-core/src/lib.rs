//! Core building blocks for the boot-time keyfile keyscript.
//!
//! The kernel command line names a key device and a file on it. We wait for the
//! device, mount it privately, read the key, unmount, and fall back to an
//! interactive prompt whenever any of that fails.

pub mod acquire;
pub mod cmdline;
mod command;
pub mod config;
pub mod device;
pub mod error;
pub mod keyfile;
pub mod logging;
pub mod modules;
pub mod mounter;
pub mod mounts;
pub mod passphrase;
pub mod prompt;
#[cfg(test)]
mod test_support;

pub use acquire::{
    AcquisitionState, Acquired, FallbackReason, PassphraseAcquisition, PassphraseSource,
};
pub use cmdline::{KeySpec, ParsedKeySpec};
pub use config::{ConfigFormat, CryptkeyConfig};
pub use device::{DeviceReference, DeviceWaiter};
pub use error::{CryptkeyError, CryptkeyResult};
pub use keyfile::{KeySource, KeyfileRetriever, RetrievalFailure, RetrievalOutcome};
pub use modules::{preload_modules, ModprobeLoader, ModuleLoader};
pub use mounter::{MountSession, Mounter, SystemMounter};
pub use passphrase::Passphrase;
pub use prompt::{prompt_label, AskpassPrompt, ConsolePrompt, InteractivePrompt, SystemPrompt};
