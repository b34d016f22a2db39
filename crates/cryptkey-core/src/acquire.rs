//! Passphrase acquisition: keyfile first, interactive prompt as the unconditional fallback.
//!
//! The attempt is modelled as a small state machine. Each step consumes the current
//! state and returns the next one, so nothing about the attempt lives in shared
//! mutable fields:
//!
//! ```text
//! Start -> SpecParsed -> KeyAttempt -> Done
//!                     \            \
//!                      -> PromptOnly -> Done
//! ```
//!
//! A missing key device must never stop the machine from booting, so every keyfile
//! failure routes to the prompt. Only a failed prompt is returned as an error.

use crate::cmdline::{parse_key_spec, KeySpec, ParsedKeySpec};
use crate::error::CryptkeyResult;
use crate::keyfile::{KeySource, RetrievalFailure, RetrievalOutcome};
use crate::passphrase::Passphrase;
use crate::prompt::InteractivePrompt;
use log::{info, warn};
use std::fmt;
use std::path::PathBuf;

/// Why the prompt ended up being used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// No `crypt_keyfile=` parameter on the command line.
    ConfigAbsent,
    /// The parameter was present but malformed.
    ConfigInvalid,
    /// The keyfile path ran and failed.
    Retrieval(RetrievalFailure),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::ConfigAbsent => f.write_str("no keyfile configured"),
            FallbackReason::ConfigInvalid => f.write_str("keyfile parameter is malformed"),
            FallbackReason::Retrieval(failure) => write!(f, "{failure}"),
        }
    }
}

/// Where the emitted passphrase came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassphraseSource {
    Keyfile { device: PathBuf },
    Prompt { reason: FallbackReason },
}

/// The single passphrase produced by an attempt.
#[derive(Debug)]
pub struct Acquired {
    pub passphrase: Passphrase,
    pub source: PassphraseSource,
}

#[derive(Debug)]
pub enum AcquisitionState {
    Start,
    SpecParsed(Option<ParsedKeySpec>),
    KeyAttempt(KeySpec),
    PromptOnly(FallbackReason),
    Done(Acquired),
}

/// Orchestrates one unlock attempt over a key source and a prompt.
pub struct PassphraseAcquisition<K, P> {
    keys: K,
    prompt: P,
    label: String,
}

impl<K, P> PassphraseAcquisition<K, P>
where
    K: KeySource,
    P: InteractivePrompt,
{
    pub fn new(keys: K, prompt: P, label: impl Into<String>) -> Self {
        Self {
            keys,
            prompt,
            label: label.into(),
        }
    }

    /// Run the attempt to completion over the given command line tokens.
    ///
    /// # Errors
    /// Returns `CryptkeyError::Prompt` when the fallback prompt cannot produce a
    /// passphrase. Keyfile failures are never surfaced.
    pub fn acquire<S: AsRef<str>>(&self, tokens: &[S]) -> CryptkeyResult<Acquired> {
        let mut state = AcquisitionState::Start;
        loop {
            state = match state {
                AcquisitionState::Done(acquired) => return Ok(acquired),
                pending => self.step(pending, tokens)?,
            };
        }
    }

    /// Advance the machine by one transition.
    pub fn step<S: AsRef<str>>(
        &self,
        state: AcquisitionState,
        tokens: &[S],
    ) -> CryptkeyResult<AcquisitionState> {
        let next = match state {
            AcquisitionState::Start => AcquisitionState::SpecParsed(parse_key_spec(tokens)),
            AcquisitionState::SpecParsed(None) => {
                info!("no crypt_keyfile parameter on the kernel command line");
                AcquisitionState::PromptOnly(FallbackReason::ConfigAbsent)
            }
            AcquisitionState::SpecParsed(Some(ParsedKeySpec::Invalid { value })) => {
                warn!("ignoring malformed crypt_keyfile value {value:?}; expected <device>:<path>");
                AcquisitionState::PromptOnly(FallbackReason::ConfigInvalid)
            }
            AcquisitionState::SpecParsed(Some(ParsedKeySpec::Valid(spec))) => {
                AcquisitionState::KeyAttempt(spec)
            }
            AcquisitionState::KeyAttempt(spec) => self.attempt_keyfile(spec),
            AcquisitionState::PromptOnly(reason) => {
                let passphrase = self.prompt.prompt_password(&self.label)?;
                AcquisitionState::Done(Acquired {
                    passphrase,
                    source: PassphraseSource::Prompt { reason },
                })
            }
            done @ AcquisitionState::Done(_) => done,
        };
        Ok(next)
    }

    fn attempt_keyfile(&self, spec: KeySpec) -> AcquisitionState {
        let device = self.keys.describe(&spec);
        match self.keys.retrieve(&spec) {
            RetrievalOutcome::Success(passphrase) => {
                info!(
                    "using keyfile {} from {}",
                    spec.key_path.display(),
                    device.display()
                );
                AcquisitionState::Done(Acquired {
                    passphrase,
                    source: PassphraseSource::Keyfile { device },
                })
            }
            failed => {
                let failure = failed.kind();
                info!(
                    "keyfile {} on {} unavailable ({failure}); falling back to password prompt",
                    spec.key_path.display(),
                    device.display()
                );
                AcquisitionState::PromptOnly(FallbackReason::Retrieval(failure))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceReference;
    use crate::error::CryptkeyError;
    use std::cell::{Cell, RefCell};

    struct StubSource {
        outcome: RefCell<Option<RetrievalOutcome>>,
        calls: Cell<usize>,
    }

    impl StubSource {
        fn new(outcome: RetrievalOutcome) -> Self {
            Self {
                outcome: RefCell::new(Some(outcome)),
                calls: Cell::new(0),
            }
        }

        fn succeeding(bytes: &[u8]) -> Self {
            Self::new(RetrievalOutcome::Success(Passphrase::new(bytes.to_vec())))
        }
    }

    impl KeySource for StubSource {
        fn retrieve(&self, _spec: &KeySpec) -> RetrievalOutcome {
            self.calls.set(self.calls.get() + 1);
            self.outcome
                .borrow_mut()
                .take()
                .unwrap_or(RetrievalOutcome::DeviceNotFound)
        }

        fn describe(&self, spec: &KeySpec) -> PathBuf {
            PathBuf::from("/dev/disk/by-uuid").join(spec.device.identifier())
        }
    }

    struct StubPrompt {
        reply: Option<&'static [u8]>,
        labels: RefCell<Vec<String>>,
    }

    impl StubPrompt {
        fn replying(reply: &'static [u8]) -> Self {
            Self {
                reply: Some(reply),
                labels: RefCell::new(Vec::new()),
            }
        }

        fn failing() -> Self {
            Self {
                reply: None,
                labels: RefCell::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.labels.borrow().len()
        }
    }

    impl InteractivePrompt for StubPrompt {
        fn prompt_password(&self, label: &str) -> CryptkeyResult<Passphrase> {
            self.labels.borrow_mut().push(label.to_string());
            self.reply
                .map(|bytes| Passphrase::new(bytes.to_vec()))
                .ok_or_else(|| CryptkeyError::Prompt("console went away".into()))
        }
    }

    const VALID: &[&str] = &["root=/dev/mapper/root", "crypt_keyfile=UUID=1234:key.bin"];

    #[test]
    fn keyfile_success_never_prompts() {
        let source = StubSource::succeeding(b"from-device");
        let prompt = StubPrompt::replying(b"typed");
        let acquisition = PassphraseAcquisition::new(&source, &prompt, "Unlock: ");

        let acquired = acquisition.acquire(VALID).unwrap();
        assert_eq!(acquired.passphrase.as_bytes(), b"from-device");
        assert_eq!(
            acquired.source,
            PassphraseSource::Keyfile {
                device: PathBuf::from("/dev/disk/by-uuid/1234")
            }
        );
        assert_eq!(source.calls.get(), 1);
        assert_eq!(prompt.calls(), 0);
    }

    #[test]
    fn absent_spec_prompts_without_retrieval() {
        let source = StubSource::succeeding(b"unused");
        let prompt = StubPrompt::replying(b"typed");
        let acquisition = PassphraseAcquisition::new(&source, &prompt, "Unlock: ");

        let acquired = acquisition.acquire(&["quiet", "splash"]).unwrap();
        assert_eq!(acquired.passphrase.as_bytes(), b"typed");
        assert_eq!(
            acquired.source,
            PassphraseSource::Prompt {
                reason: FallbackReason::ConfigAbsent
            }
        );
        assert_eq!(source.calls.get(), 0);
        assert_eq!(*prompt.labels.borrow(), vec!["Unlock: ".to_string()]);
    }

    #[test]
    fn invalid_spec_prompts_without_retrieval() {
        let source = StubSource::succeeding(b"unused");
        let prompt = StubPrompt::replying(b"typed");
        let acquisition = PassphraseAcquisition::new(&source, &prompt, "Unlock: ");

        let acquired = acquisition.acquire(&["crypt_keyfile=LABEL=KEYS"]).unwrap();
        assert_eq!(
            acquired.source,
            PassphraseSource::Prompt {
                reason: FallbackReason::ConfigInvalid
            }
        );
        assert_eq!(source.calls.get(), 0);
        assert_eq!(prompt.calls(), 1);
    }

    #[test]
    fn every_retrieval_failure_prompts_exactly_once() {
        let failures = [
            (RetrievalOutcome::DeviceNotFound, RetrievalFailure::DeviceNotFound),
            (
                RetrievalOutcome::MountpointUnavailable,
                RetrievalFailure::MountpointUnavailable,
            ),
            (RetrievalOutcome::MountFailed, RetrievalFailure::MountFailed),
            (RetrievalOutcome::FileNotFound, RetrievalFailure::FileNotFound),
            (RetrievalOutcome::EmptyFile, RetrievalFailure::EmptyFile),
        ];

        for (outcome, expected) in failures {
            let source = StubSource::new(outcome);
            let prompt = StubPrompt::replying(b"typed");
            let acquisition = PassphraseAcquisition::new(&source, &prompt, "Unlock: ");

            let acquired = acquisition.acquire(VALID).unwrap();
            assert_eq!(acquired.passphrase.as_bytes(), b"typed");
            assert_eq!(
                acquired.source,
                PassphraseSource::Prompt {
                    reason: FallbackReason::Retrieval(expected)
                }
            );
            assert_eq!(source.calls.get(), 1);
            assert_eq!(prompt.calls(), 1);
        }
    }

    #[test]
    fn prompt_failure_is_fatal() {
        let source = StubSource::new(RetrievalOutcome::FileNotFound);
        let prompt = StubPrompt::failing();
        let acquisition = PassphraseAcquisition::new(&source, &prompt, "Unlock: ");

        match acquisition.acquire(VALID) {
            Err(CryptkeyError::Prompt(message)) => assert_eq!(message, "console went away"),
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(prompt.calls(), 1);
    }

    #[test]
    fn steps_follow_the_documented_transitions() {
        let source = StubSource::new(RetrievalOutcome::EmptyFile);
        let prompt = StubPrompt::replying(b"typed");
        let acquisition = PassphraseAcquisition::new(&source, &prompt, "Unlock: ");

        let state = acquisition.step(AcquisitionState::Start, VALID).unwrap();
        let AcquisitionState::SpecParsed(Some(ParsedKeySpec::Valid(spec))) = &state else {
            panic!("unexpected state: {state:?}");
        };
        assert_eq!(spec.device, DeviceReference::ByUuid("1234".into()));

        let state = acquisition.step(state, VALID).unwrap();
        assert!(matches!(state, AcquisitionState::KeyAttempt(_)));

        let state = acquisition.step(state, VALID).unwrap();
        assert!(matches!(
            state,
            AcquisitionState::PromptOnly(FallbackReason::Retrieval(RetrievalFailure::EmptyFile))
        ));
        assert_eq!(prompt.calls(), 0);

        let state = acquisition.step(state, VALID).unwrap();
        assert!(matches!(state, AcquisitionState::Done(_)));

        let state = acquisition.step(state, VALID).unwrap();
        assert!(matches!(state, AcquisitionState::Done(_)));
        assert_eq!(prompt.calls(), 1);
        assert_eq!(source.calls.get(), 1);
    }
}
