//! Trust-on-first-use host key verification
//!
//! For every connection attempt the presented key is classified against the
//! known_hosts store:
//!
//! | known_hosts entry | strict | result                                    |
//! |-------------------|--------|-------------------------------------------|
//! | same key          | any    | trusted                                   |
//! | different key     | any    | `HostKeyMismatch`, never bypassed         |
//! | none              | off    | trusted, nothing recorded                 |
//! | none              | on     | ask the prompt; record on yes, else reject |

use std::sync::Arc;

use tracing::{info, warn};

use super::error::SshError;
use super::known_hosts::{HostKey, HostLookup, InsertOutcome, KnownHostsStore};
use super::prompt::HostKeyPrompt;

/// Why a host key was accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustDecision {
    /// Matches the recorded key
    Known,
    /// Unknown host accepted without recording (strict checking off)
    AcceptedUnrecorded,
    /// Operator confirmed; the key is now recorded
    Confirmed,
}

/// Classification of a presented key before any prompting happens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Trusted(TrustDecision),
    Mismatch { expected_fingerprint: String },
    PendingConfirmation,
}

/// Pure decision step, shared by the first lookup and the locked re-check
pub fn classify(lookup: &HostLookup, presented: &HostKey, strict: bool) -> Classification {
    match lookup {
        HostLookup::Found(known) => {
            if known.fingerprint() == presented.fingerprint() {
                Classification::Trusted(TrustDecision::Known)
            } else {
                Classification::Mismatch {
                    expected_fingerprint: known.fingerprint(),
                }
            }
        }
        HostLookup::NotFound | HostLookup::FileAbsent => {
            if strict {
                Classification::PendingConfirmation
            } else {
                Classification::Trusted(TrustDecision::AcceptedUnrecorded)
            }
        }
    }
}

/// Decides whether to trust the key a host presents
pub struct TrustedHostVerifier {
    store: KnownHostsStore,
    strict: bool,
    prompt: Arc<dyn HostKeyPrompt>,
}

impl TrustedHostVerifier {
    pub fn new(store: KnownHostsStore, strict: bool, prompt: Arc<dyn HostKeyPrompt>) -> Self {
        Self {
            store,
            strict,
            prompt,
        }
    }

    pub fn store(&self) -> &KnownHostsStore {
        &self.store
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Verify `key` for `host_id` (as produced by `host_identifier`)
    ///
    /// May block on the prompt.
    pub fn verify(&self, host_id: &str, key: &HostKey) -> Result<TrustDecision, SshError> {
        let lookup = self.store.lookup(host_id)?;

        match classify(&lookup, key, self.strict) {
            Classification::Trusted(decision) => {
                self.log_trusted(host_id, key, decision);
                Ok(decision)
            }
            Classification::Mismatch {
                expected_fingerprint,
            } => Err(self.mismatch(host_id, expected_fingerprint, key)),
            Classification::PendingConfirmation => self.confirm(host_id, key),
        }
    }

    fn confirm(&self, host_id: &str, key: &HostKey) -> Result<TrustDecision, SshError> {
        let fingerprint = key.fingerprint();
        info!(
            "Unknown host {} (type: {}, fingerprint: {}), asking for confirmation",
            host_id,
            key.key_type(),
            fingerprint
        );

        let outcome = self.store.lookup_or_insert_with(host_id, key, || {
            self.prompt.confirm(host_id, key.key_type(), &fingerprint)
        })?;

        match outcome {
            InsertOutcome::Inserted => {
                self.log_trusted(host_id, key, TrustDecision::Confirmed);
                Ok(TrustDecision::Confirmed)
            }
            InsertOutcome::Declined => {
                warn!("Host key for {} was not confirmed", host_id);
                Err(SshError::HostKeyNotConfirmed {
                    host: host_id.to_string(),
                    fingerprint,
                })
            }
            // Recorded by a concurrent attempt while we waited for the lock
            InsertOutcome::AlreadyKnown(known) => {
                match classify(&HostLookup::Found(known), key, self.strict) {
                    Classification::Mismatch {
                        expected_fingerprint,
                    } => Err(self.mismatch(host_id, expected_fingerprint, key)),
                    _ => {
                        self.log_trusted(host_id, key, TrustDecision::Known);
                        Ok(TrustDecision::Known)
                    }
                }
            }
        }
    }

    fn mismatch(&self, host_id: &str, expected_fingerprint: String, key: &HostKey) -> SshError {
        let actual_fingerprint = key.fingerprint();
        warn!(
            "HOST KEY CHANGED for {}! Expected {}, got {}. POSSIBLE MITM ATTACK!",
            host_id, expected_fingerprint, actual_fingerprint
        );
        SshError::HostKeyMismatch {
            host: host_id.to_string(),
            expected_fingerprint,
            actual_fingerprint,
            known_hosts: self.store.path().to_path_buf(),
        }
    }

    fn log_trusted(&self, host_id: &str, key: &HostKey, decision: TrustDecision) {
        match decision {
            TrustDecision::Known => info!("Host key verified for {}", host_id),
            TrustDecision::AcceptedUnrecorded => info!(
                "Strict host key checking disabled, accepting {} without recording (fingerprint: {})",
                host_id,
                key.fingerprint()
            ),
            TrustDecision::Confirmed => info!("Host key for {} confirmed and recorded", host_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::known_hosts::parse_known_hosts;
    use crate::ssh::prompt::{AutoAccept, AutoReject};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    fn key(tag: u8) -> HostKey {
        HostKey::new("ssh-rsa", vec![0, 0, 0, 7, tag, tag, tag, tag])
    }

    /// Prompt that records how often it was asked
    struct Counting {
        answer: bool,
        calls: AtomicUsize,
    }

    impl HostKeyPrompt for Counting {
        fn confirm(&self, _: &str, _: &str, _: &str) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    fn verifier(strict: bool, prompt: Arc<dyn HostKeyPrompt>) -> (TempDir, TrustedHostVerifier) {
        let temp = tempdir().unwrap();
        let store = KnownHostsStore::new(temp.path().join("known_hosts"));
        (temp, TrustedHostVerifier::new(store, strict, prompt))
    }

    fn entries(verifier: &TrustedHostVerifier) -> usize {
        std::fs::read_to_string(verifier.store().path())
            .map(|c| parse_known_hosts(&c).len())
            .unwrap_or(0)
    }

    #[test]
    fn test_classify_table() {
        let k = key(1);
        let other = key(2);
        assert_eq!(
            classify(&HostLookup::Found(k.clone()), &k, true),
            Classification::Trusted(TrustDecision::Known)
        );
        assert_eq!(
            classify(&HostLookup::Found(other.clone()), &k, false),
            Classification::Mismatch {
                expected_fingerprint: other.fingerprint()
            }
        );
        assert_eq!(
            classify(&HostLookup::FileAbsent, &k, true),
            Classification::PendingConfirmation
        );
        assert_eq!(
            classify(&HostLookup::NotFound, &k, false),
            Classification::Trusted(TrustDecision::AcceptedUnrecorded)
        );
    }

    #[test]
    fn test_confirm_then_trusted_without_prompting_again() {
        let prompt = Arc::new(Counting {
            answer: true,
            calls: AtomicUsize::new(0),
        });
        let (_temp, verifier) = verifier(true, prompt.clone());
        let k = key(1);

        assert_eq!(verifier.verify("web", &k).unwrap(), TrustDecision::Confirmed);
        assert_eq!(entries(&verifier), 1);

        assert_eq!(verifier.verify("web", &k).unwrap(), TrustDecision::Known);
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
        assert_eq!(entries(&verifier), 1);

        let recorded = parse_known_hosts(&std::fs::read_to_string(verifier.store().path()).unwrap());
        assert_eq!(recorded[0].hosts, vec!["web"]);
        assert_eq!(recorded[0].key, k);
    }

    #[test]
    fn test_mismatch_is_rejected_without_prompting() {
        let prompt = Arc::new(Counting {
            answer: true,
            calls: AtomicUsize::new(0),
        });
        let (_temp, verifier) = verifier(true, prompt.clone());
        verifier.store().append("web", &key(1)).unwrap();

        let err = verifier.verify("web", &key(2)).unwrap_err();
        assert!(matches!(err, SshError::HostKeyMismatch { ref host, .. } if host == "web"));
        assert!(err.is_security_failure());
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 0);
        assert_eq!(entries(&verifier), 1);
    }

    #[test]
    fn test_mismatch_is_rejected_even_when_not_strict() {
        let (_temp, verifier) = verifier(false, Arc::new(AutoAccept));
        verifier.store().append("web", &key(1)).unwrap();

        assert!(matches!(
            verifier.verify("web", &key(2)),
            Err(SshError::HostKeyMismatch { .. })
        ));
    }

    #[test]
    fn test_declined_confirmation() {
        let (_temp, verifier) = verifier(true, Arc::new(AutoReject));

        let err = verifier.verify("[db]:2222", &key(3)).unwrap_err();
        assert!(matches!(err, SshError::HostKeyNotConfirmed { ref host, .. } if host == "[db]:2222"));
        assert!(!verifier.store().path().exists());
    }

    #[test]
    fn test_insecure_mode_records_nothing() {
        let prompt = Arc::new(Counting {
            answer: true,
            calls: AtomicUsize::new(0),
        });
        let (_temp, verifier) = verifier(false, prompt.clone());

        assert_eq!(
            verifier.verify("web", &key(1)).unwrap(),
            TrustDecision::AcceptedUnrecorded
        );
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 0);
        assert_eq!(entries(&verifier), 0);
    }

    #[test]
    fn test_insecure_mode_leaves_empty_file_empty() {
        let prompt = Arc::new(Counting {
            answer: true,
            calls: AtomicUsize::new(0),
        });
        let (_temp, verifier) = verifier(false, prompt.clone());
        std::fs::write(verifier.store().path(), "").unwrap();
        assert_eq!(verifier.store().lookup("web").unwrap(), HostLookup::NotFound);

        assert_eq!(
            verifier.verify("web", &key(1)).unwrap(),
            TrustDecision::AcceptedUnrecorded
        );
        assert_eq!(prompt.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_to_string(verifier.store().path()).unwrap(), "");
    }

    #[test]
    fn test_concurrent_first_contact_records_once() {
        let prompt = Arc::new(Counting {
            answer: true,
            calls: AtomicUsize::new(0),
        });
        let (_temp, verifier) = verifier(true, prompt.clone());
        let verifier = Arc::new(verifier);
        let k = key(9);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let verifier = verifier.clone();
                let k = k.clone();
                std::thread::spawn(move || verifier.verify("web", &k).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(prompt.calls.load(Ordering::SeqCst), 1);
        assert_eq!(entries(&verifier), 1);
    }
}
