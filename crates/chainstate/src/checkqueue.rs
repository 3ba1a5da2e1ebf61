//! Parallel script verification for block connect.
//!
//! Checks own copies of everything they touch so workers never reach
//! back into chain state. Any failure short-circuits the rest of the
//! queue; strict-encoding failures are re-run permissively to decide
//! whether the sender is malicious or merely nonstandard.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kestrel_primitives::Transaction;
use kestrel_script::{ScriptVerifier, VERIFY_STRICTENC};
use rayon::prelude::*;

use crate::validation::ValidationError;

pub struct ScriptCheck {
    pub tx: Arc<Transaction>,
    pub input_index: usize,
    pub script_pubkey: Vec<u8>,
    pub flags: u32,
}

#[derive(Default)]
pub struct CheckQueue {
    checks: Vec<ScriptCheck>,
}

impl CheckQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, check: ScriptCheck) {
        self.checks.push(check);
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Drains the queue across the worker pool. Returns the combined
    /// verdict; once one check fails, the rest may be skipped.
    pub fn wait(self, verifier: &dyn ScriptVerifier) -> Result<(), ValidationError> {
        let failed = AtomicBool::new(false);
        let soft_failure = AtomicBool::new(false);

        self.checks.par_iter().for_each(|check| {
            if failed.load(Ordering::Relaxed) {
                return;
            }
            let input = &check.tx.vin[check.input_index];
            if verifier.verify(
                &input.script_sig,
                &check.script_pubkey,
                &check.tx,
                check.input_index,
                check.flags,
            ) {
                return;
            }
            if check.flags & VERIFY_STRICTENC != 0
                && verifier.verify(
                    &input.script_sig,
                    &check.script_pubkey,
                    &check.tx,
                    check.input_index,
                    check.flags & !VERIFY_STRICTENC,
                )
            {
                soft_failure.store(true, Ordering::Relaxed);
            }
            failed.store(true, Ordering::Relaxed);
        });

        if !failed.load(Ordering::Relaxed) {
            return Ok(());
        }
        if soft_failure.load(Ordering::Relaxed) {
            // Valid under consensus flags, rejected by policy: no score.
            Err(ValidationError::invalid(
                "non-mandatory-script-verify-flag",
                0,
            ))
        } else {
            Err(ValidationError::dos100("mandatory-script-verify-flag"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_primitives::{OutPoint, TxIn, TxOut};

    /// Accepts a script iff its first byte is non-zero; with strict
    /// flags it additionally requires the byte to be at least 2.
    struct ByteVerifier;

    impl ScriptVerifier for ByteVerifier {
        fn verify(
            &self,
            _script_sig: &[u8],
            script_pubkey: &[u8],
            _tx: &Transaction,
            _input_index: usize,
            flags: u32,
        ) -> bool {
            let level = script_pubkey.first().copied().unwrap_or(0);
            if flags & VERIFY_STRICTENC != 0 {
                level >= 2
            } else {
                level >= 1
            }
        }
    }

    fn queue_with(levels: &[u8], flags: u32) -> CheckQueue {
        let tx = Arc::new(Transaction {
            version: 1,
            vin: levels
                .iter()
                .map(|_| TxIn {
                    prevout: OutPoint::new([0x01; 32], 0),
                    script_sig: Vec::new(),
                    sequence: u32::MAX,
                })
                .collect(),
            vout: vec![TxOut::new(1, Vec::new())],
            lock_time: 0,
        });
        let mut queue = CheckQueue::new();
        for (index, level) in levels.iter().enumerate() {
            queue.push(ScriptCheck {
                tx: Arc::clone(&tx),
                input_index: index,
                script_pubkey: vec![*level],
                flags,
            });
        }
        queue
    }

    #[test]
    fn all_passing_checks_succeed() {
        let queue = queue_with(&[2, 2, 2, 2], VERIFY_STRICTENC);
        assert!(queue.wait(&ByteVerifier).is_ok());
        assert!(CheckQueue::new().wait(&ByteVerifier).is_ok());
    }

    #[test]
    fn hard_failure_scores_the_peer() {
        let queue = queue_with(&[2, 0, 2], VERIFY_STRICTENC);
        let err = queue.wait(&ByteVerifier).expect_err("must fail");
        assert_eq!(err.dos_score(), 100);
    }

    #[test]
    fn strict_only_failure_is_not_scored() {
        // Level 1 passes permissively but fails the strict check.
        let queue = queue_with(&[2, 1, 2], VERIFY_STRICTENC);
        let err = queue.wait(&ByteVerifier).expect_err("must fail");
        assert!(err.is_invalid());
        assert_eq!(err.dos_score(), 0);
    }
}
