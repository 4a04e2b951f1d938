//! The fingerprint engine.
//!
//! A fingerprint is a 128-bit hex digest identifying one computation by its
//! inputs: the task's registry key, its persistence-relevant parameter values
//! and the fingerprints of its input tasks. Equal fingerprints mean
//! byte-identical inputs modulo the declared persistence ignores, so the
//! fingerprint doubles as the artifact filename.

use sha2::{Digest, Sha256};

use crate::error::EvalError;
use crate::task::TaskInstance;

impl TaskInstance {
    /// The fingerprint of this instance. Computed on first use, memoized for
    /// the instance's lifetime.
    pub fn fingerprint(&self) -> Result<&str, EvalError> {
        if let Some(fingerprint) = self.fingerprint.get() {
            return Ok(fingerprint);
        }
        let fingerprint = compute(self)?;
        Ok(self.fingerprint.get_or_init(|| fingerprint))
    }

    /// The artifact stem of this instance: the fingerprint in parameter mode,
    /// the owning config's name otherwise.
    pub fn persist_name(&self) -> Result<String, EvalError> {
        if self.parameter_mode() {
            Ok(self.fingerprint()?.to_string())
        } else {
            Ok(self.config().name().to_string())
        }
    }
}

fn compute(instance: &TaskInstance) -> Result<String, EvalError> {
    let mut hasher = Sha256::new();
    hasher.update(instance.spec().key().as_bytes());

    for (name, repr) in instance.params().persistence_entries() {
        hasher.update(b"###");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(repr.as_bytes());
    }

    hasher.update(b"$$$");

    // Input names enter with the owning namespace stripped, two instances of
    // the same pipeline under different namespaces hash identically.
    let namespace_prefix = instance
        .namespace()
        .map(|ns| format!("{ns}::"))
        .unwrap_or_default();

    for entry in instance.input_entries().iter() {
        for (fullname, task) in &entry.resolved {
            let task = task.upgrade().ok_or_else(|| EvalError::ChainDropped {
                task: instance.fullname().to_string(),
                input: fullname.clone(),
            })?;
            let local_name = fullname
                .strip_prefix(&namespace_prefix)
                .unwrap_or(fullname);
            hasher.update(b"###");
            hasher.update(local_name.as_bytes());
            hasher.update(b"=");
            hasher.update(task.fingerprint()?.as_bytes());
        }
    }

    Ok(to_hex_128(&hasher.finalize()))
}

/// Hex form of the first 16 bytes of a digest, a 128-bit identifier.
fn to_hex_128(digest: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut acc = Vec::with_capacity(32);
    for &byte in digest.iter().take(16) {
        acc.push(HEX[(byte >> 4) as usize]);
        acc.push(HEX[(byte & 0xF) as usize]);
    }
    String::from_utf8(acc).unwrap()
}
