//! Signed Decision Records
//!
//! A Decision Record (DR) documents why an automated decision was made:
//! the actor, the task, the prompt hash, the alternatives weighed and
//! the decision itself. Records are signed with a per-process Ed25519
//! key over their canonical JSON form (sorted keys, UTF-8, signature
//! field excluded), so any post-hoc mutation of the payload fails
//! verification.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use ed25519_dalek::pkcs8::spki::EncodePublicKey;
use ed25519_dalek::pkcs8::EncodePrivateKey;
use pkcs8::LineEnding;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error};

use crate::merkle::sha256_hex;

/// Errors raised by the decision store
#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("failed to create decision directory {dir}: {source}")]
    CreateDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist key material: {0}")]
    KeyPersistence(String),

    #[error("failed to write decision record {dr_id}: {source}")]
    Write {
        dr_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize decision record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// A signed record of one automated decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub dr_id: String,
    pub ts: String,
    pub actor: String,
    pub task_id: String,
    pub policy_version: String,
    pub model_fingerprint: String,
    /// Literally `sha256:<lowercase-hex>`
    pub prompt_hash: String,
    pub reasoning_markers: Vec<String>,
    pub tools_used: Vec<String>,
    pub alternatives_considered: Vec<String>,
    pub decision: String,
    pub constraints: Map<String, Value>,
    pub expected_risk: Vec<String>,
    /// `ed25519:<lowercase-hex>` once signed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl DecisionRecord {
    /// Build an unsigned record; `prompt_hash` is the raw hex digest
    pub fn new(actor: &str, task_id: &str, decision: &str, prompt_hash: &str) -> Self {
        Self {
            dr_id: generate_dr_id(),
            ts: Utc::now().to_rfc3339(),
            actor: actor.to_string(),
            task_id: task_id.to_string(),
            policy_version: "policies@0.1.0".to_string(),
            model_fingerprint: String::new(),
            prompt_hash: format!("sha256:{prompt_hash}"),
            reasoning_markers: Vec::new(),
            tools_used: Vec::new(),
            alternatives_considered: Vec::new(),
            decision: decision.to_string(),
            constraints: Map::new(),
            expected_risk: Vec::new(),
            signature: None,
        }
    }

    /// Canonical signing bytes: sorted-key JSON without the signature
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("signature");
        }
        Ok(canonical_json(&value).into_bytes())
    }

    /// Sign the record, attaching `ed25519:<hex>`
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), serde_json::Error> {
        let bytes = self.canonical_bytes()?;
        let signature = key.sign(&bytes);
        self.signature = Some(format!("ed25519:{}", hex::encode(signature.to_bytes())));
        Ok(())
    }

    /// Verify the record's signature against a public key
    ///
    /// Returns false for unsigned records, malformed signatures and any
    /// record whose canonical payload no longer matches the signature.
    pub fn verify(&self, public_key: &VerifyingKey) -> bool {
        let Some(sig_field) = &self.signature else {
            return false;
        };
        let Some(sig_hex) = sig_field.strip_prefix("ed25519:") else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(sig_hex) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&sig_bytes) else {
            return false;
        };
        let Ok(bytes) = self.canonical_bytes() else {
            return false;
        };
        public_key.verify(&bytes, &signature).is_ok()
    }
}

/// Render a value as compact JSON with recursively sorted object keys
fn canonical_json(value: &Value) -> String {
    serde_json::to_string(&sort_keys(value)).expect("canonical serialization cannot fail")
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

fn generate_dr_id() -> String {
    let date = Utc::now().format("%Y%m%d");
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..6];
    format!("DR-{date}-{suffix}")
}

/// SHA-256 hex digest of a prompt, for `prompt_hash` fields
pub fn prompt_hash_of(prompt: &str) -> String {
    sha256_hex(prompt.as_bytes())
}

/// Optional fields for [`DecisionStore::create_dr`]
#[derive(Debug, Clone, Default)]
pub struct DecisionContext {
    pub policy_version: Option<String>,
    pub model_fingerprint: Option<String>,
    pub reasoning_markers: Vec<String>,
    pub tools_used: Vec<String>,
    pub alternatives_considered: Vec<String>,
    pub constraints: Map<String, Value>,
    pub expected_risk: Vec<String>,
}

/// Store holding one Ed25519 key pair and the signed records
///
/// The key pair is generated at construction and written to the
/// signatures directory. The private key is persisted unencrypted;
/// production deployments should swap in a secrets backend.
pub struct DecisionStore {
    decisions_dir: PathBuf,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    lock: Mutex<()>,
}

impl DecisionStore {
    /// Create a store writing records to `decisions_dir` and keys to
    /// `signatures_dir`
    pub fn new(decisions_dir: impl Into<PathBuf>, signatures_dir: impl Into<PathBuf>) -> Result<Self, DecisionError> {
        let decisions_dir = decisions_dir.into();
        let signatures_dir = signatures_dir.into();

        for dir in [&decisions_dir, &signatures_dir] {
            fs::create_dir_all(dir).map_err(|source| DecisionError::CreateDir {
                dir: dir.clone(),
                source,
            })?;
        }

        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();

        save_keys(&signing_key, &verifying_key, &signatures_dir)?;
        debug!(?decisions_dir, "DecisionStore::new: keypair generated");

        Ok(Self {
            decisions_dir,
            signing_key,
            verifying_key,
            lock: Mutex::new(()),
        })
    }

    /// Public half of the process key pair
    pub fn public_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    /// Build, sign and persist a record
    ///
    /// `prompt_hash` is the raw SHA-256 hex of the input prompt.
    pub fn create_dr(
        &self,
        actor: &str,
        task_id: &str,
        decision: &str,
        prompt_hash: &str,
        context: DecisionContext,
    ) -> Result<DecisionRecord, DecisionError> {
        let mut record = DecisionRecord::new(actor, task_id, decision, prompt_hash);
        if let Some(version) = context.policy_version {
            record.policy_version = version;
        }
        if let Some(fingerprint) = context.model_fingerprint {
            record.model_fingerprint = fingerprint;
        }
        record.reasoning_markers = context.reasoning_markers;
        record.tools_used = context.tools_used;
        record.alternatives_considered = context.alternatives_considered;
        record.constraints = context.constraints;
        record.expected_risk = context.expected_risk;

        record.sign(&self.signing_key)?;
        self.save_dr(&record)?;
        Ok(record)
    }

    /// Persist a record as `<decisions_dir>/<dr_id>.json`
    pub fn save_dr(&self, record: &DecisionRecord) -> Result<(), DecisionError> {
        let _guard = self.lock.lock().expect("decision lock poisoned");
        let path = self.decisions_dir.join(format!("{}.json", record.dr_id));
        let json = serde_json::to_string_pretty(record)?;
        fs::write(&path, json).map_err(|source| DecisionError::Write {
            dr_id: record.dr_id.clone(),
            source,
        })
    }

    /// Load a record by id, or None when absent or unparseable
    pub fn load_dr(&self, dr_id: &str) -> Option<DecisionRecord> {
        let path = self.decisions_dir.join(format!("{dr_id}.json"));
        let content = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&content) {
            Ok(record) => Some(record),
            Err(e) => {
                error!(%dr_id, error = %e, "failed to parse decision record");
                None
            }
        }
    }

    /// Verify a record against this store's public key
    pub fn verify(&self, record: &DecisionRecord) -> bool {
        record.verify(&self.verifying_key)
    }
}

fn save_keys(
    signing_key: &SigningKey,
    verifying_key: &VerifyingKey,
    signatures_dir: &Path,
) -> Result<(), DecisionError> {
    let private_pem = signing_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| DecisionError::KeyPersistence(e.to_string()))?;
    fs::write(signatures_dir.join("private_key.pem"), private_pem.as_bytes())
        .map_err(|e| DecisionError::KeyPersistence(e.to_string()))?;

    let public_pem = verifying_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| DecisionError::KeyPersistence(e.to_string()))?;
    fs::write(signatures_dir.join("public_key.pem"), public_pem.as_bytes())
        .map_err(|e| DecisionError::KeyPersistence(e.to_string()))
}

// Process-wide instance. Tests reset it via `reset_global`.
static GLOBAL: Mutex<Option<Arc<DecisionStore>>> = Mutex::new(None);

/// Initialize the process-wide decision store
///
/// The key pair is created here, after configuration load, so the
/// signatures directory is already known.
pub fn init_global(
    decisions_dir: impl Into<PathBuf>,
    signatures_dir: impl Into<PathBuf>,
) -> Result<Arc<DecisionStore>, DecisionError> {
    let store = Arc::new(DecisionStore::new(decisions_dir, signatures_dir)?);
    *GLOBAL.lock().expect("decision global lock poisoned") = Some(store.clone());
    Ok(store)
}

/// The process-wide decision store, if initialized
pub fn global() -> Option<Arc<DecisionStore>> {
    GLOBAL.lock().expect("decision global lock poisoned").clone()
}

/// Drop the process-wide decision store
pub fn reset_global() {
    *GLOBAL.lock().expect("decision global lock poisoned") = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_store(dir: &Path) -> DecisionStore {
        DecisionStore::new(dir.join("decisions"), dir.join("signatures")).unwrap()
    }

    #[test]
    fn test_dr_id_format() {
        let id = generate_dr_id();
        assert!(id.starts_with("DR-"));
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let temp = tempdir().unwrap();
        let store = test_store(temp.path());

        let dr = store
            .create_dr("agent", "task-1", "approve", &prompt_hash_of("compute the sum"), DecisionContext::default())
            .unwrap();

        assert!(dr.signature.as_ref().unwrap().starts_with("ed25519:"));
        assert!(store.verify(&dr));

        let loaded = store.load_dr(&dr.dr_id).unwrap();
        assert!(store.verify(&loaded));
    }

    #[test]
    fn test_payload_mutation_breaks_signature() {
        let temp = tempdir().unwrap();
        let store = test_store(temp.path());

        let dr = store
            .create_dr("agent", "task-1", "approve", &prompt_hash_of("q"), DecisionContext::default())
            .unwrap();

        let mut tampered = dr.clone();
        tampered.decision = "deny".to_string();
        assert!(!store.verify(&tampered));

        // One-byte flip is enough
        let mut flipped = dr.clone();
        flipped.actor = format!("{}x", flipped.actor);
        assert!(!store.verify(&flipped));
    }

    #[test]
    fn test_file_overwrite_detected_on_load() {
        let temp = tempdir().unwrap();
        let store = test_store(temp.path());

        let dr = store
            .create_dr("agent", "task-1", "approve", &prompt_hash_of("q"), DecisionContext::default())
            .unwrap();

        // Rewrite the stored file with a different decision
        let path = temp.path().join("decisions").join(format!("{}.json", dr.dr_id));
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("approve", "deny")).unwrap();

        let loaded = store.load_dr(&dr.dr_id).unwrap();
        assert_eq!(loaded.decision, "deny");
        assert!(!store.verify(&loaded));
    }

    #[test]
    fn test_unsigned_record_fails_verification() {
        let temp = tempdir().unwrap();
        let store = test_store(temp.path());
        let dr = DecisionRecord::new("agent", "task-1", "approve", "abc123");
        assert!(!store.verify(&dr));
    }

    #[test]
    fn test_canonical_bytes_sorted_and_stable() {
        let mut dr = DecisionRecord::new("agent", "task-1", "approve", "abc123");
        dr.constraints.insert("zeta".to_string(), Value::from(1));
        dr.constraints.insert("alpha".to_string(), Value::from(2));

        let bytes = dr.canonical_bytes().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(!text.contains("signature"));
        assert!(text.find("\"alpha\"").unwrap() < text.find("\"zeta\"").unwrap());
        assert!(text.find("\"actor\"").unwrap() < text.find("\"task_id\"").unwrap());

        // Signing does not perturb the canonical payload
        let again = dr.canonical_bytes().unwrap();
        assert_eq!(bytes, again);
    }

    #[test]
    fn test_keys_written_as_pem() {
        let temp = tempdir().unwrap();
        let _store = test_store(temp.path());

        let private = fs::read_to_string(temp.path().join("signatures/private_key.pem")).unwrap();
        let public = fs::read_to_string(temp.path().join("signatures/public_key.pem")).unwrap();
        assert!(private.contains("BEGIN PRIVATE KEY"));
        assert!(public.contains("BEGIN PUBLIC KEY"));
    }

    #[test]
    fn test_prompt_hash_framing() {
        let dr = DecisionRecord::new("agent", "t", "d", &prompt_hash_of("hello"));
        assert!(dr.prompt_hash.starts_with("sha256:"));
        assert_eq!(dr.prompt_hash.len(), "sha256:".len() + 64);
    }

    #[test]
    fn test_load_missing_record() {
        let temp = tempdir().unwrap();
        let store = test_store(temp.path());
        assert!(store.load_dr("DR-19700101-000000").is_none());
    }

    #[test]
    #[serial_test::serial]
    fn test_global_lifecycle() {
        let temp = tempdir().unwrap();
        let store = init_global(temp.path().join("decisions"), temp.path().join("signatures")).unwrap();
        assert!(global().is_some());

        let dr = store
            .create_dr("agent", "t", "approve", &prompt_hash_of("q"), DecisionContext::default())
            .unwrap();
        assert!(store.verify(&dr));

        reset_global();
        assert!(global().is_none());
    }
}
