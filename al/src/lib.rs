//! auditledger - tamper-evident audit primitives
//!
//! The audit subsystem of the orchestrator: every component that has to
//! prove what happened writes through this crate.
//!
//! # Modules
//!
//! - [`merkle`] - SHA-256 Merkle trees over log lines
//! - [`worm`] - append-only JSONL logs with checkpointing and finalization
//! - [`decision`] - Ed25519-signed Decision Records
//! - [`provenance`] - W3C PROV-JSON provenance graphs
//!
//! The stores are plain values; each module also exposes an optional
//! process-wide instance (`init_global` / `global` / `reset_global`) for
//! runtimes that want a single shared ledger.

pub mod decision;
pub mod merkle;
pub mod provenance;
pub mod worm;

pub use decision::{DecisionContext, DecisionError, DecisionRecord, DecisionStore, prompt_hash_of};
pub use merkle::{MerkleTree, sha256_hex};
pub use provenance::{GenerationTrace, ProvBuilder, ProvDocument, ProvenanceStore, ToolTrace};
pub use worm::{Checkpoint, ComplianceMetadata, FinalizationDigest, WormError, WormLog};
