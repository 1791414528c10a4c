//! # Context Relay
//!
//! Tiered context assembly, caching, and retrieval for AI assistants.
//!
//! Context Relay assembles a bounded, access-controlled bundle of text
//! and asset references from a remote document store, and serves it
//! cheaply and repeatedly without re-paying origin fetches, binary
//! uploads, and embeddings on every request.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────────────┐   ┌───────────────┐
//! │  Caller   │──▶│ TieredCacheCoordinator │──▶│ L1 process    │
//! │ (roles →  │   │  single-flight fetch   │   │ L2 remote KV  │
//! │  scope)   │   │  scope filtering       │   │ L3 origin     │
//! └──────────┘   └───────────┬───────────┘   └───────────────┘
//!                            │ cache miss
//!            ┌───────────────┼────────────────┐
//!            ▼               ▼                ▼
//!      ┌──────────┐   ┌────────────┐   ┌────────────┐
//!      │  Origin  │   │   Asset    │   │ Chunk+Embed │
//!      │  fetch + │   │  uploads   │   │ → vector    │
//!      │ classify │   │ (expiry)   │   │   index     │
//!      └──────────┘   └────────────┘   └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy the coordinator branches on |
//! | [`origin`] | Origin tree walk and document classification |
//! | [`extract`] | Text extraction from PDF/OOXML binaries |
//! | [`chunk`] | Paragraph-aware text chunking with overlap |
//! | [`embedding`] | Embedding service client |
//! | [`index`] | Vector index sync and scored, diversified retrieval |
//! | [`assets`] | Binary asset upload lifecycle and reuse windows |
//! | [`cache`] | L1 cache state and the distributed KV client |
//! | [`roles`] | Role-to-folder access filtering |
//! | [`coordinator`] | Tiered cache walk with single-flight fetches |

pub mod assets;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod models;
pub mod origin;
pub mod roles;
