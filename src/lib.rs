//! # dbt capsule
//!
//! A local-first context engine for dbt projects.
//!
//! dbt capsule indexes a compiled project's dependency graph (models,
//! columns, tests, macros, sources, exposures and the edges between them)
//! and answers one composite question for a coding agent with a limited
//! context window: *what is the smallest, best-ranked slice of the project
//! needed to perform this task?*
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────┐
//! │   Records    │──▶│   Ingest    │──▶│   Snapshot   │──▶ SQLite
//! │ (JSON file)  │   │ stage+hash  │   │ centrality + │
//! └──────────────┘   └─────────────┘   │  BM25 index  │
//!                                      └──────┬───────┘
//!                 ┌────────────┬──────────────┼─────────────┐
//!                 ▼            ▼              ▼             ▼
//!              search      lineage        capsule     model details
//!                 └────────────┴──────┬───────┴─────────────┘
//!                                     ▼
//!                        CLI · HTTP tools · MCP bridge
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! capsule init
//! capsule index --records target/capsule_records.json --full
//! capsule search "daily revenue"
//! capsule capsule "fix the failing revenue_daily model"
//! capsule serve mcp
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Query and ingestion error types |
//! | [`models`] | Graph entities |
//! | [`records`] | Ingestion input records and content hashing |
//! | [`ingest`] | Staging a records bundle against the current snapshot |
//! | [`snapshot`] | Immutable published graph and its swap handle |
//! | [`centrality`] | Structural importance scoring |
//! | [`lexical`] | Tokenizer, stemmer and BM25 index |
//! | [`search`] | Hybrid ranker |
//! | [`intent`] | Task intent classification |
//! | [`traversal`] | Bounded lineage traversal |
//! | [`skeleton`] | Detail tiers and token budgeting |
//! | [`capsule`] | Context capsule assembly |
//! | [`patterns`] | Project naming and materialization conventions |
//! | [`column_lineage`] | Column-level lineage inference |
//! | [`get`] | Model detail view |
//! | [`engine`] | Engine handle and reindexing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Persisted schema |
//! | [`store`] | Snapshot persistence |
//! | [`traits`] | Tool trait and registry |
//! | [`server`] | HTTP tool server |
//! | [`mcp`] | MCP bridge |
//! | [`stats`] | Index statistics |
//! | [`usage`] | Session event log |

pub mod capsule;
pub mod centrality;
pub mod column_lineage;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod get;
pub mod ingest;
pub mod intent;
pub mod lexical;
pub mod mcp;
pub mod migrate;
pub mod models;
pub mod patterns;
pub mod records;
pub mod search;
pub mod server;
pub mod skeleton;
pub mod snapshot;
pub mod stats;
pub mod store;
pub mod traits;
pub mod traversal;
pub mod usage;
