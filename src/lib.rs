//! # Channel Mart
//!
//! Loads scraped channel messages and image detections into SQLite, builds
//! dimensional marts from them, and serves the marts over a read-only HTTP
//! API.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌────────────┐   ┌──────────┐
//! │ scrape files │──▶│    Loader     │──▶│ raw tables │──▶│  Marts   │
//! │ CSV / JSON   │   │ (replace all) │   │            │   │ dim/fct  │
//! └──────────────┘   └──────────────┘   └─────▲──────┘   └────┬─────┘
//!                                             │               │
//! ┌──────────────┐   ┌──────────────┐         │               ▼
//! │ image tree + │──▶│  Enrichment  │─────────┘          ┌──────────┐
//! │  manifests   │   │  (Detector)  │                    │ HTTP API │
//! └──────────────┘   └──────────────┘                    └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mart init                          # create database
//! mart load messages data/raw/csv/messages.csv
//! mart enrich                        # run the detector over the image tree
//! mart build                         # rebuild dimensions and facts
//! mart check                         # verify mart invariants
//! mart serve                         # start the HTTP API
//! mart run                           # all of the above, in order
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Messages, detections, image predictions |
//! | [`loader`] | Raw message and detection loading |
//! | [`manifest`] | Image → message mapping |
//! | [`detect`] | Detector abstraction and providers |
//! | [`enrich`] | Image enrichment over the channel tree |
//! | [`marts`] | Dimension/fact rebuild and checks |
//! | [`query`] | Read-only API queries |
//! | [`server`] | HTTP API |
//! | [`pipeline`] | End-to-end `mart run` |
//! | [`report`] | Per-unit batch reports |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod config;
pub mod db;
pub mod detect;
pub mod enrich;
pub mod files;
pub mod loader;
pub mod manifest;
pub mod marts;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod query;
pub mod report;
pub mod server;
pub mod stats;
