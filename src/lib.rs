//! # Rendergun
//!
//! Renders JavaScript-heavy web pages into static HTML snapshots using a pool
//! of headless Chrome workers. Every snapshot has its `<script>` and
//! `<noscript>` elements removed and carries the HTTP status of the page's
//! main document.
//!
//! ## Features
//!
//! - **Worker Pool**: One Chrome process per worker, dispatched round-robin to healthy workers
//! - **Crash Recovery**: A browser that exits is relaunched automatically, in-flight renders fail fast
//! - **Worker Recycling**: Idle workers are relaunched after a configurable number of requests
//! - **Request Blocking**: Images, per-request abort patterns, a global blacklist and ad hosts
//! - **Result Cache**: Successful renders are kept in an LRU bounded by total bytes and entry age
//! - **Content Override**: Render caller-supplied HTML as if it were served from the target URL
//!
//! ## Request Outcomes
//!
//! | Situation | Status | Body |
//! |-----------|--------|------|
//! | Page loaded | status of the main document | serialized DOM without scripts |
//! | Navigation deadline missed | 504 | timeout message |
//! | No document response | 400 | `no response` |
//! | Invalid URL | 400 | `Invalid URL` |
//! | Browser or worker failure | 500 | short description |
//!
//! Only 2xx results are cached.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rendergun::{Config, RenderRequest, WorkerPool};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = WorkerPool::launch(Config::default()).await?;
//!
//!     let result = pool.render(RenderRequest::new("https://example.com")).await?;
//!     println!("{} -> {} bytes", result.code, result.body.len());
//!
//!     pool.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## CLI Usage
//!
//! ### HTTP Service
//! ```bash
//! rendergun --pool-size 4 serve --port 3000
//! curl 'http://localhost:3000/render?url=https%3A%2F%2Fexample.com'
//! ```
//!
//! ### One-shot Render
//! ```bash
//! rendergun render --url https://example.com --wait-until networkidle0 --block-ads
//! ```

/// Configuration, render request/result types and Chrome launch settings
pub mod config;

/// Error types and error handling utilities
pub mod error;

/// Request blocking decisions and the ad-block host list
pub mod blocker;

/// Byte- and age-bounded LRU cache of render results
pub mod cache;

/// Renderer workers owning one Chrome process each
pub mod worker;

/// Per-page render steps
pub mod render_pipeline;

/// Round-robin dispatch over healthy workers
pub mod worker_pool;

/// HTTP surface
pub mod server;

/// Command-line interface implementation
pub mod cli;

/// Counters, gauges and render timings
pub mod metrics;

/// Pool health reporting and periodic statistics
pub mod health;

/// Utility functions and helpers
pub mod utils;


pub use blocker::*;
pub use cache::*;
pub use cli::*;
pub use config::*;
pub use error::*;
pub use health::*;
pub use utils::*;
pub use worker::*;
pub use worker_pool::*;
