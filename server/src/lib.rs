//! # Record Service Backend
//!
//! This library implements the concurrent backend of a multi-client record
//! service. Incoming TCP connections are dispatched to a fixed pool of
//! worker threads, logged-in clients are tracked in a shared session
//! registry, and a permissioned key/value object store is held in memory
//! and persisted to a flat binary file.
//!
//! ## Architecture
//!
//! Three shared-state subsystems carry the service, each behind exactly one
//! lock:
//!
//! - **Object store** ([`store`]): a fixed-size hash table with external
//!   chaining holding owner-tagged records. The whole table sits behind a
//!   single read-write lock so every operation, including reads and
//!   persistence snapshots, goes through one guarded path.
//! - **Session registry** ([`sessions`]): the roster of known accounts and
//!   live sessions, fully serialized behind a single mutex. Lookups
//!   traverse in insertion order with first-match-wins semantics.
//! - **Dispatch pool** ([`dispatch`]): a fixed set of OS worker threads
//!   over a FIFO connection queue, coordinated by a mutex and a pair of
//!   condition variables ("queue became non-empty" wakes a worker, "queue
//!   became empty" unblocks shutdown).
//!
//! Control flow: listener → pool queue → worker thread → session lookup in
//! the registry → record operations on the store → optional persistence
//! ([`persist`]) to disk.
//!
//! ## Shutdown
//!
//! Cancellation is cooperative. A [`dispatch::ShutdownToken`] is shared by
//! the accept loop and every worker; once it trips, new submissions are
//! refused, queued connections are closed unserved, in-flight handlers run
//! to completion, and the workers are joined. Nothing is cancelled
//! mid-job.
//!
//! ## Persistence format
//!
//! Records serialize to a sequence of frames with no header or footer:
//! three little-endian `u16` lengths (key, value, owner), one permission
//! byte, the three variable-length fields, and a `0x1E` separator. The
//! frame codec lives in `shared` next to the request/response packets.

pub mod dispatch;
pub mod handler;
pub mod persist;
pub mod sessions;
pub mod store;
