//! Documentation-only module listing what each Cargo feature compiles in
//! (spec SPEC_FULL.md §6.6). There is nothing to import here; `cargo doc`
//! is the point.
//!
//! - `log` (default): structured logging via the `log` facade (§6.7). No
//!   backend is linked; consumers pick one.
//! - `embedded` (default): [`crate::channel::embedded::EmbeddedChannel`],
//!   an in-memory transport used by tests and by consumers who want to
//!   drive a pipeline without a real socket.
//! - `tcp-transport`: [`crate::channel::tcp::TcpChannel`], a minimal
//!   concrete transport built on the upstream `mio` crate. Implies
//!   `embedded`.
//! - `pool-stats`: the leak detector and pool instrumentation counters
//!   (§4.1). Off by default to keep the hot allocate/release path free of
//!   bookkeeping when unused.
