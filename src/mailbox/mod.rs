//! Encrypted mailbox: shard layout/publish planning (`index`), the
//! debounced flush worker pool (`flush`), and liveness repair (`repair`),
//! per spec.md §4.6/§4.7.

pub mod flush;
pub mod index;
pub mod repair;
