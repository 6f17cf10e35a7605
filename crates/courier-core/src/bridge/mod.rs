//! Bridge from synchronous callers into the async pipeline.

mod pool;
mod runner;

pub use pool::EventLoopPool;
pub use runner::SyncRunner;
