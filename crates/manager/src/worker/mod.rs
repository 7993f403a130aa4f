pub mod converter;
pub mod filter;
pub mod ring;
pub mod subprocess;
pub mod wire;

pub use converter::ConverterWorkerPool;
pub use filter::{FilterHandle, FilterWorker, StreamFetcher};
pub use subprocess::{RestartBackoff, Subprocess, SubprocessError};
