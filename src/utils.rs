use std::hash::BuildHasherDefault;
use std::path::Path;
use std::time::Instant;

use hashers::fx_hash::FxHasher;

pub use anyhow::{anyhow, bail, ensure, Context, Result};

pub type EmptyRes = Result<()>;

/// Default hasher for the hot lookup maps.
pub type Hasher = BuildHasherDefault<FxHasher>;

#[macro_export]
macro_rules! err {
    ($($arg:tt)*) => {{ Err(anyhow::anyhow!($($arg)*)) }};
}

#[macro_export]
macro_rules! require {
    ($cond:expr) => { if !($cond) { anyhow::bail!("Requirement failed!") } };
    ($cond:expr, $($arg:tt)*) => { if !($cond) { anyhow::bail!($($arg)*) } };
}

/// Runs a block, handing its result and elapsed milliseconds to the logging callback.
pub fn measure<T, B, L>(block: B, log_result: L) -> T
    where B: FnOnce() -> T,
          L: FnOnce(&T, u128)
{
    let start_time = Instant::now();
    let result = block();
    log_result(&result, start_time.elapsed().as_millis());
    result
}

pub fn path_to_str(path: &Path) -> Result<&str> {
    path.to_str().with_context(|| format!("Path is not a valid string: {}", path.to_string_lossy()))
}

pub trait NormalizeError<T> {
    fn normalize_error(self) -> Result<T>;
}

impl<T> NormalizeError<T> for std::result::Result<T, Box<dyn std::error::Error + Send + Sync>> {
    fn normalize_error(self) -> Result<T> {
        self.map_err(|e| anyhow!("{}", e))
    }
}
