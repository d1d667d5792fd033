//! Mapping of operation results onto the caller's `stat` / `errmsg` slots.

use tracing::debug;

use crate::config::RuntimeConfig;
use crate::diagnostics;
use crate::runtime::error::{CafError, CafResult};

/// Value stored in `stat` for every failure.
pub const STAT_FAILED: i32 = 1;

/// Caller-provided status slots. Without one, failures are fatal.
pub struct Status<'a> {
    stat: &'a mut i32,
    errmsg: Option<&'a mut [u8]>,
}

impl<'a> Status<'a> {
    pub fn new(stat: &'a mut i32) -> Self {
        Self { stat, errmsg: None }
    }

    pub fn with_errmsg(mut self, errmsg: &'a mut [u8]) -> Self {
        self.errmsg = Some(errmsg);
        self
    }

    fn succeed(&mut self) {
        *self.stat = 0;
    }

    fn fail(&mut self, error: &CafError) {
        *self.stat = STAT_FAILED;
        if let Some(buffer) = self.errmsg.as_deref_mut() {
            fill_errmsg(buffer, &error.to_string());
        }
    }
}

/// Copies `message` into `buffer`, truncating or blank-padding to its length.
pub fn fill_errmsg(buffer: &mut [u8], message: &str) {
    let bytes = message.as_bytes();
    let n = bytes.len().min(buffer.len());
    buffer[..n].copy_from_slice(&bytes[..n]);
    buffer[n..].fill(b' ');
}

/// Reports `result` through `status`. On failure without a status the error
/// is fatal and the process exits with the configured code.
pub fn settle<T>(
    result: CafResult<T>,
    status: Option<&mut Status<'_>>,
    config: &RuntimeConfig,
) -> Option<T> {
    match (result, status) {
        (Ok(value), Some(status)) => {
            status.succeed();
            Some(value)
        }
        (Ok(value), None) => Some(value),
        (Err(error), Some(status)) => {
            debug!(%error, "reporting failure through stat");
            status.fail(&error);
            None
        }
        (Err(error), None) => diagnostics::fatal(&error, config),
    }
}
