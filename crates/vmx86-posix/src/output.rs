use std::sync::{Mutex, PoisonError};

/// Collects what the guest writes to stdout and stderr.
#[derive(Debug, Default)]
pub struct CapturedOutput {
    stdout: Mutex<Vec<u8>>,
    stderr: Mutex<Vec<u8>>,
}

impl CapturedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn append(&self, fd: u64, bytes: &[u8]) {
        let stream = if fd == 2 { &self.stderr } else { &self.stdout };
        stream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.stdout
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.stderr
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
