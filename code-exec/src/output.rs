//! Shared output buffer fed by the stdout and stderr readers.

use std::sync::{Arc, Mutex, MutexGuard};

/// Append-only sequence of output chunks.
///
/// Cloning yields another handle to the same buffer. Chunks from the two
/// streams are kept in arrival order, which need not match the order the
/// program wrote them in.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    chunks: Arc<Mutex<Vec<String>>>,
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<String>> {
        // Appends are single pushes, so a poisoned buffer holds no torn chunk.
        self.chunks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append one chunk, terminated with a line break.
    pub fn append(&self, chunk: &str) {
        let mut line = String::with_capacity(chunk.len() + 1);
        line.push_str(chunk);
        line.push('\n');
        self.lock().push(line);
    }

    pub fn chunks(&self) -> Vec<String> {
        self.lock().clone()
    }

    /// Concatenated contents at this moment.
    pub fn contents(&self) -> String {
        self.lock().concat()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
