//! Pushing file snapshots into the sandbox.

use crate::error::{Error, Result};
use crate::files::FileSet;
use crate::sandbox::Sandbox;

/// Acknowledgement of an applied snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReceipt {
    /// Number of files written.
    pub file_count: usize,
    /// Fingerprint of the applied snapshot.
    pub fingerprint: String,
}

/// Writes snapshots into the sandbox and remembers the last one applied.
#[derive(Debug, Clone, Default)]
pub struct FileSynchronizer {
    mounted: bool,
    last_fingerprint: Option<String>,
}

impl FileSynchronizer {
    /// Creates a synchronizer for an unmounted sandbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true once the initial mount succeeded.
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Returns true if `files` matches the last applied snapshot.
    pub fn is_current(&self, files: &FileSet) -> bool {
        self.last_fingerprint.as_deref() == Some(files.fingerprint().as_str())
    }

    /// Writes the first snapshot. Any rejected write fails the whole mount.
    pub async fn mount<S>(&mut self, sandbox: &S, files: &FileSet) -> Result<SyncReceipt>
    where
        S: Sandbox + ?Sized,
    {
        sandbox
            .mount(files)
            .await
            .map_err(|e| Error::Mount(e.to_string()))?;

        self.mounted = true;
        Ok(self.record(files))
    }

    /// Writes a new full snapshot over the mounted files.
    ///
    /// Applying the same snapshot twice leaves the same files behind.
    pub async fn sync<S>(&mut self, sandbox: &S, files: &FileSet) -> Result<SyncReceipt>
    where
        S: Sandbox + ?Sized,
    {
        if !self.mounted {
            return Err(Error::NotReady);
        }

        sandbox
            .sync(files)
            .await
            .map_err(|e| Error::Sync(e.to_string()))?;

        Ok(self.record(files))
    }

    fn record(&mut self, files: &FileSet) -> SyncReceipt {
        let fingerprint = files.fingerprint();
        self.last_fingerprint = Some(fingerprint.clone());
        SyncReceipt {
            file_count: files.len(),
            fingerprint,
        }
    }
}
