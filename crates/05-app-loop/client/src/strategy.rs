//! Memory behind the two driver rings.
//!
//! The "to-driver" region carries admin commands from the client to the media
//! driver; the "to-client" region carries driver responses back. Both are
//! plain [`SharedRegion`]s laid out as `capacity + TRAILER_LENGTH` bytes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use transport::{RegionInit, SharedRegion, TRAILER_LENGTH};

use crate::config::DEFAULT_DRIVER_BUFFER_CAPACITY;
use crate::error::{ClientError, ClientResult};

/// File name of the client → driver region inside a mapped directory.
pub const TO_DRIVER_FILE: &str = "to-driver";
/// File name of the driver → client region inside a mapped directory.
pub const TO_CLIENT_FILE: &str = "to-client";

const REGION_ALIGNMENT: usize = 64;

/// Supplies the regions backing the driver rings.
///
/// The to-client region has one reader, so a strategy backs a single live
/// client. The to-driver region may be shared by any number of writers.
pub trait AdminBufferStrategy: Send + Sync {
    fn to_driver(&self) -> ClientResult<Arc<SharedRegion>>;
    fn to_client(&self) -> ClientResult<Arc<SharedRegion>>;
}

/// Process-local regions, for a driver running in the same process.
///
/// Every call returns the same two regions, so a client and an in-process
/// driver built from one strategy share the rings.
#[derive(Clone, Debug)]
pub struct HeapBufferStrategy {
    to_driver: Arc<SharedRegion>,
    to_client: Arc<SharedRegion>,
}

impl HeapBufferStrategy {
    pub fn new(capacity: usize) -> ClientResult<Self> {
        if !capacity.is_power_of_two() {
            return Err(ClientError::InvalidConfig(
                "driver buffer capacity must be a power of two",
            ));
        }
        let len = capacity + TRAILER_LENGTH;
        Ok(Self {
            to_driver: Arc::new(SharedRegion::new_aligned(
                len,
                REGION_ALIGNMENT,
                RegionInit::Zeroed,
            )?),
            to_client: Arc::new(SharedRegion::new_aligned(
                len,
                REGION_ALIGNMENT,
                RegionInit::Zeroed,
            )?),
        })
    }

    pub fn with_default_capacity() -> ClientResult<Self> {
        Self::new(DEFAULT_DRIVER_BUFFER_CAPACITY)
    }
}

impl AdminBufferStrategy for HeapBufferStrategy {
    fn to_driver(&self) -> ClientResult<Arc<SharedRegion>> {
        Ok(Arc::clone(&self.to_driver))
    }

    fn to_client(&self) -> ClientResult<Arc<SharedRegion>> {
        Ok(Arc::clone(&self.to_client))
    }
}

/// File-backed regions in a directory shared with an out-of-process driver.
///
/// Missing files are created zeroed at `capacity + TRAILER_LENGTH` bytes;
/// existing files are mapped as they are.
#[derive(Clone, Debug)]
pub struct MappedBufferStrategy {
    dir: PathBuf,
    capacity: usize,
}

impl MappedBufferStrategy {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> ClientResult<Self> {
        if !capacity.is_power_of_two() {
            return Err(ClientError::InvalidConfig(
                "driver buffer capacity must be a power of two",
            ));
        }
        Ok(Self {
            dir: dir.into(),
            capacity,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn map(&self, name: &str) -> ClientResult<Arc<SharedRegion>> {
        let path = self.dir.join(name);
        let region = if path.exists() {
            SharedRegion::map_existing(&path)?
        } else {
            std::fs::create_dir_all(&self.dir)
                .map_err(|err| ClientError::construction("creating buffer directory", err))?;
            tracing::debug!(path = %path.display(), "creating driver buffer file");
            SharedRegion::create_file(&path, self.capacity + TRAILER_LENGTH)?
        };
        Ok(Arc::new(region))
    }
}

impl AdminBufferStrategy for MappedBufferStrategy {
    fn to_driver(&self) -> ClientResult<Arc<SharedRegion>> {
        self.map(TO_DRIVER_FILE)
    }

    fn to_client(&self) -> ClientResult<Arc<SharedRegion>> {
        self.map(TO_CLIENT_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::{ManyToOneRingBuffer, RingWrite};

    #[test]
    fn heap_strategy_shares_regions() {
        let strategy = HeapBufferStrategy::new(1024).unwrap();
        let a = strategy.to_driver().unwrap();
        let b = strategy.to_driver().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.len(), 1024 + TRAILER_LENGTH);
        assert!(!Arc::ptr_eq(&a, &strategy.to_client().unwrap()));
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(matches!(
            HeapBufferStrategy::new(1000),
            Err(ClientError::InvalidConfig(_))
        ));
        assert!(MappedBufferStrategy::new("/tmp/unused", 3).is_err());
    }

    #[test]
    fn mapped_strategy_creates_then_reuses_files() {
        let dir = std::env::temp_dir().join(format!("client-mapped-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let strategy = MappedBufferStrategy::new(&dir, 1024).unwrap();

        let client_side = ManyToOneRingBuffer::new(strategy.to_driver().unwrap()).unwrap();
        assert!(dir.join(TO_DRIVER_FILE).exists());
        assert_eq!(client_side.try_write(1, b"hello").unwrap(), RingWrite::Written);

        let driver_side = ManyToOneRingBuffer::new(strategy.to_driver().unwrap()).unwrap();
        let frame = driver_side.try_read().expect("frame written through the other mapping");
        assert_eq!(frame.payload, b"hello");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
