//! Render targets and the platform they live on

use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::FilterError;
use crate::video::PixelFormat;

/// Layout of a render target's pixel buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetInfo {
    pub width: u32,
    pub height: u32,
    /// Row stride in bytes
    pub stride: u32,
    pub format: PixelFormat,
}

/// Locked pixel buffer of a render target. Unlocks when dropped
pub struct PixelGuard<'a> {
    inner: Box<dyn DerefMut<Target = [u8]> + 'a>,
}

impl<'a> PixelGuard<'a> {
    pub fn new<G>(guard: G) -> Self
    where
        G: DerefMut<Target = [u8]> + 'a,
    {
        Self {
            inner: Box::new(guard),
        }
    }
}

impl Deref for PixelGuard<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner
    }
}

impl DerefMut for PixelGuard<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.inner
    }
}

/// A native drawable a display filter renders into
pub trait RenderTarget: Send + Sync {
    fn info(&self) -> Result<TargetInfo, FilterError>;

    /// Lock the pixel buffer for writing
    fn lock_pixels(&self) -> Result<PixelGuard<'_>, FilterError>;
}

/// Platform services a rendering filter needs before it can touch a target
pub trait PlatformContext: Send + Sync {
    fn name(&self) -> &'static str;

    /// Make the platform usable from the calling thread
    fn attach_current_thread(&self) -> Result<(), FilterError>;
}

/// Platform with nothing to attach to
#[derive(Debug, Default)]
pub struct HeadlessPlatform;

impl PlatformContext for HeadlessPlatform {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn attach_current_thread(&self) -> Result<(), FilterError> {
        Ok(())
    }
}

/// RGB565 bitmap kept in memory
pub struct MemoryBitmap {
    width: u32,
    height: u32,
    stride: u32,
    pixels: Mutex<Vec<u8>>,
    fail_lock: AtomicBool,
    locks: AtomicU64,
}

impl MemoryBitmap {
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width * 2;
        Self {
            width,
            height,
            stride,
            pixels: Mutex::new(vec![0u8; stride as usize * height as usize]),
            fail_lock: AtomicBool::new(false),
            locks: AtomicU64::new(0),
        }
    }

    /// Make subsequent locks fail, as a busy native surface would
    pub fn set_lock_failure(&self, fail: bool) {
        self.fail_lock.store(fail, Ordering::Relaxed);
    }

    /// Number of successful locks
    pub fn lock_count(&self) -> u64 {
        self.locks.load(Ordering::Relaxed)
    }

    /// Read back one RGB565 pixel
    pub fn pixel(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = y as usize * self.stride as usize + x as usize * 2;
        let pixels = self.pixels.lock();
        Some(u16::from_le_bytes([pixels[offset], pixels[offset + 1]]))
    }

    pub fn snapshot(&self) -> Vec<u8> {
        self.pixels.lock().clone()
    }
}

impl RenderTarget for MemoryBitmap {
    fn info(&self) -> Result<TargetInfo, FilterError> {
        Ok(TargetInfo {
            width: self.width,
            height: self.height,
            stride: self.stride,
            format: PixelFormat::Rgb565,
        })
    }

    fn lock_pixels(&self) -> Result<PixelGuard<'_>, FilterError> {
        if self.fail_lock.load(Ordering::Relaxed) {
            return Err(FilterError::RenderTarget("bitmap is busy".into()));
        }
        self.locks.fetch_add(1, Ordering::Relaxed);
        let guard = parking_lot::MutexGuard::map(self.pixels.lock(), |v| v.as_mut_slice());
        Ok(PixelGuard::new(guard))
    }
}

impl fmt::Debug for MemoryBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryBitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}
