//! # Page Cache
//!
//! Fixed-size page read-through cache over an arbitrary page source.
//!
//! ## Cache Semantics
//!
//! - Pages are [`PAGE_SIZE`] bytes keyed by their aligned base address
//! - A fetch that returns fewer bytes is stored as a short page (image tail)
//! - A fetch that returns nothing is stored as an empty page, so a failing
//!   page is fetched once per epoch
//! - Once the cached byte total reaches the size limit the whole cache is
//!   cleared before the next insert; there is no per-page eviction
//! - [`PageCache::clear`] is wired to the owning target's flush signal

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, trace};

use crate::types::Address;

/// Size of one cached page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Cached byte total at which the cache is cleared wholesale (64 MiB).
pub const DEFAULT_CACHE_SIZE_LIMIT: usize = 64 * 1024 * 1024;

/// Produces the bytes of one page on a cache miss
///
/// `fetch_page` is called with a page-aligned base and [`PAGE_SIZE`]. It
/// returns `None` (or an empty vector) when nothing can be produced, and may
/// return fewer bytes than requested for a partial page. A result longer than
/// `size` is a source bug; it is served once but never cached.
pub trait PageSource: Send + Sync
{
    /// Fetch up to `size` bytes starting at the aligned `base`.
    fn fetch_page(&self, base: Address, size: usize) -> Option<Vec<u8>>;
}

impl<F> PageSource for F
where
    F: Fn(Address, usize) -> Option<Vec<u8>> + Send + Sync,
{
    fn fetch_page(&self, base: Address, size: usize) -> Option<Vec<u8>>
    {
        self(base, size)
    }
}

#[derive(Default)]
struct CacheState
{
    pages: HashMap<u64, Arc<[u8]>>,
    cached_bytes: usize,
}

/// Read-through cache of [`PAGE_SIZE`] pages
///
/// ## Example
///
/// ```rust
/// use imgmap_core::memory::PageCache;
/// use imgmap_core::types::Address;
///
/// let cache = PageCache::new(|_base: Address, size: usize| Some(vec![0x90; size]));
/// let mut buffer = [0u8; 16];
/// assert_eq!(cache.read(Address::from(0x1ff8), &mut buffer), 16);
/// assert_eq!(cache.page_count(), 2);
/// ```
pub struct PageCache<S>
{
    source: S,
    size_limit: usize,
    state: RwLock<CacheState>,
}

impl<S: PageSource> PageCache<S>
{
    /// Create a cache with the default 64 MiB limit.
    pub fn new(source: S) -> Self
    {
        Self::with_size_limit(source, DEFAULT_CACHE_SIZE_LIMIT)
    }

    /// Create a cache that is cleared once `size_limit` bytes are cached.
    pub fn with_size_limit(source: S, size_limit: usize) -> Self
    {
        Self {
            source,
            size_limit,
            state: RwLock::new(CacheState::default()),
        }
    }

    /// The page source this cache wraps.
    pub fn source(&self) -> &S
    {
        &self.source
    }

    /// Read `buffer.len()` bytes at `address`, page by page.
    ///
    /// Stops at the first page that yields no bytes at the needed offset and
    /// returns the number of bytes copied so far.
    pub fn read(&self, address: Address, buffer: &mut [u8]) -> usize
    {
        let mut copied = 0usize;
        while copied < buffer.len() {
            let Some(current) = address.checked_add(copied as u64) else {
                break;
            };
            let page_base = current.align_down(PAGE_SIZE as u64);
            // always < PAGE_SIZE
            let offset = current.offset_in(PAGE_SIZE as u64) as usize;

            let page = self.page(page_base);
            if page.len() <= offset {
                break;
            }
            let chunk = (page.len() - offset).min(buffer.len() - copied);
            buffer[copied..copied + chunk].copy_from_slice(&page[offset..offset + chunk]);
            copied += chunk;

            // a short page ends the readable run even if more was requested
            if offset + chunk < PAGE_SIZE && copied < buffer.len() {
                break;
            }
        }
        copied
    }

    /// Drop every cached page and reset the byte counter.
    pub fn clear(&self)
    {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if !state.pages.is_empty() {
            debug!(pages = state.pages.len(), bytes = state.cached_bytes, "clearing page cache");
        }
        state.pages.clear();
        state.cached_bytes = 0;
    }

    /// Total bytes held by cached pages.
    pub fn cached_bytes(&self) -> usize
    {
        self.state.read().unwrap_or_else(PoisonError::into_inner).cached_bytes
    }

    /// Number of cached pages, including cached failures.
    pub fn page_count(&self) -> usize
    {
        self.state.read().unwrap_or_else(PoisonError::into_inner).pages.len()
    }

    fn page(&self, base: Address) -> Arc<[u8]>
    {
        if let Some(existing) = self
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .pages
            .get(&base.value())
        {
            return existing.clone();
        }

        // The source may read memory itself, so no lock is held here.
        let fetched: Arc<[u8]> = self.source.fetch_page(base, PAGE_SIZE).unwrap_or_default().into();
        if fetched.len() > PAGE_SIZE {
            debug!(address = %base, size = fetched.len(), "page source returned more than a page; not caching");
            return fetched;
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        // a failure recorded while this fetch was running (a nested read of
        // the same page) must not hide the bytes it produced
        if let Some(existing) = state.pages.get(&base.value()) {
            if !existing.is_empty() || fetched.is_empty() {
                return existing.clone();
            }
        }
        if state.cached_bytes >= self.size_limit {
            debug!(
                pages = state.pages.len(),
                bytes = state.cached_bytes,
                limit = self.size_limit,
                "page cache limit reached; clearing"
            );
            state.pages.clear();
            state.cached_bytes = 0;
        }
        trace!(address = %base, size = fetched.len(), "caching page");
        state.cached_bytes += fetched.len();
        state.pages.insert(base.value(), fetched.clone());
        fetched
    }
}

impl<S> fmt::Debug for PageCache<S>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("PageCache")
            .field("pages", &state.pages.len())
            .field("cached_bytes", &state.cached_bytes)
            .field("size_limit", &self.size_limit)
            .finish_non_exhaustive()
    }
}
