//! Mapped Region Module
//!
//! RAII view over a mapped subresource. Dropping a mapped region unmaps it;
//! moving or taking it transfers that obligation so unmap happens once.

use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use tracing::warn;

use crate::backend::{Backend, RawMapping};
use crate::data_source::SubresourcePitches;

/// CPU-visible view of one mapped subresource.
///
/// Holds only a weak reference to the resource so a stale mapping does not
/// keep it alive.
pub struct MappedRegion<'a, B: Backend> {
    context: Option<&'a B>,
    resource: Weak<B::Resource>,
    subresource: u32,
    data: Option<NonNull<u8>>,
    len: usize,
    pitches: SubresourcePitches,
}

impl<'a, B: Backend> MappedRegion<'a, B> {
    /// The null region: nothing mapped, nothing to release.
    pub fn empty() -> Self {
        Self {
            context: None,
            resource: Weak::new(),
            subresource: 0,
            data: None,
            len: 0,
            pitches: SubresourcePitches::default(),
        }
    }

    pub(crate) fn new(
        context: &'a B,
        resource: &Arc<B::Resource>,
        subresource: u32,
        mapping: RawMapping,
    ) -> Self {
        Self {
            context: Some(context),
            resource: Arc::downgrade(resource),
            subresource,
            data: Some(mapping.ptr),
            len: mapping.len,
            pitches: mapping.pitches,
        }
    }

    /// Move the mapping out, leaving `self` empty.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }

    pub fn is_mapped(&self) -> bool {
        self.data.is_some()
    }

    pub fn subresource(&self) -> u32 {
        self.subresource
    }

    pub fn pitches(&self) -> SubresourcePitches {
        self.pitches
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn data(&self) -> &[u8] {
        match self.data {
            // SAFETY: the backend guarantees `len` bytes at `ptr` stay valid
            // until the matching unmap, which only happens in `drop`.
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len) },
            None => &[],
        }
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        match self.data {
            // SAFETY: as in `data`; `&mut self` makes this the only view.
            Some(ptr) => unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.len) },
            None => &mut [],
        }
    }
}

impl<B: Backend> Default for MappedRegion<'_, B> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<B: Backend> Drop for MappedRegion<'_, B> {
    fn drop(&mut self) {
        let (Some(context), Some(_)) = (self.context, self.data.take()) else {
            return;
        };
        match self.resource.upgrade() {
            Some(resource) => context.unmap(&resource, self.subresource),
            None => warn!(
                "Resource released while subresource {} was still mapped",
                self.subresource
            ),
        }
    }
}

impl<B: Backend> std::fmt::Debug for MappedRegion<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("subresource", &self.subresource)
            .field("mapped", &self.is_mapped())
            .field("len", &self.len)
            .field("pitches", &self.pitches)
            .finish()
    }
}
