//! Readback Module
//!
//! CPU view over the mapped subresources of a resource copied back from the
//! GPU. Offsets from a shared allocation are applied uniformly.

use std::sync::Arc;

use crate::backend::Backend;
use crate::data_source::{DataSource, SubresourcePitches};
use crate::desc::SubresourceId;
use crate::mapped::MappedRegion;

/// Mapped contents of a resource, usable as a [`DataSource`].
///
/// Keeps the mapped resource alive until every region has been unmapped.
pub struct ReadbackData<'a, B: Backend> {
    // Dropped first so the unmaps see a live resource
    regions: Vec<MappedRegion<'a, B>>,
    mip_count: u32,
    offset: usize,
    _resource: Arc<B::Resource>,
}

impl<'a, B: Backend> ReadbackData<'a, B> {
    pub(crate) fn new(
        resource: Arc<B::Resource>,
        regions: Vec<MappedRegion<'a, B>>,
        mip_count: u32,
        offset: usize,
    ) -> Self {
        Self {
            regions,
            mip_count: mip_count.max(1),
            offset,
            _resource: resource,
        }
    }

    pub fn subresource_count(&self) -> usize {
        self.regions.len()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn region(&self, sub: SubresourceId) -> Option<&MappedRegion<'a, B>> {
        if sub.mip >= self.mip_count {
            return None;
        }
        self.regions.get(sub.index(self.mip_count) as usize)
    }
}

impl<B: Backend> DataSource for ReadbackData<'_, B> {
    fn get_data(&self, sub: SubresourceId) -> &[u8] {
        self.region(sub)
            .and_then(|region| region.data().get(self.offset..))
            .unwrap_or(&[])
    }

    fn get_pitches(&self, sub: SubresourceId) -> SubresourcePitches {
        self.region(sub)
            .map(MappedRegion::pitches)
            .unwrap_or_default()
    }

    /// Slice pitch of the mapped subresource less the locator offset.
    fn get_data_size(&self, sub: SubresourceId) -> usize {
        self.region(sub).map_or(0, |region| {
            (region.pitches().slice_pitch as usize).saturating_sub(self.offset)
        })
    }
}
