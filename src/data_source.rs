//! Data Source Module
//!
//! Providers of per-subresource bytes for an upload. A source is borrowed by
//! the upload context for the duration of a single push.

use std::sync::{Arc, OnceLock};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::desc::{SubresourceId, TextureShape};

/// Row and slice pitch of one subresource, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubresourcePitches {
    pub row_pitch: u32,
    pub slice_pitch: u32,
}

impl SubresourcePitches {
    pub const fn new(row_pitch: u32, slice_pitch: u32) -> Self {
        Self {
            row_pitch,
            slice_pitch,
        }
    }

    /// Tightly packed pitches for mip level `mip` of `shape`.
    pub fn tight(shape: &TextureShape, mip: u32) -> Self {
        let level = shape.mip_level_shape(mip);
        let row_pitch = shape.pixel_format.row_bytes(level.width);
        let rows = shape.pixel_format.row_count(level.height);
        Self::new(row_pitch, row_pitch * rows)
    }

    /// Pitches of a linear buffer, where a single row spans the whole range.
    pub const fn linear(size: u32) -> Self {
        Self::new(size, size)
    }
}

/// Bytes and layout of one subresource. Empty `data` means "skip".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubresourceData<'a> {
    pub data: &'a [u8],
    pub pitches: SubresourcePitches,
}

impl SubresourceData<'_> {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Per-subresource content provider.
pub trait DataSource {
    /// Bytes for `sub`. An empty slice means the subresource is skipped.
    fn get_data(&self, sub: SubresourceId) -> &[u8];

    fn get_pitches(&self, sub: SubresourceId) -> SubresourcePitches;

    fn get_data_size(&self, sub: SubresourceId) -> usize {
        self.get_data(sub).len()
    }

    /// Whether the content may be read now. Deferred sources report `false`
    /// until their completion marker is signaled.
    fn is_ready(&self) -> bool {
        true
    }

    fn subresource(&self, sub: SubresourceId) -> SubresourceData<'_> {
        SubresourceData {
            data: self.get_data(sub),
            pitches: self.get_pitches(sub),
        }
    }
}

/// Content that is already resident in memory.
#[derive(Debug, Clone, Default)]
pub struct ImmediateData {
    mip_count: u32,
    subresources: Vec<(Vec<u8>, SubresourcePitches)>,
}

impl ImmediateData {
    /// An empty source laid out for a grid with `mip_count` mip levels.
    pub fn new(mip_count: u32) -> Self {
        Self {
            mip_count: mip_count.max(1),
            subresources: Vec::new(),
        }
    }

    /// A single-subresource source, typically a linear buffer.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let pitches = SubresourcePitches::linear(bytes.len() as u32);
        Self::new(1).with_subresource(SubresourceId::default(), bytes, pitches)
    }

    /// Fill every subresource of `shape` using `fill`, with tight pitches.
    /// Returning `None` leaves the subresource empty.
    pub fn for_texture<F>(shape: &TextureShape, mut fill: F) -> Self
    where
        F: FnMut(SubresourceId, SubresourcePitches) -> Option<Vec<u8>>,
    {
        let mut result = Self::new(shape.mip_levels());
        for layer in 0..shape.array_layers() {
            for mip in 0..shape.mip_levels() {
                let sub = SubresourceId::new(mip, layer);
                let pitches = SubresourcePitches::tight(shape, mip);
                if let Some(bytes) = fill(sub, pitches) {
                    result = result.with_subresource(sub, bytes, pitches);
                }
            }
        }
        result
    }

    pub fn with_subresource(
        mut self,
        sub: SubresourceId,
        bytes: Vec<u8>,
        pitches: SubresourcePitches,
    ) -> Self {
        let index = sub.index(self.mip_count) as usize;
        if self.subresources.len() <= index {
            self.subresources
                .resize_with(index + 1, || (Vec::new(), SubresourcePitches::default()));
        }
        self.subresources[index] = (bytes, pitches);
        self
    }

    fn entry(&self, sub: SubresourceId) -> Option<&(Vec<u8>, SubresourcePitches)> {
        if sub.mip >= self.mip_count {
            return None;
        }
        self.subresources.get(sub.index(self.mip_count) as usize)
    }
}

impl DataSource for ImmediateData {
    fn get_data(&self, sub: SubresourceId) -> &[u8] {
        self.entry(sub)
            .map(|(bytes, _)| bytes.as_slice())
            .unwrap_or(&[])
    }

    fn get_pitches(&self, sub: SubresourceId) -> SubresourcePitches {
        self.entry(sub).map(|(_, p)| *p).unwrap_or_default()
    }
}

/// Progress of a background load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Pending,
    Ready,
    Failed,
}

/// Signaled once a deferred source has finished loading.
#[derive(Debug, Clone)]
pub struct CompletionMarker {
    rx: watch::Receiver<LoadState>,
}

impl CompletionMarker {
    pub fn state(&self) -> LoadState {
        *self.rx.borrow()
    }

    pub fn is_signaled(&self) -> bool {
        self.state() != LoadState::Pending
    }

    /// Wait until the load has either completed or failed.
    pub async fn wait(&self) -> LoadState {
        let mut rx = self.rx.clone();
        let state = match rx.wait_for(|state| *state != LoadState::Pending).await {
            Ok(state) => *state,
            // Loader task went away without reporting
            Err(_) => LoadState::Failed,
        };
        state
    }
}

/// Content produced by a loader running on the tokio blocking pool.
///
/// Reads return nothing until the completion marker is signaled.
#[derive(Debug, Clone)]
pub struct DeferredData {
    content: Arc<OnceLock<ImmediateData>>,
    marker: CompletionMarker,
}

impl DeferredData {
    /// Start `loader` on the blocking pool. Must be called from within a
    /// tokio runtime.
    pub fn spawn<F>(name: impl Into<String>, loader: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<ImmediateData> + Send + 'static,
    {
        let name = name.into();
        let (tx, rx) = watch::channel(LoadState::Pending);
        let content = Arc::new(OnceLock::new());
        let target = content.clone();

        tokio::task::spawn_blocking(move || match loader() {
            Ok(data) => {
                let _ = target.set(data);
                debug!("Deferred source '{}' loaded", name);
                let _ = tx.send(LoadState::Ready);
            }
            Err(e) => {
                warn!("Deferred source '{}' failed to load: {:#}", name, e);
                let _ = tx.send(LoadState::Failed);
            }
        });

        Self {
            content,
            marker: CompletionMarker { rx },
        }
    }

    pub fn marker(&self) -> &CompletionMarker {
        &self.marker
    }

    fn loaded(&self) -> Option<&ImmediateData> {
        if self.marker.state() == LoadState::Ready {
            self.content.get()
        } else {
            None
        }
    }
}

impl DataSource for DeferredData {
    fn get_data(&self, sub: SubresourceId) -> &[u8] {
        self.loaded()
            .map(|data| data.get_data(sub))
            .unwrap_or(&[])
    }

    fn get_pitches(&self, sub: SubresourceId) -> SubresourcePitches {
        self.loaded()
            .map(|data| data.get_pitches(sub))
            .unwrap_or_default()
    }

    fn is_ready(&self) -> bool {
        self.loaded().is_some()
    }
}
