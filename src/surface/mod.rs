//! Surface & buffer pipeline
//!
//! Guest `wl_surface` requests are intercepted here before they reach the
//! host. When the guest attaches shm content and a copying driver is active,
//! the content is copied into an output buffer the host can import, and only
//! the damaged parts are copied on each commit.
//!
//! Output buffers cycle through three places:
//!
//! - `current`: picked by the last attach, written on commit;
//! - `busy`: committed and held by the host;
//! - `released`: returned by the host, candidates for reuse.
//!
//! [`SurfaceState`] is generic over the host buffer handle `B` and the guest
//! buffer handle `G`, so the pipeline runs the same against the real protocol
//! objects and against plain values in tests.

pub mod copy;
pub mod damage;
pub mod driver;
pub mod format;
pub mod viewport;

pub use damage::{BufferDamage, DamageRect};
pub use driver::{Allocation, BackingDriver, BufferSpec, HostImport, ShmDriverKind};
pub use format::ShmFormat;
pub use viewport::{HostViewport, Viewport};

use crate::error::BridgeResult;
use crate::mmap::MappedBuffer;
use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::Arc;

/// Identifies an output buffer within its surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u64);

pub struct OutputBuffer<B> {
    pub id: BufferId,
    pub host: B,
    pub width: u32,
    pub height: u32,
    pub format: ShmFormat,
    pub map: Arc<MappedBuffer>,
    pub damage: BufferDamage,
}

impl<B> OutputBuffer<B> {
    fn matches(&self, width: u32, height: u32, format: ShmFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }
}

/// A guest buffer being attached.
pub struct AttachedBuffer<G> {
    pub guest: G,
    pub width: u32,
    pub height: u32,
    /// Shm content and its format. `None` for buffers passed through as is.
    pub shm: Option<(ShmFormat, Arc<MappedBuffer>)>,
}

/// What the host surface should be attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget<B> {
    /// Our output buffer.
    Output(B),
    /// The guest buffer's own proxy.
    PassThrough,
    /// Nothing (`attach(NULL)`).
    Detach,
}

/// Result of [`SurfaceState::attach`].
#[derive(Debug)]
pub struct AttachOutcome<B> {
    pub target: AttachTarget<B>,
    /// Attach offsets in host coordinates.
    pub offset: (i32, i32),
    /// Host buffers evicted for an incompatible size; destroy them.
    pub evicted: Vec<B>,
    pub allocated: bool,
}

/// How the host should size the committed content.
#[derive(Debug, Clone, PartialEq)]
pub enum Presentation {
    Viewport(HostViewport),
    BufferScale(i32),
    Unchanged,
}

/// Result of [`SurfaceState::commit`].
#[derive(Debug)]
pub struct CommitOutcome<G> {
    pub copied_bytes: Option<usize>,
    pub presentation: Presentation,
    /// Guest buffer to send `wl_buffer.release` for.
    pub release: Option<G>,
    pub has_contents: bool,
}

pub struct SurfaceState<B, G> {
    pub contents_width: i32,
    pub contents_height: i32,
    pub contents_scale: i32,
    /// Guest `wp_viewport`, when one was created for this surface.
    pub viewport: Option<Viewport>,
    pub has_role: bool,
    pub has_output: bool,
    pub last_event_serial: u32,
    contents: Option<(G, Arc<MappedBuffer>)>,
    current: Option<OutputBuffer<B>>,
    busy: VecDeque<OutputBuffer<B>>,
    released: VecDeque<OutputBuffer<B>>,
    next_buffer: u64,
}

impl<B, G> Default for SurfaceState<B, G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B, G> SurfaceState<B, G> {
    pub fn new() -> Self {
        Self {
            contents_width: 0,
            contents_height: 0,
            contents_scale: 1,
            viewport: None,
            has_role: false,
            has_output: false,
            last_event_serial: 0,
            contents: None,
            current: None,
            busy: VecDeque::new(),
            released: VecDeque::new(),
            next_buffer: 1,
        }
    }

    pub fn has_contents(&self) -> bool {
        self.contents_width != 0 && self.contents_height != 0
    }

    pub fn current(&self) -> Option<&OutputBuffer<B>> {
        self.current.as_ref()
    }

    pub fn busy(&self) -> impl Iterator<Item = &OutputBuffer<B>> {
        self.busy.iter()
    }

    pub fn released(&self) -> impl Iterator<Item = &OutputBuffer<B>> {
        self.released.iter()
    }

    pub fn buffer_count(&self) -> usize {
        self.busy.len() + self.released.len() + usize::from(self.current.is_some())
    }

    /// Handle `wl_surface.attach`.
    ///
    /// Walks the released pool from the front: the first buffer matching
    /// `(width, height, format)` becomes current, every non-matching buffer
    /// seen before it is evicted. When nothing matches, `allocate` is called
    /// once and its buffer starts fully damaged.
    pub fn attach<F>(
        &mut self,
        buffer: Option<AttachedBuffer<G>>,
        x: i32,
        y: i32,
        scale: f64,
        allocate: F,
    ) -> BridgeResult<AttachOutcome<B>>
    where
        B: Clone,
        F: FnOnce(BufferId, BufferSpec<'_>) -> BridgeResult<(B, Allocation)>,
    {
        // An uncommitted current buffer goes back where the walk found it.
        if let Some(previous) = self.current.take() {
            self.released.push_front(previous);
        }
        self.contents = None;

        let mut evicted = Vec::new();
        let mut allocated = false;
        let offset = ((x as f64 / scale) as i32, (y as f64 / scale) as i32);

        let Some(buffer) = buffer else {
            return Ok(AttachOutcome {
                target: AttachTarget::Detach,
                offset,
                evicted,
                allocated,
            });
        };

        self.contents_width = buffer.width as i32;
        self.contents_height = buffer.height as i32;

        let Some((format, map)) = buffer.shm else {
            return Ok(AttachOutcome {
                target: AttachTarget::PassThrough,
                offset,
                evicted,
                allocated,
            });
        };

        while let Some(candidate) = self.released.pop_front() {
            if candidate.matches(buffer.width, buffer.height, format) {
                trace!("♻️ Reusing output buffer {:?}", candidate.id);
                self.current = Some(candidate);
                break;
            }
            debug!(
                "🗑️ Evicting {}x{} output buffer {:?}",
                candidate.width, candidate.height, candidate.id
            );
            evicted.push(candidate.host);
        }

        if self.current.is_none() {
            let id = BufferId(self.next_buffer);
            self.next_buffer += 1;
            let (host, allocation) = allocate(
                id,
                BufferSpec {
                    width: buffer.width,
                    height: buffer.height,
                    format,
                    guest: map.layout(),
                },
            )?;
            self.current = Some(OutputBuffer {
                id,
                host,
                width: buffer.width,
                height: buffer.height,
                format,
                map: allocation.map,
                damage: BufferDamage::full(),
            });
            allocated = true;
        }

        self.contents = Some((buffer.guest, map));
        let target = match &self.current {
            Some(current) => AttachTarget::Output(current.host.clone()),
            None => AttachTarget::PassThrough,
        };
        Ok(AttachOutcome {
            target,
            offset,
            evicted,
            allocated,
        })
    }

    /// Handle `wl_surface.damage`: accumulate into the current buffer and
    /// every busy and released one, and return the rectangle to forward to
    /// the host.
    pub fn damage(&mut self, x: i32, y: i32, width: i32, height: i32, scale: f64) -> DamageRect {
        let rect = DamageRect::from_xywh(x, y, width, height);
        let pool = self.busy.iter_mut().chain(self.released.iter_mut());
        for buffer in self.current.iter_mut().chain(pool) {
            buffer.damage.add(rect);
        }
        damage::host_damage(rect, scale, self.damage_bounds())
    }

    /// Surface size in surface coordinates, when the buffer alone decides it.
    fn damage_bounds(&self) -> Option<(i64, i64)> {
        if !self.has_contents() || self.viewport.is_some() {
            return None;
        }
        let scale = self.contents_scale.max(1) as i64;
        Some((
            self.contents_width as i64 / scale,
            self.contents_height as i64 / scale,
        ))
    }

    /// Handle `wl_surface.commit` up to the host commit itself.
    ///
    /// `scale` is the proxy scale; `host_viewport` says whether the host
    /// surface has a `wp_viewport`.
    pub fn commit(&mut self, scale: f64, host_viewport: bool) -> CommitOutcome<G> {
        let mut copied_bytes = None;

        let current = if self.contents.is_some() { self.current.take() } else { None };
        if let (Some((_, src)), Some(mut current)) = (self.contents.as_ref(), current) {
            let contents = (self.contents_width, self.contents_height);
            let transform =
                viewport::content_transform(self.viewport.as_ref(), contents, self.contents_scale as f64);
            copied_bytes = Some(copy::copy_damage(
                src,
                &current.map,
                current.damage.rects(),
                &transform,
                contents,
            ));
            current.damage.clear();
            self.busy.push_front(current);
        }

        let presentation = if self.has_contents() {
            let scale = scale * self.contents_scale as f64;
            if host_viewport {
                Presentation::Viewport(viewport::host_viewport(
                    self.viewport.as_ref(),
                    (self.contents_width, self.contents_height),
                    scale,
                ))
            } else {
                Presentation::BufferScale(scale as i32)
            }
        } else {
            Presentation::Unchanged
        };

        CommitOutcome {
            copied_bytes,
            presentation,
            release: self.contents.take().map(|(guest, _)| guest),
            has_contents: self.has_contents(),
        }
    }

    /// The host returned output buffer `id`. Returns false for unknown ids.
    pub fn buffer_released(&mut self, id: BufferId) -> bool {
        match self.busy.iter().position(|b| b.id == id) {
            Some(index) => {
                if let Some(buffer) = self.busy.remove(index) {
                    self.released.push_front(buffer);
                }
                true
            }
            None => false,
        }
    }

    /// Take every host buffer for destruction along with the surface.
    pub fn take_all_buffers(&mut self) -> Vec<B> {
        self.contents = None;
        self.current
            .take()
            .into_iter()
            .chain(self.released.drain(..))
            .chain(self.busy.drain(..))
            .map(|b| b.host)
            .collect()
    }
}

#[cfg(test)]
mod tests;
