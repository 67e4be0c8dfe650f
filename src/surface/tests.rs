use super::*;
use crate::error::BridgeError;
use crate::mmap::{MapLayout, WriteSync};
use std::io::Write;

fn shm_map(width: u32, height: u32, fill: u8) -> Arc<MappedBuffer> {
    let stride = width as usize * 4;
    let size = stride * height as usize;
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&vec![fill; size]).unwrap();
    MappedBuffer::map(
        file.into(),
        MapLayout::single_plane(size, 4, 0, stride),
        WriteSync::None,
    )
    .unwrap()
}

fn attached(guest: u32, width: u32, height: u32) -> AttachedBuffer<u32> {
    AttachedBuffer {
        guest,
        width,
        height,
        shm: Some((ShmFormat::Argb8888, shm_map(width, height, guest as u8))),
    }
}

/// Allocator that hands out zero-filled mappings, host handle = buffer id.
fn alloc(id: BufferId, spec: BufferSpec<'_>) -> BridgeResult<(u64, Allocation)> {
    let map = shm_map(spec.width, spec.height, 0);
    Ok((
        id.0,
        Allocation {
            map,
            import: HostImport::Shm {
                size: 0,
                width: spec.width as i32,
                height: spec.height as i32,
                stride: spec.width as i32 * 4,
                format: spec.format,
            },
        },
    ))
}

fn no_alloc(_: BufferId, _: BufferSpec<'_>) -> BridgeResult<(u64, Allocation)> {
    panic!("allocation not expected")
}

#[test]
fn test_first_attach_allocates_fully_damaged_buffer() {
    let mut surface: SurfaceState<u64, u32> = SurfaceState::new();
    let out = surface.attach(Some(attached(1, 8, 8)), 0, 0, 1.0, alloc).unwrap();
    assert!(out.allocated);
    assert_eq!(out.target, AttachTarget::Output(1));
    assert!(surface.current().unwrap().damage.has_damage());
}

#[test]
fn test_commit_copies_and_moves_to_busy() {
    let mut surface: SurfaceState<u64, u32> = SurfaceState::new();
    surface.attach(Some(attached(7, 4, 4)), 0, 0, 1.0, alloc).unwrap();
    let out = surface.commit(1.0, true);
    assert_eq!(out.copied_bytes, Some(4 * 4 * 4));
    assert_eq!(out.release, Some(7));
    assert!(surface.current().is_none());
    let busy: Vec<_> = surface.busy().collect();
    assert_eq!(busy.len(), 1);
    assert!(!busy[0].damage.has_damage());
    assert!(busy[0].map.bytes().iter().all(|b| *b == 7));
    assert_eq!(
        out.presentation,
        Presentation::Viewport(HostViewport {
            source: None,
            destination: (4, 4)
        })
    );
}

#[test]
fn test_released_buffer_is_reused_for_same_triple() {
    let mut surface: SurfaceState<u64, u32> = SurfaceState::new();
    surface.attach(Some(attached(1, 4, 4)), 0, 0, 1.0, alloc).unwrap();
    surface.commit(1.0, true);
    assert!(surface.buffer_released(BufferId(1)));

    let out = surface.attach(Some(attached(2, 4, 4)), 0, 0, 1.0, no_alloc).unwrap();
    assert!(!out.allocated);
    assert_eq!(out.target, AttachTarget::Output(1));
    assert_eq!(surface.buffer_count(), 1);
}

#[test]
fn test_damage_after_attach_refreshes_reused_buffer() {
    let mut surface: SurfaceState<u64, u32> = SurfaceState::new();
    surface.attach(Some(attached(1, 4, 4)), 0, 0, 1.0, alloc).unwrap();
    surface.damage(0, 0, 4, 4, 1.0);
    surface.commit(1.0, true);
    assert!(surface.buffer_released(BufferId(1)));

    surface.attach(Some(attached(2, 4, 4)), 0, 0, 1.0, no_alloc).unwrap();
    surface.damage(0, 0, 4, 4, 1.0);
    assert!(surface.current().unwrap().damage.has_damage());
    let out = surface.commit(1.0, true);
    assert_eq!(out.copied_bytes, Some(4 * 4 * 4));
    let front = surface.busy().next().unwrap();
    assert!(front.map.bytes().iter().all(|b| *b == 2));
}

#[test]
fn test_mismatched_released_buffers_are_evicted() {
    let mut surface: SurfaceState<u64, u32> = SurfaceState::new();
    for (guest, size) in [(1, 4), (2, 6)] {
        surface.attach(Some(attached(guest, size, size)), 0, 0, 1.0, alloc).unwrap();
        surface.commit(1.0, true);
    }
    surface.buffer_released(BufferId(1));
    surface.buffer_released(BufferId(2));
    // released pool front to back: 2 (6x6), 1 (4x4)
    let out = surface.attach(Some(attached(3, 4, 4)), 0, 0, 1.0, no_alloc).unwrap();
    assert_eq!(out.evicted, vec![2]);
    assert_eq!(out.target, AttachTarget::Output(1));
}

#[test]
fn test_damage_accumulates_into_busy_and_released() {
    let mut surface: SurfaceState<u64, u32> = SurfaceState::new();
    for guest in [1, 2] {
        surface.attach(Some(attached(guest, 4, 4)), 0, 0, 1.0, alloc).unwrap();
        surface.commit(1.0, true);
    }
    surface.buffer_released(BufferId(1));
    let host = surface.damage(1, 1, 2, 2, 1.0);
    assert_eq!(host, DamageRect::new(0, 0, 4, 4));
    assert!(surface.busy().all(|b| b.damage.has_damage()));
    assert!(surface.released().all(|b| b.damage.has_damage()));
}

#[test]
fn test_attach_offset_divided_by_scale() {
    let mut surface: SurfaceState<u64, u32> = SurfaceState::new();
    let out = surface.attach(None, 10, -6, 2.0, no_alloc).unwrap();
    assert_eq!(out.offset, (5, -3));
    assert_eq!(out.target, AttachTarget::Detach);
}

#[test]
fn test_pass_through_buffer() {
    let mut surface: SurfaceState<u64, u32> = SurfaceState::new();
    let buffer = AttachedBuffer {
        guest: 9,
        width: 10,
        height: 10,
        shm: None,
    };
    let out = surface.attach(Some(buffer), 0, 0, 1.0, no_alloc).unwrap();
    assert_eq!(out.target, AttachTarget::PassThrough);
    let commit = surface.commit(2.0, false);
    assert_eq!(commit.copied_bytes, None);
    assert_eq!(commit.presentation, Presentation::BufferScale(2));
    assert!(commit.has_contents);
}

#[test]
fn test_allocation_failure_propagates() {
    let mut surface: SurfaceState<u64, u32> = SurfaceState::new();
    let err = surface
        .attach(Some(attached(1, 4, 4)), 0, 0, 1.0, |_, _| {
            Err(BridgeError::allocation("virtwl", std::io::Error::from_raw_os_error(libc::ENOMEM)))
        })
        .unwrap_err();
    assert!(err.is_fatal_to_process());
}

#[test]
fn test_reattach_without_commit_keeps_single_current() {
    let mut surface: SurfaceState<u64, u32> = SurfaceState::new();
    surface.attach(Some(attached(1, 4, 4)), 0, 0, 1.0, alloc).unwrap();
    let out = surface.attach(Some(attached(2, 4, 4)), 0, 0, 1.0, no_alloc).unwrap();
    assert_eq!(out.target, AttachTarget::Output(1));
    assert_eq!(surface.buffer_count(), 1);
}

#[test]
fn test_take_all_buffers() {
    let mut surface: SurfaceState<u64, u32> = SurfaceState::new();
    for guest in [1, 2] {
        surface.attach(Some(attached(guest, 4, 4)), 0, 0, 1.0, alloc).unwrap();
        surface.commit(1.0, true);
    }
    surface.buffer_released(BufferId(2));
    surface.attach(Some(attached(3, 4, 4)), 0, 0, 1.0, no_alloc).unwrap();
    let mut all = surface.take_all_buffers();
    all.sort();
    assert_eq!(all, vec![1, 2]);
    assert_eq!(surface.buffer_count(), 0);
}

#[test]
fn test_damage_clamped_to_contents() {
    let mut surface: SurfaceState<u64, u32> = SurfaceState::new();
    // before any buffer the outset is kept
    assert_eq!(surface.damage(0, 0, 10, 10, 1.0), DamageRect::new(-1, -1, 11, 11));

    surface.attach(Some(attached(1, 100, 100)), 0, 0, 1.0, alloc).unwrap();
    assert_eq!(surface.damage(0, 0, 100, 100, 1.0), DamageRect::new(0, 0, 100, 100));

    surface.viewport = Some(Viewport::default());
    assert_eq!(surface.damage(0, 0, 100, 100, 1.0), DamageRect::new(-1, -1, 101, 101));
}
