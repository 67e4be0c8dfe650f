//! Property tests for object pairing and the output buffer pool

use anyhow::Result;
use crossway::bridge::{PairKey, PairTable, Teardown};
use crossway::error::BridgeResult;
use crossway::mmap::{MapLayout, MappedBuffer, WriteSync};
use crossway::surface::{
    Allocation, AttachedBuffer, BufferId, BufferSpec, HostImport, ShmFormat, SurfaceState,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::io::Write;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum PairOp {
    Insert,
    ResourceGone(usize),
    ProxyGone(usize),
}

fn pair_op() -> impl Strategy<Value = PairOp> {
    prop_oneof![
        2 => Just(PairOp::Insert),
        1 => any::<usize>().prop_map(PairOp::ResourceGone),
        1 => any::<usize>().prop_map(PairOp::ProxyGone),
    ]
}

type Pairs = PairTable<u32, u32, u32>;

proptest! {
    /// Whatever order the two sides go away in, each pair is torn down
    /// exactly once, and keys of removed pairs never come back to life.
    #[test]
    fn prop_pairs_tear_down_once(ops in prop::collection::vec(pair_op(), 1..80)) {
        let mut table = Pairs::new();
        let mut keys: Vec<PairKey<u32, u32, u32>> = Vec::new();
        let mut live: HashSet<usize> = HashSet::new();
        let mut severed = 0;

        for op in ops {
            match op {
                PairOp::Insert => {
                    let n = keys.len() as u32;
                    keys.push(table.insert(n, n + 1000, n * 7));
                    live.insert(keys.len() - 1);
                }
                PairOp::ResourceGone(_) | PairOp::ProxyGone(_) if keys.is_empty() => {}
                PairOp::ResourceGone(i) => {
                    let index = i % keys.len();
                    match table.resource_destroyed(keys[index]) {
                        Teardown::Sever { other, data } => {
                            prop_assert!(live.remove(&index));
                            prop_assert_eq!(other, index as u32 + 1000);
                            prop_assert_eq!(data, index as u32 * 7);
                            severed += 1;
                        }
                        Teardown::AlreadyGone => prop_assert!(!live.contains(&index)),
                    }
                }
                PairOp::ProxyGone(i) => {
                    let index = i % keys.len();
                    match table.proxy_destroyed(keys[index]) {
                        Teardown::Sever { other, .. } => {
                            prop_assert!(live.remove(&index));
                            prop_assert_eq!(other, index as u32);
                            severed += 1;
                        }
                        Teardown::AlreadyGone => prop_assert!(!live.contains(&index)),
                    }
                }
            }
            prop_assert_eq!(table.len(), live.len());
            for (index, key) in keys.iter().enumerate() {
                prop_assert_eq!(table.contains(*key), live.contains(&index));
            }
        }
        prop_assert_eq!(severed + live.len(), keys.len());
    }
}

const SIZES: [(u32, u32); 3] = [(4, 4), (8, 4), (4, 8)];

fn shm_map(width: u32, height: u32, fill: u8) -> Result<Arc<MappedBuffer>> {
    let stride = width as usize * 4;
    let size = stride * height as usize;
    let mut file = tempfile::tempfile()?;
    file.write_all(&vec![fill; size])?;
    MappedBuffer::map(
        file.into(),
        MapLayout::single_plane(size, 4, 0, stride),
        WriteSync::None,
    )
}

fn alloc(id: BufferId, spec: BufferSpec<'_>) -> BridgeResult<(u64, Allocation)> {
    let map = shm_map(spec.width, spec.height, 0).expect("scratch mapping");
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

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// A guest that attaches and then damages the whole surface every frame
    /// always sees its latest content on the host, and a buffer is only allocated when no
    /// released one fits.
    #[test]
    fn prop_output_buffers_reuse_and_stay_current(
        frames in prop::collection::vec((0..SIZES.len(), 0usize..3), 1..24)
    ) {
        let mut surface: SurfaceState<u64, u8> = SurfaceState::new();

        for (frame, (size, releases)) in frames.into_iter().enumerate() {
            let (width, height) = SIZES[size];
            let fill = frame as u8 + 1;
            let reusable = surface
                .released()
                .any(|b| b.width == width && b.height == height);

            let buffer = AttachedBuffer {
                guest: fill,
                width,
                height,
                shm: Some((ShmFormat::Argb8888, shm_map(width, height, fill).unwrap())),
            };
            let out = surface.attach(Some(buffer), 0, 0, 1.0, alloc).unwrap();
            prop_assert_eq!(out.allocated, !reusable);
            surface.damage(0, 0, width as i32, height as i32, 1.0);

            let commit = surface.commit(1.0, false);
            prop_assert_eq!(commit.release, Some(fill));
            let front = surface.busy().next().unwrap();
            prop_assert_eq!((front.width, front.height), (width, height));
            prop_assert!(front.map.bytes().iter().all(|b| *b == fill));

            // the host hands back some of its oldest buffers
            let oldest: Vec<BufferId> = surface.busy().map(|b| b.id).collect();
            for id in oldest.into_iter().rev().take(releases) {
                prop_assert!(surface.buffer_released(id));
            }
        }
    }
}
