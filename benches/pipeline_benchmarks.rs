//! Performance benchmarks for the crossway buffer and selection pipelines
//!
//! These cover the per-commit and per-transfer hot paths: damage translation,
//! damage-limited copies into output buffers, and INCR chunking.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use crossway::mmap::{MapLayout, MappedBuffer, WriteSync};
use crossway::selection::{OfferedType, SelectionAction, SelectionAtoms, SelectionBridge, SelectionRequest};
use crossway::surface::damage::{host_damage, BufferDamage};
use crossway::surface::viewport::content_transform;
use crossway::surface::{copy, DamageRect};
use std::io::Write;
use std::sync::Arc;

fn shm_map(width: usize, height: usize, fill: u8) -> Arc<MappedBuffer> {
    let stride = width * 4;
    let size = stride * height;
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(&vec![fill; size]).unwrap();
    MappedBuffer::map(
        file.into(),
        MapLayout::single_plane(size, 4, 0, stride),
        WriteSync::None,
    )
    .unwrap()
}

/// Benchmark guest-to-host damage translation
fn bench_damage_translation(c: &mut Criterion) {
    let mut group = c.benchmark_group("damage_translation");

    for scale in [1.0, 1.5, 2.0] {
        group.bench_function(format!("host_damage_scale_{}", scale), |b| {
            b.iter(|| {
                for i in 0..100 {
                    black_box(host_damage(
                        DamageRect::from_xywh(i * 7, i * 3, 64, 48),
                        scale,
                        Some((1920, 1080)),
                    ));
                }
            })
        });
    }

    group.bench_function("accumulate_scattered_rects", |b| {
        b.iter_batched(
            BufferDamage::empty,
            |mut damage| {
                for i in 0..200 {
                    damage.add(DamageRect::from_xywh((i * 37) % 1900, (i * 53) % 1060, 20, 20));
                }
                damage.merge_overlapping();
                black_box(damage.rects().len())
            },
            BatchSize::SmallInput,
        )
    });

    group.finish();
}

/// Benchmark damage-limited copies into an output buffer
fn bench_copy_damage(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_damage");
    let (width, height) = (1280, 720);
    let src = shm_map(width, height, 0x5a);
    let dst = shm_map(width, height, 0);
    let transform = content_transform(None, (width as i32, height as i32), 1.0);

    let cases = [
        ("full_frame", vec![DamageRect::from_xywh(0, 0, width as i32, height as i32)]),
        ("cursor_blink", vec![DamageRect::from_xywh(400, 300, 2, 18)]),
        (
            "scattered",
            (0..16)
                .map(|i| DamageRect::from_xywh(i * 70, i * 40, 64, 32))
                .collect(),
        ),
    ];
    for (name, rects) in cases {
        group.bench_function(name, |b| {
            b.iter(|| {
                black_box(copy::copy_damage(
                    &src,
                    &dst,
                    &rects,
                    &transform,
                    (width as i32, height as i32),
                ))
            })
        });
    }

    group.finish();
}

/// Benchmark a large host-to-X selection transfer through INCR
fn bench_incr_transfer(c: &mut Criterion) {
    let atoms = SelectionAtoms {
        clipboard: 100,
        clipboard_manager: 101,
        targets: 102,
        timestamp: 103,
        incr: 104,
        wl_selection: 105,
    };
    let request = SelectionRequest {
        time: 1,
        requestor: 0x800003,
        selection: atoms.clipboard,
        target: 400,
        property: 300,
    };

    c.bench_function("incr_transfer_1mib", |b| {
        b.iter_batched(
            || {
                let mut bridge: SelectionBridge<Vec<u8>> = SelectionBridge::new(0x600001, atoms);
                bridge.host_offer(Some(vec![OfferedType {
                    atom: 400,
                    mime: "text/plain".into(),
                }]));
                bridge.selection_request(request);
                bridge
            },
            |mut bridge| {
                let mut remaining = 1024 * 1024;
                let mut paused = false;
                loop {
                    let actions = if paused {
                        bridge.property_deleted(request.requestor, request.property)
                    } else {
                        let Some(buf) = bridge.receive_buf() else { break };
                        let n = remaining.min(buf.len());
                        remaining -= n;
                        bridge.offer_read(Ok(n))
                    };
                    if actions.contains(&SelectionAction::CloseReceive) {
                        break;
                    }
                    if actions.contains(&SelectionAction::PauseReceive) {
                        paused = true;
                    }
                    if actions.contains(&SelectionAction::ResumeReceive) {
                        paused = false;
                    }
                }
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(
    benches,
    bench_damage_translation,
    bench_copy_damage,
    bench_incr_transfer
);
criterion_main!(benches);
