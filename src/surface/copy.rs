//! Damaged-rectangle copy from guest shm into output buffers

use super::damage::DamageRect;
use super::viewport::ContentTransform;
use crate::mmap::{MapLayout, MappedBuffer};
use log::{debug, trace};

/// Content-pixel rectangle, already clamped to the content bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRect {
    pub x1: usize,
    pub y1: usize,
    pub x2: usize,
    pub y2: usize,
}

/// Map a guest damage rectangle into content pixels.
///
/// The origin truncates and the far corner rounds to nearest. Returns `None`
/// when nothing of the rectangle lies inside `contents`.
pub fn content_rect(rect: &DamageRect, t: &ContentTransform, contents: (i32, i32)) -> Option<CopyRect> {
    let x1 = (rect.x1 as f64 * t.scale_x + t.offset_x).trunc();
    let y1 = (rect.y1 as f64 * t.scale_y + t.offset_y).trunc();
    let x2 = (rect.x2 as f64 * t.scale_x + t.offset_x + 0.5).trunc();
    let y2 = (rect.y2 as f64 * t.scale_y + t.offset_y + 0.5).trunc();

    let x1 = x1.max(0.0);
    let y1 = y1.max(0.0);
    let x2 = x2.min(contents.0 as f64);
    let y2 = y2.min(contents.1 as f64);

    if x1 < x2 && y1 < y2 {
        Some(CopyRect {
            x1: x1 as usize,
            y1: y1 as usize,
            x2: x2 as usize,
            y2: y2 as usize,
        })
    } else {
        None
    }
}

/// Copy `rect` plane by plane between two byte views.
///
/// Rows of a subsampled plane are addressed at `y / y_subsampling`. Rows that
/// would fall outside either view are skipped, so a guest lying about its
/// stride cannot make us read or write out of bounds. Returns the bytes copied.
pub fn copy_rect(src: &[u8], src_layout: &MapLayout, dst: &mut [u8], dst_layout: &MapLayout, rect: CopyRect) -> usize {
    let bpp = src_layout.bpp;
    let bytes = (rect.x2 - rect.x1) * bpp;
    let mut copied = 0;

    for (sp, dp) in src_layout.planes.iter().zip(dst_layout.planes.iter()) {
        let ss = sp.y_subsampling;
        let first_row = rect.y1 / ss;
        let rows = (rect.y2 - rect.y1) / ss;
        for row in first_row..first_row + rows {
            let s = sp.offset + row * sp.stride + rect.x1 * bpp;
            let d = dp.offset + row * dp.stride + rect.x1 * bpp;
            let (Some(from), Some(to)) = (src.get(s..s + bytes), dst.get_mut(d..d + bytes)) else {
                trace!("row {} of plane outside mapping, skipped", row);
                continue;
            };
            to.copy_from_slice(from);
            copied += bytes;
        }
    }
    copied
}

/// Copy every damaged rectangle from the guest mapping into `dst`.
pub fn copy_damage(
    src: &MappedBuffer,
    dst: &MappedBuffer,
    rects: &[DamageRect],
    transform: &ContentTransform,
    contents: (i32, i32),
) -> usize {
    let copy_rects: Vec<CopyRect> = rects
        .iter()
        .filter_map(|r| content_rect(r, transform, contents))
        .collect();
    if copy_rects.is_empty() {
        return 0;
    }

    let src_bytes = src.bytes();
    let copied = dst.write_with(|dst_bytes| {
        copy_rects
            .iter()
            .map(|r| copy_rect(src_bytes, src.layout(), dst_bytes, dst.layout(), *r))
            .sum::<usize>()
    });
    debug!("🖼️ Copied {} bytes in {} rects", copied, copy_rects.len());
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::PlaneLayout;

    fn identity() -> ContentTransform {
        ContentTransform {
            scale_x: 1.0,
            scale_y: 1.0,
            offset_x: 0.0,
            offset_y: 0.0,
        }
    }

    #[test]
    fn test_content_rect_clamps_everything() {
        let r = content_rect(&DamageRect::everything(), &identity(), (64, 32)).unwrap();
        assert_eq!(r, CopyRect { x1: 0, y1: 0, x2: 64, y2: 32 });
    }

    #[test]
    fn test_content_rect_outside_is_none() {
        let rect = DamageRect::from_xywh(100, 100, 10, 10);
        assert!(content_rect(&rect, &identity(), (64, 64)).is_none());
    }

    #[test]
    fn test_content_rect_applies_offset_and_scale() {
        let t = ContentTransform {
            scale_x: 2.0,
            scale_y: 2.0,
            offset_x: 3.0,
            offset_y: 0.0,
        };
        let r = content_rect(&DamageRect::from_xywh(1, 1, 2, 2), &t, (100, 100)).unwrap();
        assert_eq!(r, CopyRect { x1: 5, y1: 2, x2: 9, y2: 6 });
    }

    #[test]
    fn test_copy_single_plane_rect() {
        let layout = MapLayout::single_plane(4 * 4 * 4, 4, 0, 16);
        let src: Vec<u8> = (0..64).collect();
        let mut dst = vec![0u8; 64];
        let n = copy_rect(&src, &layout, &mut dst, &layout, CopyRect { x1: 1, y1: 1, x2: 3, y2: 2 });
        assert_eq!(n, 8);
        assert_eq!(&dst[20..28], &src[20..28]);
        assert!(dst[..20].iter().all(|b| *b == 0));
        assert!(dst[28..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_copy_subsampled_plane() {
        // 4x4 NV12-like: luma 16 bytes, chroma 2 rows of 4 bytes
        let layout = MapLayout {
            size: 24,
            bpp: 1,
            planes: vec![PlaneLayout::new(0, 4, 1), PlaneLayout::new(16, 4, 2)],
        };
        let src: Vec<u8> = (1..=24).collect();
        let mut dst = vec![0u8; 24];
        let n = copy_rect(&src, &layout, &mut dst, &layout, CopyRect { x1: 0, y1: 0, x2: 4, y2: 4 });
        assert_eq!(n, 16 + 8);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_copy_skips_rows_out_of_bounds() {
        let src_layout = MapLayout::single_plane(16, 4, 0, 1000);
        let dst_layout = MapLayout::single_plane(16, 4, 0, 4);
        let src = vec![7u8; 16];
        let mut dst = vec![0u8; 16];
        let n = copy_rect(&src, &src_layout, &mut dst, &dst_layout, CopyRect { x1: 0, y1: 0, x2: 1, y2: 3 });
        // only row 0 fits inside the source
        assert_eq!(n, 4);
    }
}
