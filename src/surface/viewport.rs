//! Guest viewport state and what it means for copying and presenting

/// Source crop in surface-local buffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SourceRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// `wp_viewport` state set by the guest. Unset members are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub source: Option<SourceRect>,
    pub destination: Option<(i32, i32)>,
}

/// Maps guest damage coordinates to content pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContentTransform {
    pub scale_x: f64,
    pub scale_y: f64,
    pub offset_x: f64,
    pub offset_y: f64,
}

/// Host viewport requests derived from the guest viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostViewport {
    pub source: Option<SourceRect>,
    pub destination: (i32, i32),
}

impl Viewport {
    /// `set_source(-1, -1, -1, -1)` clears the crop.
    pub fn set_source(&mut self, x: f64, y: f64, width: f64, height: f64) {
        self.source = if x == -1.0 && y == -1.0 && width == -1.0 && height == -1.0 {
            None
        } else {
            Some(SourceRect {
                x,
                y,
                width,
                height,
            })
        };
    }

    /// `set_destination(-1, -1)` clears the destination size.
    pub fn set_destination(&mut self, width: i32, height: i32) {
        self.destination = if width == -1 && height == -1 {
            None
        } else {
            Some((width, height))
        };
    }

    fn source_origin(&self) -> Option<(f64, f64)> {
        self.source
            .filter(|s| s.x >= 0.0 && s.y >= 0.0)
            .map(|s| (s.x, s.y))
    }

    fn source_size(&self) -> Option<(f64, f64)> {
        self.source
            .filter(|s| s.width >= 0.0 && s.height >= 0.0)
            .map(|s| (s.width, s.height))
    }

    fn full_source(&self) -> Option<SourceRect> {
        self.source
            .filter(|s| s.x >= 0.0 && s.y >= 0.0 && s.width >= 0.0 && s.height >= 0.0)
    }
}

/// Transform used when copying damaged rectangles.
///
/// The source origin, when set, offsets the copy. A destination size rescales
/// by contents/destination; when a source size is also present it rescales
/// further by source/contents. A source-only viewport defines the surface
/// size itself and leaves the scale alone.
pub fn content_transform(
    viewport: Option<&Viewport>,
    contents: (i32, i32),
    contents_scale: f64,
) -> ContentTransform {
    let mut t = ContentTransform {
        scale_x: contents_scale,
        scale_y: contents_scale,
        offset_x: 0.0,
        offset_y: 0.0,
    };
    let Some(vp) = viewport else {
        return t;
    };
    let (cw, ch) = (contents.0 as f64, contents.1 as f64);

    if let Some((x, y)) = vp.source_origin() {
        t.offset_x = x;
        t.offset_y = y;
    }

    if let Some((dw, dh)) = vp.destination.filter(|(w, h)| *w > 0 && *h > 0) {
        t.scale_x *= cw / dw as f64;
        t.scale_y *= ch / dh as f64;
        if let Some((sw, sh)) = vp.source_size() {
            t.scale_x *= sw / cw;
            t.scale_y *= sh / ch;
        }
    }
    t
}

/// Host viewport source/destination for a commit.
///
/// `scale` is the proxy scale multiplied by the guest's buffer scale.
pub fn host_viewport(viewport: Option<&Viewport>, contents: (i32, i32), scale: f64) -> HostViewport {
    let (mut width, mut height) = contents;
    let mut source = None;

    if let Some(vp) = viewport {
        if let Some(src) = vp.full_source() {
            source = Some(src);
            width = src.width.trunc() as i32;
            height = src.height.trunc() as i32;
        }
        if let Some((dw, dh)) = vp.destination.filter(|(w, h)| *w >= 0 && *h >= 0) {
            width = dw;
            height = dh;
        }
    }

    HostViewport {
        source,
        destination: (
            (width as f64 / scale).ceil() as i32,
            (height as f64 / scale).ceil() as i32,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clearing_viewport() {
        let mut vp = Viewport::default();
        vp.set_source(1.0, 2.0, 3.0, 4.0);
        vp.set_destination(10, 20);
        assert!(vp.source.is_some());
        vp.set_source(-1.0, -1.0, -1.0, -1.0);
        vp.set_destination(-1, -1);
        assert_eq!(vp, Viewport::default());
    }

    #[test]
    fn test_transform_without_viewport() {
        let t = content_transform(None, (100, 100), 2.0);
        assert_eq!((t.scale_x, t.offset_x), (2.0, 0.0));
    }

    #[test]
    fn test_transform_destination_only() {
        let vp = Viewport {
            source: None,
            destination: Some((50, 25)),
        };
        let t = content_transform(Some(&vp), (100, 100), 1.0);
        assert_eq!((t.scale_x, t.scale_y), (2.0, 4.0));
    }

    #[test]
    fn test_transform_source_and_destination() {
        let vp = Viewport {
            source: Some(SourceRect {
                x: 10.0,
                y: 20.0,
                width: 50.0,
                height: 50.0,
            }),
            destination: Some((100, 100)),
        };
        let t = content_transform(Some(&vp), (200, 200), 1.0);
        // 200/100 * 50/200
        assert_eq!((t.scale_x, t.scale_y), (0.5, 0.5));
        assert_eq!((t.offset_x, t.offset_y), (10.0, 20.0));
    }

    #[test]
    fn test_host_viewport_scales_destination() {
        let hv = host_viewport(None, (101, 50), 2.0);
        assert_eq!(hv.destination, (51, 25));
        assert!(hv.source.is_none());
    }

    #[test]
    fn test_host_viewport_source_defines_size() {
        let vp = Viewport {
            source: Some(SourceRect {
                x: 0.0,
                y: 0.0,
                width: 64.5,
                height: 32.0,
            }),
            destination: None,
        };
        let hv = host_viewport(Some(&vp), (128, 128), 1.0);
        assert_eq!(hv.destination, (64, 32));
        assert_eq!(hv.source.unwrap().width, 64.5);
    }

    #[test]
    fn test_host_viewport_destination_wins() {
        let vp = Viewport {
            source: None,
            destination: Some((300, 200)),
        };
        assert_eq!(host_viewport(Some(&vp), (10, 10), 1.5).destination, (200, 134));
    }
}
