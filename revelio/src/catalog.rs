//! The extraction catalog: one entry per surviving object, stored as a
//! struct of parallel arrays plus one concatenated pixel-index buffer.

use crate::extract::object::{Accum, Analysis};

/// Catalog of detected objects. Every vector has one element per object;
/// member pixel indices of object `i` are `pixels(i)`.
///
/// The catalog owns its storage and releases it on drop.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    /// Detection threshold at the object, in data units.
    pub thresh: Vec<f32>,
    /// Member pixel count.
    pub npix: Vec<usize>,
    /// Member pixels above threshold on the unfiltered image.
    pub tnpix: Vec<usize>,
    pub xmin: Vec<usize>,
    pub xmax: Vec<usize>,
    pub ymin: Vec<usize>,
    pub ymax: Vec<usize>,
    /// Barycenter (first moments).
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    /// Second central moments.
    pub x2: Vec<f64>,
    pub y2: Vec<f64>,
    pub xy: Vec<f64>,
    /// Errors on the second moments.
    pub errx2: Vec<f64>,
    pub erry2: Vec<f64>,
    pub errxy: Vec<f64>,
    /// Ellipse semi-axes and position angle.
    pub a: Vec<f32>,
    pub b: Vec<f32>,
    pub theta: Vec<f32>,
    /// Ellipse quadratic-form coefficients.
    pub cxx: Vec<f32>,
    pub cyy: Vec<f32>,
    pub cxy: Vec<f32>,
    /// Total flux in the filtered detection image.
    pub cflux: Vec<f32>,
    /// Total flux in the raw image.
    pub flux: Vec<f32>,
    /// Peak value and its position in the filtered image.
    pub cpeak: Vec<f32>,
    pub xcpeak: Vec<usize>,
    pub ycpeak: Vec<usize>,
    /// Peak value and its position in the raw image.
    pub peak: Vec<f32>,
    pub xpeak: Vec<usize>,
    pub ypeak: Vec<usize>,
    /// Extraction flag bits.
    pub flags: Vec<u16>,

    /// All member pixel indices, object after object.
    objects_pix: Vec<usize>,
    /// Prefix offsets into `objects_pix`, length `len() + 1`.
    pix_offsets: Vec<usize>,
}

impl Catalog {
    pub(crate) fn with_capacity(n: usize) -> Self {
        let mut catalog = Self::default();
        catalog.pix_offsets.reserve(n + 1);
        catalog.pix_offsets.push(0);
        catalog
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.npix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.npix.is_empty()
    }

    /// Member pixel indices (`y * width + x`) of object `i`, ascending.
    pub fn pixels(&self, i: usize) -> &[usize] {
        &self.objects_pix[self.pix_offsets[i]..self.pix_offsets[i + 1]]
    }

    pub(crate) fn push(&mut self, acc: &Accum, an: &Analysis, pixels: &[usize]) {
        self.thresh.push(acc.thresh);
        self.npix.push(acc.npix);
        self.tnpix.push(acc.tnpix);
        self.xmin.push(acc.xmin);
        self.xmax.push(acc.xmax);
        self.ymin.push(acc.ymin);
        self.ymax.push(acc.ymax);
        self.x.push(an.x);
        self.y.push(an.y);
        self.x2.push(an.x2);
        self.y2.push(an.y2);
        self.xy.push(an.xy);
        self.errx2.push(an.errx2);
        self.erry2.push(an.erry2);
        self.errxy.push(an.errxy);
        self.a.push(an.a);
        self.b.push(an.b);
        self.theta.push(an.theta);
        self.cxx.push(an.cxx);
        self.cyy.push(an.cyy);
        self.cxy.push(an.cxy);
        self.cflux.push(acc.csum as f32);
        self.flux.push(acc.rsum as f32);
        self.cpeak.push(acc.cpeak);
        self.xcpeak.push(acc.xcpeak);
        self.ycpeak.push(acc.ycpeak);
        self.peak.push(acc.peak);
        self.xpeak.push(acc.xpeak);
        self.ypeak.push(acc.ypeak);
        self.flags.push(an.flags);
        self.objects_pix.extend_from_slice(pixels);
        self.pix_offsets.push(self.objects_pix.len());
    }
}
