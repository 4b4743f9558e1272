use oxidize_seg_core::{Tensor, TensorError, TensorResult};
use rayon::prelude::*;

/// Source taps for one output coordinate along an axis.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Tap {
    i0: usize,
    i1: usize,
    l0: f32,
    l1: f32,
}

/// Precompute the two-tap linear filter along one axis.
///
/// With `align_corners = false` pixel centres are mapped
/// (`src = (dst + 0.5) * in / out - 0.5`, clamped at 0), so the corner
/// samples of input and output do not coincide. With `align_corners = true`
/// the corner pixels are aligned (`src = dst * (in - 1) / (out - 1)`).
fn taps(input: usize, output: usize, align_corners: bool) -> Vec<Tap> {
    let scale = if align_corners {
        if output > 1 {
            (input as f32 - 1.0) / (output as f32 - 1.0)
        } else {
            0.0
        }
    } else {
        input as f32 / output as f32
    };

    (0..output)
        .map(|dst| {
            let src = if align_corners {
                scale * dst as f32
            } else {
                (scale * (dst as f32 + 0.5) - 0.5).max(0.0)
            };
            let i0 = (src as usize).min(input - 1);
            // the last row or column reuses itself as neighbour but keeps its weight
            let i1 = if i0 + 1 < input { i0 + 1 } else { i0 };
            let l1 = (src - i0 as f32).clamp(0.0, 1.0);
            Tap {
                i0,
                i1,
                l0: 1.0 - l1,
                l1,
            }
        })
        .collect()
}

/// Bilinear resize of a `[batch, channels, h, w]` tensor to `size = (out_h, out_w)`.
pub fn interpolate_bilinear(
    input: &Tensor<f32>,
    size: (usize, usize),
    align_corners: bool,
) -> TensorResult<Tensor<f32>> {
    let [n, c, h, w] = input.nchw()?;
    let (out_h, out_w) = size;
    if out_h == 0 || out_w == 0 || h == 0 || w == 0 {
        return Err(TensorError::InvalidOperation(format!(
            "cannot interpolate {} to {}x{}",
            input.shape(),
            out_h,
            out_w
        )));
    }
    if (out_h, out_w) == (h, w) && !align_corners {
        return Ok(input.clone());
    }

    let rows = taps(h, out_h, align_corners);
    let cols = taps(w, out_w, align_corners);

    let mut output = vec![0.0f32; n * c * out_h * out_w];
    output
        .par_chunks_mut(out_h * out_w)
        .zip(input.data().par_chunks(h * w))
        .for_each(|(dst, src)| {
            for (y, r) in rows.iter().enumerate() {
                let top = &src[r.i0 * w..(r.i0 + 1) * w];
                let bottom = &src[r.i1 * w..(r.i1 + 1) * w];
                let out_row = &mut dst[y * out_w..(y + 1) * out_w];
                for (v, t) in out_row.iter_mut().zip(&cols) {
                    *v = r.l0 * (t.l0 * top[t.i0] + t.l1 * top[t.i1])
                        + r.l1 * (t.l0 * bottom[t.i0] + t.l1 * bottom[t.i1]);
                }
            }
        });

    Tensor::new(output, vec![n, c, out_h, out_w])
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// Per-axis weights computed directly from the half-pixel mapping.
    fn axis_weights(input: usize, output: usize, dst: usize) -> (usize, usize, f32, f32) {
        let scale = input as f32 / output as f32;
        let src = (scale * (dst as f32 + 0.5) - 0.5).max(0.0);
        let i0 = (src.floor() as usize).min(input - 1);
        let i1 = if i0 < input - 1 { i0 + 1 } else { i0 };
        let l1 = (src - i0 as f32).clamp(0.0, 1.0);
        (i0, i1, 1.0 - l1, l1)
    }

    #[test]
    fn test_single_cell_broadcasts() {
        let x = Tensor::new(vec![3.0, -1.0], vec![1, 2, 1, 1]).unwrap();
        let y = interpolate_bilinear(&x, (5, 7), false).unwrap();
        assert_eq!(y.shape_vec(), vec![1, 2, 5, 7]);
        for &v in &y.data()[..35] {
            assert_abs_diff_eq!(v, 3.0, epsilon = 1e-6);
        }
        for &v in &y.data()[35..] {
            assert_abs_diff_eq!(v, -1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_single_cell_matches_half_pixel_formula_bitwise() {
        let v = f32::from_bits(0x3fe4_9311);
        let x = Tensor::new(vec![v], vec![1, 1, 1, 1]).unwrap();
        let y = interpolate_bilinear(&x, (5, 7), false).unwrap();
        let src = x.data();
        for oy in 0..5 {
            let (h0, h1, l0h, l1h) = axis_weights(1, 5, oy);
            for ox in 0..7 {
                let (w0, w1, l0w, l1w) = axis_weights(1, 7, ox);
                let top = l0w * src[h0 + w0] + l1w * src[h0 + w1];
                let bottom = l0w * src[h1 + w0] + l1w * src[h1 + w1];
                let want = l0h * top + l1h * bottom;
                assert_eq!(y.data()[oy * 7 + ox].to_bits(), want.to_bits(), "at ({}, {})", oy, ox);
            }
        }
        // the edge weight rounds the product one ulp above the input value
        assert_eq!(y.data()[4 * 7].to_bits(), 0x3fe4_9312);
    }

    #[test]
    fn test_half_pixel_upsample() {
        // 1x2 -> 1x4 without corner alignment: src = [-0.25->0, 0.25, 0.75, 1.25->i0=1]
        let x = Tensor::new(vec![0.0, 4.0], vec![1, 1, 1, 2]).unwrap();
        let y = interpolate_bilinear(&x, (1, 4), false).unwrap();
        assert_eq!(y.data(), &[0.0, 1.0, 3.0, 4.0]);
    }

    #[test]
    fn test_align_corners_upsample() {
        let x = Tensor::new(vec![0.0, 4.0], vec![1, 1, 1, 2]).unwrap();
        let y = interpolate_bilinear(&x, (1, 5), true).unwrap();
        for (got, want) in y.data().iter().zip([0.0, 1.0, 2.0, 3.0, 4.0]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_downsample_2d() {
        // 4x4 ramp down to 2x2: each output samples the centre of a 2x2 block.
        let data: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let x = Tensor::new(data, vec![1, 1, 4, 4]).unwrap();
        let y = interpolate_bilinear(&x, (2, 2), false).unwrap();
        for (got, want) in y.data().iter().zip([2.5, 4.5, 10.5, 12.5]) {
            assert_abs_diff_eq!(*got, want, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_same_size_is_identity() {
        let x = Tensor::randn(vec![2, 3, 5, 4], Some(11));
        let y = interpolate_bilinear(&x, (5, 4), false).unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn test_taps_clamp_to_edge() {
        let t = taps(3, 6, false);
        assert_eq!(t[0].i0, 0);
        assert_eq!(t[0].l1, 0.0);
        // src = 0.5 * 5.5 - 0.5 = 2.25 lies past the last sample
        let last = t[5];
        assert_eq!((last.i0, last.i1), (2, 2));
        assert_eq!(last.l1, 0.25);
        assert_eq!(last.l0, 0.75);
    }
}
