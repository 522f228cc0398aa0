use ndarray::{Array2, Axis};
use rayon::prelude::*;

/// Source coordinate and blend weight along one axis, half-pixel centred
/// (`align_corners = false`).
#[derive(Clone, Copy, Debug)]
struct Tap {
	i0: usize,
	i1: usize,
	frac: f32,
}

fn taps(in_len: usize, out_len: usize) -> Vec<Tap> {
	let scale = in_len as f32 / out_len as f32;
	(0..out_len)
		.map(|dst| {
			let src = (scale * (dst as f32 + 0.5) - 0.5).max(0.0);
			let i0 = (src as usize).min(in_len - 1);
			let i1 = if i0 < in_len - 1 { i0 + 1 } else { i0 };
			Tap {
				i0,
				i1,
				frac: src - i0 as f32,
			}
		})
		.collect()
}

/// Exact when `a == b`, so flat regions stay flat.
#[inline]
fn lerp(a: f32, b: f32, t: f32) -> f32 {
	a + t * (b - a)
}

/// Bilinear resize of a single-channel field to (out_height, out_width).
///
/// Sampling positions follow the half-pixel convention: destination pixel
/// `d` reads source position `(d + 0.5) * in / out - 0.5`, clamped at 0.
pub fn resize_bilinear(src: &Array2<f32>, out_height: usize, out_width: usize) -> Array2<f32> {
	let (in_height, in_width) = src.dim();
	if in_height == 0 || in_width == 0 || out_height == 0 || out_width == 0 {
		return Array2::zeros((out_height, out_width));
	}
	if (in_height, in_width) == (out_height, out_width) {
		return src.clone();
	}

	let rows = taps(in_height, out_height);
	let cols = taps(in_width, out_width);

	let mut out = Array2::<f32>::zeros((out_height, out_width));
	out.axis_iter_mut(Axis(0))
		.into_par_iter()
		.zip(rows.par_iter())
		.for_each(|(mut row, ty)| {
			let top = src.row(ty.i0);
			let bottom = src.row(ty.i1);
			for (dst, tx) in row.iter_mut().zip(cols.iter()) {
				let upper = lerp(top[tx.i0], top[tx.i1], tx.frac);
				let lower = lerp(bottom[tx.i0], bottom[tx.i1], tx.frac);
				*dst = lerp(upper, lower, ty.frac);
			}
		});

	out
}
