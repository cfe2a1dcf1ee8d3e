//! Target-size arithmetic for generative upscaling.

/// Default pixel budget for generative upscales (2048 x 2048).
pub const DEFAULT_MAX_PIXELS: u64 = 2048 * 2048;

/// Output sizes are multiples of this.
const SIZE_STEP: u32 = 8;

/// Largest `(width, height)` not exceeding `max_pixels` when enlarging
/// `width x height` by `amount`, preserving aspect ratio.
///
/// Both sides are rounded down to multiples of 8 and never drop below 8.
pub fn fit_to_pixel_budget(width: u32, height: u32, amount: f64, max_pixels: u64) -> (u32, u32) {
    let amount = if amount > 0.0 { amount } else { 1.0 };
    let mut w = width as f64 * amount;
    let mut h = height as f64 * amount;

    let area = w * h;
    if max_pixels > 0 && area > max_pixels as f64 {
        let shrink = (max_pixels as f64 / area).sqrt();
        w *= shrink;
        h *= shrink;
    }

    (round_down(w), round_down(h))
}

fn round_down(value: f64) -> u32 {
    let v = value.floor().max(0.0) as u32;
    (v / SIZE_STEP * SIZE_STEP).max(SIZE_STEP)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn within_budget_scales_directly() {
        assert_eq!(fit_to_pixel_budget(512, 768, 2.0, DEFAULT_MAX_PIXELS), (1024, 1536));
    }

    #[test]
    fn over_budget_shrinks_keeping_aspect() {
        let (w, h) = fit_to_pixel_budget(1024, 1024, 4.0, DEFAULT_MAX_PIXELS);
        assert_eq!((w, h), (2048, 2048));

        let (w, h) = fit_to_pixel_budget(512, 768, 4.0, 1_000_000);
        assert!(u64::from(w) * u64::from(h) <= 1_000_000);
        assert_eq!(w % 8, 0);
        assert_eq!(h % 8, 0);
        let ratio = h as f64 / w as f64;
        assert!((ratio - 1.5).abs() < 0.02);
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(fit_to_pixel_budget(3, 3, 1.0, DEFAULT_MAX_PIXELS), (8, 8));
        assert_eq!(fit_to_pixel_budget(512, 512, 0.0, DEFAULT_MAX_PIXELS), (512, 512));
    }
}
