/// Converts packed RGB888 to planar I420 (BT.601, studio swing). Chroma is taken from the top-left
/// pixel of each 2x2 block; odd dimensions round the chroma planes up.
pub fn rgb_to_i420(rgb: &[u8], width: usize, height: usize) -> Vec<u8> {
    let chroma_w = width.div_ceil(2);
    let chroma_h = height.div_ceil(2);
    let mut out = Vec::with_capacity(width * height + 2 * chroma_w * chroma_h);

    let px = |x: usize, y: usize| {
        let i = 3 * (y * width + x);
        (rgb[i] as i32, rgb[i + 1] as i32, rgb[i + 2] as i32)
    };

    for y in 0..height {
        for x in 0..width {
            let (r, g, b) = px(x, y);
            out.push((((66 * r + 129 * g + 25 * b) >> 8) + 16) as u8);
        }
    }
    for y in (0..height).step_by(2) {
        for x in (0..width).step_by(2) {
            let (r, g, b) = px(x, y);
            out.push((((-38 * r - 74 * g + 112 * b) >> 8) + 128) as u8);
        }
    }
    for y in (0..height).step_by(2) {
        for x in (0..width).step_by(2) {
            let (r, g, b) = px(x, y);
            out.push((((112 * r - 94 * g - 18 * b) >> 8) + 128) as u8);
        }
    }
    out
}
