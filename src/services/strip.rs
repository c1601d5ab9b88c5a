use image::{ImageFormat, Rgba, RgbaImage};

const STRIP_WIDTH: u32 = 750;
const STRIP_HEIGHT: u32 = 246;
const SLOTS_PER_ROW: u32 = 5;

#[derive(thiserror::Error, Debug)]
pub enum StripError {
    #[error("Strip needs at least one slot")]
    NoSlots,

    #[error("PNG encoding failed: {0}")]
    Encoding(#[from] image::ImageError),
}

/// Draws the punch strip: one slot per required punch, the first `current_punches`
/// filled, laid out in rows of five on the merchant's strip color. Returns PNG bytes.
pub fn render_strip(
    current_punches: i32,
    punches_required: i32,
    background: (u8, u8, u8),
    foreground: (u8, u8, u8),
) -> Result<Vec<u8>, StripError> {
    let slots = u32::try_from(punches_required).map_err(|_| StripError::NoSlots)?;
    if slots == 0 {
        return Err(StripError::NoSlots);
    }
    let filled = u32::try_from(current_punches.max(0)).unwrap_or(0);

    let (br, bg, bb) = background;
    let (fr, fg, fb) = foreground;
    let fill = Rgba([fr, fg, fb, 255]);
    let mut img = RgbaImage::from_pixel(STRIP_WIDTH, STRIP_HEIGHT, Rgba([br, bg, bb, 255]));

    let columns = slots.min(SLOTS_PER_ROW);
    let rows = (slots + SLOTS_PER_ROW - 1) / SLOTS_PER_ROW;
    let cell_w = STRIP_WIDTH as f32 / columns as f32;
    let cell_h = STRIP_HEIGHT as f32 / rows as f32;
    let radius = cell_w.min(cell_h) * 0.36;
    let ring = (radius * 0.18).max(2.0);

    for slot in 0..slots {
        let row = slot / SLOTS_PER_ROW;
        let col = slot % SLOTS_PER_ROW;
        let cx = cell_w * (col as f32 + 0.5);
        let cy = cell_h * (row as f32 + 0.5);
        draw_slot(&mut img, cx, cy, radius, ring, fill, slot < filled);
    }

    let mut png = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut png), ImageFormat::Png)?;
    Ok(png)
}

fn draw_slot(
    img: &mut RgbaImage,
    cx: f32,
    cy: f32,
    radius: f32,
    ring: f32,
    color: Rgba<u8>,
    solid: bool,
) {
    let x0 = (cx - radius).floor().max(0.0) as u32;
    let y0 = (cy - radius).floor().max(0.0) as u32;
    let x1 = ((cx + radius).ceil() as u32).min(img.width() - 1);
    let y1 = ((cy + radius).ceil() as u32).min(img.height() - 1);

    for y in y0..=y1 {
        for x in x0..=x1 {
            let dx = x as f32 + 0.5 - cx;
            let dy = y as f32 + 0.5 - cy;
            let distance = (dx * dx + dy * dy).sqrt();
            let inside = if solid {
                distance <= radius
            } else {
                distance <= radius && distance >= radius - ring
            };
            if inside {
                img.put_pixel(x, y, color);
            }
        }
    }
}
