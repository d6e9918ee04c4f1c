//! Upstream URL templates.
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `{z}`       | zoom minus the layer's upstream zoom offset |
//! | `{x}`       | column |
//! | `{y}`       | row, counted from the north |
//! | `{-y}`      | row, counted from the south (TMS) |
//! | `{q}`       | Bing quadkey |
//! | `{bbox}`    | tile bounds in EPSG:3857, `min_x,min_y,max_x,max_y` |
//! | `{width}`, `{height}` | tile size in pixels |
//! | `{proj}`    | `EPSG:3857` |
//!
//! The WMS-style placeholders let a plain WMS GetMap URL act as a tile
//! source.

use crate::grid::{bounds_for, quadkey, Crs, TileAddress, TILE_SIZE};

/// Every placeholder a template may contain.
pub const PLACEHOLDERS: &[&str] = &[
    "{z}", "{x}", "{y}", "{-y}", "{q}", "{bbox}", "{width}", "{height}", "{proj}",
];

/// Placeholders that identify a tile; a template needs at least one.
const ADDRESSING_PLACEHOLDERS: &[&str] = &["{x}", "{y}", "{-y}", "{q}", "{bbox}"];

/// Check that every `{...}` token is a known placeholder and that the
/// template addresses individual tiles.
pub fn validate(template: &str) -> Result<(), String> {
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let after = &rest[start..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in {template:?}"))?;
        let token = &after[..=end];
        if !PLACEHOLDERS.contains(&token) {
            return Err(format!("unknown placeholder {token} in {template:?}"));
        }
        rest = &after[end + 1..];
    }
    if !ADDRESSING_PLACEHOLDERS
        .iter()
        .any(|placeholder| template.contains(placeholder))
    {
        return Err(format!("{template:?} does not reference a tile"));
    }
    Ok(())
}

/// Substitute the placeholders of `template` for one tile.
pub fn expand(template: &str, address: &TileAddress, zoom_offset: u8) -> String {
    let zoom = address.zoom.saturating_sub(zoom_offset);
    let mut url = template
        .replace("{z}", &zoom.to_string())
        .replace("{x}", &address.column.to_string())
        .replace("{-y}", &address.tms_row().to_string())
        .replace("{y}", &address.row.to_string());

    if url.contains("{q}") {
        url = url.replace("{q}", &quadkey(zoom, address.column, address.row));
    }
    if url.contains("{bbox}") {
        let bounds = bounds_for(address);
        let (min_x, min_y) = Crs::Epsg3857.from_geographic(bounds.min_lon, bounds.min_lat);
        let (max_x, max_y) = Crs::Epsg3857.from_geographic(bounds.max_lon, bounds.max_lat);
        url = url.replace("{bbox}", &format!("{min_x},{min_y},{max_x},{max_y}"));
    }
    url.replace("{width}", &TILE_SIZE.to_string())
        .replace("{height}", &TILE_SIZE.to_string())
        .replace("{proj}", Crs::Epsg3857.code())
}
