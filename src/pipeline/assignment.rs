use super::decoding::{DecodeFlag, DecodedSpot};
use super::segmentation::LabelMask;

#[derive(Clone, Debug, PartialEq)]
pub struct ResultRecord {
    pub spot_id: usize,
    pub x: f32,
    pub y: f32,
    pub radius: f32,
    pub code: Option<String>,
    pub gene: Option<String>,
    pub quality: f32,

    // 0 when the spot is not inside any cell
    pub cell: u32,

    pub flag: Option<DecodeFlag>,
}

// Attach to each decoded spot the label under its rounded position.
pub fn assign(decoded: &[DecodedSpot], mask: &LabelMask) -> Vec<ResultRecord> {
    decoded
        .iter()
        .map(|spot| ResultRecord {
            spot_id: spot.spot_id,
            x: spot.x,
            y: spot.y,
            radius: spot.radius,
            code: spot.code.clone(),
            gene: spot.gene.clone(),
            quality: spot.quality,
            cell: cell_at(mask, spot.x, spot.y),
            flag: spot.flag,
        })
        .collect()
}

fn cell_at(mask: &LabelMask, x: f32, y: f32) -> u32 {
    let (x, y) = (x.round(), y.round());
    if !(x >= 0.0 && y >= 0.0) {
        return 0;
    }
    mask.get(x as usize, y as usize)
}
