// Binary and grey-level morphology with disk structuring elements, and
// connected component labeling.
//
// Out-of-bounds neighbours are ignored throughout, so erosion does not eat
// into the image from its border.

use itertools::iproduct;
use ndarray::{Array2, ArrayView2, Zip};
use std::collections::VecDeque;

pub type StructuringElement = Vec<(isize, isize)>;

// Offsets of a digital disk of the given radius. Radius 0 is the identity.
pub fn disk(radius: usize) -> StructuringElement {
    let r = radius as isize;
    iproduct!(-r..=r, -r..=r)
        .filter(|(dx, dy)| dx * dx + dy * dy <= r * r)
        .collect()
}

#[inline]
pub fn neighbor(
    x: usize,
    y: usize,
    dx: isize,
    dy: isize,
    width: usize,
    height: usize,
) -> Option<(usize, usize)> {
    let nx = x as isize + dx;
    let ny = y as isize + dy;
    if nx < 0 || ny < 0 || nx >= width as isize || ny >= height as isize {
        None
    } else {
        Some((nx as usize, ny as usize))
    }
}

pub fn binary_erosion(mask: &Array2<bool>, se: &StructuringElement) -> Array2<bool> {
    let (w, h) = mask.dim();
    let mut out = Array2::from_elem((w, h), false);
    Zip::indexed(&mut out).par_for_each(|(x, y), o| {
        *o = se
            .iter()
            .filter_map(|&(dx, dy)| neighbor(x, y, dx, dy, w, h))
            .all(|(nx, ny)| mask[[nx, ny]]);
    });
    out
}

pub fn binary_dilation(mask: &Array2<bool>, se: &StructuringElement) -> Array2<bool> {
    let (w, h) = mask.dim();
    let mut out = Array2::from_elem((w, h), false);
    Zip::indexed(&mut out).par_for_each(|(x, y), o| {
        *o = se
            .iter()
            .filter_map(|&(dx, dy)| neighbor(x, y, dx, dy, w, h))
            .any(|(nx, ny)| mask[[nx, ny]]);
    });
    out
}

pub fn binary_opening(mask: &Array2<bool>, radius: usize) -> Array2<bool> {
    if radius == 0 {
        return mask.clone();
    }
    let se = disk(radius);
    binary_dilation(&binary_erosion(mask, &se), &se)
}

pub fn grey_erosion(image: ArrayView2<f32>, se: &StructuringElement) -> Array2<f32> {
    let (w, h) = image.dim();
    let mut out = Array2::zeros((w, h));
    Zip::indexed(&mut out).par_for_each(|(x, y), o| {
        *o = se
            .iter()
            .filter_map(|&(dx, dy)| neighbor(x, y, dx, dy, w, h))
            .map(|(nx, ny)| image[[nx, ny]])
            .fold(f32::INFINITY, f32::min);
    });
    out
}

pub fn grey_dilation(image: ArrayView2<f32>, se: &StructuringElement) -> Array2<f32> {
    let (w, h) = image.dim();
    let mut out = Array2::zeros((w, h));
    Zip::indexed(&mut out).par_for_each(|(x, y), o| {
        *o = se
            .iter()
            .filter_map(|&(dx, dy)| neighbor(x, y, dx, dy, w, h))
            .map(|(nx, ny)| image[[nx, ny]])
            .fold(f32::NEG_INFINITY, f32::max);
    });
    out
}

pub fn grey_opening(image: ArrayView2<f32>, radius: usize) -> Array2<f32> {
    let se = disk(radius);
    let eroded = grey_erosion(image, &se);
    grey_dilation(eroded.view(), &se)
}

// 8-connected neighbourhood, excluding the centre.
pub const NEIGHBORS8: [(isize, isize); 8] = [
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, -1),
    (0, 1),
    (1, -1),
    (1, 0),
    (1, 1),
];

#[derive(Clone, Debug)]
pub struct Component {
    pub area: usize,
    pub sum_x: f64,
    pub sum_y: f64,
}

impl Component {
    pub fn centroid(&self) -> (f32, f32) {
        (
            (self.sum_x / self.area as f64) as f32,
            (self.sum_y / self.area as f64) as f32,
        )
    }
}

// Label 8-connected foreground components. Labels start at 1 and follow the
// raster order (x outer, y inner) of each component's first pixel; component
// `i` in the returned vector has label `i + 1`.
pub fn label_components(mask: &Array2<bool>) -> (Array2<u32>, Vec<Component>) {
    let (w, h) = mask.dim();
    let mut labels = Array2::zeros((w, h));
    let mut components = Vec::new();
    let mut queue = VecDeque::new();

    for x in 0..w {
        for y in 0..h {
            if !mask[[x, y]] || labels[[x, y]] != 0 {
                continue;
            }

            let label = (components.len() + 1) as u32;
            let mut component = Component {
                area: 0,
                sum_x: 0.0,
                sum_y: 0.0,
            };
            labels[[x, y]] = label;
            queue.push_back((x, y));

            while let Some((cx, cy)) = queue.pop_front() {
                component.area += 1;
                component.sum_x += cx as f64;
                component.sum_y += cy as f64;

                for &(dx, dy) in NEIGHBORS8.iter() {
                    if let Some((nx, ny)) = neighbor(cx, cy, dx, dy, w, h) {
                        if mask[[nx, ny]] && labels[[nx, ny]] == 0 {
                            labels[[nx, ny]] = label;
                            queue.push_back((nx, ny));
                        }
                    }
                }
            }

            components.push(component);
        }
    }

    (labels, components)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square_mask(dim: (usize, usize), x0: usize, x1: usize, y0: usize, y1: usize) -> Array2<bool> {
        Array2::from_shape_fn(dim, |(x, y)| x >= x0 && x < x1 && y >= y0 && y < y1)
    }

    #[test]
    fn test_disk_sizes() {
        assert_eq!(disk(0), vec![(0, 0)]);
        assert_eq!(disk(1).len(), 5);
        assert_eq!(disk(2).len(), 13);
    }

    #[test]
    fn test_opening_removes_thin_bridge() {
        // two 6x6 squares joined by a one pixel wide bridge
        let mut mask = square_mask((20, 10), 1, 7, 2, 8);
        mask |= &square_mask((20, 10), 12, 18, 2, 8);
        mask |= &square_mask((20, 10), 7, 12, 5, 6);

        let (_, before) = label_components(&mask);
        assert_eq!(before.len(), 1);

        let opened = binary_opening(&mask, 1);
        let (_, after) = label_components(&opened);
        assert_eq!(after.len(), 2);
    }

    #[test]
    fn test_erosion_ignores_border() {
        let mask = Array2::from_elem((5, 5), true);
        let eroded = binary_erosion(&mask, &disk(1));
        assert!(eroded.iter().all(|&v| v));
    }

    #[test]
    fn test_grey_opening_removes_small_peak() {
        let mut image = Array2::from_elem((15, 15), 1.0_f32);
        image[[7, 7]] = 5.0;
        let opened = grey_opening(image.view(), 2);
        assert!(opened.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_label_components_order_and_stats() {
        let mut mask = square_mask((10, 10), 5, 7, 0, 2);
        mask |= &square_mask((10, 10), 0, 3, 6, 9);
        // diagonal contact joins under 8-connectivity
        mask[[7, 2]] = true;

        let (labels, components) = label_components(&mask);
        assert_eq!(components.len(), 2);
        assert_eq!(labels[[0, 6]], 1);
        assert_eq!(labels[[5, 0]], 2);
        assert_eq!(labels[[7, 2]], 2);
        assert_eq!(components[0].area, 9);
        assert_eq!(components[1].area, 5);
        assert_eq!(components[0].centroid(), (1.0, 7.0));
        assert_eq!(labels[[9, 9]], 0);
    }
}
