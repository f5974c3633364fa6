// Marker controlled watershed segmentation of cells from a nuclear stain
// (markers) and a cytoplasmic stain (foreground mask).

use kiddo::float::kdtree::KdTree;
use kiddo::SquaredEuclidean;
use ndarray::{Array2, ArrayView2, Zip};
use petgraph::unionfind::UnionFind;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

use super::morphology::{binary_opening, label_components, neighbor, Component, NEIGHBORS8};
use super::PipelineError;

// Integer chamfer steps approximating euclidean distance on the pixel grid.
const ORTHOGONAL_STEP: u32 = 5;
const DIAGONAL_STEP: u32 = 7;

#[derive(Clone, Debug)]
pub struct SegmentationParams {
    // markers are pixels strictly above this
    pub nuclear_threshold: f32,

    // foreground is pixels at or above this
    pub cyto_threshold: f32,

    // inclusive bounds on marker area
    pub size_limits: (usize, usize),

    // opening radii for markers and mask, 0 to skip
    pub marker_disk_size: usize,
    pub mask_disk_size: usize,

    // markers with centroids closer than this are merged
    pub min_marker_distance: Option<f32>,
}

impl Default for SegmentationParams {
    fn default() -> Self {
        SegmentationParams {
            nuclear_threshold: 0.16,
            cyto_threshold: 0.22,
            size_limits: (10, 10000),
            marker_disk_size: 0,
            mask_disk_size: 0,
            min_marker_distance: Some(57.0),
        }
    }
}

/// Per-pixel cell labels, 0 for background and 1..=n_labels for cells.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelMask {
    labels: Array2<u32>,
    n_labels: u32,
}

impl LabelMask {
    #[cfg(test)]
    pub fn from_labels(labels: Array2<u32>) -> Self {
        let n_labels = labels.iter().copied().max().unwrap_or(0);
        LabelMask { labels, n_labels }
    }

    pub fn background(dim: (usize, usize)) -> Self {
        LabelMask {
            labels: Array2::zeros(dim),
            n_labels: 0,
        }
    }

    // Label at (x, y), 0 outside the image.
    pub fn get(&self, x: usize, y: usize) -> u32 {
        self.labels.get([x, y]).copied().unwrap_or(0)
    }

    pub fn n_labels(&self) -> u32 {
        self.n_labels
    }

    pub fn labels(&self) -> &Array2<u32> {
        &self.labels
    }

    // Pixel count of each cell, indexed by label - 1.
    pub fn areas(&self) -> Vec<usize> {
        let mut areas = vec![0; self.n_labels as usize];
        for &label in self.labels.iter().filter(|&&l| l > 0) {
            areas[label as usize - 1] += 1;
        }
        areas
    }
}

pub fn segment(
    nuclear: ArrayView2<f32>,
    cytoplasmic: ArrayView2<f32>,
    params: &SegmentationParams,
) -> Result<LabelMask, PipelineError> {
    super::check_shape("cytoplasmic image", nuclear.dim(), cytoplasmic.dim())?;
    if params.size_limits.0 > params.size_limits.1 {
        return Err(PipelineError::InvalidParameter(format!(
            "size limits must satisfy min <= max, got {:?}",
            params.size_limits
        )));
    }

    let seeds = nuclear.mapv(|v| v > params.nuclear_threshold);
    let foreground = cytoplasmic.mapv(|v| v >= params.cyto_threshold);

    let mut seeds = binary_opening(&seeds, params.marker_disk_size);
    let mut mask = binary_opening(&(&foreground | &seeds), params.mask_disk_size);
    seeds &= &mask;

    let (components_labels, components) = label_components(&seeds);
    if components.is_empty() {
        return Ok(LabelMask::background(nuclear.dim()));
    }

    let groups = merge_close_markers(&components, params.min_marker_distance);
    let component_label = relabel_groups(&components, &groups, params.size_limits);
    let n_labels = component_label.iter().copied().max().unwrap_or(0);
    if n_labels == 0 {
        return Ok(LabelMask::background(nuclear.dim()));
    }

    let markers = components_labels.mapv(|l| {
        if l == 0 {
            0
        } else {
            component_label[l as usize - 1]
        }
    });

    // Markers rejected by the size limits stay background rather than being
    // flooded from a neighbouring cell.
    Zip::from(&mut mask)
        .and(&components_labels)
        .and(&markers)
        .for_each(|m, &component, &marker| {
            if component > 0 && marker == 0 {
                *m = false;
            }
        });

    Ok(LabelMask {
        labels: watershed(&markers, &mask),
        n_labels,
    })
}

// Union components whose centroids are closer than `min_distance`. Returns
// the group representative of each component.
fn merge_close_markers(components: &[Component], min_distance: Option<f32>) -> Vec<usize> {
    let n = components.len();
    let mut groups = UnionFind::new(n);

    if let Some(min_distance) = min_distance.filter(|&d| d > 0.0) {
        let centroids: Vec<[f32; 2]> = components
            .iter()
            .map(|c| {
                let (x, y) = c.centroid();
                [x, y]
            })
            .collect();

        let mut kdtree: KdTree<f32, u32, 2, 32, u32> = KdTree::with_capacity(n);
        for (i, centroid) in centroids.iter().enumerate() {
            kdtree.add(centroid, i as u32);
        }

        let d2 = min_distance * min_distance;
        for (i, centroid) in centroids.iter().enumerate() {
            for neighbor in kdtree.within_unsorted::<SquaredEuclidean>(centroid, d2) {
                let j = neighbor.item as usize;
                if j != i && neighbor.distance < d2 {
                    groups.union(i, j);
                }
            }
        }
    }

    (0..n).map(|i| groups.find_mut(i)).collect()
}

// Assign labels 1..n to groups within the size limits, in order of each
// group's first pixel. Components of dropped groups get 0.
fn relabel_groups(
    components: &[Component],
    groups: &[usize],
    size_limits: (usize, usize),
) -> Vec<u32> {
    let mut group_area = vec![0; components.len()];
    for (component, &group) in components.iter().zip(groups) {
        group_area[group] += component.area;
    }

    let mut group_label = vec![0; components.len()];
    let mut next_label = 1;
    groups
        .iter()
        .map(|&group| {
            let area = group_area[group];
            if area < size_limits.0 || area > size_limits.1 {
                return 0;
            }
            if group_label[group] == 0 {
                group_label[group] = next_label;
                next_label += 1;
            }
            group_label[group]
        })
        .collect()
}

// Flood labels outward from the markers over the mask, each pixel going to
// the marker with the smallest chamfer distance, and the smallest label among
// equally distant markers.
fn watershed(markers: &Array2<u32>, mask: &Array2<bool>) -> Array2<u32> {
    let (w, h) = markers.dim();
    let mut labels = Array2::<u32>::zeros((w, h));
    let mut cost = Array2::from_elem((w, h), u32::MAX);
    let mut queue = BinaryHeap::new();

    for ((x, y), &label) in markers.indexed_iter() {
        if label > 0 && mask[[x, y]] {
            labels[[x, y]] = label;
            cost[[x, y]] = 0;
            queue.push(Reverse((0, label, x, y)));
        }
    }

    while let Some(Reverse((c, label, x, y))) = queue.pop() {
        // stale entry, the pixel has since been claimed more cheaply
        if c != cost[[x, y]] || label != labels[[x, y]] {
            continue;
        }

        for &(dx, dy) in NEIGHBORS8.iter() {
            let Some((nx, ny)) = neighbor(x, y, dx, dy, w, h) else {
                continue;
            };
            if !mask[[nx, ny]] {
                continue;
            }

            let step = if dx == 0 || dy == 0 {
                ORTHOGONAL_STEP
            } else {
                DIAGONAL_STEP
            };
            let nc = c + step;
            let current = cost[[nx, ny]];
            if nc < current || (nc == current && label < labels[[nx, ny]]) {
                cost[[nx, ny]] = nc;
                labels[[nx, ny]] = label;
                queue.push(Reverse((nc, label, nx, ny)));
            }
        }
    }

    labels
}
