use serde::Serialize;

use crate::report::{EvidenceMarker, Region};

/// On-screen rectangle for one projected marker, in the same unit as the
/// rendered dimensions passed to the projection (pixels or percent).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProjectedRect {
    pub top: f64,
    pub left: f64,
    pub width: f64,
    pub height: f64,
}

/// Maps a canvas-normalized region onto a rendered image of the given
/// dimensions. Pure; the caller supplies the rendered size explicitly.
pub fn project_region(region: &Region, rendered_width: f64, rendered_height: f64) -> ProjectedRect {
    ProjectedRect {
        top: region.y_min / Region::CANVAS * rendered_height,
        left: region.x_min / Region::CANVAS * rendered_width,
        width: (region.x_max - region.x_min) / Region::CANVAS * rendered_width,
        height: (region.y_max - region.y_min) / Region::CANVAS * rendered_height,
    }
}

/// The same box as percentages of the rendered dimensions. Raw canvas
/// values divide by 10, which is the exact scale the marker coordinates
/// use.
pub fn region_percentages(region: &Region) -> ProjectedRect {
    project_region(region, 100.0, 100.0)
}

/// Projects every marker in report order. Markers are independent and may
/// overlap; order is the rendering order.
pub fn project_markers(
    markers: &[EvidenceMarker],
    rendered_width: f64,
    rendered_height: f64,
) -> Vec<ProjectedRect> {
    markers
        .iter()
        .map(|marker| project_region(&marker.region, rendered_width, rendered_height))
        .collect()
}

/// Exclusive marker selection: at most one marker is active at a time,
/// and activating another deactivates the previous one. Derived UI state
/// only; never touches the report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerSelection {
    active: Option<usize>,
}

impl MarkerSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&mut self, index: usize) {
        self.active = Some(index);
    }

    pub fn clear(&mut self) {
        self.active = None;
    }

    /// Activate on first call, clear when the same marker is poked again.
    pub fn toggle(&mut self, index: usize) {
        if self.active == Some(index) {
            self.active = None;
        } else {
            self.active = Some(index);
        }
    }

    pub fn active(&self) -> Option<usize> {
        self.active
    }

    pub fn is_active(&self, index: usize) -> bool {
        self.active == Some(index)
    }
}
