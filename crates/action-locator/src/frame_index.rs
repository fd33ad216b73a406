//! Global match indices over the scoped frames.
//!
//! Built once per invocation from the per-frame summaries. Every call site
//! that translates between a global index and `(frame, local index)` goes
//! through this structure.

use serde::Serialize;
use soulact_core_types::FrameCdpId;

/// Per-frame match summary as produced by the summary operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameSummary {
    pub frame_id: FrameCdpId,
    pub raw_count: usize,
    pub first_visible_index: Option<usize>,
    pub visible_count: usize,
    /// The frame's world could not be evaluated; counts are zero.
    pub skipped: bool,
}

impl FrameSummary {
    pub fn new(frame_id: FrameCdpId, raw_count: usize, first_visible_index: Option<usize>) -> Self {
        Self {
            frame_id,
            raw_count,
            first_visible_index,
            visible_count: usize::from(first_visible_index.is_some()),
            skipped: false,
        }
    }

    pub fn skipped(frame_id: FrameCdpId) -> Self {
        Self {
            frame_id,
            raw_count: 0,
            first_visible_index: None,
            visible_count: 0,
            skipped: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    summary: FrameSummary,
    offset: usize,
}

/// Frame-tree-ordered summaries with cumulative offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameIndex {
    slots: Vec<Slot>,
    match_count: usize,
}

impl FrameIndex {
    pub fn new(summaries: Vec<FrameSummary>) -> Self {
        let mut offset = 0;
        let mut slots = Vec::with_capacity(summaries.len());
        for summary in summaries {
            let raw = summary.raw_count;
            slots.push(Slot { summary, offset });
            offset += raw;
        }
        Self {
            slots,
            match_count: offset,
        }
    }

    /// Sum of raw counts over all scoped frames.
    pub fn match_count(&self) -> usize {
        self.match_count
    }

    pub fn visible_count(&self) -> usize {
        self.slots.iter().map(|slot| slot.summary.visible_count).sum()
    }

    pub fn frames_scanned(&self) -> usize {
        self.slots.len()
    }

    pub fn skipped_frames(&self) -> Vec<FrameCdpId> {
        self.slots
            .iter()
            .filter(|slot| slot.summary.skipped)
            .map(|slot| slot.summary.frame_id.clone())
            .collect()
    }

    pub fn summaries(&self) -> impl Iterator<Item = &FrameSummary> {
        self.slots.iter().map(|slot| &slot.summary)
    }

    /// Frames with at least one match, paired with their offsets.
    pub fn populated(&self) -> impl Iterator<Item = (&FrameSummary, usize)> {
        self.slots
            .iter()
            .filter(|slot| slot.summary.raw_count > 0)
            .map(|slot| (&slot.summary, slot.offset))
    }

    pub fn offset_of(&self, frame: &FrameCdpId) -> Option<usize> {
        self.slots
            .iter()
            .find(|slot| &slot.summary.frame_id == frame)
            .map(|slot| slot.offset)
    }

    /// `(frame, local index)` for a global index.
    pub fn locate(&self, global: usize) -> Option<(FrameCdpId, usize)> {
        if global >= self.match_count {
            return None;
        }
        self.slots
            .iter()
            .find(|slot| global >= slot.offset && global < slot.offset + slot.summary.raw_count)
            .map(|slot| (slot.summary.frame_id.clone(), global - slot.offset))
    }

    /// Inverse of [`FrameIndex::locate`].
    pub fn global_index(&self, frame: &FrameCdpId, local: usize) -> Option<usize> {
        self.slots
            .iter()
            .find(|slot| &slot.summary.frame_id == frame)
            .filter(|slot| local < slot.summary.raw_count)
            .map(|slot| slot.offset + local)
    }

    /// First visible match in frame-tree order.
    pub fn first_visible(&self) -> Option<usize> {
        self.slots.iter().find_map(|slot| {
            slot.summary
                .first_visible_index
                .map(|local| slot.offset + local)
        })
    }
}
