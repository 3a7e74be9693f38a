//! Atomic group resolution from host labels.

use std::collections::{BTreeMap, BTreeSet};

use dronegrid_state::{AtomicGroupId, HostQueueEntry, Label, LabelId};
use tracing::error;

/// Derives the atomic group implied by a set of labels.
#[derive(Debug, Clone, Copy)]
pub struct AtomicGroupResolver<'a> {
    labels: &'a BTreeMap<LabelId, Label>,
}

impl<'a> AtomicGroupResolver<'a> {
    pub fn new(labels: &'a BTreeMap<LabelId, Label>) -> Self {
        Self { labels }
    }

    /// The atomic group a host carrying `label_ids` belongs to.
    ///
    /// Labels that imply two different groups are a configuration anomaly:
    /// the group of the lowest-id atomic label wins and an error is logged
    /// naming `entry`. Unknown label ids are ignored.
    pub fn get_host_atomic_group_id(
        &self,
        label_ids: &BTreeSet<LabelId>,
        entry: &HostQueueEntry,
    ) -> Option<AtomicGroupId> {
        let atomic_labels: Vec<&Label> = label_ids
            .iter()
            .filter_map(|id| self.labels.get(id))
            .filter(|label| label.atomic_group_id.is_some())
            .collect();

        let first = atomic_labels.first()?.atomic_group_id;
        let distinct: BTreeSet<AtomicGroupId> = atomic_labels
            .iter()
            .filter_map(|label| label.atomic_group_id)
            .collect();
        if distinct.len() > 1 {
            let names: Vec<&str> = atomic_labels.iter().map(|l| l.name.as_str()).collect();
            error!(
                %entry,
                labels = ?names,
                groups = ?distinct,
                chosen = ?first,
                "more than one atomic group implied by host labels"
            );
        }
        first
    }

    /// Valid labels tied to `group_id`, in ascending label id order.
    pub fn labels_for_group(&self, group_id: AtomicGroupId) -> Vec<LabelId> {
        self.labels
            .values()
            .filter(|label| label.atomic_group_id == Some(group_id) && !label.invalid)
            .map(|label| label.id)
            .collect()
    }
}
