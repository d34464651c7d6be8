use std::collections::BTreeMap;

use strum::IntoEnumIterator;

use super::{Credits, TaskKind};

/// Per-sub-job price for every task kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceTable {
    unit_costs: BTreeMap<TaskKind, Credits>,
}

impl PriceTable {
    pub fn new(unit_costs: BTreeMap<TaskKind, Credits>) -> Self {
        let mut table = Self::default();
        table.unit_costs.extend(unit_costs);
        table
    }

    pub fn default_unit_cost(kind: TaskKind) -> Credits {
        match kind {
            TaskKind::VideoBalance => 5,
            TaskKind::VideoPro6 => 8,
            TaskKind::VideoPro10 => 12,
            TaskKind::VideoSuper6 => 10,
            _ => 1,
        }
    }

    pub fn unit_cost(&self, kind: TaskKind) -> Credits {
        self.unit_costs
            .get(&kind)
            .copied()
            .unwrap_or_else(|| Self::default_unit_cost(kind))
    }

    pub fn with_unit_cost(mut self, kind: TaskKind, cost: Credits) -> Self {
        self.unit_costs.insert(kind, cost);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (TaskKind, Credits)> + '_ {
        self.unit_costs.iter().map(|(kind, cost)| (*kind, *cost))
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            unit_costs: TaskKind::iter()
                .map(|kind| (kind, Self::default_unit_cost(kind)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_every_kind() {
        let table = PriceTable::default();
        assert_eq!(table.iter().count(), TaskKind::iter().count());
        assert_eq!(table.unit_cost(TaskKind::PhotoScene), 1);
        assert_eq!(table.unit_cost(TaskKind::VideoPro10), 12);
    }

    #[test]
    fn overrides_replace_single_entries() {
        let table = PriceTable::default().with_unit_cost(TaskKind::PhotoCustom, 3);
        assert_eq!(table.unit_cost(TaskKind::PhotoCustom), 3);
        assert_eq!(table.unit_cost(TaskKind::PhotoPose), 1);
    }
}
