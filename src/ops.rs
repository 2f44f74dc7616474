// Copyright 2025 Strata ECS contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Archetype operation table.
//!
//! Built once at archetype creation from the registry, so the hot path never
//! touches the registry again: per column the id, size and resolved hook
//! pointers, plus index lists of the columns that actually carry each hook.
//! Trivial hooks are `None` and get branched on once per (archetype, op)
//! instead of once per element.

use rustc_hash::FxHashMap;

use crate::component::{ComponentId, FunctionSet};
use crate::mask::ComponentMask;
use crate::registry;

pub(crate) struct ColumnOp {
    pub id: ComponentId,
    pub size: usize,
    pub align: usize,
    pub name: String,
    pub functions: FunctionSet,
}

pub(crate) struct OperationTable {
    /// One entry per component column, ordered by ascending component id
    pub columns: Vec<ColumnOp>,
    pub index_of: FxHashMap<ComponentId, usize>,
    /// Columns with a default-construct hook
    pub ctor_list: Vec<usize>,
    /// Columns with a destructor
    pub dtor_list: Vec<usize>,
    /// Columns with a before-remove hook
    pub before_remove_list: Vec<usize>,
    /// Columns with an after-assign hook
    pub after_assign_list: Vec<usize>,
    /// Component payload bytes per entity, entity handle included
    pub bytes_per_entity: usize,
    /// Largest single component size (batch sizing)
    pub max_component_size: usize,
}

impl OperationTable {
    pub fn new(mask: &ComponentMask) -> Self {
        let mut columns = Vec::with_capacity(mask.count());
        let mut index_of = FxHashMap::default();
        let mut ctor_list = Vec::new();
        let mut dtor_list = Vec::new();
        let mut before_remove_list = Vec::new();
        let mut after_assign_list = Vec::new();
        let mut bytes_per_entity = std::mem::size_of::<crate::entity::Entity>();
        let mut max_component_size = 0;

        for id in mask.ones() {
            let index = columns.len();
            let column = registry::with_component_info(id, |info| ColumnOp {
                id,
                size: info.size,
                align: info.align,
                name: info.name.clone(),
                functions: info.functions,
            });
            if column.functions.ctor.is_some() {
                ctor_list.push(index);
            }
            if column.functions.dtor.is_some() {
                dtor_list.push(index);
            }
            if column.functions.before_remove.is_some() {
                before_remove_list.push(index);
            }
            if column.functions.after_assign.is_some() {
                after_assign_list.push(index);
            }
            bytes_per_entity += column.size;
            max_component_size = max_component_size.max(column.size);
            index_of.insert(id, index);
            columns.push(column);
        }

        Self {
            columns,
            index_of,
            ctor_list,
            dtor_list,
            before_remove_list,
            after_assign_list,
            bytes_per_entity,
            max_component_size,
        }
    }

    pub fn component_index(&self, id: ComponentId) -> Option<usize> {
        self.index_of.get(&id).copied()
    }

    pub fn num_components(&self) -> usize {
        self.columns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, TypeDescriptor};

    #[derive(Default)]
    struct Plain(#[allow(dead_code)] u64);
    impl Component for Plain {
        fn descriptor() -> TypeDescriptor {
            TypeDescriptor::builder::<Self>().with_default().finish()
        }
    }

    struct Boxed(#[allow(dead_code)] Box<u32>);
    impl Component for Boxed {}

    #[test]
    fn test_table_layout() {
        let plain = registry::register_component::<Plain>();
        let boxed = registry::register_component::<Boxed>();
        let mask = ComponentMask::from_ids(&[plain, boxed]);
        let table = OperationTable::new(&mask);

        assert_eq!(table.num_components(), 2);
        let plain_index = table.component_index(plain).unwrap();
        let boxed_index = table.component_index(boxed).unwrap();
        assert_eq!(table.columns[plain_index].id, plain);

        // Plain has a default ctor but no drop; Boxed the reverse
        assert!(table.ctor_list.contains(&plain_index));
        assert!(!table.ctor_list.contains(&boxed_index));
        assert!(table.dtor_list.contains(&boxed_index));
        assert!(!table.dtor_list.contains(&plain_index));

        assert_eq!(
            table.bytes_per_entity,
            std::mem::size_of::<crate::entity::Entity>()
                + std::mem::size_of::<Plain>()
                + std::mem::size_of::<Boxed>()
        );
    }

    #[test]
    fn test_columns_ordered_by_id() {
        let plain = registry::register_component::<Plain>();
        let boxed = registry::register_component::<Boxed>();
        let mask = ComponentMask::from_ids(&[boxed, plain]);
        let table = OperationTable::new(&mask);
        let ids: Vec<u32> = table.columns.iter().map(|c| c.id.index()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }
}
