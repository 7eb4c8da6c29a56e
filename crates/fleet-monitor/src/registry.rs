use std::collections::{HashMap, HashSet};

use fleet_core::{Entity, TaskState};

/// Ordered entity list plus one [`TaskState`] per entity id.
#[derive(Debug, Default, Clone)]
pub struct EntityRegistry {
    entities: Vec<Entity>,
    states: HashMap<String, TaskState>,
}

/// What a reload did to the registry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RegistryReload {
    pub kept: usize,
    pub added: usize,
    pub dropped: usize,
    pub duplicates: usize,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the entity list. Ids present before keep their state, new ids
    /// start as ready, and ids no longer listed are forgotten. Repeated ids
    /// keep their first occurrence.
    pub fn replace(&mut self, entities: Vec<Entity>) -> RegistryReload {
        let mut report = RegistryReload::default();
        let mut seen = HashSet::with_capacity(entities.len());
        let mut next_entities = Vec::with_capacity(entities.len());
        let mut next_states = HashMap::with_capacity(entities.len());

        for entity in entities {
            if !seen.insert(entity.id.clone()) {
                report.duplicates += 1;
                continue;
            }
            let state = match self.states.remove(&entity.id) {
                Some(state) => {
                    report.kept += 1;
                    state
                }
                None => {
                    report.added += 1;
                    TaskState::ready()
                }
            };
            next_states.insert(entity.id.clone(), state);
            next_entities.push(entity);
        }

        report.dropped = self.states.len();
        self.entities = next_entities;
        self.states = next_states;
        report
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.states.contains_key(id)
    }

    pub fn state(&self, id: &str) -> Option<&TaskState> {
        self.states.get(id)
    }

    pub fn state_mut(&mut self, id: &str) -> Option<&mut TaskState> {
        self.states.get_mut(id)
    }

    pub fn states_mut(&mut self) -> impl Iterator<Item = &mut TaskState> {
        self.states.values_mut()
    }

    pub fn reset_all(&mut self, state: &TaskState) {
        for slot in self.states.values_mut() {
            *slot = state.clone();
        }
    }

    /// Entities in load order with their current state.
    pub fn iter(&self) -> impl Iterator<Item = (&Entity, &TaskState)> {
        self.entities
            .iter()
            .filter_map(|entity| self.states.get(&entity.id).map(|state| (entity, state)))
    }
}
