use crate::element::Endpoint;

/// Generation-checked handle to one endpoint element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId {
    index: u32,
    generation: u32,
}

struct Slot {
    generation: u32,
    endpoint: Option<Endpoint>,
}

/// Stable storage for endpoint elements: slots addressed by a dense index
/// plus a generation counter. A stale [`EndpointId`] held after
/// unpublish/unsubscribe simply fails to resolve instead of touching
/// reused memory.
#[derive(Default)]
pub(crate) struct Arena {
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Arena {
    pub(crate) fn insert(&mut self, endpoint: Endpoint) -> EndpointId {
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.endpoint = Some(endpoint);
                EndpointId { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, endpoint: Some(endpoint) });
                EndpointId { index, generation: 0 }
            }
        }
    }

    pub(crate) fn get(&self, id: EndpointId) -> Option<&Endpoint> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.endpoint.as_ref()
    }

    pub(crate) fn get_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.endpoint.as_mut()
    }

    /// Frees the slot and bumps its generation so the id is dead.
    pub(crate) fn remove(&mut self, id: EndpointId) -> Option<Endpoint> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let endpoint = slot.endpoint.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        Some(endpoint)
    }
}
