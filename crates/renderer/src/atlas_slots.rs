use model::TextureSlot;

/// Free list of atlas slots across texture array layers.
///
/// Each slot carries a generation that advances on release, so a handle kept
/// past its release no longer matches.
#[derive(Debug, Clone)]
pub struct AtlasSlotAllocator {
    layers: u32,
    slots_per_layer: u32,
    free_slots: Vec<(u32, u16)>,
    generations: Vec<u32>,
}

impl AtlasSlotAllocator {
    pub fn new(layers: u32, slots_per_layer: u32) -> Self {
        assert!(layers > 0, "atlas must have at least one layer");
        assert!(
            slots_per_layer > 0 && slots_per_layer <= u32::from(u16::MAX) + 1,
            "slots_per_layer {slots_per_layer} does not fit a u16 slot index"
        );
        let capacity = (layers as usize)
            .checked_mul(slots_per_layer as usize)
            .expect("atlas slot capacity overflow");
        let mut allocator = Self {
            layers,
            slots_per_layer,
            free_slots: Vec::with_capacity(capacity),
            generations: vec![0; capacity],
        };
        allocator.refill_free_slots();
        allocator
    }

    fn refill_free_slots(&mut self) {
        self.free_slots.clear();
        for layer in (0..self.layers).rev() {
            for index in (0..self.slots_per_layer).rev() {
                let index: u16 = index
                    .try_into()
                    .expect("slot index checked against u16 at construction");
                self.free_slots.push((layer, index));
            }
        }
    }

    fn generation_index(&self, layer: u32, index: u16) -> Option<usize> {
        if layer >= self.layers || u32::from(index) >= self.slots_per_layer {
            return None;
        }
        Some(layer as usize * self.slots_per_layer as usize + index as usize)
    }

    pub fn capacity(&self) -> usize {
        self.generations.len()
    }

    pub fn free_count(&self) -> usize {
        self.free_slots.len()
    }

    pub fn allocate(&mut self) -> Option<TextureSlot> {
        let (layer, index) = self.free_slots.pop()?;
        let generation_index = self
            .generation_index(layer, index)
            .expect("free list holds out-of-range slot");
        Some(TextureSlot {
            layer,
            index,
            generation: self.generations[generation_index],
        })
    }

    /// Returns `false` for a stale or foreign slot, which is ignored.
    pub fn release(&mut self, slot: TextureSlot) -> bool {
        if !self.is_current(slot) {
            return false;
        }
        let generation_index = self
            .generation_index(slot.layer, slot.index)
            .expect("current slot is in range");
        self.generations[generation_index] = self.generations[generation_index].wrapping_add(1);
        self.free_slots.push((slot.layer, slot.index));
        true
    }

    pub fn is_current(&self, slot: TextureSlot) -> bool {
        self.generation_index(slot.layer, slot.index)
            .is_some_and(|generation_index| self.generations[generation_index] == slot.generation)
    }

    /// Frees every slot and invalidates all outstanding handles.
    pub fn reset(&mut self) {
        for generation in &mut self.generations {
            *generation = generation.wrapping_add(1);
        }
        self.refill_free_slots();
    }
}
