use std::collections::HashMap;

use glam::Vec2;

use crate::world::EntityHandle;

/// Uniform spatial hash for interest management. Cells are keyed by the
/// full signed `(row, col)` pair, so negative coordinates cannot alias the
/// way a truncated hash would.
pub struct InterestGrid {
    cell_size: f32,
    cells: HashMap<(i32, i32), Vec<EntityHandle>>,
    entity_cells: HashMap<EntityHandle, (i32, i32)>,
}

impl InterestGrid {
    pub fn new(cell_size: f32) -> Self {
        assert!(cell_size > 0.0);
        Self {
            cell_size,
            cells: HashMap::new(),
            entity_cells: HashMap::new(),
        }
    }

    fn cell_of(&self, position: Vec2) -> (i32, i32) {
        (
            (position.x / self.cell_size).floor() as i32,
            (position.y / self.cell_size).floor() as i32,
        )
    }

    pub fn add_or_update(&mut self, entity: EntityHandle, position: Vec2) {
        let cell = self.cell_of(position);
        if let Some(&previous) = self.entity_cells.get(&entity) {
            if previous == cell {
                return;
            }
            if let Some(members) = self.cells.get_mut(&previous) {
                members.retain(|e| *e != entity);
                if members.is_empty() {
                    self.cells.remove(&previous);
                }
            }
        }
        self.cells.entry(cell).or_default().push(entity);
        self.entity_cells.insert(entity, cell);
    }

    pub fn remove(&mut self, entity: EntityHandle) {
        if let Some(cell) = self.entity_cells.remove(&entity) {
            if let Some(members) = self.cells.get_mut(&cell) {
                members.retain(|e| *e != entity);
                if members.is_empty() {
                    self.cells.remove(&cell);
                }
            }
        }
    }

    /// Unions the 3x3 neighborhood around the entity's cell into `out` and
    /// returns the count. Panics when the entity was never registered —
    /// callers feed the grid through the replication pipeline before
    /// querying, and silently returning nothing would hide that bug.
    pub fn entities_of_interest(&self, entity: EntityHandle, out: &mut Vec<EntityHandle>) -> usize {
        let Some(&(row, col)) = self.entity_cells.get(&entity) else {
            panic!("interest query for unregistered entity {:?}", entity);
        };

        out.clear();
        for dr in -1..=1 {
            for dc in -1..=1 {
                if let Some(members) = self.cells.get(&(row + dr, col + dc)) {
                    out.extend(members.iter().copied());
                }
            }
        }
        out.len()
    }

    pub fn contains(&self, entity: EntityHandle) -> bool {
        self.entity_cells.contains_key(&entity)
    }

    pub fn len(&self) -> usize {
        self.entity_cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_cells.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::EntityStore;

    fn spawn_at(store: &mut EntityStore, grid: &mut InterestGrid, x: f32, y: f32) -> EntityHandle {
        let entity = store.spawn();
        grid.add_or_update(entity, Vec2::new(x, y));
        entity
    }

    #[test]
    fn neighbors_within_one_cell_ring() {
        let mut store = EntityStore::new();
        let mut grid = InterestGrid::new(10.0);

        let observer = spawn_at(&mut store, &mut grid, 0.0, 0.0);
        let same_cell = spawn_at(&mut store, &mut grid, 5.0, 5.0);
        let adjacent = spawn_at(&mut store, &mut grid, 14.0, 14.0);
        let far = spawn_at(&mut store, &mut grid, 25.0, 25.0);

        let mut interest = Vec::new();
        let count = grid.entities_of_interest(observer, &mut interest);

        assert_eq!(count, interest.len());
        assert!(interest.contains(&same_cell));
        assert!(interest.contains(&adjacent));
        assert!(!interest.contains(&far));
    }

    #[test]
    fn negative_coordinates_do_not_alias() {
        let mut store = EntityStore::new();
        let mut grid = InterestGrid::new(10.0);

        let observer = spawn_at(&mut store, &mut grid, -5.0, -5.0);
        let adjacent = spawn_at(&mut store, &mut grid, -14.0, -14.0);
        let mirrored = spawn_at(&mut store, &mut grid, 5.0, 5.0);
        let far_negative = spawn_at(&mut store, &mut grid, -25.0, -25.0);

        let mut interest = Vec::new();
        grid.entities_of_interest(observer, &mut interest);

        assert!(interest.contains(&adjacent));
        assert!(interest.contains(&mirrored)); // (-1,-1) borders (0,0)
        assert!(!interest.contains(&far_negative));
    }

    #[test]
    fn moving_between_cells_updates_membership() {
        let mut store = EntityStore::new();
        let mut grid = InterestGrid::new(10.0);

        let observer = spawn_at(&mut store, &mut grid, 0.0, 0.0);
        let mover = spawn_at(&mut store, &mut grid, 5.0, 5.0);

        let mut interest = Vec::new();
        grid.entities_of_interest(observer, &mut interest);
        assert!(interest.contains(&mover));

        grid.add_or_update(mover, Vec2::new(55.0, 55.0));
        grid.entities_of_interest(observer, &mut interest);
        assert!(!interest.contains(&mover));

        grid.remove(mover);
        assert!(!grid.contains(mover));
    }

    #[test]
    #[should_panic(expected = "unregistered entity")]
    fn querying_unregistered_entity_panics() {
        let mut store = EntityStore::new();
        let grid = InterestGrid::new(10.0);
        let never_added = store.spawn();

        let mut interest = Vec::new();
        grid.entities_of_interest(never_added, &mut interest);
    }
}
