use indexmap::IndexMap;
use shared::domain::{AttendeeId, SinkHandle, Tile, TileId, TileRole};
use tracing::{debug, warn};

/// Why a repeat upsert for a known tile id was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TileConflict {
    RoleChanged { existing: TileRole, requested: TileRole },
    AttendeeChanged {
        existing: AttendeeId,
        requested: AttendeeId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New entry. `evicted` holds the previous tile of an exclusive role.
    Inserted { evicted: Option<Tile> },
    /// Existing entry got a new sink.
    Rebound,
    Unchanged,
    Rejected(TileConflict),
}

/// Tiles keyed by id, iterated in insertion order.
#[derive(Debug, Default, Clone)]
pub struct TileRegistry {
    tiles: IndexMap<TileId, Tile>,
}

impl TileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Role and attendee are fixed at first sight; later calls may only change the sink.
    /// A `None` sink on a repeat call keeps the current binding.
    pub fn upsert(
        &mut self,
        tile_id: TileId,
        attendee_id: AttendeeId,
        role: TileRole,
        sink: Option<SinkHandle>,
    ) -> UpsertOutcome {
        if let Some(existing) = self.tiles.get_mut(&tile_id) {
            if existing.role != role {
                warn!(
                    %tile_id,
                    existing = ?existing.role,
                    requested = ?role,
                    "tiles: ignoring role change for known tile"
                );
                return UpsertOutcome::Rejected(TileConflict::RoleChanged {
                    existing: existing.role,
                    requested: role,
                });
            }
            if existing.attendee_id != attendee_id {
                warn!(
                    %tile_id,
                    existing = %existing.attendee_id,
                    requested = %attendee_id,
                    "tiles: ignoring attendee change for known tile"
                );
                return UpsertOutcome::Rejected(TileConflict::AttendeeChanged {
                    existing: existing.attendee_id.clone(),
                    requested: attendee_id,
                });
            }
            return match sink {
                Some(sink) if existing.sink.as_ref() != Some(&sink) => {
                    existing.sink = Some(sink);
                    UpsertOutcome::Rebound
                }
                _ => UpsertOutcome::Unchanged,
            };
        }

        let evicted = if role.is_exclusive() {
            let holder = self
                .tiles
                .values()
                .find(|tile| tile.role == role)
                .map(|tile| tile.tile_id);
            holder.and_then(|holder| {
                debug!(%holder, %tile_id, ?role, "tiles: newer tile supersedes exclusive slot");
                self.tiles.shift_remove(&holder)
            })
        } else {
            None
        };

        self.tiles.insert(
            tile_id,
            Tile {
                tile_id,
                attendee_id,
                role,
                sink,
            },
        );
        UpsertOutcome::Inserted { evicted }
    }

    /// Unknown ids are ignored; removal may race ahead of creation.
    pub fn remove(&mut self, tile_id: TileId) -> Option<Tile> {
        self.tiles.shift_remove(&tile_id)
    }

    pub fn get(&self, tile_id: TileId) -> Option<&Tile> {
        self.tiles.get(&tile_id)
    }

    pub fn list_by_role(&self, role: TileRole) -> Vec<&Tile> {
        self.tiles.values().filter(|tile| tile.role == role).collect()
    }

    pub fn tiles_for_attendee<'a>(
        &'a self,
        attendee_id: &'a AttendeeId,
    ) -> impl Iterator<Item = &'a Tile> + 'a {
        self.tiles
            .values()
            .filter(move |tile| &tile.attendee_id == attendee_id)
    }

    /// Sinks currently holding a tile, in tile insertion order.
    pub fn bound_sinks(&self) -> impl Iterator<Item = &SinkHandle> {
        self.tiles.values().filter_map(|tile| tile.sink.as_ref())
    }

    pub fn is_sink_bound(&self, sink: &SinkHandle) -> bool {
        self.bound_sinks().any(|bound| bound == sink)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tile> {
        self.tiles.values()
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
    }
}

#[cfg(test)]
#[path = "tests/tile_registry_tests.rs"]
mod tests;
