//! Map Registry
//!
//! User maps are registered by name in the map-name map; their roots live in
//! the layout map under the map id. A rename first adds the new name and then
//! drops the old one, so an interrupted rename leaves two names for one id.
//! Open repairs that (newest creation wins) and drops layout roots whose id
//! has no name left.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{AtlasError, Result};
use crate::map::{MapCore, MapHandle, MapSettings, MvMap};
use crate::types::{DataType, KeyType};

use super::{MapMetadata, StoreCore, MIN_USER_MAP_ID};

impl StoreCore {
    /// Every (name, metadata) pair of the map-name map, in name order
    fn registered_maps(&self) -> Result<Vec<(String, MapMetadata)>> {
        MvMap::from_core(self.name_map.clone())
            .cursor(None)?
            .collect()
    }

    fn root_pos(&self, id: u32) -> Result<u64> {
        Ok(self.layout.get(&(id as u64))?.unwrap_or(0))
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Open (or create) the map `name`
    ///
    /// An already open map is returned as is, as long as its key and value
    /// types and its writer mode match.
    pub(crate) fn open_map<K: KeyType, V: DataType>(&self, name: &str, single_writer: bool) -> Result<MvMap<K, V>> {
        self.check_open()?;
        self.with_store_lock(|| {
            let settings = MapSettings::from_config(&self.config);
            let read_only = self.file.is_read_only();
            let last_stored = self.current_version().saturating_sub(1);

            if let Some(metadata) = self.name_map.get(&name.to_string())? {
                let existing = self.maps.read().get(&metadata.id).cloned();
                if let Some(handle) = existing {
                    return self.typed_map(name, handle, single_writer);
                }
                let map = Arc::new(MapCore::<K, V>::new(
                    self.weak_self.clone(),
                    metadata.id,
                    metadata.create_version,
                    settings,
                    single_writer,
                    read_only,
                ));
                map.set_root_page_info(self.root_pos(metadata.id)?, last_stored)?;
                self.maps
                    .write()
                    .insert(metadata.id, map.clone() as Arc<dyn MapHandle>);
                debug!(name, id = metadata.id, "Opened map");
                return Ok(MvMap::from_core(map));
            }

            if read_only {
                return Err(AtlasError::IllegalState(format!(
                    "Map {} does not exist and the store is read-only",
                    name
                )));
            }
            let id = self.last_map_id.fetch_add(1, Ordering::AcqRel) + 1;
            let metadata = MapMetadata {
                id,
                create_version: self.current_version(),
            };
            let map = Arc::new(MapCore::<K, V>::new(
                self.weak_self.clone(),
                id,
                metadata.create_version,
                settings,
                single_writer,
                false,
            ));
            self.name_map.put(name.to_string(), metadata)?;
            map.set_root_page_info(0, last_stored)?;
            self.mark_meta_changed();
            self.maps
                .write()
                .insert(id, map.clone() as Arc<dyn MapHandle>);
            info!(name, id, single_writer, "Created map");
            Ok(MvMap::from_core(map))
        })
    }

    fn typed_map<K: KeyType, V: DataType>(
        &self,
        name: &str,
        handle: Arc<dyn MapHandle>,
        single_writer: bool,
    ) -> Result<MvMap<K, V>> {
        if handle.is_single_writer() != single_writer {
            return Err(AtlasError::IllegalArgument(format!(
                "Map {} is already open with single_writer = {}",
                name,
                handle.is_single_writer()
            )));
        }
        let (key_type, value_type) = handle.type_names();
        match handle.as_any().downcast::<MapCore<K, V>>() {
            Ok(map) => Ok(MvMap::from_core(map)),
            Err(_) => Err(AtlasError::IllegalArgument(format!(
                "Map {} is open as <{}, {}>, not <{}, {}>",
                name,
                key_type,
                value_type,
                std::any::type_name::<K>(),
                std::any::type_name::<V>()
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Rename and Remove
    // -------------------------------------------------------------------------

    pub(crate) fn rename_map(&self, id: u32, new_name: &str) -> Result<()> {
        self.check_open()?;
        if id < MIN_USER_MAP_ID {
            return Err(AtlasError::IllegalArgument(
                "Renaming the meta map is not allowed".into(),
            ));
        }
        self.with_store_lock(|| {
            let registered = self.registered_maps()?;
            if let Some((_, existing)) = registered.iter().find(|(name, _)| name == new_name) {
                if existing.id != id {
                    return Err(AtlasError::IllegalArgument(format!(
                        "A map named {} already exists",
                        new_name
                    )));
                }
            }
            let Some((_, metadata)) = registered.iter().find(|(_, m)| m.id == id) else {
                return Err(AtlasError::IllegalArgument(format!("Map {} is not registered", id)));
            };

            // Step 1: The new name first, so a crash never loses the map
            self.name_map
                .put(new_name.to_string(), metadata.clone())?;

            // Step 2: Every other name of this id goes
            for (old_name, _) in registered.iter().filter(|(n, m)| m.id == id && n != new_name) {
                self.name_map.remove(old_name)?;
                debug!(id, from = %old_name, to = new_name, "Renamed map");
            }
            self.mark_meta_changed();
            Ok(())
        })
    }

    /// Clear and close map `id` and forget its name
    ///
    /// The root is dropped from the layout once no version needs it anymore.
    pub(crate) fn remove_map(&self, id: u32) -> Result<()> {
        if id < MIN_USER_MAP_ID {
            return Err(AtlasError::IllegalArgument(
                "Removing the meta map is not allowed".into(),
            ));
        }
        self.with_store_lock(|| {
            self.check_open()?;
            let handle = self.maps.read().get(&id).cloned();
            if let Some(handle) = handle {
                handle.clear_all()?;
                handle.close();
            }
            let names: Vec<String> = self
                .registered_maps()?
                .into_iter()
                .filter(|(_, m)| m.id == id)
                .map(|(name, _)| name)
                .collect();
            for name in &names {
                self.name_map.remove(name)?;
            }
            if !names.is_empty() {
                self.mark_meta_changed();
                info!(id, names = ?names, "Removed map");
            }
            Ok(())
        })
    }

    /// Final stage of a removal: forget the root of a closed map
    pub(crate) fn deregister_map_root(&self, id: u32) -> Result<()> {
        if self.layout.remove(&(id as u64))?.is_some() {
            self.mark_meta_changed();
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub(crate) fn map_names(&self) -> Result<Vec<String>> {
        self.check_open()?;
        Ok(self
            .registered_maps()?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    pub(crate) fn has_map(&self, name: &str) -> Result<bool> {
        self.check_open()?;
        Ok(self.name_map.get(&name.to_string())?.is_some())
    }

    pub(crate) fn has_data(&self, name: &str) -> Result<bool> {
        self.check_open()?;
        match self.name_map.get(&name.to_string())? {
            Some(metadata) => Ok(self.root_pos(metadata.id)? != 0),
            None => Ok(false),
        }
    }

    pub(crate) fn map_name(&self, id: u32) -> Option<String> {
        let registered = self.registered_maps().ok()?;
        registered
            .into_iter()
            .find(|(_, m)| m.id == id)
            .map(|(name, _)| name)
    }

    // -------------------------------------------------------------------------
    // Scrubbing on Open
    // -------------------------------------------------------------------------

    /// Leave one name per map id, the one created last
    pub(crate) fn scrub_name_map(&self) -> Result<()> {
        let registered = self.registered_maps()?;
        let mut by_id: HashMap<u32, (String, MapMetadata)> = HashMap::new();
        let mut stale = Vec::new();
        let mut max_id = self.last_map_id.load(Ordering::Acquire);

        for (name, metadata) in registered {
            max_id = max_id.max(metadata.id);
            match by_id.get(&metadata.id) {
                Some((_, kept)) if metadata.create_version <= kept.create_version => {
                    stale.push(name);
                }
                Some((kept_name, _)) => {
                    stale.push(kept_name.clone());
                    by_id.insert(metadata.id, (name, metadata));
                }
                None => {
                    by_id.insert(metadata.id, (name, metadata));
                }
            }
        }
        self.last_map_id.fetch_max(max_id, Ordering::AcqRel);

        if !stale.is_empty() && self.file.is_read_only() {
            warn!(names = ?stale, "Duplicate map names left in read-only store");
            return Ok(());
        }
        for name in stale {
            warn!(name = %name, "Dropping leftover name of an unfinished rename");
            self.name_map.remove(&name)?;
            self.mark_meta_changed();
        }
        Ok(())
    }

    /// Drop layout roots of user maps that have no name
    pub(crate) fn scrub_layout_map(&self) -> Result<()> {
        let ids: HashSet<u32> = self
            .registered_maps()?
            .into_iter()
            .map(|(_, m)| m.id)
            .collect();
        let orphans: Vec<u64> = MvMap::from_core(self.layout.clone())
            .keys()?
            .filter_map(|key| match key {
                Ok(id) if id >= MIN_USER_MAP_ID as u64 && !ids.contains(&(id as u32)) => Some(Ok(id)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
            .collect::<Result<_>>()?;

        if orphans.is_empty() || self.file.is_read_only() {
            return Ok(());
        }
        for id in orphans {
            warn!(id, "Dropping root of a map without name");
            self.layout.remove(&id)?;
        }
        Ok(())
    }
}
