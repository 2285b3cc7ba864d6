//! A main-memory repository, suitable for tests and for hosts that keep
//! repository state elsewhere.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::object::{Object, ObjectId};
use crate::repo::{is_valid_ref, Repository};
use crate::{Error, Result};

/// An in-memory `Repository`. Each of the three tables has its own
/// reader-writer lock; ref updates are serialized per table, which is
/// enough for the compare-and-set contract.
pub struct MemoryRepository {
    objects: RwLock<HashMap<ObjectId, Object>>,
    refs: RwLock<BTreeMap<String, ObjectId>>,
    head: RwLock<String>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            refs: RwLock::new(BTreeMap::new()),
            head: RwLock::new("refs/heads/master".to_string()),
        }
    }
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl Repository for MemoryRepository {
    fn get_object(&self, id: &ObjectId) -> Result<Object> {
        let objects = self.objects.read().map_err(|_| Error::LockPoisoned)?;
        objects.get(id).cloned().ok_or(Error::ObjectNotExist(*id))
    }

    fn put_object(&self, obj: Object) -> Result<ObjectId> {
        let id = obj.id();
        let mut objects = self.objects.write().map_err(|_| Error::LockPoisoned)?;
        objects.insert(id, obj);
        Ok(id)
    }

    fn get_ref(&self, name: &str) -> Result<ObjectId> {
        if !is_valid_ref(name) {
            return Err(Error::InvalidRef(name.to_string()));
        }
        let refs = self.refs.read().map_err(|_| Error::LockPoisoned)?;
        refs.get(name).copied().ok_or(Error::RefNotExist)
    }

    fn update_ref(&self, name: &str, old: ObjectId, new: ObjectId) -> Result<()> {
        if !is_valid_ref(name) {
            return Err(Error::InvalidRef(name.to_string()));
        }
        let mut refs = self.refs.write().map_err(|_| Error::LockPoisoned)?;
        let current = refs.get(name).copied().unwrap_or(ObjectId::ZERO);
        if current != old {
            return Err(if current.is_zero() {
                Error::RefNotExist
            } else if old.is_zero() {
                Error::RefExists
            } else {
                Error::RefMismatch
            });
        }
        if new.is_zero() {
            // A no-op when the ref does not exist, i.e. old was zero too.
            refs.remove(name);
            Ok(())
        } else {
            let objects = self.objects.read().map_err(|_| Error::LockPoisoned)?;
            if !objects.contains_key(&new) {
                return Err(Error::ObjectNotExist(new));
            }
            refs.insert(name.to_string(), new);
            Ok(())
        }
    }

    fn list_refs(&self) -> Result<Vec<(String, ObjectId)>> {
        let refs = self.refs.read().map_err(|_| Error::LockPoisoned)?;
        Ok(refs.iter().map(|(name, id)| (name.clone(), *id)).collect())
    }

    fn head(&self) -> Result<String> {
        Ok(self.head.read().map_err(|_| Error::LockPoisoned)?.clone())
    }

    fn set_head(&self, name: &str) -> Result<()> {
        *self.head.write().map_err(|_| Error::LockPoisoned)? = name.to_string();
        Ok(())
    }
}
