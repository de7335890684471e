use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;

pub type SharedResource = Arc<RwLock<Resource>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateResource(Ulid),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::DuplicateResource(id) => write!(f, "resource {id} already registered"),
        }
    }
}

impl std::error::Error for RegistryError {}

struct GroupEntry {
    name: Option<String>,
    members: Vec<Ulid>,
    /// Serializes multi-resource bookings within the group.
    lock: Arc<Mutex<()>>,
}

impl GroupEntry {
    fn new(name: Option<String>) -> Self {
        Self {
            name,
            members: Vec::new(),
            lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Passive store of reservable units.
///
/// The registry hands out the per-resource lock (`handle`) but never changes a
/// resource's status itself; every transition goes through the coordinator.
pub struct ResourceRegistry {
    resources: DashMap<Ulid, SharedResource>,
    groups: DashMap<Ulid, GroupEntry>,
    notify: Arc<NotifyHub>,
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new(Arc::new(NotifyHub::new()))
    }
}

impl ResourceRegistry {
    pub fn new(notify: Arc<NotifyHub>) -> Self {
        Self {
            resources: DashMap::new(),
            groups: DashMap::new(),
            notify,
        }
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    // ── Resources ────────────────────────────────────────────

    /// Register a resource and return its id. A group id nobody registered
    /// yet is created on the fly. An id already present is rejected and the
    /// stored resource is left untouched.
    pub fn add(&self, resource: Resource) -> Result<Ulid, RegistryError> {
        let id = resource.id;
        let group_id = resource.group_id;
        match self.resources.entry(id) {
            Entry::Occupied(_) => return Err(RegistryError::DuplicateResource(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(RwLock::new(resource)));
            }
        }
        if let Some(gid) = group_id {
            self.groups
                .entry(gid)
                .or_insert_with(|| GroupEntry::new(None))
                .members
                .push(id);
        }
        metrics::gauge!(crate::observability::RESOURCES).set(self.resources.len() as f64);
        self.notify.send(id, &Event::ResourceAdded { id, group_id });
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.resources.contains_key(id)
    }

    /// The lock guarding one resource. Callers mutating status must hold it.
    pub fn handle(&self, id: &Ulid) -> Option<SharedResource> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of a single resource.
    pub async fn get(&self, id: &Ulid) -> Option<ResourceInfo> {
        let rs = self.handle(id)?;
        let guard = rs.read().await;
        Some(guard.info())
    }

    /// Snapshots of every resource matching `predicate`, in id order.
    pub async fn list<F>(&self, predicate: F) -> Vec<ResourceInfo>
    where
        F: Fn(&ResourceInfo) -> bool,
    {
        // Collect handles first so no shard lock is held across an await.
        let mut handles: Vec<(Ulid, SharedResource)> = self
            .resources
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        handles.sort_by_key(|(id, _)| *id);

        let mut out = Vec::new();
        for (_, rs) in handles {
            let info = rs.read().await.info();
            if predicate(&info) {
                out.push(info);
            }
        }
        out
    }

    pub async fn list_by_status(&self, status: ResourceStatus) -> Vec<ResourceInfo> {
        self.list(|r| r.status == status).await
    }

    // ── Groups ───────────────────────────────────────────────

    pub fn add_group(&self, name: Option<String>) -> Ulid {
        let id = Ulid::new();
        self.groups.insert(id, GroupEntry::new(name));
        id
    }

    pub fn group(&self, id: &Ulid) -> Option<GroupInfo> {
        self.groups.get(id).map(|g| GroupInfo {
            id: *id,
            name: g.name.clone(),
            members: g.members.clone(),
        })
    }

    pub fn members(&self, group_id: &Ulid) -> Vec<Ulid> {
        self.groups
            .get(group_id)
            .map(|g| g.members.clone())
            .unwrap_or_default()
    }

    pub fn group_lock(&self, group_id: &Ulid) -> Option<Arc<Mutex<()>>> {
        self.groups.get(group_id).map(|g| g.lock.clone())
    }

    /// Look up a member of a group by its display name (e.g. seat "A1").
    pub async fn find_in_group(&self, group_id: &Ulid, name: &str) -> Option<Ulid> {
        for id in self.members(group_id) {
            if let Some(rs) = self.handle(&id)
                && rs.read().await.name.as_deref() == Some(name)
            {
                return Some(id);
            }
        }
        None
    }

    pub async fn available_in_group(&self, group_id: &Ulid) -> Vec<ResourceInfo> {
        let mut out = Vec::new();
        for id in self.members(group_id) {
            if let Some(info) = self.get(&id).await
                && info.status == ResourceStatus::Available
            {
                out.push(info);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_and_get() {
        let reg = ResourceRegistry::default();
        let id = reg.add(Resource::new(10.0).named("A1")).unwrap();

        let info = reg.get(&id).await.unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.status, ResourceStatus::Available);
        assert_eq!(info.weight, 10.0);
        assert_eq!(info.name.as_deref(), Some("A1"));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn unknown_id_is_none() {
        let reg = ResourceRegistry::default();
        assert!(reg.get(&Ulid::new()).await.is_none());
        assert!(reg.handle(&Ulid::new()).is_none());
        assert!(reg.members(&Ulid::new()).is_empty());
    }

    #[tokio::test]
    async fn list_filters_by_predicate() {
        let reg = ResourceRegistry::default();
        let cheap = reg.add(Resource::new(5.0)).unwrap();
        let _pricey = reg.add(Resource::new(50.0)).unwrap();

        let found = reg.list(|r| r.weight < 10.0).await;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, cheap);

        reg.handle(&cheap).unwrap().write().await.status = ResourceStatus::Booked;
        assert_eq!(reg.list_by_status(ResourceStatus::Available).await.len(), 1);
        assert_eq!(reg.list_by_status(ResourceStatus::Booked).await.len(), 1);
    }

    #[tokio::test]
    async fn group_membership_and_lookup_by_name() {
        let reg = ResourceRegistry::default();
        let show = reg.add_group(Some("evening".into()));
        let a1 = reg.add(Resource::new(25.0).named("A1").in_group(show)).unwrap();
        let a2 = reg.add(Resource::new(25.0).named("A2").in_group(show)).unwrap();

        assert_eq!(reg.members(&show), vec![a1, a2]);
        assert_eq!(reg.find_in_group(&show, "A2").await, Some(a2));
        assert_eq!(reg.find_in_group(&show, "Z9").await, None);
        assert_eq!(reg.group(&show).unwrap().name.as_deref(), Some("evening"));
        assert!(reg.group_lock(&show).is_some());
    }

    #[tokio::test]
    async fn unregistered_group_created_implicitly() {
        let reg = ResourceRegistry::default();
        let gid = Ulid::new();
        let id = reg.add(Resource::new(1.0).in_group(gid)).unwrap();
        assert_eq!(reg.members(&gid), vec![id]);
        assert_eq!(reg.available_in_group(&gid).await.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let reg = ResourceRegistry::default();
        let gid = reg.add_group(Some("matinee".into()));
        let first = Resource::new(25.0).named("A1").in_group(gid);
        let id = first.id;
        let mut clash = first.clone();
        clash.name = Some("B7".into());
        clash.weight = 99.0;

        reg.add(first).unwrap();
        assert_eq!(reg.add(clash), Err(RegistryError::DuplicateResource(id)));

        assert_eq!(reg.len(), 1);
        assert_eq!(reg.members(&gid), vec![id]);
        let info = reg.get(&id).await.unwrap();
        assert_eq!(info.name.as_deref(), Some("A1"));
        assert_eq!(info.weight, 25.0);
    }

    #[tokio::test]
    async fn add_broadcasts_event() {
        let reg = ResourceRegistry::default();
        let r = Resource::new(1.0);
        let id = r.id;
        let mut rx = reg.notify().subscribe(id);
        reg.add(r).unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            Event::ResourceAdded { id, group_id: None }
        );
    }
}
