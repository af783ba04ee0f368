use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use stackable_operator::kube::{self, Resource};

use crate::converge::ObjectStore;

/// An [`ObjectStore`] keeping objects in memory and counting writes.
pub struct InMemoryStore<K> {
    objects: Mutex<BTreeMap<String, K>>,
    creates: AtomicUsize,
    updates: AtomicUsize,
}

impl<K> Default for InMemoryStore<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        }
    }
}

impl<K: Resource + Clone> InMemoryStore<K> {
    pub fn with_objects(objects: impl IntoIterator<Item = K>) -> Self {
        let store = Self::default();
        {
            let mut stored = store.objects.lock().unwrap();
            for obj in objects {
                stored.insert(obj.meta().name.clone().unwrap(), obj);
            }
        }
        store
    }

    pub fn get(&self, name: &str) -> Option<K> {
        self.objects.lock().unwrap().get(name).cloned()
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<K> ObjectStore<K> for InMemoryStore<K>
where
    K: Resource + Clone + Send + Sync,
{
    async fn get_observed(&self, name: &str) -> Result<Option<K>, kube::Error> {
        Ok(self.get(name))
    }

    async fn create_object(&self, obj: &K) -> Result<K, kube::Error> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .insert(obj.meta().name.clone().unwrap(), obj.clone());
        Ok(obj.clone())
    }

    async fn update_object(&self, obj: &K) -> Result<K, kube::Error> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .unwrap()
            .insert(obj.meta().name.clone().unwrap(), obj.clone());
        Ok(obj.clone())
    }
}

/// A kube client talking to `server` instead of an API server.
pub fn kube_client(server: &wiremock::MockServer) -> kube::Client {
    kube::Client::try_from(kube::Config::new(server.uri().parse().unwrap())).unwrap()
}

/// The body the API server sends for a missing object.
pub fn not_found_status(kind: &str, name: &str) -> serde_json::Value {
    serde_json::json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": format!("{kind} \"{name}\" not found"),
        "reason": "NotFound",
        "details": {"name": name, "kind": kind},
        "code": 404
    })
}
