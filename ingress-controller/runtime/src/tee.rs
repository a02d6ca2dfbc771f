use kubert::index::{IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use std::sync::Arc;

/// Feeds a single watch into two indexes.
///
/// `HTTPProxy` events drive both the compiler, which needs the specs, and the
/// status index, which needs the statuses last written to the cluster.
pub struct Tee<A, B> {
    first: Arc<RwLock<A>>,
    second: Arc<RwLock<B>>,
}

impl<A, B> Tee<A, B> {
    pub fn shared(first: Arc<RwLock<A>>, second: Arc<RwLock<B>>) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(Self { first, second }))
    }
}

impl<A, B, R> IndexNamespacedResource<R> for Tee<A, B>
where
    A: IndexNamespacedResource<R>,
    B: IndexNamespacedResource<R>,
    R: Clone,
{
    fn apply(&mut self, resource: R) {
        self.second.write().apply(resource.clone());
        self.first.write().apply(resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.second.write().delete(namespace.clone(), name.clone());
        self.first.write().delete(namespace, name);
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        self.second.write().reset(resources.clone(), removed.clone());
        self.first.write().reset(resources, removed);
    }
}
