//! Namespaced object identity.

use std::fmt;

use kube::runtime::reflector::ObjectRef;
use kube::{Resource, ResourceExt};

/// Namespace and name of a Kubernetes object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Object namespace; empty for cluster-scoped objects.
    pub namespace: String,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Create a key.
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Key of an existing object.
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::new(&obj.namespace().unwrap_or_default(), &obj.name_any())
    }

    /// Reflector reference for enqueueing the keyed object.
    pub fn object_ref<K>(&self) -> ObjectRef<K>
    where
        K: Resource<DynamicType = ()>,
    {
        let r = ObjectRef::new(&self.name);
        if self.namespace.is_empty() {
            r
        } else {
            r.within(&self.namespace)
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

impl<K: Resource> From<&ObjectRef<K>> for ObjectKey {
    fn from(r: &ObjectRef<K>) -> Self {
        Self::new(r.namespace.as_deref().unwrap_or_default(), &r.name)
    }
}
