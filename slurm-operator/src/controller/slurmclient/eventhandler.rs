//! RestApi events to Controller reconcile requests.

use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;

use crate::crd::{Controller, RestApi};

/// The Controller served by a RestApi.
pub fn controller_for_restapi(restapi: RestApi) -> Option<ObjectRef<Controller>> {
    let key = restapi
        .spec
        .controller_ref
        .key(&restapi.namespace().unwrap_or_default());
    if key.name.is_empty() {
        return None;
    }
    Some(key.object_ref())
}
