use kube::Resource;
use serde_json::json;

/// Checks whether our own finalizer is in the list of finalizers for the provided object.
pub fn has_finalizer<T>(resource: &T, finalizer: &str) -> bool
where
    T: Resource,
{
    resource
        .meta()
        .finalizers
        .as_ref()
        .is_some_and(|finalizers| finalizers.iter().any(|f| f == finalizer))
}

/// Checks whether the provided object has a deletion timestamp set.
/// If that is the case the object is in the process of being deleted pending the handling of all finalizers.
pub fn has_deletion_stamp<T>(resource: &T) -> bool
where
    T: Resource,
{
    resource.meta().deletion_timestamp.is_some()
}

/// The finalizer list of `resource` with `finalizer` appended, `None` if it is already there.
pub fn with_finalizer<T>(resource: &T, finalizer: &str) -> Option<Vec<String>>
where
    T: Resource,
{
    if has_finalizer(resource, finalizer) {
        return None;
    }
    let mut finalizers = resource.meta().finalizers.clone().unwrap_or_default();
    finalizers.push(finalizer.to_owned());
    Some(finalizers)
}

/// The finalizer list of `resource` without `finalizer`, `None` if it was not there.
pub fn without_finalizer<T>(resource: &T, finalizer: &str) -> Option<Vec<String>>
where
    T: Resource,
{
    let finalizers = resource.meta().finalizers.as_ref()?;
    let index = finalizers.iter().position(|f| f == finalizer)?;
    let mut finalizers = finalizers.clone();
    finalizers.remove(index);
    Some(finalizers)
}

/// A merge patch replacing the whole finalizer list.
//
// A strategic merge patch (`$deleteFromPrimitiveList/finalizers`) would be preferable, but it
// is not supported for custom resources.
pub fn finalizers_patch(finalizers: Vec<String>) -> serde_json::Value {
    json!({
        "metadata": {
            "finalizers": finalizers
        }
    })
}
