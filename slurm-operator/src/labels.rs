//! Well-known labels and selector helpers.

use std::collections::BTreeMap;

/// `app.kubernetes.io/name`.
pub const NAME: &str = "app.kubernetes.io/name";

/// `app.kubernetes.io/instance`.
pub const INSTANCE: &str = "app.kubernetes.io/instance";

/// Label carrying the ControllerRevision hash a pod was created from.
pub const REVISION_HASH: &str = "controller-revision-hash";

/// `app.kubernetes.io/name` value of NodeSet pods.
pub const NODESET_APP: &str = "slurmd";

/// `app.kubernetes.io/name` value of LoginSet pods.
pub const LOGINSET_APP: &str = "login";

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "slurm-operator";

/// Selector labels for an app instance.
pub fn selector_labels(app: &str, instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME.to_string(), app.to_string()),
        (INSTANCE.to_string(), instance.to_string()),
    ])
}

/// Canonical `k=v,k=v` form, sorted by key.
pub fn selector_string(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether every selector label is present with the same value.
pub fn matches(selector: &BTreeMap<String, String>, labels: Option<&BTreeMap<String, String>>) -> bool {
    let Some(labels) = labels else {
        return selector.is_empty();
    };
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Parse a `k=v,k=v` selector. Entries without `=` are ignored.
pub fn parse_selector(selector: &str) -> BTreeMap<String, String> {
    selector
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_round_trip() {
        let labels = selector_labels(NODESET_APP, "foo");
        let s = selector_string(&labels);
        assert_eq!(s, "app.kubernetes.io/instance=foo,app.kubernetes.io/name=slurmd");
        assert_eq!(parse_selector(&s), labels);
    }

    #[test]
    fn matching() {
        let selector = selector_labels(NODESET_APP, "foo");
        let mut labels = selector.clone();
        labels.insert(REVISION_HASH.into(), "12345".into());

        assert!(matches(&selector, Some(&labels)));
        assert!(!matches(&selector, None));

        labels.insert(INSTANCE.into(), "bar".into());
        assert!(!matches(&selector, Some(&labels)));
    }
}
