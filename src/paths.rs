// Backend path parsing and normalisation
//
// The backend API nests collections under tenant/database segments:
//
//   /api/v2/tenants/{tenant}/databases/{database}/collections
//   /api/v2/tenants/{tenant}/databases/{database}/collections/{name-or-id}
//   /api/v2/tenants/{tenant}/databases/{database}/collections/{id}/add
//
// Collection references are either backend-assigned UUIDs or logical
// names; a UUID-shaped segment is treated as an identifier. Legacy v1
// paths and tenant-less v2 paths are canonicalised up front so the rest
// of the router only ever sees the full v2 shape.

use std::sync::OnceLock;

use regex::Regex;

/// Default tenant/database prefix prepended to legacy paths
pub const DEFAULT_SEGMENTS: &str = "/api/v2/tenants/default_tenant/databases/default_database";

/// A collection reference extracted from a request path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionRef {
    /// Backend-assigned identifier (UUID-shaped segment)
    Id(String),
    /// Logical collection name
    Name(String),
}

impl CollectionRef {
    pub fn as_str(&self) -> &str {
        match self {
            CollectionRef::Id(s) | CollectionRef::Name(s) => s,
        }
    }
}

fn collection_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"/collections/([^/?]+)").unwrap_or_else(|e| panic!("{e}")))
}

fn uuid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .unwrap_or_else(|e| panic!("{e}"))
    })
}

/// Canonicalise legacy API shapes to the current v2 layout.
///
/// - `/api/v1/collections/...` gains the default tenant/database segments
/// - `/api/v1/<other>` maps to `/api/v2/<other>` (heartbeat, version)
/// - `/api/v2/collections/...` (tenant-less) gains the default segments
/// - everything else passes through unchanged
pub fn normalize(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("/api/v1/") {
        if rest.starts_with("collections") {
            return format!("{DEFAULT_SEGMENTS}/{rest}");
        }
        return format!("/api/v2/{rest}");
    }
    if let Some(rest) = path.strip_prefix("/api/v2/collections") {
        return format!("{DEFAULT_SEGMENTS}/collections{rest}");
    }
    path.to_string()
}

/// Extract the collection reference from a path, if it has one
pub fn collection_ref(path: &str) -> Option<CollectionRef> {
    let segment = collection_re().captures(path)?.get(1)?.as_str();
    if uuid_re().is_match(segment) {
        Some(CollectionRef::Id(segment.to_string()))
    } else {
        Some(CollectionRef::Name(segment.to_string()))
    }
}

/// The sub-resource segment following the collection reference, if any
/// (`add`, `query`, `get`, ...)
pub fn sub_resource(path: &str) -> Option<&str> {
    let m = collection_re().find(path)?;
    let rest = &path[m.end()..];
    let rest = rest.strip_prefix('/')?;
    let end = rest
        .find(|c| c == '/' || c == '?')
        .unwrap_or(rest.len());
    if end == 0 {
        None
    } else {
        Some(&rest[..end])
    }
}

/// True for the collections root (create/list), i.e. no reference segment
pub fn is_collections_root(path: &str) -> bool {
    let without_query = path.split('?').next().unwrap_or(path);
    without_query.ends_with("/collections")
}

/// Swap the collection reference segment for another identifier
pub fn replace_collection_ref(path: &str, current: &str, replacement: &str) -> String {
    path.replacen(
        &format!("/collections/{current}"),
        &format!("/collections/{replacement}"),
        1,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str =
        "/api/v2/tenants/default_tenant/databases/default_database/collections/docs/add";

    #[test]
    fn v1_collection_paths_gain_default_segments() {
        assert_eq!(normalize("/api/v1/collections/docs/add"), FULL);
    }

    #[test]
    fn v1_heartbeat_maps_to_v2() {
        assert_eq!(normalize("/api/v1/heartbeat"), "/api/v2/heartbeat");
    }

    #[test]
    fn tenantless_v2_paths_gain_default_segments() {
        assert_eq!(normalize("/api/v2/collections/docs/add"), FULL);
        assert_eq!(
            normalize("/api/v2/collections"),
            format!("{DEFAULT_SEGMENTS}/collections")
        );
    }

    #[test]
    fn canonical_paths_pass_through() {
        assert_eq!(normalize(FULL), FULL);
        assert_eq!(normalize("/api/v2/heartbeat"), "/api/v2/heartbeat");
    }

    #[test]
    fn uuid_segments_are_identifiers() {
        let path = format!(
            "{DEFAULT_SEGMENTS}/collections/0e2cf165-4b7a-44b9-9b12-6e0f30e9a1a2/query"
        );
        assert_eq!(
            collection_ref(&path),
            Some(CollectionRef::Id(
                "0e2cf165-4b7a-44b9-9b12-6e0f30e9a1a2".to_string()
            ))
        );
    }

    #[test]
    fn name_segments_are_names() {
        assert_eq!(
            collection_ref(FULL),
            Some(CollectionRef::Name("docs".to_string()))
        );
    }

    #[test]
    fn collections_root_has_no_ref() {
        let root = format!("{DEFAULT_SEGMENTS}/collections");
        assert_eq!(collection_ref(&root), None);
        assert!(is_collections_root(&root));
        assert!(is_collections_root(&format!("{root}?limit=10")));
        assert!(!is_collections_root(FULL));
    }

    #[test]
    fn sub_resource_is_the_trailing_segment() {
        assert_eq!(sub_resource(FULL), Some("add"));
        let bare = format!("{DEFAULT_SEGMENTS}/collections/docs");
        assert_eq!(sub_resource(&bare), None);
        let with_query = format!("{DEFAULT_SEGMENTS}/collections/docs/query?x=1");
        assert_eq!(sub_resource(&with_query), Some("query"));
    }

    #[test]
    fn replace_swaps_only_the_ref() {
        let path = format!("{DEFAULT_SEGMENTS}/collections/aaa/add");
        assert_eq!(
            replace_collection_ref(&path, "aaa", "bbb"),
            format!("{DEFAULT_SEGMENTS}/collections/bbb/add")
        );
    }
}
