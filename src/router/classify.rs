// Request classification
//
// A request is a write when its method can mutate AND the path is not a
// read-only sub-resource. The backend exposes `/get`, `/query`, and
// `/count` as POSTs carrying query payloads; those are reads and must
// never touch the WAL.

use axum::http::Method;

use crate::paths;

/// What kind of write a request performs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// POST to the collections root
    CollectionCreate,
    /// DELETE of a collection reference
    CollectionDelete,
    /// Document-level mutation (add/update/upsert/delete sub-resources)
    Data,
}

/// Router-level request classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Write(WriteKind),
}

impl RequestKind {
    pub fn is_write(self) -> bool {
        matches!(self, RequestKind::Write(_))
    }

    /// Classification tag stored on transaction records
    pub fn operation_type(self) -> &'static str {
        match self {
            RequestKind::Read => "read",
            RequestKind::Write(WriteKind::CollectionCreate) => "collection_create",
            RequestKind::Write(WriteKind::CollectionDelete) => "collection_delete",
            RequestKind::Write(WriteKind::Data) => "document_write",
        }
    }
}

/// Sub-resources that are POSTs but semantically reads
const READ_SUB_RESOURCES: &[&str] = &["get", "query", "count"];

/// Classify a normalised request path
pub fn classify(method: &Method, path: &str) -> RequestKind {
    if let Some(sub) = paths::sub_resource(path) {
        if READ_SUB_RESOURCES.contains(&sub) {
            return RequestKind::Read;
        }
    }

    match *method {
        Method::POST if paths::is_collections_root(path) => {
            RequestKind::Write(WriteKind::CollectionCreate)
        }
        Method::DELETE if paths::collection_ref(path).is_some() => {
            RequestKind::Write(WriteKind::CollectionDelete)
        }
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE => {
            RequestKind::Write(WriteKind::Data)
        }
        _ => RequestKind::Read,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(rest: &str) -> String {
        format!("{}{rest}", paths::DEFAULT_SEGMENTS)
    }

    #[test]
    fn query_posts_are_reads() {
        for sub in ["get", "query", "count"] {
            let path = p(&format!("/collections/docs/{sub}"));
            assert_eq!(classify(&Method::POST, &path), RequestKind::Read, "{sub}");
        }
    }

    #[test]
    fn document_mutations_are_data_writes() {
        for sub in ["add", "update", "upsert", "delete"] {
            let path = p(&format!("/collections/docs/{sub}"));
            assert_eq!(
                classify(&Method::POST, &path),
                RequestKind::Write(WriteKind::Data),
                "{sub}"
            );
        }
    }

    #[test]
    fn collection_creation_is_detected() {
        assert_eq!(
            classify(&Method::POST, &p("/collections")),
            RequestKind::Write(WriteKind::CollectionCreate)
        );
        // GET on the same path lists collections
        assert_eq!(classify(&Method::GET, &p("/collections")), RequestKind::Read);
    }

    #[test]
    fn collection_delete_is_detected() {
        assert_eq!(
            classify(&Method::DELETE, &p("/collections/docs")),
            RequestKind::Write(WriteKind::CollectionDelete)
        );
    }

    #[test]
    fn plain_gets_are_reads() {
        assert_eq!(
            classify(&Method::GET, &p("/collections/docs")),
            RequestKind::Read
        );
        assert_eq!(classify(&Method::GET, "/api/v2/heartbeat"), RequestKind::Read);
    }

    #[test]
    fn operation_types_match_the_audit_tags() {
        assert_eq!(
            classify(&Method::POST, &p("/collections")).operation_type(),
            "collection_create"
        );
        assert_eq!(
            classify(&Method::DELETE, &p("/collections/docs")).operation_type(),
            "collection_delete"
        );
        assert_eq!(
            classify(&Method::POST, &p("/collections/docs/add")).operation_type(),
            "document_write"
        );
    }
}
