use serde_json::Value;

use crate::database::core::compound_write::CompoundWrite;
use crate::database::core::tree::Tree;
use crate::database::path::Path;
use crate::database::query::QueryParams;
use crate::database::variant::get_immediate_child;
use crate::util::{assert, dev_assert};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    User,
    Server,
}

/// Where an operation came from. Server operations addressed to a single
/// filtered listen carry that listen's params and are `tagged`.
#[derive(Clone, Debug, PartialEq)]
pub struct OperationSource {
    pub origin: Origin,
    pub query_params: Option<QueryParams>,
    pub tagged: bool,
}

impl OperationSource {
    pub fn user() -> Self {
        Self {
            origin: Origin::User,
            query_params: None,
            tagged: false,
        }
    }

    pub fn server() -> Self {
        Self {
            origin: Origin::Server,
            query_params: None,
            tagged: false,
        }
    }

    pub fn for_server_tagged_query(params: QueryParams) -> Self {
        Self {
            origin: Origin::Server,
            query_params: Some(params),
            tagged: true,
        }
    }

    pub fn is_from_user(&self) -> bool {
        self.origin == Origin::User
    }

    pub fn is_from_server(&self) -> bool {
        self.origin == Origin::Server
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckStatus {
    Confirm,
    Revert,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationType {
    Overwrite,
    Merge,
    AckUserWrite,
    ListenComplete,
}

#[derive(Clone, Debug, PartialEq)]
pub enum OperationKind {
    Overwrite { snap: Value },
    Merge { children: CompoundWrite },
    /// `affected_tree` marks with `true` every location the write touched.
    AckUserWrite {
        affected_tree: Tree<bool>,
        revert: AckStatus,
    },
    ListenComplete,
}

/// One mutation travelling from the sync tree down to the views.
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    pub source: OperationSource,
    pub path: Path,
    pub kind: OperationKind,
}

impl Operation {
    fn new(source: OperationSource, path: Path, kind: OperationKind) -> Self {
        if source.tagged {
            assert(
                source.is_from_server(),
                "Tagged operations must originate from the server",
            );
        }
        Self { source, path, kind }
    }

    pub fn overwrite(source: OperationSource, path: Path, snap: Value) -> Self {
        Self::new(source, path, OperationKind::Overwrite { snap })
    }

    pub fn merge(source: OperationSource, path: Path, children: CompoundWrite) -> Self {
        Self::new(source, path, OperationKind::Merge { children })
    }

    pub fn ack_user_write(path: Path, affected_tree: Tree<bool>, revert: AckStatus) -> Self {
        Self::new(
            OperationSource::user(),
            path,
            OperationKind::AckUserWrite {
                affected_tree,
                revert,
            },
        )
    }

    pub fn listen_complete(source: OperationSource, path: Path) -> Self {
        dev_assert(
            !source.is_from_user(),
            "Can't have a listen complete from a user source",
        );
        Self::new(source, path, OperationKind::ListenComplete)
    }

    pub fn operation_type(&self) -> OperationType {
        match self.kind {
            OperationKind::Overwrite { .. } => OperationType::Overwrite,
            OperationKind::Merge { .. } => OperationType::Merge,
            OperationKind::AckUserWrite { .. } => OperationType::AckUserWrite,
            OperationKind::ListenComplete => OperationType::ListenComplete,
        }
    }

    /// The same operation as seen by the child `key` of the location it is
    /// currently applied to, or `None` when it does not reach that child.
    pub fn for_child(&self, key: &str) -> Option<Operation> {
        let at_here = self.path.is_empty();
        let front_matches = self.path.front_directory() == Some(key);
        match &self.kind {
            OperationKind::Overwrite { snap } => Some(if at_here {
                Self::overwrite(
                    self.source.clone(),
                    Path::root(),
                    get_immediate_child(snap, key).clone(),
                )
            } else {
                Self::overwrite(
                    self.source.clone(),
                    self.path.pop_front_directory(),
                    snap.clone(),
                )
            }),
            OperationKind::Merge { children } => {
                if at_here {
                    let child_tree = children.child_compound_write(&Path::new(key));
                    if child_tree.is_empty() {
                        None
                    } else if let Some(value) = child_tree.root_write() {
                        Some(Self::overwrite(
                            self.source.clone(),
                            Path::root(),
                            value.clone(),
                        ))
                    } else {
                        Some(Self::merge(self.source.clone(), Path::root(), child_tree))
                    }
                } else if front_matches {
                    Some(Self::merge(
                        self.source.clone(),
                        self.path.pop_front_directory(),
                        children.clone(),
                    ))
                } else {
                    None
                }
            }
            OperationKind::AckUserWrite {
                affected_tree,
                revert,
            } => {
                if !at_here {
                    dev_assert(
                        front_matches,
                        "operation_for_child called for unrelated child",
                    );
                    return Some(Self::ack_user_write(
                        self.path.pop_front_directory(),
                        affected_tree.clone(),
                        *revert,
                    ));
                }
                if affected_tree.value().is_some() {
                    dev_assert(
                        affected_tree.children().is_empty(),
                        "affected_tree should not have overlapping affected paths",
                    );
                    return Some(self.clone());
                }
                let child_tree = affected_tree
                    .get_child(&Path::new(key))
                    .cloned()
                    .unwrap_or_default();
                Some(Self::ack_user_write(Path::root(), child_tree, *revert))
            }
            OperationKind::ListenComplete => Some(Self::listen_complete(
                self.source.clone(),
                if at_here {
                    Path::root()
                } else {
                    self.path.pop_front_directory()
                },
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn overwrite_descends_into_snapshot() {
        let op = Operation::overwrite(OperationSource::server(), Path::root(), json!({ "a": 1 }));
        let child = op.for_child("a").unwrap();
        assert_eq!(child.kind, OperationKind::Overwrite { snap: json!(1) });
        let missing = op.for_child("b").unwrap();
        assert_eq!(missing.kind, OperationKind::Overwrite { snap: Value::Null });
    }

    #[test]
    fn overwrite_below_pops_path() {
        let op = Operation::overwrite(OperationSource::user(), Path::new("a/b"), json!(1));
        let child = op.for_child("a").unwrap();
        assert_eq!(child.path, Path::new("b"));
        assert_eq!(child.operation_type(), OperationType::Overwrite);
    }

    #[test]
    fn merge_for_child_becomes_overwrite_or_merge() {
        let merge = CompoundWrite::from_variant_merge(&json!({ "a": 1, "b/c": 2 }));
        let op = Operation::merge(OperationSource::server(), Path::root(), merge);
        assert_eq!(
            op.for_child("a").unwrap().kind,
            OperationKind::Overwrite { snap: json!(1) }
        );
        assert_eq!(op.for_child("b").unwrap().operation_type(), OperationType::Merge);
        assert!(op.for_child("z").is_none());

        let deeper = Operation::merge(
            OperationSource::server(),
            Path::new("x/y"),
            CompoundWrite::from_variant_merge(&json!({ "k": 1 })),
        );
        assert_eq!(deeper.for_child("x").unwrap().path, Path::new("y"));
        assert!(deeper.for_child("q").is_none());
    }

    #[test]
    fn ack_for_child_walks_affected_tree() {
        let mut affected = Tree::new();
        affected.set_value_at(&Path::new("a"), Some(true));
        let op = Operation::ack_user_write(Path::root(), affected, AckStatus::Revert);
        let child = op.for_child("a").unwrap();
        match child.kind {
            OperationKind::AckUserWrite {
                affected_tree,
                revert,
            } => {
                assert_eq!(affected_tree.value(), Some(&true));
                assert_eq!(revert, AckStatus::Revert);
            }
            other => panic!("unexpected {other:?}"),
        }
        let rooted = Operation::ack_user_write(
            Path::root(),
            Tree::with_value(Some(true)),
            AckStatus::Confirm,
        );
        assert_eq!(rooted.for_child("anything"), Some(rooted.clone()));
    }

    #[test]
    fn tagged_sources_are_server_sources() {
        let source = OperationSource::for_server_tagged_query(QueryParams::default());
        assert!(source.tagged);
        assert!(source.is_from_server());
        let op = Operation::listen_complete(source, Path::new("a"));
        assert_eq!(op.for_child("a").unwrap().path, Path::root());
    }

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn tagged_user_operation_is_rejected() {
        let source = OperationSource {
            origin: Origin::User,
            query_params: None,
            tagged: true,
        };
        Operation::overwrite(source, Path::root(), Value::Null);
    }
}
