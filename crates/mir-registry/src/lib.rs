//! mir-registry
//!
//! Catalogue of synced object types. One [`ResourceConfig`] per type carries
//! everything the engine needs to drive it: dependency order, destination
//! table, where its rows come from (REST list, analytical query, or a parent's
//! embedded collection), which raw fields name parent objects, whether a
//! webhook payload can be trusted without a refetch, and which truncated child
//! collections to expand before upserting.
//!
//! The registry is built once at startup and validated then; everything the
//! engine dispatches on afterwards is a lookup in this table.

mod resources;

pub use resources::standard;

use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Resource configuration
// ---------------------------------------------------------------------------

/// A raw field on this object that names a parent object's id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    /// Registry name of the parent resource.
    pub resource: &'static str,
    /// Field on the raw payload holding the parent id (e.g. `"customer"`).
    pub field: &'static str,
}

/// Eagerly fill a truncated child collection returned inline on list
/// responses (e.g. a subscription's `items` stop at ten entries and flag
/// `has_more`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpandRule {
    /// Property on the parent payload holding the embedded list.
    pub property: &'static str,
    /// Endpoint listing the full child collection.
    pub list_path: &'static str,
    /// Query parameter naming the parent on that endpoint.
    pub parent_param: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestSource {
    /// List endpoint; retrieve is `{list_path}/{id}`.
    pub list_path: &'static str,
    /// Whether the endpoint accepts `created[gte]` narrowing. Without it the
    /// driver cannot do incremental work and relies on page-cursor walks alone.
    pub supports_created_filter: bool,
    pub expands: &'static [ExpandRule],
}

/// A child type whose rows only ever arrive embedded in a parent payload;
/// there is no list endpoint to walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentCollection {
    pub parent: &'static str,
    /// Property on the parent payload holding the collection.
    pub property: &'static str,
    /// Generated projection on the child table naming the parent id.
    pub parent_field: &'static str,
}

/// Configuration for resources sourced from the analytical-query endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyticalSource {
    /// Table name in the provider's analytical store.
    pub query_table: &'static str,
    /// Cursor tuple ordering: timestamp column first, then tiebreakers.
    /// Per-resource configuration — never derived from data.
    pub cursor_columns: &'static [&'static str],
    /// Columns selected and mapped into the raw payload.
    pub columns: &'static [&'static str],
    /// Columns normalized as integers rather than strings.
    pub integer_columns: &'static [&'static str],
    /// Page size; a full page means more rows may exist.
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Rest(RestSource),
    Analytical(AnalyticalSource),
    ParentCollection(ParentCollection),
}

/// Everything the engine knows about one object type.
pub struct ResourceConfig {
    pub name: &'static str,
    /// Dependency-ordered backfill position; unique within the registry,
    /// parents lower than children.
    pub order: i32,
    /// Destination table for writes.
    pub table: &'static str,
    pub dependencies: &'static [Dependency],
    pub source: Source,
    /// When the predicate holds for an event payload, the remote will not
    /// mutate the object again and the payload can be applied without a
    /// refetch. `None` means always refetch.
    pub is_final_state: Option<fn(&Value) -> bool>,
}

impl fmt::Debug for ResourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceConfig")
            .field("name", &self.name)
            .field("order", &self.order)
            .field("table", &self.table)
            .field("dependencies", &self.dependencies)
            .field("source", &self.source)
            .field("is_final_state", &self.is_final_state.is_some())
            .finish()
    }
}

impl ResourceConfig {
    pub fn rest(&self) -> Option<&RestSource> {
        match &self.source {
            Source::Rest(r) => Some(r),
            _ => None,
        }
    }

    pub fn analytical(&self) -> Option<&AnalyticalSource> {
        match &self.source {
            Source::Analytical(a) => Some(a),
            _ => None,
        }
    }

    /// Whether this resource is walked directly by the page driver (as
    /// opposed to arriving through a parent payload).
    pub fn is_listable(&self) -> bool {
        !matches!(self.source, Source::ParentCollection(_))
    }

    pub fn is_final(&self, obj: &Value) -> bool {
        self.is_final_state.map(|p| p(obj)).unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Errors raised by registry construction. These are programmer errors in the
/// static resource table; construction happens once at startup and a bad
/// table should refuse to boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    DuplicateName { name: String },
    DuplicateOrder { order: i32, first: String, second: String },
    UnknownDependency { resource: String, dependency: String },
    UnknownParent { resource: String, parent: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateName { name } => write!(f, "resource '{name}' registered twice"),
            Self::DuplicateOrder { order, first, second } => write!(
                f,
                "resources '{first}' and '{second}' share backfill order {order}"
            ),
            Self::UnknownDependency { resource, dependency } => write!(
                f,
                "resource '{resource}' depends on unregistered '{dependency}'"
            ),
            Self::UnknownParent { resource, parent } => write!(
                f,
                "resource '{resource}' claims unregistered parent '{parent}'"
            ),
        }
    }
}

impl std::error::Error for RegistryError {}

#[derive(Debug)]
pub struct Registry {
    by_name: BTreeMap<&'static str, ResourceConfig>,
    /// Names sorted by `order`; the one iteration order everything uses.
    ordered: Vec<&'static str>,
}

impl Registry {
    pub fn build(resources: Vec<ResourceConfig>) -> Result<Self, RegistryError> {
        let mut by_name: BTreeMap<&'static str, ResourceConfig> = BTreeMap::new();
        for r in resources {
            if by_name.contains_key(r.name) {
                return Err(RegistryError::DuplicateName {
                    name: r.name.to_string(),
                });
            }
            by_name.insert(r.name, r);
        }

        let mut ordered: Vec<&'static str> = by_name.keys().copied().collect();
        ordered.sort_by_key(|name| by_name[name].order);
        for pair in ordered.windows(2) {
            let (a, b) = (&by_name[pair[0]], &by_name[pair[1]]);
            if a.order == b.order {
                return Err(RegistryError::DuplicateOrder {
                    order: a.order,
                    first: a.name.to_string(),
                    second: b.name.to_string(),
                });
            }
        }

        for r in by_name.values() {
            for dep in r.dependencies {
                if !by_name.contains_key(dep.resource) {
                    return Err(RegistryError::UnknownDependency {
                        resource: r.name.to_string(),
                        dependency: dep.resource.to_string(),
                    });
                }
            }
            if let Source::ParentCollection(pc) = &r.source {
                if !by_name.contains_key(pc.parent) {
                    return Err(RegistryError::UnknownParent {
                        resource: r.name.to_string(),
                        parent: pc.parent.to_string(),
                    });
                }
            }
        }

        Ok(Self { by_name, ordered })
    }

    pub fn get(&self, name: &str) -> Option<&ResourceConfig> {
        self.by_name.get(name)
    }

    /// All resources in backfill order.
    pub fn ordered(&self) -> impl Iterator<Item = &ResourceConfig> {
        self.ordered.iter().map(|name| &self.by_name[name])
    }

    /// Resources the page driver walks directly, in backfill order.
    pub fn listable(&self) -> impl Iterator<Item = &ResourceConfig> {
        self.ordered().filter(|r| r.is_listable())
    }

    /// Resolve a raw payload's `object` type tag to its resource.
    pub fn for_object_type(&self, object_type: &str) -> Option<&ResourceConfig> {
        self.by_name.get(object_type)
    }

    /// Every destination table, for the account purge path.
    pub fn tables(&self) -> Vec<&'static str> {
        self.ordered().map(|r| r.table).collect()
    }

    /// Child resources sourced from this parent's embedded collections.
    pub fn children_of<'a>(
        &'a self,
        parent: &'a str,
    ) -> impl Iterator<Item = (&'a ResourceConfig, &'a ParentCollection)> {
        self.ordered().filter_map(move |r| match &r.source {
            Source::ParentCollection(pc) if pc.parent == parent => Some((r, pc)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(name: &'static str, order: i32, table: &'static str) -> ResourceConfig {
        ResourceConfig {
            name,
            order,
            table,
            dependencies: &[],
            source: Source::Rest(RestSource {
                list_path: "/v1/things",
                supports_created_filter: true,
                expands: &[],
            }),
            is_final_state: None,
        }
    }

    #[test]
    fn duplicate_orders_are_rejected() {
        let err = Registry::build(vec![minimal("a", 1, "a_t"), minimal("b", 1, "b_t")])
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateOrder { order: 1, .. }));
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut r = minimal("child", 2, "children");
        r.dependencies = &[Dependency {
            resource: "ghost",
            field: "ghost",
        }];
        let err = Registry::build(vec![r]).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownDependency { .. }));
    }

    #[test]
    fn ordered_iteration_follows_backfill_order() {
        let reg = Registry::build(vec![
            minimal("z_last", 9, "z"),
            minimal("a_first", 1, "a"),
            minimal("m_mid", 5, "m"),
        ])
        .unwrap();
        let names: Vec<_> = reg.ordered().map(|r| r.name).collect();
        assert_eq!(names, vec!["a_first", "m_mid", "z_last"]);
    }
}
