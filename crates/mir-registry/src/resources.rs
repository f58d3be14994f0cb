//! The supported object types.
//!
//! Ordering encodes the provider's reference graph: an object's parents
//! always carry a lower order, so a dependency-ordered backfill has every
//! parent row in place before a child row referencing it is written.
//!
//! Final-state predicates are declared here and nowhere else. A resource
//! without one always refetches on webhook events; a predicate that holds
//! means the payload can be applied verbatim with the event's timestamp.

use serde_json::Value;

use crate::{
    AnalyticalSource, Dependency, ExpandRule, ParentCollection, Registry, ResourceConfig,
    RestSource, Source,
};

fn status_in(obj: &Value, allowed: &[&str]) -> bool {
    obj.get("status")
        .and_then(Value::as_str)
        .is_some_and(|s| allowed.contains(&s))
}

fn subscription_is_final(obj: &Value) -> bool {
    status_in(obj, &["canceled", "incomplete_expired"])
}

fn invoice_is_final(obj: &Value) -> bool {
    status_in(obj, &["paid", "void", "uncollectible"])
}

fn charge_is_final(obj: &Value) -> bool {
    status_in(obj, &["failed"])
}

fn always_final(_obj: &Value) -> bool {
    true
}

/// Build the standard registry. Panics only on a broken static table, which
/// is a programmer error caught the first time the process boots.
pub fn standard() -> Registry {
    Registry::build(vec![
        ResourceConfig {
            name: "customer",
            order: 1,
            table: "customers",
            dependencies: &[],
            source: Source::Rest(RestSource {
                list_path: "/v1/customers",
                supports_created_filter: true,
                expands: &[],
            }),
            is_final_state: None,
        },
        ResourceConfig {
            name: "product",
            order: 2,
            table: "products",
            dependencies: &[],
            source: Source::Rest(RestSource {
                list_path: "/v1/products",
                supports_created_filter: true,
                expands: &[],
            }),
            is_final_state: None,
        },
        ResourceConfig {
            name: "plan",
            order: 3,
            table: "plans",
            dependencies: &[Dependency {
                resource: "product",
                field: "product",
            }],
            source: Source::Rest(RestSource {
                list_path: "/v1/plans",
                supports_created_filter: true,
                expands: &[],
            }),
            is_final_state: None,
        },
        ResourceConfig {
            name: "price",
            order: 4,
            table: "prices",
            dependencies: &[Dependency {
                resource: "product",
                field: "product",
            }],
            source: Source::Rest(RestSource {
                list_path: "/v1/prices",
                supports_created_filter: true,
                expands: &[],
            }),
            is_final_state: None,
        },
        ResourceConfig {
            name: "subscription",
            order: 5,
            table: "subscriptions",
            dependencies: &[Dependency {
                resource: "customer",
                field: "customer",
            }],
            source: Source::Rest(RestSource {
                list_path: "/v1/subscriptions",
                supports_created_filter: true,
                expands: &[ExpandRule {
                    property: "items",
                    list_path: "/v1/subscription_items",
                    parent_param: "subscription",
                }],
            }),
            is_final_state: Some(subscription_is_final),
        },
        ResourceConfig {
            name: "subscription_item",
            order: 6,
            table: "subscription_items",
            dependencies: &[
                Dependency {
                    resource: "subscription",
                    field: "subscription",
                },
            ],
            source: Source::ParentCollection(ParentCollection {
                parent: "subscription",
                property: "items",
                parent_field: "subscription",
            }),
            is_final_state: None,
        },
        ResourceConfig {
            name: "invoice",
            order: 7,
            table: "invoices",
            dependencies: &[
                Dependency {
                    resource: "customer",
                    field: "customer",
                },
                Dependency {
                    resource: "subscription",
                    field: "subscription",
                },
            ],
            source: Source::Rest(RestSource {
                list_path: "/v1/invoices",
                supports_created_filter: true,
                expands: &[],
            }),
            is_final_state: Some(invoice_is_final),
        },
        ResourceConfig {
            name: "charge",
            order: 8,
            table: "charges",
            dependencies: &[
                Dependency {
                    resource: "customer",
                    field: "customer",
                },
                Dependency {
                    resource: "invoice",
                    field: "invoice",
                },
            ],
            source: Source::Rest(RestSource {
                list_path: "/v1/charges",
                supports_created_filter: true,
                expands: &[],
            }),
            is_final_state: Some(charge_is_final),
        },
        ResourceConfig {
            name: "balance_transaction",
            order: 9,
            table: "balance_transactions",
            dependencies: &[],
            source: Source::Analytical(AnalyticalSource {
                query_table: "balance_transactions",
                cursor_columns: &["created", "id"],
                columns: &["id", "created", "type", "amount", "currency", "description"],
                integer_columns: &["created", "amount"],
                page_size: 500,
            }),
            // Ledger rows never mutate after being written.
            is_final_state: Some(always_final),
        },
    ])
    .expect("static resource table is valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn standard_registry_builds_and_orders_parents_first() {
        let reg = standard();
        let names: Vec<_> = reg.ordered().map(|r| r.name).collect();
        assert_eq!(
            names,
            vec![
                "customer",
                "product",
                "plan",
                "price",
                "subscription",
                "subscription_item",
                "invoice",
                "charge",
                "balance_transaction",
            ]
        );

        // Every dependency points at a lower order.
        for r in reg.ordered() {
            for dep in r.dependencies {
                let parent = reg.get(dep.resource).unwrap();
                assert!(
                    parent.order < r.order,
                    "{} (order {}) must come after its parent {} (order {})",
                    r.name,
                    r.order,
                    parent.name,
                    parent.order
                );
            }
        }
    }

    #[test]
    fn listable_excludes_parent_collection_children() {
        let reg = standard();
        let names: Vec<_> = reg.listable().map(|r| r.name).collect();
        assert!(!names.contains(&"subscription_item"));
        assert!(names.contains(&"subscription"));
        assert!(names.contains(&"balance_transaction"));
    }

    #[test]
    fn children_of_subscription_yields_items() {
        let reg = standard();
        let children: Vec<_> = reg.children_of("subscription").collect();
        assert_eq!(children.len(), 1);
        let (cfg, pc) = children[0];
        assert_eq!(cfg.name, "subscription_item");
        assert_eq!(pc.property, "items");
        assert_eq!(pc.parent_field, "subscription");
    }

    #[test]
    fn final_state_predicates_match_the_declared_sets() {
        let reg = standard();

        let sub = reg.get("subscription").unwrap();
        assert!(sub.is_final(&json!({"status": "canceled"})));
        assert!(!sub.is_final(&json!({"status": "active"})));

        let invoice = reg.get("invoice").unwrap();
        assert!(invoice.is_final(&json!({"status": "paid"})));
        assert!(invoice.is_final(&json!({"status": "void"})));
        assert!(!invoice.is_final(&json!({"status": "open"})));

        let charge = reg.get("charge").unwrap();
        assert!(charge.is_final(&json!({"status": "failed"})));
        assert!(!charge.is_final(&json!({"status": "succeeded"})));

        // Objects without a predicate always refetch.
        let customer = reg.get("customer").unwrap();
        assert!(!customer.is_final(&json!({"status": "anything"})));

        let bt = reg.get("balance_transaction").unwrap();
        assert!(bt.is_final(&json!({})));
    }

    #[test]
    fn analytical_source_carries_the_cursor_tuple_config() {
        let reg = standard();
        let bt = reg.get("balance_transaction").unwrap();
        let sigma = bt.analytical().expect("analytical source");
        assert_eq!(sigma.cursor_columns, &["created", "id"]);
        assert_eq!(sigma.page_size, 500);
        assert!(sigma.integer_columns.contains(&"amount"));
    }

    #[test]
    fn tables_cover_every_resource() {
        let reg = standard();
        let tables = reg.tables();
        assert_eq!(tables.len(), 9);
        assert!(tables.contains(&"customers"));
        assert!(tables.contains(&"balance_transactions"));
    }
}
