use std::collections::HashMap;
use tracing::debug;

use crate::models::EntityKind;

/// Maps a source identifier to the entity kind that handles it
///
/// Identifiers may be bare table names (`customers`), qualified names (`inventory.customers`)
/// or full topic names (`dbserver1.inventory.customers`); only the last dot-separated segment
/// is matched, case-insensitively. The table map is fixed at construction, so routing is a
/// pure lookup.
#[derive(Debug, Clone)]
pub struct TableRouter {
    tables: HashMap<String, EntityKind>,
}

impl TableRouter {
    /// Router for the built-in table names of every entity kind
    pub fn new() -> Self {
        let tables = EntityKind::ALL
            .into_iter()
            .flat_map(|kind| kind.table_names().iter().map(move |t| (t.to_string(), kind)))
            .collect();

        Self { tables }
    }

    /// Register an extra table name for a kind, e.g. a renamed source table
    ///
    /// Qualified names register their table segment, since routing only looks at that.
    pub fn with_alias(mut self, table: &str, kind: EntityKind) -> Self {
        self.tables.insert(table_qualifier(table).to_ascii_lowercase(), kind);
        self
    }

    pub fn route(&self, source: &str) -> Option<EntityKind> {
        let table = table_qualifier(source).to_ascii_lowercase();
        let kind = self.tables.get(&table).copied();

        if kind.is_none() {
            debug!(source, table = %table, "No entity routed for source table");
        }
        kind
    }

}

impl Default for TableRouter {
    fn default() -> Self {
        Self::new()
    }
}

/// Last dot-separated segment of a source identifier
fn table_qualifier(source: &str) -> &str {
    let source = source.trim();
    source.rsplit('.').next().unwrap_or(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_topic_and_table_forms() {
        let router = TableRouter::new();

        assert_eq!(
            router.route("dbserver1.inventory.customers"),
            Some(EntityKind::Customer)
        );
        assert_eq!(router.route("inventory.orders"), Some(EntityKind::Order));
        assert_eq!(router.route("PRODUCTS"), Some(EntityKind::Product));
        assert_eq!(router.route("order_items"), Some(EntityKind::OrderItem));
    }

    #[test]
    fn test_unknown_table_is_not_found() {
        let router = TableRouter::new();
        assert_eq!(router.route("foo.bar.widgets"), None);
        assert_eq!(router.route(""), None);
        assert_eq!(router.route("customers."), None);
    }

    #[test]
    fn test_alias_registration() {
        let router = TableRouter::new().with_alias("Clients", EntityKind::Customer);
        assert_eq!(router.route("crm.public.clients"), Some(EntityKind::Customer));
        assert_eq!(router.route("clients"), Some(EntityKind::Customer));
    }

    #[test]
    fn test_qualified_alias_matches_its_table() {
        let router = TableRouter::new().with_alias("public.Clients", EntityKind::Customer);
        assert_eq!(router.route("crm.public.clients"), Some(EntityKind::Customer));
        assert_eq!(router.route("clients"), Some(EntityKind::Customer));
        assert_eq!(router.route("public"), None);
    }

    #[test]
    fn test_routing_is_deterministic() {
        let router = TableRouter::new();
        for _ in 0..3 {
            assert_eq!(router.route("shop.order_item"), Some(EntityKind::OrderItem));
        }
    }
}
