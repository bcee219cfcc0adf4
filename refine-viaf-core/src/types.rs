//! Name type registry
//!
//! The fixed set of entity types the service reconciles against. Each type
//! carries the identifier advertised to reconciliation clients, the code the
//! registry uses to tag its records, and the CQL clause used to search it.

use serde::{Deserialize, Serialize};

use crate::error::{ReconcileError, Result};

/// Placeholder in a query template that receives the query text.
pub const TEMPLATE_SLOT: &str = "%s";

/// A kind of name the registry knows about.
#[derive(Debug, PartialEq, Eq)]
pub struct NameType {
    /// Stable external identifier (freebase-style path)
    pub id: &'static str,
    /// Human-readable label
    pub display_name: &'static str,
    /// Type tag found in registry records
    pub registry_type_code: &'static str,
    /// CQL clause with a single `%s` slot for the query text
    pub query_template: &'static str,
}

impl NameType {
    /// Substitute `text` into this type's query template.
    pub fn render(&self, text: &str) -> String {
        self.query_template.replacen(TEMPLATE_SLOT, text, 1)
    }

    pub fn type_ref(&self) -> TypeRef {
        TypeRef {
            id: self.id.to_string(),
            name: self.display_name.to_string(),
        }
    }
}

/// `{id, name}` pair as it appears in matches and service metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRef {
    pub id: String,
    pub name: String,
}

// ids are from the freebase identifier namespace; there are no better ids
// for works and expressions
static NAME_TYPES: [NameType; 5] = [
    NameType {
        id: "/people/person",
        display_name: "Person",
        registry_type_code: "Personal",
        query_template: "local.personalNames all \"%s\"",
    },
    NameType {
        id: "/organization/organization",
        display_name: "Corporate Name",
        registry_type_code: "Corporate",
        query_template: "local.corporateNames all \"%s\"",
    },
    NameType {
        id: "/location/location",
        display_name: "Geographic Name",
        registry_type_code: "Geographic",
        query_template: "local.geographicNames all \"%s\"",
    },
    NameType {
        id: "/book/book",
        display_name: "Work",
        registry_type_code: "UniformTitleWork",
        query_template: "local.uniformTitleWorks all \"%s\"",
    },
    NameType {
        id: "/book/book edition",
        display_name: "Expression",
        registry_type_code: "UniformTitleExpression",
        query_template: "local.uniformTitleExpressions all \"%s\"",
    },
];

/// All registered name types, in advertisement order.
pub fn default_types() -> &'static [NameType] {
    &NAME_TYPES
}

/// Find a name type by its external id.
pub fn lookup_by_id(id: &str) -> Result<&'static NameType> {
    NAME_TYPES
        .iter()
        .find(|nt| nt.id == id)
        .ok_or_else(|| ReconcileError::UnknownType(id.to_string()))
}

/// Find a name type by the registry's own type code.
pub fn lookup_by_registry_code(code: &str) -> Result<&'static NameType> {
    NAME_TYPES
        .iter()
        .find(|nt| nt.registry_type_code == code)
        .ok_or_else(|| ReconcileError::UnknownRegistryCode(code.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_ids_and_codes_are_unique() {
        let ids: HashSet<_> = default_types().iter().map(|nt| nt.id).collect();
        let codes: HashSet<_> = default_types()
            .iter()
            .map(|nt| nt.registry_type_code)
            .collect();
        assert_eq!(ids.len(), default_types().len());
        assert_eq!(codes.len(), default_types().len());
    }

    #[test]
    fn test_lookup_round_trips_every_type() {
        for nt in default_types() {
            assert_eq!(lookup_by_id(nt.id).unwrap(), nt);
            assert_eq!(lookup_by_registry_code(nt.registry_type_code).unwrap(), nt);
        }
    }

    #[test]
    fn test_lookup_unknown() {
        assert!(matches!(
            lookup_by_id("/film/film"),
            Err(ReconcileError::UnknownType(id)) if id == "/film/film"
        ));
        assert!(matches!(
            lookup_by_registry_code("Personal "),
            Err(ReconcileError::UnknownRegistryCode(_))
        ));
    }

    #[test]
    fn test_render_template() {
        let person = lookup_by_id("/people/person").unwrap();
        assert_eq!(
            person.render("Geoffrey Chaucer"),
            "local.personalNames all \"Geoffrey Chaucer\""
        );
        // only the template slot is substituted
        assert_eq!(
            person.render("100%s"),
            "local.personalNames all \"100%s\""
        );
    }
}
